//! PNG decoder.
//!
//! The chunk stream is framed incrementally: the signature is checked on the
//! first bytes, `Header` is reported as soon as IHDR has arrived, and chunk
//! boundaries are tracked up to IEND. The compressed stream is then inflated
//! in one pass by the `image` crate and handed out row by row.

use super::{check_dimensions, DecodeErrorKind, DecodeEvent, Decoder, ImageInfo, RowEmitter};

const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

/// Chunk lengths above this are invalid per the PNG spec
const MAX_CHUNK_LEN: usize = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Signature,
    Chunks,
    Rows,
    Finished,
    Failed(DecodeErrorKind),
}

/// Incremental PNG decoder
pub struct PngDecoder {
    state: State,
    data: Vec<u8>,
    /// Offset of the next chunk header in `data`
    cursor: usize,
    info: Option<ImageInfo>,
    header_sent: bool,
    rows: RowEmitter,
}

impl PngDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Signature,
            data: Vec::new(),
            cursor: 0,
            info: None,
            header_sent: false,
            rows: RowEmitter::default(),
        }
    }

    fn fail(&mut self, kind: DecodeErrorKind, reason: &str) -> DecodeEvent {
        tracing::warn!("PNG decode failed: {}", reason);
        self.state = State::Failed(kind);
        self.data = Vec::new();
        self.rows.clear();
        DecodeEvent::Error(kind)
    }

    fn check_signature(&mut self) -> Option<DecodeEvent> {
        let n = self.data.len().min(PNG_SIGNATURE.len());
        if self.data[..n] != PNG_SIGNATURE[..n] {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "bad signature"));
        }
        if n < PNG_SIGNATURE.len() {
            return Some(DecodeEvent::NeedMoreInput);
        }
        self.cursor = PNG_SIGNATURE.len();
        self.state = State::Chunks;
        None
    }

    /// Walk complete chunks; returns an event when one is due
    fn walk_chunks(&mut self) -> Option<DecodeEvent> {
        if self.data.len() < self.cursor + 8 {
            return Some(DecodeEvent::NeedMoreInput);
        }

        let at = self.cursor;
        let len = u32::from_be_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ]) as usize;
        let kind = [
            self.data[at + 4],
            self.data[at + 5],
            self.data[at + 6],
            self.data[at + 7],
        ];

        if len > MAX_CHUNK_LEN || !kind.iter().all(u8::is_ascii_alphabetic) {
            return Some(self.fail(DecodeErrorKind::Corrupt, "invalid chunk header"));
        }
        if self.info.is_none() && &kind != b"IHDR" {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "first chunk is not IHDR"));
        }

        let chunk_end = at + 8 + len + 4;
        if self.data.len() < chunk_end {
            return Some(DecodeEvent::NeedMoreInput);
        }

        match &kind {
            b"IHDR" => {
                if self.info.is_some() || len != 13 {
                    return Some(self.fail(DecodeErrorKind::MalformedHeader, "bad IHDR"));
                }
                let body = &self.data[at + 8..at + 8 + 13];
                let width = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let height = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                let color_type = body[9];
                if !check_dimensions(width, height) {
                    return Some(self.fail(
                        DecodeErrorKind::MalformedHeader,
                        &format!("dimensions {}x{} out of range", width, height),
                    ));
                }
                self.info = Some(ImageInfo {
                    width,
                    height,
                    has_alpha: matches!(color_type, 4 | 6),
                });
            }
            b"tRNS" => {
                if let Some(info) = self.info.as_mut() {
                    info.has_alpha = true;
                }
            }
            b"IEND" => {
                self.cursor = chunk_end;
                return self.decode();
            }
            _ => {}
        }

        self.cursor = chunk_end;

        if !self.header_sent {
            if let Some(info) = self.info {
                self.header_sent = true;
                return Some(DecodeEvent::Header(info));
            }
        }
        None
    }

    fn decode(&mut self) -> Option<DecodeEvent> {
        let Some(info) = self.info else {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "missing IHDR"));
        };

        let data = std::mem::take(&mut self.data);
        let decoded = image::load_from_memory_with_format(&data[..self.cursor], image::ImageFormat::Png);
        drop(data);

        match decoded {
            Ok(img) => {
                let rgba = img.into_rgba8();
                if rgba.width() != info.width || rgba.height() != info.height {
                    return Some(self.fail(DecodeErrorKind::Corrupt, "size differs from IHDR"));
                }
                tracing::debug!("PNG decoded: {}x{}", info.width, info.height);
                self.rows.load(rgba);
                self.state = State::Rows;
                None
            }
            Err(e) => Some(self.fail(DecodeErrorKind::Corrupt, &e.to_string())),
        }
    }
}

impl Default for PngDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PngDecoder {
    fn feed(&mut self, input: &[u8]) -> DecodeEvent {
        match self.state {
            State::Failed(kind) => return DecodeEvent::Error(kind),
            State::Finished => return DecodeEvent::Done,
            State::Rows => {}
            State::Signature | State::Chunks => self.data.extend_from_slice(input),
        }

        loop {
            let event = match self.state {
                State::Signature => self.check_signature(),
                State::Chunks => self.walk_chunks(),
                State::Rows => {
                    if !self.header_sent {
                        self.header_sent = true;
                        self.info.map(DecodeEvent::Header)
                    } else {
                        let event = self.rows.next_event();
                        if event == DecodeEvent::Done || !self.rows.is_loaded() {
                            self.state = State::Finished;
                        }
                        Some(event)
                    }
                }
                State::Finished => Some(DecodeEvent::Done),
                State::Failed(kind) => Some(DecodeEvent::Error(kind)),
            };
            if let Some(event) = event {
                return event;
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode_png(img: &RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn drain(decoder: &mut PngDecoder, input: &[u8], events: &mut Vec<DecodeEvent>) -> bool {
        let mut event = decoder.feed(input);
        loop {
            match event {
                DecodeEvent::NeedMoreInput => return false,
                DecodeEvent::Done | DecodeEvent::Error(_) => {
                    events.push(event);
                    return true;
                }
                other => events.push(other),
            }
            event = decoder.feed(&[]);
        }
    }

    #[test]
    fn test_decodes_rows_in_order() {
        let img = RgbaImage::from_fn(4, 3, |x, y| Rgba([x as u8 * 10, y as u8 * 20, 7, 200]));
        let data = encode_png(&img);

        let mut decoder = PngDecoder::new();
        let mut events = Vec::new();
        for chunk in data.chunks(9) {
            if drain(&mut decoder, chunk, &mut events) {
                break;
            }
        }

        assert_eq!(
            events[0],
            DecodeEvent::Header(ImageInfo {
                width: 4,
                height: 3,
                has_alpha: true
            })
        );
        assert_eq!(events.last(), Some(&DecodeEvent::Done));
        let rows: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DecodeEvent::Row(y, row) => Some((*y, row.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(rows.len(), 3);
        for (y, row) in rows {
            for (x, px) in row.iter().enumerate() {
                assert_eq!(*px, *img.get_pixel(x as u32, y));
            }
        }
    }

    #[test]
    fn test_header_before_iend() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255]));
        let data = encode_png(&img);

        let mut decoder = PngDecoder::new();
        // signature + IHDR chunk
        let event = decoder.feed(&data[..8 + 25]);
        assert!(matches!(event, DecodeEvent::Header(ImageInfo { width: 2, height: 2, .. })));
        assert_eq!(decoder.feed(&[]), DecodeEvent::NeedMoreInput);
    }

    #[test]
    fn test_bad_signature_fails_early() {
        let mut decoder = PngDecoder::new();
        assert_eq!(
            decoder.feed(b"\x89PNX"),
            DecodeEvent::Error(DecodeErrorKind::MalformedHeader)
        );
    }

    #[test]
    fn test_missing_iend_needs_more_input() {
        let img = RgbaImage::from_pixel(3, 3, Rgba([9, 9, 9, 255]));
        let data = encode_png(&img);
        let cut = &data[..data.len() - 12];

        let mut decoder = PngDecoder::new();
        let mut events = Vec::new();
        assert!(!drain(&mut decoder, cut, &mut events));
        assert!(!events.iter().any(|e| matches!(e, DecodeEvent::Row(..))));
    }
}
