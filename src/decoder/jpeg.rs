//! JPEG decoder.
//!
//! Marker segments are framed incrementally: SOI is checked on the first
//! bytes, `Header` is reported from the first SOF segment, and entropy-coded
//! scan data is skipped (honouring byte stuffing and restart markers) until
//! EOI. The complete stream is then decoded by the `image` crate and handed
//! out row by row.

use super::{check_dimensions, DecodeErrorKind, DecodeEvent, Decoder, ImageInfo, RowEmitter};

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOS: u8 = 0xDA;
const MARKER_TEM: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Soi,
    Segments,
    /// Inside entropy-coded data following SOS
    Scan,
    Rows,
    Finished,
    Failed(DecodeErrorKind),
}

fn is_sof(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

fn is_rst(marker: u8) -> bool {
    matches!(marker, 0xD0..=0xD7)
}

/// Incremental JPEG decoder
pub struct JpegDecoder {
    state: State,
    data: Vec<u8>,
    cursor: usize,
    info: Option<ImageInfo>,
    rows: RowEmitter,
}

impl JpegDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Soi,
            data: Vec::new(),
            cursor: 0,
            info: None,
            rows: RowEmitter::default(),
        }
    }

    fn fail(&mut self, kind: DecodeErrorKind, reason: &str) -> DecodeEvent {
        tracing::warn!("JPEG decode failed at offset {}: {}", self.cursor, reason);
        self.state = State::Failed(kind);
        self.data = Vec::new();
        self.rows.clear();
        DecodeEvent::Error(kind)
    }

    fn check_soi(&mut self) -> Option<DecodeEvent> {
        let n = self.data.len().min(2);
        if self.data[..n] != [0xFF, MARKER_SOI][..n] {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "missing SOI marker"));
        }
        if n < 2 {
            return Some(DecodeEvent::NeedMoreInput);
        }
        self.cursor = 2;
        self.state = State::Segments;
        None
    }

    fn next_segment(&mut self) -> Option<DecodeEvent> {
        // Skip fill bytes before the marker code
        let mut at = self.cursor;
        while at + 1 < self.data.len() && self.data[at] == 0xFF && self.data[at + 1] == 0xFF {
            at += 1;
        }
        self.cursor = at;

        if self.data.len() < at + 2 {
            return Some(DecodeEvent::NeedMoreInput);
        }
        if self.data[at] != 0xFF {
            return Some(self.fail(DecodeErrorKind::Corrupt, "expected a marker"));
        }

        let marker = self.data[at + 1];
        match marker {
            MARKER_EOI => {
                self.cursor = at + 2;
                return self.decode();
            }
            MARKER_SOI => {
                return Some(self.fail(DecodeErrorKind::Corrupt, "unexpected SOI"));
            }
            m if is_rst(m) || m == MARKER_TEM => {
                self.cursor = at + 2;
                return None;
            }
            _ => {}
        }

        if self.data.len() < at + 4 {
            return Some(DecodeEvent::NeedMoreInput);
        }
        let len = u16::from_be_bytes([self.data[at + 2], self.data[at + 3]]) as usize;
        if len < 2 {
            return Some(self.fail(DecodeErrorKind::Corrupt, "segment length below 2"));
        }
        let end = at + 2 + len;
        if self.data.len() < end {
            return Some(DecodeEvent::NeedMoreInput);
        }

        self.cursor = end;

        if is_sof(marker) && self.info.is_none() {
            if len < 8 {
                return Some(self.fail(DecodeErrorKind::MalformedHeader, "short SOF segment"));
            }
            let body = &self.data[at + 4..end];
            let height = u16::from_be_bytes([body[1], body[2]]) as u32;
            let width = u16::from_be_bytes([body[3], body[4]]) as u32;
            if !check_dimensions(width, height) {
                return Some(self.fail(
                    DecodeErrorKind::MalformedHeader,
                    &format!("dimensions {}x{} out of range", width, height),
                ));
            }
            let info = ImageInfo {
                width,
                height,
                has_alpha: false,
            };
            self.info = Some(info);
            tracing::debug!("JPEG frame: {}x{} (SOF{:X})", width, height, marker & 0x0F);
            return Some(DecodeEvent::Header(info));
        }

        if marker == MARKER_SOS {
            if self.info.is_none() {
                return Some(self.fail(DecodeErrorKind::MalformedHeader, "scan before frame header"));
            }
            self.state = State::Scan;
        }
        None
    }

    /// Skip entropy-coded bytes up to the next real marker
    fn skip_scan(&mut self) -> Option<DecodeEvent> {
        let mut at = self.cursor;
        while at + 1 < self.data.len() {
            if self.data[at] != 0xFF {
                at += 1;
                continue;
            }
            let next = self.data[at + 1];
            if next == 0x00 || is_rst(next) {
                at += 2;
            } else if next == 0xFF {
                at += 1;
            } else {
                self.cursor = at;
                self.state = State::Segments;
                return None;
            }
        }
        self.cursor = at;
        Some(DecodeEvent::NeedMoreInput)
    }

    fn decode(&mut self) -> Option<DecodeEvent> {
        let Some(info) = self.info else {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "no frame header"));
        };

        let data = std::mem::take(&mut self.data);
        let decoded =
            image::load_from_memory_with_format(&data[..self.cursor], image::ImageFormat::Jpeg);
        drop(data);

        match decoded {
            Ok(img) => {
                let rgba = img.into_rgba8();
                if rgba.width() != info.width || rgba.height() != info.height {
                    return Some(self.fail(DecodeErrorKind::Corrupt, "size differs from SOF"));
                }
                self.rows.load(rgba);
                self.state = State::Rows;
                None
            }
            Err(e) => Some(self.fail(DecodeErrorKind::Corrupt, &e.to_string())),
        }
    }
}

impl Default for JpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JpegDecoder {
    fn feed(&mut self, input: &[u8]) -> DecodeEvent {
        match self.state {
            State::Failed(kind) => return DecodeEvent::Error(kind),
            State::Finished => return DecodeEvent::Done,
            State::Rows => {}
            State::Soi | State::Segments | State::Scan => self.data.extend_from_slice(input),
        }

        loop {
            let event = match self.state {
                State::Soi => self.check_soi(),
                State::Segments => self.next_segment(),
                State::Scan => self.skip_scan(),
                State::Rows => {
                    let event = self.rows.next_event();
                    if event == DecodeEvent::Done {
                        self.state = State::Finished;
                    }
                    Some(event)
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
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn encode_jpeg(img: &RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn decode_all(data: &[u8], chunk: usize) -> Vec<DecodeEvent> {
        let mut decoder = JpegDecoder::new();
        let mut events = Vec::new();
        for piece in data.chunks(chunk) {
            let mut event = decoder.feed(piece);
            loop {
                match event {
                    DecodeEvent::NeedMoreInput => break,
                    DecodeEvent::Done | DecodeEvent::Error(_) => {
                        events.push(event);
                        return events;
                    }
                    other => events.push(other),
                }
                event = decoder.feed(&[]);
            }
        }
        events
    }

    #[test]
    fn test_decodes_solid_image() {
        let img = RgbImage::from_pixel(16, 8, Rgb([200, 40, 40]));
        let data = encode_jpeg(&img);
        let events = decode_all(&data, 13);

        assert_eq!(
            events[0],
            DecodeEvent::Header(ImageInfo {
                width: 16,
                height: 8,
                has_alpha: false
            })
        );
        assert_eq!(events.last(), Some(&DecodeEvent::Done));

        let rows: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DecodeEvent::Row(_, row) => Some(row),
                _ => None,
            })
            .collect();
        assert_eq!(rows.len(), 8);
        // Lossy, so only check the colour is close
        let px = rows[4][8];
        assert!((px[0] as i32 - 200).abs() < 12);
        assert!((px[1] as i32 - 40).abs() < 12);
        assert_eq!(px[3], 255);
    }

    #[test]
    fn test_missing_eoi_needs_more_input() {
        let img = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let data = encode_jpeg(&img);
        let events = decode_all(&data[..data.len() - 2], 32);

        assert!(matches!(events[0], DecodeEvent::Header(_)));
        assert!(!events.iter().any(|e| matches!(e, DecodeEvent::Done)));
    }

    #[test]
    fn test_not_a_jpeg() {
        let mut decoder = JpegDecoder::new();
        assert_eq!(
            decoder.feed(b"BM\x00\x00"),
            DecodeEvent::Error(DecodeErrorKind::MalformedHeader)
        );
    }
}
