//! Streaming BMP decoder.
//!
//! Parses the file header, the DIB header (core, info, V4 and V5 variants),
//! optional bit masks and palette, then emits one row per scanline as soon
//! as that scanline's bytes have arrived. At most one row of pixel data is
//! buffered beyond whatever the last chunk carried.
//!
//! Supported: 1/4/8-bit palettes, 16-bit (5-5-5 or bit fields), 24-bit and
//! 32-bit (plain or bit fields, alpha mask honoured). Both bottom-up and
//! top-down row order. RLE and embedded JPEG/PNG are rejected.

use super::{check_dimensions, DecodeErrorKind, DecodeEvent, Decoder, ImageInfo};
use image::Rgba;

const FILE_HEADER_LEN: usize = 14;

const BI_RGB: u32 = 0;
const BI_BITFIELDS: u32 = 3;
const BI_ALPHABITFIELDS: u32 = 6;

/// Default masks for 16-bit BI_RGB (5-5-5)
const MASKS_555: [u32; 4] = [0x7C00, 0x03E0, 0x001F, 0];

/// Parsed DIB header
#[derive(Debug, Clone)]
struct BmpHeader {
    header_size: u32,
    width: u32,
    height: u32,
    top_down: bool,
    bpp: u16,
    compression: u32,
    colors_used: u32,
    /// Red, green, blue, alpha
    masks: [u32; 4],
}

impl BmpHeader {
    /// Bytes per scanline, padded to a multiple of 4
    fn row_size(&self) -> usize {
        ((self.bpp as usize * self.width as usize + 31) / 32) * 4
    }

    fn is_core(&self) -> bool {
        self.header_size == 12
    }

    fn palette_entry_size(&self) -> usize {
        if self.is_core() { 3 } else { 4 }
    }

    fn palette_len(&self) -> usize {
        if self.bpp > 8 {
            return 0;
        }
        let max = 1usize << self.bpp;
        match self.colors_used as usize {
            0 => max,
            n => n.min(max),
        }
    }

    /// Masks that follow a plain info header instead of living inside it
    fn trailing_mask_len(&self) -> usize {
        if self.header_size != 40 {
            return 0;
        }
        match self.compression {
            BI_BITFIELDS => 12,
            BI_ALPHABITFIELDS => 16,
            _ => 0,
        }
    }

    fn has_alpha(&self) -> bool {
        matches!(self.bpp, 16 | 32) && self.masks[3] != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FileHeader,
    DibHeader,
    Tables,
    /// Discarding bytes up to the pixel data offset
    Skip(usize),
    Pixels,
    Finished,
    Failed(DecodeErrorKind),
}

/// Incremental BMP decoder
pub struct BmpDecoder {
    state: State,
    pending: Vec<u8>,
    head: usize,
    /// Absolute file offset of `pending[head]`
    offset: usize,
    data_offset: usize,
    header: Option<BmpHeader>,
    palette: Vec<Rgba<u8>>,
    rows_done: u32,
}

impl BmpDecoder {
    pub fn new() -> Self {
        Self {
            state: State::FileHeader,
            pending: Vec::new(),
            head: 0,
            offset: 0,
            data_offset: 0,
            header: None,
            palette: Vec::new(),
            rows_done: 0,
        }
    }

    fn available(&self) -> usize {
        self.pending.len() - self.head
    }

    fn consume(&mut self, n: usize) {
        self.head += n;
        self.offset += n;
        if self.head == self.pending.len() {
            self.pending.clear();
            self.head = 0;
        } else if self.head > 4096 && self.head * 2 > self.pending.len() {
            self.pending.drain(..self.head);
            self.head = 0;
        }
    }

    fn fail(&mut self, kind: DecodeErrorKind, reason: &str) -> DecodeEvent {
        tracing::warn!("BMP decode failed at offset {}: {}", self.offset, reason);
        self.state = State::Failed(kind);
        self.pending.clear();
        self.head = 0;
        DecodeEvent::Error(kind)
    }

    fn parse_file_header(&mut self) -> Option<DecodeEvent> {
        if self.available() < FILE_HEADER_LEN {
            return Some(DecodeEvent::NeedMoreInput);
        }
        let bytes = &self.pending[self.head..self.head + FILE_HEADER_LEN];
        if &bytes[0..2] != b"BM" {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "missing BM signature"));
        }
        self.data_offset = le_u32(bytes, 10) as usize;
        self.consume(FILE_HEADER_LEN);
        self.state = State::DibHeader;
        None
    }

    fn parse_dib_header(&mut self) -> Option<DecodeEvent> {
        if self.available() < 4 {
            return Some(DecodeEvent::NeedMoreInput);
        }
        let size = le_u32(&self.pending[self.head..], 0) as usize;
        if !matches!(size, 12 | 40 | 52 | 56 | 64 | 108 | 124) {
            return Some(self.fail(
                DecodeErrorKind::MalformedHeader,
                &format!("unsupported DIB header size {}", size),
            ));
        }
        if self.available() < size {
            return Some(DecodeEvent::NeedMoreInput);
        }

        let parsed = parse_dib(&self.pending[self.head..self.head + size]);
        let header = match parsed {
            Ok(header) => header,
            Err(reason) => return Some(self.fail(DecodeErrorKind::MalformedHeader, &reason)),
        };

        self.consume(size);

        let info = ImageInfo {
            width: header.width,
            height: header.height,
            has_alpha: header.has_alpha(),
        };
        tracing::debug!(
            "BMP header: {}x{} {}bpp compression={} {}",
            header.width,
            header.height,
            header.bpp,
            header.compression,
            if header.top_down { "top-down" } else { "bottom-up" }
        );

        self.header = Some(header);
        self.state = State::Tables;
        Some(DecodeEvent::Header(info))
    }

    fn parse_tables(&mut self) -> Option<DecodeEvent> {
        let Some(header) = self.header.as_ref() else {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "tables before header"));
        };
        let mask_len = header.trailing_mask_len();
        let entry_size = header.palette_entry_size();
        let palette_len = header.palette_len();
        let needs_palette = header.bpp <= 8;

        if self.data_offset < self.offset {
            return Some(self.fail(
                DecodeErrorKind::MalformedHeader,
                "pixel data offset points into the header",
            ));
        }
        let gap = self.data_offset - self.offset;
        if mask_len > gap {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "bit masks missing"));
        }
        let palette_bytes = (palette_len * entry_size).min(gap - mask_len);
        let table_len = mask_len + palette_bytes;

        if self.available() < table_len {
            return Some(DecodeEvent::NeedMoreInput);
        }

        let tables = &self.pending[self.head..self.head + table_len];
        let masks = (mask_len > 0).then(|| {
            [
                le_u32(tables, 0),
                le_u32(tables, 4),
                le_u32(tables, 8),
                if mask_len == 16 { le_u32(tables, 12) } else { 0 },
            ]
        });
        self.palette = tables[mask_len..]
            .chunks_exact(entry_size)
            .map(|e| Rgba([e[2], e[1], e[0], 0xFF]))
            .collect();

        if let Some(masks) = masks {
            if let Err(reason) = check_masks(&masks) {
                return Some(self.fail(DecodeErrorKind::MalformedHeader, &reason));
            }
            if let Some(header) = self.header.as_mut() {
                header.masks = masks;
            }
        }

        if needs_palette && self.palette.is_empty() {
            return Some(self.fail(DecodeErrorKind::MalformedHeader, "palette missing"));
        }

        self.consume(table_len);
        self.state = State::Skip(gap - table_len);
        None
    }

    fn skip_gap(&mut self, remaining: usize) -> Option<DecodeEvent> {
        let n = remaining.min(self.available());
        self.consume(n);
        if n < remaining {
            self.state = State::Skip(remaining - n);
            return Some(DecodeEvent::NeedMoreInput);
        }
        self.state = State::Pixels;
        None
    }

    fn next_row(&mut self) -> DecodeEvent {
        let Some(header) = self.header.as_ref() else {
            return self.fail(DecodeErrorKind::MalformedHeader, "pixels before header");
        };

        if self.rows_done >= header.height {
            self.state = State::Finished;
            self.pending.clear();
            self.head = 0;
            return DecodeEvent::Done;
        }

        let row_size = header.row_size();
        if self.available() < row_size {
            return DecodeEvent::NeedMoreInput;
        }

        let row = decode_row(
            &self.pending[self.head..self.head + row_size],
            header,
            &self.palette,
        );
        let y = if header.top_down {
            self.rows_done
        } else {
            header.height - 1 - self.rows_done
        };

        self.rows_done += 1;
        self.consume(row_size);
        DecodeEvent::Row(y, row)
    }
}

impl Default for BmpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BmpDecoder {
    fn feed(&mut self, input: &[u8]) -> DecodeEvent {
        match self.state {
            State::Failed(kind) => return DecodeEvent::Error(kind),
            State::Finished => return DecodeEvent::Done,
            _ => {}
        }

        self.pending.extend_from_slice(input);

        loop {
            let event = match self.state {
                State::FileHeader => self.parse_file_header(),
                State::DibHeader => self.parse_dib_header(),
                State::Tables => self.parse_tables(),
                State::Skip(remaining) => self.skip_gap(remaining),
                State::Pixels => Some(self.next_row()),
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

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn parse_dib(bytes: &[u8]) -> Result<BmpHeader, String> {
    let header_size = bytes.len() as u32;

    let (width, raw_height, planes, bpp) = if header_size == 12 {
        (
            le_u16(bytes, 4) as i32,
            le_u16(bytes, 6) as i32,
            le_u16(bytes, 8),
            le_u16(bytes, 10),
        )
    } else {
        (
            le_u32(bytes, 4) as i32,
            le_u32(bytes, 8) as i32,
            le_u16(bytes, 12),
            le_u16(bytes, 14),
        )
    };

    let compression = if header_size >= 40 { le_u32(bytes, 16) } else { BI_RGB };
    let colors_used = if header_size >= 40 { le_u32(bytes, 32) } else { 0 };

    if planes != 1 {
        return Err(format!("invalid plane count {}", planes));
    }
    if width <= 0 || raw_height == 0 || raw_height == i32::MIN {
        return Err(format!("invalid dimensions {}x{}", width, raw_height));
    }
    let height = raw_height.unsigned_abs();
    if !check_dimensions(width as u32, height) {
        return Err(format!("dimensions {}x{} out of range", width, height));
    }

    match (bpp, compression) {
        (1 | 4 | 8 | 24, BI_RGB) => {}
        (16 | 32, BI_RGB | BI_BITFIELDS | BI_ALPHABITFIELDS) => {}
        _ => {
            return Err(format!(
                "unsupported bit depth {} with compression {}",
                bpp, compression
            ));
        }
    }

    let mut masks = match bpp {
        16 => MASKS_555,
        32 => [0x00FF_0000, 0x0000_FF00, 0x0000_00FF, 0],
        _ => [0; 4],
    };
    if compression != BI_RGB && header_size >= 52 {
        masks[0] = le_u32(bytes, 40);
        masks[1] = le_u32(bytes, 44);
        masks[2] = le_u32(bytes, 48);
    }
    if compression != BI_RGB && header_size >= 56 {
        masks[3] = le_u32(bytes, 52);
    }
    check_masks(&masks)?;

    Ok(BmpHeader {
        header_size,
        width: width as u32,
        height,
        top_down: raw_height < 0,
        bpp,
        compression,
        colors_used,
        masks,
    })
}

/// Channel masks must be a single run of set bits
fn check_masks(masks: &[u32; 4]) -> Result<(), String> {
    for &mask in masks {
        if mask == 0 {
            continue;
        }
        let span = 32 - mask.leading_zeros() - mask.trailing_zeros();
        if mask.count_ones() != span {
            return Err(format!("non-contiguous channel mask {:#010x}", mask));
        }
    }
    Ok(())
}

/// Extract a channel through its mask and scale it to 8 bits
fn channel(pixel: u32, mask: u32, missing: u8) -> u8 {
    if mask == 0 {
        return missing;
    }
    let shift = mask.trailing_zeros();
    let bits = (mask >> shift).count_ones();
    let value = (pixel & mask) >> shift;
    if bits >= 8 {
        (value >> (bits - 8)) as u8
    } else {
        let max = (1u32 << bits) - 1;
        ((value * 255 + max / 2) / max) as u8
    }
}

fn decode_row(bytes: &[u8], header: &BmpHeader, palette: &[Rgba<u8>]) -> Vec<Rgba<u8>> {
    let width = header.width as usize;
    let mut row = Vec::with_capacity(width);
    let black = Rgba([0, 0, 0, 0xFF]);

    match header.bpp {
        1 | 4 | 8 => {
            let bpp = header.bpp as usize;
            let per_byte = 8 / bpp;
            let mask = (1u8 << bpp) - 1;
            for x in 0..width {
                let byte = bytes[x / per_byte];
                let shift = 8 - bpp * (x % per_byte + 1);
                let index = ((byte >> shift) & mask) as usize;
                row.push(palette.get(index).copied().unwrap_or(black));
            }
        }
        16 => {
            let [rm, gm, bm, am] = header.masks;
            for px in bytes.chunks_exact(2).take(width) {
                let v = u16::from_le_bytes([px[0], px[1]]) as u32;
                row.push(Rgba([
                    channel(v, rm, 0),
                    channel(v, gm, 0),
                    channel(v, bm, 0),
                    channel(v, am, 0xFF),
                ]));
            }
        }
        24 => {
            for px in bytes.chunks_exact(3).take(width) {
                row.push(Rgba([px[2], px[1], px[0], 0xFF]));
            }
        }
        _ => {
            let [rm, gm, bm, am] = header.masks;
            for px in bytes.chunks_exact(4).take(width) {
                let v = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                row.push(Rgba([
                    channel(v, rm, 0),
                    channel(v, gm, 0),
                    channel(v, bm, 0),
                    channel(v, am, 0xFF),
                ]));
            }
        }
    }

    row
}
