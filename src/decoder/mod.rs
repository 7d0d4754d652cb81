//! Incremental image decoders.
//!
//! Each supported format has its own decoder behind the [`Decoder`] trait.
//! Decoders are fed arbitrary slices of the file as they are read from
//! storage and report progress through [`DecodeEvent`]s:
//!
//! - `feed(chunk)` appends the chunk and returns the next event
//! - `feed(&[])` drains further events without adding input
//!
//! Decoders only produce source pixels. Resizing, pixel type conversion and
//! transparency handling happen afterwards on each row (see `transform`).

#[cfg(feature = "bmp")]
pub mod bmp;
#[cfg(feature = "jpeg")]
pub mod jpeg;
#[cfg(feature = "png")]
pub mod png;

use image::Rgba;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Largest width or height any decoder accepts
pub const MAX_DIMENSION: u32 = 8192;

/// Format that the image file is encoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageFormat {
    Bmp,
    Jpeg,
    Png,
}

/// Registered format names. Lookups are case-insensitive; "JPG" is an
/// alias of "JPEG".
static IMAGE_FORMATS: Lazy<HashMap<&'static str, ImageFormat>> = Lazy::new(|| {
    let mut formats = HashMap::new();
    formats.insert("BMP", ImageFormat::Bmp);
    formats.insert("JPEG", ImageFormat::Jpeg);
    formats.insert("PNG", ImageFormat::Png);
    formats.insert("JPG", ImageFormat::Jpeg);
    formats
});

/// Build-time capability of a format: which cargo feature provides its
/// decoder and whether it was compiled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCapability {
    pub format: ImageFormat,
    pub feature: &'static str,
    pub enabled: bool,
}

/// Capability table consulted by configuration validation
pub const FORMAT_CAPABILITIES: [FormatCapability; 3] = [
    FormatCapability {
        format: ImageFormat::Bmp,
        feature: "bmp",
        enabled: cfg!(feature = "bmp"),
    },
    FormatCapability {
        format: ImageFormat::Jpeg,
        feature: "jpeg",
        enabled: cfg!(feature = "jpeg"),
    },
    FormatCapability {
        format: ImageFormat::Png,
        feature: "png",
        enabled: cfg!(feature = "png"),
    },
];

impl ImageFormat {
    /// Look up a format by name
    pub fn lookup(name: &str) -> Option<Self> {
        IMAGE_FORMATS
            .get(name.trim().to_ascii_uppercase().as_str())
            .copied()
    }

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Bmp => "BMP",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
        }
    }

    /// Build-time capability entry for this format
    pub fn capability(&self) -> FormatCapability {
        FORMAT_CAPABILITIES
            .iter()
            .copied()
            .find(|c| c.format == *self)
            .unwrap_or(FormatCapability {
                format: *self,
                feature: "",
                enabled: false,
            })
    }

    /// Whether a decoder for this format was compiled in
    pub fn is_supported(&self) -> bool {
        self.capability().enabled
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| {
            format!(
                "Unknown image format '{}', expected one of BMP, JPEG, JPG, PNG",
                s
            )
        })
    }
}

impl TryFrom<String> for ImageFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageFormat> for String {
    fn from(format: ImageFormat) -> Self {
        format.name().to_string()
    }
}

/// Source image properties, known once the header has been parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// Whether the source carries meaningful alpha
    pub has_alpha: bool,
}

/// Why a decoder gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The header is invalid or describes something unsupported
    MalformedHeader,
    /// The pixel data could not be decoded
    Corrupt,
}

/// Progress report from a decoder
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// Everything fed so far has been consumed
    NeedMoreInput,
    /// Image dimensions are known; emitted once, before any row
    Header(ImageInfo),
    /// One decoded source row (zero-based `y`), `width` pixels long
    Row(u32, Vec<Rgba<u8>>),
    /// All rows have been emitted
    Done,
    /// Decoding failed; further feeding is pointless
    Error(DecodeErrorKind),
}

/// A format-specific, incrementally fed decoder
pub trait Decoder: Send {
    /// Append `input` and report the next event
    fn feed(&mut self, input: &[u8]) -> DecodeEvent;

    /// Forget all state and start over with a new file
    fn reset(&mut self);
}

/// Create the decoder for `format`, or `None` if it was not compiled in
pub fn create_decoder(format: ImageFormat) -> Option<Box<dyn Decoder>> {
    match format {
        #[cfg(feature = "bmp")]
        ImageFormat::Bmp => Some(Box::new(bmp::BmpDecoder::new())),
        #[cfg(feature = "jpeg")]
        ImageFormat::Jpeg => Some(Box::new(jpeg::JpegDecoder::new())),
        #[cfg(feature = "png")]
        ImageFormat::Png => Some(Box::new(png::PngDecoder::new())),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Hands out the rows of a fully decoded image one event at a time.
///
/// Used by the formats whose bitstream is framed incrementally but decoded
/// in one go once the end marker has arrived.
#[cfg(any(feature = "jpeg", feature = "png"))]
#[derive(Debug, Default)]
pub(crate) struct RowEmitter {
    image: Option<image::RgbaImage>,
    next_row: u32,
}

#[cfg(any(feature = "jpeg", feature = "png"))]
impl RowEmitter {
    pub(crate) fn load(&mut self, image: image::RgbaImage) {
        self.image = Some(image);
        self.next_row = 0;
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// Next row, or `Done` after the last one
    pub(crate) fn next_event(&mut self) -> DecodeEvent {
        let Some(image) = &self.image else {
            return DecodeEvent::NeedMoreInput;
        };

        if self.next_row >= image.height() {
            self.image = None;
            return DecodeEvent::Done;
        }

        let y = self.next_row;
        let row = (0..image.width()).map(|x| *image.get_pixel(x, y)).collect();
        self.next_row += 1;
        DecodeEvent::Row(y, row)
    }

    pub(crate) fn clear(&mut self) {
        self.image = None;
        self.next_row = 0;
    }
}

/// Check header dimensions against the supported range
pub(crate) fn check_dimensions(width: u32, height: u32) -> bool {
    width > 0 && height > 0 && width <= MAX_DIMENSION && height <= MAX_DIMENSION
}
