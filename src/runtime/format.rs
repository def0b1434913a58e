//! Port formats and buffer sizing
//!
//! The core treats a format as opaque apart from the compatibility check done
//! when two ports are tunnelled together.

use std::fmt;

/// FourCC encoding tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Encoding(u32);

impl Encoding {
    /// Matches any encoding
    pub const OPAQUE: Self = Self(0);
    pub const I420: Self = Self::fourcc(b"I420");
    pub const RGB24: Self = Self::fourcc(b"RGB3");
    pub const BGR24: Self = Self::fourcc(b"BGR3");
    pub const YUYV: Self = Self::fourcc(b"YUYV");
    pub const H264: Self = Self::fourcc(b"H264");
    pub const MJPEG: Self = Self::fourcc(b"MJPG");
    pub const JPEG: Self = Self::fourcc(b"JPEG");

    pub const fn fourcc(code: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*code))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_opaque(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_opaque() {
            return write!(f, "OPAQUE");
        }
        let bytes = self.0.to_le_bytes();
        match std::str::from_utf8(&bytes) {
            Ok(code) => write!(f, "{}", code),
            Err(_) => write!(f, "{:#010x}", self.0),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> Option<f64> {
        (self.den != 0).then(|| self.num as f64 / self.den as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Negotiated format of a port
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Format {
    pub encoding: Encoding,
    /// Sub-format for encodings that need one (e.g. the pixel layout of an opaque stream)
    pub variant: Option<Encoding>,
    pub width: u32,
    pub height: u32,
    pub crop: Rect,
    pub framerate: Rational,
    pub bitrate: u32,
}

impl Format {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            ..Self::default()
        }
    }

    /// Set frame dimensions; the crop rectangle follows unless set explicitly later
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.crop = Rect::new(0, 0, width, height);
        self
    }

    pub fn with_crop(mut self, crop: Rect) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_variant(mut self, variant: Encoding) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn with_framerate(mut self, num: i32, den: i32) -> Self {
        self.framerate = Rational::new(num, den);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Check whether data in this format can be fed to a port expecting `sink`.
    ///
    /// Opaque encodings and zero dimensions on either side act as wildcards.
    pub fn is_compatible_with(&self, sink: &Format) -> bool {
        self.incompatibility(sink).is_none()
    }

    /// Human-readable reason why `sink` cannot accept this format
    pub fn incompatibility(&self, sink: &Format) -> Option<String> {
        let encodings_match = self.encoding.is_opaque()
            || sink.encoding.is_opaque()
            || self.encoding == sink.encoding;
        if !encodings_match {
            return Some(format!(
                "encoding {} does not match {}",
                self.encoding, sink.encoding
            ));
        }
        let sized = |f: &Format| f.width != 0 && f.height != 0;
        if sized(self) && sized(sink) && (self.width, self.height) != (sink.width, sink.height) {
            return Some(format!(
                "size {}x{} does not match {}x{}",
                self.width, self.height, sink.width, sink.height
            ));
        }
        None
    }
}

/// Buffer count and size limits of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequirements {
    pub min_count: u32,
    pub min_size: u32,
    pub recommended_count: u32,
    pub recommended_size: u32,
    /// Requested by the application; never below the minimum when negotiated
    pub count: u32,
    pub size: u32,
}

impl BufferRequirements {
    pub fn new(min_count: u32, min_size: u32) -> Self {
        Self {
            min_count,
            min_size,
            recommended_count: min_count,
            recommended_size: min_size,
            count: min_count,
            size: min_size,
        }
    }

    /// Set the recommended sizing and adopt it as the current request
    pub fn with_recommended(mut self, count: u32, size: u32) -> Self {
        self.recommended_count = count;
        self.recommended_size = size;
        self.count = count;
        self.size = size;
        self
    }

    pub fn with_current(mut self, count: u32, size: u32) -> Self {
        self.count = count;
        self.size = size;
        self
    }

    /// Pool dimensions to allocate: the current request clamped to the minimum
    pub fn negotiated(&self) -> (u32, u32) {
        (self.count.max(self.min_count), self.size.max(self.min_size))
    }

    /// Requirements satisfying both sides of a tunnel; `self` is the allocating side
    pub fn merged_with(&self, other: &BufferRequirements) -> BufferRequirements {
        BufferRequirements {
            min_count: self.min_count.max(other.min_count),
            min_size: self.min_size.max(other.min_size),
            ..*self
        }
    }
}

impl Default for BufferRequirements {
    fn default() -> Self {
        Self::new(1, 4096)
    }
}
