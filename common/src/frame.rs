use bytes::Bytes;

/// One raw camera frame: an 8-bit luma plane in row-major order.
///
/// The capture source moves the frame into the bridge, which either hands it
/// to the processing worker or drops it. It is never queued.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

impl RawFrame {
    /// Build a frame, checking that `pixels` covers `width * height` bytes.
    /// Rows are tightly packed; trailing bytes past the last row are ignored.
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Result<Self, FrameError> {
        let pixels = pixels.into();
        let expected = width as usize * height as usize;
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        if pixels.len() < expected {
            return Err(FrameError::TooShort {
                got: pixels.len(),
                expected,
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

/// Edge-detection threshold pair.
///
/// Stored as one packed 64-bit word in the shared state so that both halves
/// are always replaced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingParameters {
    pub low: i32,
    pub high: i32,
}

impl ProcessingParameters {
    pub const fn new(low: i32, high: i32) -> Self {
        Self { low, high }
    }

    pub fn pack(self) -> u64 {
        ((self.low as u32 as u64) << 32) | self.high as u32 as u64
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            low: (word >> 32) as u32 as i32,
            high: word as u32 as i32,
        }
    }

    /// Sanity check used by the control channel when validation is enabled.
    pub fn validate(self) -> Result<Self, FrameError> {
        if self.low < 0 || self.low > self.high {
            return Err(FrameError::InvalidThresholds {
                low: self.low,
                high: self.high,
            });
        }
        Ok(self)
    }
}

impl Default for ProcessingParameters {
    fn default() -> Self {
        Self::new(50, 150)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload too short: got {got} bytes, expected at least {expected}")]
    TooShort { got: usize, expected: usize },
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },
    #[error("invalid thresholds: low={low} high={high}")]
    InvalidThresholds { low: i32, high: i32 },
}
