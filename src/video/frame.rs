/*!
 * Video Frame Representation
 *
 * Raw captured frames and the media clock used to stamp them.
 */

use bytes::Bytes;

/// Pixel format for raw frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGRA 8-bit per channel (native macOS display format)
    BGRA,
}

impl PixelFormat {
    /// Get bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::BGRA => 4,
        }
    }
}

/// Rational media timestamp: `value / timescale` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
}

impl MediaTime {
    pub fn new(value: i64, timescale: i32) -> Self {
        Self { value, timescale }
    }

    /// Timestamp of frame `index` at `fps`
    pub fn frame(index: u64, fps: u32) -> Self {
        Self::new(index as i64, fps as i32)
    }

    /// Duration of one frame at `fps`
    pub fn frame_duration(fps: u32) -> Self {
        Self::new(1, fps as i32)
    }
}

/// Raw uncompressed video frame
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame pixel data, `stride * height` bytes
    pub data: Bytes,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per row (may exceed `width * bytes_per_pixel`)
    pub stride: usize,
    pub format: PixelFormat,
    /// Presentation timestamp
    pub pts: MediaTime,
    pub duration: MediaTime,
    /// Capture sequence number
    pub sequence: u64,
}

impl RawFrame {
    /// Tightly packed BGRA frame
    pub fn bgra(data: Bytes, width: u32, height: u32, pts: MediaTime, duration: MediaTime, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * PixelFormat::BGRA.bytes_per_pixel(),
            format: PixelFormat::BGRA,
            pts,
            duration,
            sequence,
        }
    }

    /// Get expected data size for this frame
    pub fn expected_size(&self) -> usize {
        self.stride * self.height as usize
    }

    /// Validate frame data size
    pub fn is_valid(&self) -> bool {
        self.stride >= self.width as usize * self.format.bytes_per_pixel()
            && self.data.len() >= self.expected_size()
    }

    /// Pixel row `y`, without stride padding
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height || !self.is_valid() {
            return None;
        }
        let start = y as usize * self.stride;
        let len = self.width as usize * self.format.bytes_per_pixel();
        Some(&self.data[start..start + len])
    }
}
