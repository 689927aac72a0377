/*!
 * Synthetic Screen Source
 *
 * Moving BGRA test pattern for hosts without a display capture backend.
 * With `shows_cursor` set, a small white square walks the frame diagonally
 * where a cursor would be.
 */

use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use super::overlay::{FrameCanvas, WHITE};
use super::pacer::{FrameGrabber, GrabbedImage, PolledSource};
use super::{CaptureConfig, FrameHandler, ScreenProvider, ScreenSource};
use crate::error::CaptureError;
use crate::stats::PipelineStats;

const CURSOR_SIZE: u32 = 8;

/// Provider for the synthetic test pattern
pub struct SyntheticScreen;

impl ScreenProvider for SyntheticScreen {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_primary(
        &self,
        config: &CaptureConfig,
        handler: FrameHandler,
        stats: Arc<PipelineStats>,
    ) -> Result<Box<dyn ScreenSource>, CaptureError> {
        if config.width == 0 || config.height == 0 {
            return Err(CaptureError::SourceUnavailable {
                reason: format!("synthetic screen cannot be {}x{}", config.width, config.height),
            });
        }

        let grabber = PatternGrabber::new(config.width, config.height, config.shows_cursor);
        Ok(Box::new(PolledSource::new("synthetic", grabber, config, handler, stats)))
    }
}

/// Draws one pattern frame per grab
pub struct PatternGrabber {
    width: u32,
    height: u32,
    shows_cursor: bool,
    frame: u64,
}

impl PatternGrabber {
    pub fn new(width: u32, height: u32, shows_cursor: bool) -> Self {
        debug!("Synthetic pattern {}x{} (cursor={})", width, height, shows_cursor);
        Self {
            width,
            height,
            shows_cursor,
            frame: 0,
        }
    }

    fn cursor_origin(&self) -> (i64, i64) {
        let span_x = self.width.saturating_sub(CURSOR_SIZE).max(1) as u64;
        let span_y = self.height.saturating_sub(CURSOR_SIZE).max(1) as u64;
        ((self.frame % span_x) as i64, (self.frame % span_y) as i64)
    }
}

impl FrameGrabber for PatternGrabber {
    fn grab(&mut self) -> Result<GrabbedImage, CaptureError> {
        let stride = self.width as usize * 4;
        let mut buf = Vec::with_capacity(stride * self.height as usize);
        let shift = self.frame as u32;

        for y in 0..self.height {
            for x in 0..self.width {
                let b = ((x + shift) & 0xFF) as u8;
                let g = ((y + shift) & 0xFF) as u8;
                let r = ((x ^ y) & 0xFF) as u8;
                buf.extend_from_slice(&[b, g, r, 0xFF]);
            }
        }

        if self.shows_cursor {
            let (x, y) = self.cursor_origin();
            if let Some(mut canvas) = FrameCanvas::new(&mut buf, self.width, self.height, stride) {
                canvas.fill_square(x, y, CURSOR_SIZE, WHITE);
            }
        }

        self.frame += 1;
        Ok(GrabbedImage {
            data: Bytes::from(buf),
            width: self.width,
            height: self.height,
            stride,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::RawFrame;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_pattern_size_and_motion() {
        let mut grabber = PatternGrabber::new(16, 8, false);
        let first = grabber.grab().unwrap();
        let second = grabber.grab().unwrap();

        assert_eq!(first.data.len(), 16 * 8 * 4);
        assert_eq!(first.stride, 64);
        assert_ne!(first.data, second.data);
        assert!(first.data.chunks(4).all(|px| px[3] == 0xFF));
    }

    #[test]
    fn test_cursor_marker() {
        let mut grabber = PatternGrabber::new(32, 32, true);
        let image = grabber.grab().unwrap();
        // Frame 0 puts the marker at the origin.
        assert_eq!(&image.data[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        let inside = (7 * 32 + 7) * 4;
        assert_eq!(&image.data[inside..inside + 4], &[0xFF, 0xFF, 0xFF, 0xFF]);

        let mut plain = PatternGrabber::new(32, 32, false);
        let image = plain.grab().unwrap();
        assert_eq!(&image.data[..4], &[0, 0, 0, 0xFF]);
    }

    #[test]
    fn test_synthetic_screen_delivers_valid_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let slot = frames.clone();
        let handler: FrameHandler = Arc::new(move |frame: RawFrame| slot.lock().unwrap().push(frame));
        let config = CaptureConfig {
            width: 64,
            height: 48,
            frame_rate: 100,
            ..Default::default()
        };

        let mut source = SyntheticScreen
            .open_primary(&config, handler, Arc::new(PipelineStats::new()))
            .unwrap();
        source.start_running().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        source.stop_running();

        let frames = frames.lock().unwrap();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.is_valid() && f.width == 64 && f.height == 48));
    }

    #[test]
    fn test_zero_geometry_is_unavailable() {
        let config = CaptureConfig {
            width: 0,
            ..Default::default()
        };
        let handler: FrameHandler = Arc::new(|_: RawFrame| {});
        let result = SyntheticScreen.open_primary(&config, handler, Arc::new(PipelineStats::new()));
        assert!(matches!(result, Err(CaptureError::SourceUnavailable { .. })));
    }
}
