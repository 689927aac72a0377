/*!
 * Screen Capture Module
 *
 * Acquires the primary display and delivers raw BGRA frames to a handler on
 * the source's own delivery thread (a dispatch queue for the macOS display
 * stream, a polling thread for the synthetic pattern). `CaptureSession` wraps one source and
 * makes start/stop idempotent.
 */

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PipelineOptions;
use crate::error::CaptureError;
use crate::stats::PipelineStats;
use crate::video::RawFrame;

pub mod overlay;
pub mod pacer;
pub mod synthetic;

#[cfg(target_os = "macos")]
mod display_stream_ffi;
#[cfg(target_os = "macos")]
pub mod macos;

pub use pacer::{FrameGrabber, FramePacer, GrabbedImage, PolledSource};
pub use synthetic::SyntheticScreen;

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureConfig {
    /// Preferred frame width for sources that can choose one
    pub width: u32,
    /// Preferred frame height for sources that can choose one
    pub height: u32,
    /// Frames per second; the minimum frame duration is `1 / frame_rate`
    pub frame_rate: u32,
    pub shows_cursor: bool,
    pub shows_clicks: bool,
    /// Skip frames the source could not produce on time instead of bursting
    pub discard_late_frames: bool,
}

impl CaptureConfig {
    pub fn from_options(options: &PipelineOptions) -> Self {
        Self {
            width: options.width,
            height: options.height,
            frame_rate: options.fps,
            shows_cursor: options.shows_cursor,
            shows_clicks: options.shows_clicks,
            discard_late_frames: true,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::from_options(&PipelineOptions::default())
    }
}

/// Receives every captured frame, on the source's delivery thread
pub type FrameHandler = Arc<dyn Fn(RawFrame) + Send + Sync>;

/// A running or stopped screen source
pub trait ScreenSource: Send {
    /// Begin delivering frames to the handler
    fn start_running(&mut self) -> Result<(), CaptureError>;

    /// Halt delivery; returns once the handler will not be called again
    fn stop_running(&mut self);

    fn is_running(&self) -> bool;
}

/// Opens the primary display as a `ScreenSource`
pub trait ScreenProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Acquire the primary display
    ///
    /// Fails when no display is available or it cannot be read; a returned
    /// source is ready to start.
    fn open_primary(
        &self,
        config: &CaptureConfig,
        handler: FrameHandler,
        stats: Arc<PipelineStats>,
    ) -> Result<Box<dyn ScreenSource>, CaptureError>;
}

/// Screen provider for this platform
pub fn create_screen_provider() -> Box<dyn ScreenProvider> {
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::PrimaryDisplay)
    }

    #[cfg(not(target_os = "macos"))]
    {
        info!("No display capture backend on this platform, using synthetic source");
        Box::new(SyntheticScreen)
    }
}

/// Capture session over one screen source
pub struct CaptureSession {
    source: Box<dyn ScreenSource>,
}

impl CaptureSession {
    /// Acquire the primary display from `provider`
    pub fn new(
        provider: &dyn ScreenProvider,
        config: CaptureConfig,
        handler: FrameHandler,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, CaptureError> {
        info!(
            "Opening {} capture source @ {} fps (cursor={}, clicks={})",
            provider.name(),
            config.frame_rate,
            config.shows_cursor,
            config.shows_clicks
        );

        let source = provider.open_primary(&config, handler, stats)?;
        Ok(Self { source })
    }

    /// Start delivering frames; no-op if already running
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.source.is_running() {
            debug!("Capture already running");
            return Ok(());
        }
        self.source.start_running()?;
        info!("Capture started");
        Ok(())
    }

    /// Stop delivering frames; no-op if already stopped
    pub fn stop(&mut self) {
        if !self.source.is_running() {
            debug!("Capture already stopped");
            return;
        }
        self.source.stop_running();
        info!("Capture stopped");
    }

    pub fn is_running(&self) -> bool {
        self.source.is_running()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualScreen;

    fn counting_handler() -> (FrameHandler, Arc<std::sync::Mutex<Vec<u64>>>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let slot = seen.clone();
        let handler: FrameHandler = Arc::new(move |frame: RawFrame| {
            slot.lock().unwrap().push(frame.sequence);
        });
        (handler, seen)
    }

    #[test]
    fn test_config_from_options() {
        let options = PipelineOptions::with_geometry(1280, 720, 60);
        let config = CaptureConfig::from_options(&options);
        assert_eq!(config.frame_rate, 60);
        assert_eq!((config.width, config.height), (1280, 720));
        assert!(config.shows_cursor && config.shows_clicks);
        assert!(config.discard_late_frames);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let screen = ManualScreen::new();
        let (handler, seen) = counting_handler();
        let mut session = CaptureSession::new(
            &screen,
            CaptureConfig::default(),
            handler,
            Arc::new(PipelineStats::new()),
        )
        .unwrap();

        session.start().unwrap();
        session.start().unwrap();
        assert!(session.is_running());
        assert_eq!(screen.start_count(), 1);

        screen.inject(0);
        session.stop();
        session.stop();
        assert!(!session.is_running());
        assert_eq!(screen.stop_count(), 1);

        screen.inject(1);
        session.start().unwrap();
        screen.inject(2);

        assert_eq!(*seen.lock().unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_unavailable_source_fails_construction() {
        let screen = ManualScreen::unavailable();
        let (handler, _) = counting_handler();
        let result = CaptureSession::new(
            &screen,
            CaptureConfig::default(),
            handler,
            Arc::new(PipelineStats::new()),
        );
        assert!(matches!(result, Err(CaptureError::SourceUnavailable { .. })));
    }
}
