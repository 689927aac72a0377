/*!
 * Polled Frame Sources
 *
 * Sources without a push API are polled on a dedicated capture thread.
 * `FramePacer` keeps the fixed cadence and decides how many ticks were missed
 * when a grab overruns its slot.
 */

use bytes::Bytes;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::{CaptureConfig, FrameHandler, ScreenSource};
use crate::error::CaptureError;
use crate::stats::PipelineStats;
use crate::video::{MediaTime, PixelFormat, RawFrame};

/// Fixed-interval tick schedule
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Duration,
    next: Instant,
    skip_missed: bool,
}

impl FramePacer {
    /// Pacer whose first tick is due at `start`
    pub fn new(fps: u32, start: Instant, skip_missed: bool) -> Self {
        Self {
            interval: Duration::from_secs(1) / fps.max(1),
            next: start,
            skip_missed,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the next tick is due
    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Move past the tick that just fired; `now` is when its work finished
    ///
    /// Returns how many ticks were skipped because they were already due.
    /// With skipping disabled, overdue ticks fire back to back instead.
    pub fn advance(&mut self, now: Instant) -> u64 {
        self.next += self.interval;
        if !self.skip_missed || now < self.next {
            return 0;
        }

        let behind = now.duration_since(self.next).as_nanos();
        let skipped = (behind / self.interval.as_nanos()) as u64 + 1;
        self.next += self.interval * skipped as u32;
        skipped
    }
}

/// One grabbed image, BGRA
#[derive(Debug, Clone)]
pub struct GrabbedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: usize,
}

/// Produces one image per poll
pub trait FrameGrabber: Send + 'static {
    fn grab(&mut self) -> Result<GrabbedImage, CaptureError>;
}

/// `ScreenSource` that polls a `FrameGrabber` on a capture thread
pub struct PolledSource<G: FrameGrabber> {
    label: &'static str,
    grabber: Option<G>,
    fps: u32,
    skip_missed: bool,
    handler: FrameHandler,
    stats: Arc<PipelineStats>,
    worker: Option<(Sender<()>, JoinHandle<(G, u64)>)>,
    /// Ticks elapsed across every run; keeps pts increasing after a restart
    ticks: u64,
}

impl<G: FrameGrabber> PolledSource<G> {
    pub fn new(
        label: &'static str,
        grabber: G,
        config: &CaptureConfig,
        handler: FrameHandler,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            label,
            grabber: Some(grabber),
            fps: config.frame_rate.max(1),
            skip_missed: config.discard_late_frames,
            handler,
            stats,
            worker: None,
            ticks: 0,
        }
    }
}

struct CaptureLoop<G> {
    grabber: G,
    pacer: FramePacer,
    fps: u32,
    handler: FrameHandler,
    stats: Arc<PipelineStats>,
    tick: u64,
}

impl<G: FrameGrabber> CaptureLoop<G> {
    fn run(mut self, stop: mpsc::Receiver<()>) -> (G, u64) {
        let mut failures = 0u64;

        loop {
            let wait = self.pacer.deadline().saturating_duration_since(Instant::now());
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            match self.grabber.grab() {
                Ok(image) => {
                    failures = 0;
                    let frame = RawFrame {
                        data: image.data,
                        width: image.width,
                        height: image.height,
                        stride: image.stride,
                        format: PixelFormat::BGRA,
                        pts: MediaTime::frame(self.tick, self.fps),
                        duration: MediaTime::frame_duration(self.fps),
                        sequence: self.tick,
                    };
                    self.stats.frame_captured();
                    (self.handler)(frame);
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!("Frame grab failed: {}", e);
                    } else {
                        debug!("Frame grab failed ({} in a row): {}", failures, e);
                    }
                }
            }

            let skipped = self.pacer.advance(Instant::now());
            if skipped > 0 {
                debug!("Capture fell behind, skipped {} frame(s)", skipped);
                self.stats.frames_skipped(skipped);
            }
            self.tick += 1 + skipped;
        }

        (self.grabber, self.tick)
    }
}

impl<G: FrameGrabber> ScreenSource for PolledSource<G> {
    fn start_running(&mut self) -> Result<(), CaptureError> {
        let grabber = self.grabber.take().ok_or_else(|| CaptureError::SourceUnavailable {
            reason: format!("{} grabber lost after a capture thread panic", self.label),
        })?;

        let (stop_tx, stop_rx) = mpsc::channel();
        let capture = CaptureLoop {
            grabber,
            pacer: FramePacer::new(self.fps, Instant::now(), self.skip_missed),
            fps: self.fps,
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            tick: self.ticks,
        };

        let handle = std::thread::Builder::new()
            .name(format!("capture.{}", self.label))
            .spawn(move || capture.run(stop_rx))?;

        self.worker = Some((stop_tx, handle));
        Ok(())
    }

    fn stop_running(&mut self) {
        let Some((stop_tx, handle)) = self.worker.take() else {
            return;
        };

        let _ = stop_tx.send(());
        match handle.join() {
            Ok((grabber, ticks)) => {
                self.grabber = Some(grabber);
                self.ticks = ticks;
            }
            Err(_) => error!("Capture thread {} panicked", self.label),
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl<G: FrameGrabber> Drop for PolledSource<G> {
    fn drop(&mut self) {
        self.stop_running();
    }
}
