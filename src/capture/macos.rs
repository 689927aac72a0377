/*!
 * macOS Screen Capture Implementation
 *
 * Streams the main display with `CGDisplayStream`. Frames arrive already
 * scaled to the configured size on the stream's own dispatch queue, which
 * becomes the capture delivery thread. The window server composites the
 * cursor when `shows_cursor` is set; with `shows_clicks` a ring is drawn
 * under the pointer while a mouse button is held.
 *
 * Acquisition checks screen recording permission and creates (then
 * releases) one stream so an unusable display fails construction.
 */

use bytes::Bytes;
use core_foundation::base::{CFRelease, CFType, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use core_graphics::display::CGDisplay;
use core_graphics::event::CGEvent;
use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::display_stream_ffi::*;
use super::overlay::{display_to_frame, FrameCanvas, CLICK_RING, CLICK_RING_RADIUS, CLICK_RING_THICKNESS};
use super::{CaptureConfig, FrameHandler, ScreenProvider, ScreenSource};
use crate::error::CaptureError;
use crate::stats::PipelineStats;
use crate::video::{MediaTime, PixelFormat, RawFrame};

/// Frames the window server may buffer ahead of the handler
const STREAM_QUEUE_DEPTH: i32 = 3;

/// How long `stop` waits for the stream to report it has stopped
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// pts timescale (microseconds since the source was opened)
const PTS_TIMESCALE: i32 = 1_000_000;

/// Primary display provider
pub struct PrimaryDisplay;

impl ScreenProvider for PrimaryDisplay {
    fn name(&self) -> &'static str {
        "macOS main display"
    }

    fn open_primary(
        &self,
        config: &CaptureConfig,
        handler: FrameHandler,
        stats: Arc<PipelineStats>,
    ) -> Result<Box<dyn ScreenSource>, CaptureError> {
        if !unsafe { CGPreflightScreenCaptureAccess() } {
            return Err(CaptureError::SourceUnavailable {
                reason: "screen recording permission not granted".to_string(),
            });
        }
        if config.width == 0 || config.height == 0 {
            return Err(CaptureError::SourceUnavailable {
                reason: format!("cannot stream the display at {}x{}", config.width, config.height),
            });
        }

        let display = CGDisplay::main();
        let bounds = display.bounds();
        info!(
            "Main display ID: {} ({}x{}), streaming at {}x{}",
            display.id, bounds.size.width, bounds.size.height, config.width, config.height
        );

        let source = DisplayStreamSource {
            display,
            config: config.clone(),
            handler,
            stats,
            epoch: Instant::now(),
            sequence: Arc::new(AtomicU64::new(0)),
            active: None,
        };

        // Dropped unstarted: released without waiting.
        drop(source.open_stream()?);
        debug!("Display {} can be streamed", source.display.id);

        Ok(Box::new(source))
    }
}

/// `ScreenSource` over one `CGDisplayStream` per run
pub struct DisplayStreamSource {
    display: CGDisplay,
    config: CaptureConfig,
    handler: FrameHandler,
    stats: Arc<PipelineStats>,
    epoch: Instant,
    /// Shared with every run so sequence numbers keep increasing after a restart
    sequence: Arc<AtomicU64>,
    active: Option<ActiveStream>,
}

impl DisplayStreamSource {
    fn open_stream(&self) -> Result<ActiveStream, CaptureError> {
        let (stopped_tx, stopped_rx) = mpsc::sync_channel(1);
        let context = Box::into_raw(Box::new(StreamContext {
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            fps: self.config.frame_rate.max(1),
            epoch: self.epoch,
            sequence: self.sequence.clone(),
            clicks: self
                .config
                .shows_clicks
                .then(|| ClickIndicator::for_display(&self.display)),
            stopped: stopped_tx,
        }));

        let properties = stream_properties(&self.config);
        let mut block = FrameAvailableBlock::new(frame_available, context as *mut c_void);

        unsafe {
            let queue = serial_queue(b"screencast.capture.display\0");
            let stream = CGDisplayStreamCreateWithDispatchQueue(
                self.display.id,
                self.config.width as usize,
                self.config.height as usize,
                kCVPixelFormatType_32BGRA,
                properties.as_concrete_TypeRef(),
                queue,
                &mut block as *mut FrameAvailableBlock as *mut c_void,
            );

            if stream.is_null() {
                dispatch_release(queue as *mut c_void);
                drop(Box::from_raw(context));
                return Err(CaptureError::SourceUnavailable {
                    reason: format!(
                        "display {} stream could not be created at {}x{}",
                        self.display.id, self.config.width, self.config.height
                    ),
                });
            }

            Ok(ActiveStream {
                stream,
                queue,
                context,
                stopped: stopped_rx,
                started: false,
            })
        }
    }
}

impl ScreenSource for DisplayStreamSource {
    fn start_running(&mut self) -> Result<(), CaptureError> {
        let mut stream = self.open_stream()?;

        let status = unsafe { CGDisplayStreamStart(stream.stream) };
        if status != kCGErrorSuccess {
            return Err(CaptureError::AttachFailed {
                reason: format!("CGDisplayStreamStart failed: {}", status),
            });
        }
        stream.started = true;

        self.active = Some(stream);
        Ok(())
    }

    fn stop_running(&mut self) {
        // Drop stops the stream and waits for its final callback.
        self.active.take();
    }

    fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

/// Session properties: cursor compositing, frame interval, queue depth
fn stream_properties(config: &CaptureConfig) -> CFDictionary<CFType, CFType> {
    let (show_cursor, minimum_frame_time, queue_depth) = unsafe {
        (
            CFString::wrap_under_get_rule(kCGDisplayStreamShowCursor),
            CFString::wrap_under_get_rule(kCGDisplayStreamMinimumFrameTime),
            CFString::wrap_under_get_rule(kCGDisplayStreamQueueDepth),
        )
    };
    let frame_time = 1.0 / config.frame_rate.max(1) as f64;

    CFDictionary::from_CFType_pairs(&[
        (show_cursor.as_CFType(), CFBoolean::from(config.shows_cursor).as_CFType()),
        (minimum_frame_time.as_CFType(), CFNumber::from(frame_time).as_CFType()),
        (queue_depth.as_CFType(), CFNumber::from(STREAM_QUEUE_DEPTH).as_CFType()),
    ])
}

/// A created display stream plus the context its handler dereferences
struct ActiveStream {
    stream: CGDisplayStreamRef,
    queue: dispatch_queue_t,
    context: *mut StreamContext,
    stopped: Receiver<()>,
    started: bool,
}

// The stream and queue are thread-safe; the context is only read on the queue.
unsafe impl Send for ActiveStream {}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        if self.started {
            let status = unsafe { CGDisplayStreamStop(self.stream) };
            if status != kCGErrorSuccess {
                warn!("CGDisplayStreamStop failed: {}", status);
            }
            if self.stopped.recv_timeout(STOP_TIMEOUT).is_err() {
                // The handler may still run; its context has to stay alive.
                warn!("Display stream did not report stopping, leaking it");
                return;
            }
        }

        unsafe {
            CFRelease(self.stream as *const c_void);
            dispatch_release(self.queue as *mut c_void);
            drop(Box::from_raw(self.context));
        }
    }
}

/// State read by the frame handler on the stream's queue
struct StreamContext {
    handler: FrameHandler,
    stats: Arc<PipelineStats>,
    fps: u32,
    epoch: Instant,
    sequence: Arc<AtomicU64>,
    clicks: Option<ClickIndicator>,
    stopped: SyncSender<()>,
}

impl StreamContext {
    fn on_status(&self, status: CGDisplayStreamFrameStatus, surface: IOSurfaceRef) {
        match status {
            kCGDisplayStreamFrameStatusFrameComplete => self.deliver(surface),
            kCGDisplayStreamFrameStatusFrameIdle | kCGDisplayStreamFrameStatusFrameBlank => {}
            kCGDisplayStreamFrameStatusStopped => {
                let _ = self.stopped.try_send(());
            }
            other => debug!("Unknown display stream status {}", other),
        }
    }

    fn deliver(&self, surface: IOSurfaceRef) {
        let Some(copy) = (unsafe { surface_copy(surface) }) else {
            debug!("Display surface could not be read, skipping frame");
            return;
        };

        let mut data = copy.data;
        if let Some((x, y)) = self
            .clicks
            .as_ref()
            .and_then(|clicks| clicks.pressed_at((copy.width, copy.height)))
        {
            if let Some(mut canvas) = FrameCanvas::new(&mut data, copy.width, copy.height, copy.stride) {
                canvas.ring(x, y, CLICK_RING_RADIUS, CLICK_RING_THICKNESS, CLICK_RING);
            }
        }

        let frame = RawFrame {
            data: Bytes::from(data),
            width: copy.width,
            height: copy.height,
            stride: copy.stride,
            format: PixelFormat::BGRA,
            pts: MediaTime::new(self.epoch.elapsed().as_micros() as i64, PTS_TIMESCALE),
            duration: MediaTime::frame_duration(self.fps),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.stats.frame_captured();
        (self.handler)(frame);
    }
}

unsafe extern "C" fn frame_available(
    block: *mut FrameAvailableBlock,
    status: CGDisplayStreamFrameStatus,
    _display_time: u64,
    surface: IOSurfaceRef,
    _update: CGDisplayStreamUpdateRef,
) {
    if block.is_null() || (*block).context.is_null() {
        return;
    }
    let context = &*((*block).context as *const StreamContext);

    if catch_unwind(AssertUnwindSafe(|| context.on_status(status, surface))).is_err() {
        error!("Display stream handler panicked, frame dropped");
    }
}

/// Locates the pointer while a mouse button is held
struct ClickIndicator {
    origin: (f64, f64),
    size: (f64, f64),
}

impl ClickIndicator {
    fn for_display(display: &CGDisplay) -> Self {
        let bounds = display.bounds();
        Self {
            origin: (bounds.origin.x, bounds.origin.y),
            size: (bounds.size.width, bounds.size.height),
        }
    }

    /// Pointer position in frame pixels, if a button is down over the display
    fn pressed_at(&self, frame: (u32, u32)) -> Option<(i64, i64)> {
        let pressed = unsafe {
            CGEventSourceButtonState(kCGEventSourceStateCombinedSessionState, kCGMouseButtonLeft)
                || CGEventSourceButtonState(kCGEventSourceStateCombinedSessionState, kCGMouseButtonRight)
        };
        if !pressed {
            return None;
        }

        let source = CGEventSource::new(CGEventSourceStateID::CombinedSessionState).ok()?;
        let location = CGEvent::new(source).ok()?.location();
        display_to_frame((location.x, location.y), self.origin, self.size, frame)
    }
}
