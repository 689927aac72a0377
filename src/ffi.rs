/*!
 * C Interface
 *
 * Opaque-handle lifecycle for embedding hosts:
 *
 * ```c
 * typedef void (*screencast_sink)(void *context, const uint8_t *packet, size_t len);
 *
 * uint64_t screencast_create(void *context, screencast_sink sink,
 *                            uint32_t width, uint32_t height, uint32_t fps);
 * int32_t  screencast_start(uint64_t handle);
 * int32_t  screencast_stop(uint64_t handle);
 * int32_t  screencast_destroy(uint64_t handle);
 * void     screencast_init_logging(void);
 * ```
 *
 * `create` returns 0 on failure. Status returns are 0 on success,
 * `SCREENCAST_ERR_UNKNOWN_HANDLE` for a handle that is not live, and
 * `SCREENCAST_ERR_FAILED` otherwise. Panics never unwind into the host.
 *
 * The sink runs on the pipeline's delivery thread. It may call
 * `screencast_destroy` on its own handle; teardown then returns without
 * waiting for that thread, and packets already queued behind the current
 * one are still delivered after the sink returns.
 */

use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineOptions;
use crate::packet::PacketSink;
use crate::pipeline::{Backends, Pipeline};
use crate::registry::{HandleRegistry, PipelineHandle};

pub const SCREENCAST_OK: i32 = 0;
pub const SCREENCAST_ERR_UNKNOWN_HANDLE: i32 = -1;
pub const SCREENCAST_ERR_FAILED: i32 = -2;
pub const SCREENCAST_ERR_PANIC: i32 = -3;

/// Host packet callback
pub type SinkCallback = extern "C" fn(context: *mut c_void, packet: *const u8, len: usize);

/// Host callback plus its context pointer
///
/// The context is owned by the host and only ever passed back to it.
struct HostSink {
    callback: SinkCallback,
    context: *mut c_void,
}

// The host guarantees the context may be used from the delivery thread.
unsafe impl Send for HostSink {}
unsafe impl Sync for HostSink {}

impl PacketSink for HostSink {
    fn on_packet(&self, packet: &[u8]) {
        (self.callback)(self.context, packet.as_ptr(), packet.len());
    }
}

fn or_default(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

/// Create a pipeline; zero geometry arguments select 640x480 @ 30 fps
#[no_mangle]
pub extern "C" fn screencast_create(
    context: *mut c_void,
    sink: Option<SinkCallback>,
    width: u32,
    height: u32,
    fps: u32,
) -> PipelineHandle {
    create_with(context, sink, width, height, fps, Backends::platform)
}

fn create_with(
    context: *mut c_void,
    sink: Option<SinkCallback>,
    width: u32,
    height: u32,
    fps: u32,
    backends: impl FnOnce() -> Backends,
) -> PipelineHandle {
    let Some(callback) = sink else {
        error!("screencast_create: sink callback is null");
        return 0;
    };

    let result = catch_unwind(AssertUnwindSafe(|| {
        let defaults = PipelineOptions::default();
        let options = PipelineOptions::with_geometry(
            or_default(width, defaults.width),
            or_default(height, defaults.height),
            or_default(fps, defaults.fps),
        );

        let sink: Arc<dyn PacketSink> = Arc::new(HostSink { callback, context });
        Pipeline::create(sink, options, &backends())
    }));

    match result {
        Ok(Ok(pipeline)) => HandleRegistry::global().insert(pipeline),
        Ok(Err(e)) => {
            error!("screencast_create failed: {}", e);
            0
        }
        Err(_) => {
            error!("screencast_create panicked");
            0
        }
    }
}

/// Start capture; idempotent
#[no_mangle]
pub extern "C" fn screencast_start(handle: PipelineHandle) -> i32 {
    guarded("screencast_start", || {
        match HandleRegistry::global().with(handle, |p| p.start()) {
            None => SCREENCAST_ERR_UNKNOWN_HANDLE,
            Some(Ok(())) => SCREENCAST_OK,
            Some(Err(e)) => {
                error!("screencast_start({}) failed: {}", handle, e);
                SCREENCAST_ERR_FAILED
            }
        }
    })
}

/// Stop capture; idempotent
#[no_mangle]
pub extern "C" fn screencast_stop(handle: PipelineHandle) -> i32 {
    guarded("screencast_stop", || {
        match HandleRegistry::global().with(handle, |p| p.stop()) {
            None => SCREENCAST_ERR_UNKNOWN_HANDLE,
            Some(()) => SCREENCAST_OK,
        }
    })
}

/// Drain in-flight frames to the sink and release the handle
#[no_mangle]
pub extern "C" fn screencast_destroy(handle: PipelineHandle) -> i32 {
    guarded("screencast_destroy", || {
        // Teardown blocks on the drain; never hold the registry lock for it.
        match HandleRegistry::global().remove(handle) {
            None => SCREENCAST_ERR_UNKNOWN_HANDLE,
            Some(pipeline) => {
                pipeline.destroy();
                SCREENCAST_OK
            }
        }
    })
}

/// Install a `RUST_LOG`-filtered stderr logger; later calls are no-ops
#[no_mangle]
pub extern "C" fn screencast_init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        warn!("Logging already initialized");
    }
}

fn guarded(name: &str, f: impl FnOnce() -> i32) -> i32 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(_) => {
            error!("{} panicked", name);
            SCREENCAST_ERR_PANIC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEncoder, ManualScreen};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    extern "C" fn ignore(_context: *mut c_void, _packet: *const u8, _len: usize) {}

    #[test]
    fn test_unknown_handles() {
        assert_eq!(screencast_start(u64::MAX), SCREENCAST_ERR_UNKNOWN_HANDLE);
        assert_eq!(screencast_stop(u64::MAX), SCREENCAST_ERR_UNKNOWN_HANDLE);
        assert_eq!(screencast_destroy(u64::MAX), SCREENCAST_ERR_UNKNOWN_HANDLE);
        assert_eq!(screencast_destroy(0), SCREENCAST_ERR_UNKNOWN_HANDLE);
    }

    #[test]
    fn test_null_sink_fails_create() {
        assert_eq!(screencast_create(std::ptr::null_mut(), None, 640, 480, 30), 0);
    }

    #[test]
    fn test_zero_arguments_select_defaults() {
        assert_eq!(or_default(0, 640), 640);
        assert_eq!(or_default(1280, 640), 1280);
    }

    #[test]
    fn test_host_sink_passes_context_through() {
        extern "C" fn record(context: *mut c_void, packet: *const u8, len: usize) {
            let seen = unsafe { &mut *(context as *mut Vec<Vec<u8>>) };
            seen.push(unsafe { std::slice::from_raw_parts(packet, len) }.to_vec());
        }

        let mut seen: Vec<Vec<u8>> = Vec::new();
        let sink = HostSink {
            callback: record,
            context: &mut seen as *mut Vec<Vec<u8>> as *mut c_void,
        };
        sink.on_packet(&[1, 0, 0, 0, 0x65]);
        sink.on_packet(&[]);

        assert_eq!(seen, vec![vec![1, 0, 0, 0, 0x65], vec![]]);
    }

    struct SelfDestroyingHost {
        handle: AtomicU64,
        first_status: Mutex<Option<i32>>,
    }

    extern "C" fn destroy_own_handle(context: *mut c_void, _packet: *const u8, _len: usize) {
        let host = unsafe { &*(context as *const SelfDestroyingHost) };
        let status = screencast_destroy(host.handle.load(Ordering::SeqCst));
        host.first_status.lock().unwrap().get_or_insert(status);
    }

    #[test]
    fn test_sink_may_destroy_its_own_pipeline() {
        let host: &'static SelfDestroyingHost = Box::leak(Box::new(SelfDestroyingHost {
            handle: AtomicU64::new(0),
            first_status: Mutex::new(None),
        }));
        let screen = ManualScreen::new();
        let encoder = FakeEncoder::new();

        let backends = {
            let (screen, encoder) = (screen.clone(), encoder.clone());
            move || Backends::new(Box::new(screen), Box::new(encoder))
        };
        let context = host as *const SelfDestroyingHost as *mut c_void;
        let handle = create_with(context, Some(destroy_own_handle), 64, 48, 30, backends);
        assert_ne!(handle, 0);
        host.handle.store(handle, Ordering::SeqCst);
        assert_eq!(screencast_start(handle), SCREENCAST_OK);

        assert!(screen.inject(0));

        let deadline = Instant::now() + Duration::from_secs(5);
        while host.first_status.lock().unwrap().is_none() {
            assert!(Instant::now() < deadline, "sink never ran");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(*host.first_status.lock().unwrap(), Some(SCREENCAST_OK));
        assert_eq!(screencast_stop(handle), SCREENCAST_ERR_UNKNOWN_HANDLE);
        assert!(encoder.state().invalidated);
    }

    #[test]
    fn test_init_logging_twice() {
        screencast_init_logging();
        screencast_init_logging();
    }

    #[test]
    fn test_platform_create_is_total() {
        // Succeeds only where a hardware encoder exists; never panics.
        let handle = screencast_create(std::ptr::null_mut(), Some(ignore), 0, 0, 0);
        if handle != 0 {
            assert_eq!(screencast_start(handle), SCREENCAST_OK);
            assert_eq!(screencast_stop(handle), SCREENCAST_OK);
            assert_eq!(screencast_destroy(handle), SCREENCAST_OK);
            assert_eq!(screencast_destroy(handle), SCREENCAST_ERR_UNKNOWN_HANDLE);
        }
    }
}
