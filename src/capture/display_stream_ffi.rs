/*!
 * Display Stream FFI Bindings
 *
 * Low-level FFI to `CGDisplayStream` (push-based display capture onto a
 * dispatch queue), the IOSurface accessors for the frames it delivers, and
 * the libdispatch and Blocks runtime symbols needed to hand it a handler.
 */

#![cfg(target_os = "macos")]
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use core_foundation::dictionary::CFDictionaryRef;
use core_foundation::string::CFStringRef;
use std::os::raw::{c_char, c_int, c_ulong, c_void};
use std::ptr;

// ============================================================================
// Types
// ============================================================================

#[repr(C)]
pub struct OpaqueCGDisplayStream;
pub type CGDisplayStreamRef = *mut OpaqueCGDisplayStream;

#[repr(C)]
pub struct OpaqueCGDisplayStreamUpdate;
pub type CGDisplayStreamUpdateRef = *mut OpaqueCGDisplayStreamUpdate;

#[repr(C)]
pub struct OpaqueIOSurface;
pub type IOSurfaceRef = *mut OpaqueIOSurface;

#[repr(C)]
pub struct OpaqueDispatchQueue;
pub type dispatch_queue_t = *mut OpaqueDispatchQueue;

pub type CGDirectDisplayID = u32;
pub type CGError = i32;
pub type IOReturn = i32;

/// CGDisplayStreamFrameStatus
pub type CGDisplayStreamFrameStatus = i32;
pub const kCGDisplayStreamFrameStatusFrameComplete: CGDisplayStreamFrameStatus = 0;
pub const kCGDisplayStreamFrameStatusFrameIdle: CGDisplayStreamFrameStatus = 1;
pub const kCGDisplayStreamFrameStatusFrameBlank: CGDisplayStreamFrameStatus = 2;
pub const kCGDisplayStreamFrameStatusStopped: CGDisplayStreamFrameStatus = 3;

pub const kCGErrorSuccess: CGError = 0;

/// Pixel format FourCC
pub const kCVPixelFormatType_32BGRA: i32 = 0x42475241; // 'BGRA'

pub const kIOSurfaceLockReadOnly: u32 = 0x0000_0001;

/// CGEventSourceStateID
pub const kCGEventSourceStateCombinedSessionState: i32 = 0;

/// CGMouseButton
pub const kCGMouseButtonLeft: u32 = 0;
pub const kCGMouseButtonRight: u32 = 1;

// ============================================================================
// Frame Available Handler (Blocks ABI)
// ============================================================================

/// Invoke function of the frame handler block
pub type FrameAvailableInvoke = unsafe extern "C" fn(
    block: *mut FrameAvailableBlock,
    status: CGDisplayStreamFrameStatus,
    displayTime: u64,
    frameSurface: IOSurfaceRef,
    updateRef: CGDisplayStreamUpdateRef,
);

#[repr(C)]
#[allow(dead_code)]
pub struct BlockDescriptor {
    reserved: c_ulong,
    size: c_ulong,
}

/// Stack block literal carrying one context pointer
///
/// Has no copy/dispose helpers: the display stream's `Block_copy` moves the
/// bytes to the heap, so the literal itself may go out of scope once the
/// stream is created. The context must outlive the stream.
#[repr(C)]
#[allow(dead_code)]
pub struct FrameAvailableBlock {
    isa: *const c_void,
    flags: c_int,
    reserved: c_int,
    invoke: FrameAvailableInvoke,
    descriptor: *const BlockDescriptor,
    pub context: *mut c_void,
}

static FRAME_AVAILABLE_DESCRIPTOR: BlockDescriptor = BlockDescriptor {
    reserved: 0,
    size: std::mem::size_of::<FrameAvailableBlock>() as c_ulong,
};

impl FrameAvailableBlock {
    pub fn new(invoke: FrameAvailableInvoke, context: *mut c_void) -> Self {
        Self {
            isa: unsafe { &_NSConcreteStackBlock as *const _ as *const c_void },
            flags: 0,
            reserved: 0,
            invoke,
            descriptor: &FRAME_AVAILABLE_DESCRIPTOR,
            context,
        }
    }
}

// ============================================================================
// Core Graphics C API Bindings
// ============================================================================

#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {
    pub static kCGDisplayStreamShowCursor: CFStringRef;
    pub static kCGDisplayStreamMinimumFrameTime: CFStringRef;
    pub static kCGDisplayStreamQueueDepth: CFStringRef;

    pub fn CGDisplayStreamCreateWithDispatchQueue(
        display: CGDirectDisplayID,
        outputWidth: usize,
        outputHeight: usize,
        pixelFormat: i32,
        properties: CFDictionaryRef,
        queue: dispatch_queue_t,
        handler: *mut c_void,
    ) -> CGDisplayStreamRef;

    pub fn CGDisplayStreamStart(displayStream: CGDisplayStreamRef) -> CGError;

    pub fn CGDisplayStreamStop(displayStream: CGDisplayStreamRef) -> CGError;

    pub fn CGPreflightScreenCaptureAccess() -> bool;

    pub fn CGEventSourceButtonState(stateID: i32, button: u32) -> bool;
}

// ============================================================================
// IOSurface C API Bindings
// ============================================================================

#[link(name = "IOSurface", kind = "framework")]
extern "C" {
    pub fn IOSurfaceLock(buffer: IOSurfaceRef, options: u32, seed: *mut u32) -> IOReturn;

    pub fn IOSurfaceUnlock(buffer: IOSurfaceRef, options: u32, seed: *mut u32) -> IOReturn;

    pub fn IOSurfaceGetBaseAddress(buffer: IOSurfaceRef) -> *mut c_void;

    pub fn IOSurfaceGetBytesPerRow(buffer: IOSurfaceRef) -> usize;

    pub fn IOSurfaceGetWidth(buffer: IOSurfaceRef) -> usize;

    pub fn IOSurfaceGetHeight(buffer: IOSurfaceRef) -> usize;
}

// ============================================================================
// libdispatch / Blocks runtime
// ============================================================================

#[link(name = "System", kind = "dylib")]
extern "C" {
    static _NSConcreteStackBlock: [*const c_void; 32];

    pub fn dispatch_queue_create(label: *const c_char, attr: *const c_void) -> dispatch_queue_t;

    pub fn dispatch_release(object: *mut c_void);
}

// ============================================================================
// Helpers
// ============================================================================

/// Serial dispatch queue; `label` must be NUL-terminated
pub unsafe fn serial_queue(label: &'static [u8]) -> dispatch_queue_t {
    debug_assert_eq!(label.last(), Some(&0));
    dispatch_queue_create(label.as_ptr() as *const c_char, ptr::null())
}

/// Pixels of a BGRA surface copied out under a read-only lock
pub struct SurfaceCopy {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

/// Copy a delivered frame surface; `None` if it cannot be locked or mapped
pub unsafe fn surface_copy(surface: IOSurfaceRef) -> Option<SurfaceCopy> {
    if surface.is_null() {
        return None;
    }
    if IOSurfaceLock(surface, kIOSurfaceLockReadOnly, ptr::null_mut()) != 0 {
        return None;
    }

    let base = IOSurfaceGetBaseAddress(surface) as *const u8;
    let stride = IOSurfaceGetBytesPerRow(surface);
    let width = IOSurfaceGetWidth(surface);
    let height = IOSurfaceGetHeight(surface);

    let copy = if base.is_null() || stride < width * 4 {
        None
    } else {
        Some(SurfaceCopy {
            data: std::slice::from_raw_parts(base, stride * height).to_vec(),
            width: width as u32,
            height: height as u32,
            stride,
        })
    };

    IOSurfaceUnlock(surface, kIOSurfaceLockReadOnly, ptr::null_mut());
    copy
}
