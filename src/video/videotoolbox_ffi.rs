/*!
 * VideoToolbox FFI Bindings
 *
 * Low-level FFI to the VideoToolbox, CoreVideo and CoreMedia C APIs used by
 * the hardware encoder: compression sessions, BGRA pixel buffers, and read
 * access to compressed sample buffers (attachments, format descriptions,
 * block buffers).
 */

#![cfg(target_os = "macos")]
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use core_foundation::array::{CFArrayGetCount, CFArrayGetValueAtIndex, CFArrayRef};
use core_foundation::base::{Boolean, CFTypeRef, TCFType};
use core_foundation::dictionary::{CFDictionaryContainsKey, CFDictionaryRef};
use core_foundation::string::CFString;
use std::os::raw::c_void;
use std::ptr;

// ============================================================================
// Core Media Types
// ============================================================================

/// CMTime - Core Media timestamp
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct CMTime {
    pub value: i64,
    pub timescale: i32,
    pub flags: u32,
    pub epoch: i64,
}

impl CMTime {
    /// Create a new CMTime with value and timescale
    pub fn new(value: i64, timescale: i32) -> Self {
        Self {
            value,
            timescale,
            flags: 1, // kCMTimeFlags_Valid
            epoch: 0,
        }
    }

    /// kCMTimeInvalid
    pub fn invalid() -> Self {
        Self {
            value: 0,
            timescale: 0,
            flags: 0,
            epoch: 0,
        }
    }
}

#[repr(C)]
pub struct OpaqueCMSampleBuffer;
pub type CMSampleBufferRef = *mut OpaqueCMSampleBuffer;

#[repr(C)]
pub struct OpaqueCMBlockBuffer;
pub type CMBlockBufferRef = *mut OpaqueCMBlockBuffer;

#[repr(C)]
pub struct OpaqueCMFormatDescription;
pub type CMFormatDescriptionRef = *mut OpaqueCMFormatDescription;

// ============================================================================
// Core Video Types (CVPixelBuffer)
// ============================================================================

#[repr(C)]
pub struct OpaqueCVPixelBuffer;
pub type CVPixelBufferRef = *mut OpaqueCVPixelBuffer;

pub type CVPixelBufferLockFlags = u64;

pub type OSType = u32;
pub const kCVPixelFormatType_32BGRA: OSType = 0x42475241; // 'BGRA'

// ============================================================================
// VideoToolbox Types
// ============================================================================

#[repr(C)]
pub struct OpaqueVTCompressionSession;
pub type VTCompressionSessionRef = *mut OpaqueVTCompressionSession;

pub type OSStatus = i32;
pub const noErr: OSStatus = 0;
pub const kVTParameterErr: OSStatus = -12902;
pub const kCMFormatDescriptionError_InvalidParameter: OSStatus = -12710;

pub const kCMVideoCodecType_H264: u32 = 0x61766331; // 'avc1'
pub const kCMVideoCodecType_HEVC: u32 = 0x68766331; // 'hvc1'

/// VTEncodeInfoFlags
pub const kVTEncodeInfo_Asynchronous: u32 = 1 << 0;
pub const kVTEncodeInfo_FrameDropped: u32 = 1 << 1;

/// Compression output callback
pub type VTCompressionOutputCallback = extern "C" fn(
    outputCallbackRefCon: *mut c_void,
    sourceFrameRefCon: *mut c_void,
    status: OSStatus,
    infoFlags: u32,
    sampleBuffer: CMSampleBufferRef,
);

// ============================================================================
// Property Keys (as raw CFStrings)
// ============================================================================

/// Session property key; VideoToolbox keys are equal to their names
pub fn property_key(name: &'static str) -> CFString {
    CFString::from_static_string(name)
}

/// kCMSampleAttachmentKey_NotSync
pub fn not_sync_key() -> CFString {
    CFString::from_static_string("NotSync")
}

// ============================================================================
// VideoToolbox C API Bindings
// ============================================================================

#[link(name = "VideoToolbox", kind = "framework")]
extern "C" {
    pub fn VTCompressionSessionCreate(
        allocator: CFTypeRef,
        width: i32,
        height: i32,
        codecType: u32,
        encoderSpecification: CFTypeRef,
        sourceImageBufferAttributes: CFTypeRef,
        compressedDataAllocator: CFTypeRef,
        outputCallback: VTCompressionOutputCallback,
        outputCallbackRefCon: *mut c_void,
        compressionSessionOut: *mut VTCompressionSessionRef,
    ) -> OSStatus;

    pub fn VTCompressionSessionEncodeFrame(
        session: VTCompressionSessionRef,
        imageBuffer: CVPixelBufferRef,
        presentationTimeStamp: CMTime,
        duration: CMTime,
        frameProperties: CFTypeRef,
        sourceFrameRefCon: *mut c_void,
        infoFlagsOut: *mut u32,
    ) -> OSStatus;

    /// Emit every pending frame up to the timestamp (all, if invalid)
    pub fn VTCompressionSessionCompleteFrames(
        session: VTCompressionSessionRef,
        completeUntilPresentationTimeStamp: CMTime,
    ) -> OSStatus;

    pub fn VTCompressionSessionInvalidate(session: VTCompressionSessionRef);

    pub fn VTCompressionSessionPrepareToEncodeFrames(session: VTCompressionSessionRef) -> OSStatus;

    pub fn VTSessionSetProperty(
        session: VTCompressionSessionRef,
        propertyKey: *const c_void,
        propertyValue: *const c_void,
    ) -> OSStatus;
}

// ============================================================================
// Core Video C API Bindings
// ============================================================================

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    pub fn CVPixelBufferCreate(
        allocator: CFTypeRef,
        width: usize,
        height: usize,
        pixelFormatType: OSType,
        pixelBufferAttributes: CFTypeRef,
        pixelBufferOut: *mut CVPixelBufferRef,
    ) -> OSStatus;

    pub fn CVPixelBufferLockBaseAddress(
        pixelBuffer: CVPixelBufferRef,
        lockFlags: CVPixelBufferLockFlags,
    ) -> OSStatus;

    pub fn CVPixelBufferUnlockBaseAddress(
        pixelBuffer: CVPixelBufferRef,
        unlockFlags: CVPixelBufferLockFlags,
    ) -> OSStatus;

    pub fn CVPixelBufferGetBaseAddress(pixelBuffer: CVPixelBufferRef) -> *mut c_void;

    pub fn CVPixelBufferGetBytesPerRow(pixelBuffer: CVPixelBufferRef) -> usize;

    pub fn CVPixelBufferGetWidth(pixelBuffer: CVPixelBufferRef) -> usize;

    pub fn CVPixelBufferGetHeight(pixelBuffer: CVPixelBufferRef) -> usize;

    pub fn CVPixelBufferRelease(pixelBuffer: CVPixelBufferRef);
}

// ============================================================================
// Core Media C API Bindings
// ============================================================================

#[link(name = "CoreMedia", kind = "framework")]
extern "C" {
    pub fn CMSampleBufferDataIsReady(sbuf: CMSampleBufferRef) -> Boolean;

    pub fn CMSampleBufferGetDataBuffer(sbuf: CMSampleBufferRef) -> CMBlockBufferRef;

    pub fn CMSampleBufferGetFormatDescription(sbuf: CMSampleBufferRef) -> CMFormatDescriptionRef;

    pub fn CMSampleBufferGetSampleAttachmentsArray(
        sbuf: CMSampleBufferRef,
        createIfNecessary: Boolean,
    ) -> CFArrayRef;

    pub fn CMBlockBufferGetDataPointer(
        theBuffer: CMBlockBufferRef,
        offset: usize,
        lengthAtOffsetOut: *mut usize,
        totalLengthOut: *mut usize,
        dataPointerOut: *mut *mut c_void,
    ) -> OSStatus;

    pub fn CMBlockBufferGetDataLength(theBuffer: CMBlockBufferRef) -> usize;

    pub fn CMBlockBufferCopyDataBytes(
        theSourceBuffer: CMBlockBufferRef,
        offsetToData: usize,
        dataLength: usize,
        destination: *mut c_void,
    ) -> OSStatus;

    pub fn CMVideoFormatDescriptionGetH264ParameterSetAtIndex(
        videoDesc: CMFormatDescriptionRef,
        parameterSetIndex: usize,
        parameterSetPointerOut: *mut *const u8,
        parameterSetSizeOut: *mut usize,
        parameterSetCountOut: *mut usize,
        NALUnitHeaderLengthOut: *mut i32,
    ) -> OSStatus;

    pub fn CMVideoFormatDescriptionGetHEVCParameterSetAtIndex(
        videoDesc: CMFormatDescriptionRef,
        parameterSetIndex: usize,
        parameterSetPointerOut: *mut *const u8,
        parameterSetSizeOut: *mut usize,
        parameterSetCountOut: *mut usize,
        NALUnitHeaderLengthOut: *mut i32,
    ) -> OSStatus;
}

// ============================================================================
// Safe Rust Wrappers
// ============================================================================

/// Owned CVPixelBuffer
pub struct CVPixelBuffer {
    inner: CVPixelBufferRef,
}

impl CVPixelBuffer {
    pub fn new(width: u32, height: u32, format: OSType) -> Result<Self, OSStatus> {
        unsafe {
            let mut pixel_buffer: CVPixelBufferRef = ptr::null_mut();
            let status = CVPixelBufferCreate(
                ptr::null(), // kCFAllocatorDefault
                width as usize,
                height as usize,
                format,
                ptr::null(),
                &mut pixel_buffer,
            );

            if status != noErr || pixel_buffer.is_null() {
                return Err(status);
            }

            Ok(Self { inner: pixel_buffer })
        }
    }

    /// Copy tightly sized rows into the buffer, honoring its own row stride
    ///
    /// `rows` yields at most `height` rows of `width * 4` bytes each.
    pub fn fill_rows<'a, I>(&self, rows: I) -> Result<(), OSStatus>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        unsafe {
            let status = CVPixelBufferLockBaseAddress(self.inner, 0);
            if status != noErr {
                return Err(status);
            }

            let base = CVPixelBufferGetBaseAddress(self.inner) as *mut u8;
            let stride = CVPixelBufferGetBytesPerRow(self.inner);
            let height = CVPixelBufferGetHeight(self.inner);

            if !base.is_null() {
                for (y, row) in rows.into_iter().take(height).enumerate() {
                    let len = row.len().min(stride);
                    ptr::copy_nonoverlapping(row.as_ptr(), base.add(y * stride), len);
                }
            }

            let status = CVPixelBufferUnlockBaseAddress(self.inner, 0);
            if base.is_null() {
                return Err(kVTParameterErr);
            }
            if status != noErr {
                return Err(status);
            }
        }
        Ok(())
    }

    pub fn as_raw(&self) -> CVPixelBufferRef {
        self.inner
    }

    pub fn width(&self) -> usize {
        unsafe { CVPixelBufferGetWidth(self.inner) }
    }

    pub fn height(&self) -> usize {
        unsafe { CVPixelBufferGetHeight(self.inner) }
    }
}

impl Drop for CVPixelBuffer {
    fn drop(&mut self) {
        unsafe {
            if !self.inner.is_null() {
                CVPixelBufferRelease(self.inner);
            }
        }
    }
}

// ============================================================================
// Sample Buffer Access
// ============================================================================

/// Whether a compressed sample is a sync point
///
/// A sample without attachments, or whose first attachment dictionary lacks
/// `NotSync`, is a keyframe.
pub unsafe fn is_sync_sample(sample_buffer: CMSampleBufferRef) -> bool {
    let attachments = CMSampleBufferGetSampleAttachmentsArray(sample_buffer, 0);
    if attachments.is_null() || CFArrayGetCount(attachments) == 0 {
        return true;
    }

    let dict = CFArrayGetValueAtIndex(attachments, 0) as CFDictionaryRef;
    if dict.is_null() {
        return true;
    }

    let key = not_sync_key();
    CFDictionaryContainsKey(dict, key.as_concrete_TypeRef() as *const c_void) == 0
}

/// Copy one parameter set out of a video format description
pub unsafe fn parameter_set_at(
    format: CMFormatDescriptionRef,
    hevc: bool,
    index: usize,
) -> Result<Vec<u8>, OSStatus> {
    if format.is_null() {
        return Err(kCMFormatDescriptionError_InvalidParameter);
    }

    let mut pointer: *const u8 = ptr::null();
    let mut size: usize = 0;
    let status = if hevc {
        CMVideoFormatDescriptionGetHEVCParameterSetAtIndex(
            format,
            index,
            &mut pointer,
            &mut size,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    } else {
        CMVideoFormatDescriptionGetH264ParameterSetAtIndex(
            format,
            index,
            &mut pointer,
            &mut size,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };

    if status != noErr {
        return Err(status);
    }
    if pointer.is_null() {
        return Err(kCMFormatDescriptionError_InvalidParameter);
    }

    Ok(std::slice::from_raw_parts(pointer, size).to_vec())
}

/// Contiguous view of a block buffer's bytes, if it has one
///
/// The slice borrows the block buffer's memory and is only valid while the
/// owning sample buffer is.
pub unsafe fn block_buffer_contiguous<'a>(block_buffer: CMBlockBufferRef) -> Option<&'a [u8]> {
    let total_length = CMBlockBufferGetDataLength(block_buffer);
    let mut data_pointer: *mut c_void = ptr::null_mut();
    let mut length_at_offset: usize = 0;
    let mut total_length_out: usize = 0;

    let status = CMBlockBufferGetDataPointer(
        block_buffer,
        0,
        &mut length_at_offset,
        &mut total_length_out,
        &mut data_pointer,
    );

    if status != noErr || data_pointer.is_null() || length_at_offset < total_length {
        return None;
    }

    Some(std::slice::from_raw_parts(data_pointer as *const u8, total_length))
}

/// Copy every byte of a (possibly fragmented) block buffer
pub unsafe fn block_buffer_copy(block_buffer: CMBlockBufferRef) -> Result<Vec<u8>, OSStatus> {
    let total_length = CMBlockBufferGetDataLength(block_buffer);
    let mut data = vec![0u8; total_length];

    let status = CMBlockBufferCopyDataBytes(
        block_buffer,
        0,
        total_length,
        data.as_mut_ptr() as *mut c_void,
    );
    if status != noErr {
        return Err(status);
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmtime_creation() {
        let time = CMTime::new(100, 30);
        assert_eq!(time.value, 100);
        assert_eq!(time.timescale, 30);
        assert_eq!(time.flags, 1);
        assert_eq!(CMTime::invalid().flags, 0);
    }

    #[test]
    fn test_codec_fourccs() {
        assert_eq!(&kCMVideoCodecType_H264.to_be_bytes(), b"avc1");
        assert_eq!(&kCMVideoCodecType_HEVC.to_be_bytes(), b"hvc1");
        assert_eq!(&kCVPixelFormatType_32BGRA.to_be_bytes(), b"BGRA");
    }

    #[test]
    fn test_bgra_pixel_buffer() {
        let buffer = CVPixelBuffer::new(64, 32, kCVPixelFormatType_32BGRA).unwrap();
        assert_eq!(buffer.width(), 64);
        assert_eq!(buffer.height(), 32);

        let row = vec![0x7Fu8; 64 * 4];
        let rows = std::iter::repeat(row.as_slice()).take(32);
        assert!(buffer.fill_rows(rows).is_ok());
    }
}
