/*!
 * VideoToolbox Hardware Encoder
 *
 * `HardwareEncoder` backed by VTCompressionSession. Output arrives on a
 * VideoToolbox thread through `compression_output_callback`, which wraps the
 * CMSampleBuffer as an `EncodedSample` for the duration of the call.
 */

#![cfg(target_os = "macos")]

use bytes::Bytes;
use core_foundation::array::CFArray;
use core_foundation::base::{CFRelease, CFType, CFTypeRef, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use std::borrow::Cow;
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use super::encoder::{
    CompressionSession, EncodeInfoFlags, EncodedSample, EncoderConfig, EncoderOutput,
    EncoderProperty, HardwareEncoder, OutputHandler, ParameterSets,
};
use super::frame::RawFrame;
use super::videotoolbox_ffi::*;
use super::Codec;
use crate::error::{EncoderError, OsStatus};

/// VideoToolbox encoder factory
pub struct VideoToolboxEncoder;

impl HardwareEncoder for VideoToolboxEncoder {
    fn name(&self) -> &'static str {
        "VideoToolbox"
    }

    fn create_session(
        &self,
        config: &EncoderConfig,
        output: OutputHandler,
    ) -> Result<Box<dyn CompressionSession>, EncoderError> {
        let codec_type = match config.codec {
            Codec::H264 => kCMVideoCodecType_H264,
            Codec::H265 => kCMVideoCodecType_HEVC,
        };

        // Freed in Drop, after invalidate guarantees no further callbacks.
        let refcon = Box::into_raw(Box::new(output));

        let mut session: VTCompressionSessionRef = std::ptr::null_mut();
        let status = unsafe {
            VTCompressionSessionCreate(
                std::ptr::null(), // kCFAllocatorDefault
                config.width as i32,
                config.height as i32,
                codec_type,
                std::ptr::null(), // encoder specification (use default)
                std::ptr::null(), // source image buffer attributes
                std::ptr::null(), // compressed data allocator
                compression_output_callback,
                refcon as *mut c_void,
                &mut session,
            )
        };

        if status != noErr || session.is_null() {
            drop(unsafe { Box::from_raw(refcon) });
            error!("Failed to create VTCompressionSession: status={}", status);
            return Err(EncoderError::CreateFailed { status });
        }

        debug!("VTCompressionSession created ({})", config.codec.name());

        Ok(Box::new(VtCompressionSession {
            session,
            refcon,
            invalidated: AtomicBool::new(false),
        }))
    }
}

/// Live VTCompressionSession plus the handler its callback dereferences
struct VtCompressionSession {
    session: VTCompressionSessionRef,
    refcon: *mut OutputHandler,
    invalidated: AtomicBool,
}

// VTCompressionSession is thread-safe; the refcon is only read by callbacks.
unsafe impl Send for VtCompressionSession {}
unsafe impl Sync for VtCompressionSession {}

impl VtCompressionSession {
    fn property_value(property: &EncoderProperty) -> CFType {
        match *property {
            EncoderProperty::ProfileLevel(profile) => {
                CFString::from_static_string(profile.as_str()).as_CFType()
            }
            EncoderProperty::RealTime(flag) | EncoderProperty::AllowFrameReordering(flag) => {
                CFBoolean::from(flag).as_CFType()
            }
            EncoderProperty::MaxKeyFrameInterval(n) | EncoderProperty::ExpectedFrameRate(n) => {
                CFNumber::from(n as i32).as_CFType()
            }
            EncoderProperty::AverageBitRate(bps) => CFNumber::from(bps as i64).as_CFType(),
            EncoderProperty::DataRateLimits { bytes, seconds } => {
                CFArray::from_CFTypes(&[CFNumber::from(bytes as i64), CFNumber::from(seconds as i32)])
                    .as_CFType()
            }
        }
    }
}

impl CompressionSession for VtCompressionSession {
    fn set_property(&self, property: &EncoderProperty) -> Result<(), OsStatus> {
        let key = property_key(property.key());
        let value = Self::property_value(property);

        let status = unsafe {
            VTSessionSetProperty(
                self.session,
                key.as_concrete_TypeRef() as *const c_void,
                value.as_CFTypeRef() as *const c_void,
            )
        };

        if status != noErr {
            return Err(status);
        }
        Ok(())
    }

    fn prepare_to_encode(&self) -> Result<(), OsStatus> {
        let status = unsafe { VTCompressionSessionPrepareToEncodeFrames(self.session) };
        if status != noErr {
            return Err(status);
        }
        Ok(())
    }

    fn encode_frame(&self, frame: &RawFrame) -> Result<(), OsStatus> {
        if !frame.is_valid() {
            return Err(kVTParameterErr);
        }

        let pixel_buffer = CVPixelBuffer::new(frame.width, frame.height, kCVPixelFormatType_32BGRA)?;
        pixel_buffer.fill_rows((0..frame.height).filter_map(|y| frame.row(y)))?;

        let mut info_flags: u32 = 0;
        let status = unsafe {
            VTCompressionSessionEncodeFrame(
                self.session,
                pixel_buffer.as_raw(),
                CMTime::new(frame.pts.value, frame.pts.timescale),
                CMTime::new(frame.duration.value, frame.duration.timescale),
                std::ptr::null(),
                std::ptr::null_mut(),
                &mut info_flags,
            )
        };

        if status != noErr {
            return Err(status);
        }
        if info_flags & kVTEncodeInfo_FrameDropped != 0 {
            debug!("VideoToolbox dropped frame {} at submission", frame.sequence);
        }
        Ok(())
    }

    fn complete_frames(&self) -> Result<(), OsStatus> {
        let status = unsafe { VTCompressionSessionCompleteFrames(self.session, CMTime::invalid()) };
        if status != noErr {
            return Err(status);
        }
        Ok(())
    }

    fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            VTCompressionSessionInvalidate(self.session);
            CFRelease(self.session as CFTypeRef);
        }
        info!("VideoToolbox session invalidated");
    }
}

impl Drop for VtCompressionSession {
    fn drop(&mut self) {
        self.invalidate();
        drop(unsafe { Box::from_raw(self.refcon) });
    }
}

/// Borrowed view of a CMSampleBuffer inside the output callback
struct SampleBufferView {
    buffer: CMSampleBufferRef,
}

impl EncodedSample for SampleBufferView {
    fn is_data_ready(&self) -> bool {
        unsafe { CMSampleBufferDataIsReady(self.buffer) != 0 }
    }

    fn is_sync(&self) -> bool {
        unsafe { is_sync_sample(self.buffer) }
    }

    fn parameter_sets(&self, codec: Codec) -> Result<ParameterSets, OsStatus> {
        let hevc = codec.has_vps();
        unsafe {
            let format = CMSampleBufferGetFormatDescription(self.buffer);
            let first = if hevc { 1 } else { 0 };

            let vps = if hevc {
                Some(Bytes::from(parameter_set_at(format, true, 0)?))
            } else {
                None
            };
            let sps = Bytes::from(parameter_set_at(format, hevc, first)?);
            let pps = Bytes::from(parameter_set_at(format, hevc, first + 1)?);

            Ok(ParameterSets { vps, sps, pps })
        }
    }

    fn data(&self) -> Option<Cow<'_, [u8]>> {
        unsafe {
            let block_buffer = CMSampleBufferGetDataBuffer(self.buffer);
            if block_buffer.is_null() {
                return None;
            }

            if let Some(bytes) = block_buffer_contiguous(block_buffer) {
                return Some(Cow::Borrowed(bytes));
            }

            match block_buffer_copy(block_buffer) {
                Ok(bytes) => Some(Cow::Owned(bytes)),
                Err(status) => {
                    warn!("Failed to copy block buffer: status={}", status);
                    None
                }
            }
        }
    }
}

/// C callback function for VideoToolbox compression output
extern "C" fn compression_output_callback(
    output_callback_ref_con: *mut c_void,
    _source_frame_ref_con: *mut c_void,
    status: OSStatus,
    info_flags: u32,
    sample_buffer: CMSampleBufferRef,
) {
    if output_callback_ref_con.is_null() {
        return;
    }

    let handler = unsafe { &*(output_callback_ref_con as *const OutputHandler) };
    let view = (!sample_buffer.is_null()).then(|| SampleBufferView {
        buffer: sample_buffer,
    });

    let output = EncoderOutput {
        status,
        flags: EncodeInfoFlags(info_flags),
        sample: view.as_ref().map(|v| v as &dyn EncodedSample),
    };

    if catch_unwind(AssertUnwindSafe(|| handler(output))).is_err() {
        error!("Encoder output handler panicked");
    }
}
