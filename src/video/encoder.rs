/*!
 * Video Encoder Module
 *
 * Owns the hardware compression session: applies the encoder configuration,
 * feeds it frames from a dedicated serial encode queue, and demultiplexes its
 * asynchronous output into parameter-set and NAL-unit payload units.
 *
 * The platform encoder sits behind `HardwareEncoder` / `CompressionSession`;
 * VideoToolbox is the implementation on macOS.
 */

use bytes::Bytes;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::frame::RawFrame;
use super::nal::LengthPrefixedUnits;
use super::{Codec, ProfileLevel};
use crate::config::PipelineOptions;
use crate::error::{EncoderError, OsStatus};
use crate::queue::SerialQueue;
use crate::stats::PipelineStats;

/// Multiplier from average bitrate to the one-second data rate ceiling
pub const DATA_RATE_LIMIT_FACTOR: u64 = 65;

/// Encoder configuration
///
/// Frame reordering is always disabled and real-time mode always enabled:
/// output order must equal submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Expected frames per second
    pub fps: u32,
    pub codec: Codec,
    pub profile_level: ProfileLevel,
    /// Keyframe interval (GOP size) in frames
    pub max_keyframe_interval: u32,
    average_bit_rate: Option<u64>,
    data_rate_limit: Option<u64>,
}

impl EncoderConfig {
    pub fn from_options(options: &PipelineOptions) -> Self {
        Self {
            width: options.width,
            height: options.height,
            fps: options.fps,
            codec: options.codec,
            profile_level: options.profile_level,
            max_keyframe_interval: options.max_keyframe_interval,
            average_bit_rate: options.average_bit_rate,
            data_rate_limit: options.data_rate_limit,
        }
    }

    /// Average bitrate in bits/s: `width * height * 3 * 4` unless overridden
    pub fn average_bit_rate(&self) -> u64 {
        self.average_bit_rate
            .unwrap_or(self.width as u64 * self.height as u64 * 3 * 4)
    }

    /// Bytes allowed per one-second window: `average * 65` unless overridden
    pub fn data_rate_limit(&self) -> u64 {
        self.data_rate_limit
            .unwrap_or(self.average_bit_rate() * DATA_RATE_LIMIT_FACTOR)
    }

    /// Every session property, in the order it is applied
    pub fn properties(&self) -> Vec<EncoderProperty> {
        vec![
            EncoderProperty::ProfileLevel(self.profile_level),
            EncoderProperty::RealTime(true),
            EncoderProperty::AllowFrameReordering(false),
            EncoderProperty::MaxKeyFrameInterval(self.max_keyframe_interval),
            EncoderProperty::ExpectedFrameRate(self.fps),
            EncoderProperty::AverageBitRate(self.average_bit_rate()),
            EncoderProperty::DataRateLimits {
                bytes: self.data_rate_limit(),
                seconds: 1,
            },
        ]
    }
}

/// One compression session property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderProperty {
    ProfileLevel(ProfileLevel),
    RealTime(bool),
    AllowFrameReordering(bool),
    MaxKeyFrameInterval(u32),
    ExpectedFrameRate(u32),
    AverageBitRate(u64),
    DataRateLimits { bytes: u64, seconds: u32 },
}

impl EncoderProperty {
    /// Property key name as VideoToolbox spells it
    pub fn key(&self) -> &'static str {
        match self {
            EncoderProperty::ProfileLevel(_) => "ProfileLevel",
            EncoderProperty::RealTime(_) => "RealTime",
            EncoderProperty::AllowFrameReordering(_) => "AllowFrameReordering",
            EncoderProperty::MaxKeyFrameInterval(_) => "MaxKeyFrameInterval",
            EncoderProperty::ExpectedFrameRate(_) => "ExpectedFrameRate",
            EncoderProperty::AverageBitRate(_) => "AverageBitRate",
            EncoderProperty::DataRateLimits { .. } => "DataRateLimits",
        }
    }
}

/// Stream parameter sets of one keyframe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    /// Video parameter set (HEVC only)
    pub vps: Option<Bytes>,
    pub sps: Bytes,
    pub pps: Bytes,
}

/// One unit of demultiplexed encoder output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressedUnit {
    /// Emitted once per keyframe, ahead of its payloads
    ParameterSets(ParameterSets),
    /// A single NAL unit, without its length prefix
    Payload(Bytes),
}

/// Encoder info flags attached to each output event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeInfoFlags(pub u32);

impl EncodeInfoFlags {
    pub const ASYNCHRONOUS: u32 = 1 << 0;
    pub const FRAME_DROPPED: u32 = 1 << 1;

    pub fn frame_dropped(&self) -> bool {
        self.0 & Self::FRAME_DROPPED != 0
    }
}

/// Read access to one compressed sample while the encoder callback runs
pub trait EncodedSample {
    /// Whether the sample's data has been fully written
    fn is_data_ready(&self) -> bool;

    /// Whether the sample is a synchronization point (keyframe/IDR)
    fn is_sync(&self) -> bool;

    /// Parameter sets from the sample's format description
    fn parameter_sets(&self, codec: Codec) -> Result<ParameterSets, OsStatus>;

    /// The length-prefixed access unit, or `None` if no buffer is attached
    fn data(&self) -> Option<Cow<'_, [u8]>>;
}

/// One event from the hardware encoder's output callback
pub struct EncoderOutput<'a> {
    pub status: OsStatus,
    pub flags: EncodeInfoFlags,
    pub sample: Option<&'a dyn EncodedSample>,
}

/// Receives encoder output on whatever thread the platform encoder uses
pub type OutputHandler = Arc<dyn Fn(EncoderOutput<'_>) + Send + Sync>;

/// Receives demultiplexed units
pub type UnitHandler = Arc<dyn Fn(CompressedUnit) + Send + Sync>;

/// A live platform compression session
pub trait CompressionSession: Send + Sync {
    fn set_property(&self, property: &EncoderProperty) -> Result<(), OsStatus>;

    fn prepare_to_encode(&self) -> Result<(), OsStatus>;

    /// Submit one frame; output arrives later through the `OutputHandler`
    fn encode_frame(&self, frame: &RawFrame) -> Result<(), OsStatus>;

    /// Block until every submitted frame has been emitted
    fn complete_frames(&self) -> Result<(), OsStatus>;

    /// Release the session; no output is emitted afterwards
    fn invalidate(&self);
}

/// Factory for platform compression sessions
pub trait HardwareEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_session(
        &self,
        config: &EncoderConfig,
        output: OutputHandler,
    ) -> Result<Box<dyn CompressionSession>, EncoderError>;
}

/// Stand-in for hosts without a hardware encoder
pub struct UnsupportedEncoder;

impl HardwareEncoder for UnsupportedEncoder {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn create_session(
        &self,
        _config: &EncoderConfig,
        _output: OutputHandler,
    ) -> Result<Box<dyn CompressionSession>, EncoderError> {
        Err(EncoderError::Unavailable)
    }
}

/// Hardware encoder for this platform
pub fn create_encoder() -> Box<dyn HardwareEncoder> {
    #[cfg(target_os = "macos")]
    {
        Box::new(super::videotoolbox::VideoToolboxEncoder)
    }

    #[cfg(not(target_os = "macos"))]
    {
        warn!("No hardware encoder on this platform");
        Box::new(UnsupportedEncoder)
    }
}

/// Split one encoder output event into compressed units
///
/// Error status, dropped frames, missing or unready buffers produce nothing.
/// Keyframes yield their parameter sets first; a failure to read them skips
/// only the header. Payload units follow in container order.
pub fn demux_output<F>(output: EncoderOutput<'_>, codec: Codec, stats: &PipelineStats, mut emit: F)
where
    F: FnMut(CompressedUnit),
{
    if output.status != 0 {
        warn!("Encoder output error: status={}", output.status);
        stats.output_dropped();
        return;
    }

    if output.flags.frame_dropped() {
        debug!("Encoder dropped a frame");
        stats.output_dropped();
        return;
    }

    let sample = match output.sample {
        Some(sample) => sample,
        None => {
            warn!("Encoder output carried no sample buffer");
            stats.output_dropped();
            return;
        }
    };

    if !sample.is_data_ready() {
        warn!("Encoder sample data not ready");
        stats.output_dropped();
        return;
    }

    if sample.is_sync() {
        match sample.parameter_sets(codec) {
            Ok(parameter_sets) => emit(CompressedUnit::ParameterSets(parameter_sets)),
            Err(status) => {
                warn!("Failed to read keyframe parameter sets: status={}", status);
                stats.malformed_unit();
            }
        }
    }

    let data = match sample.data() {
        Some(data) => data,
        None => {
            warn!("Encoder sample data unreadable, dropping its payload");
            stats.output_dropped();
            return;
        }
    };

    let buf = Bytes::copy_from_slice(&data);
    let mut units = LengthPrefixedUnits::new(&buf);
    for unit in units.by_ref() {
        emit(CompressedUnit::Payload(buf.slice_ref(unit)));
    }

    if units.is_truncated() {
        warn!(
            "NAL length prefix overruns access unit ({} bytes, {} unread)",
            buf.len(),
            units.remaining()
        );
        stats.malformed_unit();
    }
}

/// Hardware encoder session with a serial encode queue
pub struct EncoderSession {
    session: Arc<dyn CompressionSession>,
    encode_queue: SerialQueue,
    stats: Arc<PipelineStats>,
    closed: AtomicBool,
}

impl EncoderSession {
    /// Create, configure and prepare a compression session
    ///
    /// Any failure invalidates whatever was created and is returned as-is;
    /// there is no partially configured session.
    pub fn new(
        config: EncoderConfig,
        encoder: &dyn HardwareEncoder,
        units: UnitHandler,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, EncoderError> {
        info!(
            "Initializing {} encoder: {}x{} @ {} fps ({})",
            encoder.name(),
            config.width,
            config.height,
            config.fps,
            config.codec.name()
        );

        let codec = config.codec;
        let output_stats = stats.clone();
        let output: OutputHandler = Arc::new(move |event: EncoderOutput<'_>| {
            demux_output(event, codec, &output_stats, |unit| units(unit));
        });

        let session: Arc<dyn CompressionSession> =
            Arc::from(encoder.create_session(&config, output)?);

        if let Err(e) = Self::configure_session(session.as_ref(), &config) {
            session.invalidate();
            return Err(e);
        }

        let encode_queue = match SerialQueue::new("queue.video.encode") {
            Ok(queue) => queue,
            Err(e) => {
                session.invalidate();
                return Err(EncoderError::Worker(e));
            }
        };

        info!(
            "Encoder ready: bitrate={}bps, data_rate_limit={}B/s, keyframe_interval={}",
            config.average_bit_rate(),
            config.data_rate_limit(),
            config.max_keyframe_interval
        );

        Ok(Self {
            session,
            encode_queue,
            stats,
            closed: AtomicBool::new(false),
        })
    }

    /// Apply every property, then prepare to encode
    fn configure_session(
        session: &dyn CompressionSession,
        config: &EncoderConfig,
    ) -> Result<(), EncoderError> {
        for property in config.properties() {
            session.set_property(&property).map_err(|status| {
                error!("Setting {} = {:?} failed: status={}", property.key(), property, status);
                EncoderError::PropertyFailed {
                    property: property.key(),
                    status,
                }
            })?;
            debug!("Encoder property set: {:?}", property);
        }

        session.prepare_to_encode().map_err(|status| {
            error!("Preparing encoder failed: status={}", status);
            EncoderError::PrepareFailed { status }
        })
    }

    /// Queue a frame for encoding and return immediately
    ///
    /// A frame the encoder rejects is logged and dropped.
    pub fn submit(&self, frame: RawFrame) {
        let session = self.session.clone();
        let stats = self.stats.clone();

        let queued = self.encode_queue.dispatch(move || {
            match session.encode_frame(&frame) {
                Ok(()) => stats.frame_submitted(),
                Err(status) => {
                    warn!("Encoding frame {} failed: status={}", frame.sequence, status);
                    stats.frame_rejected();
                }
            }
        });

        if !queued {
            debug!("Encoder closed, frame not submitted");
        }
    }

    /// Drain queued frames, complete in-flight output, then invalidate
    ///
    /// Idempotent. Errors are logged and never stop teardown.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.encode_queue.drain();

        if let Err(status) = self.session.complete_frames() {
            error!("Completing outstanding frames failed: status={}", status);
        }
        self.session.invalidate();

        info!("Encoder session destroyed");
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
