/*!
 * Error Types
 *
 * Typed failures for the capture → encode → packet pipeline.
 * Construction failures are fatal to pipeline creation; everything that can
 * go wrong per frame is logged and dropped instead of surfacing here.
 */

use thiserror::Error;

/// Platform status code (`OSStatus` on macOS)
pub type OsStatus = i32;

/// Screen capture source failures
#[derive(Error, Debug)]
pub enum CaptureError {
    /// No primary display could be acquired (missing display or permission)
    #[error("primary display unavailable: {reason}")]
    SourceUnavailable { reason: String },

    /// The source exists but could not be attached to the capture session
    #[error("capture source could not be attached: {reason}")]
    AttachFailed { reason: String },

    #[error("capture worker failed to start: {0}")]
    Worker(#[from] std::io::Error),
}

/// Hardware encoder failures
#[derive(Error, Debug)]
pub enum EncoderError {
    /// No hardware encoder exists on this host
    #[error("hardware encoder unavailable on this platform")]
    Unavailable,

    #[error("compression session creation failed: status={status}")]
    CreateFailed { status: OsStatus },

    #[error("setting encoder property {property} failed: status={status}")]
    PropertyFailed { property: &'static str, status: OsStatus },

    #[error("preparing encoder failed: status={status}")]
    PrepareFailed { status: OsStatus },

    #[error("encode queue failed to start: {0}")]
    Worker(#[from] std::io::Error),
}

/// Invalid pipeline configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("profile {profile} cannot encode {codec}")]
    ProfileMismatch { profile: &'static str, codec: &'static str },

    #[error("unknown length order {0:?} (expected \"little\" or \"big\")")]
    LengthOrder(String),
}

/// Packet serialization failure
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    /// A segment does not fit a 4-byte length field
    #[error("{segment} of {len} bytes exceeds the 4-byte length field")]
    TooLarge { segment: &'static str, len: usize },
}

/// Pipeline construction failure
///
/// Returned by `Pipeline::create`; no partial pipeline exists when this is
/// produced.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("capture: {0}")]
    Capture(#[from] CaptureError),

    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),

    #[error("delivery queue failed to start: {0}")]
    Delivery(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_failure_message() {
        let err = EncoderError::PropertyFailed { property: "AverageBitRate", status: -12902 };
        assert_eq!(
            err.to_string(),
            "setting encoder property AverageBitRate failed: status=-12902"
        );
    }

    #[test]
    fn test_pipeline_error_wraps_sources() {
        let err: PipelineError = CaptureError::SourceUnavailable {
            reason: "no display".to_string(),
        }
        .into();
        assert!(matches!(err, PipelineError::Capture(_)));
        assert!(err.to_string().contains("no display"));
    }
}
