/*!
 * Video Encoding Module
 *
 * Hardware H.264/HEVC encoding of captured frames and demultiplexing of the
 * encoder's length-prefixed output into individual NAL units.
 */

pub mod encoder;
pub mod frame;
pub mod nal;

#[cfg(target_os = "macos")]
pub mod videotoolbox;
#[cfg(target_os = "macos")]
pub mod videotoolbox_ffi;

pub use encoder::{
    create_encoder, CompressedUnit, CompressionSession, EncodeInfoFlags, EncodedSample,
    EncoderConfig, EncoderOutput, EncoderProperty, EncoderSession, HardwareEncoder,
    OutputHandler, ParameterSets, UnitHandler, UnsupportedEncoder,
};
pub use frame::{MediaTime, PixelFormat, RawFrame};
pub use nal::LengthPrefixedUnits;

use serde::{Deserialize, Serialize};

/// Video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// H.264/AVC codec (widely supported)
    H264,
    /// H.265/HEVC codec; its headers carry a VPS
    H265,
}

impl Codec {
    /// Whether keyframe headers carry a video parameter set
    pub fn has_vps(&self) -> bool {
        matches!(self, Codec::H265)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
        }
    }
}

/// Encoder profile and level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileLevel {
    /// Baseline profile, level 5.2 (default)
    H264Baseline52,
    H264BaselineAuto,
    H264MainAuto,
    H264HighAuto,
    HevcMainAuto,
}

impl ProfileLevel {
    /// VideoToolbox profile-level identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileLevel::H264Baseline52 => "H264_Baseline_5_2",
            ProfileLevel::H264BaselineAuto => "H264_Baseline_AutoLevel",
            ProfileLevel::H264MainAuto => "H264_Main_AutoLevel",
            ProfileLevel::H264HighAuto => "H264_High_AutoLevel",
            ProfileLevel::HevcMainAuto => "HEVC_Main_AutoLevel",
        }
    }

    /// Codec this profile belongs to
    pub fn codec(&self) -> Codec {
        match self {
            ProfileLevel::HevcMainAuto => Codec::H265,
            _ => Codec::H264,
        }
    }
}
