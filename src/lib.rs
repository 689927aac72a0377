/*!
 * Screencast Core Library
 *
 * Primary-display capture fed through a hardware H.264/HEVC encoder and
 * framed into length-prefixed packets for a caller-supplied sink.
 */

pub mod capture;
pub mod config;
pub mod error;
pub mod ffi;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod server;
pub mod stats;
pub mod video;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{PipelineOptions, ServerConfig};
pub use error::{CaptureError, ConfigError, EncoderError, PacketError, PipelineError};
pub use packet::{FramedPacket, LengthOrder, PacketKind, PacketSink};
pub use pipeline::{Backends, Pipeline};
pub use registry::{HandleRegistry, PipelineHandle};
pub use server::StreamServer;
pub use stats::StatsSnapshot;
pub use video::{Codec, ProfileLevel};
