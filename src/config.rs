/*!
 * Configuration
 *
 * `PipelineOptions` describes one capture → encode → packet pipeline.
 * `ServerConfig` wraps it for the TCP streaming binary and layers an
 * optional JSON file and `SCREENCAST_*` environment variables on top of the
 * defaults.
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::packet::LengthOrder;
use crate::video::{Codec, ProfileLevel};

/// Default keyframe spacing in frames
pub const DEFAULT_MAX_KEYFRAME_INTERVAL: u32 = 120;

/// Options for a single pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Encoded width in pixels
    pub width: u32,
    /// Encoded height in pixels
    pub height: u32,
    /// Capture cadence and expected encoder frame rate
    pub fps: u32,
    pub codec: Codec,
    pub profile_level: ProfileLevel,
    /// Maximum distance between keyframes, in frames
    pub max_keyframe_interval: u32,
    /// Average bitrate override (bits/s); derived from geometry when unset
    pub average_bit_rate: Option<u64>,
    /// Data rate ceiling override (bytes per second); derived when unset
    pub data_rate_limit: Option<u64>,
    /// Byte order of the 4-byte length fields on the wire
    pub length_order: LengthOrder,
    /// Draw the cursor into captured frames
    pub shows_cursor: bool,
    /// Draw click indicators into captured frames
    pub shows_clicks: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            codec: Codec::H264,
            profile_level: ProfileLevel::H264Baseline52,
            max_keyframe_interval: DEFAULT_MAX_KEYFRAME_INTERVAL,
            average_bit_rate: None,
            data_rate_limit: None,
            length_order: LengthOrder::Little,
            shows_cursor: true,
            shows_clicks: true,
        }
    }
}

impl PipelineOptions {
    /// Options with the given geometry and everything else defaulted
    pub fn with_geometry(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            ..Default::default()
        }
    }

    /// Reject options no pipeline can run with
    ///
    /// Any non-zero geometry passes; the encoder decides what it accepts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.fps == 0 {
            return Err(ConfigError::Zero { field: "fps" });
        }
        if self.max_keyframe_interval == 0 {
            return Err(ConfigError::Zero { field: "max_keyframe_interval" });
        }
        if self.profile_level.codec() != self.codec {
            return Err(ConfigError::ProfileMismatch {
                profile: self.profile_level.as_str(),
                codec: self.codec.name(),
            });
        }
        Ok(())
    }
}

/// Streaming server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP listener binds to
    pub listen: SocketAddr,
    /// Pipeline created for every accepted connection
    pub pipeline: PipelineOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 18999)),
            pipeline: PipelineOptions::with_geometry(1920, 1080, 60),
        }
    }
}

impl ServerConfig {
    /// Defaults, then `$SCREENCAST_CONFIG` (JSON) if set, then env overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("SCREENCAST_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.pipeline.validate().context("Invalid pipeline configuration")?;

        info!("Server configuration: {}", serde_json::to_string(&config)?);
        Ok(config)
    }

    /// Read a JSON configuration file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config file {}", path.display());
        Ok(config)
    }

    /// Apply `SCREENCAST_*` overrides using `lookup` as the variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("SCREENCAST_LISTEN") {
            self.listen = listen
                .parse()
                .with_context(|| format!("SCREENCAST_LISTEN is not a socket address: {}", listen))?;
        }

        let numeric = [
            ("SCREENCAST_WIDTH", &mut self.pipeline.width),
            ("SCREENCAST_HEIGHT", &mut self.pipeline.height),
            ("SCREENCAST_FPS", &mut self.pipeline.fps),
        ];
        for (key, slot) in numeric {
            if let Some(value) = lookup(key) {
                *slot = value
                    .parse()
                    .with_context(|| format!("{} is not a number: {}", key, value))?;
            }
        }

        if let Some(order) = lookup("SCREENCAST_LENGTH_ORDER") {
            self.pipeline.length_order = order.parse()?;
        }

        Ok(())
    }
}
