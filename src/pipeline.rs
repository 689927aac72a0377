/*!
 * Pipeline Controller
 *
 * Composes capture, encoding and packet framing into one pipeline that
 * streams length-prefixed H.264/HEVC packets to a caller-supplied sink.
 *
 * Construction is all-or-nothing. Teardown stops capture and joins its
 * thread, drains and completes the encoder, then drains packet delivery, so
 * every frame captured before `destroy` reaches the sink before it returns.
 */

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::capture::{self, CaptureConfig, CaptureSession, FrameHandler, ScreenProvider};
use crate::config::PipelineOptions;
use crate::error::PipelineError;
use crate::packet::{PacketFramer, PacketSink};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::video::{self, CompressedUnit, EncoderConfig, EncoderSession, HardwareEncoder, RawFrame, UnitHandler};

/// Platform services a pipeline is built from
pub struct Backends {
    pub screen: Box<dyn ScreenProvider>,
    pub encoder: Box<dyn HardwareEncoder>,
}

impl Backends {
    pub fn new(screen: Box<dyn ScreenProvider>, encoder: Box<dyn HardwareEncoder>) -> Self {
        Self { screen, encoder }
    }

    /// Display capture and hardware encoder for this platform
    pub fn platform() -> Self {
        Self::new(capture::create_screen_provider(), video::create_encoder())
    }
}

/// One capture → encode → packet pipeline
pub struct Pipeline {
    id: Uuid,
    capture: Option<CaptureSession>,
    encoder: Arc<EncoderSession>,
    framer: Arc<PacketFramer>,
    stats: Arc<PipelineStats>,
    destroyed: bool,
}

impl Pipeline {
    /// Build every stage; nothing runs until `start`
    pub fn create(
        sink: Arc<dyn PacketSink>,
        options: PipelineOptions,
        backends: &Backends,
    ) -> Result<Self, PipelineError> {
        options.validate()?;

        let id = Uuid::new_v4();
        info!(
            "Creating pipeline {}: {}x{} @ {} fps, {} lengths {:?}",
            id,
            options.width,
            options.height,
            options.fps,
            options.codec.name(),
            options.length_order
        );

        let stats = Arc::new(PipelineStats::new());

        let framer = Arc::new(
            PacketFramer::new(sink, options.length_order, stats.clone())
                .map_err(PipelineError::Delivery)?,
        );

        let units: UnitHandler = {
            let framer = framer.clone();
            Arc::new(move |unit: CompressedUnit| framer.publish(unit))
        };
        let encoder = Arc::new(EncoderSession::new(
            EncoderConfig::from_options(&options),
            backends.encoder.as_ref(),
            units,
            stats.clone(),
        )?);

        let handler: FrameHandler = {
            let encoder = encoder.clone();
            Arc::new(move |frame: RawFrame| encoder.submit(frame))
        };
        let capture = CaptureSession::new(
            backends.screen.as_ref(),
            CaptureConfig::from_options(&options),
            handler,
            stats.clone(),
        )?;

        info!("Pipeline {} created", id);

        Ok(Self {
            id,
            capture: Some(capture),
            encoder,
            framer,
            stats,
            destroyed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Begin capture, encode and delivery; no-op if already running
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if let Some(capture) = self.capture.as_mut() {
            capture.start()?;
        }
        Ok(())
    }

    /// Halt capture; frames already captured still flow to the sink
    pub fn stop(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.capture.as_ref().map_or(false, |c| c.is_running())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Drain everything in flight to the sink and release the pipeline
    pub fn destroy(mut self) -> StatsSnapshot {
        self.teardown();
        self.stats.snapshot()
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        debug!("Pipeline {} capture released", self.id);

        self.encoder.shutdown();
        self.framer.drain();

        info!(
            "Pipeline {} destroyed: {}",
            self.id,
            serde_json::to_string(&self.stats.snapshot()).unwrap_or_default()
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}
