/*!
 * Test Doubles
 *
 * A scriptable hardware encoder and a manually driven screen source, so the
 * pipeline can be exercised on any host.
 */

use bytes::Bytes;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::capture::{CaptureConfig, FrameHandler, ScreenProvider, ScreenSource};
use crate::error::{CaptureError, EncoderError, OsStatus};
use crate::queue::SerialQueue;
use crate::stats::PipelineStats;
use crate::video::{
    Codec, CompressionSession, EncodeInfoFlags, EncodedSample, EncoderConfig, EncoderOutput,
    EncoderProperty, HardwareEncoder, MediaTime, OutputHandler, ParameterSets, RawFrame,
};

/// Serialize NAL units as a 4-byte big-endian length-prefixed container
pub fn avcc(units: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        out.extend_from_slice(unit);
    }
    out
}

/// In-memory compressed sample
#[derive(Debug, Clone)]
pub struct FakeSample {
    pub data: Option<Vec<u8>>,
    pub ready: bool,
    pub sync: bool,
    pub vps: Bytes,
    pub sps: Bytes,
    pub pps: Bytes,
    /// Non-zero makes parameter set extraction fail with this status
    pub parameter_status: OsStatus,
}

impl FakeSample {
    pub fn keyframe(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            ready: true,
            sync: true,
            vps: Bytes::from_static(&[0x40, 0x01, 0x0C, 0x01]),
            sps: Bytes::from_static(&[0x67, 0x42, 0xC0, 0x34, 0x8C]),
            pps: Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            parameter_status: 0,
        }
    }

    pub fn delta(data: Vec<u8>) -> Self {
        Self {
            sync: false,
            ..Self::keyframe(data)
        }
    }
}

impl EncodedSample for FakeSample {
    fn is_data_ready(&self) -> bool {
        self.ready
    }

    fn is_sync(&self) -> bool {
        self.sync
    }

    fn parameter_sets(&self, codec: Codec) -> Result<ParameterSets, OsStatus> {
        if self.parameter_status != 0 {
            return Err(self.parameter_status);
        }
        Ok(ParameterSets {
            vps: codec.has_vps().then(|| self.vps.clone()),
            sps: self.sps.clone(),
            pps: self.pps.clone(),
        })
    }

    fn data(&self) -> Option<Cow<'_, [u8]>> {
        self.data.as_deref().map(Cow::Borrowed)
    }
}

/// Everything the fake encoder observed
#[derive(Debug, Clone, Default)]
pub struct FakeEncoderState {
    pub properties: Vec<EncoderProperty>,
    pub prepared: bool,
    pub completed: bool,
    pub invalidated: bool,
    /// Presentation timestamps of accepted frames, in submission order
    pub submitted: Vec<MediaTime>,
}

#[derive(Debug, Clone, Default)]
struct FakeScript {
    fail_property_at: Option<usize>,
    fail_prepare: bool,
    keyframe_every: Option<u64>,
    reject: HashSet<u64>,
}

/// Scriptable `HardwareEncoder`
///
/// Each accepted frame becomes one payload NAL unit `[0x65|0x41, seq(8 BE)]`
/// emitted asynchronously on the fake's own output thread. Keyframes come
/// every `keyframe_every` accepted frames (default: the configured maximum
/// keyframe interval).
#[derive(Clone, Default)]
pub struct FakeEncoder {
    script: FakeScript,
    state: Arc<Mutex<FakeEncoderState>>,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_property_at(mut self, index: usize) -> Self {
        self.script.fail_property_at = Some(index);
        self
    }

    pub fn fail_prepare(mut self) -> Self {
        self.script.fail_prepare = true;
        self
    }

    pub fn keyframe_every(mut self, frames: u64) -> Self {
        self.script.keyframe_every = Some(frames);
        self
    }

    /// Refuse the frame with this sequence number
    pub fn reject_frame(mut self, sequence: u64) -> Self {
        self.script.reject.insert(sequence);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeEncoderState> {
        self.state.lock().unwrap()
    }

    /// Sequence number carried by a payload this encoder produced
    pub fn frame_index(payload: &[u8]) -> u64 {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&payload[1..9]);
        u64::from_be_bytes(seq)
    }
}

impl HardwareEncoder for FakeEncoder {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create_session(
        &self,
        config: &EncoderConfig,
        output: OutputHandler,
    ) -> Result<Box<dyn CompressionSession>, EncoderError> {
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            keyframe_every: self
                .script
                .keyframe_every
                .unwrap_or(config.max_keyframe_interval as u64)
                .max(1),
            state: self.state.clone(),
            output,
            output_queue: SerialQueue::new("fake.encoder.output")?,
            accepted: AtomicU64::new(0),
            invalidated: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct FakeSession {
    script: FakeScript,
    keyframe_every: u64,
    state: Arc<Mutex<FakeEncoderState>>,
    output: OutputHandler,
    output_queue: SerialQueue,
    accepted: AtomicU64,
    invalidated: Arc<AtomicBool>,
}

impl CompressionSession for FakeSession {
    fn set_property(&self, property: &EncoderProperty) -> Result<(), OsStatus> {
        let mut state = self.state.lock().unwrap();
        if self.script.fail_property_at == Some(state.properties.len()) {
            return Err(-12900);
        }
        state.properties.push(*property);
        Ok(())
    }

    fn prepare_to_encode(&self) -> Result<(), OsStatus> {
        if self.script.fail_prepare {
            return Err(-12903);
        }
        self.state.lock().unwrap().prepared = true;
        Ok(())
    }

    fn encode_frame(&self, frame: &RawFrame) -> Result<(), OsStatus> {
        if self.script.reject.contains(&frame.sequence) {
            return Err(-12902);
        }
        self.state.lock().unwrap().submitted.push(frame.pts);

        let index = self.accepted.fetch_add(1, Ordering::SeqCst);
        let sync = index % self.keyframe_every == 0;
        let mut nal = vec![if sync { 0x65 } else { 0x41 }];
        nal.extend_from_slice(&frame.sequence.to_be_bytes());

        let sample = if sync {
            FakeSample::keyframe(avcc(&[nal.as_slice()]))
        } else {
            FakeSample::delta(avcc(&[nal.as_slice()]))
        };

        let output = self.output.clone();
        let invalidated = self.invalidated.clone();
        self.output_queue.dispatch(move || {
            if invalidated.load(Ordering::SeqCst) {
                return;
            }
            output(EncoderOutput {
                status: 0,
                flags: EncodeInfoFlags(EncodeInfoFlags::ASYNCHRONOUS),
                sample: Some(&sample),
            });
        });
        Ok(())
    }

    fn complete_frames(&self) -> Result<(), OsStatus> {
        self.output_queue.drain();
        self.state.lock().unwrap().completed = true;
        Ok(())
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.output_queue.drain();
        self.state.lock().unwrap().invalidated = true;
    }
}

#[derive(Default)]
struct ManualState {
    handler: Option<FrameHandler>,
    running: bool,
    starts: u32,
    stops: u32,
}

/// Screen provider whose frames are pushed by the test
#[derive(Clone, Default)]
pub struct ManualScreen {
    state: Arc<Mutex<ManualState>>,
    unavailable: bool,
}

impl ManualScreen {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that fails to acquire the display
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Deliver a 4x4 frame with this sequence number if the source is running
    ///
    /// Runs the handler on the calling thread, like a capture delivery thread.
    pub fn inject(&self, sequence: u64) -> bool {
        let handler = {
            let state = self.state.lock().unwrap();
            match (&state.handler, state.running) {
                (Some(handler), true) => handler.clone(),
                _ => return false,
            }
        };

        handler(RawFrame::bgra(
            Bytes::from(vec![0x20u8; 4 * 4 * 4]),
            4,
            4,
            MediaTime::frame(sequence, 30),
            MediaTime::frame_duration(30),
            sequence,
        ));
        true
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().unwrap().starts
    }

    pub fn stop_count(&self) -> u32 {
        self.state.lock().unwrap().stops
    }
}

impl ScreenProvider for ManualScreen {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn open_primary(
        &self,
        _config: &CaptureConfig,
        handler: FrameHandler,
        _stats: Arc<PipelineStats>,
    ) -> Result<Box<dyn ScreenSource>, CaptureError> {
        if self.unavailable {
            return Err(CaptureError::SourceUnavailable {
                reason: "no display attached".to_string(),
            });
        }
        self.state.lock().unwrap().handler = Some(handler);
        Ok(Box::new(ManualSource {
            state: self.state.clone(),
        }))
    }
}

struct ManualSource {
    state: Arc<Mutex<ManualState>>,
}

impl ScreenSource for ManualSource {
    fn start_running(&mut self) -> Result<(), CaptureError> {
        let mut state = self.state.lock().unwrap();
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    fn stop_running(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.stops += 1;
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

impl Drop for ManualSource {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.handler = None;
    }
}
