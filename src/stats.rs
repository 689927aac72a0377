//! Pipeline counters.
//!
//! Every stage bumps relaxed atomics; `snapshot()` gives a consistent-enough
//! view for logging and for the server's per-connection summary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by every stage of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    frames_skipped: AtomicU64,
    frames_submitted: AtomicU64,
    frames_rejected: AtomicU64,
    outputs_dropped: AtomicU64,
    malformed_units: AtomicU64,
    header_packets: AtomicU64,
    body_packets: AtomicU64,
    bytes_delivered: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames produced by the capture source
    pub frames_captured: u64,
    /// Capture ticks skipped because the source fell behind
    pub frames_skipped: u64,
    /// Frames handed to the hardware encoder
    pub frames_submitted: u64,
    /// Frames the encoder refused
    pub frames_rejected: u64,
    /// Encoder outputs dropped (error status, dropped flag, empty buffer)
    pub outputs_dropped: u64,
    /// Keyframe headers or payload containers that could not be read
    pub malformed_units: u64,
    pub header_packets: u64,
    pub body_packets: u64,
    /// Wire bytes handed to the sink, length prefixes included
    pub bytes_delivered: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_skipped(&self, count: u64) {
        self.frames_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn frame_submitted(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn output_dropped(&self) {
        self.outputs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_unit(&self) {
        self.malformed_units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn header_delivered(&self, bytes: usize) {
        self.header_packets.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn body_delivered(&self, bytes: usize) {
        self.body_packets.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            outputs_dropped: self.outputs_dropped.load(Ordering::Relaxed),
            malformed_units: self.malformed_units.load(Ordering::Relaxed),
            header_packets: self.header_packets.load(Ordering::Relaxed),
            body_packets: self.body_packets.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_start_at_zero() {
        let stats = PipelineStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_delivery_counts_bytes() {
        let stats = PipelineStats::new();
        stats.header_delivered(20);
        stats.body_delivered(104);
        stats.body_delivered(8);

        let snap = stats.snapshot();
        assert_eq!(snap.header_packets, 1);
        assert_eq!(snap.body_packets, 2);
        assert_eq!(snap.bytes_delivered, 132);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = PipelineStats::new();
        stats.frame_captured();
        stats.frames_skipped(3);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"frames_captured\":1"));
        assert!(json.contains("\"frames_skipped\":3"));
    }
}
