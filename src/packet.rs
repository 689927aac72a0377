/*!
 * Packet Framer
 *
 * Serializes compressed units into the wire format and hands each packet to
 * the caller's sink on a single delivery queue.
 *
 * Header packet: `[vpsLen vps]? spsLen sps ppsLen pps`
 * Body packet:   `dataLen data` (one NAL unit, no start code)
 *
 * Every length field is 4 bytes in the configured `LengthOrder`.
 */

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ConfigError, PacketError};
use crate::queue::SerialQueue;
use crate::stats::PipelineStats;
use crate::video::{CompressedUnit, ParameterSets};

/// Size of every wire length field
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Byte order of wire length fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthOrder {
    #[default]
    Little,
    Big,
}

impl LengthOrder {
    fn put(&self, buf: &mut BytesMut, len: u32) {
        match self {
            LengthOrder::Little => buf.put_u32_le(len),
            LengthOrder::Big => buf.put_u32(len),
        }
    }
}

impl FromStr for LengthOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(LengthOrder::Little),
            "big" | "be" => Ok(LengthOrder::Big),
            _ => Err(ConfigError::LengthOrder(s.to_string())),
        }
    }
}

/// Kind of wire packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Parameter sets of a keyframe
    Header,
    /// One NAL unit
    Body,
}

/// One serialized wire packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub kind: PacketKind,
    pub bytes: Bytes,
}

impl FramedPacket {
    /// Build a header packet; the VPS segment is written only when present
    pub fn header(sets: &ParameterSets, order: LengthOrder) -> Result<Self, PacketError> {
        let mut segments: Vec<(&'static str, &[u8])> = Vec::with_capacity(3);
        if let Some(vps) = &sets.vps {
            segments.push(("vps", vps.as_ref()));
        }
        segments.push(("sps", sets.sps.as_ref()));
        segments.push(("pps", sets.pps.as_ref()));

        let total = segments
            .iter()
            .map(|(_, s)| LENGTH_FIELD_SIZE + s.len())
            .sum();
        let mut buf = BytesMut::with_capacity(total);
        for (segment, bytes) in segments {
            put_segment(&mut buf, segment, bytes, order)?;
        }

        Ok(Self {
            kind: PacketKind::Header,
            bytes: buf.freeze(),
        })
    }

    /// Build a body packet around one NAL unit
    pub fn body(unit: &[u8], order: LengthOrder) -> Result<Self, PacketError> {
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + unit.len());
        put_segment(&mut buf, "payload", unit, order)?;
        Ok(Self {
            kind: PacketKind::Body,
            bytes: buf.freeze(),
        })
    }

    /// Serialize whichever packet a compressed unit maps to
    pub fn from_unit(unit: &CompressedUnit, order: LengthOrder) -> Result<Self, PacketError> {
        match unit {
            CompressedUnit::ParameterSets(sets) => Self::header(sets, order),
            CompressedUnit::Payload(data) => Self::body(data, order),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }
}

fn put_segment(
    buf: &mut BytesMut,
    segment: &'static str,
    bytes: &[u8],
    order: LengthOrder,
) -> Result<(), PacketError> {
    let len = u32::try_from(bytes.len()).map_err(|_| PacketError::TooLarge {
        segment,
        len: bytes.len(),
    })?;
    order.put(buf, len);
    buf.put_slice(bytes);
    Ok(())
}

/// Destination for serialized packets
///
/// Called once per packet, in order, from the delivery queue thread. The
/// slice is only valid for the duration of the call.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, packet: &[u8]);
}

impl<F> PacketSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_packet(&self, packet: &[u8]) {
        self(packet)
    }
}

/// Serializes compressed units and delivers them on a serial queue
pub struct PacketFramer {
    sink: Arc<dyn PacketSink>,
    order: LengthOrder,
    delivery_queue: SerialQueue,
    stats: Arc<PipelineStats>,
}

impl PacketFramer {
    pub fn new(
        sink: Arc<dyn PacketSink>,
        order: LengthOrder,
        stats: Arc<PipelineStats>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            sink,
            order,
            delivery_queue: SerialQueue::new("queue.packet.delivery")?,
            stats,
        })
    }

    /// Queue one unit for serialization and delivery
    ///
    /// Returns immediately; the sink runs later on the delivery queue.
    pub fn publish(&self, unit: CompressedUnit) {
        let sink = self.sink.clone();
        let order = self.order;
        let stats = self.stats.clone();

        let queued = self.delivery_queue.dispatch(move || {
            let packet = match FramedPacket::from_unit(&unit, order) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Dropping unframeable unit: {}", e);
                    stats.malformed_unit();
                    return;
                }
            };

            sink.on_packet(&packet.bytes);

            match packet.kind {
                PacketKind::Header => stats.header_delivered(packet.len()),
                PacketKind::Body => stats.body_delivered(packet.len()),
            }
        });

        if !queued {
            debug!("Packet framer drained, unit discarded");
        }
    }

    /// Deliver everything queued, then stop accepting units
    pub fn drain(&self) {
        self.delivery_queue.drain();
    }
}
