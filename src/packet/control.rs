//! Payload layouts for the control packet types (`SPEC_FULL.md` §6 wire
//! format table). Each type's payload is encoded/decoded independently of
//! the shared header handled by `Packet`; dispatch between a full ACK and a
//! "light" ACK is by payload length, exactly as specified.

use crate::binary::{BinaryReader, BinaryWriter};
use crate::packet::CodecError;
use crate::seq::SequenceNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Extra fields a full ACK carries only when caused by the sync timer
/// (`causedBySync`, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckExtended {
    pub packet_receive_speed: i32,
    pub bandwidth: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub sub_seq: SequenceNumber,
    pub ack: SequenceNumber,
    pub rtt_us: i32,
    pub rtt_var_us: i32,
    pub recv_buffer_packets: i32,
    pub extended: Option<AckExtended>,
}

impl AckPayload {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        buf.write_u16_le(self.sub_seq.value());
        buf.write_u16_le(self.ack.value());
        buf.write_i32_le(self.rtt_us);
        buf.write_i32_le(self.rtt_var_us);
        buf.write_i32_le(self.recv_buffer_packets);
        if let Some(ext) = self.extended {
            buf.write_i32_le(ext.packet_receive_speed);
            buf.write_i32_le(ext.bandwidth);
        }
        buf
    }

    pub fn decode(mut data: Bytes) -> Result<Self, CodecError> {
        let sub_seq = SequenceNumber::new(data.read_u16_le()?);
        let ack = SequenceNumber::new(data.read_u16_le()?);
        let rtt_us = data.read_i32_le()?;
        let rtt_var_us = data.read_i32_le()?;
        let recv_buffer_packets = data.read_i32_le()?;
        let extended = if data.remaining() >= 8 {
            Some(AckExtended {
                packet_receive_speed: data.read_i32_le()?,
                bandwidth: data.read_i32_le()?,
            })
        } else {
            None
        };
        Ok(Self {
            sub_seq,
            ack,
            rtt_us,
            rtt_var_us,
            recv_buffer_packets,
            extended,
        })
    }
}

/// `ack` field only: a bare acknowledgment of the contiguous receive point,
/// with no RTT/flow-window payload attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckLightPayload {
    pub ack: SequenceNumber,
}

impl AckLightPayload {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2);
        buf.write_u16_le(self.ack.value());
        buf
    }

    pub fn decode(mut data: Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            ack: SequenceNumber::new(data.read_u16_le()?),
        })
    }

    /// A payload this short (and only this short) is a light ACK, per §4.5.
    pub fn matches_length(len: usize) -> bool {
        len == 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack2Payload {
    pub sub_seq: SequenceNumber,
}

impl Ack2Payload {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2);
        buf.write_u16_le(self.sub_seq.value());
        buf
    }

    pub fn decode(mut data: Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            sub_seq: SequenceNumber::new(data.read_u16_le()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakPayload {
    pub start: SequenceNumber,
    pub end: Option<SequenceNumber>,
}

impl NakPayload {
    pub fn singleton(seq: SequenceNumber) -> Self {
        Self {
            start: seq,
            end: None,
        }
    }

    pub fn range(start: SequenceNumber, end: SequenceNumber) -> Self {
        if start == end {
            Self::singleton(start)
        } else {
            Self {
                start,
                end: Some(end),
            }
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);
        buf.write_u16_le(self.start.value());
        if let Some(end) = self.end {
            buf.write_u16_le(end.value());
        }
        buf
    }

    pub fn decode(mut data: Bytes) -> Result<Self, CodecError> {
        let start = SequenceNumber::new(data.read_u16_le()?);
        let end = if data.remaining() >= 2 {
            Some(SequenceNumber::new(data.read_u16_le()?))
        } else {
            None
        };
        Ok(Self { start, end })
    }

    /// Inclusive `(low, high)` range this NAK covers, collapsing the
    /// singleton case.
    pub fn range_bounds(&self) -> (SequenceNumber, SequenceNumber) {
        (self.start, self.end.unwrap_or(self.start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ack_round_trips_without_extended_fields() {
        let payload = AckPayload {
            sub_seq: SequenceNumber::new(3),
            ack: SequenceNumber::new(100),
            rtt_us: 15_000,
            rtt_var_us: 2_000,
            recv_buffer_packets: i32::MAX,
            extended: None,
        };
        let decoded = AckPayload::decode(payload.encode().freeze()).unwrap();
        assert_eq!(payload, decoded);
        assert!(!AckLightPayload::matches_length(payload.encode().len()));
    }

    #[test]
    fn full_ack_round_trips_with_extended_fields() {
        let payload = AckPayload {
            sub_seq: SequenceNumber::new(3),
            ack: SequenceNumber::new(100),
            rtt_us: 15_000,
            rtt_var_us: 2_000,
            recv_buffer_packets: i32::MAX,
            extended: Some(AckExtended {
                packet_receive_speed: 5000,
                bandwidth: 12_000,
            }),
        };
        let decoded = AckPayload::decode(payload.encode().freeze()).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn light_ack_is_distinguished_by_length() {
        let payload = AckLightPayload {
            ack: SequenceNumber::new(55),
        };
        let encoded = payload.encode();
        assert!(AckLightPayload::matches_length(encoded.len()));
        assert_eq!(AckLightPayload::decode(encoded.freeze()).unwrap(), payload);
    }

    #[test]
    fn nak_singleton_omits_end_field() {
        let nak = NakPayload::singleton(SequenceNumber::new(25));
        assert_eq!(nak.encode().len(), 2);
        let decoded = NakPayload::decode(nak.encode().freeze()).unwrap();
        assert_eq!(decoded.range_bounds(), (SequenceNumber::new(25), SequenceNumber::new(25)));
    }

    #[test]
    fn nak_range_carries_both_bounds() {
        let nak = NakPayload::range(SequenceNumber::new(4), SequenceNumber::new(7));
        assert_eq!(nak.encode().len(), 4);
        let decoded = NakPayload::decode(nak.encode().freeze()).unwrap();
        assert_eq!(decoded.range_bounds(), (SequenceNumber::new(4), SequenceNumber::new(7)));
    }
}
