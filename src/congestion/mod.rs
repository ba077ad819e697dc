//! Pluggable congestion-control policy interface (`SPEC_FULL.md` §4.6, §9).
//!
//! A small trait, held by `Connection` as `Box<dyn CongestionControl + Send>`
//! (dynamic polymorphism, per the design note in §9), so alternative
//! policies are swappable without touching `Connection` itself.

pub mod aimd;

use crate::seq::SequenceNumber;
use std::time::Duration;

/// Opaque policy consulted by `Connection` on every ACK and loss event.
/// Implementations mutate their own `packet_send_period`/`ack_interval`
/// state in response to `on_ack`/`on_loss`; `Connection` never inspects
/// anything but the four getters below.
pub trait CongestionControl: std::fmt::Debug {
    /// Periodicity of the sync tick.
    fn syn_interval(&self) -> Duration;

    /// Packet count threshold that triggers an intermediate ACK; `0`
    /// disables intermediate ACKs entirely.
    fn ack_interval(&self) -> u32;

    /// Current pacing interval between sent packets.
    fn packet_send_period(&self) -> Duration;

    /// `true` if `rto()` should be used instead of the RTT-based
    /// `estimatedTimeout()` formula.
    fn user_defined_rto(&self) -> bool;

    /// Fixed retransmission timeout, consulted only if `user_defined_rto()`.
    fn rto(&self) -> Duration;

    fn set_rtt(&mut self, rtt: Duration);
    fn set_receive_rate(&mut self, packets_per_sec: f64);
    fn set_bandwidth(&mut self, packets_per_sec: f64);
    fn set_send_current_sequence_number(&mut self, seq: SequenceNumber);

    fn on_ack(&mut self, ack: SequenceNumber);
    fn on_loss(&mut self, start: SequenceNumber, end: SequenceNumber);
}
