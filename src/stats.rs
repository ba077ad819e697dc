//! Per-connection counters (`SPEC_FULL.md` §3, §5, §7). Atomic so the
//! Receiver, Sender, and sync timer can each bump counters without taking
//! the Connection's mutex, matching "Stats counters: atomic" in §5.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_retransmitted: AtomicU64,
    pub acks_sent: AtomicU64,
    pub naks_sent: AtomicU64,
    pub timeout_naks_sent: AtomicU64,
    /// Malformed or unrecognized datagrams dropped without killing the
    /// connection (§7 "Decode error").
    pub bad_packets: AtomicU64,
    /// Consecutive socket send failures, surfaced to the owning Socket to
    /// judge peer reachability (§7 "Resource error").
    pub send_failures: AtomicU64,
    /// Well-formed but semantically invalid control fields (ACK beyond
    /// `sendQueue.currentSequenceNumber()`, an ACK2 sub-sequence never
    /// emitted): the offending field is dropped and the connection
    /// continues (§7 "Protocol violation").
    pub protocol_violations: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self) {
        self.packets_retransmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nak(&self) {
        self.naks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout_nak(&self) {
        self.timeout_naks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bad_packet(&self) {
        self.bad_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) -> u64 {
        self.send_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_send_success(&self) {
        self.send_failures.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn send_failures_reset_on_success() {
        let stats = Stats::new();
        assert_eq!(stats.record_send_failure(), 1);
        assert_eq!(stats.record_send_failure(), 2);
        stats.record_send_success();
        assert_eq!(stats.send_failures.load(Ordering::Relaxed), 0);
    }
}
