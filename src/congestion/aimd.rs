//! Default AIMD congestion controller: slow-start cwnd growth until
//! `ssthresh`, linear growth in congestion avoidance, `ssthresh` halved and
//! cwnd collapsed on loss (`SPEC_FULL.md` §4.6).
//!
//! Grounded on the teacher's `SendWindow` congestion logic
//! (`src/raknet/reliability/send_window.rs`: `cwnd`, `ssthresh`,
//! `bytes_in_flight`, the Reno-like slow-start/congestion-avoidance branch
//! in `handle_ack`, and the ssthresh-halving fast-recovery branch in
//! `handle_nack`), translated from a byte-counted window to a packet-counted
//! one (`packetSendPeriod`, §4.4/§4.6) since this transport paces individual
//! packets rather than MTU-sized datagrams of many encapsulated messages.

use crate::congestion::CongestionControl;
use crate::seq::SequenceNumber;
use std::time::Duration;

const INITIAL_CWND_PACKETS: f64 = 16.0;
const MIN_CWND_PACKETS: f64 = 2.0;
const MIN_SEND_PERIOD: Duration = Duration::from_micros(10);
const MAX_SEND_PERIOD: Duration = Duration::from_millis(100);
const DEFAULT_ACK_INTERVAL: u32 = 64;

#[derive(Debug)]
pub struct Aimd {
    syn_interval: Duration,
    cwnd_packets: f64,
    ssthresh_packets: f64,
    rtt: Duration,
    send_period: Duration,
    ack_interval: u32,
}

impl Aimd {
    pub fn new(syn_interval: Duration) -> Self {
        Self {
            syn_interval,
            cwnd_packets: INITIAL_CWND_PACKETS,
            ssthresh_packets: f64::MAX,
            rtt: syn_interval * 10,
            send_period: MIN_SEND_PERIOD,
            ack_interval: DEFAULT_ACK_INTERVAL,
        }
    }

    fn recompute_send_period(&mut self) {
        // packetSendPeriod ~= RTT / cwnd: the time between sends that keeps
        // `cwnd` packets in flight over one round trip.
        let period = self.rtt.as_secs_f64() / self.cwnd_packets.max(MIN_CWND_PACKETS);
        let clamped = period.clamp(
            MIN_SEND_PERIOD.as_secs_f64(),
            MAX_SEND_PERIOD.as_secs_f64(),
        );
        self.send_period = Duration::from_secs_f64(clamped);
    }
}

impl CongestionControl for Aimd {
    fn syn_interval(&self) -> Duration {
        self.syn_interval
    }

    fn ack_interval(&self) -> u32 {
        self.ack_interval
    }

    fn packet_send_period(&self) -> Duration {
        self.send_period
    }

    fn user_defined_rto(&self) -> bool {
        false
    }

    fn rto(&self) -> Duration {
        self.rtt * 4
    }

    fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
        self.recompute_send_period();
    }

    fn set_receive_rate(&mut self, _packets_per_sec: f64) {}

    fn set_bandwidth(&mut self, _packets_per_sec: f64) {}

    fn set_send_current_sequence_number(&mut self, _seq: SequenceNumber) {}

    fn on_ack(&mut self, _ack: SequenceNumber) {
        if self.cwnd_packets < self.ssthresh_packets {
            // Slow start: grow exponentially, one packet per ACKed packet.
            self.cwnd_packets += 1.0;
        } else {
            // Congestion avoidance: grow by roughly one packet per RTT.
            self.cwnd_packets += 1.0 / self.cwnd_packets;
        }
        self.recompute_send_period();
    }

    fn on_loss(&mut self, _start: SequenceNumber, _end: SequenceNumber) {
        self.ssthresh_packets = (self.cwnd_packets / 2.0).max(MIN_CWND_PACKETS);
        self.cwnd_packets = self.ssthresh_packets;
        self.recompute_send_period();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_grows_cwnd_and_shrinks_send_period() {
        let mut cc = Aimd::new(Duration::from_millis(10));
        let initial_period = cc.packet_send_period();
        for seq in 1..20u16 {
            cc.on_ack(SequenceNumber::new(seq));
        }
        assert!(cc.packet_send_period() <= initial_period);
    }

    #[test]
    fn loss_halves_ssthresh_and_collapses_cwnd() {
        let mut cc = Aimd::new(Duration::from_millis(10));
        for seq in 1..50u16 {
            cc.on_ack(SequenceNumber::new(seq));
        }
        let period_before_loss = cc.packet_send_period();
        cc.on_loss(SequenceNumber::new(10), SequenceNumber::new(12));
        assert!(cc.cwnd_packets < cc.ssthresh_packets * 2.0);
        assert!(cc.packet_send_period() >= period_before_loss);
    }

    #[test]
    fn rtt_update_adjusts_send_period() {
        let mut cc = Aimd::new(Duration::from_millis(10));
        cc.set_rtt(Duration::from_millis(200));
        assert!(cc.packet_send_period() <= MAX_SEND_PERIOD);
    }
}
