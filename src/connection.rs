//! The per-peer protocol state machine (`SPEC_FULL.md` §4.5): drives
//! ACK/ACK2/NAK/TimeoutNAK emission, RTT estimation, and the sync tick.
//!
//! Grounded nearly method-for-method on
//! `original_source/libraries/networking/src/udt/Connection.cpp`
//! (`sync`, `sendACK`, `sendLightACK`, `sendACK2`, `sendNAK`,
//! `sendTimeoutNAK`, `processReceivedSequenceNumber`, `processControl`,
//! `updateRTT`, `estimatedTimeout`), with the two fixed bugs from
//! `SPEC_FULL.md` §9 applied (the `nextACK` assertion direction and the
//! `deliveryRate` EWMA self-reference). Task/lock shape is grounded on
//! the teacher's `src/raknet/session.rs` `RakNetSession`: a `tokio::sync::Mutex`-
//! guarded state block, a `tick()` entry point invoked by an outer timer,
//! and an async `handle_incoming`-style dispatch.

use crate::congestion::CongestionControl;
use crate::loss_list::LossList;
use crate::packet::control::{Ack2Payload, AckExtended, AckLightPayload, AckPayload, NakPayload};
use crate::packet::{Packet, PacketType, CONNECTION_RECEIVE_BUFFER_SIZE_PACKETS};
use crate::receive_window::ReceiveWindow;
use crate::send_queue::SendQueue;
use crate::seq::{seqoff, SequenceNumber};
use crate::stats::Stats;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// State touched by the Receiver and the sync timer, guarded by one
/// `tokio::sync::Mutex` (§5 "Shared state and synchronization").
struct Inner {
    send_queue: Option<SendQueue>,
    send_queue_worker: Option<JoinHandle<()>>,
    receive_window: ReceiveWindow,
    loss_list: LossList,
    /// ACK sub-sequence -> (acked sequence, send time), for RTT measurement
    /// on ACK2 arrival. Entries older than `estimated_timeout()` (RTO-scale,
    /// not the much shorter `syn_interval`) are pruned opportunistically
    /// when a new one is recorded, so a realistically-late ACK2 can still
    /// find its entry.
    sent_acks: BTreeMap<u16, (SequenceNumber, Instant)>,
    rtt: Duration,
    rtt_variance: Duration,
    /// Receiver-advertised cap on our in-flight unACKed packets. In this
    /// implementation it is always set from the peer's advertised
    /// `recv_buffer_packets`, which is the sentinel "infinite" constant
    /// per §1's non-goals; the field exists so the wire protocol and the
    /// light-ack approximation below have somewhere to live, not to
    /// enforce back-pressure.
    flow_window_size: i64,
    last_received_sequence_number: SequenceNumber,
    last_sent_ack: SequenceNumber,
    last_received_ack: SequenceNumber,
    last_received_acknowledged_ack: SequenceNumber,
    last_sent_ack2: SequenceNumber,
    current_ack_sub_sequence_number: SequenceNumber,
    packets_since_ack: u32,
    last_nak_time: Instant,
    last_ack_send_time: Instant,
    last_ack2_send_time: Instant,
    nak_interval: Duration,
    delivery_rate: f64,
    bandwidth: f64,
    congestion_control: Box<dyn CongestionControl + Send>,
}

/// Per-peer connection state. Owns its `SendQueue`, `ReceiveWindow`,
/// `LossList`, and `CongestionControl` exclusively; holds a non-owning
/// `Arc<UdpSocket>` shared with the owning `Socket` (§3 "Ownership").
pub struct Connection {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    syn_interval: Duration,
    min_nak_interval: Duration,
    /// Lock-free mirror of `last_received_ack` for the SendQueue worker's
    /// hot retransmit path (§5).
    atomic_last_received_ack: AtomicU16,
    stats: Stats,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    inner: Mutex<Inner>,
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        min_nak_interval: Duration,
        congestion_control: Box<dyn CongestionControl + Send>,
    ) -> Self {
        let syn_interval = congestion_control.syn_interval();
        // Initial values per §4.5 "Initial values".
        let rtt = syn_interval * 10;
        let rtt_variance = rtt / 2;
        let now = Instant::now();
        // No handshake layer exists at this layer (§1 non-goals), so the
        // initial sequence space anchor is "one before zero": the first
        // data packet (seq 0) is then correctly seen as the next expected
        // one rather than a gap.
        let epoch = SequenceNumber::ZERO.prev();

        Self {
            peer,
            socket,
            syn_interval,
            min_nak_interval,
            atomic_last_received_ack: AtomicU16::new(epoch.value()),
            stats: Stats::new(),
            sync_task: Mutex::new(None),
            inner: Mutex::new(Inner {
                send_queue: None,
                send_queue_worker: None,
                receive_window: ReceiveWindow::new(),
                loss_list: LossList::new(),
                sent_acks: BTreeMap::new(),
                rtt,
                rtt_variance,
                flow_window_size: CONNECTION_RECEIVE_BUFFER_SIZE_PACKETS as i64,
                last_received_sequence_number: epoch,
                last_sent_ack: epoch,
                last_received_ack: epoch,
                last_received_acknowledged_ack: epoch,
                last_sent_ack2: epoch,
                current_ack_sub_sequence_number: SequenceNumber::ZERO,
                packets_since_ack: 0,
                last_nak_time: now,
                last_ack_send_time: now,
                last_ack2_send_time: now,
                nak_interval: min_nak_interval,
                delivery_rate: 0.0,
                bandwidth: 0.0,
                congestion_control,
            }),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Spawns this Connection's sync timer task: fires every `syn_interval`
    /// and calls `sync()`, independent of the Receiver/Sender scheduling
    /// (§5 "Sync timer"). Holds only a weak reference so the task exits
    /// once the Connection is dropped from the Socket's table.
    pub async fn spawn_sync_task(self: Arc<Self>) {
        let syn_interval = self.syn_interval;
        let weak = Arc::downgrade(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(syn_interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(conn) => conn.sync().await,
                    None => break,
                }
            }
        });
        *self.sync_task.lock().await = Some(handle);
    }

    /// Tears down this Connection's background work: aborts the sync
    /// timer, then stops and joins the SendQueue worker, in that order,
    /// before any shared state is released (§5 "Cancellation").
    pub async fn close(&self) {
        if let Some(handle) = self.sync_task.lock().await.take() {
            handle.abort();
        }
        let (send_queue, worker) = {
            let mut inner = self.inner.lock().await;
            (inner.send_queue.take(), inner.send_queue_worker.take())
        };
        if let Some(send_queue) = send_queue {
            send_queue.stop().await;
        }
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    // ---- Outgoing data (§4.5 "Outgoing data") ----

    /// Queues `payload` as a reliable data packet, lazily creating the
    /// SendQueue on first use.
    pub async fn send_reliable(&self, payload: Bytes) {
        let mut inner = self.inner.lock().await;
        if inner.send_queue.is_none() {
            let period = inner.congestion_control.packet_send_period();
            let handle = SendQueue::spawn(self.socket.clone(), self.peer, period);
            inner.send_queue = Some(handle.queue);
            inner.send_queue_worker = Some(handle.worker);
        }
        inner.send_queue.as_ref().unwrap().queue_packet(payload);
        self.stats.record_send();
    }

    // ---- Sync tick (§4.5 "Sync tick") ----

    pub async fn sync(&self) {
        self.send_ack(true).await;

        let should_timeout_nak = {
            let inner = self.inner.lock().await;
            !inner.loss_list.is_empty()
                && Instant::now().duration_since(inner.last_nak_time) >= inner.nak_interval
        };
        if should_timeout_nak {
            self.send_timeout_nak().await;
        }
    }

    // ---- Incoming data (§4.5 "On data packet arrival") ----

    pub async fn process_received_sequence_number(&self, seq: SequenceNumber) {
        let now = Instant::now();
        // Bounds of the gap to NAK, captured at detection time (before
        // `last_received_sequence_number` advances below): the spec calls
        // `sendNAK(seq)` in the same step that observes the gap, ahead of
        // the `lastReceivedSequenceNumber = seq` assignment, so the NAK
        // must carry the pre-update `lastReceivedSequenceNumber + 1`, not
        // whatever the field holds by the time the packet goes out.
        let mut nak_range: Option<(SequenceNumber, SequenceNumber)> = None;
        let mut light_ack_due = false;

        {
            let mut inner = self.inner.lock().await;
            inner.receive_window.on_arrival(seq.value(), now);

            let expected = inner.last_received_sequence_number.next();
            if seq.gt(expected) {
                inner.loss_list.append_range(expected, seq.prev());
                nak_range = Some((expected, seq.prev()));

                let receive_rate = inner.receive_window.packet_receive_speed();
                let computed = if receive_rate > 0.0 {
                    Duration::from_secs_f64(inner.loss_list.length() as f64 / receive_rate)
                } else {
                    self.estimated_timeout(&inner)
                };
                inner.nak_interval = computed.max(self.min_nak_interval);
            }

            if seq.gt(inner.last_received_sequence_number) {
                inner.last_received_sequence_number = seq;
            } else {
                inner.loss_list.remove(seq);
                light_ack_due = true;
            }

            inner.packets_since_ack += 1;
        }

        if let Some((start, end)) = nak_range {
            self.send_nak(start, end).await;
        }
        if light_ack_due {
            self.send_light_ack().await;
        }

        let should_intermediate_ack = {
            let inner = self.inner.lock().await;
            let ack_interval = inner.congestion_control.ack_interval();
            ack_interval > 0 && inner.packets_since_ack >= ack_interval
        };
        if should_intermediate_ack {
            self.send_ack(false).await;
        }
    }

    fn next_ack(inner: &Inner) -> SequenceNumber {
        match inner.loss_list.first_sequence_number() {
            Some(first) => first.prev(),
            None => inner.last_received_sequence_number,
        }
    }

    fn estimated_timeout(&self, inner: &Inner) -> Duration {
        if inner.congestion_control.user_defined_rto() {
            inner.rtt + inner.rtt_variance * 4
        } else {
            inner.congestion_control.rto()
        }
    }

    // ---- Outgoing control packets (§4.5) ----

    async fn send_ack(&self, caused_by_sync: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let next_ack_number = Self::next_ack(&inner);
        // Corrected per §9: the assertion's intent is `>=`, not `<`. A
        // violation here means `nextACK()` went backwards past the last
        // ACK we sent, a fatal invariant breach (§7).
        debug_assert!(
            next_ack_number.ge(inner.last_sent_ack),
            "nextACK() regressed past last_sent_ack"
        );

        if next_ack_number == inner.last_sent_ack {
            let redundant_but_unconfirmed = next_ack_number.gt(inner.last_received_acknowledged_ack)
                && now.duration_since(inner.last_ack_send_time) >= self.estimated_timeout(&inner);
            if !redundant_but_unconfirmed {
                return;
            }
        }

        let sub_seq = inner.current_ack_sub_sequence_number;
        inner.current_ack_sub_sequence_number = sub_seq.next();

        let extended = if caused_by_sync {
            Some(AckExtended {
                packet_receive_speed: inner.receive_window.packet_receive_speed() as i32,
                bandwidth: inner.receive_window.estimated_bandwidth() as i32,
            })
        } else {
            None
        };

        let payload = AckPayload {
            sub_seq,
            ack: next_ack_number,
            rtt_us: inner.rtt.as_micros() as i32,
            rtt_var_us: inner.rtt_variance.as_micros() as i32,
            recv_buffer_packets: CONNECTION_RECEIVE_BUFFER_SIZE_PACKETS,
            extended,
        };

        // Evict only entries an ACK2 realistically can't still be answering
        // for: `estimated_timeout()` is RTO-scale (a few RTTs), unlike
        // `syn_interval` (~10ms), which an ACK2 routinely arrives after.
        let max_sent_ack_age = self.estimated_timeout(&inner);
        prune_stale_sent_acks(&mut inner.sent_acks, now, max_sent_ack_age);
        inner.sent_acks.insert(sub_seq.value(), (next_ack_number, now));
        inner.last_sent_ack = next_ack_number;
        inner.packets_since_ack = 0;
        if caused_by_sync {
            inner.last_ack_send_time = now;
        }
        drop(inner);

        let packet = Packet::new_control(PacketType::Ack, sub_seq, payload.encode().freeze())
            .expect("ACK payload always fits MAX_PACKET_SIZE");
        self.send_direct(&packet).await;
        self.stats.record_ack();
    }

    /// Bare ACK carrying only the contiguous receive point, with no
    /// RTT/flow-window payload (§4.5 "sendLightACK"). Wired in on a
    /// resend's arrival (a duplicate already counted by the receiver):
    /// cheaply acknowledges the catch-up without waiting for the next
    /// full ACK.
    async fn send_light_ack(&self) {
        let (ack_value, sub_seq) = {
            let mut inner = self.inner.lock().await;
            let next_ack_number = Self::next_ack(&inner);
            if next_ack_number == inner.last_received_acknowledged_ack {
                return;
            }
            let sub_seq = inner.current_ack_sub_sequence_number;
            inner.current_ack_sub_sequence_number = sub_seq.next();
            (next_ack_number, sub_seq)
        };

        let payload = AckLightPayload { ack: ack_value };
        let packet = Packet::new_control(PacketType::Ack, sub_seq, payload.encode().freeze())
            .expect("light ACK payload always fits MAX_PACKET_SIZE");
        self.send_direct(&packet).await;
        self.stats.record_ack();
    }

    async fn send_ack2(&self, sub_seq: SequenceNumber) {
        {
            let mut inner = self.inner.lock().await;
            inner.last_ack2_send_time = Instant::now();
            inner.last_sent_ack2 = sub_seq;
        }
        let payload = Ack2Payload { sub_seq };
        let packet = Packet::new_control(PacketType::Ack2, sub_seq, payload.encode().freeze())
            .expect("ACK2 payload always fits MAX_PACKET_SIZE");
        self.send_direct(&packet).await;
    }

    /// Emits a NAK covering `[start, end]` — the gap `process_received_sequence_number`
    /// detected, `(lastReceivedSequenceNumber+1, triggeringSeq-1)` at the
    /// moment of detection (§4.5 "sendNAK").
    async fn send_nak(&self, start: SequenceNumber, end: SequenceNumber) {
        {
            let mut inner = self.inner.lock().await;
            inner.last_nak_time = Instant::now();
        }
        let nak = NakPayload::range(start, end);
        let packet = Packet::new_control(PacketType::Nak, SequenceNumber::ZERO, nak.encode().freeze())
            .expect("NAK payload always fits MAX_PACKET_SIZE");
        self.send_direct(&packet).await;
        self.stats.record_nak();
    }

    async fn send_timeout_nak(&self) {
        let body = {
            let mut inner = self.inner.lock().await;
            inner.last_nak_time = Instant::now();
            inner.loss_list.write()
        };
        let packet = Packet::new_control(PacketType::TimeoutNak, SequenceNumber::ZERO, body)
            .expect("serialized loss list always fits MAX_PACKET_SIZE");
        self.send_direct(&packet).await;
        self.stats.record_timeout_nak();
    }

    // ---- Incoming control packets (§4.5 "On control packet arrival") ----

    pub async fn process_control(&self, packet: Packet) {
        match packet.packet_type {
            PacketType::Ack => self.handle_ack(packet.payload).await,
            PacketType::Ack2 => self.handle_ack2(packet.payload).await,
            PacketType::Nak => self.handle_nak(packet.payload).await,
            PacketType::TimeoutNak => self.handle_timeout_nak(packet.payload).await,
            PacketType::Handshake => {
                trace!(peer = %self.peer, "ignoring out-of-scope handshake packet");
            }
            PacketType::Data => {
                warn!(peer = %self.peer, "data packet misrouted into control dispatch");
                self.stats.record_bad_packet();
            }
        }
    }

    async fn handle_ack(&self, payload: Bytes) {
        if AckLightPayload::matches_length(payload.len()) {
            let light = match AckLightPayload::decode(payload) {
                Ok(l) => l,
                Err(_) => {
                    self.stats.record_bad_packet();
                    return;
                }
            };
            let mut inner = self.inner.lock().await;
            if light.ack.gt(inner.last_received_ack) {
                // No fresh recv-buffer field travels with a light ACK;
                // approximate the new window by the delta it acknowledged.
                inner.flow_window_size -= seqoff(inner.last_received_ack, light.ack) as i64;
                inner.last_received_ack = light.ack;
                self.atomic_last_received_ack
                    .store(light.ack.value(), Ordering::Relaxed);
            }
            return;
        }

        let ack = match AckPayload::decode(payload) {
            Ok(a) => a,
            Err(_) => {
                self.stats.record_bad_packet();
                return;
            }
        };
        let now = Instant::now();

        let should_ack2 = {
            let inner = self.inner.lock().await;
            now.duration_since(inner.last_ack2_send_time) > self.syn_interval
                || ack.sub_seq == inner.last_sent_ack2
        };
        if should_ack2 {
            self.send_ack2(ack.sub_seq).await;
        }

        let current_outbound_seq = {
            let inner = self.inner.lock().await;
            inner
                .send_queue
                .as_ref()
                .map(|sq| sq.current_sequence_number())
                .unwrap_or(SequenceNumber::ZERO)
        };
        if ack.ack.gt(current_outbound_seq) {
            warn!(peer = %self.peer, ack = %ack.ack, "ACK beyond current outbound sequence, dropping");
            self.stats.record_protocol_violation();
            return;
        }

        let mut should_release = None;
        let new_send_period;
        {
            let mut inner = self.inner.lock().await;
            if ack.ack.le(inner.last_received_ack) {
                // Repeat ACK; nothing new to digest.
                return;
            }

            inner.flow_window_size = ack.recv_buffer_packets as i64;
            inner.last_received_ack = ack.ack;
            self.atomic_last_received_ack
                .store(ack.ack.value(), Ordering::Relaxed);
            should_release = Some(ack.ack);

            apply_rtt_sample(&mut inner, Duration::from_micros(ack.rtt_us.max(0) as u64));
            inner.congestion_control.set_rtt(inner.rtt);

            if let Some(ext) = ack.extended {
                if ext.packet_receive_speed > 0 {
                    inner.delivery_rate =
                        (7.0 * inner.delivery_rate + ext.packet_receive_speed as f64) / 8.0;
                    inner.congestion_control.set_receive_rate(inner.delivery_rate);
                }
                if ext.bandwidth > 0 {
                    inner.bandwidth = (7.0 * inner.bandwidth + ext.bandwidth as f64) / 8.0;
                    inner.congestion_control.set_bandwidth(inner.bandwidth);
                }
            }

            inner.congestion_control.on_ack(ack.ack);
            new_send_period = inner.congestion_control.packet_send_period();
        }

        let send_queue = {
            let inner = self.inner.lock().await;
            inner.send_queue.clone()
        };
        if let (Some(sq), Some(ack_seq)) = (&send_queue, should_release) {
            sq.ack(ack_seq).await;
            sq.set_packet_send_period(new_send_period);
        }
    }

    async fn handle_ack2(&self, payload: Bytes) {
        let ack2 = match Ack2Payload::decode(payload) {
            Ok(a) => a,
            Err(_) => {
                self.stats.record_bad_packet();
                return;
            }
        };
        let mut inner = self.inner.lock().await;
        match inner.sent_acks.remove(&ack2.sub_seq.value()) {
            Some((acked_seq, sent_at)) => {
                let rtt_sample = Instant::now().saturating_duration_since(sent_at);
                apply_rtt_sample(&mut inner, rtt_sample);
                if acked_seq.gt(inner.last_received_acknowledged_ack) {
                    inner.last_received_acknowledged_ack = acked_seq;
                }
            }
            None => {
                // Sub-sequence never emitted (or already evicted): a
                // protocol violation per §7, not fatal.
                self.stats.record_protocol_violation();
            }
        }
    }

    async fn handle_nak(&self, payload: Bytes) {
        let nak = match NakPayload::decode(payload) {
            Ok(n) => n,
            Err(_) => {
                self.stats.record_bad_packet();
                return;
            }
        };
        let (start, end) = nak.range_bounds();

        let send_queue = {
            let inner = self.inner.lock().await;
            inner.send_queue.clone()
        };
        if let Some(sq) = &send_queue {
            sq.nak(start, end).await;
        }

        let new_period = {
            let mut inner = self.inner.lock().await;
            inner.congestion_control.on_loss(start, end);
            inner.congestion_control.packet_send_period()
        };
        if let Some(sq) = &send_queue {
            sq.set_packet_send_period(new_period);
        }
        self.stats.record_retransmit();
    }

    async fn handle_timeout_nak(&self, payload: Bytes) {
        let loss_list = LossList::read(payload);
        let send_queue = {
            let inner = self.inner.lock().await;
            inner.send_queue.clone()
        };
        if let Some(sq) = &send_queue {
            // Congestion control is deliberately not notified here: a
            // TimeoutNAK repeats loss the original NAK already reported
            // (matches UDT, §4.5 "TimeoutNAK").
            sq.override_nak_list_from_packet(&loss_list).await;
        }
        self.stats.record_timeout_nak();
    }

    // ---- Resource errors (§7) ----

    async fn send_direct(&self, packet: &Packet) {
        let encoded = packet.encode();
        match self.socket.send_to(&encoded, self.peer).await {
            Ok(_) => self.stats.record_send_success(),
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "control packet send failed");
                let failures = self.stats.record_send_failure();
                debug!(peer = %self.peer, failures, "consecutive send failures");
                // Treat as implicit loss, per §7 "Resource error".
                let mut inner = self.inner.lock().await;
                let marker = inner.last_sent_ack;
                inner.congestion_control.on_loss(marker, marker);
            }
        }
    }
}

fn apply_rtt_sample(inner: &mut Inner, sample: Duration) {
    // Jacobson's smoothing, alpha = 1/8, beta = 1/4 (§4.5 "updateRTT").
    let sample_us = sample.as_micros() as i64;
    let rtt_us = inner.rtt.as_micros() as i64;
    let new_rtt_us = ((7 * rtt_us + sample_us) / 8).max(0);
    let rtt_var_us = inner.rtt_variance.as_micros() as i64;
    let diff_us = (sample_us - new_rtt_us).abs();
    let new_var_us = ((3 * rtt_var_us + diff_us) / 4).max(0);
    inner.rtt = Duration::from_micros(new_rtt_us as u64);
    inner.rtt_variance = Duration::from_micros(new_var_us as u64);
}

/// Drops entries older than `max_age` (an RTO-scale duration from
/// `estimated_timeout()`, not the much shorter `syn_interval`): an ACK2
/// routinely arrives a full RTT after its ACK, and pruning on `syn_interval`
/// alone would discard the entry before the ACK2 ever had a chance to match
/// it (§4.3 "SentACKs").
fn prune_stale_sent_acks(map: &mut BTreeMap<u16, (SequenceNumber, Instant)>, now: Instant, max_age: Duration) {
    map.retain(|_, (_, sent_at)| now.duration_since(*sent_at) <= max_age);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::aimd::Aimd;

    async fn make_connection() -> (Arc<Connection>, UdpSocket) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();
        let cc = Box::new(Aimd::new(Duration::from_millis(10)));
        let conn = Arc::new(Connection::new(peer_addr, socket, Duration::from_millis(20), cc));
        (conn, peer_socket)
    }

    #[tokio::test]
    async fn in_order_arrivals_advance_last_received_sequence_number() {
        let (conn, _peer) = make_connection().await;
        for seq in 0u16..10 {
            conn.process_received_sequence_number(SequenceNumber::new(seq)).await;
        }
        let inner = conn.inner.lock().await;
        assert!(inner.loss_list.is_empty());
        assert_eq!(inner.last_received_sequence_number, SequenceNumber::new(9));
    }

    #[tokio::test]
    async fn single_gap_is_recorded_and_triggers_a_nak() {
        let (conn, peer) = make_connection().await;
        for seq in 0u16..25 {
            conn.process_received_sequence_number(SequenceNumber::new(seq)).await;
        }
        // Sequence 25 was dropped; 26 arrives next.
        conn.process_received_sequence_number(SequenceNumber::new(26)).await;

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
            .await
            .expect("NAK should have been sent")
            .unwrap();
        let packet = Packet::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(packet.packet_type, PacketType::Nak);
        let nak = NakPayload::decode(packet.payload).unwrap();
        assert_eq!(nak.range_bounds(), (SequenceNumber::new(25), SequenceNumber::new(25)));

        let inner = conn.inner.lock().await;
        assert!(inner.loss_list.contains(SequenceNumber::new(25)));
        assert_eq!(Connection::next_ack(&inner), SequenceNumber::new(24));
    }

    #[tokio::test]
    async fn burst_gap_is_recorded_as_one_range_and_naks_the_whole_range() {
        // Sequences 0..10 sent; 4..7 dropped (scenario 3, SPEC_FULL.md §8).
        let (conn, peer) = make_connection().await;
        for seq in [0u16, 1, 2, 3, 8] {
            conn.process_received_sequence_number(SequenceNumber::new(seq)).await;
        }

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
            .await
            .expect("NAK should have been sent")
            .unwrap();
        let packet = Packet::decode(Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(packet.packet_type, PacketType::Nak);
        let nak = NakPayload::decode(packet.payload).unwrap();
        assert_eq!(nak.range_bounds(), (SequenceNumber::new(4), SequenceNumber::new(7)));

        let inner = conn.inner.lock().await;
        assert_eq!(inner.loss_list.length(), 4);
        for missing in 4u16..=7 {
            assert!(inner.loss_list.contains(SequenceNumber::new(missing)));
        }
        drop(inner);

        // Retransmitted 4,5,6,7 arrive in order; the loss list empties in
        // the same order and the next ACK point reaches 8.
        for seq in 4u16..=7 {
            conn.process_received_sequence_number(SequenceNumber::new(seq)).await;
        }
        let inner = conn.inner.lock().await;
        assert!(inner.loss_list.is_empty());
        assert_eq!(Connection::next_ack(&inner), SequenceNumber::new(8));
    }

    #[tokio::test]
    async fn resend_of_a_lost_packet_clears_the_loss_list() {
        let (conn, _peer) = make_connection().await;
        for seq in 0u16..10 {
            if seq != 5 {
                conn.process_received_sequence_number(SequenceNumber::new(seq)).await;
            }
        }
        conn.process_received_sequence_number(SequenceNumber::new(5)).await;

        let inner = conn.inner.lock().await;
        assert!(inner.loss_list.is_empty());
        assert_eq!(Connection::next_ack(&inner), SequenceNumber::new(9));
    }

    #[tokio::test]
    async fn rtt_sample_pulls_the_smoothed_value_toward_it() {
        let (conn, _peer) = make_connection().await;
        let before = conn.inner.lock().await.rtt;
        {
            let mut inner = conn.inner.lock().await;
            apply_rtt_sample(&mut inner, Duration::from_millis(120));
        }
        let after = conn.inner.lock().await.rtt;
        assert!(after > before && after < Duration::from_millis(120));
    }

    #[tokio::test]
    async fn ack2_arrival_measures_rtt_and_advances_acknowledged_ack() {
        let (conn, _peer) = make_connection().await;
        let sent_at = Instant::now().checked_sub(Duration::from_millis(50)).unwrap();
        {
            let mut inner = conn.inner.lock().await;
            inner.sent_acks.insert(7, (SequenceNumber::new(50), sent_at));
        }
        let payload = Ack2Payload {
            sub_seq: SequenceNumber::new(7),
        };
        conn.handle_ack2(payload.encode().freeze()).await;

        let inner = conn.inner.lock().await;
        assert!(!inner.sent_acks.contains_key(&7));
        assert_eq!(inner.last_received_acknowledged_ack, SequenceNumber::new(50));
    }

    #[tokio::test]
    async fn sent_ack_entry_survives_an_intervening_sync_tick_before_ack2_arrives() {
        // Scenario 5 (SPEC_FULL.md §8): an ACK2 realistically arrives about
        // one RTT (120ms here) after its ACK, which is far longer than
        // `syn_interval` (10ms). A sync-triggered ACK firing in between must
        // not prune the still-outstanding entry out from under it.
        let (conn, peer) = make_connection().await;
        let mut buf = [0u8; 64];

        conn.process_received_sequence_number(SequenceNumber::new(0)).await;
        conn.send_ack(true).await;
        let first_sub_seq = {
            let inner = conn.inner.lock().await;
            *inner.sent_acks.keys().next().expect("sendACK should have recorded an entry")
        };
        tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // A second, sync-triggered ACK fires ~30ms later, well inside the
        // RTO window, and records its own entry alongside the first.
        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.process_received_sequence_number(SequenceNumber::new(1)).await;
        conn.send_ack(true).await;
        tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        {
            let inner = conn.inner.lock().await;
            assert!(
                inner.sent_acks.contains_key(&first_sub_seq),
                "an intervening sync-triggered ACK must not prune an entry still inside the RTO window"
            );
        }

        // The ACK2 for the first ACK arrives ~120ms after it was sent.
        tokio::time::sleep(Duration::from_millis(90)).await;
        let payload = Ack2Payload {
            sub_seq: SequenceNumber::new(first_sub_seq),
        };
        conn.handle_ack2(payload.encode().freeze()).await;

        let inner = conn.inner.lock().await;
        assert!(!inner.sent_acks.contains_key(&first_sub_seq));
        assert_eq!(inner.last_received_acknowledged_ack, SequenceNumber::new(0));
    }

    #[tokio::test]
    async fn full_ack_adopts_advertised_flow_window_and_releases_pending() {
        let (conn, _peer) = make_connection().await;
        conn.send_reliable(Bytes::from_static(b"data")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let payload = AckPayload {
            sub_seq: SequenceNumber::new(1),
            ack: SequenceNumber::new(1), // acknowledges the single packet at seq 0
            rtt_us: 15_000,
            rtt_var_us: 2_000,
            recv_buffer_packets: 256,
            extended: None,
        };
        conn.handle_ack(payload.encode().freeze()).await;

        let inner = conn.inner.lock().await;
        assert_eq!(inner.flow_window_size, 256);
        assert_eq!(inner.last_received_ack, SequenceNumber::new(1));
    }

    #[tokio::test]
    async fn sync_tick_is_a_no_op_with_nothing_received() {
        // Nothing arrived yet, so nextACK() == lastSentACK == epoch: the
        // ACK would be redundant and unconfirmed-check also fails since
        // last_received_acknowledged_ack is the same epoch value.
        let (conn, peer) = make_connection().await;
        conn.sync().await;
        let mut buf = [0u8; 64];
        let result = tokio::time::timeout(Duration::from_millis(50), peer.recv_from(&mut buf)).await;
        assert!(result.is_err(), "no ACK should have been sent");
    }
}
