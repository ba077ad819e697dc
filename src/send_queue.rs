//! Pacer and retransmitter for outbound reliable packets (`SPEC_FULL.md`
//! §4.4). Grounded directly on the teacher's
//! `src/raknet/reliability/send_window.rs` `SendWindow`: a `BTreeMap` of
//! packets sent-but-not-yet-ACKed keyed by sequence number, a `BTreeSet` of
//! sequence numbers queued for immediate NAK-driven resend, and a single
//! worker that prioritizes resends over new sends. The worker here is one
//! dedicated tokio task per Connection (§5 "Sender (SendQueue worker)")
//! instead of the teacher's synchronous `get_next_datagram` pull model,
//! since this transport paces sends on a timer rather than draining
//! everything a caller's tick permits.

use crate::packet::Packet;
use crate::seq::SequenceNumber;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

struct Retained {
    packet: Packet,
    sent_at: Instant,
}

struct Shared {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    next_sequence: AtomicU16,
    send_period_us: AtomicU64,
    pending: Mutex<BTreeMap<u16, Retained>>,
    resend_queue: Mutex<BTreeSet<u16>>,
    stopped: std::sync::atomic::AtomicBool,
    notify: Notify,
}

/// Handle to a Connection's outbound pacer; cheap to clone, shares state
/// with its worker task.
#[derive(Clone)]
pub struct SendQueue {
    shared: Arc<Shared>,
    new_packets_tx: mpsc::UnboundedSender<Bytes>,
}

pub struct SendQueueHandle {
    pub queue: SendQueue,
    pub worker: JoinHandle<()>,
}

impl SendQueue {
    /// Spawns the worker task and returns a handle plus its `JoinHandle`,
    /// which the owning Connection must await on teardown (§5
    /// "Cancellation").
    pub fn spawn(socket: Arc<UdpSocket>, peer: SocketAddr, initial_send_period: Duration) -> SendQueueHandle {
        let shared = Arc::new(Shared {
            socket,
            peer,
            next_sequence: AtomicU16::new(0),
            send_period_us: AtomicU64::new(initial_send_period.as_micros() as u64),
            pending: Mutex::new(BTreeMap::new()),
            resend_queue: Mutex::new(BTreeSet::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
            notify: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = SendQueue {
            shared: shared.clone(),
            new_packets_tx: tx,
        };
        let worker = tokio::spawn(run_worker(shared, rx));
        SendQueueHandle { queue, worker }
    }

    /// Appends application data to the outbound FIFO; the worker assigns the
    /// next sequence number when it actually sends it.
    pub fn queue_packet(&self, payload: Bytes) {
        let _ = self.new_packets_tx.send(payload);
        self.shared.notify.notify_one();
    }

    /// Writes a control packet immediately, bypassing the pacer.
    pub async fn send_packet(&self, packet: &Packet) {
        send_encoded(&self.shared, packet).await;
    }

    /// Releases every retained packet with sequence `<= seq` (modular).
    pub async fn ack(&self, seq: SequenceNumber) {
        let mut pending = self.shared.pending.lock().await;
        let to_drop: Vec<u16> = pending
            .keys()
            .copied()
            .filter(|&k| SequenceNumber::new(k).le(seq))
            .collect();
        for k in to_drop {
            pending.remove(&k);
        }
        let mut resend = self.shared.resend_queue.lock().await;
        resend.retain(|&k| !SequenceNumber::new(k).le(seq));
    }

    /// Schedules `[from, to]` for retransmission ahead of new sends.
    pub async fn nak(&self, from: SequenceNumber, to: SequenceNumber) {
        let pending = self.shared.pending.lock().await;
        let mut resend = self.shared.resend_queue.lock().await;
        let mut seq = from;
        loop {
            if pending.contains_key(&seq.value()) {
                resend.insert(seq.value());
            }
            if seq == to {
                break;
            }
            seq = seq.next();
        }
        drop(pending);
        drop(resend);
        self.shared.notify.notify_one();
    }

    /// Replaces the retransmit list wholesale from a decoded TimeoutNAK loss
    /// list.
    pub async fn override_nak_list_from_packet(&self, loss_list: &crate::loss_list::LossList) {
        let pending = self.shared.pending.lock().await;
        let mut resend = self.shared.resend_queue.lock().await;
        resend.clear();
        for &seq_value in pending.keys() {
            if loss_list.contains(SequenceNumber::new(seq_value)) {
                resend.insert(seq_value);
            }
        }
        drop(pending);
        drop(resend);
        self.shared.notify.notify_one();
    }

    pub fn set_packet_send_period(&self, period: Duration) {
        self.shared
            .send_period_us
            .store(period.as_micros() as u64, Ordering::Relaxed);
        self.shared.notify.notify_one();
    }

    pub fn current_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::new(self.shared.next_sequence.load(Ordering::Relaxed))
    }

    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

async fn send_encoded(shared: &Shared, packet: &Packet) {
    let encoded = packet.encode();
    if let Err(err) = shared.socket.send_to(&encoded, shared.peer).await {
        warn!(peer = %shared.peer, error = %err, "failed to send packet");
    }
}

async fn run_worker(shared: Arc<Shared>, mut new_packets: mpsc::UnboundedReceiver<Bytes>) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        let resend_seq = {
            let mut resend = shared.resend_queue.lock().await;
            resend.iter().next().copied().map(|s| {
                resend.remove(&s);
                s
            })
        };

        if let Some(seq_value) = resend_seq {
            let packet = {
                let pending = shared.pending.lock().await;
                pending.get(&seq_value).map(|r| r.packet.clone())
            };
            if let Some(packet) = packet {
                trace!(seq = seq_value, "retransmitting");
                send_encoded(&shared, &packet).await;
            }
        } else if let Ok(payload) = new_packets.try_recv() {
            let seq_value = shared.next_sequence.fetch_add(1, Ordering::Relaxed) & 0x7FFF;
            let seq = SequenceNumber::new(seq_value);
            match Packet::new_data(seq, payload) {
                Ok(packet) => {
                    send_encoded(&shared, &packet).await;
                    let mut pending = shared.pending.lock().await;
                    pending.insert(
                        seq_value,
                        Retained {
                            packet,
                            sent_at: Instant::now(),
                        },
                    );
                }
                Err(err) => warn!(%err, "dropping oversized outbound payload"),
            }
        } else {
            let period = Duration::from_micros(shared.send_period_us.load(Ordering::Relaxed).max(1));
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shared.notify.notified() => {}
            }
            continue;
        }

        let period = Duration::from_micros(shared.send_period_us.load(Ordering::Relaxed).max(1));
        tokio::time::sleep(period).await;
    }
}
