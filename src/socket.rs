//! Raw datagram I/O and peer-address -> `Connection` routing (`SPEC_FULL.md`
//! §6, §9 "Cyclic ownership").
//!
//! Grounded on the teacher's `src/raknet/mod.rs` `RakNetServer`: `bind`,
//! a `run` loop built on `tokio::select!`/`recv_from`, and a table of
//! per-peer state keyed by `SocketAddr`. Generalized from RakNet's
//! handshake-then-session dispatch to "decode a header, route to a
//! Connection, let the Connection dispatch on packet type" — there is no
//! connection-establishment handshake at this layer (§1 non-goals), so a
//! Connection is created on first sight of a peer address in either
//! direction. Uses `dashmap::DashMap` rather than the teacher's
//! `Arc<Mutex<HashMap>>>` for the connection table: every inbound datagram
//! does a lookup on this map, and `dashmap`'s sharded locking avoids
//! serializing that hot path behind one mutex across all peers; the
//! teacher's own workspace already depends on `dashmap` for the same
//! reason elsewhere (`crates/amethyst`), so this keeps the crate on a
//! dependency it already pulled in rather than introducing a new one.

use crate::config::Config;
use crate::congestion::aimd::Aimd;
use crate::connection::Connection;
use crate::packet::Packet;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Generous receive buffer; any single packet is capped at
/// `packet::MAX_PACKET_SIZE`, but UDP lets a hostile or buggy peer send
/// more in one datagram, which `Packet::decode` will then reject.
const RECV_BUFFER_SIZE: usize = 4096;

pub struct Socket {
    socket: Arc<UdpSocket>,
    connections: Arc<DashMap<SocketAddr, Arc<Connection>>>,
    syn_interval: Duration,
    min_nak_interval: Duration,
}

impl Socket {
    pub async fn bind(config: &Config) -> std::io::Result<Self> {
        let addr: SocketAddr = config
            .network
            .bind_address
            .parse()
            .expect("Config::validate rejects unparsable addresses before Socket::bind is reached");
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!(%addr, "transport socket bound");
        Ok(Self {
            socket,
            connections: Arc::new(DashMap::new()),
            syn_interval: Duration::from_micros(config.transport.syn_interval_us),
            min_nak_interval: Duration::from_micros(config.transport.min_nak_interval_us),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Queues `payload` as reliable data to `peer`, creating its
    /// `Connection` if this is the first traffic to that address.
    pub async fn send_reliable(&self, peer: SocketAddr, payload: Bytes) {
        let connection = self.connection_for(peer).await;
        connection.send_reliable(payload).await;
    }

    /// Drains inbound datagrams until the socket errors. Each datagram is
    /// decoded and dispatched to its owning `Connection` synchronously
    /// within this loop's turn (§5 "Receiver").
    pub async fn run(&self) -> std::io::Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            let data = Bytes::copy_from_slice(&buf[..len]);
            self.dispatch(src, data).await;
        }
    }

    async fn dispatch(&self, src: SocketAddr, data: Bytes) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                // Decode error (§7): drop the datagram, bump a counter,
                // never kill an existing connection over a malformed one.
                if let Some(connection) = self.connections.get(&src) {
                    connection.stats().record_bad_packet();
                }
                warn!(peer = %src, error = %err, "dropping malformed datagram");
                return;
            }
        };

        let connection = self.connection_for(src).await;
        connection.stats().record_receive();

        if packet.is_control {
            connection.process_control(packet).await;
        } else {
            match packet.sequence {
                Some(seq) => {
                    connection.process_received_sequence_number(seq).await;
                    // The application-level message-framing collaborator
                    // (out of scope, §1) would consume `packet.payload`
                    // from here to reassemble logical messages.
                }
                None => {
                    connection.stats().record_bad_packet();
                }
            }
        }
    }

    async fn connection_for(&self, peer: SocketAddr) -> Arc<Connection> {
        if let Some(existing) = self.connections.get(&peer) {
            return existing.clone();
        }

        let connection = Arc::new(Connection::new(
            peer,
            self.socket.clone(),
            self.min_nak_interval,
            Box::new(Aimd::new(self.syn_interval)),
        ));
        connection.clone().spawn_sync_task().await;
        debug!(%peer, "new connection");
        self.connections.insert(peer, connection.clone());
        connection
    }

    /// Removes `peer`'s `Connection`, stopping its sync timer and
    /// SendQueue worker before releasing any shared state (§5
    /// "Cancellation", §9 "Cyclic ownership": the Socket stops the demux
    /// path to a peer before dropping its Connection).
    pub async fn disconnect(&self, peer: SocketAddr) {
        if let Some((_, connection)) = self.connections.remove(&peer) {
            connection.close().await;
            info!(%peer, "connection closed");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NetworkConfig, TransportConfig};

    fn test_config(addr: &str) -> Config {
        Config {
            network: NetworkConfig {
                bind_address: addr.to_string(),
            },
            transport: TransportConfig::default(),
        }
    }

    #[tokio::test]
    async fn dispatch_creates_one_connection_per_peer_address() {
        let socket = Socket::bind(&test_config("127.0.0.1:0")).await.unwrap();
        let peer_a: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let peer_b: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        let data_from_a = Packet::new_data(crate::seq::SequenceNumber::new(0), Bytes::from_static(b"x"))
            .unwrap()
            .encode()
            .freeze();
        socket.dispatch(peer_a, data_from_a.clone()).await;
        socket.dispatch(peer_a, data_from_a).await;
        assert_eq!(socket.connection_count(), 1);

        let data_from_b = Packet::new_data(crate::seq::SequenceNumber::new(0), Bytes::from_static(b"y"))
            .unwrap()
            .encode()
            .freeze();
        socket.dispatch(peer_b, data_from_b).await;
        assert_eq!(socket.connection_count(), 2);
    }

    #[tokio::test]
    async fn malformed_datagram_does_not_create_a_connection() {
        let socket = Socket::bind(&test_config("127.0.0.1:0")).await.unwrap();
        let peer: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        socket.dispatch(peer, Bytes::from_static(&[0x7E, 0x01])).await;
        assert_eq!(socket.connection_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_removes_the_connection_and_stops_its_tasks() {
        let socket = Socket::bind(&test_config("127.0.0.1:0")).await.unwrap();
        let peer: SocketAddr = "127.0.0.1:40004".parse().unwrap();
        let data = Packet::new_data(crate::seq::SequenceNumber::new(0), Bytes::from_static(b"x"))
            .unwrap()
            .encode()
            .freeze();
        socket.dispatch(peer, data).await;
        assert_eq!(socket.connection_count(), 1);
        socket.disconnect(peer).await;
        assert_eq!(socket.connection_count(), 0);
    }
}
