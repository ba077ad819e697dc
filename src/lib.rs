//! A reliable, ordered, congestion-controlled datagram transport over UDP
//! (`SPEC_FULL.md` §1). The crate root re-exports the pieces an embedder
//! needs (`Config`, `Socket`, `TransportError`) and otherwise defers to its
//! modules; mirrors the teacher's `lib.rs`/`main.rs` split between a
//! library surface and a standalone binary entrypoint.

pub mod binary;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod loss_list;
pub mod packet;
pub mod receive_window;
pub mod send_queue;
pub mod seq;
pub mod socket;
pub mod stats;

pub use config::Config;
pub use error::TransportError;
pub use socket::Socket;
