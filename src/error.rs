//! Crate-level error taxonomy.
//!
//! Mirrors the teacher's one-enum-per-concern style (`RakNetError`,
//! `ConfigError`, `BinaryError`): each module that can fail owns its own
//! error enum, and `TransportError` aggregates them with `#[from]` so
//! callers at the Socket boundary can use `?` without manual `map_err`.

use crate::binary::BinaryError;
use crate::config::ConfigError;
use crate::packet::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("packet codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("binary I/O error: {0}")]
    Binary(#[from] BinaryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
