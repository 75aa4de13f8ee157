//! Error taxonomy for the consensus engine and the state machine it drives.
//!
//! `RaftError` covers internal transport/protocol failures: these are always
//! logged and discarded at the point of failure (see `7. ERROR HANDLING
//! DESIGN` in SPEC_FULL.md), never surfaced to a client. `StoreError` covers
//! the two store-level failures a client can actually observe.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed peer message: {0}")]
    Protocol(String),

    #[error("log error: {0}")]
    Log(String),

    #[error("Invalid address format. Use host:port.")]
    InvalidAddress(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Key not found.")]
    KeyNotFound,
    #[error("Key already exists.")]
    KeyExists,
}
