//! A small replicated in-memory key-value store built on a leader-election
//! and log-replication consensus engine. See SPEC_FULL.md for the module
//! breakdown; each file here corresponds to one of its sections.

pub mod clock;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod log;
pub mod message;
pub mod node;
pub mod peer;
pub mod state;
pub mod supervisor;
