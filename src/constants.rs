//! Timing and sizing constants for the consensus engine.
//!
//! TODO: Many of these should eventually be overridable by a config file.

use std::time::Duration;

/// Lower bound of the randomized election timeout range.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(3000);
/// Upper bound of the randomized election timeout range.
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(6000);
/// Cadence of the leader's append-entries/heartbeat driver. Must stay well
/// under `ELECTION_TIMEOUT_MIN` or followers will start spurious elections.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
/// Poll interval of the election watchdog (10 Hz).
pub const ELECTION_WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);
/// Socket read timeout used so worker loops can observe `running` going false.
pub const SOCKET_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Per-datagram payload budget. A replication burst that would exceed this is
/// fragmented by sending fewer entries, never by splitting a single entry.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Client channel listens on `peer_port + CLIENT_PORT_OFFSET`.
pub const CLIENT_PORT_OFFSET: u16 = 100;

/// Default bind host used by the bootstrap CLI.
pub const DEFAULT_HOST: &str = "localhost";
