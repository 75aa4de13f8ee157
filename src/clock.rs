//! Monotonic time and randomized election timeout generation.
//!
//! Factored out of the consensus engine so there is a single place that
//! knows how "now" and "a fresh randomized timeout" are produced; everything
//! else just calls into here.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::constants::{ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN};

/// Current monotonic instant.
pub fn now() -> Instant {
    Instant::now()
}

/// A new election timeout, uniformly sampled from
/// `[ELECTION_TIMEOUT_MIN, ELECTION_TIMEOUT_MAX]`. Regenerated on every
/// transition into the follower or candidate state so that split votes and
/// repeated timeouts resolve via randomized retry rather than lockstep.
pub fn random_election_timeout() -> Duration {
    let min = ELECTION_TIMEOUT_MIN.as_millis() as u64;
    let max = ELECTION_TIMEOUT_MAX.as_millis() as u64;
    let millis = rand::thread_rng().gen_range(min..=max);
    Duration::from_millis(millis)
}
