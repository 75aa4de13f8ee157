//! Per-node term/vote/role bookkeeping.
//!
//! Everything in `NodeState` lives behind one `Mutex` in `Node` (mirroring
//! the teacher's single `ServerState` lock) so that role, term and vote
//! transitions are serialized as a unit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug)]
pub struct NodeState {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub votes_received: usize,
    pub leader_hint: Option<String>,
    /// peer id -> address, mutable under membership change.
    pub peers: HashMap<String, SocketAddr>,
    /// peer id -> index of the next log entry to send that peer. Only
    /// meaningful while this node is leader, but kept populated across role
    /// changes so a re-elected leader doesn't have to reconstruct it from
    /// scratch (it's re-initialized to `len(log)` on every election win
    /// regardless, per spec).
    pub next_index: HashMap<String, usize>,
    pub commit_index: i64,
    pub last_heartbeat: Instant,
    pub election_timeout: Duration,
}

impl NodeState {
    pub fn new(peers: HashMap<String, SocketAddr>) -> Self {
        NodeState {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            votes_received: 0,
            leader_hint: None,
            peers,
            next_index: HashMap::new(),
            commit_index: -1,
            last_heartbeat: clock::now(),
            election_timeout: clock::random_election_timeout(),
        }
    }

    /// Any state, on seeing a message with `term > current_term`: adopt the
    /// term, clear the vote, fall back to follower. Returns `true` if a
    /// transition happened.
    pub fn note_term_seen(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.role = Role::Follower;
            self.election_timeout = clock::random_election_timeout();
            true
        } else {
            false
        }
    }

    pub fn record_heartbeat(&mut self, leader_id: impl Into<String>) {
        self.last_heartbeat = clock::now();
        self.leader_hint = Some(leader_id.into());
    }

    /// follower|candidate -> candidate: bump term, vote for self, reset the
    /// timeout. Returns the new term for convenience.
    pub fn transition_to_candidate(&mut self, self_id: &str) -> u64 {
        debug_assert!(self.role == Role::Follower || self.role == Role::Candidate);
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self_id.to_string());
        self.votes_received = 1;
        self.election_timeout = clock::random_election_timeout();
        self.last_heartbeat = clock::now();
        self.current_term
    }

    /// candidate -> leader, on a strict majority of votes.
    pub fn transition_to_leader(&mut self, self_id: &str, log_len: usize) {
        debug_assert!(self.role == Role::Candidate);
        self.role = Role::Leader;
        self.leader_hint = Some(self_id.to_string());
        self.next_index.clear();
        for peer_id in self.peers.keys() {
            self.next_index.insert(peer_id.clone(), log_len);
        }
    }

    /// follower|candidate|leader -> follower, on contact (`append_entries`,
    /// `heartbeat` or `leader_announcement`) from a recognized leader at or
    /// above the current term: adopts the term, clears the vote, resets the
    /// election timeout, and records the contact.
    pub fn transition_to_follower(&mut self, term: u64, leader_id: impl Into<String>) {
        self.current_term = term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.election_timeout = clock::random_election_timeout();
        self.record_heartbeat(leader_id);
    }

    pub fn has_election_timeout_elapsed(&self) -> bool {
        clock::now().duration_since(self.last_heartbeat) > self.election_timeout
    }

    /// Strict majority of the full cluster (self + peers), per
    /// `votes_received > (|peers| + 1) / 2`.
    pub fn has_election_majority(&self) -> bool {
        self.votes_received > (self.peers.len() + 1) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> HashMap<String, SocketAddr> {
        (0..n)
            .map(|i| (format!("peer-{i}"), "127.0.0.1:9000".parse().unwrap()))
            .collect()
    }

    #[test]
    fn candidate_votes_for_self() {
        let mut state = NodeState::new(peers(2));
        let term = state.transition_to_candidate("me");
        assert_eq!(term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("me"));
        assert_eq!(state.votes_received, 1);
        assert_eq!(state.role, Role::Candidate);
    }

    #[test]
    fn majority_of_three() {
        let mut state = NodeState::new(peers(2));
        state.transition_to_candidate("me");
        assert!(!state.has_election_majority());
        state.votes_received = 2;
        assert!(state.has_election_majority());
    }

    #[test]
    fn higher_term_forces_follower_and_clears_vote() {
        let mut state = NodeState::new(peers(2));
        state.transition_to_candidate("me");
        assert!(state.note_term_seen(5));
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.current_term, 5);
    }

    #[test]
    fn lower_or_equal_term_is_a_noop() {
        let mut state = NodeState::new(peers(2));
        state.transition_to_candidate("me");
        assert!(!state.note_term_seen(1));
        assert_eq!(state.role, Role::Candidate);
    }

    #[test]
    fn leader_reinitializes_next_index_to_log_length() {
        let mut state = NodeState::new(peers(2));
        state.transition_to_candidate("me");
        state.transition_to_leader("me", 7);
        for v in state.next_index.values() {
            assert_eq!(*v, 7);
        }
    }

    #[test]
    fn transition_to_follower_adopts_term_and_records_contact() {
        let mut state = NodeState::new(peers(2));
        state.transition_to_candidate("me");
        state.transition_to_follower(9, "leader-1");
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.current_term, 9);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.leader_hint.as_deref(), Some("leader-1"));
    }
}
