//! The peer-channel wire format: serde-tagged JSON records, one per
//! datagram. See `4.1 Transport` in SPEC_FULL.md for the field table.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::log::LogEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: i64,
        last_log_term: u64,
    },
    VoteResponse {
        term: u64,
        voter_id: String,
        candidate_id: String,
        granted: bool,
    },
    LeaderAnnouncement {
        term: u64,
        leader_id: String,
    },
    Heartbeat {
        term: u64,
        leader_id: String,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: i64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: i64,
    },
    AppendEntriesResponse {
        term: u64,
        node_id: String,
        success: bool,
        match_index: usize,
        next_index: usize,
    },
    RemoveNode {
        removed_node: String,
    },
    StopNode,
}

impl PeerMessage {
    pub fn term(&self) -> Option<u64> {
        match self {
            PeerMessage::RequestVote { term, .. }
            | PeerMessage::VoteResponse { term, .. }
            | PeerMessage::LeaderAnnouncement { term, .. }
            | PeerMessage::Heartbeat { term, .. }
            | PeerMessage::AppendEntries { term, .. }
            | PeerMessage::AppendEntriesResponse { term, .. } => Some(*term),
            PeerMessage::RemoveNode { .. } | PeerMessage::StopNode => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Constructors in this module already respect the datagram budget;
        // this unwrap only fails for values serde_json can't represent at
        // all, which `PeerMessage`'s fields never produce.
        serde_json::to_vec(self).expect("PeerMessage always serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Builds an `append_entries` message for `entries`, trimming from the tail
/// until the serialized payload fits the per-datagram budget. Never splits a
/// single entry: if even the first entry alone doesn't fit, it is sent alone
/// anyway (oversize single entries are a caller bug, not something the
/// transport can fragment around).
pub fn build_append_entries(
    term: u64,
    leader_id: &str,
    prev_log_index: i64,
    prev_log_term: u64,
    entries: &[LogEntry],
    leader_commit: i64,
) -> PeerMessage {
    let mut count = entries.len();
    loop {
        let msg = PeerMessage::AppendEntries {
            term,
            leader_id: leader_id.to_string(),
            prev_log_index,
            prev_log_term,
            entries: entries[..count].to_vec(),
            leader_commit,
        };
        if count <= 1 || msg.encode().len() <= MAX_DATAGRAM_SIZE {
            return msg;
        }
        count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Operation;

    #[test]
    fn round_trips_through_json() {
        let msg = PeerMessage::RequestVote {
            term: 4,
            candidate_id: "Node_1".into(),
            last_log_index: 2,
            last_log_term: 3,
        };
        let bytes = msg.encode();
        let decoded = PeerMessage::decode(&bytes).unwrap();
        match decoded {
            PeerMessage::RequestVote { term, candidate_id, .. } => {
                assert_eq!(term, 4);
                assert_eq!(candidate_id, "Node_1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tag_is_the_snake_case_type_field() {
        let msg = PeerMessage::Heartbeat { term: 1, leader_id: "Node_1".into() };
        let json = String::from_utf8(msg.encode()).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
    }

    #[test]
    fn fragmentation_reduces_entry_count_not_entry_content() {
        let big_value = "x".repeat(200);
        let entries: Vec<LogEntry> = (0..20)
            .map(|i| LogEntry::new(1, Operation::Set, format!("k{i}"), Some(big_value.clone())))
            .collect();
        let msg = build_append_entries(1, "Node_1", -1, 0, &entries, -1);
        let encoded = msg.encode();
        assert!(encoded.len() <= MAX_DATAGRAM_SIZE);
        match msg {
            PeerMessage::AppendEntries { entries: sent, .. } => {
                assert!(sent.len() < entries.len());
                assert_eq!(sent[0], entries[0]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn a_single_oversize_entry_is_still_sent_alone() {
        let huge_value = "x".repeat(4096);
        let entries = vec![LogEntry::new(1, Operation::Set, "k", Some(huge_value))];
        let msg = build_append_entries(1, "Node_1", -1, 0, &entries, -1);
        match msg {
            PeerMessage::AppendEntries { entries: sent, .. } => assert_eq!(sent.len(), 1),
            _ => panic!("wrong variant"),
        }
    }
}
