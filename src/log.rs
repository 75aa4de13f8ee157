//! The append-only operation log and the in-memory state machine it drives.
//!
//! `Log` is a trait (mirroring the teacher's own `Log`/`MemoryLog` split) so
//! the consensus engine depends on an interface rather than a concrete type;
//! `MemoryLog` is the only implementation this crate ships, since durable
//! persistence is an explicit non-goal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Set,
    Update,
    Delete,
}

/// An immutable record in the log: one mutation plus the term it was
/// accepted in. `value` is `None` for `Delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub operation: Operation,
    pub key: String,
    pub value: Option<String>,
}

impl LogEntry {
    pub fn new(term: u64, operation: Operation, key: impl Into<String>, value: Option<String>) -> Self {
        LogEntry { term, operation, key: key.into(), value }
    }
}

/// Result of applying a single entry: the text a client would see for that
/// operation, or the store-level failure. Either way the entry is consumed
/// (commit index advances over it) — a failed `Update`/`Delete` does not
/// roll anything back, it just never touched the store.
pub type ApplyResult = Result<String, StoreError>;

pub trait Log: Send {
    /// Appends `entry` at the tail, returning its index.
    fn append(&mut self, entry: LogEntry) -> usize;

    fn get(&self, index: usize) -> Option<&LogEntry>;

    /// Entries at index `from..`, as a fresh vector (peer actors send this
    /// across a thread boundary).
    fn entries_from(&self, from: usize) -> Vec<LogEntry>;

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the last entry, or -1 if the log is empty.
    fn last_index(&self) -> i64;
    /// Term of the last entry, or 0 if the log is empty.
    fn last_term(&self) -> u64;

    /// Highest index known to be committed, or -1 if nothing has been
    /// committed yet.
    fn commit_index(&self) -> i64;

    /// The standard Raft "is the other log at least as up to date as mine"
    /// test: a higher last term wins outright; on a tie, a longer (or equal)
    /// log wins.
    fn is_up_to_date(&self, candidate_last_term: u64, candidate_last_index: i64) -> bool {
        if candidate_last_term != self.last_term() {
            candidate_last_term > self.last_term()
        } else {
            candidate_last_index >= self.last_index()
        }
    }

    /// Applies every entry in `(commit_index, min(target, last_index)]`, in
    /// order, then advances `commit_index` to the last index actually
    /// applied. Returns the per-index apply results, in order.
    fn commit_to(&mut self, target: i64) -> Vec<(usize, ApplyResult)>;

    /// Discards entries at indices `>= from`. Rejected (no-op, returns
    /// `false`) when `from` would touch already-committed history.
    fn truncate_suffix(&mut self, from: usize) -> bool;

    fn store_get(&self, key: &str) -> Option<String>;
    fn store_keys(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
    store: HashMap<String, String>,
    commit_index: i64,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog { entries: Vec::new(), store: HashMap::new(), commit_index: -1 }
    }

    fn apply(&mut self, entry: &LogEntry) -> ApplyResult {
        match entry.operation {
            Operation::Set => {
                if self.store.contains_key(&entry.key) {
                    Err(StoreError::KeyExists)
                } else {
                    let value = entry.value.clone().unwrap_or_default();
                    self.store.insert(entry.key.clone(), value.clone());
                    Ok(format!("SUCCESS: {} -> {} added.", entry.key, value))
                }
            }
            Operation::Update => {
                if self.store.contains_key(&entry.key) {
                    let value = entry.value.clone().unwrap_or_default();
                    self.store.insert(entry.key.clone(), value.clone());
                    Ok(format!("SUCCESS: {} updated to {}.", entry.key, value))
                } else {
                    Err(StoreError::KeyNotFound)
                }
            }
            Operation::Delete => {
                if self.store.remove(&entry.key).is_some() {
                    Ok(format!("SUCCESS: {} removed.", entry.key))
                } else {
                    Err(StoreError::KeyNotFound)
                }
            }
        }
    }
}

impl Log for MemoryLog {
    fn append(&mut self, entry: LogEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    fn entries_from(&self, from: usize) -> Vec<LogEntry> {
        if from >= self.entries.len() {
            Vec::new()
        } else {
            self.entries[from..].to_vec()
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn last_index(&self) -> i64 {
        self.entries.len() as i64 - 1
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn commit_index(&self) -> i64 {
        self.commit_index
    }

    fn commit_to(&mut self, target: i64) -> Vec<(usize, ApplyResult)> {
        let last_index = self.last_index();
        let target = target.min(last_index);
        let mut results = Vec::new();
        let mut i = self.commit_index + 1;
        while i <= target {
            let idx = i as usize;
            let result = self.apply(&self.entries[idx].clone());
            results.push((idx, result));
            self.commit_index = i;
            i += 1;
        }
        results
    }

    fn truncate_suffix(&mut self, from: usize) -> bool {
        if (from as i64) <= self.commit_index {
            return false;
        }
        self.entries.truncate(from);
        true
    }

    fn store_get(&self, key: &str) -> Option<String> {
        self.store.get(key).cloned()
    }

    fn store_keys(&self) -> Vec<String> {
        self.store.keys().cloned().collect()
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;

    pub fn random_entry_with_term(term: u64) -> LogEntry {
        LogEntry::new(term, Operation::Set, format!("key-{}", rand::random::<u32>()), Some("v".into()))
    }

    pub fn entries_with_term(count: usize, term: u64) -> Vec<LogEntry> {
        (0..count).map(|_| random_entry_with_term(term)).collect()
    }

    pub fn log_with_entries(entries: Vec<LogEntry>) -> MemoryLog {
        let mut log = MemoryLog::new();
        for e in entries {
            log.append(e);
        }
        log
    }
}
