// src/communication/gcode_store.rs - Bounded history of console commands and responses
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

pub const GCODE_STORE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Command,
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GcodeStoreEntry {
    pub message: String,
    /// Unix time in seconds.
    pub time: f64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug)]
pub struct GcodeStore {
    capacity: usize,
    entries: Mutex<VecDeque<GcodeStoreEntry>>,
}

impl Default for GcodeStore {
    fn default() -> Self {
        Self::new(GCODE_STORE_CAPACITY)
    }
}

impl GcodeStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn push_command(&self, message: &str) {
        self.push(message, EntryKind::Command);
    }

    pub fn push_response(&self, message: &str) {
        self.push(message, EntryKind::Response);
    }

    fn push(&self, message: &str, kind: EntryKind) {
        let entry = GcodeStoreEntry {
            message: message.to_string(),
            time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            kind,
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The most recent `count` entries (all when `None`), oldest first.
    pub fn entries(&self, count: Option<usize>) -> Vec<GcodeStoreEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = count.map_or(0, |count| entries.len().saturating_sub(count));
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_are_evicted() {
        let store = GcodeStore::new(3);
        for idx in 0..5 {
            store.push_command(&format!("G1 X{idx}"));
        }
        store.push_response("ok");
        let entries = store.entries(None);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "G1 X3");
        assert_eq!(entries[2].kind, EntryKind::Response);
        assert_eq!(store.entries(Some(1))[0].message, "ok");
        assert!(entries[0].time > 0.0);
    }
}
