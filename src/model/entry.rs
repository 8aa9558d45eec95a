//! Per-message cache entries and the in-memory cache store.

use chrono::{DateTime, FixedOffset};

use crate::model::flags::{SystemFlags, UserFlags};
use crate::record::{Length, Offset, RecordView};

/// Compact metadata for one message, owned by its stream.
///
/// Entries are indexed 1..N and never reused after expunge — indices
/// compact downward while UIDs stay permanent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Permanent UID, assigned once at scan time, never reassigned.
    pub uid: u64,

    /// System flags as currently known (may be ahead of disk until the
    /// next flag write or close-time sync).
    pub system: SystemFlags,

    /// User-flag bitmap (see the per-stream keyword table for names).
    pub user: UserFlags,

    /// Transient: delivered since the last session (no `OLD` marker on
    /// disk when scanned). Never persisted.
    pub recent: bool,

    /// Transient: matched the most recent search. Never persisted.
    pub searched: bool,

    /// Arrival timestamp from the internal header.
    pub date: DateTime<FixedOffset>,

    /// Absolute file offset of the internal header line.
    pub internal_offset: Offset,

    /// Length of the internal header line, terminator included.
    pub header_len: Length,

    /// Exact byte length of the message text.
    pub rfc822_len: Length,
}

impl CacheEntry {
    /// Byte geometry of this message's record.
    pub fn view(&self) -> RecordView {
        RecordView {
            offset: self.internal_offset,
            header_len: self.header_len,
            body_len: self.rfc822_len,
        }
    }

    pub fn deleted(&self) -> bool {
        self.system.contains(SystemFlags::DELETED)
    }

    pub fn seen(&self) -> bool {
        self.system.contains(SystemFlags::SEEN)
    }
}

/// Pure in-memory container of cache entries. No I/O.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: Vec<CacheEntry>,
}

impl CacheStore {
    pub fn new() -> CacheStore {
        CacheStore {
            entries: Vec::new(),
        }
    }

    /// Fetch by 1-based sequence number.
    pub fn get(&self, seqno: usize) -> Option<&CacheEntry> {
        seqno.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub fn get_mut(&mut self, seqno: usize) -> Option<&mut CacheEntry> {
        seqno.checked_sub(1).and_then(|i| self.entries.get_mut(i))
    }

    pub fn append(&mut self, entry: CacheEntry) {
        self.entries.push(entry);
    }

    /// Remove the given 1-based sequence numbers and renumber the rest
    /// contiguously. Returns how many entries were removed.
    pub fn remove_and_compact(&mut self, seqnos: &[usize]) -> usize {
        let before = self.entries.len();
        let mut keep = vec![true; before];
        for &s in seqnos {
            if let Some(i) = s.checked_sub(1) {
                if i < before {
                    keep[i] = false;
                }
            }
        }
        let mut i = 0;
        self.entries.retain(|_| {
            let k = keep[i];
            i += 1;
            k
        });
        before - self.entries.len()
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn recent(&self) -> usize {
        self.entries.iter().filter(|e| e.recent).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
        self.entries.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End offset of the last record, i.e. what parsed-size must equal in
    /// a consistent stream (0 when empty).
    pub fn end_of_last(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.view().end().get())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
