//! Ordered, deduplicated record accumulation for a single topic.

use std::collections::HashSet;

use tracing::trace;

use crate::record::{Origin, Record, RecordKey, Timestamp};

/// How far back from the tail a new record is compared before falling back to a binary
/// search. Records mostly arrive in order, so the scan usually stops after one step.
const INSERT_SCAN_LIMIT: usize = 32;

/// Result of [`Ledger::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The record key was delivered before, nothing changed.
    Duplicate,
    /// The record was inserted at `index`.
    Admitted {
        /// Position of the new record in the ordered record list.
        index: usize,
        /// Whether the unread count was incremented.
        unread: bool,
    },
}

impl Admission {
    /// Whether the record was new.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// The records of a topic, ordered by embedded timestamp and unique by key.
///
/// Ties between equal timestamps keep arrival order.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    records: Vec<Record>,
    processed: HashSet<RecordKey>,
    seen: HashSet<RecordKey>,
    unread: usize,
    baseline: Timestamp,
    focused: bool,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes a record through deduplication, ordering and unread accounting.
    pub fn admit(&mut self, record: Record, origin: Origin) -> Admission {
        let key = record.key();
        if !self.processed.insert(key) {
            trace!(key = %key.fmt_short(), %origin, "ledger: duplicate");
            return Admission::Duplicate;
        }
        if origin == Origin::History {
            self.seen.insert(key);
        }

        let unread = origin == Origin::Live
            && record.timestamp() > self.baseline
            && !self.seen.contains(&key)
            && !self.focused;
        if unread {
            self.unread += 1;
        }

        let index = self.insert_position(record.timestamp());
        self.records.insert(index, record);
        trace!(key = %key.fmt_short(), %origin, index, unread, "ledger: admitted");
        Admission::Admitted { index, unread }
    }

    fn insert_position(&self, timestamp: Timestamp) -> usize {
        let len = self.records.len();
        let floor = len.saturating_sub(INSERT_SCAN_LIMIT);
        let mut index = len;
        while index > floor {
            if self.records[index - 1].timestamp() <= timestamp {
                return index;
            }
            index -= 1;
        }
        if index == 0 {
            return 0;
        }
        self.records[..index].partition_point(|r| r.timestamp() <= timestamp)
    }

    /// Marks the topic as focused or not.
    ///
    /// Focusing resets the unread count, moves the unread baseline to `now` and marks every
    /// loaded record as seen.
    pub fn set_focused(&mut self, focused: bool, now: Timestamp) {
        self.focused = focused;
        if focused {
            self.unread = 0;
            self.baseline = now;
            self.seen.extend(self.records.iter().map(Record::key));
        }
    }

    /// Moves the unread baseline, records older than this never count as unread.
    pub fn set_baseline(&mut self, now: Timestamp) {
        self.baseline = now;
    }

    /// The ordered records.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records were admitted yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of unread records.
    pub fn unread(&self) -> usize {
        self.unread
    }

    /// The current unread baseline.
    pub fn baseline(&self) -> Timestamp {
        self.baseline
    }

    /// Whether the ledger belongs to the focused topic.
    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Whether a record key was ever delivered.
    pub fn is_processed(&self, key: &RecordKey) -> bool {
        self.processed.contains(key)
    }

    /// Whether a record key was exposed to the user.
    pub fn is_seen(&self, key: &RecordKey) -> bool {
        self.seen.contains(key)
    }
}
