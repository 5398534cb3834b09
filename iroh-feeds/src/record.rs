//! Records delivered to topics.

use std::fmt::{self, Debug, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch, as embedded in a record.
pub type Timestamp = u64;

/// The content derived key of a record.
///
/// Unique per record and used for deduplication.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey([u8; 32]);

impl RecordKey {
    /// Creates a record key from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Formats the first five bytes as hex, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl From<[u8; 32]> for RecordKey {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({})", self.fmt_short())
    }
}

/// An immutable unit of content, as produced by a persistence or network backend.
///
/// The subscription engine never creates records itself; it only orders and deduplicates
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: RecordKey,
    timestamp: Timestamp,
    payload: Bytes,
}

impl Record {
    /// Creates a new record.
    pub fn new(key: impl Into<RecordKey>, timestamp: Timestamp, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            timestamp,
            payload: payload.into(),
        }
    }

    /// The content derived key.
    pub fn key(&self) -> RecordKey {
        self.key
    }

    /// The timestamp embedded in the record.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The opaque payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Where an admitted record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Origin {
    /// One-shot backfill from local persistence.
    History,
    /// Delivered while a subscription was active.
    Live,
}
