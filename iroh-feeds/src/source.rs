//! Interfaces to the backends records are pulled from.
//!
//! The subscription engine does not know how records are stored or transported. It only
//! asks a [`PersistenceSource`] and a [`NetworkSource`] for streams of records under a
//! [`NotificationKey`].

use std::time::SystemTime;

use n0_future::boxed::BoxStream;
use nested_enum_utils::common_fields;
use snafu::{IntoError, Snafu};

use crate::{
    key::NotificationKey,
    record::{Record, Timestamp},
};

/// A lazy, possibly infinite stream of records.
pub type RecordStream = BoxStream<Result<Record, SourceError>>;

/// Local storage of records.
pub trait PersistenceSource: Send + Sync + std::fmt::Debug + 'static {
    /// Streams all locally stored records for `key`.
    ///
    /// The stream is finite. An unknown key yields an empty stream, not an error.
    fn stream_by_key(&self, key: &NotificationKey) -> Result<RecordStream, SourceError>;
}

/// Retrieval of records from remote peers.
pub trait NetworkSource: Send + Sync + std::fmt::Debug + 'static {
    /// Pulls records for `key` from reachable peers, yielding at most `limit` records.
    ///
    /// This is best effort: with no peers reachable the stream may be empty.
    fn history(&self, key: &NotificationKey, limit: usize) -> Result<RecordStream, SourceError>;

    /// Subscribes to records pushed for `key`.
    ///
    /// Returns `None` if this backend cannot push records. Pull-only backends are kept fresh
    /// by renewing the subscription.
    fn subscribe(&self, key: &NotificationKey) -> Option<Result<RecordStream, SourceError>>;
}

/// Application level validation of records.
///
/// Records rejected here are dropped before they reach a topic.
pub trait RecordValidator: Send + Sync + std::fmt::Debug + 'static {
    /// Returns `true` if the record is well formed.
    fn validate(&self, record: &Record) -> bool;
}

/// A [`RecordValidator`] which accepts every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _record: &Record) -> bool {
        true
    }
}

/// Source of the wall clock time used as the baseline for unread accounting.
pub trait Clock: Send + Sync + std::fmt::Debug + 'static {
    /// The current time in seconds since the unix epoch.
    fn now(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// A backend failed to produce records.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SourceError {
    #[snafu(display("Source '{provenance}' error"))]
    Backend {
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl SourceError {
    /// Creates a new error from an arbitrary error type.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(
        provenance: &'static str,
        source: T,
    ) -> Self {
        BackendSnafu { provenance }.into_error(Box::new(source))
    }

    /// Creates a new error from an arbitrary boxed error type.
    pub fn from_err_box(
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    ) -> Self {
        BackendSnafu { provenance }.into_error(source)
    }

    /// The name of the backend which failed.
    pub fn provenance(&self) -> &'static str {
        match self {
            Self::Backend { provenance, .. } => *provenance,
        }
    }
}
