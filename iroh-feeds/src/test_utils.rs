//! In-memory collaborators for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use n0_future::{StreamExt, stream};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    key::NotificationKey,
    record::{Record, Timestamp},
    source::{Clock, NetworkSource, PersistenceSource, RecordStream, SourceError},
};

/// Creates a record whose key is `seed` repeated.
pub fn record(seed: u8, timestamp: Timestamp) -> Record {
    Record::new([seed; 32], timestamp, vec![seed])
}

fn injected(provenance: &'static str) -> SourceError {
    SourceError::from_err(provenance, std::io::Error::other("injected failure"))
}

fn failing_stream(provenance: &'static str) -> RecordStream {
    Box::pin(stream::once(Err(injected(provenance))))
}

/// A [`PersistenceSource`] backed by a map.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<NotificationKey, Vec<Record>>>,
    failing: Mutex<HashSet<NotificationKey>>,
    gates: Mutex<HashMap<NotificationKey, Arc<Notify>>>,
    calls: AtomicUsize,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record under `key`.
    pub fn insert(&self, key: NotificationKey, record: Record) {
        let mut records = self.records.lock().expect("poisoned");
        records.entry(key).or_default().push(record);
    }

    /// If set, streams for `key` yield an error instead of records.
    pub fn set_failing(&self, key: NotificationKey, failing: bool) {
        let mut keys = self.failing.lock().expect("poisoned");
        if failing {
            keys.insert(key);
        } else {
            keys.remove(&key);
        }
    }

    /// Holds back the next stream for `key` until the returned gate is notified.
    pub fn gate(&self, key: NotificationKey) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .expect("poisoned")
            .insert(key, gate.clone());
        gate
    }

    /// Number of streams requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PersistenceSource for MemoryPersistence {
    fn stream_by_key(&self, key: &NotificationKey) -> Result<RecordStream, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().expect("poisoned").contains(key) {
            return Ok(failing_stream("memory-persistence"));
        }
        let records = self
            .records
            .lock()
            .expect("poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default();
        let records = stream::iter(records.into_iter().map(Ok));
        match self.gates.lock().expect("poisoned").remove(key) {
            Some(gate) => {
                let opened = stream::once_future(async move { gate.notified().await })
                    .filter_map(|()| None::<Result<Record, SourceError>>);
                Ok(Box::pin(opened.chain(records)))
            }
            None => Ok(Box::pin(records)),
        }
    }
}

type LiveSender = mpsc::UnboundedSender<Result<Record, SourceError>>;

/// A [`NetworkSource`] with scriptable history and manually pushed live records.
#[derive(Debug)]
pub struct MemoryNetwork {
    history: Mutex<HashMap<NotificationKey, Vec<Record>>>,
    live: Mutex<HashMap<NotificationKey, Vec<LiveSender>>>,
    push: AtomicBool,
    failing_history: AtomicBool,
    unreachable: AtomicBool,
    history_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Creates a network which supports push subscriptions.
    pub fn new() -> Self {
        Self {
            history: Default::default(),
            live: Default::default(),
            push: AtomicBool::new(true),
            failing_history: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            history_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Creates a network which only supports history pulls.
    pub fn pull_only() -> Self {
        let network = Self::new();
        network.push.store(false, Ordering::SeqCst);
        network
    }

    /// Makes `record` available to history pulls for `key`.
    pub fn insert_history(&self, key: NotificationKey, record: Record) {
        let mut history = self.history.lock().expect("poisoned");
        history.entry(key).or_default().push(record);
    }

    /// If set, history pulls yield an error instead of records.
    pub fn set_failing_history(&self, failing: bool) {
        self.failing_history.store(failing, Ordering::SeqCst);
    }

    /// If set, history pulls fail right away instead of yielding a stream.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Pushes a record to all live subscribers of `key`.
    ///
    /// Returns the number of subscribers reached.
    pub fn push(&self, key: NotificationKey, record: Record) -> usize {
        self.send(key, || Ok(record.clone()))
    }

    /// Fails the live streams of all subscribers of `key`.
    pub fn fail_live(&self, key: NotificationKey) -> usize {
        self.send(key, || Err(injected("memory-network")))
    }

    /// Ends the live streams of all subscribers of `key`.
    pub fn end_live(&self, key: NotificationKey) {
        self.live.lock().expect("poisoned").remove(&key);
    }

    /// Number of subscribers of `key` whose stream is still consumed.
    pub fn subscribers(&self, key: NotificationKey) -> usize {
        let mut live = self.live.lock().expect("poisoned");
        let Some(senders) = live.get_mut(&key) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    /// Number of history pulls so far.
    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Number of subscriptions so far.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    fn send(
        &self,
        key: NotificationKey,
        mut item: impl FnMut() -> Result<Record, SourceError>,
    ) -> usize {
        let mut live = self.live.lock().expect("poisoned");
        let Some(senders) = live.get_mut(&key) else {
            return 0;
        };
        senders.retain(|tx| tx.send(item()).is_ok());
        senders.len()
    }
}

impl NetworkSource for MemoryNetwork {
    fn history(&self, key: &NotificationKey, limit: usize) -> Result<RecordStream, SourceError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(injected("memory-network"));
        }
        if self.failing_history.load(Ordering::SeqCst) {
            return Ok(failing_stream("memory-network"));
        }
        let records: Vec<_> = self
            .history
            .lock()
            .expect("poisoned")
            .get(key)
            .map(|records| records.iter().take(limit).cloned().collect())
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(records.into_iter().map(Ok))))
    }

    fn subscribe(&self, key: &NotificationKey) -> Option<Result<RecordStream, SourceError>> {
        if !self.push.load(Ordering::SeqCst) {
            return None;
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut live = self.live.lock().expect("poisoned");
        live.entry(*key).or_default().push(tx);
        Some(Ok(Box::pin(UnboundedReceiverStream::new(rx))))
    }
}

/// A [`Clock`] which only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Creates a clock standing at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self(AtomicU64::new(now))
    }

    /// Sets the time.
    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}
