//! The subscription lifecycle of a single topic.
//!
//! A [`Topic`] owns its [`Ledger`] and, while active, one [`Merge`] of the network history
//! pull and the live push stream. The merged stream is consumed by a task which feeds every
//! record through the ledger. Deactivating cancels the merge and aborts that task; activating
//! again always builds a fresh merge.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use n0_future::{
    StreamExt,
    task::{self, AbortOnDropHandle},
};
use tokio::{sync::broadcast, time::Instant};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    config::Config,
    connectivity::Connectivity,
    feeds::Event,
    key::{NotificationKey, TopicId},
    ledger::{Admission, Ledger},
    merge::{InputCompletion, Merge, MergeHandle},
    metrics::Metrics,
    record::{Origin, Record},
    source::{Clock, NetworkSource, PersistenceSource, RecordValidator, SourceError},
};

/// Subscription state of a [`Topic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionState {
    /// No live subscription.
    Inactive,
    /// The local history is being loaded.
    HistoryLoading,
    /// Records are streamed from the network.
    Active,
    /// The subscription is being rebuilt.
    Renewing,
    /// Activation is deferred until the network comes online.
    AwaitingConnectivity,
}

/// Everything a topic needs from its owner.
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) persistence: Arc<dyn PersistenceSource>,
    pub(crate) network: Arc<dyn NetworkSource>,
    pub(crate) validator: Arc<dyn RecordValidator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Config,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) connectivity: Connectivity,
    pub(crate) events: broadcast::Sender<Event>,
    /// Topics waiting for the network to come online.
    pub(crate) awaiting: Mutex<BTreeSet<TopicId>>,
}

impl Context {
    pub(crate) fn emit(&self, event: Event) {
        // No receivers is fine.
        self.events.send(event).ok();
    }

    /// Removes and returns all topics waiting for connectivity.
    pub(crate) fn take_awaiting(&self) -> BTreeSet<TopicId> {
        std::mem::take(&mut *self.awaiting.lock().expect("poisoned"))
    }
}

struct Subscription {
    handle: MergeHandle<Record, SourceError>,
    _task: AbortOnDropHandle<()>,
    activated_at: Instant,
    live: Option<InputCompletion>,
    generation: u64,
}

struct Lifecycle {
    state: SubscriptionState,
    subscription: Option<Subscription>,
    history_loaded: bool,
    generation: u64,
    /// The last activation failed, or its merged stream did.
    failed: bool,
    /// The topic was left. Nothing activates it again.
    closed: bool,
}

/// Overview of a topic, as listed by [`Feeds::list_topics`](crate::Feeds::list_topics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSummary {
    /// The topic id.
    pub id: TopicId,
    /// The display name the topic was joined with.
    pub name: String,
    /// The notification key.
    pub key: NotificationKey,
    /// Number of unread records.
    pub unread: usize,
    /// Subscription state.
    pub state: SubscriptionState,
    /// Number of loaded records.
    pub records: usize,
}

/// A joined topic.
///
/// Obtained from [`Feeds::join`](crate::Feeds::join). All operations serialize internally, so
/// a topic can be shared freely between tasks.
pub struct Topic {
    id: TopicId,
    name: String,
    key: NotificationKey,
    ctx: Arc<Context>,
    ledger: Mutex<Ledger>,
    lifecycle: Mutex<Lifecycle>,
    history: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Topic {
    pub(crate) fn new(name: String, key: NotificationKey, ctx: Arc<Context>) -> Self {
        Self {
            id: TopicId::from_name(&name),
            name,
            key,
            ctx,
            ledger: Mutex::new(Ledger::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: SubscriptionState::Inactive,
                subscription: None,
                history_loaded: false,
                generation: 0,
                failed: false,
                closed: false,
            }),
            history: tokio::sync::Mutex::new(()),
        }
    }

    /// The topic id.
    pub fn id(&self) -> &TopicId {
        &self.id
    }

    /// The display name the topic was joined with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The notification key.
    pub fn key(&self) -> NotificationKey {
        self.key
    }

    /// A snapshot of the records, ordered by timestamp.
    pub fn records(&self) -> Vec<Record> {
        self.ledger.lock().expect("poisoned").records().to_vec()
    }

    /// Number of loaded records.
    pub fn record_count(&self) -> usize {
        self.ledger.lock().expect("poisoned").len()
    }

    /// Number of unread records.
    pub fn unread(&self) -> usize {
        self.ledger.lock().expect("poisoned").unread()
    }

    /// Whether this is the focused topic.
    pub fn is_focused(&self) -> bool {
        self.ledger.lock().expect("poisoned").is_focused()
    }

    /// The subscription state.
    pub fn state(&self) -> SubscriptionState {
        self.lifecycle.lock().expect("poisoned").state
    }

    /// Whether the local history was loaded successfully.
    pub fn is_history_loaded(&self) -> bool {
        self.lifecycle.lock().expect("poisoned").history_loaded
    }

    /// Whether a live subscription is running.
    pub fn is_active(&self) -> bool {
        self.lifecycle.lock().expect("poisoned").is_active()
    }

    /// Summarizes the topic.
    pub fn summary(&self) -> TopicSummary {
        let (unread, records) = {
            let ledger = self.ledger.lock().expect("poisoned");
            (ledger.unread(), ledger.len())
        };
        TopicSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            key: self.key,
            unread,
            state: self.state(),
            records,
        }
    }

    /// Loads the locally persisted records, once.
    ///
    /// Historical records never count as unread. On failure the records loaded so far are
    /// kept and a later call retries.
    pub async fn load_history(&self) -> Result<(), SourceError> {
        let _guard = self.history.lock().await;
        {
            let lifecycle = self.lifecycle.lock().expect("poisoned");
            if lifecycle.history_loaded || lifecycle.closed {
                return Ok(());
            }
        }
        self.transition(SubscriptionState::Inactive, SubscriptionState::HistoryLoading);
        let res = self.pull_history().await;
        self.transition(SubscriptionState::HistoryLoading, SubscriptionState::Inactive);
        let count = res?;
        self.lifecycle.lock().expect("poisoned").history_loaded = true;
        debug!(topic = %self.id, count, "history loaded");
        Ok(())
    }

    async fn pull_history(&self) -> Result<usize, SourceError> {
        let mut stream = self.ctx.persistence.stream_by_key(&self.key)?;
        let mut count = 0;
        while let Some(record) = stream.next().await {
            if self.admit(record?, Origin::History) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Starts the live subscription.
    ///
    /// Does nothing if the topic is already active. While offline the topic is parked until
    /// the network comes online.
    pub fn activate(self: &Arc<Self>) -> Result<(), SourceError> {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        self.activate_locked(&mut lifecycle)
    }

    fn activate_locked(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> Result<(), SourceError> {
        if lifecycle.closed {
            debug!(topic = %self.id, "topic was left, not activating");
            return Ok(());
        }
        if lifecycle.is_active() {
            return Ok(());
        }
        if !self.ctx.connectivity.is_online() {
            self.ctx
                .awaiting
                .lock()
                .expect("poisoned")
                .insert(self.id.clone());
            // The network may have come online while we registered.
            if !self.ctx.connectivity.is_online() {
                debug!(topic = %self.id, "offline, awaiting connectivity");
                lifecycle.state = SubscriptionState::AwaitingConnectivity;
                // The online transition retries it.
                lifecycle.failed = false;
                return Ok(());
            }
            self.ctx.awaiting.lock().expect("poisoned").remove(&self.id);
        }

        let streams = self
            .ctx
            .network
            .history(&self.key, self.ctx.config.history_limit)
            .and_then(|history| {
                let live = self.ctx.network.subscribe(&self.key).transpose()?;
                Ok((history, live))
            });
        let (history, live) = match streams {
            Ok(streams) => streams,
            Err(err) => {
                lifecycle.state = SubscriptionState::Inactive;
                lifecycle.failed = true;
                return Err(err);
            }
        };

        let mut merge = Merge::new();
        merge.add_input(history);
        let push = live.is_some();
        let live = live.map(|stream| merge.add_input(stream));
        let handle = merge.handle();
        handle.set_endless(true);

        self.ledger
            .lock()
            .expect("poisoned")
            .set_baseline(self.ctx.clock.now());
        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let task = task::spawn(
            consume(Arc::downgrade(self), merge, generation)
                .instrument(error_span!("feeds.topic", topic = %self.id)),
        );
        lifecycle.subscription = Some(Subscription {
            handle,
            _task: AbortOnDropHandle::new(task),
            activated_at: Instant::now(),
            live,
            generation,
        });
        lifecycle.state = SubscriptionState::Active;
        lifecycle.failed = false;
        self.ctx.metrics.activations.inc();
        debug!(topic = %self.id, push, generation, "activated");
        Ok(())
    }

    /// Stops the live subscription. Safe to call when inactive.
    pub fn deactivate(&self) {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        self.deactivate_locked(&mut lifecycle);
    }

    fn deactivate_locked(&self, lifecycle: &mut Lifecycle) {
        self.ctx.awaiting.lock().expect("poisoned").remove(&self.id);
        self.teardown(lifecycle);
        lifecycle.failed = false;
        if lifecycle.state != SubscriptionState::HistoryLoading {
            lifecycle.state = SubscriptionState::Inactive;
        }
    }

    /// Deactivates the topic for good.
    ///
    /// Activations, renewals and history loads which are still in flight, or which run later
    /// on a reference taken before, do nothing.
    pub(crate) fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        lifecycle.closed = true;
        self.deactivate_locked(&mut lifecycle);
    }

    /// Replaces the live subscription with a fresh one.
    ///
    /// The topic is [`SubscriptionState::Renewing`] between tearing down the old subscription
    /// and starting the new one. A deactivation in between wins.
    pub fn renew(self: &Arc<Self>) -> Result<(), SourceError> {
        if !self.begin_renew() {
            return Ok(());
        }
        self.finish_renew()
    }

    fn begin_renew(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        if lifecycle.closed {
            return false;
        }
        self.teardown(&mut lifecycle);
        lifecycle.state = SubscriptionState::Renewing;
        self.ctx.metrics.renewals.inc();
        debug!(topic = %self.id, "renewing");
        true
    }

    fn finish_renew(self: &Arc<Self>) -> Result<(), SourceError> {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        if lifecycle.state != SubscriptionState::Renewing {
            debug!(topic = %self.id, state = %lifecycle.state, "renewal superseded");
            return Ok(());
        }
        self.activate_locked(&mut lifecycle)
    }

    fn teardown(&self, lifecycle: &mut Lifecycle) {
        if let Some(subscription) = lifecycle.subscription.take() {
            subscription.handle.cancel();
            // Dropping the subscription aborts the consumer task.
            drop(subscription);
            self.ctx.metrics.deactivations.inc();
            debug!(topic = %self.id, "deactivated");
        }
    }

    /// Whether the subscription should be renewed.
    ///
    /// True if the topic was active for at least `renew_after`, or if its live stream ended.
    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        if lifecycle.state != SubscriptionState::Active {
            return false;
        }
        let renew_after = self.ctx.config.renew_after;
        match lifecycle.subscription.as_mut() {
            Some(subscription) => {
                now.saturating_duration_since(subscription.activated_at) >= renew_after
                    || subscription
                        .live
                        .as_mut()
                        .and_then(InputCompletion::outcome)
                        .is_some()
            }
            None => false,
        }
    }

    /// Whether the topic never hydrated successfully.
    pub(crate) fn needs_rehydration(&self) -> bool {
        !self.is_active() || self.ledger.lock().expect("poisoned").is_empty()
    }

    /// Whether loading the history or the last activation failed.
    pub(crate) fn needs_retry(&self) -> bool {
        let lifecycle = self.lifecycle.lock().expect("poisoned");
        !lifecycle.closed
            && (lifecycle.failed
                || (!lifecycle.history_loaded
                    && lifecycle.state != SubscriptionState::HistoryLoading))
    }

    /// Focuses or unfocuses the topic.
    pub(crate) fn set_focused(&self, focused: bool) {
        let cleared = {
            let mut ledger = self.ledger.lock().expect("poisoned");
            let unread = ledger.unread();
            ledger.set_focused(focused, self.ctx.clock.now());
            unread != ledger.unread()
        };
        if cleared {
            self.ctx.emit(Event::UnreadChanged {
                topic: self.id.clone(),
                unread: 0,
            });
        }
    }

    /// Runs a record through validation and the ledger. Returns whether it was new.
    fn admit(&self, record: Record, origin: Origin) -> bool {
        let metrics = &self.ctx.metrics;
        if !self.ctx.validator.validate(&record) {
            debug!(topic = %self.id, key = %record.key().fmt_short(), "dropping malformed record");
            metrics.records_malformed.inc();
            return false;
        }
        let (admission, unread, focused) = {
            let mut ledger = self.ledger.lock().expect("poisoned");
            let admission = ledger.admit(record, origin);
            (admission, ledger.unread(), ledger.is_focused())
        };
        match admission {
            Admission::Duplicate => {
                metrics.records_duplicate.inc();
                false
            }
            Admission::Admitted {
                unread: incremented,
                ..
            } => {
                metrics.records_admitted.inc();
                self.ctx.emit(Event::RecordsChanged {
                    topic: self.id.clone(),
                });
                if focused {
                    self.ctx.emit(Event::MessagesChanged {
                        topic: self.id.clone(),
                    });
                }
                if incremented {
                    metrics.unread_increments.inc();
                    self.ctx.emit(Event::UnreadChanged {
                        topic: self.id.clone(),
                        unread,
                    });
                }
                true
            }
        }
    }

    fn on_stream_failed(&self, generation: u64) {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        let current = lifecycle
            .subscription
            .as_ref()
            .is_some_and(|s| s.generation == generation);
        if current && lifecycle.state == SubscriptionState::Active {
            lifecycle.state = SubscriptionState::Inactive;
            lifecycle.failed = true;
        }
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) {
        let mut lifecycle = self.lifecycle.lock().expect("poisoned");
        if lifecycle.state == from {
            lifecycle.state = to;
        }
    }
}

impl Lifecycle {
    fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active && self.subscription.is_some()
    }
}

async fn consume(topic: Weak<Topic>, mut merge: Merge<Record, SourceError>, generation: u64) {
    while let Some(item) = merge.next().await {
        let Some(topic) = topic.upgrade() else {
            break;
        };
        match item {
            Ok(record) => {
                topic.admit(record, Origin::Live);
            }
            Err(err) => {
                warn!(provenance = err.provenance(), "record stream failed: {err:#}");
                topic.ctx.metrics.source_failures.inc();
                topic.on_stream_failed(generation);
                break;
            }
        }
    }
    trace!(generation, "consumer finished");
}
