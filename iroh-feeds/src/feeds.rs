//! The owner of all joined topics.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

use n0_future::task::AbortOnDropHandle;
use nested_enum_utils::common_fields;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    connectivity::Connectivity,
    key::{NotificationKey, TopicId},
    metrics::Metrics,
    persist::{PersistError, PersistedState, PersistedTopic, StateFile},
    scheduler::{self, Scheduler},
    source::{AcceptAll, Clock, NetworkSource, PersistenceSource, RecordValidator, SystemClock},
    topic::{Context, Topic, TopicSummary},
};

/// Change notifications, see [`Feeds::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A topic was joined or left.
    TopicsChanged,
    /// Records of a topic changed.
    RecordsChanged {
        /// The topic.
        topic: TopicId,
    },
    /// Records of the focused topic changed.
    MessagesChanged {
        /// The topic.
        topic: TopicId,
    },
    /// The unread count of a topic changed.
    UnreadChanged {
        /// The topic.
        topic: TopicId,
        /// The new unread count.
        unread: usize,
    },
}

/// Failed to perform a [`Feeds`] operation.
#[common_fields({
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FeedsError {
    #[snafu(display("unknown topic {id}"))]
    UnknownTopic { id: TopicId },
    #[snafu(display("failed to persist state"))]
    Persist { source: PersistError },
    #[snafu(display("feeds have been shut down"))]
    Shutdown {},
}

/// The joined topics, by id.
///
/// Only [`Feeds`] adds or removes topics; the scheduler only looks them up.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    topics: RwLock<BTreeMap<TopicId, Arc<Topic>>>,
}

impl Registry {
    pub(crate) fn get(&self, id: &TopicId) -> Option<Arc<Topic>> {
        self.topics.read().expect("poisoned").get(id).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Topic>> {
        self.topics.read().expect("poisoned").values().cloned().collect()
    }

    fn insert(&self, topic: Arc<Topic>) {
        let mut topics = self.topics.write().expect("poisoned");
        topics.insert(topic.id().clone(), topic);
    }

    fn remove(&self, id: &TopicId) -> Option<Arc<Topic>> {
        self.topics.write().expect("poisoned").remove(id)
    }
}

/// Builder for [`Feeds`].
#[derive(Debug)]
pub struct FeedsBuilder {
    persistence: Arc<dyn PersistenceSource>,
    network: Arc<dyn NetworkSource>,
    connectivity: Connectivity,
    config: Config,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn RecordValidator>,
    state_path: Option<PathBuf>,
}

impl FeedsBuilder {
    /// Sets the connectivity handle. Defaults to a handle which is offline.
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used for unread accounting.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the validator which rejects malformed records.
    pub fn validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Persists joined topics and settings to this file, and restores them on spawn.
    ///
    /// Without a state file nothing survives a restart.
    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Restores the persisted topics and starts the scheduler.
    pub async fn spawn(self) -> Feeds {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let ctx = Arc::new(Context {
            persistence: self.persistence,
            network: self.network,
            validator: self.validator,
            clock: self.clock,
            config: self.config,
            metrics: Default::default(),
            connectivity: self.connectivity,
            events,
            awaiting: Default::default(),
        });
        let state_file = self.state_path.map(StateFile::new);
        let state = match &state_file {
            Some(file) => file.load_or_default().await,
            None => PersistedState::default(),
        };

        let topics = Arc::new(Registry::default());
        for persisted in state.topics {
            topics.insert(restore_topic(persisted, &ctx));
        }

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(ctx.clone(), topics.clone(), cancel.clone()).spawn();
        let feeds = Feeds {
            inner: Arc::new(Inner {
                ctx,
                topics,
                state_file,
                display_name: Mutex::new(state.display_name),
                focused: Mutex::new(None),
                write: tokio::sync::Mutex::new(()),
                cancel,
                scheduler: Mutex::new(Some(scheduler)),
            }),
        };

        let restored = feeds.inner.topics.snapshot();
        debug!(topics = restored.len(), "restored topics");
        n0_future::join_all(
            restored
                .iter()
                .map(|topic| scheduler::hydrate(&feeds.inner.ctx, topic)),
        )
        .await;
        feeds
    }
}

fn restore_topic(persisted: PersistedTopic, ctx: &Arc<Context>) -> Arc<Topic> {
    let derived = NotificationKey::from_name(&persisted.display_name);
    if derived != persisted.key {
        warn!(
            topic = %persisted.id,
            stored = %persisted.key.fmt_short(),
            derived = %derived.fmt_short(),
            "persisted notification key differs from derived key, keeping the stored one"
        );
    }
    let topic = Topic::new(persisted.display_name, persisted.key, ctx.clone());
    if topic.id() != &persisted.id {
        warn!(stored = %persisted.id, derived = %topic.id(), "persisted topic id differs from derived id");
    }
    Arc::new(topic)
}

#[derive(Debug)]
struct Inner {
    ctx: Arc<Context>,
    topics: Arc<Registry>,
    state_file: Option<StateFile>,
    display_name: Mutex<String>,
    focused: Mutex<Option<TopicId>>,
    /// Serializes operations which change the persisted state.
    write: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    scheduler: Mutex<Option<AbortOnDropHandle<()>>>,
}

/// Live subscriptions to a set of topics.
///
/// `Feeds` owns every joined [`Topic`]. It loads their history, keeps their subscriptions
/// alive while the network is reachable and persists the list of topics. Cloning is cheap,
/// all clones refer to the same instance.
#[derive(Debug, Clone)]
pub struct Feeds {
    inner: Arc<Inner>,
}

impl Feeds {
    /// Creates a builder using the given record sources.
    pub fn builder(
        persistence: Arc<dyn PersistenceSource>,
        network: Arc<dyn NetworkSource>,
    ) -> FeedsBuilder {
        FeedsBuilder {
            persistence,
            network,
            connectivity: Connectivity::default(),
            config: Config::default(),
            clock: Arc::new(SystemClock),
            validator: Arc::new(AcceptAll),
            state_path: None,
        }
    }

    /// Joins the topic with the given name.
    ///
    /// Joining a topic which was already joined returns the existing topic. A new topic is
    /// persisted, loads its history and is activated if the network is online.
    pub async fn join(&self, name: &str) -> Result<Arc<Topic>, FeedsError> {
        self.ensure_running()?;
        let topic = {
            let _guard = self.inner.write.lock().await;
            let id = TopicId::from_name(name);
            if let Some(topic) = self.inner.topics.get(&id) {
                return Ok(topic);
            }
            let topic = Arc::new(Topic::new(
                name.to_string(),
                NotificationKey::from_name(name),
                self.inner.ctx.clone(),
            ));
            let mut state = self.persisted_state();
            state.topics.push(persisted_topic(&topic));
            self.save(&state).await?;
            self.inner.topics.insert(topic.clone());
            topic
        };
        info!(topic = %topic.id(), key = %topic.key().fmt_short(), "joined");
        self.inner.ctx.emit(Event::TopicsChanged);
        scheduler::hydrate(&self.inner.ctx, &topic).await;
        Ok(topic)
    }

    /// Leaves a topic, stopping its subscription.
    ///
    /// A join or scheduler pass still working on the topic does not activate it afterwards.
    pub async fn leave(&self, id: &TopicId) -> Result<(), FeedsError> {
        self.ensure_running()?;
        {
            let _guard = self.inner.write.lock().await;
            ensure!(
                self.inner.topics.get(id).is_some(),
                UnknownTopicSnafu { id: id.clone() }
            );
            let mut state = self.persisted_state();
            state.topics.retain(|t| &t.id != id);
            self.save(&state).await?;
            if let Some(topic) = self.inner.topics.remove(id) {
                topic.close();
            }
        }
        {
            let mut focused = self.inner.focused.lock().expect("poisoned");
            if focused.as_ref() == Some(id) {
                *focused = None;
            }
        }
        info!(topic = %id, "left");
        self.inner.ctx.emit(Event::TopicsChanged);
        Ok(())
    }

    /// Focuses a topic.
    ///
    /// Resets its unread count and marks all of its records as seen. The previously focused
    /// topic, if any, counts unread records again.
    pub fn switch_to(&self, id: &TopicId) -> Result<Arc<Topic>, FeedsError> {
        self.ensure_running()?;
        let topic = self
            .inner
            .topics
            .get(id)
            .context(UnknownTopicSnafu { id: id.clone() })?;
        let mut focused = self.inner.focused.lock().expect("poisoned");
        let previous = focused.take().filter(|previous| previous != id);
        if let Some(previous) = previous.and_then(|id| self.inner.topics.get(&id)) {
            previous.set_focused(false);
        }
        topic.set_focused(true);
        *focused = Some(id.clone());
        debug!(topic = %id, "focused");
        Ok(topic)
    }

    /// Summaries of all joined topics, ordered by id.
    pub fn list_topics(&self) -> Vec<TopicSummary> {
        self.inner
            .topics
            .snapshot()
            .iter()
            .map(|topic| topic.summary())
            .collect()
    }

    /// Returns a joined topic.
    pub fn topic(&self, id: &TopicId) -> Option<Arc<Topic>> {
        self.inner.topics.get(id)
    }

    /// The focused topic, if any.
    pub fn focused(&self) -> Option<TopicId> {
        self.inner.focused.lock().expect("poisoned").clone()
    }

    /// Subscribes to change notifications.
    ///
    /// Receivers which fall behind lose the oldest events and observe
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.ctx.events.subscribe()
    }

    /// The metrics of this instance.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.ctx.metrics
    }

    /// The connectivity handle.
    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.ctx.connectivity
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.inner.ctx.config
    }

    /// The local user's display name.
    pub fn display_name(&self) -> String {
        self.inner.display_name.lock().expect("poisoned").clone()
    }

    /// Changes and persists the local user's display name.
    pub async fn set_display_name(&self, name: impl Into<String>) -> Result<(), FeedsError> {
        self.ensure_running()?;
        let _guard = self.inner.write.lock().await;
        let mut state = self.persisted_state();
        state.display_name = name.into();
        self.save(&state).await?;
        *self.inner.display_name.lock().expect("poisoned") = state.display_name;
        Ok(())
    }

    /// Stops the scheduler and every subscription.
    ///
    /// Topics stay readable, but all operations which change state fail afterwards.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let scheduler = self.inner.scheduler.lock().expect("poisoned").take();
        if let Some(scheduler) = scheduler {
            if let Err(err) = scheduler.await {
                warn!("scheduler ended abnormally: {err}");
            }
        }
        for topic in self.inner.topics.snapshot() {
            topic.close();
        }
        debug!("shut down");
    }

    fn ensure_running(&self) -> Result<(), FeedsError> {
        ensure!(!self.inner.cancel.is_cancelled(), ShutdownSnafu);
        Ok(())
    }

    fn persisted_state(&self) -> PersistedState {
        PersistedState {
            display_name: self.display_name(),
            topics: self
                .inner
                .topics
                .snapshot()
                .iter()
                .map(|topic| persisted_topic(topic))
                .collect(),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<(), FeedsError> {
        if let Some(file) = &self.inner.state_file {
            file.save(state).await.context(PersistSnafu)?;
        }
        Ok(())
    }
}

fn persisted_topic(topic: &Topic) -> PersistedTopic {
    PersistedTopic {
        id: topic.id().clone(),
        display_name: topic.name().to_string(),
        key: topic.key(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        test_utils::{MemoryNetwork, MemoryPersistence, record},
        topic::SubscriptionState,
    };

    fn builder() -> (Arc<MemoryPersistence>, Arc<MemoryNetwork>, FeedsBuilder) {
        let persistence = Arc::new(MemoryPersistence::new());
        let network = Arc::new(MemoryNetwork::new());
        let builder = Feeds::builder(persistence.clone(), network.clone());
        (persistence, network, builder)
    }

    #[tokio::test]
    #[traced_test]
    async fn join_is_idempotent_and_case_insensitive() {
        let (_, _, builder) = builder();
        let feeds = builder.spawn().await;
        let mut events = feeds.subscribe();
        let a = feeds.join("General").await.unwrap();
        let b = feeds.join("general").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "General");
        assert_eq!(feeds.list_topics().len(), 1);
        assert_eq!(events.recv().await.unwrap(), Event::TopicsChanged);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_name_uses_sentinel() {
        let (_, _, builder) = builder();
        let feeds = builder.spawn().await;
        let topic = feeds.join("").await.unwrap();
        assert_eq!(topic.id().as_str(), crate::key::EMPTY_NAME_ID);
        assert_eq!(topic.key(), NotificationKey::from_bytes([0; 32]));
    }

    #[tokio::test]
    async fn unknown_topics_are_rejected() {
        let (_, _, builder) = builder();
        let feeds = builder.spawn().await;
        let id = TopicId::from_name("nope");
        assert!(matches!(
            feeds.switch_to(&id),
            Err(FeedsError::UnknownTopic { .. })
        ));
        assert!(matches!(
            feeds.leave(&id).await,
            Err(FeedsError::UnknownTopic { .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn leave_stops_the_subscription() {
        let (_, network, builder) = builder();
        let feeds = builder.connectivity(Connectivity::new(true)).spawn().await;
        let topic = feeds.join("general").await.unwrap();
        assert_eq!(topic.state(), SubscriptionState::Active);
        feeds.switch_to(topic.id()).unwrap();

        feeds.leave(topic.id()).await.unwrap();
        assert_eq!(topic.state(), SubscriptionState::Inactive);
        assert!(feeds.topic(topic.id()).is_none());
        assert!(feeds.focused().is_none());
        assert!(feeds.list_topics().is_empty());
        network.push(topic.key(), record(1, 10));
        tokio::task::yield_now().await;
        assert_eq!(topic.record_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn leave_during_join_does_not_subscribe() {
        let (persistence, network, builder) = builder();
        let feeds = builder.connectivity(Connectivity::new(true)).spawn().await;
        let key = NotificationKey::from_name("general");
        let gate = persistence.gate(key);
        let join = tokio::spawn({
            let feeds = feeds.clone();
            async move { feeds.join("general").await }
        });

        // The join is now waiting for the history.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while persistence.calls() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        let id = TopicId::from_name("general");
        feeds.leave(&id).await.unwrap();
        gate.notify_one();

        let topic = join.await.unwrap().unwrap();
        assert!(feeds.topic(&id).is_none());
        assert_eq!(topic.state(), SubscriptionState::Inactive);
        assert_eq!(network.subscribe_calls(), 0);
        assert_eq!(network.subscribers(key), 0);
    }

    #[tokio::test]
    async fn switching_moves_focus() {
        let (_, _, builder) = builder();
        let feeds = builder.spawn().await;
        let a = feeds.join("a").await.unwrap();
        let b = feeds.join("b").await.unwrap();

        feeds.switch_to(a.id()).unwrap();
        assert!(a.is_focused());
        feeds.switch_to(b.id()).unwrap();
        assert!(!a.is_focused());
        assert!(b.is_focused());
        assert_eq!(feeds.focused(), Some(b.id().clone()));
    }

    #[tokio::test]
    async fn operations_fail_after_shutdown() {
        let (_, _, builder) = builder();
        let feeds = builder.connectivity(Connectivity::new(true)).spawn().await;
        let topic = feeds.join("general").await.unwrap();
        feeds.shutdown().await;
        assert_eq!(topic.state(), SubscriptionState::Inactive);
        assert!(matches!(
            feeds.join("other").await,
            Err(FeedsError::Shutdown { .. })
        ));
        assert!(matches!(
            feeds.set_display_name("x").await,
            Err(FeedsError::Shutdown { .. })
        ));
        assert_eq!(feeds.list_topics().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_save_does_not_join() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the state file should be makes every save fail.
        let path = dir.path().join("state.json");
        tokio::fs::create_dir(&path).await.unwrap();
        let (_, _, builder) = builder();
        let feeds = builder.state_path(&path).spawn().await;
        assert!(matches!(
            feeds.join("general").await,
            Err(FeedsError::Persist { .. })
        ));
        assert!(feeds.list_topics().is_empty());
        assert_eq!(feeds.display_name(), crate::persist::DEFAULT_DISPLAY_NAME);
    }
}
