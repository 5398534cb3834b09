use std::{sync::Arc, time::Duration};

use iroh_feeds::{
    Config, Connectivity, Event, Feeds, NotificationKey, Record, SubscriptionState, TopicId,
    test_utils::{ManualClock, MemoryNetwork, MemoryPersistence, record},
};
use pretty_assertions::assert_eq;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn timestamps(records: &[Record]) -> Vec<u64> {
    records.iter().map(Record::timestamp).collect()
}

#[tokio::test]
async fn offline_join_then_online() {
    setup_logging();
    let persistence = Arc::new(MemoryPersistence::new());
    let network = Arc::new(MemoryNetwork::new());
    let connectivity = Connectivity::new(false);
    let key = NotificationKey::from_name("general");
    for (seed, ts) in [(1, 10), (2, 20), (3, 30)] {
        persistence.insert(key, record(seed, ts));
    }
    let feeds = Feeds::builder(persistence.clone(), network.clone())
        .connectivity(connectivity.clone())
        .clock(Arc::new(ManualClock::new(35)))
        .spawn()
        .await;

    let general = feeds.join("general").await.unwrap();
    assert_eq!(timestamps(&general.records()), vec![10, 20, 30]);
    assert_eq!(general.unread(), 0);
    assert_eq!(general.state(), SubscriptionState::AwaitingConnectivity);

    connectivity.set_online(true);
    wait_for(|| general.is_active()).await;
    assert_eq!(network.push(key, record(4, 40)), 1);
    wait_for(|| general.record_count() == 4).await;
    assert_eq!(timestamps(&general.records()), vec![10, 20, 30, 40]);
    assert_eq!(general.unread(), 1);

    feeds.switch_to(general.id()).unwrap();
    assert_eq!(general.unread(), 0);
}

#[tokio::test]
async fn history_and_live_are_deduplicated() {
    setup_logging();
    let persistence = Arc::new(MemoryPersistence::new());
    let network = Arc::new(MemoryNetwork::new());
    let key = NotificationKey::from_name("rust");
    persistence.insert(key, record(1, 10));
    network.insert_history(key, record(1, 10));
    network.insert_history(key, record(2, 5));
    let feeds = Feeds::builder(persistence, network.clone())
        .connectivity(Connectivity::new(true))
        .clock(Arc::new(ManualClock::new(100)))
        .spawn()
        .await;

    let topic = feeds.join("Rust").await.unwrap();
    wait_for(|| topic.record_count() == 2).await;
    network.push(key, record(1, 10));
    network.push(key, record(2, 5));
    network.push(key, record(3, 150));
    wait_for(|| topic.record_count() == 3).await;
    assert_eq!(timestamps(&topic.records()), vec![5, 10, 150]);
    assert_eq!(topic.unread(), 1);
    assert_eq!(feeds.metrics().records_duplicate.get(), 3);
}

#[tokio::test]
async fn topics_are_restored() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.json");
    let persistence = Arc::new(MemoryPersistence::new());
    let network = Arc::new(MemoryNetwork::new());
    persistence.insert(NotificationKey::from_name("general"), record(1, 10));

    let feeds = Feeds::builder(persistence.clone(), network.clone())
        .state_path(&path)
        .spawn()
        .await;
    assert_eq!(feeds.display_name(), "anonymous");
    feeds.join("General").await.unwrap();
    feeds.join("").await.unwrap();
    feeds.set_display_name("alice").await.unwrap();
    feeds.shutdown().await;
    drop(feeds);

    let feeds = Feeds::builder(persistence, network)
        .state_path(&path)
        .spawn()
        .await;
    assert_eq!(feeds.display_name(), "alice");
    let topics = feeds.list_topics();
    let ids: Vec<_> = topics.iter().map(|t| t.id.as_str().to_string()).collect();
    assert_eq!(ids, vec!["#EMPTY", "general"]);
    let general = feeds.topic(&TopicId::from_name("general")).unwrap();
    assert_eq!(general.name(), "General");
    assert!(general.is_history_loaded());
    assert_eq!(general.record_count(), 1);
    assert_eq!(general.state(), SubscriptionState::AwaitingConnectivity);
}

#[tokio::test]
async fn mismatched_stored_key_wins() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.json");
    let stored = NotificationKey::from_bytes([7; 32]);
    let state = serde_json::json!({
        "displayName": "bob",
        "topics": [{
            "id": "general",
            "displayName": "general",
            "notificationKeyHex": stored.to_hex().to_uppercase(),
        }],
    });
    tokio::fs::write(&path, serde_json::to_vec(&state).unwrap())
        .await
        .unwrap();

    let persistence = Arc::new(MemoryPersistence::new());
    persistence.insert(stored, record(1, 10));
    let feeds = Feeds::builder(persistence, Arc::new(MemoryNetwork::new()))
        .state_path(&path)
        .spawn()
        .await;
    let general = feeds.topic(&TopicId::from_name("general")).unwrap();
    assert_eq!(general.key(), stored);
    assert_eq!(general.record_count(), 1);
}

#[tokio::test]
async fn events_follow_changes() {
    setup_logging();
    let network = Arc::new(MemoryNetwork::new());
    let feeds = Feeds::builder(Arc::new(MemoryPersistence::new()), network.clone())
        .connectivity(Connectivity::new(true))
        .clock(Arc::new(ManualClock::new(0)))
        .spawn()
        .await;
    let mut events = feeds.subscribe();
    let topic = feeds.join("general").await.unwrap();
    assert_eq!(events.recv().await.unwrap(), Event::TopicsChanged);

    network.push(topic.key(), record(1, 10));
    let id = topic.id().clone();
    assert_eq!(
        events.recv().await.unwrap(),
        Event::RecordsChanged { topic: id.clone() }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        Event::UnreadChanged {
            topic: id.clone(),
            unread: 1
        }
    );

    feeds.leave(&id).await.unwrap();
    assert_eq!(events.recv().await.unwrap(), Event::TopicsChanged);
}

#[tokio::test(start_paused = true)]
async fn pull_only_backends_are_renewed() {
    setup_logging();
    let network = Arc::new(MemoryNetwork::pull_only());
    let config = Config::default()
        .with_renew_check_interval(Duration::from_secs(1))
        .with_renew_after(Duration::from_secs(5));
    let feeds = Feeds::builder(Arc::new(MemoryPersistence::new()), network.clone())
        .connectivity(Connectivity::new(true))
        .config(config)
        .spawn()
        .await;
    let topic = feeds.join("general").await.unwrap();
    assert_eq!(network.history_calls(), 1);
    assert_eq!(network.subscribe_calls(), 0);

    network.insert_history(topic.key(), record(1, 10));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(network.history_calls(), 2);
    wait_for(|| topic.record_count() == 1).await;
    assert!(topic.is_active());
}
