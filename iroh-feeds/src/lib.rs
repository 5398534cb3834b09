//! Live topic subscriptions over a content-addressed peer-to-peer network.
//!
//! A topic is named by a 32 byte [`NotificationKey`]. Joining a topic through [`Feeds`]
//! backfills it from local persistence, then merges network history and live pushes into a
//! single ordered, deduplicated record list with unread tracking. Subscriptions are activated
//! when the network comes online, renewed before they go stale and rehydrated when new peers
//! show up.
//!
//! Record storage and transport are not part of this crate. They are plugged in through the
//! [`PersistenceSource`] and [`NetworkSource`] traits.
//!
//! The stream merging primitive used for each topic is available on its own in [`merge`].
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(iroh_docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod connectivity;
mod feeds;
pub mod key;
pub mod ledger;
pub mod merge;
pub mod metrics;
pub mod persist;
pub mod record;
mod scheduler;
pub mod source;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
mod topic;

pub use self::{
    config::Config,
    connectivity::Connectivity,
    feeds::{Event, Feeds, FeedsBuilder, FeedsError},
    key::{NotificationKey, TopicId},
    record::{Record, RecordKey, Timestamp},
    source::{NetworkSource, PersistenceSource, SourceError},
    topic::{SubscriptionState, Topic, TopicSummary},
};
