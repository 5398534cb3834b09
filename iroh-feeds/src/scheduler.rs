//! Decides when topic subscriptions are (re)built.
//!
//! The scheduler is an actor reacting to three triggers: the network coming online, bursts of
//! peer discoveries and a periodic renewal timer. Every pass is best effort. Failures of one
//! topic are logged and counted, and never keep the pass from reaching the other topics. A
//! topic whose history load or activation failed is retried by the next renewal check and the
//! next online transition.

use std::{collections::BTreeSet, sync::Arc};

use n0_future::task::{self, AbortOnDropHandle};
use tokio::{
    sync::{broadcast, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    feeds::Registry,
    source::SourceError,
    topic::{Context, Topic},
};

/// Loads the history of a topic and activates it.
///
/// Activation is deferred by the topic itself while offline.
pub(crate) async fn hydrate(ctx: &Context, topic: &Arc<Topic>) {
    let history = topic.load_history().await;
    isolate(ctx, topic, "load history", history);
    isolate(ctx, topic, "activate", topic.activate());
}

fn isolate(ctx: &Context, topic: &Topic, op: &'static str, res: Result<(), SourceError>) {
    if let Err(err) = res {
        warn!(topic = %topic.id(), "failed to {op}: {err:#}");
        ctx.metrics.scheduler_failures.inc();
    }
}

#[derive(Debug)]
pub(crate) struct Scheduler {
    ctx: Arc<Context>,
    topics: Arc<Registry>,
    online: watch::Receiver<bool>,
    peers: broadcast::Receiver<()>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(ctx: Arc<Context>, topics: Arc<Registry>, cancel: CancellationToken) -> Self {
        let online = ctx.connectivity.watch_online();
        let peers = ctx.connectivity.peer_events();
        Self {
            ctx,
            topics,
            online,
            peers,
            cancel,
        }
    }

    pub(crate) fn spawn(self) -> AbortOnDropHandle<()> {
        AbortOnDropHandle::new(task::spawn(
            self.run().instrument(error_span!("feeds.scheduler")),
        ))
    }

    async fn run(mut self) {
        let check = self.ctx.config.renew_check_interval;
        let mut renew = time::interval_at(Instant::now() + check, check);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut debounce: Option<Instant> = None;
        let mut peers_open = true;

        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("shutdown requested, stopping scheduler");
                    break;
                }
                res = self.online.changed() => {
                    trace!(?i, "tick: online");
                    if res.is_err() {
                        debug!("connectivity handle dropped, stopping scheduler");
                        break;
                    }
                    let online = *self.online.borrow_and_update();
                    if online {
                        self.on_online().await;
                    }
                }
                res = self.peers.recv(), if peers_open => {
                    trace!(?i, "tick: peer");
                    match res {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            debounce = Some(Instant::now() + self.ctx.config.peer_debounce);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            peers_open = false;
                        }
                    }
                }
                _ = time::sleep_until(debounce.unwrap_or_else(Instant::now)), if debounce.is_some() => {
                    trace!(?i, "tick: debounce");
                    debounce = None;
                    self.rehydrate().await;
                }
                _ = renew.tick() => {
                    trace!(?i, "tick: renew");
                    self.renew_stale().await;
                }
            }
        }
    }

    async fn on_online(&self) {
        let awaiting = self.ctx.take_awaiting();
        let failed: BTreeSet<_> = self
            .topics
            .snapshot()
            .into_iter()
            .filter(|topic| topic.needs_retry() && !awaiting.contains(topic.id()))
            .map(|topic| topic.id().clone())
            .collect();
        debug!(
            awaiting = awaiting.len(),
            failed = failed.len(),
            "online, activating waiting topics"
        );
        self.ctx.metrics.retries.inc_by(failed.len() as u64);
        for id in awaiting.into_iter().chain(failed) {
            // Topics left in the meantime are skipped.
            if let Some(topic) = self.topics.get(&id) {
                hydrate(&self.ctx, &topic).await;
            }
        }
    }

    /// Retries topics which have no subscription or no records.
    async fn rehydrate(&self) {
        self.ctx.metrics.rehydration_passes.inc();
        let topics: Vec<_> = self
            .topics
            .snapshot()
            .into_iter()
            .filter(|topic| topic.needs_rehydration())
            .collect();
        debug!(topics = topics.len(), "peer discovered, rehydrating");
        for topic in topics {
            if topic.is_active() {
                // Active but empty: pull the network history again.
                let history = topic.load_history().await;
                isolate(&self.ctx, &topic, "load history", history);
                isolate(&self.ctx, &topic, "renew", topic.renew());
            } else {
                hydrate(&self.ctx, &topic).await;
            }
        }
    }

    /// Renews stale subscriptions and retries failed topics.
    async fn renew_stale(&self) {
        let now = Instant::now();
        for topic in self.topics.snapshot() {
            if topic.is_stale(now) {
                isolate(&self.ctx, &topic, "renew", topic.renew());
            } else if topic.needs_retry() {
                debug!(topic = %topic.id(), "retrying failed topic");
                self.ctx.metrics.retries.inc();
                hydrate(&self.ctx, &topic).await;
            }
        }
    }
}
