//! Network connectivity signals.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

/// Capacity of the peer event channel. Lagging receivers only lose coalescable events.
const PEER_EVENTS_CAP: usize = 64;

/// Connectivity state shared between the network layer and [`Feeds`](crate::Feeds).
///
/// The network layer reports whether it is online and whenever it observes a new peer.
/// Cloning is cheap, all clones share the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    online: watch::Sender<bool>,
    peers: broadcast::Sender<()>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Connectivity {
    /// Creates a new connectivity handle with the given initial online state.
    pub fn new(online: bool) -> Self {
        let (online, _) = watch::channel(online);
        let (peers, _) = broadcast::channel(PEER_EVENTS_CAP);
        Self {
            inner: Arc::new(Inner { online, peers }),
        }
    }

    /// Whether the network is currently reachable.
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Updates the online state. Subscribers are only woken if the state changed.
    pub fn set_online(&self, online: bool) {
        self.inner.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Reports that a new peer was observed.
    pub fn peer_seen(&self) {
        // No receivers just means nobody is interested yet.
        self.inner.peers.send(()).ok();
    }

    /// Watches the online state.
    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Subscribes to peer observations.
    pub fn peer_events(&self) -> broadcast::Receiver<()> {
        self.inner.peers.subscribe()
    }
}
