//! Notification Fan-out
//!
//! Relays the store's change feed to every connected queue session over a
//! tokio broadcast channel, alongside advisory editing-presence hints.
//!
//! `publish()` never blocks. A session that falls behind sees
//! `RecvError::Lagged` and resyncs; if the relay itself lags on the store
//! feed it broadcasts [`FanoutMessage::Resync`] so every session does.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::presence::PresenceHint;
use crate::store::{ChangeEvent, ChangeFeed};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutMessage {
    Change(ChangeEvent),
    Presence(PresenceHint),
    /// Upstream events were lost; every projection must re-fetch
    Resync,
}

pub struct NotificationFanout {
    sender: broadcast::Sender<FanoutMessage>,

    // Stats (atomic, no locks)
    published: AtomicU64,
    undelivered: AtomicU64,
    upstream_lagged: AtomicU64,
}

impl NotificationFanout {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
            upstream_lagged: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FanoutMessage> {
        self.sender.subscribe()
    }

    /// Deliver to every current subscriber. Never blocks.
    pub fn publish(&self, message: FanoutMessage) {
        match self.sender.send(message) {
            Ok(_) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // No subscribers connected
                self.undelivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            published: self.published.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
            upstream_lagged: self.upstream_lagged.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    /// Forward the store feed until shutdown or the feed closes.
    pub async fn relay(&self, mut feed: ChangeFeed, mut shutdown: watch::Receiver<bool>) {
        info!("Change relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                received = feed.recv() => match received {
                    Ok(event) => {
                        debug!(
                            case_id = %event.case_id,
                            table = %event.table,
                            revision = event.revision,
                            "relaying change"
                        );
                        self.publish(FanoutMessage::Change(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change relay lagged behind store feed, forcing resync");
                        self.upstream_lagged.fetch_add(missed, Ordering::Relaxed);
                        self.publish(FanoutMessage::Resync);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("store change feed closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Change relay shutting down");
    }

    /// Spawn [`NotificationFanout::relay`] onto the runtime.
    pub fn spawn_relay(
        self: &Arc<Self>,
        feed: ChangeFeed,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let fanout = Arc::clone(self);
        tokio::spawn(async move { fanout.relay(feed, shutdown).await })
    }
}

/// Fan-out statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutStats {
    pub published: u64,
    /// Messages sent while nobody was subscribed
    pub undelivered: u64,
    /// Store events the relay missed
    pub upstream_lagged: u64,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Stage;
    use crate::store::Table;
    use uuid::Uuid;

    fn event(revision: u64) -> ChangeEvent {
        ChangeEvent {
            table: Table::StageStates,
            case_id: Uuid::nil(),
            revision,
            changed_fields: vec![format!("{}_status", Stage::Lab)],
            snapshot: None,
            written_by: None,
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_counted() {
        let fanout = NotificationFanout::new(8);
        fanout.publish(FanoutMessage::Resync);
        let stats = fanout.stats();
        assert_eq!(stats.published, 0);
        assert_eq!(stats.undelivered, 1);
    }

    #[tokio::test]
    async fn test_relay_forwards_in_order_and_stops() {
        let fanout = Arc::new(NotificationFanout::new(16));
        let (store_tx, store_rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sub = fanout.subscribe();

        let handle = fanout.spawn_relay(store_rx, stop_rx);
        for rev in 1..=3 {
            store_tx.send(event(rev)).unwrap();
        }
        for rev in 1..=3 {
            match sub.recv().await.unwrap() {
                FanoutMessage::Change(ev) => assert_eq!(ev.revision, rev),
                other => panic!("unexpected {other:?}"),
            }
        }

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(fanout.stats().published, 3);
    }

    #[tokio::test]
    async fn test_upstream_lag_broadcasts_resync() {
        let fanout = Arc::new(NotificationFanout::new(16));
        let (store_tx, store_rx) = broadcast::channel(2);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut sub = fanout.subscribe();

        // Overrun the feed before the relay starts reading.
        for rev in 1..=5 {
            store_tx.send(event(rev)).unwrap();
        }
        let _handle = fanout.spawn_relay(store_rx, stop_rx);

        assert_eq!(sub.recv().await.unwrap(), FanoutMessage::Resync);
        assert!(fanout.stats().upstream_lagged >= 3);
    }
}
