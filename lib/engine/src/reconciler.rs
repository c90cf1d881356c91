//! Outbox reconciler.
//!
//! Republishes two kinds of stranded queue items:
//! - items committed but never handed to the transport, e.g. because the
//!   router crashed or the broker was down right after the routing write
//! - items the transport accepted long ago that still have no execution,
//!   e.g. because the broker dropped the message
//!
//! Workers deduplicate by queue item, so publishing an item twice is
//! harmless.

use crate::error::EngineError;
use crate::queue_item::QueueItem;
use crate::store::Store;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reconciler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Delay between sweeps.
    pub interval: Duration,
    /// How old an unpublished item must be before it is republished. Keeps
    /// the sweep from racing the router's own publish.
    pub grace_period: Duration,
    /// How long a published item may go without an execution before it is
    /// published again.
    pub unexecuted_after: Duration,
    /// Maximum items republished per sweep.
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            grace_period: Duration::from_secs(30),
            unexecuted_after: Duration::from_secs(10 * 60),
            batch_size: 100,
        }
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Republishes stranded queue items.
pub struct Reconciler<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    config: ReconcilerConfig,
}

impl<S: Store, T: Transport> Reconciler<S, T> {
    /// Creates a reconciler.
    pub fn new(store: Arc<S>, transport: Arc<T>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Republishes one batch of each kind. Returns the number of items
    /// published.
    ///
    /// # Errors
    ///
    /// Returns an error if the stranded items cannot be listed.
    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let unpublished = self
            .store
            .list_unpublished(cutoff(self.config.grace_period), self.config.batch_size)
            .await?;
        let mut published = self.republish(&unpublished).await?;

        let unexecuted = self
            .store
            .list_unexecuted(cutoff(self.config.unexecuted_after), self.config.batch_size)
            .await?;
        if !unexecuted.is_empty() {
            warn!(
                count = unexecuted.len(),
                "published queue items have no execution"
            );
        }
        published += self.republish(&unexecuted).await?;

        if published > 0 {
            info!(published, "republished stranded queue items");
        }
        Ok(published)
    }

    async fn republish(&self, items: &[QueueItem]) -> Result<usize, EngineError> {
        let mut published = 0;
        for item in items {
            if let Err(e) = self.transport.publish(item).await {
                warn!(queue_item_id = %item.id, error = %e, "republish failed");
                continue;
            }
            self.store.mark_published(item.id, Utc::now()).await?;
            published += 1;
        }
        Ok(published)
    }

    /// Sweeps on a fixed interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "reconciler sweep failed");
            }
        }
    }
}
