//! Reaper for executions nobody will finish.
//!
//! Two sweeps:
//! - `waiting` executions older than the waiting TTL fail with a timeout;
//! - `pending` and `running` executions not updated within the stale TTL
//!   were abandoned by a crashed worker and fail as such. A live executor
//!   bumps `updated_at` on every heartbeat, so the stale TTL has to stay
//!   well above the executor's heartbeat interval.
//!
//! Both use the same compare-and-set as the executor, so an execution that
//! moves while the sweep is deciding is left alone.

use crate::error::EngineError;
use crate::execution::ExecutionState;
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reaper tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Delay between sweeps.
    pub interval: Duration,
    /// How long an execution may wait for an action or callback.
    pub waiting_ttl: Duration,
    /// How long a pending or running execution may go without an update.
    pub stale_ttl: Duration,
    /// Maximum executions failed per state per sweep.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            waiting_ttl: Duration::from_secs(24 * 60 * 60),
            stale_ttl: Duration::from_secs(60 * 60),
            batch_size: 100,
        }
    }
}

/// Fails expired executions.
pub struct Reaper<S> {
    store: Arc<S>,
    config: ReaperConfig,
}

impl<S: Store> Reaper<S> {
    /// Creates a reaper.
    pub fn new(store: Arc<S>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Runs both sweeps once. Returns the number of executions failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let mut reaped = self
            .reap(
                ExecutionState::Waiting,
                self.config.waiting_ttl,
                "timed out waiting for an action or callback",
            )
            .await?;
        for state in [ExecutionState::Pending, ExecutionState::Running] {
            reaped += self
                .reap(state, self.config.stale_ttl, "abandoned by its worker")
                .await?;
        }
        Ok(reaped)
    }

    async fn reap(
        &self,
        state: ExecutionState,
        ttl: Duration,
        reason: &str,
    ) -> Result<usize, EngineError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let expired = self
            .store
            .list_executions(state, Utc::now() - ttl, self.config.batch_size)
            .await?;

        let mut reaped = 0;
        for mut execution in expired {
            execution.fail(format!("execution {reason}"))?;
            if self.store.transition_execution(&execution, state).await? {
                info!(execution_id = %execution.id, from = %state, "execution reaped");
                reaped += 1;
            }
        }
        Ok(reaped)
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
                warn!(error = %e, "reaper sweep failed");
            }
        }
    }
}
