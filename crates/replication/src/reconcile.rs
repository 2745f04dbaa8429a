//! Reconciliation sweep bounding how long a saga can stay unfinished.

use std::time::Duration;

use broker::MessageBroker;
use chrono::{DateTime, Utc};
use common::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::publisher::UserEventPublisher;
use crate::state::SagaState;
use crate::tracker::{SagaTracker, SagaTrackerStore};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending sagas failed for taking too long.
    pub timed_out: usize,
    /// Failed sagas whose `creation-failed` was announced again.
    pub republished: usize,
    /// Sagas left as they were because the tracker or broker errored.
    pub failed: usize,
}

/// Periodically fails stuck sagas and nudges stalled rollbacks.
///
/// - `Pending` longer than the timeout: record `TimedOut`, publish `creation-failed`.
/// - `Failed` with no progress for the timeout: republish `creation-failed`.
///   Compensators are idempotent, so repeating it is harmless.
pub struct ReconciliationSweep<S, B> {
    tracker: SagaTracker<S>,
    publisher: UserEventPublisher<B>,
    timeout: chrono::Duration,
}

impl<S, B> ReconciliationSweep<S, B>
where
    S: SagaTrackerStore + Clone + 'static,
    B: MessageBroker + Clone + 'static,
{
    pub fn new(tracker: SagaTracker<S>, publisher: UserEventPublisher<B>, timeout: Duration) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
        Self {
            tracker,
            publisher,
            timeout,
        }
    }

    /// Runs one pass as of `now`.
    ///
    /// A saga that cannot be settled is logged and counted in
    /// [`SweepReport::failed`]; the pass carries on with the next one.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for record in self.tracker.open_sagas().await? {
            let Some(handle) = record.handle() else {
                continue;
            };
            match record.state() {
                SagaState::Pending => {
                    let overdue = record
                        .started_at()
                        .is_some_and(|started| now - started >= self.timeout);
                    if !overdue {
                        continue;
                    }
                    tracing::warn!(%handle, missing = ?record.missing_commits(), "saga timed out");
                    match self.expire(handle, now).await {
                        Ok(true) => report.timed_out += 1,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!(%handle, error = %e, "could not time out saga");
                            report.failed += 1;
                        }
                    }
                }
                SagaState::Failed => {
                    let stalled = record
                        .updated_at()
                        .is_some_and(|updated| now - updated >= self.timeout);
                    if !stalled {
                        continue;
                    }
                    tracing::warn!(
                        %handle,
                        outstanding = ?record.outstanding_compensations(),
                        "rollback stalled, republishing failure"
                    );
                    match self.republish(handle, now).await {
                        Ok(()) => report.republished += 1,
                        Err(e) => {
                            tracing::error!(%handle, error = %e, "could not republish failure");
                            report.failed += 1;
                        }
                    }
                }
                SagaState::Replicated | SagaState::RolledBack => {}
            }
        }

        metrics::counter!("saga_timeouts_total").increment(report.timed_out as u64);
        metrics::counter!("saga_failures_republished_total").increment(report.republished as u64);
        Ok(report)
    }

    /// Times out a pending saga and announces the failure. Returns false when
    /// the saga settled before the timeout was recorded.
    async fn expire(&self, handle: Handle, now: DateTime<Utc>) -> Result<bool> {
        let record = self.tracker.timed_out(handle, now).await?;
        if record.state() != SagaState::Failed {
            tracing::debug!(%handle, state = %record.state(), "saga settled before timing out");
            return Ok(false);
        }
        self.publisher.publish_failure(handle).await?;
        Ok(true)
    }

    async fn republish(&self, handle: Handle, now: DateTime<Utc>) -> Result<()> {
        self.publisher.publish_failure(handle).await?;
        self.tracker.failure_republished(handle, now).await?;
        Ok(())
    }

    /// Runs a sweep every `interval` until `shutdown` flips or closes.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match self.sweep_once(Utc::now()).await {
                            Ok(report) if report != SweepReport::default() => {
                                tracing::info!(
                                    timed_out = report.timed_out,
                                    republished = report.republished,
                                    failed = report.failed,
                                    "reconciliation sweep finished"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "reconciliation sweep failed"),
                        }
                    }
                }
            }
            tracing::debug!("reconciliation sweep stopped");
        })
    }
}
