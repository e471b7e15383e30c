//! Task dispatch.
//!
//! `TaskDispatcher::dispatch` is fire-and-forget: it enqueues a report id on a
//! bounded channel. `DispatchWorker` drains the channel, running at most
//! `concurrency` workflows at once. A run that ends `failed` is re-enqueued
//! after `base_delay · 2^(n-1)` until `max_retries` re-runs have been made;
//! after that the report stays `failed`.
//!
//! Retries go through `ReportStore::record_trigger`, so they share the
//! `processing_attempts` counter with poll-triggered re-runs.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

use crate::error::PipelineError;
use crate::guard::ReprocessGuard;
use crate::retry::RetryPolicy;
use crate::store::{ReportStore, TriggerDecision};
use crate::types::{ReportId, ReportStatus};
use crate::workflow::{ReportWorkflow, WorkflowOutcome};

/// Hands a report to the background workers.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, report_id: ReportId) -> Result<(), PipelineError>;
}

/// Re-enqueue policy for failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRetry {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DispatchRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl DispatchRetry {
    /// Delay before re-run `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
        .delay_for(retry)
    }

    /// Guard applied when a retry is due. The delay already spaces retries,
    /// so only the ceiling is enforced.
    pub fn guard(&self) -> ReprocessGuard {
        ReprocessGuard::new(self.max_retries, Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    sender: mpsc::Sender<ReportId>,
}

impl TaskDispatcher {
    /// Dispatcher plus the queue a `DispatchWorker` drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ReportId>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Dispatch for TaskDispatcher {
    async fn dispatch(&self, report_id: ReportId) -> Result<(), PipelineError> {
        self.sender
            .send(report_id)
            .await
            .map_err(|_| PipelineError::Task("dispatch queue closed".into()))?;
        tracing::debug!(report_id = %report_id, "Report dispatched");
        Ok(())
    }
}

/// Enqueue every `pending` report and every `processing` report whose lease
/// has expired. Returns how many were dispatched.
pub async fn requeue_stalled(
    store: &dyn ReportStore,
    dispatcher: &dyn Dispatch,
    limit: usize,
) -> Result<usize, PipelineError> {
    let now = Utc::now();
    let mut stalled = store.list_by_status(ReportStatus::Pending, limit).await?;
    stalled.extend(
        store
            .list_by_status(ReportStatus::Processing, limit)
            .await?
            .into_iter()
            .filter(|r| r.lease.as_ref().map_or(true, |l| l.is_expired(now))),
    );

    for report in &stalled {
        dispatcher.dispatch(report.id).await?;
    }
    if !stalled.is_empty() {
        tracing::info!(count = stalled.len(), "Re-queued stalled reports");
    }
    Ok(stalled.len())
}

pub struct DispatchWorker {
    workflow: ReportWorkflow,
    dispatcher: TaskDispatcher,
    retry: DispatchRetry,
    concurrency: usize,
}

impl DispatchWorker {
    pub fn new(
        workflow: ReportWorkflow,
        dispatcher: TaskDispatcher,
        retry: DispatchRetry,
        concurrency: usize,
    ) -> Self {
        Self {
            workflow,
            dispatcher,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Drain `queue` until it closes or `shutdown` flips. In-flight runs are
    /// awaited; pending retry timers are dropped (their reports stay
    /// `failed` and can be re-triggered later).
    pub async fn run(&self, mut queue: mpsc::Receiver<ReportId>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(holder = %self.workflow.holder(), concurrency = self.concurrency, "DispatchWorker started");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut runs: JoinSet<(ReportId, Result<WorkflowOutcome, PipelineError>)> = JoinSet::new();
        let mut retries: JoinSet<()> = JoinSet::new();

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            tokio::select! {
                received = queue.recv() => match received {
                    Some(report_id) => self.spawn_run(&mut runs, permits.clone(), report_id),
                    None => {
                        tracing::info!("DispatchWorker queue closed");
                        break;
                    }
                },
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    self.after_run(joined, &mut retries);
                }
                Some(_) = retries.join_next(), if !retries.is_empty() => {}
                _ = shutdown.changed() => {
                    tracing::info!("DispatchWorker shutting down");
                    break;
                }
            }
        }

        retries.abort_all();
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Workflow task panicked");
            }
        }
        tracing::info!("DispatchWorker stopped");
    }

    fn spawn_run(
        &self,
        runs: &mut JoinSet<(ReportId, Result<WorkflowOutcome, PipelineError>)>,
        permits: Arc<Semaphore>,
        report_id: ReportId,
    ) {
        let workflow = self.workflow.clone();
        runs.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => workflow.run(report_id).await,
                Err(e) => Err(PipelineError::Task(e.to_string())),
            };
            (report_id, result)
        });
    }

    fn after_run(
        &self,
        joined: Result<(ReportId, Result<WorkflowOutcome, PipelineError>), tokio::task::JoinError>,
        retries: &mut JoinSet<()>,
    ) {
        let (report_id, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "Workflow task panicked");
                return;
            }
        };

        match result {
            Ok(_) => {}
            Err(
                e @ (PipelineError::NotFound(_)
                | PipelineError::NotRunnable { .. }
                | PipelineError::LeaseHeld { .. }
                | PipelineError::LeaseLost { .. }),
            ) => {
                tracing::debug!(report_id = %report_id, error = %e, "Dispatch skipped");
            }
            Err(_) => {
                let store = self.workflow.store().clone();
                let dispatcher = self.dispatcher.clone();
                let retry = self.retry;
                retries.spawn(async move {
                    retry_later(store, dispatcher, retry, report_id).await;
                });
            }
        }
    }
}

async fn retry_later(
    store: Arc<dyn ReportStore>,
    dispatcher: TaskDispatcher,
    retry: DispatchRetry,
    report_id: ReportId,
) {
    let attempts = match store.load_report(report_id).await {
        Ok(Some(report)) => report.assessment_data.attempts(),
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(report_id = %report_id, error = %e, "Could not load report for retry");
            return;
        }
    };

    let next = attempts + 1;
    if next > retry.max_retries {
        tracing::warn!(
            report_id = %report_id,
            attempts,
            "Report permanently failed after max retries"
        );
        return;
    }

    let delay = retry.delay_for(next);
    tracing::info!(report_id = %report_id, retry = next, delay_secs = delay.as_secs(), "Scheduling retry");
    tokio::time::sleep(delay).await;

    match store.record_trigger(report_id, &retry.guard(), Utc::now()).await {
        Ok(TriggerDecision::Accepted { attempt }) => {
            if let Err(e) = dispatcher.dispatch(report_id).await {
                tracing::warn!(report_id = %report_id, attempt, error = %e, "Retry dispatch failed");
            }
        }
        Ok(decision) => {
            tracing::debug!(report_id = %report_id, decision = ?decision, "Retry not needed");
        }
        Err(e) => tracing::warn!(report_id = %report_id, error = %e, "Retry bookkeeping failed"),
    }
}
