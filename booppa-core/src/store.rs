use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::assessment::AssessmentData;
use crate::audit_chain::GENESIS_HASH;
use crate::error::{StoreError, ThrottleReason};
use crate::guard::ReprocessGuard;
use crate::types::*;

/// Result of a re-processing trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Bookkeeping updated; the caller should dispatch a run.
    Accepted { attempt: u32 },
    /// Guard rejected the attempt. Nothing was written.
    Throttled(ThrottleReason),
    /// A live lease exists; a run is already in progress.
    InFlight {
        holder: String,
        expires_at: DateTime<Utc>,
    },
    /// The report is `completed` or `blocked`.
    NotApplicable(ReportStatus),
}

/// Persistence for reports and their audit chains.
///
/// The workflow, dispatcher, and read boundary operate exclusively through
/// this trait. `MemoryReportStore` backs tests and the CLI; `PgReportStore`
/// (feature `postgres`) backs the worker.
#[async_trait]
pub trait ReportStore: Send + Sync {
    // ── Reports ──

    async fn create_report(&self, request: NewReport) -> Result<Report, StoreError>;
    async fn load_report(&self, id: ReportId) -> Result<Option<Report>, StoreError>;
    async fn find_by_audit_hash(&self, audit_hash: &str) -> Result<Option<Report>, StoreError>;
    async fn list_by_status(
        &self,
        status: ReportStatus,
        limit: usize,
    ) -> Result<Vec<Report>, StoreError>;

    /// Merge `patch` into `assessment_data`, validating the result.
    async fn merge_assessment(&self, id: ReportId, patch: &Patch) -> Result<Report, StoreError>;
    async fn update_report(&self, id: ReportId, update: &ReportUpdate)
        -> Result<Report, StoreError>;

    /// `merge_assessment` under a run's lease. Fails with `LeaseNotHeld`
    /// unless `fence.holder` holds a live lease at `now`; extends the lease on
    /// success.
    async fn merge_fenced(
        &self,
        id: ReportId,
        fence: &LeaseFence,
        patch: &Patch,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError>;

    /// `update_report` under a run's lease, with the same checks as
    /// `merge_fenced`.
    async fn update_fenced(
        &self,
        id: ReportId,
        fence: &LeaseFence,
        update: &ReportUpdate,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError>;

    // ── Lease ──

    /// Compare-and-swap the lease to `holder` and move the report to
    /// `processing`. Succeeds if there is no lease, the lease is expired, or
    /// `holder` already holds it.
    async fn acquire_lease(
        &self,
        id: ReportId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError>;
    async fn release_lease(&self, id: ReportId, holder: &str) -> Result<(), StoreError>;

    /// Write a terminal status, merge `patch`, and drop the lease. Only the
    /// holder of a live lease may finish a report.
    async fn finish(
        &self,
        id: ReportId,
        holder: &str,
        status: ReportStatus,
        patch: &Patch,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError>;

    // ── Re-processing ──

    /// Apply `guard` and, if accepted, bump `processing_attempts`, stamp
    /// `last_processing_attempt_at`, and reopen a `failed` report, all in one
    /// atomic update.
    async fn record_trigger(
        &self,
        id: ReportId,
        guard: &ReprocessGuard,
        now: DateTime<Utc>,
    ) -> Result<TriggerDecision, StoreError>;

    // ── Audit chain ──

    /// Append an event, linking it to the current chain tip atomically.
    async fn append_audit_event(
        &self,
        draft: AuditEventDraft,
        now: DateTime<Utc>,
    ) -> Result<AuditChainEvent, StoreError>;
    async fn audit_events(&self, report_id: ReportId) -> Result<Vec<AuditChainEvent>, StoreError>;
}

pub(crate) fn lease_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::seconds(ttl.as_secs().min(i64::MAX as u64) as i64)
}

/// Shared decision logic for `record_trigger`, applied under the backend's lock
/// or row lock.
pub(crate) fn decide_trigger(
    report: &Report,
    guard: &ReprocessGuard,
    now: DateTime<Utc>,
) -> TriggerDecision {
    if matches!(report.status, ReportStatus::Completed | ReportStatus::Blocked) {
        return TriggerDecision::NotApplicable(report.status);
    }
    if let Some(lease) = report.lease.as_ref().filter(|l| !l.is_expired(now)) {
        return TriggerDecision::InFlight {
            holder: lease.holder.clone(),
            expires_at: lease.expires_at,
        };
    }
    let data = &report.assessment_data;
    match guard.evaluate(data.attempts(), data.last_processing_attempt_at, now) {
        Ok(()) => TriggerDecision::Accepted {
            attempt: data.attempts() + 1,
        },
        Err(reason) => TriggerDecision::Throttled(reason),
    }
}

pub(crate) fn trigger_patch(attempt: u32, now: DateTime<Utc>) -> Patch {
    let mut patch = Patch::new();
    patch.insert("processing_attempts".into(), attempt.into());
    patch.insert(
        "last_processing_attempt_at".into(),
        serde_json::Value::String(now.to_rfc3339()),
    );
    patch
}

/// Lease compare-and-swap on a report already locked by the caller.
pub(crate) fn claim_lease(
    report: &mut Report,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if !report.status.is_runnable() {
        return Err(StoreError::InvalidTransition {
            id: report.id,
            from: report.status,
            to: ReportStatus::Processing,
        });
    }
    if let Some(lease) = &report.lease {
        if !lease.permits(holder, now) {
            return Err(StoreError::LeaseConflict {
                id: report.id,
                holder: lease.holder.clone(),
                expires_at: lease.expires_at,
            });
        }
    }

    report.lease = Some(Lease {
        holder: holder.to_string(),
        expires_at: now + lease_ttl(ttl),
    });
    report.status = ReportStatus::Processing;
    report.updated_at = now;
    Ok(())
}

/// Terminal transition on a locked report. Requires a live status and the
/// caller's lease.
pub(crate) fn finish_report(
    report: &mut Report,
    holder: &str,
    status: ReportStatus,
    patch: &Patch,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if !status.is_terminal() || !report.status.is_runnable() {
        return Err(StoreError::InvalidTransition {
            id: report.id,
            from: report.status,
            to: status,
        });
    }
    if !report.lease.as_ref().is_some_and(|l| l.held_by(holder, now)) {
        return Err(StoreError::LeaseNotHeld {
            id: report.id,
            holder: holder.to_string(),
        });
    }

    report.assessment_data = report.assessment_data.merged(patch)?;
    report.status = status;
    report.lease = None;
    report.updated_at = now;
    if status == ReportStatus::Completed {
        report.completed_at = Some(now);
    }
    Ok(())
}

/// Check a run's fence on a locked report and extend its lease.
pub(crate) fn renew_fence(
    report: &mut Report,
    fence: &LeaseFence,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let live = report.status.is_runnable()
        && report
            .lease
            .as_ref()
            .is_some_and(|l| l.held_by(&fence.holder, now));
    if !live {
        return Err(StoreError::LeaseNotHeld {
            id: report.id,
            holder: fence.holder.clone(),
        });
    }
    report.lease = Some(Lease {
        holder: fence.holder.clone(),
        expires_at: now + lease_ttl(fence.ttl),
    });
    report.updated_at = now;
    Ok(())
}

/// Fenced scratchpad merge on a locked report. Nothing changes on error.
pub(crate) fn merge_under_fence(
    report: &mut Report,
    fence: &LeaseFence,
    patch: &Patch,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let merged = report.assessment_data.merged(patch)?;
    renew_fence(report, fence, now)?;
    report.assessment_data = merged;
    Ok(())
}

/// Fenced column update on a locked report. Nothing changes on error.
pub(crate) fn update_under_fence(
    report: &mut Report,
    fence: &LeaseFence,
    update: &ReportUpdate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    renew_fence(report, fence, now)?;
    update.apply(report);
    Ok(())
}

/// Apply `guard` to a locked report and, if accepted, record the attempt and
/// reopen a `failed` report.
pub(crate) fn apply_trigger(
    report: &mut Report,
    guard: &ReprocessGuard,
    now: DateTime<Utc>,
) -> Result<TriggerDecision, StoreError> {
    let decision = decide_trigger(report, guard, now);
    if let TriggerDecision::Accepted { attempt } = decision {
        report.assessment_data = report
            .assessment_data
            .merged(&trigger_patch(attempt, now))?;
        if report.status == ReportStatus::Failed {
            report.status = ReportStatus::Processing;
        }
        report.updated_at = now;
    }
    Ok(decision)
}

#[derive(Default)]
struct MemoryInner {
    reports: HashMap<ReportId, Report>,
    chains: HashMap<ReportId, Vec<AuditChainEvent>>,
}

/// In-memory store. One lock covers reports and chains, so every operation
/// is atomic.
#[derive(Default)]
pub struct MemoryReportStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a report as-is. Used to seed fixtures in a given state.
    pub async fn insert(&self, report: Report) {
        self.inner.write().await.reports.insert(report.id, report);
    }
}

fn get_mut(inner: &mut MemoryInner, id: ReportId) -> Result<&mut Report, StoreError> {
    inner.reports.get_mut(&id).ok_or(StoreError::NotFound(id))
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn create_report(&self, request: NewReport) -> Result<Report, StoreError> {
        let data = AssessmentData::from_patch(&request.initial_patch())?;
        let report = Report::new(request, data);
        self.inner
            .write()
            .await
            .reports
            .insert(report.id, report.clone());
        Ok(report)
    }

    async fn load_report(&self, id: ReportId) -> Result<Option<Report>, StoreError> {
        Ok(self.inner.read().await.reports.get(&id).cloned())
    }

    async fn find_by_audit_hash(&self, audit_hash: &str) -> Result<Option<Report>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .reports
            .values()
            .filter(|r| r.audit_hash.as_deref() == Some(audit_hash))
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn list_by_status(
        &self,
        status: ReportStatus,
        limit: usize,
    ) -> Result<Vec<Report>, StoreError> {
        let inner = self.inner.read().await;
        let mut reports: Vec<Report> = inner
            .reports
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.created_at);
        reports.truncate(limit);
        Ok(reports)
    }

    async fn merge_assessment(&self, id: ReportId, patch: &Patch) -> Result<Report, StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        report.assessment_data = report.assessment_data.merged(patch)?;
        report.updated_at = Utc::now();
        Ok(report.clone())
    }

    async fn update_report(
        &self,
        id: ReportId,
        update: &ReportUpdate,
    ) -> Result<Report, StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        update.apply(report);
        report.updated_at = Utc::now();
        Ok(report.clone())
    }

    async fn merge_fenced(
        &self,
        id: ReportId,
        fence: &LeaseFence,
        patch: &Patch,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        merge_under_fence(report, fence, patch, now)?;
        Ok(report.clone())
    }

    async fn update_fenced(
        &self,
        id: ReportId,
        fence: &LeaseFence,
        update: &ReportUpdate,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        update_under_fence(report, fence, update, now)?;
        Ok(report.clone())
    }

    async fn acquire_lease(
        &self,
        id: ReportId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        claim_lease(report, holder, ttl, now)?;
        Ok(report.clone())
    }

    async fn release_lease(&self, id: ReportId, holder: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        if report.lease.as_ref().is_some_and(|l| l.holder == holder) {
            report.lease = None;
        }
        Ok(())
    }

    async fn finish(
        &self,
        id: ReportId,
        holder: &str,
        status: ReportStatus,
        patch: &Patch,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        finish_report(report, holder, status, patch, now)?;
        Ok(report.clone())
    }

    async fn record_trigger(
        &self,
        id: ReportId,
        guard: &ReprocessGuard,
        now: DateTime<Utc>,
    ) -> Result<TriggerDecision, StoreError> {
        let mut inner = self.inner.write().await;
        let report = get_mut(&mut inner, id)?;
        apply_trigger(report, guard, now)
    }

    async fn append_audit_event(
        &self,
        draft: AuditEventDraft,
        now: DateTime<Utc>,
    ) -> Result<AuditChainEvent, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.reports.contains_key(&draft.report_id) {
            return Err(StoreError::NotFound(draft.report_id));
        }

        let chain = inner.chains.entry(draft.report_id).or_default();
        let (sequence, hash_prev) = match chain.last() {
            Some(tip) => (tip.sequence + 1, tip.hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        let event = AuditChainEvent {
            id: Uuid::new_v4(),
            report_id: draft.report_id,
            sequence,
            action: draft.action,
            actor: draft.actor,
            hash_prev,
            hash: draft.hash,
            metadata: draft.metadata,
            created_at: now,
        };
        chain.push(event.clone());
        Ok(event)
    }

    async fn audit_events(&self, report_id: ReportId) -> Result<Vec<AuditChainEvent>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .chains
            .get(&report_id)
            .cloned()
            .unwrap_or_default())
    }
}
