//! Report workflow
//!
//! `ReportWorkflow::run` drives one report from `pending`/`processing` to a
//! terminal status. Every step persists its output into the report context
//! before the next one starts, and every step is safe to repeat, so a crashed
//! run is recovered by running the report again from the top.
//!
//! The run holds the report's lease for its whole duration. Every write it
//! makes is fenced by that lease and renews it; once the lease lapses or is
//! taken over, the run stops without writing again. Non-fatal step failures become
//! markers in `assessment_data` and the run continues. Fatal failures end the
//! run as `failed` with the error text recorded.

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::anchor::LedgerAnchor;
use crate::assessment::{patch_from, StepError};
use crate::audit_chain::AuditChain;
use crate::error::{truncate_chars, LedgerError, PipelineError, StoreError, ERROR_TEXT_LIMIT};
use crate::hasher::{canonical_timestamp, digest_value, EvidencePayload};
use crate::narrative::{Narrative, NarrativeGenerator, ScanPayload};
use crate::notify::Notifier;
use crate::policy::{self, TierPolicy};
use crate::render::{ArtifactRenderer, ArtifactSnapshot, ArtifactStore, StoredArtifact};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::scanner::Scanner;
use crate::screenshot::{CaptureOutcome, ScreenshotChain};
use crate::store::ReportStore;
use crate::types::{LeaseFence, Patch, Report, ReportId, ReportStatus, ReportUpdate};

/// Proof format advertised by the verification registry.
pub const PROOF_FORMAT: &str = "BOOPPA-PROOF-SG";
/// Version of the digest canonicalization and verification payload.
pub const PROOF_SCHEMA_VERSION: &str = "1.0";

/// External collaborators used by a workflow run.
#[derive(Clone)]
pub struct Collaborators {
    pub scanner: Arc<dyn Scanner>,
    pub narrator: Arc<dyn NarrativeGenerator>,
    /// Anchoring is attempted for eligible reports only when set.
    pub anchor: Option<LedgerAnchor>,
    pub screenshots: ScreenshotChain,
    pub renderer: Arc<dyn ArtifactRenderer>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        narrator: Arc<dyn NarrativeGenerator>,
        renderer: Arc<dyn ArtifactRenderer>,
        artifacts: Arc<dyn ArtifactStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            scanner,
            narrator,
            anchor: None,
            screenshots: ScreenshotChain::default(),
            renderer,
            artifacts,
            notifier,
        }
    }

    pub fn with_anchor(mut self, anchor: LedgerAnchor) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn with_screenshots(mut self, screenshots: ScreenshotChain) -> Self {
        self.screenshots = screenshots;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub resolve_timeout: Duration,
    pub metadata_timeout: Duration,
    pub narrative_timeout: Duration,
    pub anchor_timeout: Duration,
    pub render_timeout: Duration,
    /// Per attempt; the artifact step retries under `artifact_retry`.
    pub store_timeout: Duration,
    pub notify_timeout: Duration,
    /// Extended on every write the run makes, so it must outlast the
    /// longest single step (see `step_budgets`).
    pub lease_ttl: Duration,
    pub artifact_retry: RetryPolicy,
    pub verify_base_url: String,
    /// Complete paid reports without rendering or storing an artifact.
    pub skip_artifact_generation: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(15),
            metadata_timeout: Duration::from_secs(15),
            narrative_timeout: Duration::from_secs(60),
            anchor_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(60),
            store_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(300),
            artifact_retry: RetryPolicy::ARTIFACT_STORE,
            verify_base_url: "https://www.booppa.io".to_string(),
            skip_artifact_generation: false,
        }
    }
}

impl WorkflowSettings {
    /// Worst-case wall time of each step between two lease renewals.
    pub fn step_budgets(&self) -> [(&'static str, Duration); 6] {
        [
            ("resolve_url", self.resolve_timeout),
            ("site_metadata", self.metadata_timeout),
            ("narrative", self.narrative_timeout),
            ("anchor", self.anchor_timeout),
            (
                "store_artifact",
                self.render_timeout + self.artifact_retry.worst_case(self.store_timeout),
            ),
            ("notify", self.notify_timeout),
        ]
    }
}

/// How a completed report reached its requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Rendered and stored artifact.
    Pdf,
    /// Tier without artifacts, or artifact generation switched off.
    NoPdf,
    /// Shown on the requester's page only.
    OnPage,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::NoPdf => "no_pdf",
            Self::OnPage => "on_page",
        }
    }
}

/// Terminal result of a run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowOutcome {
    pub report_id: ReportId,
    pub status: ReportStatus,
    pub delivery: Option<Delivery>,
    pub blocked_reason: Option<String>,
    pub audit_hash: Option<String>,
    pub tx_hash: Option<String>,
    pub artifact_url: Option<String>,
}

impl WorkflowOutcome {
    fn from_report(report: &Report, delivery: Option<Delivery>, blocked_reason: Option<String>) -> Self {
        Self {
            report_id: report.id,
            status: report.status,
            delivery,
            blocked_reason,
            audit_hash: report.audit_hash.clone(),
            tx_hash: report.tx_hash.clone(),
            artifact_url: report.artifact_url.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ReportWorkflow {
    store: Arc<dyn ReportStore>,
    audit: AuditChain,
    collaborators: Collaborators,
    settings: WorkflowSettings,
    holder: String,
}

impl ReportWorkflow {
    pub fn new(
        store: Arc<dyn ReportStore>,
        collaborators: Collaborators,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            audit: AuditChain::new(store.clone()),
            store,
            collaborators,
            settings,
            holder: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Use a fixed lease holder name instead of a generated one.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn fence(&self) -> LeaseFence {
        LeaseFence {
            holder: self.holder.clone(),
            ttl: self.settings.lease_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReportStore> {
        &self.store
    }

    /// Process one report to a terminal status.
    ///
    /// Returns the outcome for `completed` and `blocked` runs. A fatal step
    /// error is persisted as `failed` and then returned. Lease and status
    /// conflicts are returned without touching the report.
    pub async fn run(&self, report_id: ReportId) -> Result<WorkflowOutcome, PipelineError> {
        let report = self.claim(report_id).await?;
        tracing::info!(
            report_id = %report_id,
            holder = %self.holder,
            framework = %report.framework,
            "Processing report"
        );

        match self.process(report).await {
            Ok(outcome) => {
                tracing::info!(
                    report_id = %report_id,
                    status = %outcome.status,
                    delivery = outcome.delivery.map(|d| d.as_str()).unwrap_or("-"),
                    "Report processed"
                );
                Ok(outcome)
            }
            Err(e @ PipelineError::LeaseLost { .. }) => {
                tracing::warn!(report_id = %report_id, error = %e, "Lease lost, abandoning run");
                Err(e)
            }
            Err(e) => {
                self.record_failure(report_id, &e).await;
                Err(e)
            }
        }
    }

    async fn claim(&self, report_id: ReportId) -> Result<Report, PipelineError> {
        let acquired = self
            .store
            .acquire_lease(report_id, &self.holder, self.settings.lease_ttl, Utc::now())
            .await;
        match acquired {
            Ok(report) => Ok(report),
            Err(StoreError::NotFound(id)) => Err(PipelineError::NotFound(id)),
            Err(StoreError::LeaseConflict {
                id,
                holder,
                expires_at,
            }) => Err(PipelineError::LeaseHeld {
                id,
                holder,
                expires_at,
            }),
            Err(StoreError::InvalidTransition { id, from, .. }) => {
                Err(PipelineError::NotRunnable { id, status: from })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn process(&self, report: Report) -> Result<WorkflowOutcome, PipelineError> {
        let id = report.id;

        let access = policy::resolve(&report.assessment_data, &report.framework);
        let report = self
            .merge(id, json!({ "access": access, "access_checked_at": now_text() }))
            .await?;
        if !access.allowed {
            return self.block(report, &access).await;
        }

        let report = self.resolve_url(report).await?;
        let report = self.collect_metadata(report).await?;
        let report = self.generate_narrative(report, &access).await?;
        let (mut report, digest) = self.seal_evidence(report).await?;

        if access.features.blockchain && access.paid {
            report = self.anchor(report, &digest).await?;
        }
        if access.features.pdf && access.paid {
            report = self.register_verification(report, &digest).await?;
        }

        let report = self.capture_screenshot(report).await?;
        self.deliver(report, &access).await
    }

    async fn merge(&self, id: ReportId, value: Value) -> Result<Report, PipelineError> {
        self.merge_patch(id, &patch_from(value)).await
    }

    async fn merge_patch(&self, id: ReportId, patch: &Patch) -> Result<Report, PipelineError> {
        self.store
            .merge_fenced(id, &self.fence(), patch, Utc::now())
            .await
            .map_err(lease_error)
    }

    async fn update(&self, id: ReportId, update: &ReportUpdate) -> Result<Report, PipelineError> {
        self.store
            .update_fenced(id, &self.fence(), update, Utc::now())
            .await
            .map_err(lease_error)
    }

    // ── Policy ──

    async fn block(&self, report: Report, access: &TierPolicy) -> Result<WorkflowOutcome, PipelineError> {
        let reason = access
            .reason
            .clone()
            .unwrap_or_else(|| "access_denied".to_string());
        tracing::warn!(report_id = %report.id, reason = %reason, "Access blocked");

        let mut patch = patch_from(json!({
            "access_blocked": true,
            "access_blocked_at": now_text(),
            "access_block_reason": reason,
        }));
        patch.extend(dependency_event(&report, "access_blocked", json!({ "reason": reason })));

        let finished = self
            .store
            .finish(report.id, &self.holder, ReportStatus::Blocked, &patch, Utc::now())
            .await
            .map_err(lease_error)?;

        let hash = digest_value(&json!({
            "report_id": report.id,
            "framework": report.framework,
            "reason": reason,
        }))
        .to_hex();
        self.record_audit(&finished, "access_blocked", &hash, json!({ "reason": reason }))
            .await;

        Ok(WorkflowOutcome::from_report(&finished, None, Some(reason)))
    }

    // ── Site inspection ──

    async fn resolve_url(&self, report: Report) -> Result<Report, PipelineError> {
        let Some(url) = report.target_url() else {
            tracing::warn!(report_id = %report.id, "No website to resolve");
            let marker = StepError::new("resolve_url", None, "no website provided");
            return self.merge(report.id, json!({ "url_resolution_error": marker })).await;
        };

        match timed(self.settings.resolve_timeout, self.collaborators.scanner.resolve(&url)).await {
            Ok(resolution) => {
                tracing::debug!(
                    report_id = %report.id,
                    resolved_url = %resolution.resolved_url,
                    http_status = resolution.http_status,
                    "URL resolved"
                );
                self.merge(
                    report.id,
                    json!({
                        "resolved_url": resolution.resolved_url,
                        "uses_https": resolution.uses_https,
                        "http_status": resolution.http_status,
                        "url_resolution_error": null,
                    }),
                )
                .await
            }
            Err(e) => {
                let error = PipelineError::ResolutionFailed {
                    url: url.clone(),
                    message: e.to_string(),
                };
                tracing::warn!(report_id = %report.id, step = error.step(), error = %error, "URL resolution failed");
                let marker = StepError::new(error.step(), Some(&url), e.to_string());
                self.merge(report.id, json!({ "url_resolution_error": marker })).await
            }
        }
    }

    async fn collect_metadata(&self, report: Report) -> Result<Report, PipelineError> {
        let Some(url) = report.target_url() else {
            let marker = StepError::new("site_metadata", None, "no website provided");
            return self.merge(report.id, json!({ "metadata_error": marker })).await;
        };

        match timed(self.settings.metadata_timeout, self.collaborators.scanner.site_metadata(&url)).await {
            Ok(metadata) => {
                let mut patch = patch_from(serde_json::to_value(&metadata).unwrap_or_default());
                patch.insert("metadata_error".into(), Value::Null);
                patch.insert("site_metadata_collected_at".into(), Value::String(now_text()));
                self.merge_patch(report.id, &patch).await
            }
            Err(e) => {
                let error = PipelineError::ScanFailed {
                    url: url.clone(),
                    message: e.to_string(),
                };
                tracing::warn!(report_id = %report.id, step = error.step(), error = %error, "Site metadata collection failed");
                let marker = StepError::new(error.step(), Some(&url), e.to_string());
                self.merge(report.id, json!({ "metadata_error": marker })).await
            }
        }
    }

    // ── Narrative ──

    async fn generate_narrative(&self, report: Report, access: &TierPolicy) -> Result<Report, PipelineError> {
        let payload = ScanPayload::from_report(&report);
        let narrator = &self.collaborators.narrator;
        let limit = self.settings.narrative_timeout;

        let generated = if access.features.ai_full {
            timed(limit, narrator.full(&payload)).await.map(Narrative::Full)
        } else {
            timed(limit, narrator.light(&payload)).await.map(Narrative::Light)
        };
        let narrative = generated.map_err(|e| PipelineError::NarrativeFailed(e.to_string()))?;

        let saved = match &narrative {
            Narrative::Full(full) => json!({
                "booppa_report": full,
                "booppa_report_saved_at": now_text(),
            }),
            Narrative::Light(light) => json!({
                "light_ai_report": light,
                "light_ai_report_saved_at": now_text(),
            }),
        };
        self.merge(report.id, saved).await?;

        let update = ReportUpdate {
            narrative: Some(narrative.text()),
            narrative_model: Some(narrator.model().to_string()),
            ..ReportUpdate::default()
        };
        self.update(report.id, &update).await
    }

    // ── Evidence ──

    async fn seal_evidence(&self, report: Report) -> Result<(Report, String), PipelineError> {
        let digest = EvidencePayload::for_report(&report).digest().to_hex();
        let update = ReportUpdate {
            audit_hash: Some(digest.clone()),
            ..ReportUpdate::default()
        };
        let report = self.update(report.id, &update).await?;
        tracing::info!(report_id = %report.id, audit_hash = %digest, "Evidence digest recorded");

        self.record_audit(
            &report,
            "report_hash_created",
            &digest,
            json!({
                "framework": report.framework,
                "narrative_model": report.narrative_model,
            }),
        )
        .await;
        Ok((report, digest))
    }

    /// Audit appends are at-least-once; a failed append is logged and the
    /// run continues.
    async fn record_audit(&self, report: &Report, action: &str, hash: &str, metadata: Value) {
        let appended = self
            .audit
            .append(report.id, action, &report.actor(), hash, patch_from(metadata))
            .await;
        if let Err(e) = appended {
            tracing::warn!(report_id = %report.id, action = %action, error = %e, "Audit append failed");
        }
    }

    async fn anchor(&self, report: Report, digest: &str) -> Result<Report, PipelineError> {
        let anchored = match &self.collaborators.anchor {
            Some(anchor) => {
                let metadata = format!("report:{}", report.id);
                match tokio::time::timeout(self.settings.anchor_timeout, anchor.anchor(digest, &metadata)).await {
                    Ok(result) => result,
                    Err(_) => Err(LedgerError::Transport(format!(
                        "timed out after {}s",
                        self.settings.anchor_timeout.as_secs()
                    ))),
                }
            }
            None => Err(LedgerError::NotConfigured("no ledger client".into())),
        };

        match anchored {
            Ok(tx_ref) => {
                let update = ReportUpdate {
                    tx_hash: Some(tx_ref.0),
                    ..ReportUpdate::default()
                };
                self.update(report.id, &update).await?;
                self.merge(report.id, json!({ "anchor_error": null })).await
            }
            Err(e) => {
                let error = PipelineError::AnchorFailed(e);
                tracing::warn!(report_id = %report.id, step = error.step(), error = %error, "Anchoring failed");
                let marker = StepError::new(error.step(), None, error.to_string());
                self.merge(report.id, json!({ "anchor_error": marker })).await
            }
        }
    }

    async fn register_verification(&self, report: Report, digest: &str) -> Result<Report, PipelineError> {
        let verify_url = format!(
            "{}/verify/{}",
            self.settings.verify_base_url.trim_end_matches('/'),
            digest
        );

        let mut registry = match report.assessment_data.value("verification_registry") {
            Some(Value::Object(map)) => map,
            _ => Patch::new(),
        };
        registry.insert(
            digest.to_string(),
            json!({
                "verify_id": digest,
                "tx_hash": report.tx_hash,
                "format": PROOF_FORMAT,
                "schema_version": PROOF_SCHEMA_VERSION,
                "registered_at": now_text(),
            }),
        );

        self.merge(
            report.id,
            json!({
                "verify_url": verify_url,
                "verify_id": digest,
                "proof_header": PROOF_FORMAT,
                "schema_version": PROOF_SCHEMA_VERSION,
                "verification_registry": registry,
            }),
        )
        .await
    }

    // ── Screenshot ──

    async fn capture_screenshot(&self, report: Report) -> Result<Report, PipelineError> {
        if report.assessment_data.site_screenshot.is_some() {
            return Ok(report);
        }
        let Some(url) = report.target_url() else {
            return Ok(report);
        };

        match self.collaborators.screenshots.capture(&url).await {
            CaptureOutcome::Captured {
                provider,
                image_base64,
                diagnostics,
            } => {
                tracing::debug!(report_id = %report.id, provider = %provider, "Screenshot stored");
                self.merge(
                    report.id,
                    json!({
                        "site_screenshot": image_base64,
                        "screenshot_provider": provider,
                        "screenshot_diagnostics": diagnostics,
                    }),
                )
                .await
            }
            CaptureOutcome::Failed { diagnostics } => {
                let summary = truncate_chars(&diagnostics.join("; "), ERROR_TEXT_LIMIT);
                tracing::warn!(report_id = %report.id, diagnostics = %summary, "Screenshot capture failed");
                self.merge(
                    report.id,
                    json!({
                        "screenshot_error": summary,
                        "screenshot_url": url,
                        "screenshot_diagnostics": diagnostics,
                    }),
                )
                .await
            }
        }
    }

    // ── Delivery ──

    async fn deliver(&self, report: Report, access: &TierPolicy) -> Result<WorkflowOutcome, PipelineError> {
        if !(access.features.pdf && access.paid) {
            let mut patch = patch_from(json!({
                "pdf_generated": false,
                "pdf_reason": "tier_restriction",
            }));
            self.notify_into(&report, None, &mut patch).await;
            return self.complete(report, patch, Delivery::NoPdf).await;
        }

        if report.assessment_data.on_page_only.unwrap_or(false) {
            let patch = patch_from(json!({ "on_page_ready": true }));
            return self.complete(report, patch, Delivery::OnPage).await;
        }

        if self.settings.skip_artifact_generation {
            tracing::info!(report_id = %report.id, "Artifact generation disabled, skipping");
            let mut patch = patch_from(json!({
                "pdf_generated": false,
                "s3_uploaded": false,
            }));
            self.notify_into(&report, None, &mut patch).await;
            return self.complete(report, patch, Delivery::NoPdf).await;
        }

        let stored = self.render_and_store(&report).await?;
        let update = ReportUpdate {
            artifact_url: Some(stored.url.clone()),
            artifact_key: Some(stored.key.clone()),
            ..ReportUpdate::default()
        };
        let report = self.update(report.id, &update).await?;

        let stamp = now_text();
        let mut patch = patch_from(json!({
            "file_key": stored.key,
            "pdf_generated": true,
            "pdf_generated_at": stamp,
            "s3_uploaded": true,
            "s3_uploaded_at": stamp,
        }));
        self.notify_into(&report, Some(&stored.url), &mut patch).await;
        self.complete(report, patch, Delivery::Pdf).await
    }

    async fn render_and_store(&self, report: &Report) -> Result<StoredArtifact, PipelineError> {
        let snapshot = ArtifactSnapshot::from_report(report);
        let renderer = &self.collaborators.renderer;
        let bytes = timed(self.settings.render_timeout, renderer.render(&snapshot))
            .await
            .map_err(|e| PipelineError::RenderFailed(e.to_string()))?;

        let store: &dyn ArtifactStore = self.collaborators.artifacts.as_ref();
        let report_id = report.id;
        let body: &[u8] = &bytes;
        let content_type: &str = renderer.content_type();
        let limit = self.settings.store_timeout;

        let stored = retry_with_backoff(&self.settings.artifact_retry, "store_artifact", move |_| {
            timed(limit, store.store(report_id, body, content_type))
        })
        .await
        .map_err(|exhausted| PipelineError::StoreFailed {
            attempts: exhausted.attempts,
            message: exhausted.last_error.to_string(),
        })?;

        tracing::info!(report_id = %report_id, key = %stored.key, bytes = bytes.len(), "Artifact stored");
        Ok(stored)
    }

    /// Notify the requester, recording a `notify_error` marker on failure.
    async fn notify_into(&self, report: &Report, artifact_url: Option<&str>, patch: &mut Patch) {
        let result = match report.assessment_data.recipient() {
            None => Err(PipelineError::NotifyFailed("no recipient address".into())),
            Some(to) => timed(
                self.settings.notify_timeout,
                self.collaborators.notifier.notify(to, artifact_url, report.id),
            )
            .await
            .map_err(|e| PipelineError::NotifyFailed(e.to_string())),
        };

        let marker = match result {
            Ok(()) => Value::Null,
            Err(error) => {
                tracing::warn!(report_id = %report.id, step = error.step(), error = %error, "Notification failed");
                json!(StepError::new(error.step(), None, error.to_string()))
            }
        };
        patch.insert("notify_error".into(), marker);
    }

    async fn complete(&self, report: Report, mut patch: Patch, delivery: Delivery) -> Result<WorkflowOutcome, PipelineError> {
        patch.extend(dependency_event(
            &report,
            "report_completed",
            json!({ "delivery": delivery.as_str() }),
        ));
        let finished = self
            .store
            .finish(report.id, &self.holder, ReportStatus::Completed, &patch, Utc::now())
            .await
            .map_err(lease_error)?;
        Ok(WorkflowOutcome::from_report(&finished, Some(delivery), None))
    }

    async fn record_failure(&self, report_id: ReportId, error: &PipelineError) {
        tracing::error!(report_id = %report_id, step = error.step(), error = %error, "Report processing failed");

        let patch = patch_from(json!({
            "last_processing_error": truncate_chars(&error.to_string(), ERROR_TEXT_LIMIT),
            "last_processing_error_at": now_text(),
        }));
        let finished = self
            .store
            .finish(report_id, &self.holder, ReportStatus::Failed, &patch, Utc::now())
            .await;
        if let Err(e) = finished {
            tracing::error!(report_id = %report_id, error = %e, "Could not record failed status");
        }
    }
}

/// A lapsed or stolen lease ends the run without touching the report.
fn lease_error(error: StoreError) -> PipelineError {
    match error {
        StoreError::LeaseNotHeld { id, holder } => PipelineError::LeaseLost { id, holder },
        other => other.into(),
    }
}

fn now_text() -> String {
    canonical_timestamp(&Utc::now())
}

async fn timed<T>(limit: Duration, fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {}s", limit.as_secs())),
    }
}

/// Append a dependency event, returning the keys to merge.
fn dependency_event(report: &Report, event: &str, extra: Value) -> Patch {
    let mut entry = patch_from(json!({
        "event": event,
        "owner_id": report.owner_id,
        "report_id": report.id,
        "company_name": report.company_name,
        "timestamp": now_text(),
    }));
    entry.extend(patch_from(extra));
    let entry = Value::Object(entry);

    let mut events = report.assessment_data.dependency_events.clone();
    events.push(entry.clone());
    patch_from(json!({
        "dependency_events": events,
        "last_dependency_event": entry,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::AssessmentData;
    use crate::types::NewReport;

    fn report() -> Report {
        let request = NewReport::new("pdpa_basic", "Acme").with_website("acme.sg");
        let data = AssessmentData::from_patch(&request.initial_patch()).unwrap();
        Report::new(request, data)
    }

    #[test]
    fn test_dependency_event_appends() {
        let mut report = report();
        report.assessment_data.dependency_events = vec![json!({ "event": "earlier" })];

        let patch = dependency_event(&report, "report_completed", json!({ "delivery": "pdf" }));

        let events = patch["dependency_events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "earlier");
        assert_eq!(events[1]["event"], "report_completed");
        assert_eq!(events[1]["delivery"], "pdf");
        assert_eq!(events[1]["company_name"], "Acme");
        assert_eq!(patch["last_dependency_event"], events[1]);
    }

    #[test]
    fn test_delivery_names() {
        assert_eq!(Delivery::NoPdf.as_str(), "no_pdf");
        assert_eq!(serde_json::to_value(Delivery::OnPage).unwrap(), "on_page");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_reports_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(1)
        };
        let err = timed(Duration::from_secs(1), slow).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
