//! Intake, read, and verification boundaries.
//!
//! `EvidenceService` is what an HTTP layer would sit on: it creates reports
//! and hands them to the dispatcher, renders the read-side view of a report,
//! re-triggers incomplete reports under the re-processing guard, and answers
//! public verification lookups by digest.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::anchor::{LedgerAnchor, TxRef};
use crate::dispatcher::Dispatch;
use crate::error::PipelineError;
use crate::guard::ReprocessGuard;
use crate::hasher::Hash256;
use crate::policy::{Features, Tier};
use crate::store::{ReportStore, TriggerDecision};
use crate::types::{NewReport, Report, ReportId, ReportStatus};
use crate::workflow::{PROOF_FORMAT, PROOF_SCHEMA_VERSION};

pub const FAILED_MESSAGE: &str = "Report generation failed. Please try again later.";

pub const VERIFICATION_DISCLAIMER: &str = "This record confirms that a document with the \
given digest was registered by Booppa. It does not certify the legal compliance of the \
organisation named in it.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationView {
    pub verify_url: Option<String>,
    pub anchored: bool,
    pub anchored_at: Option<DateTime<Utc>>,
    pub tx_confirmed: Option<bool>,
}

/// What the requester should be shown for the current status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReportDisplay {
    Blocked { reason: String },
    Failed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    Processing { attempts: u32 },
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportView {
    pub report_id: ReportId,
    pub status: ReportStatus,
    pub framework: String,
    pub company_name: String,
    pub audit_hash: Option<String>,
    pub tx_hash: Option<String>,
    pub artifact_url: Option<String>,
    pub tier: Option<Tier>,
    pub features: Option<Features>,
    pub verification: VerificationView,
    pub display: ReportDisplay,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResponse {
    pub report: ReportView,
    /// Attempt number of the run this poll dispatched, if any.
    pub triggered_attempt: Option<u32>,
}

/// Public verification payload. `format` and `schema_version` are a
/// versioned contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationRecord {
    pub report_id: ReportId,
    pub framework: String,
    pub company_name: String,
    pub status: ReportStatus,
    pub tx_hash: Option<String>,
    pub anchored: bool,
    pub anchored_at: Option<DateTime<Utc>>,
    pub tx_confirmed: Option<bool>,
    pub format: &'static str,
    pub schema_version: &'static str,
    pub verify_url: String,
    pub verify_id: String,
    pub disclaimer: &'static str,
}

pub struct EvidenceService {
    store: Arc<dyn ReportStore>,
    dispatcher: Arc<dyn Dispatch>,
    anchor: Option<LedgerAnchor>,
    guard: ReprocessGuard,
    verify_base_url: String,
    debug: bool,
}

impl EvidenceService {
    pub fn new(
        store: Arc<dyn ReportStore>,
        dispatcher: Arc<dyn Dispatch>,
        guard: ReprocessGuard,
        verify_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            anchor: None,
            guard,
            verify_base_url: verify_base_url.into(),
            debug: false,
        }
    }

    pub fn with_anchor(mut self, anchor: LedgerAnchor) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// Include error details in `failed` views.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Persist a new report and dispatch it. A dispatch failure leaves the
    /// report `pending` for the stalled-report sweep.
    pub async fn create_report(&self, request: NewReport) -> Result<ReportId, PipelineError> {
        let report = self.store.create_report(request).await?;
        tracing::info!(
            report_id = %report.id,
            framework = %report.framework,
            status = %report.status,
            "Report created"
        );

        if let Err(e) = self.dispatcher.dispatch(report.id).await {
            tracing::warn!(report_id = %report.id, error = %e, "Dispatch after create failed");
        }
        Ok(report.id)
    }

    pub async fn get_report(&self, report_id: ReportId) -> Result<ReportView, PipelineError> {
        let report = self.load(report_id).await?;
        Ok(self.view(&report).await)
    }

    /// Read a report and, if it is incomplete, re-trigger processing subject
    /// to the re-processing guard.
    pub async fn poll_report(&self, report_id: ReportId) -> Result<PollResponse, PipelineError> {
        let report = self.load(report_id).await?;
        if !report.status.is_incomplete() {
            return Ok(PollResponse {
                report: self.view(&report).await,
                triggered_attempt: None,
            });
        }

        let triggered_attempt = match self.store.record_trigger(report_id, &self.guard, Utc::now()).await? {
            TriggerDecision::Accepted { attempt } => {
                tracing::info!(report_id = %report_id, attempt, "Re-processing triggered by poll");
                self.dispatcher.dispatch(report_id).await?;
                Some(attempt)
            }
            TriggerDecision::Throttled(reason) => {
                tracing::debug!(report_id = %report_id, reason = %reason, "Poll re-trigger throttled");
                return Err(PipelineError::RateLimited(reason));
            }
            TriggerDecision::InFlight { .. } | TriggerDecision::NotApplicable(_) => None,
        };

        let report = self.load(report_id).await?;
        Ok(PollResponse {
            report: self.view(&report).await,
            triggered_attempt,
        })
    }

    /// Public lookup by evidence digest. Unknown or malformed digests yield
    /// `None`.
    pub async fn verify(&self, audit_hash: &str) -> Result<Option<VerificationRecord>, PipelineError> {
        let trimmed = audit_hash.trim();
        let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let Some(digest) = Hash256::from_hex(hex_part) else {
            return Ok(None);
        };
        let digest = digest.to_hex();

        let Some(report) = self.store.find_by_audit_hash(&digest).await? else {
            return Ok(None);
        };

        let status = match &report.tx_hash {
            Some(tx) => self.anchor_status(&digest, tx).await,
            None => VerificationView {
                verify_url: None,
                anchored: false,
                anchored_at: None,
                tx_confirmed: None,
            },
        };

        let data = &report.assessment_data;
        Ok(Some(VerificationRecord {
            report_id: report.id,
            framework: report.framework.clone(),
            company_name: report.company_name.clone(),
            status: report.status,
            tx_hash: report.tx_hash.clone(),
            anchored: status.anchored,
            anchored_at: status.anchored_at,
            tx_confirmed: status.tx_confirmed,
            format: PROOF_FORMAT,
            schema_version: PROOF_SCHEMA_VERSION,
            verify_url: data
                .verify_url
                .clone()
                .unwrap_or_else(|| self.verify_url_for(&digest)),
            verify_id: data.verify_id.clone().unwrap_or_else(|| digest.clone()),
            disclaimer: VERIFICATION_DISCLAIMER,
        }))
    }

    async fn load(&self, report_id: ReportId) -> Result<Report, PipelineError> {
        self.store
            .load_report(report_id)
            .await?
            .ok_or(PipelineError::NotFound(report_id))
    }

    fn verify_url_for(&self, digest: &str) -> String {
        format!("{}/verify/{}", self.verify_base_url.trim_end_matches('/'), digest)
    }

    async fn anchor_status(&self, digest: &str, tx_hash: &str) -> VerificationView {
        match &self.anchor {
            Some(anchor) => {
                let status = anchor.status(digest, Some(&TxRef(tx_hash.to_string()))).await;
                VerificationView {
                    verify_url: None,
                    anchored: status.anchored,
                    anchored_at: status.anchored_at,
                    tx_confirmed: status.tx_confirmed,
                }
            }
            None => VerificationView {
                verify_url: None,
                anchored: false,
                anchored_at: None,
                tx_confirmed: None,
            },
        }
    }

    async fn view(&self, report: &Report) -> ReportView {
        let data = &report.assessment_data;

        let mut verification = match (&report.audit_hash, &report.tx_hash) {
            (Some(digest), Some(tx)) => self.anchor_status(digest, tx).await,
            _ => VerificationView {
                verify_url: None,
                anchored: false,
                anchored_at: None,
                tx_confirmed: None,
            },
        };
        verification.verify_url = data.verify_url.clone();

        let display = match report.status {
            ReportStatus::Blocked => ReportDisplay::Blocked {
                reason: data
                    .access
                    .as_ref()
                    .and_then(|a| a.reason.clone())
                    .unwrap_or_else(|| "access_denied".to_string()),
            },
            ReportStatus::Failed => ReportDisplay::Failed {
                message: FAILED_MESSAGE.to_string(),
                detail: self.debug.then(|| {
                    json!({
                        "error": data.last_processing_error,
                        "at": data.last_processing_error_at,
                        "attempts": data.attempts(),
                    })
                }),
            },
            ReportStatus::Pending | ReportStatus::Processing => ReportDisplay::Processing {
                attempts: data.attempts(),
            },
            ReportStatus::Completed => ReportDisplay::Completed,
        };

        ReportView {
            report_id: report.id,
            status: report.status,
            framework: report.framework.clone(),
            company_name: report.company_name.clone(),
            audit_hash: report.audit_hash.clone(),
            tx_hash: report.tx_hash.clone(),
            artifact_url: report.artifact_url.clone(),
            tier: data.access.as_ref().map(|a| a.tier),
            features: data.access.as_ref().map(|a| a.features.clone()),
            verification,
            display,
            created_at: report.created_at,
            completed_at: report.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryReportStore;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        dispatched: Mutex<Vec<ReportId>>,
    }

    #[async_trait]
    impl Dispatch for Recorder {
        async fn dispatch(&self, report_id: ReportId) -> Result<(), PipelineError> {
            self.dispatched.lock().await.push(report_id);
            Ok(())
        }
    }

    fn service(store: Arc<MemoryReportStore>, recorder: Arc<Recorder>) -> EvidenceService {
        EvidenceService::new(store, recorder, ReprocessGuard::default(), "https://verify.test")
    }

    #[tokio::test]
    async fn test_create_dispatches_and_shows_processing() {
        let store = Arc::new(MemoryReportStore::new());
        let recorder = Arc::new(Recorder::default());
        let svc = service(store, recorder.clone());

        let id = svc
            .create_report(NewReport::new("pdpa_free_scan", "Acme").with_website("acme.sg"))
            .await
            .unwrap();

        assert_eq!(*recorder.dispatched.lock().await, vec![id]);
        let view = svc.get_report(id).await.unwrap();
        assert_eq!(view.status, ReportStatus::Pending);
        assert_eq!(view.display, ReportDisplay::Processing { attempts: 0 });
        assert!(!view.verification.anchored);
    }

    #[tokio::test]
    async fn test_poll_is_throttled_within_cooldown() {
        let store = Arc::new(MemoryReportStore::new());
        let recorder = Arc::new(Recorder::default());
        let svc = service(store, recorder.clone());
        let id = svc
            .create_report(NewReport::new("pdpa_free_scan", "Acme"))
            .await
            .unwrap();

        let first = svc.poll_report(id).await.unwrap();
        assert_eq!(first.triggered_attempt, Some(1));

        let second = svc.poll_report(id).await.unwrap_err();
        assert!(matches!(
            second,
            PipelineError::RateLimited(crate::error::ThrottleReason::CoolingDown { .. })
        ));
        assert_eq!(recorder.dispatched.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_get_unknown_report() {
        let svc = service(Arc::new(MemoryReportStore::new()), Arc::new(Recorder::default()));
        let id = uuid::Uuid::new_v4();
        assert!(matches!(svc.get_report(id).await, Err(PipelineError::NotFound(found)) if found == id));
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_digest() {
        let svc = service(Arc::new(MemoryReportStore::new()), Arc::new(Recorder::default()));
        assert!(svc.verify("not-a-hash").await.unwrap().is_none());
        assert!(svc.verify(&"ab".repeat(32)).await.unwrap().is_none());
    }
}
