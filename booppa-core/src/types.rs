//! Report Types
//!
//! The `Report` aggregate, its status machine, the per-report lease, and the
//! audit-chain event record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::assessment::AssessmentData;

/// Opaque report identifier.
pub type ReportId = Uuid;

/// Top-level patch merged into `assessment_data`.
pub type Patch = serde_json::Map<String, serde_json::Value>;

/// Processing status of a report.
///
/// `pending`/`processing` are live; `blocked`, `failed`, and `completed` are
/// terminal. `failed` can only be reopened by a gated re-trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Processing,
    Blocked,
    Failed,
    Completed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Failed | Self::Completed)
    }

    /// A workflow run may start from this status.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Incomplete reports are candidates for polling-triggered re-processing.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Failed)
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown report status: {}", s)),
        }
    }
}

/// Exclusive claim on a report held by one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True if `holder` may claim this lease at `now`.
    pub fn permits(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder || self.is_expired(now)
    }

    /// True if `holder` holds this lease and it has not lapsed.
    pub fn held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder && !self.is_expired(now)
    }
}

/// Write authority of one workflow run. Every write made under the fence
/// requires a live lease for `holder` and extends it to `now + ttl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseFence {
    pub holder: String,
    pub ttl: Duration,
}

/// A compliance assessment request and its evidence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    /// `None` for reports created through the anonymous intake.
    pub owner_id: Option<Uuid>,
    pub framework: String,
    pub company_name: String,
    pub company_website: Option<String>,

    /// Inter-step scratchpad. Only ever merged into, never replaced.
    pub assessment_data: AssessmentData,

    pub status: ReportStatus,
    pub audit_hash: Option<String>,
    pub tx_hash: Option<String>,
    pub artifact_url: Option<String>,
    pub artifact_key: Option<String>,

    pub narrative: Option<String>,
    pub narrative_model: Option<String>,

    pub lease: Option<Lease>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Report {
    /// Build a report from an intake request.
    pub fn new(request: NewReport, assessment_data: AssessmentData) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            framework: request.framework,
            company_name: request.company_name,
            company_website: request.website,
            assessment_data,
            status: request.initial_status,
            audit_hash: None,
            tx_hash: None,
            artifact_url: None,
            artifact_key: None,
            narrative: None,
            narrative_model: None,
            lease: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Actor recorded on audit events.
    pub fn actor(&self) -> String {
        self.owner_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// Target URL: the resolved one when present, else what the requester gave.
    pub fn target_url(&self) -> Option<String> {
        self.assessment_data
            .resolved_url
            .clone()
            .or_else(|| self.assessment_data.url.clone())
            .or_else(|| self.company_website.clone())
            .filter(|u| !u.trim().is_empty())
    }
}

/// Intake request for a new report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReport {
    pub framework: String,
    pub company_name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    #[serde(default)]
    pub assessment_data: Patch,
    #[serde(default = "default_initial_status")]
    pub initial_status: ReportStatus,
}

fn default_initial_status() -> ReportStatus {
    ReportStatus::Pending
}

impl NewReport {
    pub fn new(framework: impl Into<String>, company_name: impl Into<String>) -> Self {
        Self {
            framework: framework.into(),
            company_name: company_name.into(),
            website: None,
            contact_email: None,
            owner_id: None,
            assessment_data: Patch::new(),
            initial_status: ReportStatus::Pending,
        }
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    pub fn with_contact_email(mut self, email: impl Into<String>) -> Self {
        self.contact_email = Some(email.into());
        self
    }

    pub fn with_owner(mut self, owner_id: Uuid) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.assessment_data.insert(key.into(), value);
        self
    }

    /// Initial scratchpad: the caller's data plus `url` and `contact_email`
    /// copied from the request fields.
    pub fn initial_patch(&self) -> Patch {
        let mut patch = self.assessment_data.clone();
        if let Some(website) = &self.website {
            patch.insert("url".into(), serde_json::Value::String(website.clone()));
        }
        if let Some(email) = &self.contact_email {
            patch.insert(
                "contact_email".into(),
                serde_json::Value::String(email.clone()),
            );
        }
        patch
    }
}

/// Column updates applied by the workflow outside the scratchpad.
#[derive(Debug, Clone, Default)]
pub struct ReportUpdate {
    pub audit_hash: Option<String>,
    pub tx_hash: Option<String>,
    pub artifact_url: Option<String>,
    pub artifact_key: Option<String>,
    pub narrative: Option<String>,
    pub narrative_model: Option<String>,
}

impl ReportUpdate {
    pub fn is_empty(&self) -> bool {
        self.audit_hash.is_none()
            && self.tx_hash.is_none()
            && self.artifact_url.is_none()
            && self.artifact_key.is_none()
            && self.narrative.is_none()
            && self.narrative_model.is_none()
    }

    /// Copy set fields onto `report`.
    pub fn apply(&self, report: &mut Report) {
        if let Some(v) = &self.audit_hash {
            report.audit_hash = Some(v.clone());
        }
        if let Some(v) = &self.tx_hash {
            report.tx_hash = Some(v.clone());
        }
        if let Some(v) = &self.artifact_url {
            report.artifact_url = Some(v.clone());
        }
        if let Some(v) = &self.artifact_key {
            report.artifact_key = Some(v.clone());
        }
        if let Some(v) = &self.narrative {
            report.narrative = Some(v.clone());
        }
        if let Some(v) = &self.narrative_model {
            report.narrative_model = Some(v.clone());
        }
    }
}

/// One entry in a report's hash-linked audit chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditChainEvent {
    pub id: Uuid,
    pub report_id: ReportId,
    /// Position in the report's chain, starting at 0.
    pub sequence: u64,
    pub action: String,
    pub actor: String,
    /// `hash` of the previous event, or the genesis sentinel.
    pub hash_prev: String,
    pub hash: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied part of an audit event; the store fills in linkage.
#[derive(Debug, Clone)]
pub struct AuditEventDraft {
    pub report_id: ReportId,
    pub action: String,
    pub actor: String,
    pub hash: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert!(ReportStatus::Pending.is_runnable());
        assert!(ReportStatus::Processing.is_runnable());
        assert!(!ReportStatus::Failed.is_runnable());
        assert!(ReportStatus::Failed.is_terminal());
        assert!(ReportStatus::Failed.is_incomplete());
        assert!(!ReportStatus::Completed.is_incomplete());
        assert!(!ReportStatus::Blocked.is_incomplete());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("blocked".parse::<ReportStatus>(), Ok(ReportStatus::Blocked));
        assert!("archived".parse::<ReportStatus>().is_err());
        assert_eq!(
            serde_json::to_value(ReportStatus::Completed).unwrap(),
            json!("completed")
        );
    }

    #[test]
    fn test_lease_permits_holder_or_after_expiry() {
        let now = Utc::now();
        let lease = Lease {
            holder: "worker-a".into(),
            expires_at: now + Duration::seconds(30),
        };

        assert!(lease.permits("worker-a", now));
        assert!(!lease.permits("worker-b", now));
        assert!(lease.permits("worker-b", now + Duration::seconds(31)));
    }

    #[test]
    fn test_lapsed_lease_is_not_held() {
        let now = Utc::now();
        let lease = Lease {
            holder: "worker-a".into(),
            expires_at: now + Duration::seconds(30),
        };

        assert!(lease.held_by("worker-a", now));
        assert!(!lease.held_by("worker-b", now));
        assert!(!lease.held_by("worker-a", now + Duration::seconds(30)));
        assert!(lease.permits("worker-a", now + Duration::seconds(3600)));
    }

    #[test]
    fn test_initial_patch_copies_request_fields() {
        let request = NewReport::new("pdpa_free_scan", "Acme")
            .with_website("acme.sg")
            .with_contact_email("ops@acme.sg")
            .with_data("payment_confirmed", json!(false));

        let patch = request.initial_patch();
        assert_eq!(patch["url"], json!("acme.sg"));
        assert_eq!(patch["contact_email"], json!("ops@acme.sg"));
        assert_eq!(patch["payment_confirmed"], json!(false));
    }
}
