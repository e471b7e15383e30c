//! Error types for the evidence pipeline.
//!
//! `PipelineError` is the workflow-level taxonomy. Each variant knows whether it
//! aborts a run (`is_fatal`) and which pipeline step produced it (`step`), so the
//! workflow can either record a marker and continue or persist `failed`.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::assessment::AssessmentError;
use crate::types::{ReportId, ReportStatus};

/// Maximum length of `last_processing_error`.
pub const ERROR_TEXT_LIMIT: usize = 500;

/// Maximum length of the message carried by a non-fatal step marker.
pub const MARKER_TEXT_LIMIT: usize = 200;

/// Errors raised while running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("access denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("url resolution failed for {url}: {message}")]
    ResolutionFailed { url: String, message: String },

    #[error("site scan failed for {url}: {message}")]
    ScanFailed { url: String, message: String },

    #[error("narrative generation failed: {0}")]
    NarrativeFailed(String),

    #[error("ledger anchoring failed: {0}")]
    AnchorFailed(#[from] LedgerError),

    #[error("artifact rendering failed: {0}")]
    RenderFailed(String),

    #[error("artifact storage failed after {attempts} attempts: {message}")]
    StoreFailed { attempts: u32, message: String },

    #[error("notification failed: {0}")]
    NotifyFailed(String),

    #[error("report {0} not found")]
    NotFound(ReportId),

    #[error("report {id} is {status} and cannot be processed")]
    NotRunnable { id: ReportId, status: ReportStatus },

    #[error("report {id} is leased by {holder} until {expires_at}")]
    LeaseHeld {
        id: ReportId,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("report {id}: lease lost by {holder}, run abandoned")]
    LeaseLost { id: ReportId, holder: String },

    #[error("re-processing throttled: {0}")]
    RateLimited(ThrottleReason),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Assessment(#[from] AssessmentError),
}

impl PipelineError {
    /// Whether the error aborts a workflow run.
    ///
    /// Resolution, scan, anchor, and notification failures are recorded and the
    /// run continues; everything else ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ResolutionFailed { .. }
                | Self::ScanFailed { .. }
                | Self::AnchorFailed(_)
                | Self::NotifyFailed(_)
        )
    }

    /// Pipeline step name used in error markers and logs.
    pub fn step(&self) -> &'static str {
        match self {
            Self::PolicyDenied { .. } => "policy",
            Self::ResolutionFailed { .. } => "resolve_url",
            Self::ScanFailed { .. } => "site_metadata",
            Self::NarrativeFailed(_) => "narrative",
            Self::AnchorFailed(_) => "anchor",
            Self::RenderFailed(_) => "render",
            Self::StoreFailed { .. } => "store_artifact",
            Self::NotifyFailed(_) => "notify",
            Self::NotFound(_)
            | Self::NotRunnable { .. }
            | Self::LeaseHeld { .. }
            | Self::LeaseLost { .. } => "lease",
            Self::RateLimited(_) => "trigger",
            Self::Task(_) => "dispatch",
            Self::Store(_) | Self::Assessment(_) => "persistence",
        }
    }
}

/// Why a re-processing trigger was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleReason {
    #[error("attempt ceiling reached ({attempts}/{max})")]
    AttemptsExhausted { attempts: u32, max: u32 },

    #[error("cooling down, retry in {}s", retry_after.as_secs())]
    CoolingDown { retry_after: Duration },
}

/// Errors from the external ledger client. Surfaced to callers unchanged.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("ledger rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid evidence hash: {0}")]
    InvalidHash(String),

    #[error("ledger is not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Transport(err.to_string())
    }
}

/// Errors from a `ReportStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("report {0} not found")]
    NotFound(ReportId),

    #[error("report {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ReportId,
        from: ReportStatus,
        to: ReportStatus,
    },

    #[error("report {id} is leased by {holder} until {expires_at}")]
    LeaseConflict {
        id: ReportId,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("lease on report {id} is not held by {holder}")]
    LeaseNotHeld { id: ReportId, holder: String },

    #[error("invalid assessment data: {0}")]
    Assessment(#[from] AssessmentError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Configuration errors detected by `PipelineConfig::validate`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("risk thresholds must satisfy low < medium < high <= 100 (got {low}/{medium}/{high})")]
    Thresholds { low: u8, medium: u8, high: u8 },

    #[error("{field} must be at least {min}")]
    TooSmall { field: &'static str, min: u64 },

    #[error("lease_ttl_secs ({lease_ttl_secs}) must exceed the {step} step budget ({budget_secs}s)")]
    LeaseTooShort {
        lease_ttl_secs: u64,
        step: &'static str,
        budget_secs: u64,
    },

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },

    #[error("{field} is not a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_fatal_classification() {
        let resolution = PipelineError::ResolutionFailed {
            url: "example.sg".into(),
            message: "dns".into(),
        };
        let anchor = PipelineError::AnchorFailed(LedgerError::Transport("down".into()));
        let notify = PipelineError::NotifyFailed("smtp".into());

        assert!(!resolution.is_fatal());
        assert!(!anchor.is_fatal());
        assert!(!notify.is_fatal());
        assert_eq!(anchor.step(), "anchor");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::NarrativeFailed("x".into()).is_fatal());
        assert!(PipelineError::RenderFailed("x".into()).is_fatal());
        assert!(PipelineError::StoreFailed {
            attempts: 3,
            message: "x".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 50), "short");
        assert_eq!(truncate_chars("", 3), "");
    }
}
