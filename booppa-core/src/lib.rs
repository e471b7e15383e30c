//! Booppa evidence pipeline
//!
//! Turns a compliance-assessment request into a tamper-evident evidence
//! record: tier policy, site inspection, narrative, a deterministic evidence
//! digest, a hash-linked audit chain, optional ledger anchoring, and an
//! optional stored artifact.
//!
//! ## Flow
//! `EvidenceService::create_report` -> `TaskDispatcher` -> `DispatchWorker`
//! -> `ReportWorkflow::run` -> `completed` | `blocked` | `failed`
//!
//! The ad-hoc path (`Orchestrator::run`) scans a URL, narrates, digests, and
//! memoizes the result in a `ContentCache`.
//!
//! ```rust,no_run
//! use booppa_core::policy;
//! use booppa_core::assessment::AssessmentData;
//!
//! let access = policy::resolve(&AssessmentData::default(), "pdpa_free_scan");
//! assert!(!access.features.pdf);
//! ```

// Errors
pub mod error;

// Report model and its context scratchpad
pub mod assessment;
pub mod types;

// Pure building blocks
pub mod guard;
pub mod hasher;
pub mod policy;
pub mod retry;

// Persistence
pub mod audit_chain;
pub mod store;
#[cfg(feature = "postgres")]
pub mod store_pg;

// External collaborators
pub mod anchor;
pub mod narrative;
pub mod notify;
pub mod render;
pub mod scanner;
pub mod screenshot;

// Pipelines
pub mod cache;
pub mod orchestrator;
pub mod workflow;

// Boundaries and runtime
pub mod config;
pub mod dispatcher;
pub mod service;

pub use config::PipelineConfig;
pub use dispatcher::{Dispatch, DispatchRetry, DispatchWorker, TaskDispatcher};
pub use error::{PipelineError, StoreError};
pub use orchestrator::{OrchestrationResult, Orchestrator};
pub use service::EvidenceService;
pub use store::{MemoryReportStore, ReportStore};
#[cfg(feature = "postgres")]
pub use store_pg::PgReportStore;
pub use types::{NewReport, Report, ReportId, ReportStatus};
pub use workflow::{Collaborators, ReportWorkflow, WorkflowOutcome, WorkflowSettings};
