//! Audit Chain
//!
//! Per-report, append-only, hash-linked event log. Each event's `hash_prev` is
//! the previous event's `hash`; the first event links to [`GENESIS_HASH`].
//!
//! Linking happens inside the store under its lock (memory) or row lock
//! (Postgres). Appends are at-least-once: the workflow appends after the
//! state change it documents, so a crash between the two can repeat an event
//! on re-run, but never breaks the chain.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::error::StoreError;
use crate::types::{AuditChainEvent, AuditEventDraft, ReportId};
use crate::store::ReportStore;

/// `hash_prev` of the first event in every chain.
pub const GENESIS_HASH: &str = "GENESIS";

/// First position where a chain fails to link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBreak {
    pub index: usize,
    pub expected_prev: String,
    pub found_prev: String,
}

/// Check that `events` (in append order) form an unbroken chain.
pub fn verify_chain(events: &[AuditChainEvent]) -> Result<(), ChainBreak> {
    let mut expected = GENESIS_HASH;
    for (index, event) in events.iter().enumerate() {
        if event.hash_prev != expected {
            return Err(ChainBreak {
                index,
                expected_prev: expected.to_string(),
                found_prev: event.hash_prev.clone(),
            });
        }
        expected = &event.hash;
    }
    Ok(())
}

#[derive(Clone)]
pub struct AuditChain {
    store: Arc<dyn ReportStore>,
}

impl AuditChain {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    pub async fn append(
        &self,
        report_id: ReportId,
        action: &str,
        actor: &str,
        hash: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AuditChainEvent, StoreError> {
        let event = self
            .store
            .append_audit_event(
                AuditEventDraft {
                    report_id,
                    action: action.to_string(),
                    actor: actor.to_string(),
                    hash: hash.to_string(),
                    metadata,
                },
                Utc::now(),
            )
            .await?;

        tracing::debug!(
            report_id = %report_id,
            action = %event.action,
            sequence = event.sequence,
            "Audit event appended"
        );
        Ok(event)
    }

    pub async fn events(&self, report_id: ReportId) -> Result<Vec<AuditChainEvent>, StoreError> {
        self.store.audit_events(report_id).await
    }

    /// Load and verify a report's chain.
    pub async fn verify(&self, report_id: ReportId) -> Result<Result<(), ChainBreak>, StoreError> {
        Ok(verify_chain(&self.events(report_id).await?))
    }
}
