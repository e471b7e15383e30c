//! Postgres-backed `ReportStore`.
//!
//! All queries use runtime-checked `sqlx::query()` so the crate builds without
//! a live database. Every state transition runs in a transaction holding the
//! report row lock (`SELECT ... FOR UPDATE`) and applies the same transition
//! rules as the in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

use crate::assessment::AssessmentData;
use crate::audit_chain::GENESIS_HASH;
use crate::error::StoreError;
use crate::guard::ReprocessGuard;
use crate::store::{
    apply_trigger, claim_lease, finish_report, merge_under_fence, update_under_fence, ReportStore,
    TriggerDecision,
};
use crate::types::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reports (
    id               UUID PRIMARY KEY,
    owner_id         UUID,
    framework        TEXT NOT NULL,
    company_name     TEXT NOT NULL,
    company_website  TEXT,
    assessment_data  JSONB NOT NULL DEFAULT '{}'::jsonb,
    status           TEXT NOT NULL,
    audit_hash       TEXT,
    tx_hash          TEXT,
    artifact_url     TEXT,
    artifact_key     TEXT,
    narrative        TEXT,
    narrative_model  TEXT,
    lease_holder     TEXT,
    lease_expires_at TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    completed_at     TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS reports_status_created_idx ON reports (status, created_at);
CREATE INDEX IF NOT EXISTS reports_audit_hash_idx ON reports (audit_hash);
CREATE TABLE IF NOT EXISTS audit_chain_events (
    id          UUID PRIMARY KEY,
    report_id   UUID NOT NULL REFERENCES reports (id),
    sequence    BIGINT NOT NULL,
    action      TEXT NOT NULL,
    actor       TEXT NOT NULL,
    hash_prev   TEXT NOT NULL,
    hash        TEXT NOT NULL,
    metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at  TIMESTAMPTZ NOT NULL,
    UNIQUE (report_id, sequence)
)
"#;

const REPORT_COLUMNS: &str = "id, owner_id, framework, company_name, company_website, \
    assessment_data, status, audit_hash, tx_hash, artifact_url, artifact_key, narrative, \
    narrative_model, lease_holder, lease_expires_at, created_at, updated_at, completed_at";

#[derive(FromRow)]
struct ReportRow {
    id: Uuid,
    owner_id: Option<Uuid>,
    framework: String,
    company_name: String,
    company_website: Option<String>,
    assessment_data: Json<serde_json::Value>,
    status: String,
    audit_hash: Option<String>,
    tx_hash: Option<String>,
    artifact_url: Option<String>,
    artifact_key: Option<String>,
    narrative: Option<String>,
    narrative_model: Option<String>,
    lease_holder: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReportRow> for Report {
    type Error = StoreError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let lease = match (row.lease_holder, row.lease_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease { holder, expires_at }),
            _ => None,
        };
        Ok(Report {
            id: row.id,
            owner_id: row.owner_id,
            framework: row.framework,
            company_name: row.company_name,
            company_website: row.company_website,
            assessment_data: AssessmentData::from_value(row.assessment_data.0)?,
            status: row.status.parse().map_err(StoreError::Backend)?,
            audit_hash: row.audit_hash,
            tx_hash: row.tx_hash,
            artifact_url: row.artifact_url,
            artifact_key: row.artifact_key,
            narrative: row.narrative,
            narrative_model: row.narrative_model,
            lease,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(FromRow)]
struct AuditRow {
    id: Uuid,
    report_id: Uuid,
    sequence: i64,
    action: String,
    actor: String,
    hash_prev: String,
    hash: String,
    metadata: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditChainEvent {
    fn from(row: AuditRow) -> Self {
        AuditChainEvent {
            id: row.id,
            report_id: row.report_id,
            sequence: row.sequence.max(0) as u64,
            action: row.action,
            actor: row.actor,
            hash_prev: row.hash_prev,
            hash: row.hash,
            metadata: match row.metadata.0 {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the tables if they do not exist.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Report schema ready");
        Ok(())
    }

    async fn lock(conn: &mut PgConnection, id: ReportId) -> Result<Report, StoreError> {
        let row: Option<ReportRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reports WHERE id = $1 FOR UPDATE",
            REPORT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn save(conn: &mut PgConnection, report: &Report) -> Result<(), StoreError> {
        let data = serde_json::to_value(&report.assessment_data)?;
        sqlx::query(
            r#"
            UPDATE reports SET
                assessment_data = $2,
                status = $3,
                audit_hash = $4,
                tx_hash = $5,
                artifact_url = $6,
                artifact_key = $7,
                narrative = $8,
                narrative_model = $9,
                lease_holder = $10,
                lease_expires_at = $11,
                updated_at = $12,
                completed_at = $13
            WHERE id = $1
            "#,
        )
        .bind(report.id)
        .bind(Json(data))
        .bind(report.status.as_str())
        .bind(&report.audit_hash)
        .bind(&report.tx_hash)
        .bind(&report.artifact_url)
        .bind(&report.artifact_key)
        .bind(&report.narrative)
        .bind(&report.narrative_model)
        .bind(report.lease.as_ref().map(|l| l.holder.clone()))
        .bind(report.lease.as_ref().map(|l| l.expires_at))
        .bind(report.updated_at)
        .bind(report.completed_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Lock the row, apply `change`, write it back, and commit. The
    /// transaction rolls back if `change` fails.
    async fn modify<T, F>(&self, id: ReportId, change: F) -> Result<(Report, T), StoreError>
    where
        F: FnOnce(&mut Report) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut report = Self::lock(&mut *tx, id).await?;
        let value = change(&mut report)?;
        Self::save(&mut *tx, &report).await?;
        tx.commit().await?;
        Ok((report, value))
    }

    async fn select_reports(&self, clause: &str, bind: &str, limit: i64) -> Result<Vec<Report>, StoreError> {
        let sql = format!("SELECT {} FROM reports {} LIMIT {}", REPORT_COLUMNS, clause, limit.max(0));
        let rows: Vec<ReportRow> = sqlx::query_as(&sql).bind(bind).fetch_all(&self.pool).await?;
        rows.into_iter().map(Report::try_from).collect()
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn create_report(&self, request: NewReport) -> Result<Report, StoreError> {
        let data = AssessmentData::from_patch(&request.initial_patch())?;
        let report = Report::new(request, data);
        sqlx::query(
            r#"
            INSERT INTO reports
                (id, owner_id, framework, company_name, company_website, assessment_data,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(report.id)
        .bind(report.owner_id)
        .bind(&report.framework)
        .bind(&report.company_name)
        .bind(&report.company_website)
        .bind(Json(serde_json::to_value(&report.assessment_data)?))
        .bind(report.status.as_str())
        .bind(report.created_at)
        .bind(report.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(report)
    }

    async fn load_report(&self, id: ReportId) -> Result<Option<Report>, StoreError> {
        let row: Option<ReportRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reports WHERE id = $1",
            REPORT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Report::try_from).transpose()
    }

    async fn find_by_audit_hash(&self, audit_hash: &str) -> Result<Option<Report>, StoreError> {
        Ok(self
            .select_reports("WHERE audit_hash = $1 ORDER BY updated_at DESC", audit_hash, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn list_by_status(
        &self,
        status: ReportStatus,
        limit: usize,
    ) -> Result<Vec<Report>, StoreError> {
        self.select_reports(
            "WHERE status = $1 ORDER BY created_at",
            status.as_str(),
            limit.min(i64::MAX as usize) as i64,
        )
        .await
    }

    async fn merge_assessment(&self, id: ReportId, patch: &Patch) -> Result<Report, StoreError> {
        let (report, ()) = self
            .modify(id, |report| {
                report.assessment_data = report.assessment_data.merged(patch)?;
                report.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(report)
    }

    async fn update_report(
        &self,
        id: ReportId,
        update: &ReportUpdate,
    ) -> Result<Report, StoreError> {
        let (report, ()) = self
            .modify(id, |report| {
                update.apply(report);
                report.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(report)
    }

    async fn merge_fenced(
        &self,
        id: ReportId,
        fence: &LeaseFence,
        patch: &Patch,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError> {
        let (report, ()) = self
            .modify(id, |report| merge_under_fence(report, fence, patch, now))
            .await?;
        Ok(report)
    }

    async fn update_fenced(
        &self,
        id: ReportId,
        fence: &LeaseFence,
        update: &ReportUpdate,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError> {
        let (report, ()) = self
            .modify(id, |report| update_under_fence(report, fence, update, now))
            .await?;
        Ok(report)
    }

    async fn acquire_lease(
        &self,
        id: ReportId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Report, StoreError> {
        let (report, ()) = self
            .modify(id, |report| claim_lease(report, holder, ttl, now))
            .await?;
        Ok(report)
    }

    async fn release_lease(&self, id: ReportId, holder: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE reports SET lease_holder = NULL, lease_expires_at = NULL \
             WHERE id = $1 AND lease_holder = $2",
        )
        .bind(id)
        .bind(holder)
        .execute(&self.pool)
        .await?;
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
        let (report, ()) = self
            .modify(id, |report| finish_report(report, holder, status, patch, now))
            .await?;
        Ok(report)
    }

    async fn record_trigger(
        &self,
        id: ReportId,
        guard: &ReprocessGuard,
        now: DateTime<Utc>,
    ) -> Result<TriggerDecision, StoreError> {
        let (_, decision) = self
            .modify(id, |report| apply_trigger(report, guard, now))
            .await?;
        Ok(decision)
    }

    async fn append_audit_event(
        &self,
        draft: AuditEventDraft,
        now: DateTime<Utc>,
    ) -> Result<AuditChainEvent, StoreError> {
        let mut tx = self.pool.begin().await?;
        // The report row lock serialises appends to one chain.
        Self::lock(&mut *tx, draft.report_id).await?;

        let tip: Option<(i64, String)> = sqlx::query_as(
            "SELECT sequence, hash FROM audit_chain_events \
             WHERE report_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(draft.report_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (sequence, hash_prev) = match tip {
            Some((sequence, hash)) => (sequence + 1, hash),
            None => (0, GENESIS_HASH.to_string()),
        };

        let event = AuditChainEvent {
            id: Uuid::new_v4(),
            report_id: draft.report_id,
            sequence: sequence as u64,
            action: draft.action,
            actor: draft.actor,
            hash_prev,
            hash: draft.hash,
            metadata: draft.metadata,
            created_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO audit_chain_events
                (id, report_id, sequence, action, actor, hash_prev, hash, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.report_id)
        .bind(sequence)
        .bind(&event.action)
        .bind(&event.actor)
        .bind(&event.hash_prev)
        .bind(&event.hash)
        .bind(Json(serde_json::Value::Object(event.metadata.clone())))
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(event)
    }

    async fn audit_events(&self, report_id: ReportId) -> Result<Vec<AuditChainEvent>, StoreError> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, report_id, sequence, action, actor, hash_prev, hash, metadata, created_at \
             FROM audit_chain_events WHERE report_id = $1 ORDER BY sequence",
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditChainEvent::from).collect())
    }
}
