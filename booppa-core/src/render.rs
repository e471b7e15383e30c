//! Artifact rendering and storage
//!
//! The renderer turns a report snapshot into document bytes; the store
//! persists them under a key derived from the report id, so a retried store
//! overwrites rather than duplicates.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::policy::Tier;
use crate::types::{Report, ReportId};

/// Everything a renderer may show.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSnapshot {
    pub report_id: ReportId,
    pub framework: String,
    pub company_name: String,
    pub website: Option<String>,
    pub tier: Option<Tier>,
    pub audit_hash: Option<String>,
    pub tx_hash: Option<String>,
    pub verify_url: Option<String>,
    pub narrative: Option<String>,
    pub narrative_model: Option<String>,
    pub structured_report: Option<serde_json::Value>,
    pub has_screenshot: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ArtifactSnapshot {
    pub fn from_report(report: &Report) -> Self {
        let data = &report.assessment_data;
        Self {
            report_id: report.id,
            framework: report.framework.clone(),
            company_name: report.company_name.clone(),
            website: report.target_url(),
            tier: data.access.as_ref().map(|a| a.tier),
            audit_hash: report.audit_hash.clone(),
            tx_hash: report.tx_hash.clone(),
            verify_url: data.verify_url.clone(),
            narrative: report.narrative.clone(),
            narrative_model: report.narrative_model.clone(),
            structured_report: data.value("booppa_report"),
            has_screenshot: data.site_screenshot.is_some(),
            created_at: report.created_at,
        }
    }
}

#[async_trait]
pub trait ArtifactRenderer: Send + Sync {
    async fn render(&self, snapshot: &ArtifactSnapshot) -> Result<Vec<u8>>;
    fn content_type(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the artifact for `report_id`. Storing again overwrites.
    async fn store(
        &self,
        report_id: ReportId,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredArtifact>;
}

/// Artifact key for a report.
pub fn artifact_key(report_id: ReportId, content_type: &str) -> String {
    let extension = match content_type {
        "application/pdf" => "pdf",
        "text/html" => "html",
        "application/json" => "json",
        _ => "txt",
    };
    format!("reports/{}.{}", report_id, extension)
}

/// Plain-text proof document. Output is a pure function of the snapshot.
#[derive(Debug, Clone, Default)]
pub struct TextArtifactRenderer;

impl TextArtifactRenderer {
    pub fn render_text(snapshot: &ArtifactSnapshot) -> Result<String, fmt::Error> {
        let mut out = String::new();
        write_document(&mut out, snapshot)?;
        Ok(out)
    }
}

fn write_document(out: &mut impl fmt::Write, snapshot: &ArtifactSnapshot) -> fmt::Result {
    let none = "-";
    writeln!(out, "BOOPPA COMPLIANCE EVIDENCE REPORT")?;
    writeln!(out, "=================================")?;
    writeln!(out, "Report ID:     {}", snapshot.report_id)?;
    writeln!(out, "Company:       {}", snapshot.company_name)?;
    writeln!(out, "Website:       {}", snapshot.website.as_deref().unwrap_or(none))?;
    writeln!(out, "Framework:     {}", snapshot.framework)?;
    writeln!(
        out,
        "Tier:          {}",
        snapshot.tier.map(|t| t.as_str()).unwrap_or(none)
    )?;
    writeln!(
        out,
        "Created:       {}",
        crate::hasher::canonical_timestamp(&snapshot.created_at)
    )?;
    writeln!(out)?;
    writeln!(out, "EVIDENCE")?;
    writeln!(out, "Digest (SHA-256): {}", snapshot.audit_hash.as_deref().unwrap_or(none))?;
    writeln!(out, "Ledger tx:        {}", snapshot.tx_hash.as_deref().unwrap_or(none))?;
    writeln!(out, "Verify at:        {}", snapshot.verify_url.as_deref().unwrap_or(none))?;
    writeln!(out)?;
    writeln!(out, "SUMMARY")?;
    writeln!(out, "{}", snapshot.narrative.as_deref().unwrap_or(none))?;

    if let Some(findings) = snapshot
        .structured_report
        .as_ref()
        .and_then(|r| r.get("detailed_findings"))
        .and_then(|f| f.as_array())
    {
        writeln!(out)?;
        writeln!(out, "FINDINGS")?;
        for finding in findings {
            let severity = finding.get("severity").and_then(|v| v.as_str()).unwrap_or("");
            let details = finding.get("details").and_then(|v| v.as_str()).unwrap_or("");
            writeln!(out, "[{}] {}", severity, details)?;
        }
    }

    if let Some(model) = &snapshot.narrative_model {
        writeln!(out)?;
        writeln!(out, "Narrative model: {}", model)?;
    }
    Ok(())
}

#[async_trait]
impl ArtifactRenderer for TextArtifactRenderer {
    async fn render(&self, snapshot: &ArtifactSnapshot) -> Result<Vec<u8>> {
        let text = Self::render_text(snapshot).context("formatting proof document")?;
        Ok(text.into_bytes())
    }

    fn content_type(&self) -> &str {
        "text/plain"
    }
}

/// Filesystem store returning `file://` references.
pub struct LocalArtifactStore {
    base_path: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(
        &self,
        report_id: ReportId,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredArtifact> {
        let key = artifact_key(report_id, content_type);
        let path = self.base_path.join(&key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("moving artifact into {}", path.display()))?;

        let absolute = tokio::fs::canonicalize(&path).await.unwrap_or(path);
        Ok(StoredArtifact {
            key,
            url: format!("file://{}", absolute.display()),
        })
    }
}
