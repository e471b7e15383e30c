//! Scripted collaborators and a workflow rig shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use booppa_core::anchor::{LedgerAnchor, MemoryLedger};
use booppa_core::narrative::{
    LightSummary, NarrativeGenerator, RuleBasedNarrator, ScanPayload, StructuredReport,
};
use booppa_core::notify::Notifier;
use booppa_core::render::{artifact_key, ArtifactStore, StoredArtifact, TextArtifactRenderer};
use booppa_core::scanner::{ScanResult, Scanner, SiteMetadata, UrlResolution};
use booppa_core::{
    Collaborators, MemoryReportStore, NewReport, Report, ReportId, ReportStore, ReportWorkflow,
    WorkflowSettings,
};

pub const VERIFY_BASE: &str = "https://verify.test";

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Scanner returning fixed results. Counts every call and tracks the peak
/// number of concurrent scans. With `set_site_down`, resolution and metadata
/// collection fail.
#[derive(Default)]
pub struct ScriptedScanner {
    pub risk: AtomicUsize,
    pub scan_delay: Mutex<Duration>,
    pub failing_url: Mutex<Option<String>>,
    site_down: AtomicBool,
    calls: AtomicUsize,
    scans: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedScanner {
    pub fn with_risk(risk: u8) -> Self {
        let scanner = Self::default();
        scanner.risk.store(risk as usize, Ordering::SeqCst);
        scanner
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        *self.scan_delay.lock().unwrap() = delay;
    }

    pub fn fail_for(&self, url: &str) {
        *self.failing_url.lock().unwrap() = Some(url.to_string());
    }

    pub fn set_site_down(&self, down: bool) {
        self.site_down.store(down, Ordering::SeqCst);
    }

    fn check_site(&self, url: &str) -> Result<()> {
        if self.site_down.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused: {}", url));
        }
        Ok(())
    }
}

#[async_trait]
impl Scanner for ScriptedScanner {
    async fn resolve(&self, url: &str) -> Result<UrlResolution> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_site(url)?;
        let host = url.trim_start_matches("https://").trim_start_matches("http://");
        Ok(UrlResolution {
            resolved_url: format!("https://{}", host),
            http_status: 200,
            uses_https: true,
        })
    }

    async fn site_metadata(&self, url: &str) -> Result<SiteMetadata> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_site(url)?;
        Ok(SiteMetadata::default())
    }

    async fn scan(&self, url: &str) -> Result<ScanResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scans.fetch_add(1, Ordering::SeqCst);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.scan_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_url.lock().unwrap().as_deref() == Some(url) {
            return Err(anyhow!("scanner crashed on {}", url));
        }
        Ok(ScanResult {
            url: url.to_string(),
            risk_score: self.risk.load(Ordering::SeqCst) as u8,
            violation_count: 0,
            detected_labels: vec!["PDPA".to_string()],
            identifier_hint: false,
            scan_date: "2026-01-01T00:00:00.000000Z".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Narrator
// ---------------------------------------------------------------------------

/// Rule-based narrator that counts calls and can be switched to fail.
#[derive(Default)]
pub struct CountingNarrator {
    inner: RuleBasedNarrator,
    full_calls: AtomicUsize,
    light_calls: AtomicUsize,
    failing: AtomicBool,
}

impl CountingNarrator {
    pub fn full_calls(&self) -> usize {
        self.full_calls.load(Ordering::SeqCst)
    }

    pub fn light_calls(&self) -> usize {
        self.light_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.full_calls() + self.light_calls()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("model overloaded"));
        }
        Ok(())
    }
}

#[async_trait]
impl NarrativeGenerator for CountingNarrator {
    async fn full(&self, payload: &ScanPayload) -> Result<StructuredReport> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.full(payload).await
    }

    async fn light(&self, payload: &ScanPayload) -> Result<LightSummary> {
        self.light_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.light(payload).await
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

// ---------------------------------------------------------------------------
// Artifact store
// ---------------------------------------------------------------------------

/// Artifact store that fails its first `failures` calls. With `set_hanging`,
/// every call blocks forever.
pub struct FlakyArtifactStore {
    failures: usize,
    hanging: AtomicBool,
    attempts: AtomicUsize,
    stored: Mutex<Vec<StoredArtifact>>,
}

impl FlakyArtifactStore {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            hanging: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Vec<StoredArtifact> {
        self.stored.lock().unwrap().clone()
    }

    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactStore for FlakyArtifactStore {
    async fn store(
        &self,
        report_id: ReportId,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredArtifact> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hanging.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if attempt <= self.failures {
            return Err(anyhow!("bucket unavailable (attempt {})", attempt));
        }
        assert!(!bytes.is_empty());
        let key = artifact_key(report_id, content_type);
        let stored = StoredArtifact {
            url: format!("memory://{}", key),
            key,
        };
        self.stored.lock().unwrap().push(stored.clone());
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, Option<String>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, to: &str, artifact_url: Option<&str>, _report_id: ReportId) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), artifact_url.map(str::to_string)));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

/// A workflow wired to in-memory collaborators.
pub struct Rig {
    pub store: Arc<MemoryReportStore>,
    pub scanner: Arc<ScriptedScanner>,
    pub narrator: Arc<CountingNarrator>,
    pub ledger: Arc<MemoryLedger>,
    pub artifacts: Arc<FlakyArtifactStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub workflow: ReportWorkflow,
}

impl Rig {
    pub fn new() -> Self {
        Self::build(0, WorkflowSettings::default())
    }

    pub fn with_artifact_failures(failures: usize) -> Self {
        Self::build(failures, WorkflowSettings::default())
    }

    pub fn with_settings(settings: WorkflowSettings) -> Self {
        Self::build(0, settings)
    }

    fn build(artifact_failures: usize, mut settings: WorkflowSettings) -> Self {
        settings.verify_base_url = VERIFY_BASE.to_string();

        let store = Arc::new(MemoryReportStore::new());
        let scanner = Arc::new(ScriptedScanner::with_risk(40));
        let narrator = Arc::new(CountingNarrator::default());
        let ledger = Arc::new(MemoryLedger::new());
        let artifacts = Arc::new(FlakyArtifactStore::new(artifact_failures));
        let notifier = Arc::new(RecordingNotifier::default());

        let collaborators = Collaborators::new(
            scanner.clone(),
            narrator.clone(),
            Arc::new(TextArtifactRenderer),
            artifacts.clone(),
            notifier.clone(),
        )
        .with_anchor(LedgerAnchor::new(ledger.clone()));

        let workflow = ReportWorkflow::new(store.clone(), collaborators, settings)
            .with_holder("worker-test");

        Self {
            store,
            scanner,
            narrator,
            ledger,
            artifacts,
            notifier,
            workflow,
        }
    }

    pub async fn create(&self, request: NewReport) -> Report {
        self.store.create_report(request).await.unwrap()
    }

    pub async fn load(&self, id: ReportId) -> Report {
        self.store.load_report(id).await.unwrap().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Unpaid free scan.
pub fn free_request() -> NewReport {
    NewReport::new("pdpa_free_scan", "Kopi Corner Pte Ltd")
        .with_website("kopicorner.sg")
        .with_contact_email("owner@kopicorner.sg")
}

/// Paid PRO product.
pub fn paid_request() -> NewReport {
    NewReport::new("pdpa_basic", "Harbour Logistics Pte Ltd")
        .with_website("harbourlogistics.sg")
        .with_contact_email("dpo@harbourlogistics.sg")
        .with_data("payment_confirmed", json!(true))
        .with_data("product_type", json!("compliance_pro"))
}
