//! Ad-hoc scan pipeline.
//!
//! `Orchestrator::run` memoizes scan → narrative → digest → optional anchor
//! per URL in a [`ContentCache`]. `run_many` fans `run` out over a bounded
//! pool; every URL is independent and one failure does not cancel the rest.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::anchor::LedgerAnchor;
use crate::cache::ContentCache;
use crate::error::PipelineError;
use crate::hasher::{cache_key, digest_value};
use crate::narrative::{Narrative, NarrativeGenerator, ScanPayload};
use crate::scanner::{ScanResult, Scanner};

/// Risk thresholds selecting the narrative depth. Must satisfy
/// `low < medium < high <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low: u8,
    pub medium: u8,
    pub high: u8,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low: 30,
            medium: 60,
            high: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrativeMode {
    None,
    Light,
    Full,
}

impl RiskThresholds {
    pub fn is_valid(&self) -> bool {
        self.low < self.medium && self.medium < self.high && self.high <= 100
    }

    pub fn select(&self, risk: u8) -> NarrativeMode {
        if risk < self.low {
            NarrativeMode::None
        } else if risk < self.medium {
            NarrativeMode::Light
        } else {
            NarrativeMode::Full
        }
    }
}

/// Cached result of one ad-hoc scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub url: String,
    pub scan: ScanResult,
    pub narrative: Option<Narrative>,
    pub notary_hash: String,
    pub blockchain_tx_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub thresholds: RiskThresholds,
    pub scan_timeout: Duration,
    pub narrative_timeout: Duration,
    pub anchor_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            scan_timeout: Duration::from_secs(60),
            narrative_timeout: Duration::from_secs(60),
            anchor_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    scanner: Arc<dyn Scanner>,
    narrator: Arc<dyn NarrativeGenerator>,
    cache: Arc<dyn ContentCache>,
    /// Anchoring is enabled when set.
    anchor: Option<LedgerAnchor>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        narrator: Arc<dyn NarrativeGenerator>,
        cache: Arc<dyn ContentCache>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            scanner,
            narrator,
            cache,
            anchor: None,
            settings,
        }
    }

    pub fn with_anchor(mut self, anchor: LedgerAnchor) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub async fn run(&self, url: &str) -> Result<OrchestrationResult, PipelineError> {
        let key = cache_key(url);
        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                tracing::debug!(url = %url, "Cache hit");
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(url = %url, error = %e, "Cache read failed, recomputing"),
        }

        let scan = tokio::time::timeout(self.settings.scan_timeout, self.scanner.scan(url))
            .await
            .map_err(|_| PipelineError::ScanFailed {
                url: url.to_string(),
                message: "timed out".into(),
            })?
            .map_err(|e| PipelineError::ScanFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let narrative = self.narrate(&scan).await?;

        let notary_hash = digest_value(&json!({
            "url": url,
            "scan": scan,
            "ai": narrative,
        }))
        .to_hex();

        let blockchain_tx_hash = match &self.anchor {
            Some(anchor) => {
                let anchored = tokio::time::timeout(
                    self.settings.anchor_timeout,
                    anchor.anchor(&notary_hash, &format!("monitor:{}", url)),
                )
                .await;
                match anchored {
                    Ok(Ok(tx)) => Some(tx.0),
                    Ok(Err(e)) => {
                        tracing::warn!(url = %url, error = %e, "Monitor anchor failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(url = %url, "Monitor anchor timed out");
                        None
                    }
                }
            }
            None => None,
        };

        let result = OrchestrationResult {
            url: url.to_string(),
            scan,
            narrative,
            notary_hash,
            blockchain_tx_hash,
        };

        if let Err(e) = self.cache.put(&key, &result).await {
            tracing::warn!(url = %url, error = %e, "Cache write failed");
        }
        Ok(result)
    }

    async fn narrate(&self, scan: &ScanResult) -> Result<Option<Narrative>, PipelineError> {
        let payload = ScanPayload::from_scan(scan);
        let timeout = self.settings.narrative_timeout;
        let generated = match self.settings.thresholds.select(scan.risk_score) {
            NarrativeMode::None => return Ok(None),
            NarrativeMode::Light => tokio::time::timeout(timeout, self.narrator.light(&payload))
                .await
                .map(|r| r.map(Narrative::Light)),
            NarrativeMode::Full => tokio::time::timeout(timeout, self.narrator.full(&payload))
                .await
                .map(|r| r.map(Narrative::Full)),
        };
        match generated {
            Ok(Ok(narrative)) => Ok(Some(narrative)),
            Ok(Err(e)) => Err(PipelineError::NarrativeFailed(e.to_string())),
            Err(_) => Err(PipelineError::NarrativeFailed("timed out".into())),
        }
    }

    /// Run every URL with at most `concurrency` in flight. Results are
    /// returned in input order.
    pub async fn run_many(
        &self,
        urls: &[String],
        concurrency: usize,
    ) -> Vec<Result<OrchestrationResult, PipelineError>> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, url) in urls.iter().cloned().enumerate() {
            let orchestrator = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => orchestrator.run(&url).await,
                    Err(e) => Err(PipelineError::Task(e.to_string())),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<OrchestrationResult, PipelineError>>> =
            (0..urls.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "Orchestration task panicked"),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(PipelineError::Task("task aborted".into()))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_selection() {
        let t = RiskThresholds::default();
        assert_eq!(t.select(0), NarrativeMode::None);
        assert_eq!(t.select(29), NarrativeMode::None);
        assert_eq!(t.select(30), NarrativeMode::Light);
        assert_eq!(t.select(59), NarrativeMode::Light);
        assert_eq!(t.select(60), NarrativeMode::Full);
        assert_eq!(t.select(100), NarrativeMode::Full);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(RiskThresholds::default().is_valid());
        assert!(!RiskThresholds { low: 60, medium: 60, high: 100 }.is_valid());
        assert!(!RiskThresholds { low: 10, medium: 60, high: 101 }.is_valid());
    }
}
