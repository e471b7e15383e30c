//! Pipeline configuration
//!
//! Loaded from an optional YAML file, then overridden by `BOOPPA_*`
//! environment variables, then validated. Every field has a default, so an
//! empty file (or no file) is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatchRetry;
use crate::error::ConfigError;
use crate::guard::ReprocessGuard;
use crate::orchestrator::{OrchestratorSettings, RiskThresholds};
use crate::retry::RetryPolicy;
use crate::workflow::WorkflowSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub resolve_secs: u64,
    pub metadata_secs: u64,
    pub scan_secs: u64,
    pub narrative_secs: u64,
    pub anchor_secs: u64,
    pub capture_secs: u64,
    pub screenshot_api_secs: u64,
    pub thumbnail_secs: u64,
    pub render_secs: u64,
    /// Per artifact store attempt.
    pub store_secs: u64,
    pub notify_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            resolve_secs: 15,
            metadata_secs: 15,
            scan_secs: 60,
            narrative_secs: 60,
            anchor_secs: 30,
            capture_secs: 25,
            screenshot_api_secs: 20,
            thumbnail_secs: 20,
            render_secs: 60,
            store_secs: 30,
            notify_secs: 15,
        }
    }
}

impl Timeouts {
    fn all(&self) -> [(&'static str, u64); 11] {
        [
            ("timeouts.resolve_secs", self.resolve_secs),
            ("timeouts.metadata_secs", self.metadata_secs),
            ("timeouts.scan_secs", self.scan_secs),
            ("timeouts.narrative_secs", self.narrative_secs),
            ("timeouts.anchor_secs", self.anchor_secs),
            ("timeouts.capture_secs", self.capture_secs),
            ("timeouts.screenshot_api_secs", self.screenshot_api_secs),
            ("timeouts.thumbnail_secs", self.thumbnail_secs),
            ("timeouts.render_secs", self.render_secs),
            ("timeouts.store_secs", self.store_secs),
            ("timeouts.notify_secs", self.notify_secs),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactRetry {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for ArtifactRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2,
            max_delay_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReprocessSettings {
    pub max_attempts: u32,
    pub cooldown_secs: u64,
}

impl Default for ReprocessSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub queue_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 60,
            max_delay_secs: 3600,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub verify_base_url: String,
    pub thresholds: RiskThresholds,
    pub concurrency_limit: usize,
    pub monitor_anchor_enabled: bool,
    pub cache_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub skip_artifact_generation: bool,
    /// Show error details in `failed` report views.
    pub debug: bool,
    pub lease_ttl_secs: u64,
    pub artifact_retry: ArtifactRetry,
    pub timeouts: Timeouts,
    pub reprocess: ReprocessSettings,
    pub dispatch: DispatchSettings,

    pub ledger_url: Option<String>,
    pub ledger_api_key: Option<String>,
    pub scanner_command: Option<String>,
    pub capture_command: Option<String>,
    pub screenshot_api_url: Option<String>,
    pub thumbnail_base_url: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub database_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            verify_base_url: "https://www.booppa.io".to_string(),
            thresholds: RiskThresholds::default(),
            concurrency_limit: 4,
            monitor_anchor_enabled: false,
            cache_dir: PathBuf::from("data/monitor-cache"),
            artifact_dir: PathBuf::from("data/artifacts"),
            skip_artifact_generation: false,
            debug: false,
            lease_ttl_secs: 300,
            artifact_retry: ArtifactRetry::default(),
            timeouts: Timeouts::default(),
            reprocess: ReprocessSettings::default(),
            dispatch: DispatchSettings::default(),
            ledger_url: None,
            ledger_api_key: None,
            scanner_command: None,
            capture_command: None,
            screenshot_api_url: None,
            thumbnail_base_url: Some("https://image.thum.io".to_string()),
            notify_webhook_url: None,
            database_url: None,
        }
    }
}

impl PipelineConfig {
    /// File (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        Ok(config)
    }

    /// Apply `BOOPPA_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BOOPPA_VERIFY_BASE_URL") {
            self.verify_base_url = v;
        }
        if let Some(v) = get("BOOPPA_RISK_LOW") {
            self.thresholds.low = parse("BOOPPA_RISK_LOW", &v)?;
        }
        if let Some(v) = get("BOOPPA_RISK_MEDIUM") {
            self.thresholds.medium = parse("BOOPPA_RISK_MEDIUM", &v)?;
        }
        if let Some(v) = get("BOOPPA_RISK_HIGH") {
            self.thresholds.high = parse("BOOPPA_RISK_HIGH", &v)?;
        }
        if let Some(v) = get("BOOPPA_CONCURRENCY_LIMIT") {
            self.concurrency_limit = parse("BOOPPA_CONCURRENCY_LIMIT", &v)?;
        }
        if let Some(v) = get("BOOPPA_MONITOR_ANCHOR_ENABLED") {
            self.monitor_anchor_enabled = parse_flag("BOOPPA_MONITOR_ANCHOR_ENABLED", &v)?;
        }
        if let Some(v) = get("BOOPPA_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BOOPPA_ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BOOPPA_SKIP_ARTIFACT_GENERATION") {
            self.skip_artifact_generation = parse_flag("BOOPPA_SKIP_ARTIFACT_GENERATION", &v)?;
        }
        if let Some(v) = get("BOOPPA_DEBUG") {
            self.debug = parse_flag("BOOPPA_DEBUG", &v)?;
        }
        if let Some(v) = get("BOOPPA_LEASE_TTL_SECS") {
            self.lease_ttl_secs = parse("BOOPPA_LEASE_TTL_SECS", &v)?;
        }
        if let Some(v) = get("BOOPPA_REPROCESS_MAX_ATTEMPTS") {
            self.reprocess.max_attempts = parse("BOOPPA_REPROCESS_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BOOPPA_REPROCESS_COOLDOWN_SECS") {
            self.reprocess.cooldown_secs = parse("BOOPPA_REPROCESS_COOLDOWN_SECS", &v)?;
        }
        if let Some(v) = get("BOOPPA_DISPATCH_MAX_RETRIES") {
            self.dispatch.max_retries = parse("BOOPPA_DISPATCH_MAX_RETRIES", &v)?;
        }

        let optional: [(&str, &mut Option<String>); 8] = [
            ("BOOPPA_LEDGER_URL", &mut self.ledger_url),
            ("BOOPPA_LEDGER_API_KEY", &mut self.ledger_api_key),
            ("BOOPPA_SCANNER_COMMAND", &mut self.scanner_command),
            ("BOOPPA_CAPTURE_COMMAND", &mut self.capture_command),
            ("BOOPPA_SCREENSHOT_API_URL", &mut self.screenshot_api_url),
            ("BOOPPA_THUMBNAIL_BASE_URL", &mut self.thumbnail_base_url),
            ("BOOPPA_NOTIFY_WEBHOOK_URL", &mut self.notify_webhook_url),
            ("BOOPPA_DATABASE_URL", &mut self.database_url),
        ];
        for (var, slot) in optional {
            if let Some(v) = get(var) {
                *slot = Some(v);
            }
        }
        if self.database_url.is_none() {
            self.database_url = get("DATABASE_URL");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.thresholds;
        if !t.is_valid() {
            return Err(ConfigError::Thresholds {
                low: t.low,
                medium: t.medium,
                high: t.high,
            });
        }

        let minimums: [(&'static str, u64); 5] = [
            ("concurrency_limit", self.concurrency_limit as u64),
            ("lease_ttl_secs", self.lease_ttl_secs),
            ("artifact_retry.max_attempts", self.artifact_retry.max_attempts as u64),
            ("reprocess.max_attempts", self.reprocess.max_attempts as u64),
            ("dispatch.queue_capacity", self.dispatch.queue_capacity as u64),
        ];
        for (field, value) in minimums.into_iter().chain(self.timeouts.all()) {
            if value < 1 {
                return Err(ConfigError::TooSmall { field, min: 1 });
            }
        }

        self.check_lease_budget()?;

        check_url("verify_base_url", &self.verify_base_url)?;
        let endpoints = [
            ("ledger_url", &self.ledger_url),
            ("screenshot_api_url", &self.screenshot_api_url),
            ("thumbnail_base_url", &self.thumbnail_base_url),
            ("notify_webhook_url", &self.notify_webhook_url),
        ];
        for (field, value) in endpoints {
            if let Some(value) = value {
                check_url(field, value)?;
            }
        }
        Ok(())
    }

    /// The lease is renewed between steps, so it has to outlast the slowest
    /// one.
    fn check_lease_budget(&self) -> Result<(), ConfigError> {
        let ttl = self.lease_ttl();
        let steps = self.workflow_settings().step_budgets();
        let screenshot = ("screenshot", self.screenshot_budget());
        for (step, budget) in steps.into_iter().chain([screenshot]) {
            if ttl <= budget {
                return Err(ConfigError::LeaseTooShort {
                    lease_ttl_secs: self.lease_ttl_secs,
                    step,
                    budget_secs: budget.as_secs(),
                });
            }
        }
        Ok(())
    }

    /// Worst case of the screenshot fallback chain: every configured provider
    /// runs to its timeout.
    fn screenshot_budget(&self) -> Duration {
        let t = &self.timeouts;
        let providers = [
            (self.capture_command.is_some(), t.capture_secs),
            (self.screenshot_api_url.is_some(), t.screenshot_api_secs),
            (self.thumbnail_base_url.is_some(), t.thumbnail_secs),
        ];
        Duration::from_secs(
            providers
                .iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, secs)| secs)
                .sum(),
        )
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn artifact_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.artifact_retry.max_attempts,
            base_delay: Duration::from_secs(self.artifact_retry.base_delay_secs),
            max_delay: Duration::from_secs(self.artifact_retry.max_delay_secs),
        }
    }

    pub fn reprocess_guard(&self) -> ReprocessGuard {
        ReprocessGuard::new(
            self.reprocess.max_attempts,
            Duration::from_secs(self.reprocess.cooldown_secs),
        )
    }

    pub fn dispatch_retry(&self) -> DispatchRetry {
        DispatchRetry {
            max_retries: self.dispatch.max_retries,
            base_delay: Duration::from_secs(self.dispatch.base_delay_secs),
            max_delay: Duration::from_secs(self.dispatch.max_delay_secs),
        }
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        let t = &self.timeouts;
        WorkflowSettings {
            resolve_timeout: Duration::from_secs(t.resolve_secs),
            metadata_timeout: Duration::from_secs(t.metadata_secs),
            narrative_timeout: Duration::from_secs(t.narrative_secs),
            anchor_timeout: Duration::from_secs(t.anchor_secs),
            render_timeout: Duration::from_secs(t.render_secs),
            store_timeout: Duration::from_secs(t.store_secs),
            notify_timeout: Duration::from_secs(t.notify_secs),
            lease_ttl: self.lease_ttl(),
            artifact_retry: self.artifact_retry_policy(),
            verify_base_url: self.verify_base_url.clone(),
            skip_artifact_generation: self.skip_artifact_generation,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            thresholds: self.thresholds,
            scan_timeout: Duration::from_secs(self.timeouts.scan_secs),
            narrative_timeout: Duration::from_secs(self.timeouts.narrative_secs),
            anchor_timeout: Duration::from_secs(self.timeouts.anchor_secs),
        }
    }
}

fn parse<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workflow_settings().artifact_retry, RetryPolicy::ARTIFACT_STORE);
        assert_eq!(config.reprocess_guard(), ReprocessGuard::default());
        assert_eq!(config.dispatch_retry(), DispatchRetry::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: PipelineConfig = serde_yaml::from_str(
            "concurrency_limit: 8\nthresholds: { low: 20, medium: 50, high: 90 }\ntimeouts:\n  anchor_secs: 5\n",
        )
        .unwrap();
        assert_eq!(config.concurrency_limit, 8);
        assert_eq!(config.thresholds.low, 20);
        assert_eq!(config.timeouts.anchor_secs, 5);
        assert_eq!(config.timeouts.render_secs, 60);
        assert_eq!(config.lease_ttl_secs, 300);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("booppa.yaml");
        std::fs::write(&path, "skip_artifact_generation: true\n").unwrap();
        assert!(PipelineConfig::from_file(&path).unwrap().skip_artifact_generation);
        assert!(PipelineConfig::from_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_env_with(env(&[
                ("BOOPPA_RISK_LOW", "10"),
                ("BOOPPA_SKIP_ARTIFACT_GENERATION", "yes"),
                ("BOOPPA_LEDGER_URL", "https://ledger.test"),
                ("DATABASE_URL", "postgres://localhost/booppa"),
                ("BOOPPA_NOTIFY_WEBHOOK_URL", "  "),
            ]))
            .unwrap();
        assert_eq!(config.thresholds.low, 10);
        assert!(config.skip_artifact_generation);
        assert_eq!(config.ledger_url.as_deref(), Some("https://ledger.test"));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/booppa"));
        assert!(config.notify_webhook_url.is_none());
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env_with(env(&[("BOOPPA_CONCURRENCY_LIMIT", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var, .. } if var == "BOOPPA_CONCURRENCY_LIMIT"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = PipelineConfig::default();
        config.thresholds = RiskThresholds { low: 50, medium: 40, high: 100 };
        assert!(matches!(config.validate(), Err(ConfigError::Thresholds { .. })));

        let mut config = PipelineConfig::default();
        config.concurrency_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooSmall { field: "concurrency_limit", .. })
        ));

        let mut config = PipelineConfig::default();
        config.timeouts.notify_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooSmall { field: "timeouts.notify_secs", .. })
        ));

        let mut config = PipelineConfig::default();
        config.timeouts.store_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooSmall { field: "timeouts.store_secs", .. })
        ));

        let mut config = PipelineConfig::default();
        config.ledger_url = Some("not a url".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { field: "ledger_url", .. })
        ));
    }

    #[test]
    fn test_lease_must_outlast_slowest_step() {
        // Artifact step: 60s render + 3 × 30s store + 2s + 4s backoff.
        let config = PipelineConfig::default();
        let budgets = config.workflow_settings().step_budgets();
        assert!(budgets.contains(&("store_artifact", Duration::from_secs(156))));

        let mut config = PipelineConfig::default();
        config.lease_ttl_secs = 156;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseTooShort {
                step: "store_artifact",
                budget_secs: 156,
                ..
            })
        ));
        config.lease_ttl_secs = 157;
        config.validate().unwrap();

        let mut config = PipelineConfig::default();
        config.timeouts.narrative_secs = 600;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseTooShort { step: "narrative", .. })
        ));
    }

    #[test]
    fn test_screenshot_chain_counts_configured_providers() {
        let mut config = PipelineConfig::default();
        config.capture_command = Some("shot {url}".into());
        config.screenshot_api_url = Some("https://shots.test".into());
        config.lease_ttl_secs = 200;
        // 25 + 20 + 20 = 65s fits; a slow capture command does not.
        config.validate().unwrap();

        config.timeouts.capture_secs = 170;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseTooShort { step: "screenshot", budget_secs: 210, .. })
        ));
    }
}
