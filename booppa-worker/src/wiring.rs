//! Builds pipeline collaborators from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use booppa_core::anchor::{HttpLedgerClient, LedgerAnchor};
use booppa_core::narrative::RuleBasedNarrator;
use booppa_core::notify::{LogNotifier, Notifier, WebhookNotifier};
use booppa_core::render::{LocalArtifactStore, TextArtifactRenderer};
use booppa_core::scanner::{CommandScanner, HttpSiteInspector, Scanner};
use booppa_core::screenshot::{
    CommandCapture, ScreenshotApi, ScreenshotChain, ScreenshotProvider, ThumbnailService,
};
use booppa_core::{Collaborators, PipelineConfig};

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

/// Site scanner: the external command when configured, falling back to the
/// built-in HTTP inspector.
pub fn scanner(config: &PipelineConfig) -> Result<Arc<dyn Scanner>> {
    let inspector: Arc<dyn Scanner> =
        Arc::new(HttpSiteInspector::new(secs(config.timeouts.metadata_secs))?);
    Ok(match &config.scanner_command {
        Some(command) => {
            tracing::info!(command = %command, "Using external scanner command");
            Arc::new(CommandScanner::new(
                command.clone(),
                secs(config.timeouts.scan_secs),
                inspector,
            ))
        }
        None => inspector,
    })
}

pub fn ledger(config: &PipelineConfig) -> Result<Option<LedgerAnchor>> {
    let Some(url) = &config.ledger_url else {
        tracing::info!("No ledger configured, anchoring disabled");
        return Ok(None);
    };
    let client = HttpLedgerClient::new(
        url,
        config.ledger_api_key.clone(),
        secs(config.timeouts.anchor_secs),
    )?;
    Ok(Some(LedgerAnchor::new(Arc::new(client))))
}

/// Screenshot providers in fallback order.
pub fn screenshots(config: &PipelineConfig) -> Result<ScreenshotChain> {
    let t = &config.timeouts;
    let mut providers: Vec<Arc<dyn ScreenshotProvider>> = Vec::new();
    if let Some(command) = &config.capture_command {
        providers.push(Arc::new(CommandCapture::new(command.clone(), secs(t.capture_secs))));
    }
    if let Some(url) = &config.screenshot_api_url {
        providers.push(Arc::new(ScreenshotApi::new(url, secs(t.screenshot_api_secs))?));
    }
    if let Some(url) = &config.thumbnail_base_url {
        providers.push(Arc::new(ThumbnailService::new(url, secs(t.thumbnail_secs))?));
    }
    Ok(ScreenshotChain::new(providers))
}

pub fn notifier(config: &PipelineConfig) -> Result<Arc<dyn Notifier>> {
    Ok(match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), secs(config.timeouts.notify_secs))?),
        None => Arc::new(LogNotifier),
    })
}

/// Everything a workflow run talks to.
pub fn collaborators(config: &PipelineConfig) -> Result<Collaborators> {
    let mut collaborators = Collaborators::new(
        scanner(config)?,
        Arc::new(RuleBasedNarrator::new()),
        Arc::new(TextArtifactRenderer),
        Arc::new(LocalArtifactStore::new(config.artifact_dir.clone())),
        notifier(config)?,
    )
    .with_screenshots(screenshots(config)?);

    if let Some(anchor) = ledger(config)? {
        collaborators = collaborators.with_anchor(anchor);
    }
    Ok(collaborators)
}
