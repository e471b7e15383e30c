//! Booppa worker
//!
//! Command-line entry point for the evidence pipeline.
//!
//! # Usage
//!
//! ```bash
//! # Ad-hoc scans, memoized in the content cache
//! booppa-worker scan https://acme.sg https://example.com --concurrency 4
//!
//! # One report end to end, in memory
//! booppa-worker assess --framework pdpa_basic --company "Acme Pte Ltd" \
//!     --website acme.sg --email dpo@acme.sg --paid --product compliance_pro
//!
//! # Background worker over Postgres (feature "database")
//! DATABASE_URL=postgresql:///booppa booppa-worker work
//! ```

mod wiring;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use booppa_core::cache::{ContentCache, FsContentCache, MemoryContentCache};
use booppa_core::{
    EvidenceService, MemoryReportStore, NewReport, Orchestrator, PipelineConfig, ReportWorkflow,
    TaskDispatcher,
};

#[derive(Parser)]
#[command(name = "booppa-worker")]
#[command(version)]
#[command(about = "Compliance evidence pipeline: scan, assess, anchor, verify")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file (environment variables override it)
    #[arg(long, short, global = true, env = "BOOPPA_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan URLs and print the orchestration results
    Scan {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Maximum scans in flight (defaults to the configured limit)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Bypass the on-disk content cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Create one report and process it inline against an in-memory store
    Assess {
        #[arg(long, default_value = "pdpa_free_scan")]
        framework: String,

        #[arg(long)]
        company: String,

        #[arg(long)]
        website: Option<String>,

        #[arg(long)]
        email: Option<String>,

        /// Mark payment as confirmed
        #[arg(long)]
        paid: bool,

        /// Purchased product key
        #[arg(long)]
        product: Option<String>,

        /// Extra context as key=value (value parsed as JSON when possible)
        #[arg(long = "data", value_parser = parse_key_value)]
        data: Vec<(String, Value)>,
    },

    /// Run the background worker (requires feature "database")
    #[cfg(feature = "database")]
    Work {
        /// Seconds between stalled-report sweeps
        #[arg(long, default_value_t = 300)]
        sweep_secs: u64,

        /// Database pool size
        #[arg(long, default_value_t = 10)]
        max_connections: u32,
    },

    /// Insert a pending report for the worker to pick up
    #[cfg(feature = "database")]
    Submit {
        #[arg(long, default_value = "pdpa_free_scan")]
        framework: String,

        #[arg(long)]
        company: String,

        #[arg(long)]
        website: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long = "data", value_parser = parse_key_value)]
        data: Vec<(String, Value)>,
    },

    /// Show a report as the read boundary renders it
    #[cfg(feature = "database")]
    Status { report_id: uuid::Uuid },

    /// Look up the public verification record for an evidence digest
    #[cfg(feature = "database")]
    Verify { audit_hash: String },
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "booppa_worker=info,booppa_core=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan {
            urls,
            concurrency,
            no_cache,
        } => cmd_scan(&config, urls, concurrency, no_cache).await,
        Commands::Assess {
            framework,
            company,
            website,
            email,
            paid,
            product,
            data,
        } => {
            let mut request = new_request(framework, company, website, email, data);
            if paid {
                request = request.with_data("payment_confirmed", Value::Bool(true));
            }
            if let Some(product) = product {
                request = request.with_data("product_type", Value::String(product));
            }
            cmd_assess(&config, request).await
        }
        #[cfg(feature = "database")]
        Commands::Work {
            sweep_secs,
            max_connections,
        } => database::cmd_work(&config, sweep_secs, max_connections).await,
        #[cfg(feature = "database")]
        Commands::Submit {
            framework,
            company,
            website,
            email,
            data,
        } => {
            let request = new_request(framework, company, website, email, data);
            database::cmd_submit(&config, request).await
        }
        #[cfg(feature = "database")]
        Commands::Status { report_id } => database::cmd_status(&config, report_id).await,
        #[cfg(feature = "database")]
        Commands::Verify { audit_hash } => database::cmd_verify(&config, &audit_hash).await,
    }
}

fn new_request(
    framework: String,
    company: String,
    website: Option<String>,
    email: Option<String>,
    data: Vec<(String, Value)>,
) -> NewReport {
    let mut request = NewReport::new(framework, company);
    if let Some(website) = website {
        request = request.with_website(website);
    }
    if let Some(email) = email {
        request = request.with_contact_email(email);
    }
    for (key, value) in data {
        request = request.with_data(key, value);
    }
    request
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn cmd_scan(
    config: &PipelineConfig,
    urls: Vec<String>,
    concurrency: Option<usize>,
    no_cache: bool,
) -> Result<()> {
    let cache: Arc<dyn ContentCache> = if no_cache {
        Arc::new(MemoryContentCache::new())
    } else {
        Arc::new(FsContentCache::new(config.cache_dir.clone()))
    };

    let mut orchestrator = Orchestrator::new(
        wiring::scanner(config)?,
        Arc::new(booppa_core::narrative::RuleBasedNarrator::new()),
        cache,
        config.orchestrator_settings(),
    );
    if config.monitor_anchor_enabled {
        if let Some(anchor) = wiring::ledger(config)? {
            orchestrator = orchestrator.with_anchor(anchor);
        }
    }

    let limit = concurrency.unwrap_or(config.concurrency_limit);
    let results = orchestrator.run_many(&urls, limit).await;

    let mut failures = 0;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(result) => print_json(&result)?,
            Err(e) => {
                failures += 1;
                tracing::error!(url = %url, error = %e, "Scan failed");
            }
        }
    }
    tracing::info!(total = urls.len(), failures, "Scan batch finished");
    if failures > 0 {
        anyhow::bail!("{} of {} scans failed", failures, urls.len());
    }
    Ok(())
}

async fn cmd_assess(config: &PipelineConfig, request: NewReport) -> Result<()> {
    let store = Arc::new(MemoryReportStore::new());
    let collaborators = wiring::collaborators(config)?;
    let anchor = collaborators.anchor.clone();

    let (dispatcher, mut queue) = TaskDispatcher::channel(1);
    let mut service = EvidenceService::new(
        store.clone(),
        Arc::new(dispatcher),
        config.reprocess_guard(),
        config.verify_base_url.clone(),
    )
    .with_debug(config.debug);
    if let Some(anchor) = anchor {
        service = service.with_anchor(anchor);
    }

    let report_id = service.create_report(request).await?;
    let queued = queue.recv().await.context("report was not dispatched")?;

    let workflow = ReportWorkflow::new(store, collaborators, config.workflow_settings());
    if let Err(e) = workflow.run(queued).await {
        tracing::error!(report_id = %report_id, error = %e, "Assessment failed");
    }

    let view = service.get_report(report_id).await?;
    print_json(&view)?;
    if let Some(audit_hash) = &view.audit_hash {
        if let Some(record) = service.verify(audit_hash).await? {
            print_json(&record)?;
        }
    }
    Ok(())
}

#[cfg(feature = "database")]
mod database {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use tokio::sync::watch;

    use booppa_core::dispatcher::requeue_stalled;
    use booppa_core::{
        DispatchWorker, EvidenceService, NewReport, PgReportStore, PipelineConfig, ReportId,
        ReportStore, ReportWorkflow, TaskDispatcher,
    };

    use crate::{print_json, wiring};

    const SWEEP_LIMIT: usize = 500;

    async fn connect(config: &PipelineConfig, max_connections: u32) -> Result<Arc<PgReportStore>> {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL (or BOOPPA_DATABASE_URL) is not set")?;
        let store = PgReportStore::connect(url, max_connections).await?;
        store.bootstrap().await?;
        Ok(Arc::new(store))
    }

    /// Read-only service; its dispatcher has no consumer.
    fn reader(config: &PipelineConfig, store: Arc<PgReportStore>) -> Result<EvidenceService> {
        let (dispatcher, _queue) = TaskDispatcher::channel(1);
        let mut service = EvidenceService::new(
            store,
            Arc::new(dispatcher),
            config.reprocess_guard(),
            config.verify_base_url.clone(),
        )
        .with_debug(config.debug);
        if let Some(anchor) = wiring::ledger(config)? {
            service = service.with_anchor(anchor);
        }
        Ok(service)
    }

    pub async fn cmd_work(config: &PipelineConfig, sweep_secs: u64, max_connections: u32) -> Result<()> {
        let store = connect(config, max_connections).await?;
        let (dispatcher, queue) = TaskDispatcher::channel(config.dispatch.queue_capacity);

        let workflow = ReportWorkflow::new(
            store.clone(),
            wiring::collaborators(config)?,
            config.workflow_settings(),
        );
        let worker = DispatchWorker::new(
            workflow,
            dispatcher.clone(),
            config.dispatch_retry(),
            config.concurrency_limit,
        );

        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                let _ = stop.send(true);
            }
        });

        let sweeper = {
            let store = store.clone();
            let dispatcher = dispatcher.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs.max(1)));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = requeue_stalled(store.as_ref(), &dispatcher, SWEEP_LIMIT).await {
                                tracing::warn!(error = %e, "Stalled-report sweep failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        worker.run(queue, shutdown).await;
        sweeper.abort();
        Ok(())
    }

    pub async fn cmd_submit(config: &PipelineConfig, request: NewReport) -> Result<()> {
        let store = connect(config, 2).await?;
        let report = store.create_report(request).await?;
        tracing::info!(report_id = %report.id, "Report submitted");
        println!("{}", report.id);
        Ok(())
    }

    pub async fn cmd_status(config: &PipelineConfig, report_id: ReportId) -> Result<()> {
        let store = connect(config, 2).await?;
        let view = reader(config, store)?.get_report(report_id).await?;
        print_json(&view)
    }

    pub async fn cmd_verify(config: &PipelineConfig, audit_hash: &str) -> Result<()> {
        let store = connect(config, 2).await?;
        match reader(config, store)?.verify(audit_hash).await? {
            Some(record) => print_json(&record),
            None => anyhow::bail!("no report registered for {}", audit_hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("payment_confirmed=true").unwrap(),
            ("payment_confirmed".to_string(), Value::Bool(true))
        );
        assert_eq!(
            parse_key_value("tier=Enterprise").unwrap(),
            ("tier".to_string(), Value::String("Enterprise".to_string()))
        );
        assert!(parse_key_value("no-separator").is_err());
    }

    #[test]
    fn test_cli_parses_assess() {
        let cli = Cli::try_parse_from([
            "booppa-worker",
            "assess",
            "--company",
            "Acme",
            "--paid",
            "--data",
            "on_page_only=true",
        ])
        .unwrap();
        match cli.command {
            Commands::Assess {
                framework,
                paid,
                data,
                ..
            } => {
                assert_eq!(framework, "pdpa_free_scan");
                assert!(paid);
                assert_eq!(data, vec![("on_page_only".to_string(), Value::Bool(true))]);
            }
            _ => panic!("expected assess"),
        }
    }
}
