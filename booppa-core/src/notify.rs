//! Requester notification. Always best-effort from the workflow's side.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::types::ReportId;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, to: &str, artifact_url: Option<&str>, report_id: ReportId) -> Result<()>;
}

/// Logs the notification instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, to: &str, artifact_url: Option<&str>, report_id: ReportId) -> Result<()> {
        tracing::info!(
            report_id = %report_id,
            to = %to,
            artifact_url = artifact_url.unwrap_or("-"),
            "Report ready notification"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    event: &'static str,
    report_id: ReportId,
    to: &'a str,
    artifact_url: Option<&'a str>,
}

/// POSTs a JSON notification to a webhook (mail relay, chat, etc.).
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, to: &str, artifact_url: Option<&str>, report_id: ReportId) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookBody {
                event: "report_ready",
                report_id,
                to,
                artifact_url,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("webhook returned {}", response.status().as_u16());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier
            .notify("ops@acme.sg", None, uuid::Uuid::new_v4())
            .await
            .is_ok());
    }

    #[test]
    fn test_webhook_body_shape() {
        let id = uuid::Uuid::nil();
        let body = serde_json::to_value(WebhookBody {
            event: "report_ready",
            report_id: id,
            to: "ops@acme.sg",
            artifact_url: Some("file:///tmp/r.txt"),
        })
        .unwrap();
        assert_eq!(body["event"], "report_ready");
        assert_eq!(body["artifact_url"], "file:///tmp/r.txt");
    }
}
