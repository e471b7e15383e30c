//! Screenshot capture.
//!
//! A [`ScreenshotChain`] tries each provider in order, each under its own
//! timeout, and stops at the first non-empty image. Failures are collected as
//! `"<provider>:<reason>"` diagnostics rather than returned as errors.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{truncate_chars, MARKER_TEXT_LIMIT};

#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    fn name(&self) -> &str;
    fn timeout(&self) -> Duration;
    /// PNG/JPEG bytes. An empty vector counts as no image.
    async fn capture(&self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured {
        provider: String,
        /// Standard base64 of the image bytes.
        image_base64: String,
        diagnostics: Vec<String>,
    },
    Failed {
        diagnostics: Vec<String>,
    },
}

#[derive(Clone, Default)]
pub struct ScreenshotChain {
    providers: Vec<Arc<dyn ScreenshotProvider>>,
}

impl ScreenshotChain {
    pub fn new(providers: Vec<Arc<dyn ScreenshotProvider>>) -> Self {
        Self { providers }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn capture(&self, url: &str) -> CaptureOutcome {
        let mut diagnostics = Vec::new();

        for provider in &self.providers {
            let name = provider.name().to_string();
            match tokio::time::timeout(provider.timeout(), provider.capture(url)).await {
                Ok(Ok(bytes)) if !bytes.is_empty() => {
                    tracing::debug!(url = %url, provider = %name, bytes = bytes.len(), "Screenshot captured");
                    return CaptureOutcome::Captured {
                        provider: name,
                        image_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                        diagnostics,
                    };
                }
                Ok(Ok(_)) => diagnostics.push(format!("{}:empty", name)),
                Ok(Err(e)) => diagnostics.push(format!(
                    "{}:{}",
                    name,
                    truncate_chars(&e.to_string(), MARKER_TEXT_LIMIT)
                )),
                Err(_) => diagnostics.push(format!("{}:timeout", name)),
            }
        }

        if self.providers.is_empty() {
            diagnostics.push("no_providers".to_string());
        }
        CaptureOutcome::Failed { diagnostics }
    }
}

/// Headless-browser command writing the image to stdout. `{url}` in the
/// template is replaced by the target.
pub struct CommandCapture {
    template: String,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            template: template.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ScreenshotProvider for CommandCapture {
    fn name(&self) -> &str {
        "capture"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn capture(&self, url: &str) -> Result<Vec<u8>> {
        let argv: Vec<String> = self
            .template
            .split_whitespace()
            .map(|part| part.replace("{url}", url))
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("capture command is empty"))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", program))?;
        if !output.status.success() {
            bail!("exit status {}", output.status);
        }
        Ok(output.stdout)
    }
}

/// Browserless-style screenshot API: `POST {base}/screenshot`.
pub struct ScreenshotApi {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ScreenshotApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
            timeout,
        })
    }
}

#[async_trait]
impl ScreenshotProvider for ScreenshotApi {
    fn name(&self) -> &str {
        "screenshot_api"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn capture(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}/screenshot", self.base_url))
            .json(&serde_json::json!({
                "url": url,
                "options": { "type": "png", "fullPage": false },
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("status {}", response.status().as_u16());
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Public thumbnail service: `GET {base}/get/width/1400/{url}`.
pub struct ThumbnailService {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ThumbnailService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
            timeout,
        })
    }
}

#[async_trait]
impl ScreenshotProvider for ThumbnailService {
    fn name(&self) -> &str {
        "thumbnail"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn capture(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/get/width/1400/{}", self.base_url, url))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("status {}", response.status().as_u16());
        }
        let is_image = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("image/"));
        if !is_image {
            bail!("non-image response");
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        result: fn() -> Result<Vec<u8>>,
        delay: Duration,
    }

    #[async_trait]
    impl ScreenshotProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        async fn capture(&self, _url: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            (self.result)()
        }
    }

    fn provider(name: &'static str, result: fn() -> Result<Vec<u8>>, delay: Duration) -> Arc<dyn ScreenshotProvider> {
        Arc::new(Fixed { name, result, delay })
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_falls_through_to_first_success() {
        let chain = ScreenshotChain::new(vec![
            provider("slow", || Ok(vec![1]), Duration::from_secs(5)),
            provider("broken", || Err(anyhow!("boom")), Duration::ZERO),
            provider("blank", || Ok(vec![]), Duration::ZERO),
            provider("good", || Ok(vec![0x89, 0x50]), Duration::ZERO),
            provider("never", || Ok(vec![9]), Duration::ZERO),
        ]);

        match chain.capture("https://acme.sg").await {
            CaptureOutcome::Captured {
                provider,
                image_base64,
                diagnostics,
            } => {
                assert_eq!(provider, "good");
                assert_eq!(image_base64, "iVA=");
                assert_eq!(diagnostics, vec!["slow:timeout", "broken:boom", "blank:empty"]);
            }
            other => panic!("expected capture, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chain_total_failure_collects_diagnostics() {
        let chain = ScreenshotChain::new(vec![provider("a", || Err(anyhow!("dns")), Duration::ZERO)]);
        assert_eq!(
            chain.capture("x").await,
            CaptureOutcome::Failed {
                diagnostics: vec!["a:dns".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_empty_chain() {
        assert_eq!(
            ScreenshotChain::default().capture("x").await,
            CaptureOutcome::Failed {
                diagnostics: vec!["no_providers".to_string()]
            }
        );
    }
}
