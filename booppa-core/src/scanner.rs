//! Site scanning collaborators.
//!
//! `Scanner` covers the three site-facing operations the pipeline needs:
//! canonical URL resolution, site-metadata collection, and the summarized
//! risk scan used by the ad-hoc orchestrator.
//!
//! `HttpSiteInspector` implements all three with plain HTTP fetches and
//! pattern heuristics. `CommandScanner` delegates `scan` to an external
//! command and falls back to an inner scanner when the command yields nothing.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const USER_AGENT: &str = "BooppaComplianceBot/1.0";

/// Page bytes inspected per fetch. Anything past this is not downloaded.
pub const MAX_PAGE_BYTES: usize = 2 * 1024 * 1024;

/// Security headers reported by the site inspector.
pub const SECURITY_HEADERS: &[&str] = &[
    "strict-transport-security",
    "content-security-policy",
    "x-frame-options",
    "x-content-type-options",
    "referrer-policy",
    "permissions-policy",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlResolution {
    pub resolved_url: String,
    pub http_status: u16,
    pub uses_https: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsentMechanism {
    pub has_cookie_banner: bool,
    pub has_active_consent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DpoCompliance {
    pub has_dpo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DncMention {
    pub mentions_dnc: bool,
}

/// Site metadata merged into the report context by the workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteMetadata {
    pub consent_mechanism: ConsentMechanism,
    pub privacy_policy: PrivacyPolicy,
    pub dpo_compliance: DpoCompliance,
    pub dnc_mention: DncMention,
    pub collects_nric: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nric_evidence: Option<String>,
    pub security_headers: BTreeMap<String, bool>,
    /// Partial failures inside the collection (`cookie_scan_error`,
    /// `privacy_policy_fetch_error`). Flattened into the context as-is.
    #[serde(flatten)]
    pub errors: BTreeMap<String, String>,
}

/// Summarized scan result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub url: String,
    pub risk_score: u8,
    pub violation_count: u32,
    pub detected_labels: Vec<String>,
    pub identifier_hint: bool,
    pub scan_date: String,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Try HTTPS then HTTP and report whichever responds.
    async fn resolve(&self, url: &str) -> Result<UrlResolution>;
    async fn site_metadata(&self, url: &str) -> Result<SiteMetadata>;
    async fn scan(&self, url: &str) -> Result<ScanResult>;
}

/// Host part of a URL as typed by a requester, without scheme or trailing slash.
pub fn strip_scheme(url: &str) -> &str {
    let trimmed = url.trim();
    trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/')
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Derive a scan summary from collected site signals.
///
/// One violation per missing control; risk is `15 + 15·violations + 25` when
/// identifier collection is detected, capped at 100.
pub fn heuristic_scan(url: &str, uses_https: bool, metadata: &SiteMetadata) -> ScanResult {
    let consent = &metadata.consent_mechanism;
    let mut labels = Vec::new();
    let mut violations = 0u32;

    if !consent.has_cookie_banner || !consent.has_active_consent {
        violations += 1;
        labels.push("PDPA Section 13".to_string());
    }
    if !metadata.privacy_policy.found {
        violations += 1;
        labels.push("PDPA Section 20".to_string());
    }
    if !metadata.dpo_compliance.has_dpo {
        violations += 1;
        labels.push("PDPA Section 11".to_string());
    }
    if !metadata.dnc_mention.mentions_dnc {
        violations += 1;
        labels.push("DNC Registry".to_string());
    }
    if !uses_https {
        violations += 1;
        labels.push("PDPA Section 24".to_string());
    }
    if metadata.collects_nric {
        labels.push("PDPA Section 18".to_string());
    }

    let identifier = if metadata.collects_nric { 25 } else { 0 };
    let risk = (15 + 15 * violations + identifier).min(100);

    ScanResult {
        url: url.to_string(),
        risk_score: risk as u8,
        violation_count: violations,
        detected_labels: labels,
        identifier_hint: metadata.collects_nric,
        scan_date: today(),
    }
}

// ── HTTP site inspector ──

struct Patterns {
    consent_provider: Regex,
    cookie_banner: Regex,
    active_consent: Regex,
    privacy_link: Regex,
    dpo: Regex,
    email: Regex,
    dnc: Regex,
    nric: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        Ok(Self {
            consent_provider: Regex::new(
                r"(?i)\b(onetrust|cookiebot|cookieyes|trustarc|osano|quantcast|didomi|usercentrics|termly|iubenda|cookieconsent)\b",
            )?,
            cookie_banner: Regex::new(r"(?i)cookie[^<]{0,80}(consent|accept|agree|preferences)")?,
            active_consent: Regex::new(
                r"(?i)(accept all|reject all|decline|manage preferences|cookie settings|opt[- ]in)",
            )?,
            privacy_link: Regex::new(r#"(?i)href\s*=\s*["']([^"']*privacy[^"']*)["']"#)?,
            dpo: Regex::new(r"(?i)(data protection officer|\bdpo\b)")?,
            email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")?,
            dnc: Regex::new(r"(?i)(do[- ]not[- ]call|\bdnc\b)")?,
            nric: Regex::new(
                r#"(?i)(name\s*=\s*["'][^"']*(nric|fin_no|finno|ic_number)[^"']*["']|\bnric\b|\bnric/fin\b)"#,
            )?,
        })
    }
}

/// Built-in inspector using HTTP fetches and pattern heuristics.
pub struct HttpSiteInspector {
    client: reqwest::Client,
    patterns: Patterns,
}

impl HttpSiteInspector {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("building site inspector HTTP client")?;
        Ok(Self {
            client,
            patterns: Patterns::compile()?,
        })
    }

    /// Analyse a fetched page. `policy_text` is the privacy-policy page body,
    /// if it could be fetched.
    fn analyse(
        &self,
        html: &str,
        headers: &reqwest::header::HeaderMap,
        policy_url: Option<String>,
        policy_text: Option<&str>,
    ) -> SiteMetadata {
        let p = &self.patterns;
        let combined = match policy_text {
            Some(policy) => format!("{}\n{}", html, policy),
            None => html.to_string(),
        };

        let provider = p
            .consent_provider
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase());
        let has_cookie_banner = provider.is_some() || p.cookie_banner.is_match(html);
        let has_active_consent = has_cookie_banner && p.active_consent.is_match(html);

        let has_dpo = p.dpo.is_match(&combined);
        let dpo_contact = if has_dpo {
            p.email.find(&combined).map(|m| m.as_str().to_string())
        } else {
            None
        };

        let nric_match = p.nric.find(html);

        let security_headers = SECURITY_HEADERS
            .iter()
            .map(|h| (h.to_string(), headers.contains_key(*h)))
            .collect();

        SiteMetadata {
            consent_mechanism: ConsentMechanism {
                has_cookie_banner,
                has_active_consent,
                provider,
            },
            privacy_policy: PrivacyPolicy {
                found: policy_url.is_some(),
                url: policy_url,
            },
            dpo_compliance: DpoCompliance {
                has_dpo,
                contact: dpo_contact,
            },
            dnc_mention: DncMention {
                mentions_dnc: p.dnc.is_match(&combined),
            },
            collects_nric: nric_match.is_some(),
            nric_evidence: nric_match.map(|m| m.as_str().chars().take(120).collect()),
            security_headers,
            errors: BTreeMap::new(),
        }
    }

    async fn fetch(&self, url: &str) -> Result<(reqwest::StatusCode, reqwest::header::HeaderMap, String)> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        let mut body = Vec::with_capacity(
            response
                .content_length()
                .map_or(0, |len| len.min(MAX_PAGE_BYTES as u64) as usize),
        );
        while let Some(chunk) = response.chunk().await? {
            if push_capped(&mut body, &chunk, MAX_PAGE_BYTES) {
                tracing::debug!(url = %url, limit = MAX_PAGE_BYTES, "Page truncated");
                break;
            }
        }
        Ok((status, headers, String::from_utf8_lossy(&body).into_owned()))
    }
}

/// Append as much of `chunk` as fits under `cap`. True once the buffer is full.
fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    buf.len() >= cap
}

#[async_trait]
impl Scanner for HttpSiteInspector {
    async fn resolve(&self, url: &str) -> Result<UrlResolution> {
        let host = strip_scheme(url);
        if host.is_empty() {
            bail!("empty url");
        }

        let mut failures = Vec::new();
        for scheme in ["https", "http"] {
            let candidate = format!("{}://{}", scheme, host);
            match self.client.get(&candidate).send().await {
                Ok(response) => {
                    let final_url = response.url().clone();
                    return Ok(UrlResolution {
                        uses_https: final_url.scheme() == "https",
                        resolved_url: final_url.to_string(),
                        http_status: response.status().as_u16(),
                    });
                }
                Err(e) => failures.push(format!("{}: {}", scheme, e)),
            }
        }
        Err(anyhow!("all_attempts_failed ({})", failures.join("; ")))
    }

    async fn site_metadata(&self, url: &str) -> Result<SiteMetadata> {
        let (_, headers, html) = self
            .fetch(url)
            .await
            .with_context(|| format!("fetching {}", url))?;

        let policy_url = self
            .patterns
            .privacy_link
            .captures(&html)
            .and_then(|c| c.get(1))
            .and_then(|m| url::Url::parse(url).ok()?.join(m.as_str()).ok())
            .map(|u| u.to_string());

        let mut policy_error = None;
        let policy_text = match &policy_url {
            Some(link) => match self.fetch(link).await {
                Ok((status, _, body)) if status.is_success() => Some(body),
                Ok((status, _, _)) => {
                    policy_error = Some(format!("privacy policy returned {}", status));
                    None
                }
                Err(e) => {
                    policy_error = Some(e.to_string());
                    None
                }
            },
            None => None,
        };

        let mut metadata = self.analyse(&html, &headers, policy_url, policy_text.as_deref());
        if let Some(err) = policy_error {
            metadata
                .errors
                .insert("privacy_policy_fetch_error".into(), err);
        }
        Ok(metadata)
    }

    async fn scan(&self, url: &str) -> Result<ScanResult> {
        let resolution = self.resolve(url).await?;
        let metadata = match self.site_metadata(&resolution.resolved_url).await {
            Ok(m) => m,
            Err(e) => {
                let mut m = SiteMetadata::default();
                m.errors.insert("scan_error".into(), e.to_string());
                m
            }
        };
        Ok(heuristic_scan(url, resolution.uses_https, &metadata))
    }
}

// ── External command scanner ──

/// Map an external scanner's JSON onto `ScanResult`, accepting the field
/// aliases different scanner versions emit.
pub fn normalize_scan_output(url: &str, raw: &Value) -> Result<ScanResult> {
    let obj = raw
        .as_object()
        .ok_or_else(|| anyhow!("scanner output is not a JSON object"))?;

    let violation_count = match obj.get("pdpa_violations").and_then(Value::as_u64) {
        Some(n) => n,
        None => match obj.get("violations") {
            Some(Value::Array(items)) => items.len() as u64,
            _ => obj
                .get("violation_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        },
    };

    let labels = ["detected_laws", "laws", "regulations"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let identifier_hint = match obj.get("nric_found").and_then(Value::as_bool) {
        Some(found) => found,
        None => ["collects_nric", "nric_leak"]
            .iter()
            .any(|k| obj.get(*k).and_then(Value::as_bool).unwrap_or(false)),
    };

    let risk = ["overall_risk_score", "risk_score", "score"]
        .iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
        .map(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .ok_or_else(|| anyhow!("risk score is not a number: {}", v))
        })
        .transpose()?
        .unwrap_or(0);
    if !(0..=100).contains(&risk) {
        bail!("risk score {} outside 0..=100", risk);
    }

    Ok(ScanResult {
        url: obj
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(url)
            .to_string(),
        risk_score: risk as u8,
        violation_count: violation_count.min(u32::MAX as u64) as u32,
        detected_labels: labels,
        identifier_hint,
        scan_date: obj
            .get("scan_date")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(today),
    })
}

/// Runs `template` (with `{url}` substituted) and parses its JSON stdout.
pub struct CommandScanner {
    template: String,
    timeout: Duration,
    fallback: Arc<dyn Scanner>,
}

impl CommandScanner {
    pub fn new(template: impl Into<String>, timeout: Duration, fallback: Arc<dyn Scanner>) -> Self {
        Self {
            template: template.into(),
            timeout,
            fallback,
        }
    }

    fn argv(&self, url: &str) -> Vec<String> {
        self.template
            .split_whitespace()
            .map(|part| part.replace("{url}", url))
            .collect()
    }

    async fn run_command(&self, url: &str) -> Result<Option<Value>> {
        let argv = self.argv(url);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("scanner command is empty"))?;

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("scanner command timed out after {}s", self.timeout.as_secs()))?
        .with_context(|| format!("spawning scanner command {}", program))?;

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        match serde_json::from_slice::<Value>(&output.stdout) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Scanner command produced invalid JSON");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Scanner for CommandScanner {
    async fn resolve(&self, url: &str) -> Result<UrlResolution> {
        self.fallback.resolve(url).await
    }

    async fn site_metadata(&self, url: &str) -> Result<SiteMetadata> {
        self.fallback.site_metadata(url).await
    }

    async fn scan(&self, url: &str) -> Result<ScanResult> {
        match self.run_command(url).await? {
            Some(raw) => normalize_scan_output(url, &raw),
            None => {
                tracing::debug!(url = %url, "Scanner command returned nothing, using fallback");
                self.fallback.scan(url).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compliant_site() -> SiteMetadata {
        SiteMetadata {
            consent_mechanism: ConsentMechanism {
                has_cookie_banner: true,
                has_active_consent: true,
                provider: Some("onetrust".into()),
            },
            privacy_policy: PrivacyPolicy {
                found: true,
                url: None,
            },
            dpo_compliance: DpoCompliance {
                has_dpo: true,
                contact: None,
            },
            dnc_mention: DncMention { mentions_dnc: true },
            ..Default::default()
        }
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme(" https://acme.sg/ "), "acme.sg");
        assert_eq!(strip_scheme("http://acme.sg/path"), "acme.sg/path");
        assert_eq!(strip_scheme("acme.sg"), "acme.sg");
    }

    #[test]
    fn test_heuristic_scan_compliant_site() {
        let result = heuristic_scan("https://acme.sg", true, &compliant_site());
        assert_eq!(result.violation_count, 0);
        assert_eq!(result.risk_score, 15);
        assert!(result.detected_labels.is_empty());
    }

    #[test]
    fn test_heuristic_scan_caps_at_100() {
        let mut site = SiteMetadata::default();
        site.collects_nric = true;
        let result = heuristic_scan("http://acme.sg", false, &site);
        assert_eq!(result.violation_count, 5);
        assert_eq!(result.risk_score, 100);
        assert!(result.identifier_hint);
        assert!(result.detected_labels.contains(&"PDPA Section 18".to_string()));
    }

    #[test]
    fn test_normalize_aliases() {
        let raw = json!({
            "violations": [{}, {}, {}],
            "laws": ["PDPA Section 13"],
            "nric_leak": true,
            "score": 72,
        });
        let result = normalize_scan_output("acme.sg", &raw).unwrap();
        assert_eq!(result.violation_count, 3);
        assert_eq!(result.detected_labels, vec!["PDPA Section 13"]);
        assert!(result.identifier_hint);
        assert_eq!(result.risk_score, 72);
        assert_eq!(result.url, "acme.sg");
    }

    #[test]
    fn test_normalize_prefers_canonical_fields() {
        let raw = json!({
            "url": "https://acme.sg",
            "pdpa_violations": 1,
            "violation_count": 9,
            "nric_found": false,
            "collects_nric": true,
            "overall_risk_score": 40,
            "risk_score": 90,
            "scan_date": "2026-03-01",
        });
        let result = normalize_scan_output("acme.sg", &raw).unwrap();
        assert_eq!(result.violation_count, 1);
        assert!(!result.identifier_hint);
        assert_eq!(result.risk_score, 40);
        assert_eq!(result.scan_date, "2026-03-01");
        assert_eq!(result.url, "https://acme.sg");
    }

    #[test]
    fn test_normalize_rejects_out_of_range_risk() {
        assert!(normalize_scan_output("x", &json!({ "risk_score": 140 })).is_err());
        assert!(normalize_scan_output("x", &json!({ "risk_score": -1 })).is_err());
        assert!(normalize_scan_output("x", &json!([1])).is_err());
    }

    #[test]
    fn test_site_metadata_flattens_partial_errors() {
        let mut site = SiteMetadata::default();
        site.errors
            .insert("privacy_policy_fetch_error".into(), "timeout".into());
        let value = serde_json::to_value(&site).unwrap();
        assert_eq!(value["privacy_policy_fetch_error"], json!("timeout"));
        assert_eq!(value["consent_mechanism"]["has_cookie_banner"], json!(false));
    }

    #[test]
    fn test_inspector_analyse_detects_signals() {
        let inspector = HttpSiteInspector::new(Duration::from_secs(5)).unwrap();
        let html = r#"
            <script src="https://cdn.cookielaw.org/onetrust.js"></script>
            <button>Accept all</button>
            <a href="/privacy-policy">Privacy</a>
            <input name="nric_number" />
        "#;
        let policy = "Contact our Data Protection Officer at dpo@acme.sg. We respect the Do Not Call registry.";
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "strict-transport-security",
            reqwest::header::HeaderValue::from_static("max-age=31536000"),
        );

        let site = inspector.analyse(
            html,
            &headers,
            Some("https://acme.sg/privacy-policy".into()),
            Some(policy),
        );

        assert_eq!(site.consent_mechanism.provider.as_deref(), Some("onetrust"));
        assert!(site.consent_mechanism.has_active_consent);
        assert!(site.privacy_policy.found);
        assert_eq!(site.dpo_compliance.contact.as_deref(), Some("dpo@acme.sg"));
        assert!(site.dnc_mention.mentions_dnc);
        assert!(site.collects_nric);
        assert_eq!(site.security_headers["strict-transport-security"], true);
        assert_eq!(site.security_headers["content-security-policy"], false);
    }

    #[tokio::test]
    async fn test_command_scanner_parses_stdout() {
        struct Unused;
        #[async_trait]
        impl Scanner for Unused {
            async fn resolve(&self, _: &str) -> Result<UrlResolution> {
                bail!("unused")
            }
            async fn site_metadata(&self, _: &str) -> Result<SiteMetadata> {
                bail!("unused")
            }
            async fn scan(&self, _: &str) -> Result<ScanResult> {
                bail!("unused")
            }
        }

        let scanner = CommandScanner::new(
            r#"echo {"url":"{url}","pdpa_violations":2,"overall_risk_score":55}"#,
            Duration::from_secs(5),
            Arc::new(Unused),
        );
        let result = scanner.scan("acme.sg").await.unwrap();
        assert_eq!(result.violation_count, 2);
        assert_eq!(result.risk_score, 55);
        assert_eq!(result.url, "acme.sg");
    }

    #[test]
    fn test_page_body_is_capped() {
        let mut body = Vec::new();
        assert!(!push_capped(&mut body, b"<html>", 10));
        assert!(push_capped(&mut body, b"<body>cookie</body>", 10));
        assert_eq!(body, b"<html><bod");

        // Once full, further chunks add nothing.
        assert!(push_capped(&mut body, b"more", 10));
        assert_eq!(body.len(), 10);

        let mut exact = Vec::new();
        assert!(push_capped(&mut exact, &[b'x'; 4], 4));
        assert_eq!(exact.len(), 4);
    }
}
