//! Narrative generation.
//!
//! `NarrativeGenerator` produces either a full structured report or a light
//! summary from a scan payload. `RuleBasedNarrator` is the deterministic
//! implementation: fixed violation rules, severity weights, and PDPA
//! references.

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::assessment::AssessmentData;
use crate::scanner::{ConsentMechanism, DncMention, DpoCompliance, ScanResult};
use crate::types::Report;

pub const RULE_BASED_MODEL: &str = "booppa-rules-v1";

pub const DISCLAIMER: &str = "This report is generated from automated checks of publicly \
accessible website content. It is not legal advice. Consult qualified counsel before \
relying on it for compliance decisions.";

/// Input to narrative generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanPayload {
    pub company_name: String,
    pub url: Option<String>,
    pub scan_date: Option<String>,
    pub collects_nric: bool,
    pub has_legal_justification: bool,
    pub uses_https: bool,
    pub nric_evidence: Option<String>,
    pub consent_mechanism: ConsentMechanism,
    pub dpo_compliance: DpoCompliance,
    pub dnc_mention: DncMention,
    pub detected_laws: Vec<String>,
    pub overall_risk_score: Option<u8>,
}

fn typed<T: DeserializeOwned>(data: &AssessmentData, key: &str) -> Option<T> {
    data.value(key).and_then(|v| serde_json::from_value(v).ok())
}

impl ScanPayload {
    /// Payload for a persisted report, read from its context.
    pub fn from_report(report: &Report) -> Self {
        let data = &report.assessment_data;
        Self {
            company_name: report.company_name.clone(),
            url: report.target_url(),
            scan_date: Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            collects_nric: typed(data, "collects_nric").unwrap_or(false),
            has_legal_justification: typed(data, "has_legal_justification").unwrap_or(false),
            uses_https: data.uses_https.unwrap_or(false),
            nric_evidence: typed(data, "nric_evidence"),
            consent_mechanism: typed(data, "consent_mechanism").unwrap_or_default(),
            dpo_compliance: typed(data, "dpo_compliance").unwrap_or_default(),
            dnc_mention: typed(data, "dnc_mention").unwrap_or_default(),
            detected_laws: typed(data, "detected_laws").unwrap_or_default(),
            overall_risk_score: typed(data, "overall_risk_score"),
        }
    }

    /// Payload for an ad-hoc scan. HTTPS is assumed; the scan summary does
    /// not carry it.
    pub fn from_scan(scan: &ScanResult) -> Self {
        Self {
            company_name: "Not specified".to_string(),
            url: Some(scan.url.clone()),
            scan_date: Some(scan.scan_date.clone()),
            collects_nric: scan.identifier_hint,
            uses_https: true,
            detected_laws: scan.detected_labels.clone(),
            overall_risk_score: Some(scan.risk_score),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            Self::Critical => 10,
            Self::High => 7,
            Self::Medium => 4,
            Self::Low => 1,
        }
    }

    pub fn deadline(&self) -> &'static str {
        match self {
            Self::Critical => "24-48 hours for immediate action, 7 days for full compliance",
            Self::High => "48-72 hours for immediate action, 14 days for full compliance",
            Self::Medium => "7 days for initial action, 30 days for full compliance",
            Self::Low => "14 days for initial action, 60 days for full compliance",
        }
    }

    pub fn priority(&self) -> &'static str {
        match self {
            Self::Critical => "Immediate (24-48 hours)",
            Self::High => "Urgent (7 days)",
            Self::Medium => "Important (30 days)",
            Self::Low => "Planning (60 days)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NricViolation,
    SecurityViolation,
    CookieViolation,
    OrganizationalViolation,
    MarketingViolation,
}

impl ViolationKind {
    fn legislation(&self) -> Vec<String> {
        let refs: &[&str] = match self {
            Self::NricViolation => &["PDPA Section 18", "PDPC Advisory Guidelines 2018"],
            Self::CookieViolation => &["PDPA Section 13", "PDPC Guide to Enhanced Notice 2021"],
            Self::SecurityViolation => &["PDPA Section 24", "Cybersecurity Act 2018", "MAS Notice 644"],
            Self::OrganizationalViolation => &["PDPA Section 11", "PDPC Guide to Accountability"],
            Self::MarketingViolation => &["DNC Registry", "Spam Control Act"],
        };
        refs.iter().map(|s| s.to_string()).collect()
    }

    fn action(&self) -> &'static str {
        match self {
            Self::NricViolation => "Stop collecting NRIC/FIN numbers unless required by law; use alternative identifiers",
            Self::SecurityViolation => "Enable HTTPS site-wide and redirect all HTTP traffic",
            Self::CookieViolation => "Deploy a consent banner with explicit accept and reject options before setting non-essential cookies",
            Self::OrganizationalViolation => "Appoint a Data Protection Officer and publish business contact details",
            Self::MarketingViolation => "Document DNC Registry checks for all marketing messages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub severity: Severity,
    pub details: String,
    pub location: String,
    pub evidence: String,
    pub legislation: Vec<String>,
    pub deadline: String,
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub level: String,
    pub description: String,
    pub breakdown: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: String,
    pub severity: Severity,
    pub priority: String,
    pub timeline: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegalReference {
    pub title: String,
    pub url: String,
    pub relevance: String,
}

/// Full narrative report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredReport {
    pub executive_summary: String,
    pub risk_assessment: RiskAssessment,
    pub detailed_findings: Vec<Finding>,
    pub recommendations: Vec<Recommendation>,
    pub legal_references: Vec<LegalReference>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub detected_laws: Vec<String>,
    pub disclaimer: String,
    pub model: String,
}

/// Light summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSummary {
    pub summary: String,
    pub recommendation: String,
    pub risk_score: Option<u8>,
    #[serde(default)]
    pub detected_laws: Vec<String>,
}

/// Narrative produced for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Narrative {
    Light(LightSummary),
    Full(StructuredReport),
}

impl Narrative {
    /// Plain-text form stored on the report and hashed as evidence.
    pub fn text(&self) -> String {
        match self {
            Self::Light(light) => format!("{}\n\n{}", light.summary, light.recommendation),
            Self::Full(full) => full.executive_summary.clone(),
        }
    }
}

#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn full(&self, payload: &ScanPayload) -> Result<StructuredReport>;
    async fn light(&self, payload: &ScanPayload) -> Result<LightSummary>;
    /// Identifier recorded as `narrative_model`.
    fn model(&self) -> &str;
}

/// `min(100, 8 · Σ weight)`.
pub fn risk_score(findings: &[Finding]) -> u8 {
    let total: u32 = findings.iter().map(|f| f.severity.weight()).sum();
    total.saturating_mul(8).min(100) as u8
}

/// Risk band for a 0-100 score.
pub fn risk_level(score: u8) -> (&'static str, &'static str) {
    match score {
        80.. => ("CRITICAL", "Immediate action required"),
        60..=79 => ("HIGH", "Urgent attention needed"),
        40..=59 => ("MEDIUM", "Address within 30 days"),
        20..=39 => ("LOW", "Monitor and plan fixes"),
        _ => ("MINIMAL", "Maintain current practices"),
    }
}

/// Detect violations from a scan payload.
pub fn detect_violations(payload: &ScanPayload) -> Vec<Finding> {
    let location = payload.url.clone().unwrap_or_else(|| "website".to_string());
    let mut findings = Vec::new();
    let mut push = |kind: ViolationKind, severity: Severity, details: &str, location: &str, evidence: String| {
        findings.push(Finding {
            kind,
            severity,
            details: details.to_string(),
            location: location.to_string(),
            evidence,
            legislation: kind.legislation(),
            deadline: severity.deadline().to_string(),
            priority: severity.priority().to_string(),
        });
    };

    if payload.collects_nric && !payload.has_legal_justification {
        push(
            ViolationKind::NricViolation,
            Severity::Critical,
            "NRIC collection detected without clear legal justification",
            location.as_str(),
            payload
                .nric_evidence
                .clone()
                .unwrap_or_else(|| "Form fields collecting NRIC/FIN".to_string()),
        );
    }

    if !payload.uses_https {
        push(
            ViolationKind::SecurityViolation,
            Severity::Critical,
            "Website does not use HTTPS encryption; data transmission is insecure",
            location.as_str(),
            format!("HTTP protocol detected at {}", location),
        );
    }

    let consent = &payload.consent_mechanism;
    if !consent.has_cookie_banner {
        push(
            ViolationKind::CookieViolation,
            Severity::High,
            "Missing cookie consent banner; implied consent is not compliant with PDPA",
            location.as_str(),
            "No cookie consent mechanism detected".to_string(),
        );
    } else if !consent.has_active_consent {
        push(
            ViolationKind::CookieViolation,
            Severity::High,
            "Cookie banner present but lacks an active consent mechanism",
            location.as_str(),
            "Passive or implied consent detected".to_string(),
        );
    }

    if !payload.dpo_compliance.has_dpo {
        push(
            ViolationKind::OrganizationalViolation,
            Severity::Medium,
            "No Data Protection Officer (DPO) information identified",
            "Organization",
            "Missing DPO contact in privacy policy or website".to_string(),
        );
    }

    if !payload.dnc_mention.mentions_dnc {
        push(
            ViolationKind::MarketingViolation,
            Severity::Medium,
            "No mention of DNC Registry compliance for marketing communications",
            "Privacy Policy / Marketing terms",
            "DNC Registry not referenced".to_string(),
        );
    }

    findings
}

fn legal_references(findings: &[Finding]) -> Vec<LegalReference> {
    let reference = |title: &str, url: &str, relevance: &str| LegalReference {
        title: title.to_string(),
        url: url.to_string(),
        relevance: relevance.to_string(),
    };
    let has = |kind: ViolationKind| findings.iter().any(|f| f.kind == kind);

    let mut refs = vec![reference(
        "Personal Data Protection Act 2012",
        "https://sso.agc.gov.sg/Act/PDPA2012",
        "Core legislation for all data protection in Singapore",
    )];
    if has(ViolationKind::NricViolation) {
        refs.push(reference(
            "Advisory Guidelines on the PDPA for NRIC and other National Identification Numbers",
            "https://www.pdpc.gov.sg/guidelines-and-consultation",
            "Restrictions on collecting, using, and disclosing NRIC numbers",
        ));
    }
    if has(ViolationKind::CookieViolation) {
        refs.push(reference(
            "PDPC Guide to Notification and Consent",
            "https://www.pdpc.gov.sg/guidelines-and-consultation",
            "Consent requirements for cookies and tracking technologies",
        ));
    }
    if has(ViolationKind::SecurityViolation) {
        refs.push(reference(
            "Cybersecurity Act 2018",
            "https://sso.agc.gov.sg/Act/CA2018",
            "Framework for cybersecurity in Singapore",
        ));
    }
    refs
}

fn next_steps(findings: &[Finding]) -> Vec<String> {
    let mut steps: Vec<String> = [
        "Review this report with legal counsel",
        "Prioritize CRITICAL and HIGH severity violations",
        "Develop a compliance action plan with deadlines",
        "Implement corrective measures",
        "Document all actions with anchored timestamps",
        "Schedule a follow-up audit in 30 days",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if findings.iter().any(|f| f.kind == ViolationKind::NricViolation) {
        steps.push("Review all data collection points for unnecessary personal data".into());
    }
    if findings.iter().any(|f| f.kind == ViolationKind::SecurityViolation) {
        steps.push("Conduct a comprehensive security assessment".into());
    }
    steps
}

/// Deterministic narrator.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedNarrator;

impl RuleBasedNarrator {
    pub fn new() -> Self {
        Self
    }

    pub fn build_report(&self, payload: &ScanPayload) -> StructuredReport {
        let findings = detect_violations(payload);
        let score = risk_score(&findings);
        let (level, description) = risk_level(score);

        let mut breakdown = BTreeMap::new();
        for severity in ["critical", "high", "medium", "low"] {
            breakdown.insert(severity.to_string(), 0);
        }
        for f in &findings {
            *breakdown
                .entry(f.severity.as_str().to_ascii_lowercase())
                .or_insert(0) += 1;
        }

        let critical = breakdown["critical"];
        let high = breakdown["high"];
        let mut summary = format!(
            "Compliance assessment for {}: overall risk {} ({}/100).\n\
             CRITICAL violations: {}. HIGH severity violations: {}. MEDIUM/LOW violations: {}.",
            payload.company_name,
            level,
            score,
            critical,
            high,
            findings.len() as u32 - critical - high,
        );
        for f in findings
            .iter()
            .filter(|f| matches!(f.severity, Severity::Critical | Severity::High))
        {
            summary.push_str(&format!("\n- {}", f.details));
        }

        let recommendations = findings
            .iter()
            .map(|f| Recommendation {
                action: f.kind.action().to_string(),
                severity: f.severity,
                priority: if f.severity <= Severity::High {
                    "HIGH".to_string()
                } else {
                    "MEDIUM".to_string()
                },
                timeline: f.severity.deadline().to_string(),
            })
            .collect();

        StructuredReport {
            executive_summary: summary,
            risk_assessment: RiskAssessment {
                score,
                level: level.to_string(),
                description: description.to_string(),
                breakdown,
            },
            legal_references: legal_references(&findings),
            next_steps: next_steps(&findings),
            recommendations,
            detailed_findings: findings,
            detected_laws: payload.detected_laws.clone(),
            disclaimer: DISCLAIMER.to_string(),
            model: RULE_BASED_MODEL.to_string(),
        }
    }

    pub fn build_summary(&self, payload: &ScanPayload) -> LightSummary {
        let findings = detect_violations(payload);
        let score = payload
            .overall_risk_score
            .unwrap_or_else(|| risk_score(&findings));
        let (level, _) = risk_level(score);

        let recommendation = findings
            .iter()
            .min_by_key(|f| f.severity)
            .map(|f| f.kind.action().to_string())
            .unwrap_or_else(|| "Maintain current practices and re-scan periodically.".to_string());

        LightSummary {
            summary: format!(
                "{} compliance risk detected ({} issue{}).",
                capitalize(level),
                findings.len(),
                if findings.len() == 1 { "" } else { "s" }
            ),
            recommendation,
            risk_score: Some(score),
            detected_laws: payload.detected_laws.clone(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let lower = s.to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[async_trait]
impl NarrativeGenerator for RuleBasedNarrator {
    async fn full(&self, payload: &ScanPayload) -> Result<StructuredReport> {
        Ok(self.build_report(payload))
    }

    async fn light(&self, payload: &ScanPayload) -> Result<LightSummary> {
        Ok(self.build_summary(payload))
    }

    fn model(&self) -> &str {
        RULE_BASED_MODEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_site() -> ScanPayload {
        ScanPayload {
            company_name: "Acme".into(),
            url: Some("https://acme.sg".into()),
            uses_https: true,
            consent_mechanism: ConsentMechanism {
                has_cookie_banner: true,
                has_active_consent: true,
                provider: None,
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
    fn test_payload_reads_each_typed_field_from_report_context() {
        let request = crate::types::NewReport::new("pdpa_basic", "Acme Pte Ltd")
            .with_website("acme.sg")
            .with_data("uses_https", serde_json::json!(true))
            .with_data("collects_nric", serde_json::json!(true))
            .with_data("nric_evidence", serde_json::json!("S1234567D on signup form"))
            .with_data(
                "consent_mechanism",
                serde_json::json!({ "has_cookie_banner": true, "has_active_consent": false }),
            )
            .with_data("dpo_compliance", serde_json::json!({ "has_dpo": true, "contact": "dpo@acme.sg" }))
            .with_data("dnc_mention", serde_json::json!({ "mentions_dnc": true }))
            .with_data("detected_laws", serde_json::json!(["PDPA"]))
            .with_data("overall_risk_score", serde_json::json!(62));
        let data = AssessmentData::from_patch(&request.initial_patch()).unwrap();
        let report = Report::new(request, data);

        let payload = ScanPayload::from_report(&report);

        assert!(payload.collects_nric);
        assert!(payload.uses_https);
        assert!(!payload.has_legal_justification);
        assert_eq!(payload.nric_evidence.as_deref(), Some("S1234567D on signup form"));
        assert!(payload.consent_mechanism.has_cookie_banner);
        assert!(!payload.consent_mechanism.has_active_consent);
        assert_eq!(payload.dpo_compliance.contact.as_deref(), Some("dpo@acme.sg"));
        assert!(payload.dnc_mention.mentions_dnc);
        assert_eq!(payload.detected_laws, vec!["PDPA".to_string()]);
        assert_eq!(payload.overall_risk_score, Some(62));
    }

    #[test]
    fn test_payload_defaults_malformed_fields() {
        let request = crate::types::NewReport::new("pdpa_basic", "Acme Pte Ltd")
            .with_data("consent_mechanism", serde_json::json!("yes"))
            .with_data("overall_risk_score", serde_json::json!(900));
        let data = AssessmentData::from_patch(&request.initial_patch()).unwrap();
        let payload = ScanPayload::from_report(&Report::new(request, data));

        assert_eq!(payload.consent_mechanism, ConsentMechanism::default());
        assert_eq!(payload.overall_risk_score, None);
        assert!(!payload.collects_nric);
    }

    #[test]
    fn test_clean_site_has_no_findings() {
        let report = RuleBasedNarrator::new().build_report(&clean_site());
        assert!(report.detailed_findings.is_empty());
        assert_eq!(report.risk_assessment.score, 0);
        assert_eq!(report.risk_assessment.level, "MINIMAL");
        assert_eq!(report.legal_references.len(), 1);
    }

    #[test]
    fn test_weights_and_score() {
        // NRIC (10) + no HTTPS (10) + passive consent (7) + no DPO (4) + no DNC (4) = 35 → 280 → 100
        let mut payload = ScanPayload {
            collects_nric: true,
            ..Default::default()
        };
        payload.consent_mechanism.has_cookie_banner = true;
        let findings = detect_violations(&payload);
        assert_eq!(findings.len(), 5);
        assert_eq!(risk_score(&findings), 100);

        // Only missing DNC: 4 * 8 = 32 → LOW
        let mut payload = clean_site();
        payload.dnc_mention.mentions_dnc = false;
        let findings = detect_violations(&payload);
        assert_eq!(risk_score(&findings), 32);
        assert_eq!(risk_level(32).0, "LOW");
    }

    #[test]
    fn test_legal_justification_suppresses_nric_finding() {
        let mut payload = clean_site();
        payload.collects_nric = true;
        payload.has_legal_justification = true;
        assert!(detect_violations(&payload).is_empty());
    }

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(risk_level(80).0, "CRITICAL");
        assert_eq!(risk_level(79).0, "HIGH");
        assert_eq!(risk_level(40).0, "MEDIUM");
        assert_eq!(risk_level(20).0, "LOW");
        assert_eq!(risk_level(19).0, "MINIMAL");
    }

    #[test]
    fn test_full_report_references_follow_findings() {
        let mut payload = clean_site();
        payload.uses_https = false;
        payload.consent_mechanism.has_cookie_banner = false;
        let report = RuleBasedNarrator::new().build_report(&payload);

        let titles: Vec<_> = report.legal_references.iter().map(|r| r.title.as_str()).collect();
        assert!(titles.contains(&"Cybersecurity Act 2018"));
        assert!(titles.contains(&"PDPC Guide to Notification and Consent"));
        assert_eq!(report.risk_assessment.breakdown["critical"], 1);
        assert_eq!(report.risk_assessment.breakdown["high"], 1);
        assert_eq!(report.recommendations[0].priority, "HIGH");
    }

    #[test]
    fn test_light_summary_uses_scan_score() {
        let mut payload = clean_site();
        payload.overall_risk_score = Some(45);
        payload.dpo_compliance.has_dpo = false;
        let light = RuleBasedNarrator::new().build_summary(&payload);
        assert_eq!(light.risk_score, Some(45));
        assert_eq!(light.summary, "Medium compliance risk detected (1 issue).");
    }

    #[test]
    fn test_narrative_serializes_with_mode_tag() {
        let light = RuleBasedNarrator::new().build_summary(&clean_site());
        let value = serde_json::to_value(Narrative::Light(light)).unwrap();
        assert_eq!(value["mode"], serde_json::json!("light"));
    }
}
