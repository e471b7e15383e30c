//! Tier and feature resolution.
//!
//! Pure functions over the report context and framework. The result is
//! recomputed on every workflow run; payment state can change between runs.

use serde::{Deserialize, Serialize};

use crate::assessment::AssessmentData;

/// Access status values that deny processing.
pub const BLOCKED_STATUSES: &[&str] = &[
    "blocked",
    "denied",
    "suspended",
    "past_due",
    "canceled",
    "cancelled",
    "limit_reached",
    "disabled",
];

/// Frameworks that are always served as free scans.
pub const FREE_FRAMEWORKS: &[&str] = &["pdpa_free_scan"];

/// Frameworks that imply a paid product when nothing else decides the tier.
pub const PAID_FRAMEWORKS: &[&str] = &["pdpa_quick_scan", "pdpa_basic", "pdpa_pro"];

/// Product keys sold as PRO.
pub const PRO_PRODUCT_KEYS: &[&str] = &[
    "pdpa_quick_scan",
    "pdpa_basic",
    "pdpa_pro",
    "compliance_standard",
    "compliance_pro",
    "supply_chain_1",
    "supply_chain_10",
    "supply_chain_50",
    "compliance_notarization_1",
    "compliance_notarization_10",
    "compliance_notarization_50",
];

const ENTERPRISE_HINTS: &[&str] = &["enterprise", "ent", "enterprise_monthly"];
const PAID_HINTS: &[&str] = &["pro", "paid", "standard", "business"];
const FREE_HINTS: &[&str] = &["free", "starter", "trial"];
const ACTIVE_SUBSCRIPTION: &[&str] = &["active", "trialing"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
            Self::Enterprise => "ENTERPRISE",
        }
    }

    pub fn is_paid_tier(&self) -> bool {
        matches!(self, Self::Pro | Self::Enterprise)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which precedence rule decided the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSource {
    EnterpriseHint,
    ProductKey,
    PaidHint,
    FreeFramework,
    FreeHint,
    PaidFramework,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiMode {
    Light,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub ai_mode: AiMode,
    pub ai_full: bool,
    pub pdf: bool,
    pub blockchain: bool,
    pub monitoring: bool,
    pub dashboard: bool,
    pub multi_vendor: bool,
}

impl Features {
    pub fn none() -> Self {
        Self {
            ai_mode: AiMode::Light,
            ai_full: false,
            pdf: false,
            blockchain: false,
            monitoring: false,
            dashboard: false,
            multi_vendor: false,
        }
    }

    pub fn derive(tier: Tier, paid: bool) -> Self {
        let paid_tier = paid && tier.is_paid_tier();
        let enterprise = tier == Tier::Enterprise;
        Self {
            ai_mode: if paid_tier { AiMode::Full } else { AiMode::Light },
            ai_full: paid_tier,
            pdf: paid_tier,
            blockchain: paid_tier,
            monitoring: enterprise,
            dashboard: enterprise,
            multi_vendor: enterprise,
        }
    }
}

/// Resolved access decision for one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub tier: Tier,
    pub paid: bool,
    pub allowed: bool,
    pub reason: Option<String>,
    pub features: Features,
}

impl TierPolicy {
    fn denied(tier: Tier, reason: String) -> Self {
        Self {
            tier,
            paid: false,
            allowed: false,
            reason: Some(reason),
            features: Features::none(),
        }
    }
}

fn normalize(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_ascii_lowercase()
}

/// Resolve the tier by ordered precedence, reporting which rule matched.
pub fn resolve_tier(data: &AssessmentData, framework: &str) -> (Tier, TierSource) {
    let hint = normalize(data.tier_hint());
    let product = normalize(data.product_type.as_deref());
    let framework = normalize(Some(framework));

    if ENTERPRISE_HINTS.contains(&hint.as_str()) {
        (Tier::Enterprise, TierSource::EnterpriseHint)
    } else if PRO_PRODUCT_KEYS.contains(&product.as_str()) {
        (Tier::Pro, TierSource::ProductKey)
    } else if PAID_HINTS.contains(&hint.as_str()) {
        (Tier::Pro, TierSource::PaidHint)
    } else if FREE_FRAMEWORKS.contains(&framework.as_str()) {
        (Tier::Free, TierSource::FreeFramework)
    } else if FREE_HINTS.contains(&hint.as_str()) {
        (Tier::Free, TierSource::FreeHint)
    } else if PAID_FRAMEWORKS.contains(&framework.as_str()) {
        (Tier::Pro, TierSource::PaidFramework)
    } else {
        (Tier::Free, TierSource::Default)
    }
}

/// Payment confirmed explicitly, or an active/trialing subscription.
pub fn is_paid(data: &AssessmentData) -> bool {
    let subscription = normalize(data.subscription_status.as_deref());
    data.payment_confirmed.unwrap_or(false) || ACTIVE_SUBSCRIPTION.contains(&subscription.as_str())
}

/// Resolve access, tier, payment, and features.
pub fn resolve(data: &AssessmentData, framework: &str) -> TierPolicy {
    let (tier, _) = resolve_tier(data, framework);

    let status = normalize(data.access_status_value());
    if BLOCKED_STATUSES.contains(&status.as_str()) {
        return TierPolicy::denied(tier, format!("status:{}", status));
    }

    if data.limit_reached() {
        return TierPolicy::denied(tier, "limit_reached".to_string());
    }

    let paid = is_paid(data);
    TierPolicy {
        tier,
        paid,
        allowed: true,
        reason: None,
        features: Features::derive(tier, paid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> AssessmentData {
        AssessmentData::from_value(value).unwrap()
    }

    #[test]
    fn test_precedence_enterprise_hint_beats_product_key() {
        let d = data(json!({ "tier": "Enterprise", "product_type": "pdpa_basic" }));
        assert_eq!(
            resolve_tier(&d, "pdpa_free_scan"),
            (Tier::Enterprise, TierSource::EnterpriseHint)
        );
    }

    #[test]
    fn test_precedence_product_key_beats_free_framework() {
        let d = data(json!({ "product_type": "compliance_pro", "tier": "free" }));
        assert_eq!(
            resolve_tier(&d, "pdpa_free_scan"),
            (Tier::Pro, TierSource::ProductKey)
        );
    }

    #[test]
    fn test_precedence_paid_hint_beats_free_framework() {
        let d = data(json!({ "plan": "business" }));
        assert_eq!(
            resolve_tier(&d, "pdpa_free_scan"),
            (Tier::Pro, TierSource::PaidHint)
        );
    }

    #[test]
    fn test_precedence_free_framework_beats_free_hint() {
        let d = data(json!({ "tier": "trial" }));
        assert_eq!(
            resolve_tier(&d, "pdpa_free_scan"),
            (Tier::Free, TierSource::FreeFramework)
        );
    }

    #[test]
    fn test_precedence_free_hint_beats_paid_framework() {
        let d = data(json!({ "tier": "starter" }));
        assert_eq!(
            resolve_tier(&d, "pdpa_basic"),
            (Tier::Free, TierSource::FreeHint)
        );
    }

    #[test]
    fn test_precedence_paid_framework_and_default() {
        let d = AssessmentData::default();
        assert_eq!(
            resolve_tier(&d, "PDPA_PRO"),
            (Tier::Pro, TierSource::PaidFramework)
        );
        assert_eq!(
            resolve_tier(&d, "iso_27001"),
            (Tier::Free, TierSource::Default)
        );
    }

    #[test]
    fn test_tier_field_wins_over_plan_field() {
        let d = data(json!({ "tier": "enterprise", "plan": "free" }));
        assert_eq!(resolve_tier(&d, "x").0, Tier::Enterprise);
    }

    #[test]
    fn test_blocked_status_from_any_alias() {
        for key in ["access_status", "subscription_status", "plan_status"] {
            let d = data(json!({ key: " Suspended " }));
            let policy = resolve(&d, "pdpa_basic");
            assert!(!policy.allowed);
            assert_eq!(policy.reason.as_deref(), Some("status:suspended"));
            assert_eq!(policy.features, Features::none());
        }
    }

    #[test]
    fn test_first_non_empty_alias_decides_status() {
        let d = data(json!({ "access_status": "active", "plan_status": "blocked" }));
        assert!(resolve(&d, "pdpa_basic").allowed);
    }

    #[test]
    fn test_limit_flags_deny() {
        let d = data(json!({ "plan_limit_reached": true }));
        let policy = resolve(&d, "pdpa_basic");
        assert!(!policy.allowed);
        assert_eq!(policy.reason.as_deref(), Some("limit_reached"));
    }

    #[test]
    fn test_paid_from_subscription_status() {
        let d = data(json!({ "subscription_status": "trialing", "product_type": "pdpa_pro" }));
        let policy = resolve(&d, "pdpa_pro");
        assert!(policy.paid);
        assert!(policy.features.pdf);
        assert_eq!(policy.features.ai_mode, AiMode::Full);
    }

    #[test]
    fn test_enterprise_features_ignore_payment() {
        let d = data(json!({ "tier": "enterprise" }));
        let policy = resolve(&d, "pdpa_basic");
        assert!(!policy.paid);
        assert!(policy.features.monitoring);
        assert!(policy.features.dashboard);
        assert!(policy.features.multi_vendor);
        assert!(!policy.features.pdf);
        assert!(!policy.features.blockchain);
    }

    #[test]
    fn test_free_scan_unpaid() {
        let policy = resolve(&AssessmentData::default(), "pdpa_free_scan");
        assert_eq!(policy.tier, Tier::Free);
        assert!(!policy.paid);
        assert!(policy.allowed);
        assert_eq!(policy.features.ai_mode, AiMode::Light);
    }

    #[test]
    fn test_policy_serializes_like_access_record() {
        let d = data(json!({ "payment_confirmed": true, "product_type": "pdpa_basic" }));
        let value = serde_json::to_value(resolve(&d, "pdpa_basic")).unwrap();
        assert_eq!(value["tier"], json!("PRO"));
        assert_eq!(value["features"]["ai_mode"], json!("full"));
        assert_eq!(value["reason"], json!(null));
    }
}
