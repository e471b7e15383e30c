//! Report Context
//!
//! `AssessmentData` is the inter-step channel of the pipeline. Fields the
//! pipeline reads back are typed; everything else a step writes lands in the
//! `extra` extension map. Writers never assign the record directly: they build
//! a [`Patch`] and call [`AssessmentData::merged`], which merges top-level keys
//! and re-validates the result.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{truncate_chars, MARKER_TEXT_LIMIT};
use crate::policy::TierPolicy;
use crate::types::Patch;

/// Rejected merge or malformed stored context.
#[derive(Debug, thiserror::Error)]
pub enum AssessmentError {
    #[error("assessment data must be a JSON object")]
    NotAnObject,

    #[error("assessment data rejected: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Typed marker for a non-fatal step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StepError {
    pub fn new(step: &str, url: Option<&str>, message: impl AsRef<str>) -> Self {
        Self {
            step: step.to_string(),
            url: url.map(str::to_string),
            message: truncate_chars(message.as_ref(), MARKER_TEXT_LIMIT),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentData {
    // ── Request / billing inputs ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_status: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub free_limit_reached: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub plan_limit_reached: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub payment_confirmed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_page_only: Option<bool>,

    // ── Step outputs read back by later steps ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<TierPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_https: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_resolution_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_generated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_id: Option<String>,

    // ── Re-processing bookkeeping ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processing_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processing_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processing_error_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_events: Vec<Value>,

    /// Forward-compatible extension map for keys without a typed field.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AssessmentData {
    pub fn from_patch(patch: &Patch) -> Result<Self, AssessmentError> {
        Ok(serde_json::from_value(Value::Object(patch.clone()))?)
    }

    pub fn from_value(value: Value) -> Result<Self, AssessmentError> {
        match value {
            Value::Object(map) => Self::from_patch(&map),
            Value::Null => Ok(Self::default()),
            _ => Err(AssessmentError::NotAnObject),
        }
    }

    pub fn to_map(&self) -> Result<Patch, AssessmentError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(AssessmentError::NotAnObject),
        }
    }

    /// Merge `patch` over the current keys and validate the result.
    ///
    /// Keys absent from `patch` are preserved. A key set to `null` clears it.
    pub fn merged(&self, patch: &Patch) -> Result<Self, AssessmentError> {
        let mut map = self.to_map()?;
        for (key, value) in patch {
            map.insert(key.clone(), value.clone());
        }
        Self::from_patch(&map)
    }

    /// Look up any key, typed or not, as JSON.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.to_map()
            .ok()
            .and_then(|mut map| map.remove(key))
            .filter(|v| !v.is_null())
    }

    /// Notification recipient: `contact_email`, else `customer_email`.
    pub fn recipient(&self) -> Option<&str> {
        non_empty(self.contact_email.as_deref()).or_else(|| non_empty(self.customer_email.as_deref()))
    }

    /// Explicit tier hint: `tier`, else `plan`.
    pub fn tier_hint(&self) -> Option<&str> {
        non_empty(self.tier.as_deref()).or_else(|| non_empty(self.plan.as_deref()))
    }

    /// First non-empty of the three access-status aliases.
    pub fn access_status_value(&self) -> Option<&str> {
        non_empty(self.access_status.as_deref())
            .or_else(|| non_empty(self.subscription_status.as_deref()))
            .or_else(|| non_empty(self.plan_status.as_deref()))
    }

    pub fn limit_reached(&self) -> bool {
        self.free_limit_reached.unwrap_or(false) || self.plan_limit_reached.unwrap_or(false)
    }

    pub fn attempts(&self) -> u32 {
        self.processing_attempts.unwrap_or(0)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Build a patch from a `json!({...})` object literal.
pub fn patch_from(value: Value) -> Patch {
    match value {
        Value::Object(map) => map,
        _ => Patch::new(),
    }
}

/// Billing systems send flags as booleans, numbers, or strings.
fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => Some(n.as_f64().is_some_and(|f| f != 0.0)),
        Some(Value::String(s)) => Some(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "y" | "on"
        )),
        Some(other) => {
            return Err(D::Error::custom(format!("expected a flag, got {}", other)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_preserves_existing_keys() {
        let data = AssessmentData::from_value(json!({
            "url": "acme.sg",
            "custom_note": "keep me",
        }))
        .unwrap();

        let merged = data
            .merged(&patch_from(json!({ "resolved_url": "https://acme.sg" })))
            .unwrap();

        assert_eq!(merged.url.as_deref(), Some("acme.sg"));
        assert_eq!(merged.resolved_url.as_deref(), Some("https://acme.sg"));
        assert_eq!(merged.extra["custom_note"], json!("keep me"));
    }

    #[test]
    fn test_merge_rejects_mistyped_field() {
        let data = AssessmentData::default();
        let result = data.merged(&patch_from(json!({ "uses_https": "maybe" })));
        assert!(matches!(result, Err(AssessmentError::Invalid(_))));
    }

    #[test]
    fn test_lenient_flags() {
        let data = AssessmentData::from_value(json!({
            "payment_confirmed": "true",
            "free_limit_reached": 0,
            "plan_limit_reached": "no",
        }))
        .unwrap();

        assert_eq!(data.payment_confirmed, Some(true));
        assert!(!data.limit_reached());
    }

    #[test]
    fn test_recipient_falls_back_to_customer_email() {
        let data = AssessmentData::from_value(json!({
            "contact_email": "  ",
            "customer_email": "billing@acme.sg",
        }))
        .unwrap();
        assert_eq!(data.recipient(), Some("billing@acme.sg"));
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(matches!(
            AssessmentData::from_value(json!([1, 2])),
            Err(AssessmentError::NotAnObject)
        ));
    }

    #[test]
    fn test_marker_message_is_truncated() {
        let marker = StepError::new("anchor", None, "x".repeat(1000));
        assert_eq!(marker.message.len(), MARKER_TEXT_LIMIT);
    }
}
