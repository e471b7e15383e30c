//! Evidence Hashing
//!
//! Deterministic SHA-256 over canonical JSON: object keys sorted recursively,
//! arrays in order, compact UTF-8 output. The resulting digest is the anchoring
//! payload and the public verification key, so the canonical form is part of
//! the external `BOOPPA-PROOF-SG` 1.0 contract.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::assessment::AssessmentData;
use crate::types::{Report, ReportId};

/// Scratchpad keys written after the digest step, or that differ between runs
/// over the same inputs. They are excluded from the evidence snapshot.
const VOLATILE_KEYS: &[&str] = &[
    "processing_attempts",
    "site_screenshot",
    "verify_url",
    "verify_id",
    "proof_header",
    "schema_version",
    "dependency_events",
    "last_dependency_event",
    "on_page_ready",
    "file_key",
];
const VOLATILE_PREFIXES: &[&str] = &["screenshot_", "pdf_", "s3_", "verification_"];
const VOLATILE_SUFFIXES: &[&str] = &["_at", "_error"];

/// A SHA-256 digest, rendered as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// True for a 64-character lowercase or uppercase hex string.
    pub fn is_valid_hex(s: &str) -> bool {
        Self::from_hex(s).is_some()
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid sha-256 hex: {}", s)))
    }
}

/// Normalize JSON for deterministic hashing: object keys sorted recursively.
pub fn canonicalize_json(v: &JsonValue) -> JsonValue {
    match v {
        JsonValue::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();

            let mut sorted = serde_json::Map::new();
            for k in keys {
                if let Some(child) = map.get(k) {
                    sorted.insert(k.clone(), canonicalize_json(child));
                }
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(arr) => JsonValue::Array(arr.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

pub fn sha256(bytes: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Hash256(hasher.finalize().into())
}

/// Digest of any JSON value in canonical form.
pub fn digest_value(value: &JsonValue) -> Hash256 {
    sha256(canonicalize_json(value).to_string().as_bytes())
}

/// Content-cache key for a scan target.
pub fn cache_key(url: &str) -> String {
    sha256(url.trim().as_bytes()).to_hex()
}

/// RFC 3339, microsecond precision, `Z` suffix.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Canonical evidence payload for a report.
#[derive(Debug, Clone, Serialize)]
pub struct EvidencePayload {
    pub report_id: ReportId,
    pub framework: String,
    pub company: String,
    pub assessment_data_snapshot: JsonValue,
    pub narrative: Option<String>,
    pub created_at: String,
}

impl EvidencePayload {
    pub fn for_report(report: &Report) -> Self {
        Self {
            report_id: report.id,
            framework: report.framework.clone(),
            company: report.company_name.clone(),
            assessment_data_snapshot: evidence_snapshot(&report.assessment_data),
            narrative: report.narrative.clone(),
            created_at: canonical_timestamp(&report.created_at),
        }
    }

    pub fn digest(&self) -> Hash256 {
        match serde_json::to_value(self) {
            Ok(value) => digest_value(&value),
            // Every field is a plain string or JSON value.
            Err(_) => digest_value(&JsonValue::Null),
        }
    }
}

fn is_volatile(key: &str) -> bool {
    VOLATILE_KEYS.contains(&key)
        || VOLATILE_PREFIXES.iter().any(|p| key.starts_with(p))
        || VOLATILE_SUFFIXES.iter().any(|s| key.ends_with(s))
}

/// Scratchpad with volatile keys removed.
pub fn evidence_snapshot(data: &AssessmentData) -> JsonValue {
    let map = data.to_map().unwrap_or_default();
    JsonValue::Object(
        map.into_iter()
            .filter(|(key, _)| !is_volatile(key))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewReport;
    use serde_json::json;

    #[test]
    fn test_canonical_hash_key_order_independence() {
        let a = json!({"z": 1, "a": 2, "m": {"y": [1, {"b": 1, "a": 2}], "x": null}});
        let b = json!({"m": {"x": null, "y": [1, {"a": 2, "b": 1}]}, "a": 2, "z": 1});
        assert_eq!(digest_value(&a), digest_value(&b));
    }

    #[test]
    fn test_arrays_preserve_order() {
        assert_ne!(digest_value(&json!([1, 2])), digest_value(&json!([2, 1])));
    }

    #[test]
    fn test_known_vector() {
        // sha256("{}")
        assert_eq!(
            digest_value(&json!({})).to_hex(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_hex_round_trip_and_validation() {
        let h = sha256(b"evidence");
        assert_eq!(Hash256::from_hex(&h.to_hex()), Some(h));
        assert!(!Hash256::is_valid_hex("abc"));
        assert!(!Hash256::is_valid_hex(&"z".repeat(64)));
    }

    #[test]
    fn test_cache_key_trims_input() {
        assert_eq!(cache_key(" https://acme.sg "), cache_key("https://acme.sg"));
        assert_ne!(cache_key("https://acme.sg"), cache_key("http://acme.sg"));
    }

    #[test]
    fn test_snapshot_excludes_volatile_keys() {
        let data = AssessmentData::from_value(json!({
            "url": "acme.sg",
            "consent_mechanism": {"has_banner": true},
            "processing_attempts": 2,
            "booppa_report_saved_at": "2026-01-01T00:00:00Z",
            "metadata_error": {"step": "site_metadata", "message": "x", "at": "2026-01-01T00:00:00Z"},
            "screenshot_diagnostics": ["a:timeout"],
            "pdf_reason": "tier_restriction",
        }))
        .unwrap();

        let snapshot = evidence_snapshot(&data);
        let mut keys: Vec<_> = snapshot.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["consent_mechanism", "url"]);
    }

    #[test]
    fn test_report_digest_ignores_post_digest_outputs() {
        let request = NewReport::new("pdpa_basic", "Acme").with_website("acme.sg");
        let data = AssessmentData::from_patch(&request.initial_patch()).unwrap();
        let mut report = Report::new(request, data);
        report.narrative = Some("summary".into());

        let before = EvidencePayload::for_report(&report).digest();

        report.assessment_data = report
            .assessment_data
            .merged(&crate::assessment::patch_from(json!({
                "site_screenshot": "data:image/png;base64,AAAA",
                "verify_url": "https://www.booppa.io/verify/x",
                "processing_attempts": 3,
            })))
            .unwrap();

        assert_eq!(EvidencePayload::for_report(&report).digest(), before);

        report.narrative = Some("different".into());
        assert_ne!(EvidencePayload::for_report(&report).digest(), before);
    }
}
