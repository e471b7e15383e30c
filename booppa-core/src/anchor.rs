//! Ledger Anchoring
//!
//! `LedgerAnchor` wraps an external timestamping ledger with a read-before-write
//! guard: a digest that is already anchored is never submitted again, so
//! retries cost nothing. Client errors are returned unchanged; callers decide
//! whether they are fatal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::hasher::{sha256, Hash256};

/// Returned by `anchor` when the ledger reports the digest as anchored but
/// carries no transaction reference for it.
pub const ALREADY_ANCHORED: &str = "already_anchored";

/// Ledger transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl TxRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger-side state of one digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorState {
    pub anchored: bool,
    #[serde(default)]
    pub anchored_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "tx_hash")]
    pub tx_ref: Option<TxRef>,
}

/// Read-side verification result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorStatus {
    pub anchored: bool,
    pub anchored_at: Option<DateTime<Utc>>,
    pub tx_confirmed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every digest was already anchored; nothing was submitted.
    AlreadyAnchored,
    Submitted { tx_ref: TxRef, anchored: usize },
}

/// Client for an external immutable ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn anchor_state(&self, hash: &Hash256) -> Result<AnchorState, LedgerError>;
    async fn submit(&self, hash: &Hash256, metadata: &str) -> Result<TxRef, LedgerError>;
    async fn submit_batch(&self, hashes: &[Hash256], metadata: &str)
        -> Result<TxRef, LedgerError>;
    /// `Some(confirmed)` for a known transaction, `None` if not found.
    async fn receipt(&self, tx_ref: &TxRef) -> Result<Option<bool>, LedgerError>;
}

/// Accepts 64 hex characters, with or without a `0x` prefix.
pub fn parse_digest(hash: &str) -> Result<Hash256, LedgerError> {
    let trimmed = hash.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    Hash256::from_hex(hex_part).ok_or_else(|| LedgerError::InvalidHash(hash.to_string()))
}

#[derive(Clone)]
pub struct LedgerAnchor {
    client: Arc<dyn LedgerClient>,
}

impl LedgerAnchor {
    pub fn new(client: Arc<dyn LedgerClient>) -> Self {
        Self { client }
    }

    /// Anchor `hash` unless the ledger already has it.
    pub async fn anchor(&self, hash: &str, metadata: &str) -> Result<TxRef, LedgerError> {
        let digest = parse_digest(hash)?;

        let state = self.client.anchor_state(&digest).await?;
        if state.anchored {
            tracing::info!(hash = %digest, "Evidence already anchored, skipping submission");
            return Ok(state
                .tx_ref
                .unwrap_or_else(|| TxRef(ALREADY_ANCHORED.to_string())));
        }

        let tx_ref = self.client.submit(&digest, metadata).await?;
        tracing::info!(hash = %digest, tx = %tx_ref, "Evidence anchored");
        Ok(tx_ref)
    }

    /// Anchor every digest not yet on the ledger in a single submission.
    pub async fn anchor_batch(
        &self,
        hashes: &[String],
        metadata: &str,
    ) -> Result<BatchOutcome, LedgerError> {
        let mut unique = BTreeSet::new();
        for hash in hashes {
            unique.insert(parse_digest(hash)?);
        }

        let mut pending = Vec::with_capacity(unique.len());
        for digest in unique {
            if !self.client.anchor_state(&digest).await?.anchored {
                pending.push(digest);
            }
        }

        if pending.is_empty() {
            tracing::info!(count = hashes.len(), "All hashes in batch already anchored");
            return Ok(BatchOutcome::AlreadyAnchored);
        }

        let tx_ref = self.client.submit_batch(&pending, metadata).await?;
        tracing::info!(count = pending.len(), tx = %tx_ref, "Batch anchored");
        Ok(BatchOutcome::Submitted {
            tx_ref,
            anchored: pending.len(),
        })
    }

    /// Best-effort status lookup. Ledger errors degrade to "not anchored" /
    /// "unconfirmed" and are logged.
    pub async fn status(&self, hash: &str, tx_ref: Option<&TxRef>) -> AnchorStatus {
        let mut status = AnchorStatus::default();

        match parse_digest(hash) {
            Ok(digest) => match self.client.anchor_state(&digest).await {
                Ok(state) => {
                    status.anchored = state.anchored;
                    status.anchored_at = state.anchored_at;
                }
                Err(e) => tracing::warn!(hash = %hash, error = %e, "Anchor status lookup failed"),
            },
            Err(e) => tracing::warn!(error = %e, "Anchor status requested for invalid hash"),
        }

        if let Some(tx) = tx_ref.filter(|tx| tx.as_str() != ALREADY_ANCHORED) {
            match self.client.receipt(tx).await {
                Ok(confirmed) => status.tx_confirmed = confirmed,
                Err(e) => tracing::warn!(tx = %tx, error = %e, "Transaction receipt lookup failed"),
            }
        }

        status
    }
}

// ── In-process ledger ──

#[derive(Default)]
struct MemoryLedgerInner {
    anchors: HashMap<Hash256, (TxRef, DateTime<Utc>)>,
    transactions: HashMap<TxRef, Vec<Hash256>>,
}

/// In-process ledger. Counts write transactions so idempotency can be observed.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<MemoryLedgerInner>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write transactions submitted.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every call fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("ledger unavailable".into()));
        }
        Ok(())
    }

    fn next_tx(&self, seed: &[Hash256]) -> TxRef {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        let mut material = n.to_be_bytes().to_vec();
        for h in seed {
            material.extend_from_slice(&h.0);
        }
        TxRef(format!("0x{}", sha256(&material).to_hex()))
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn anchor_state(&self, hash: &Hash256) -> Result<AnchorState, LedgerError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(match inner.anchors.get(hash) {
            Some((tx, at)) => AnchorState {
                anchored: true,
                anchored_at: Some(*at),
                tx_ref: Some(tx.clone()),
            },
            None => AnchorState::default(),
        })
    }

    async fn submit(&self, hash: &Hash256, metadata: &str) -> Result<TxRef, LedgerError> {
        self.submit_batch(std::slice::from_ref(hash), metadata).await
    }

    async fn submit_batch(
        &self,
        hashes: &[Hash256],
        _metadata: &str,
    ) -> Result<TxRef, LedgerError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let tx = self.next_tx(hashes);
        let now = Utc::now();
        for hash in hashes {
            inner.anchors.entry(*hash).or_insert((tx.clone(), now));
        }
        inner.transactions.insert(tx.clone(), hashes.to_vec());
        Ok(tx)
    }

    async fn receipt(&self, tx_ref: &TxRef) -> Result<Option<bool>, LedgerError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.transactions.contains_key(tx_ref).then_some(true))
    }
}

// ── HTTP ledger ──

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    hash: String,
    metadata: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    hashes: Vec<String>,
    metadata: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    confirmed: bool,
}

/// REST client for an external timestamping service.
///
/// ```text
/// GET  {base}/anchors/{hash}        -> {anchored, anchored_at?, tx_hash?} | 404
/// POST {base}/anchors               {hash, metadata} -> {tx_hash}
/// POST {base}/anchors/batch         {hashes, metadata} -> {tx_hash}
/// GET  {base}/transactions/{tx}     -> {confirmed} | 404
/// ```
pub struct HttpLedgerClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpLedgerClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| LedgerError::NotConfigured(format!("{}: {}", base_url, e)))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, LedgerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LedgerError::Rejected {
            status: status.as_u16(),
            message: crate::error::truncate_chars(&body, crate::error::MARKER_TEXT_LIMIT),
        })
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn anchor_state(&self, hash: &Hash256) -> Result<AnchorState, LedgerError> {
        let url = format!("{}/anchors/{}", self.base_url, hash);
        let response = self.authorized(self.client.get(&url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(AnchorState::default());
        }
        Ok(Self::check(response).await?.json().await?)
    }

    async fn submit(&self, hash: &Hash256, metadata: &str) -> Result<TxRef, LedgerError> {
        let url = format!("{}/anchors", self.base_url);
        let body = SubmitRequest {
            hash: hash.to_hex(),
            metadata,
        };
        let response = self.authorized(self.client.post(&url)).json(&body).send().await?;
        let parsed: SubmitResponse = Self::check(response).await?.json().await?;
        Ok(TxRef(parsed.tx_hash))
    }

    async fn submit_batch(
        &self,
        hashes: &[Hash256],
        metadata: &str,
    ) -> Result<TxRef, LedgerError> {
        let url = format!("{}/anchors/batch", self.base_url);
        let body = BatchRequest {
            hashes: hashes.iter().map(Hash256::to_hex).collect(),
            metadata,
        };
        let response = self.authorized(self.client.post(&url)).json(&body).send().await?;
        let parsed: SubmitResponse = Self::check(response).await?.json().await?;
        Ok(TxRef(parsed.tx_hash))
    }

    async fn receipt(&self, tx_ref: &TxRef) -> Result<Option<bool>, LedgerError> {
        let url = format!("{}/transactions/{}", self.base_url, tx_ref);
        let response = self.authorized(self.client.get(&url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: ReceiptResponse = Self::check(response).await?.json().await?;
        Ok(Some(parsed.confirmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: &str) -> String {
        sha256(seed.as_bytes()).to_hex()
    }

    #[tokio::test]
    async fn test_anchor_twice_writes_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let anchor = LedgerAnchor::new(ledger.clone());
        let hash = digest("report-1");

        let first = anchor.anchor(&hash, "report:1").await.unwrap();
        let second = anchor.anchor(&hash, "report:1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.writes(), 1);
    }

    #[tokio::test]
    async fn test_anchor_accepts_0x_prefix() {
        let ledger = Arc::new(MemoryLedger::new());
        let anchor = LedgerAnchor::new(ledger.clone());
        let hash = digest("x");

        let first = anchor.anchor(&hash, "").await.unwrap();
        let second = anchor.anchor(&format!("0x{}", hash), "").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.writes(), 1);
    }

    #[tokio::test]
    async fn test_invalid_hash_rejected_without_io() {
        let ledger = Arc::new(MemoryLedger::new());
        let anchor = LedgerAnchor::new(ledger.clone());
        let err = anchor.anchor("not-a-digest", "").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidHash(_)));
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn test_errors_surface_unchanged() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_unavailable(true);
        let anchor = LedgerAnchor::new(ledger.clone());
        let err = anchor.anchor(&digest("y"), "").await.unwrap_err();
        assert!(matches!(err, LedgerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_batch_filters_already_anchored() {
        let ledger = Arc::new(MemoryLedger::new());
        let anchor = LedgerAnchor::new(ledger.clone());
        let a = digest("a");
        let b = digest("b");
        anchor.anchor(&a, "").await.unwrap();

        let outcome = anchor
            .anchor_batch(&[a.clone(), b.clone(), b.clone()], "batch")
            .await
            .unwrap();
        assert!(matches!(outcome, BatchOutcome::Submitted { anchored: 1, .. }));
        assert_eq!(ledger.writes(), 2);

        let outcome = anchor.anchor_batch(&[a, b], "batch").await.unwrap();
        assert_eq!(outcome, BatchOutcome::AlreadyAnchored);
        assert_eq!(ledger.writes(), 2);
    }

    #[tokio::test]
    async fn test_status_confirms_receipt_and_degrades_on_error() {
        let ledger = Arc::new(MemoryLedger::new());
        let anchor = LedgerAnchor::new(ledger.clone());
        let hash = digest("z");
        let tx = anchor.anchor(&hash, "").await.unwrap();

        let status = anchor.status(&hash, Some(&tx)).await;
        assert!(status.anchored);
        assert!(status.anchored_at.is_some());
        assert_eq!(status.tx_confirmed, Some(true));

        ledger.set_unavailable(true);
        let status = anchor.status(&hash, Some(&tx)).await;
        assert_eq!(status, AnchorStatus::default());
    }

    #[test]
    fn test_http_client_requires_valid_base_url() {
        assert!(matches!(
            HttpLedgerClient::new("not a url", None, Duration::from_secs(5)),
            Err(LedgerError::NotConfigured(_))
        ));
    }
}
