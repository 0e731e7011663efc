//! Single-hop relay of accepted submissions to peer validators.
//!
//! Each peer gets its own copy of the relay message, addressed to it and
//! signed by this node. Deliveries run concurrently with independent
//! timeouts and are never retried. Messages that arrive through gossip
//! are never handed back to the broadcaster.
//!
//! The same machinery forwards unsigned client submissions: this node signs
//! them once per validator and posts them to each validator's intake.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vrelay_crypto::{sign_request_at, Keypair, SignedEnvelope};

use crate::clock::Clock;
use crate::membership::{MembershipSnapshot, Peer};
use crate::metrics::RelayMetrics;
use crate::seen::SeenCache;
use crate::submission::{GossipEnvelope, PayloadSchema};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5_000,
        }
    }
}

impl GossipConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Forwarding of unsigned client submissions through this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub enabled: bool,
    /// One forwarded submission per client IP per interval.
    pub per_ip_interval_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_ip_interval_secs: 600,
        }
    }
}

impl ForwardConfig {
    pub fn per_ip_interval(&self) -> Duration {
        Duration::from_secs(self.per_ip_interval_secs)
    }
}

/// Peer endpoint a delivery is posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRoute {
    /// Relay messages between validators.
    Gossip,
    /// Direct submission intake.
    Submit,
}

impl PeerRoute {
    pub fn path(&self) -> &'static str {
        match self {
            PeerRoute::Gossip => "/gossip",
            PeerRoute::Submit => "/submit",
        }
    }
}

/// Peer acknowledgement of a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// The `status` field of the peer's response, when it sent one.
    pub status: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("peer has no usable address")]
    NoAddress,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("peer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn deliver(
        &self,
        peer: &Peer,
        route: PeerRoute,
        body: Bytes,
        headers: Vec<(String, String)>,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Posts to `http://{address}{route}`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vrelay-node/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GossipTransport for HttpTransport {
    async fn deliver(
        &self,
        peer: &Peer,
        route: PeerRoute,
        body: Bytes,
        headers: Vec<(String, String)>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let address = peer.usable_address().ok_or(DeliveryError::NoAddress)?;
        let url = format!("http://{}{}", address, route.path());

        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let status = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_owned));
        Ok(DeliveryReceipt { status })
    }
}

/// Totals of one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Per-validator result of a forwarded submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardResult {
    pub validator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardReport {
    pub message_id: String,
    #[serde(flatten)]
    pub outcome: BroadcastOutcome,
    pub results: Vec<ForwardResult>,
}

/// Cumulative broadcaster counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    broadcasts: AtomicU64,
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

pub struct GossipBroadcaster {
    keypair: Arc<Keypair>,
    membership: Arc<dyn MembershipSnapshot>,
    transport: Arc<dyn GossipTransport>,
    seen: Arc<SeenCache>,
    clock: Arc<dyn Clock>,
    config: GossipConfig,
    counters: Counters,
    metrics: Option<Arc<RelayMetrics>>,
}

impl GossipBroadcaster {
    pub fn new(
        keypair: Arc<Keypair>,
        membership: Arc<dyn MembershipSnapshot>,
        transport: Arc<dyn GossipTransport>,
        seen: Arc<SeenCache>,
        clock: Arc<dyn Clock>,
        config: GossipConfig,
    ) -> Self {
        Self {
            keypair,
            membership,
            transport,
            seen,
            clock,
            config,
            counters: Counters::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Every validator with a usable address, this node included.
    pub fn validators(&self) -> Vec<Peer> {
        self.membership
            .peers()
            .into_iter()
            .filter(|peer| {
                let usable = peer.usable_address().is_some();
                if !usable {
                    debug!("Skipping peer {} without usable address", peer.identity);
                }
                usable
            })
            .collect()
    }

    /// Peers to relay to: every validator but this node.
    pub fn targets(&self) -> Vec<Peer> {
        let self_identity = self.membership.self_identity();
        self.validators()
            .into_iter()
            .filter(|peer| peer.identity != self_identity)
            .collect()
    }

    /// Relay in the background. The broadcast is counted before this returns.
    pub fn spawn_broadcast(
        self: &Arc<Self>,
        original_body: Bytes,
        schema: PayloadSchema,
        original_headers: BTreeMap<String, String>,
    ) -> JoinHandle<BroadcastOutcome> {
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            broadcaster
                .fan_out(original_body, schema, original_headers)
                .await
        })
    }

    pub async fn broadcast(
        &self,
        original_body: Bytes,
        schema: PayloadSchema,
        original_headers: BTreeMap<String, String>,
    ) -> BroadcastOutcome {
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.fan_out(original_body, schema, original_headers).await
    }

    async fn fan_out(
        &self,
        original_body: Bytes,
        schema: PayloadSchema,
        original_headers: BTreeMap<String, String>,
    ) -> BroadcastOutcome {
        if !self.config.enabled {
            return BroadcastOutcome::default();
        }

        let now = self.clock.now_millis();
        if let Some(message_id) = SignedEnvelope::from_header_map(&original_headers).message_id() {
            self.seen.mark_seen(message_id, now);
        }

        let peers = self.targets();
        if peers.is_empty() {
            info!("No other validators to gossip to");
            return BroadcastOutcome::default();
        }

        let relay = GossipEnvelope::new(&original_body, schema, original_headers, now);
        let body = match serde_json::to_vec(&relay) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                error!("Failed to encode gossip message: {}", e);
                return BroadcastOutcome::default();
            }
        };

        info!("Broadcasting to {} validators", peers.len());
        let results = self
            .deliver_signed(&peers, PeerRoute::Gossip, &body, now, || {
                uuid::Uuid::new_v4().to_string()
            })
            .await;

        let mut outcome = BroadcastOutcome {
            sent: peers.len(),
            ..Default::default()
        };
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(receipt) => {
                    outcome.succeeded += 1;
                    if receipt.status.as_deref() == Some("already_processed") {
                        debug!("Gossip to {}: already processed", peer.identity);
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    debug!("Gossip to {} failed: {}", peer.identity, e);
                }
            }
        }

        self.record(&outcome);
        info!(
            "Gossip broadcast: {}/{} successful",
            outcome.succeeded, outcome.sent
        );
        outcome
    }

    /// Submit `body` to every validator's intake as this node.
    ///
    /// Each validator gets a copy addressed to it. All copies share one
    /// message id, so the validators drop each other's gossip of it.
    pub async fn forward_submission(&self, body: Bytes) -> ForwardReport {
        let now = self.clock.now_millis();
        let message_id = uuid::Uuid::new_v4().to_string();
        let validators = self.validators();
        info!(
            "Forwarding submission {} to {} validators",
            message_id,
            validators.len()
        );

        let results = self
            .deliver_signed(&validators, PeerRoute::Submit, &body, now, || message_id.clone())
            .await;

        let mut outcome = BroadcastOutcome {
            sent: validators.len(),
            ..Default::default()
        };
        let results = validators
            .iter()
            .zip(results)
            .map(|(peer, result)| match result {
                Ok(receipt) => {
                    outcome.succeeded += 1;
                    ForwardResult {
                        validator: peer.identity.to_string(),
                        status: receipt.status,
                        error: None,
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!("Forwarding to {} failed: {}", peer.identity, e);
                    ForwardResult {
                        validator: peer.identity.to_string(),
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();

        ForwardReport {
            message_id,
            outcome,
            results,
        }
    }

    /// Sign `body` for each peer, addressed to it, and deliver all copies
    /// concurrently, each under its own timeout.
    async fn deliver_signed(
        &self,
        peers: &[Peer],
        route: PeerRoute,
        body: &Bytes,
        now: u64,
        message_id: impl Fn() -> String,
    ) -> Vec<Result<DeliveryReceipt, DeliveryError>> {
        let timeout = self.config.timeout();
        let deliveries = peers.iter().map(|peer| {
            let envelope =
                sign_request_at(body, &self.keypair, Some(&peer.identity), now, &message_id());
            let headers = envelope
                .to_headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect();
            let delivery = self.transport.deliver(peer, route, body.clone(), headers);
            async move {
                match tokio::time::timeout(timeout, delivery).await {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::Timeout(timeout)),
                }
            }
        });
        join_all(deliveries).await
    }

    fn record(&self, outcome: &BroadcastOutcome) {
        self.counters
            .sent
            .fetch_add(outcome.sent as u64, Ordering::Relaxed);
        self.counters
            .succeeded
            .fetch_add(outcome.succeeded as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);

        if let Some(metrics) = &self.metrics {
            metrics.gossip_sent.inc_by(outcome.sent as u64);
            metrics.gossip_succeeded.inc_by(outcome.succeeded as u64);
            metrics.gossip_failed.inc_by(outcome.failed as u64);
        }
    }
}
