//! HTTP API endpoints

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use vrelay_crypto::{Identity, SignedEnvelope, VerificationError};

use crate::auth::{envelope_from_headers, AuthConfig, AuthError};
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::gossip::GossipBroadcaster;
use crate::membership::MembershipSnapshot;
use crate::metrics::RelayMetrics;
use crate::rate_limit::{IpThrottle, StakeRateLimiter};
use crate::seen::SeenCache;
use crate::sink::{QueuedSubmission, SubmissionSink};
use crate::submission::{
    GossipEnvelope, Payload, PayloadSchema, SchemaError, SchemaRegistry, Submission,
    SubmissionError,
};

#[derive(Clone)]
pub struct AppState {
    pub membership: Arc<dyn MembershipSnapshot>,
    pub clock: Arc<dyn Clock>,
    pub auth: AuthConfig,
    pub seen: Arc<SeenCache>,
    pub rate_limiter: Arc<StakeRateLimiter>,
    pub forward_throttle: Arc<IpThrottle>,
    pub sink: Arc<dyn SubmissionSink>,
    pub broadcaster: Arc<GossipBroadcaster>,
    pub schemas: Arc<SchemaRegistry>,
    pub metrics: Arc<RelayMetrics>,
    pub started_at: Instant,
}

/// Create API router
///
/// Relay messages carry the original body hex-encoded, so `/gossip` gets
/// its own, larger body limit.
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let submit_limit = RequestBodyLimitLayer::new(config.max_body_bytes);
    let gossip_limit = RequestBodyLimitLayer::new(config.gossip_body_limit());

    let mut router = Router::new()
        .route("/submit", post(submit).layer(submit_limit.clone()))
        .route("/gossip", post(receive_gossip).layer(gossip_limit))
        .route("/health", get(health))
        .route("/rate_limit/:identity", get(rate_limit_usage))
        .route("/metrics", get(get_metrics));
    if config.forward.enabled {
        router = router.route(
            "/submit_through_node",
            post(submit_through_node).layer(submit_limit),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid submission: {0}")]
    InvalidSubmission(#[from] SubmissionError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("relayed body is not valid hex")]
    InvalidBodyHex,
    #[error("too many forwarded submissions, retry in {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },
}

impl From<VerificationError> for ApiError {
    fn from(e: VerificationError) -> Self {
        ApiError::Auth(AuthError::Verification(e))
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Auth(AuthError::NotPrivileged(_)) => StatusCode::FORBIDDEN,
            ApiError::Auth(AuthError::Verification(e)) if !e.is_protocol_error() => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Auth(AuthError::Verification(e)) => e.kind(),
            ApiError::Auth(AuthError::NotPrivileged(_)) => "not_privileged",
            ApiError::InvalidJson(_) => "invalid_json",
            ApiError::InvalidSubmission(_) => "invalid_submission",
            ApiError::Schema(SchemaError::UnknownSchema(_)) => "unknown_schema",
            ApiError::Schema(SchemaError::Decode { .. }) => "invalid_payload",
            ApiError::InvalidBodyHex => "invalid_body_hex",
            ApiError::Throttled { .. } => "throttled",
        }
    }

    fn is_auth_failure(&self) -> bool {
        matches!(
            self.status_code(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "error": self.kind(),
            "message": self.to_string(),
        });
        let mut response = (self.status_code(), Json(body)).into_response();
        if let ApiError::Throttled { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

/// Count, log and render a rejected request.
fn reject(state: &AppState, envelope: &SignedEnvelope, route: &str, err: ApiError) -> Response {
    let signer = envelope.signer().unwrap_or("-");
    let message_id = envelope.message_id().unwrap_or("-");
    if err.is_auth_failure() {
        state.metrics.auth_failures.with_label_values(&[err.kind()]).inc();
        warn!(
            "{} rejected: {} (signer: {}, message: {})",
            route, err, signer, message_id
        );
    } else {
        state.metrics.protocol_errors.with_label_values(&[err.kind()]).inc();
        info!(
            "{} bad request: {} (signer: {}, message: {})",
            route, err, signer, message_id
        );
    }
    err.into_response()
}

async fn enqueue(state: &AppState, queued: QueuedSubmission) {
    let source = queued.source();
    let sender = queued.sender.clone();
    let post = queued.post_id.clone().unwrap_or_else(|| "none".into());
    let interaction = queued.interaction_id.clone().unwrap_or_else(|| "none".into());

    match state.sink.enqueue(queued).await {
        Ok(()) => info!(
            "Queued {} submission from {} (post: {}, interaction: {})",
            source, sender, post, interaction
        ),
        Err(e) => error!("Error queueing submission from {}: {}", sender, e),
    }
    state.metrics.queue_depth.set(state.sink.depth() as i64);
}

fn parse_submission(body: &[u8]) -> Result<Submission, ApiError> {
    let submission: Submission = serde_json::from_slice(body)?;
    submission.validate()?;
    Ok(submission)
}

/// POST /submit - Signed submission from a miner
async fn submit(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let start = Instant::now();
    let now = state.clock.now_millis();
    let envelope = envelope_from_headers(&headers);

    let signer = match state
        .auth
        .verify_direct(&envelope, &body, state.membership.as_ref(), now)
    {
        Ok(signer) => signer,
        Err(e) => return reject(&state, &envelope, "/submit", e.into()),
    };

    let submission = match parse_submission(&body) {
        Ok(s) => s,
        Err(e) => return reject(&state, &envelope, "/submit", e),
    };

    // verified above, never empty here
    let message_id = envelope.message_id().unwrap_or_default().to_string();

    // validators are not rate limited
    let privileged = state.membership.is_privileged(&signer);
    let admitted = state.seen.try_mark_with(&message_id, now, || {
        if privileged {
            return Ok(());
        }
        let stake = state.membership.stake_of(&signer).unwrap_or(0.0);
        let admission = state.rate_limiter.admit(&signer, stake, now);
        if admission.allowed {
            Ok(())
        } else {
            Err(admission)
        }
    });

    match admitted {
        None => {
            state.metrics.duplicates.inc();
            return Json(json!({ "status": "already_processed" })).into_response();
        }
        Some(Err(admission)) => {
            state.metrics.rate_limited.inc();
            info!("Rate limited {}: {}", signer, admission.message);
            return Json(json!({
                "status": "rate_limited",
                "message": admission.message,
                "current_count": admission.current_count,
                "limit": admission.limit,
            }))
            .into_response();
        }
        Some(Ok(())) => {}
    }

    let queued = QueuedSubmission::new(submission, signer.as_str(), &message_id, now, false);
    enqueue(&state, queued).await;

    state
        .broadcaster
        .spawn_broadcast(body, PayloadSchema::Submission, envelope.to_header_map());

    state.metrics.submissions_accepted.inc();
    state.metrics.request_latency.observe(start.elapsed().as_secs_f64());
    Json(json!({
        "status": "accepted",
        "message": "Submission queued for processing",
    }))
    .into_response()
}

/// POST /gossip - Submission relayed by a peer validator
async fn receive_gossip(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let now = state.clock.now_millis();
    let envelope = envelope_from_headers(&headers);
    let membership = state.membership.as_ref();

    let relayer = match state.auth.verify_relay(&envelope, &body, membership, now) {
        Ok(relayer) => relayer,
        Err(e) => return reject(&state, &envelope, "/gossip", e.into()),
    };

    let relay: GossipEnvelope = match serde_json::from_slice(&body) {
        Ok(relay) => relay,
        Err(e) => return reject(&state, &envelope, "/gossip", e.into()),
    };

    if state.schemas.lookup(&relay.original_body_schema).is_none() {
        let err = SchemaError::UnknownSchema(relay.original_body_schema.clone());
        return reject(&state, &envelope, "/gossip", err.into());
    }

    let original_body = match relay.original_body() {
        Ok(b) => b,
        Err(_) => return reject(&state, &envelope, "/gossip", ApiError::InvalidBodyHex),
    };

    let original = SignedEnvelope::from_header_map(&relay.original_headers);
    let sender = match state
        .auth
        .verify_relayed(&original, &original_body, membership, &relayer, now)
    {
        Ok(sender) => sender,
        Err(e) => return reject(&state, &original, "/gossip", e.into()),
    };

    let payload = match state
        .schemas
        .decode(&relay.original_body_schema, &original_body)
        .map_err(ApiError::from)
        .and_then(|p| {
            p.validate()?;
            Ok(p)
        }) {
        Ok(p) => p,
        Err(e) => return reject(&state, &original, "/gossip", e),
    };

    let message_id = original.message_id().unwrap_or_default().to_string();
    if !state.seen.try_mark(&message_id, now) {
        state.metrics.duplicates.inc();
        return Json(json!({ "status": "already_processed" })).into_response();
    }

    match payload {
        Payload::Submission(submission) => {
            let queued =
                QueuedSubmission::new(submission, sender.as_str(), &message_id, now, true);
            enqueue(&state, queued).await;
        }
    }

    state.metrics.gossip_accepted.inc();
    state.metrics.request_latency.observe(start.elapsed().as_secs_f64());
    Json(json!({
        "status": "accepted",
        "message": format!("Relayed submission from {} queued", relayer),
    }))
    .into_response()
}

/// POST /submit_through_node - Unsigned submission sent to every validator as this node
async fn submit_through_node(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if let Err(e) = parse_submission(&body) {
        state.metrics.protocol_errors.with_label_values(&[e.kind()]).inc();
        info!("/submit_through_node bad request from {}: {}", client, e);
        return e.into_response();
    }

    if let Err(retry_after_secs) = state.forward_throttle.check(client, state.clock.now_millis()) {
        state.metrics.throttled.inc();
        info!("Throttled forward request from {}", client);
        return ApiError::Throttled { retry_after_secs }.into_response();
    }

    let report = state.broadcaster.forward_submission(body).await;
    info!(
        "Forwarded submission {} for {}: {}/{} validators reached",
        report.message_id, client, report.outcome.succeeded, report.outcome.sent
    );

    state.metrics.submissions_forwarded.inc();
    state.metrics.request_latency.observe(start.elapsed().as_secs_f64());
    Json(json!({
        "status": "forwarded",
        "message_id": report.message_id,
        "sent": report.outcome.sent,
        "succeeded": report.outcome.succeeded,
        "failed": report.outcome.failed,
        "results": report.results,
    }))
    .into_response()
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    refresh_gauges(&state);
    let response = json!({
        "status": "healthy",
        "validator": state.membership.self_identity().to_string(),
        "queue_depth": state.sink.depth(),
        "seen_messages": state.seen.len(),
        "rate_limiter_entries": state.rate_limiter.len(),
        "gossip": state.broadcaster.stats(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// GET /rate_limit/:identity - Window usage of one identity
async fn rate_limit_usage(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Response {
    let known = Identity::parse(&identity)
        .ok()
        .and_then(|id| state.membership.stake_of(&id).map(|stake| (id, stake)));

    let Some((id, stake)) = known else {
        return Json(json!({
            "identity": identity,
            "stake": null,
            "privileged": null,
            "usage": null,
        }))
        .into_response();
    };

    let usage = state
        .rate_limiter
        .usage(&id, stake, state.clock.now_millis());
    Json(json!({
        "identity": id.to_string(),
        "stake": stake,
        "privileged": state.membership.is_privileged(&id),
        "usage": usage,
    }))
    .into_response()
}

/// GET /metrics
async fn get_metrics(State(state): State<AppState>) -> Response {
    refresh_gauges(&state);
    match state.metrics.export_prometheus() {
        Ok(text) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn refresh_gauges(state: &AppState) {
    state.metrics.seen_messages.set(state.seen.len() as i64);
    state
        .metrics
        .rate_limiter_entries
        .set(state.rate_limiter.len() as i64);
    state.metrics.queue_depth.set(state.sink.depth() as i64);
}
