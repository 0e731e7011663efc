use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram, IntCounter,
    IntCounterVec, IntGauge, Registry,
};
use std::sync::Arc;

pub struct RelayMetrics {
    pub submissions_accepted: IntCounter,
    pub gossip_accepted: IntCounter,
    pub duplicates: IntCounter,
    pub rate_limited: IntCounter,
    pub submissions_forwarded: IntCounter,
    pub throttled: IntCounter,
    pub auth_failures: IntCounterVec,
    pub protocol_errors: IntCounterVec,
    pub gossip_sent: IntCounter,
    pub gossip_succeeded: IntCounter,
    pub gossip_failed: IntCounter,
    pub seen_messages: IntGauge,
    pub rate_limiter_entries: IntGauge,
    pub queue_depth: IntGauge,
    pub request_latency: Histogram,
    pub registry: Arc<Registry>,
}

impl RelayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let submissions_accepted = register_int_counter_with_registry!(
            "vrelay_submissions_accepted_total",
            "Direct submissions accepted",
            registry
        )?;

        let gossip_accepted = register_int_counter_with_registry!(
            "vrelay_gossip_accepted_total",
            "Relayed submissions accepted from peers",
            registry
        )?;

        let duplicates = register_int_counter_with_registry!(
            "vrelay_duplicates_total",
            "Submissions answered with already_processed",
            registry
        )?;

        let rate_limited = register_int_counter_with_registry!(
            "vrelay_rate_limited_total",
            "Submissions rejected by the stake rate limiter",
            registry
        )?;

        let submissions_forwarded = register_int_counter_with_registry!(
            "vrelay_submissions_forwarded_total",
            "Client submissions forwarded to the validators",
            registry
        )?;

        let throttled = register_int_counter_with_registry!(
            "vrelay_forward_throttled_total",
            "Forward requests refused by the per-IP throttle",
            registry
        )?;

        let auth_failures = register_int_counter_vec_with_registry!(
            "vrelay_auth_failures_total",
            "Requests rejected during authentication",
            &["kind"],
            registry
        )?;

        let protocol_errors = register_int_counter_vec_with_registry!(
            "vrelay_protocol_errors_total",
            "Malformed requests",
            &["kind"],
            registry
        )?;

        let gossip_sent = register_int_counter_with_registry!(
            "vrelay_gossip_deliveries_sent_total",
            "Gossip deliveries attempted",
            registry
        )?;

        let gossip_succeeded = register_int_counter_with_registry!(
            "vrelay_gossip_deliveries_succeeded_total",
            "Gossip deliveries acknowledged by the peer",
            registry
        )?;

        let gossip_failed = register_int_counter_with_registry!(
            "vrelay_gossip_deliveries_failed_total",
            "Gossip deliveries that failed or timed out",
            registry
        )?;

        let seen_messages = register_int_gauge_with_registry!(
            "vrelay_seen_messages",
            "Message ids held by the dedup cache",
            registry
        )?;

        let rate_limiter_entries = register_int_gauge_with_registry!(
            "vrelay_rate_limiter_entries",
            "Identities tracked by the rate limiter",
            registry
        )?;

        let queue_depth = register_int_gauge_with_registry!(
            "vrelay_queue_depth",
            "Submissions waiting for the downstream pipeline",
            registry
        )?;

        let request_latency = register_histogram_with_registry!(
            "vrelay_request_latency_seconds",
            "Request latency in seconds",
            registry
        )?;

        Ok(Self {
            submissions_accepted,
            gossip_accepted,
            duplicates,
            rate_limited,
            submissions_forwarded,
            throttled,
            auth_failures,
            protocol_errors,
            gossip_sent,
            gossip_succeeded,
            gossip_failed,
            seen_messages,
            rate_limiter_entries,
            queue_depth,
            request_latency,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_series() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.submissions_accepted.inc();
        metrics.auth_failures.with_label_values(&["stale"]).inc();
        metrics.queue_depth.set(3);

        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("vrelay_submissions_accepted_total 1"));
        assert!(text.contains("vrelay_auth_failures_total{kind=\"stale\"} 1"));
        assert!(text.contains("vrelay_queue_depth 3"));
    }

    #[test]
    fn test_instances_do_not_share_registries() {
        let a = RelayMetrics::new().unwrap();
        let b = RelayMetrics::new().unwrap();
        a.duplicates.inc();
        assert_eq!(b.duplicates.get(), 0);
    }
}
