//! Prometheus metrics for BucketMQ
//!
//! Counters and gauges of the session and delivery engine. The registry is
//! owned by the broker; exposing it over HTTP is left to the embedding
//! application.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::protocol::QoS;

/// All BucketMQ metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Session metrics
    pub sessions_current: IntGauge,
    pub sessions_expired_total: IntCounter,

    // Message metrics
    pub messages_published_total: IntCounter,
    pub messages_enqueued_total: IntCounter,
    pub messages_delivered_total: IntCounterVec,
    pub messages_dropped_total: IntCounterVec,

    // QoS metrics
    pub inflight_messages: IntGaugeVec,
    pub retransmits_total: IntCounterVec,
    pub retry_count: Histogram,
    pub unknown_acks_total: IntCounter,

    // Stores
    pub retained_messages_current: IntGauge,
    pub payloads_current: IntGauge,
    pub durability_failures_total: IntCounter,

    // Performance metrics
    pub publish_latency: Histogram,
}

fn qos_label(qos: QoS) -> &'static str {
    match qos {
        QoS::AtMostOnce => "0",
        QoS::AtLeastOnce => "1",
        QoS::ExactlyOnce => "2",
    }
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        // Session metrics
        let sessions_current = IntGauge::with_opts(Opts::new(
            "bucketmq_sessions_current",
            "Current number of sessions, connected or not",
        ))?;

        let sessions_expired_total = IntCounter::with_opts(Opts::new(
            "bucketmq_sessions_expired_total",
            "Total sessions expired since startup",
        ))?;

        // Message metrics
        let messages_published_total = IntCounter::with_opts(Opts::new(
            "bucketmq_messages_published_total",
            "Total messages routed through the publish path",
        ))?;

        let messages_enqueued_total = IntCounter::with_opts(Opts::new(
            "bucketmq_messages_enqueued_total",
            "Total messages appended to session queues",
        ))?;

        let messages_delivered_total = IntCounterVec::new(
            Opts::new(
                "bucketmq_messages_delivered_total",
                "Total PUBLISH packets handed to the connection sink by QoS",
            ),
            &["qos"],
        )?;

        let messages_dropped_total = IntCounterVec::new(
            Opts::new(
                "bucketmq_messages_dropped_total",
                "Total messages dropped by reason",
            ),
            &["reason"],
        )?;

        // QoS metrics
        let inflight_messages = IntGaugeVec::new(
            Opts::new(
                "bucketmq_inflight_messages",
                "Current inflight messages by QoS level",
            ),
            &["qos"],
        )?;

        let retransmits_total = IntCounterVec::new(
            Opts::new(
                "bucketmq_retransmits_total",
                "Total timer-driven retransmissions by QoS",
            ),
            &["qos"],
        )?;

        let retry_count = Histogram::with_opts(
            HistogramOpts::new(
                "bucketmq_delivery_retry_count",
                "Retry count of an in-flight message at each retransmission",
            )
            .buckets(vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0]),
        )?;

        let unknown_acks_total = IntCounter::with_opts(Opts::new(
            "bucketmq_unknown_acks_total",
            "Total acknowledgements that matched no in-flight message",
        ))?;

        // Stores
        let retained_messages_current = IntGauge::with_opts(Opts::new(
            "bucketmq_retained_messages_current",
            "Current number of retained messages",
        ))?;

        let payloads_current = IntGauge::with_opts(Opts::new(
            "bucketmq_payloads_current",
            "Current number of stored payload bodies",
        ))?;

        let durability_failures_total = IntCounter::with_opts(Opts::new(
            "bucketmq_durability_failures_total",
            "Total failed durable writes",
        ))?;

        // Performance metrics
        let publish_latency = Histogram::with_opts(
            HistogramOpts::new(
                "bucketmq_publish_latency_seconds",
                "Time to route a publish to every matching session",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )?;

        // Register all metrics
        registry.register(Box::new(sessions_current.clone()))?;
        registry.register(Box::new(sessions_expired_total.clone()))?;
        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(messages_enqueued_total.clone()))?;
        registry.register(Box::new(messages_delivered_total.clone()))?;
        registry.register(Box::new(messages_dropped_total.clone()))?;
        registry.register(Box::new(inflight_messages.clone()))?;
        registry.register(Box::new(retransmits_total.clone()))?;
        registry.register(Box::new(retry_count.clone()))?;
        registry.register(Box::new(unknown_acks_total.clone()))?;
        registry.register(Box::new(retained_messages_current.clone()))?;
        registry.register(Box::new(payloads_current.clone()))?;
        registry.register(Box::new(durability_failures_total.clone()))?;
        registry.register(Box::new(publish_latency.clone()))?;

        Ok(Metrics {
            registry,
            sessions_current,
            sessions_expired_total,
            messages_published_total,
            messages_enqueued_total,
            messages_delivered_total,
            messages_dropped_total,
            inflight_messages,
            retransmits_total,
            retry_count,
            unknown_acks_total,
            retained_messages_current,
            payloads_current,
            durability_failures_total,
            publish_latency,
        })
    }

    // Helper methods for common operations

    pub fn session_created(&self) {
        self.sessions_current.inc();
    }

    pub fn session_ended(&self) {
        self.sessions_current.dec();
    }

    pub fn session_expired(&self) {
        self.sessions_expired_total.inc();
        self.sessions_current.dec();
    }

    pub fn message_published(&self) {
        self.messages_published_total.inc();
    }

    pub fn message_enqueued(&self) {
        self.messages_enqueued_total.inc();
    }

    pub fn message_delivered(&self, qos: QoS) {
        self.messages_delivered_total
            .with_label_values(&[qos_label(qos)])
            .inc();
    }

    /// `reason`: queue_full, evicted, expired, no_session, durability, shutdown
    pub fn message_dropped(&self, reason: &str) {
        self.messages_dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn inflight_added(&self, qos: QoS) {
        self.inflight_messages.with_label_values(&[qos_label(qos)]).inc();
    }

    pub fn inflight_removed(&self, qos: QoS) {
        self.inflight_messages.with_label_values(&[qos_label(qos)]).dec();
    }

    pub fn retransmitted(&self, qos: QoS, retry_count: u32) {
        self.retransmits_total
            .with_label_values(&[qos_label(qos)])
            .inc();
        self.retry_count.observe(retry_count as f64);
    }

    pub fn unknown_ack(&self) {
        self.unknown_acks_total.inc();
    }

    pub fn durability_failure(&self) {
        self.durability_failures_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register() {
        let metrics = Metrics::new().unwrap();
        metrics.message_delivered(QoS::AtLeastOnce);
        metrics.message_dropped("queue_full");
        metrics.retransmitted(QoS::ExactlyOnce, 3);

        assert!(!metrics.registry.gather().is_empty());
        assert_eq!(
            metrics
                .messages_delivered_total
                .with_label_values(&["1"])
                .get(),
            1
        );
    }

    #[test]
    fn test_brokers_have_separate_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.session_created();
        assert_eq!(a.sessions_current.get(), 1);
        assert_eq!(b.sessions_current.get(), 0);
    }
}
