//! Metric registry.
//!
//! One process-wide registry created at startup and injected downward.
//! Every admission decision, queue transition, ACK result, and session
//! state change increments something here.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub struct Metrics {
    registry: Registry,

    pub tcp_accept_total: IntCounter,
    pub tcp_bytes_received_total: IntCounter,
    pub conn_active: IntGauge,
    pub conn_rejected_total: IntCounterVec,
    pub breaker_transition_total: IntCounterVec,

    pub parse_total: IntCounterVec,
    pub route_total: IntCounterVec,

    pub session_online_count: IntGauge,
    pub session_heartbeat_total: IntCounter,
    pub session_offline_total: IntCounterVec,

    pub outbound_queue_size: IntGaugeVec,
    pub outbound_resend_total: IntCounter,
    pub outbound_timeout_total: IntCounter,
    pub outbound_dead_cleanup_total: IntCounter,
    pub outbound_admission_rejected_total: IntCounterVec,

    pub push_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Arc<Metrics> {
        let registry = Registry::new();

        let tcp_accept_total =
            IntCounter::with_opts(Opts::new("tcp_accept_total", "Accepted TCP connections"))
                .unwrap();
        let tcp_bytes_received_total = IntCounter::with_opts(Opts::new(
            "tcp_bytes_received_total",
            "Raw bytes read from device sockets",
        ))
        .unwrap();
        let conn_active =
            IntGauge::with_opts(Opts::new("conn_active", "Connections currently held")).unwrap();
        let conn_rejected_total = IntCounterVec::new(
            Opts::new("conn_rejected_total", "Connections denied admission"),
            &["reason"],
        )
        .unwrap();
        let breaker_transition_total = IntCounterVec::new(
            Opts::new("breaker_transition_total", "Circuit breaker transitions"),
            &["to"],
        )
        .unwrap();

        let parse_total = IntCounterVec::new(
            Opts::new("parse_total", "Frames parsed per family"),
            &["family", "result"],
        )
        .unwrap();
        let route_total = IntCounterVec::new(
            Opts::new("route_total", "Frames routed per family and cmd"),
            &["family", "cmd"],
        )
        .unwrap();

        let session_online_count = IntGauge::with_opts(Opts::new(
            "session_online_count",
            "Devices currently considered online",
        ))
        .unwrap();
        let session_heartbeat_total = IntCounter::with_opts(Opts::new(
            "session_heartbeat_total",
            "Heartbeats observed",
        ))
        .unwrap();
        let session_offline_total = IntCounterVec::new(
            Opts::new("session_offline_total", "Devices marked offline"),
            &["reason"],
        )
        .unwrap();

        let outbound_queue_size = IntGaugeVec::new(
            Opts::new("outbound_queue_size", "Outbound rows per status"),
            &["status"],
        )
        .unwrap();
        let outbound_resend_total = IntCounter::with_opts(Opts::new(
            "outbound_resend_total",
            "Outbound rows returned to pending for retry",
        ))
        .unwrap();
        let outbound_timeout_total = IntCounter::with_opts(Opts::new(
            "outbound_timeout_total",
            "Sent rows whose ACK deadline passed",
        ))
        .unwrap();
        let outbound_dead_cleanup_total = IntCounter::with_opts(Opts::new(
            "outbound_dead_cleanup_total",
            "Dead rows purged after retention",
        ))
        .unwrap();
        let outbound_admission_rejected_total = IntCounterVec::new(
            Opts::new(
                "outbound_admission_rejected_total",
                "Enqueues rejected by backpressure thresholds",
            ),
            &["priority"],
        )
        .unwrap();

        let push_total = IntCounterVec::new(
            Opts::new("push_total", "Webhook push attempts"),
            &["result"],
        )
        .unwrap();

        for c in [
            &tcp_accept_total,
            &tcp_bytes_received_total,
            &session_heartbeat_total,
            &outbound_resend_total,
            &outbound_timeout_total,
            &outbound_dead_cleanup_total,
        ] {
            registry.register(Box::new(c.clone())).unwrap();
        }
        for g in [&conn_active, &session_online_count] {
            registry.register(Box::new(g.clone())).unwrap();
        }
        for v in [
            &conn_rejected_total,
            &breaker_transition_total,
            &parse_total,
            &route_total,
            &session_offline_total,
            &outbound_admission_rejected_total,
            &push_total,
        ] {
            registry.register(Box::new(v.clone())).unwrap();
        }
        registry
            .register(Box::new(outbound_queue_size.clone()))
            .unwrap();

        Arc::new(Metrics {
            registry,
            tcp_accept_total,
            tcp_bytes_received_total,
            conn_active,
            conn_rejected_total,
            breaker_transition_total,
            parse_total,
            route_total,
            session_online_count,
            session_heartbeat_total,
            session_offline_total,
            outbound_queue_size,
            outbound_resend_total,
            outbound_timeout_total,
            outbound_dead_cleanup_total,
            outbound_admission_rejected_total,
            push_total,
        })
    }

    /// Text exposition for the `/metrics` endpoint.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_named_metrics() {
        let metrics = Metrics::new();
        metrics.tcp_accept_total.inc();
        metrics.parse_total.with_label_values(&["A", "ok"]).inc();
        metrics
            .outbound_queue_size
            .with_label_values(&["pending"])
            .set(7);
        let text = metrics.gather();
        assert!(text.contains("tcp_accept_total 1"));
        assert!(text.contains("parse_total"));
        assert!(text.contains("outbound_queue_size"));
    }
}
