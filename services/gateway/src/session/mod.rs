//! Session registry: device identity -> connection.
//!
//! Two interchangeable implementations, selected by configuration: the
//! in-memory registry for single-instance deployments and the shared-store
//! registry for a horizontally scaled fleet. Both keep the per-device
//! liveness ledger (heartbeats, TCP drops, ACK timeouts) that feeds the
//! weighted online-scoring policy.

use crate::config::WeightedPolicyConfig;
use crate::gateway::conn::ConnWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gw_protocol::ProtocolFamily;
use std::sync::Arc;
use std::time::Duration;

pub mod dist;
pub mod local;

pub use dist::{DistRegistry, Kv, KvError, KvOp, MemKv, RedisKv};
pub use local::LocalRegistry;

// ---------------------------------------------------------------------------
// Online policy
// ---------------------------------------------------------------------------

/// Multi-signal online-decision policy. With `enabled = false` the decision
/// degrades to pure heartbeat freshness.
#[derive(Debug, Clone)]
pub struct OnlinePolicy {
    pub enabled: bool,
    pub heartbeat_timeout: Duration,
    pub tcp_down_window: Duration,
    pub ack_window: Duration,
    pub tcp_down_penalty: f64,
    pub ack_timeout_penalty: f64,
    pub threshold: f64,
}

impl OnlinePolicy {
    pub fn from_config(heartbeat_timeout: Duration, cfg: &WeightedPolicyConfig) -> OnlinePolicy {
        OnlinePolicy {
            enabled: cfg.enabled,
            heartbeat_timeout,
            tcp_down_window: cfg.tcp_down_window,
            ack_window: cfg.ack_window,
            tcp_down_penalty: cfg.tcp_down_penalty,
            ack_timeout_penalty: cfg.ack_timeout_penalty,
            threshold: cfg.threshold,
        }
    }

    /// Heartbeat-only policy with the given timeout.
    pub fn heartbeat_only(heartbeat_timeout: Duration) -> OnlinePolicy {
        OnlinePolicy {
            enabled: false,
            heartbeat_timeout,
            tcp_down_window: Duration::ZERO,
            ack_window: Duration::ZERO,
            tcp_down_penalty: 0.0,
            ack_timeout_penalty: 0.0,
            threshold: 1.0,
        }
    }
}

/// Per-device liveness observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessLedger {
    pub last_seen: Option<DateTime<Utc>>,
    pub last_tcp_down: Option<DateTime<Utc>>,
    pub last_ack_timeout: Option<DateTime<Utc>>,
}

/// Weighted score in `[−1, 1]`; online means `score >= threshold`.
pub fn weighted_score(ledger: &LivenessLedger, now: DateTime<Utc>, policy: &OnlinePolicy) -> f64 {
    let within = |at: Option<DateTime<Utc>>, window: Duration| {
        at.is_some_and(|at| {
            now.signed_duration_since(at)
                .to_std()
                .map_or(true, |age| age <= window)
        })
    };

    let mut score = if within(ledger.last_seen, policy.heartbeat_timeout) {
        1.0
    } else {
        0.0
    };
    if within(ledger.last_tcp_down, policy.tcp_down_window) {
        score -= policy.tcp_down_penalty;
    }
    if within(ledger.last_ack_timeout, policy.ack_window) {
        score -= policy.ack_timeout_penalty;
    }
    score
}

/// The online decision for one ledger under one policy.
pub fn is_online(ledger: &LivenessLedger, now: DateTime<Utc>, policy: &OnlinePolicy) -> bool {
    if !policy.enabled {
        return ledger.last_seen.is_some_and(|at| {
            now.signed_duration_since(at)
                .to_std()
                .map_or(true, |age| age <= policy.heartbeat_timeout)
        });
    }
    weighted_score(ledger, now, policy) >= policy.threshold
}

// ---------------------------------------------------------------------------
// Registry trait
// ---------------------------------------------------------------------------

/// Outcome of a device-to-connection lookup.
pub enum ConnLookup {
    /// The connection lives on this instance.
    Local(Arc<dyn ConnWriter>),
    /// Another instance owns the connection; route through it.
    Remote { server_id: String, conn_id: u64 },
    NotFound,
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    fn server_id(&self) -> &str;

    /// Bind a device to a connection, replacing any stale registration.
    async fn bind(
        &self,
        device_id: &str,
        conn: Arc<dyn ConnWriter>,
        family: ProtocolFamily,
        at: DateTime<Utc>,
    );

    /// Remove the binding, but only if it still points at `conn_id` (a
    /// rebind from a newer connection must not be clobbered by the old
    /// connection's teardown).
    async fn unbind(&self, device_id: &str, conn_id: u64);

    async fn on_heartbeat(&self, device_id: &str, at: DateTime<Utc>);
    async fn on_tcp_closed(&self, device_id: &str, at: DateTime<Utc>);
    async fn on_ack_timeout(&self, device_id: &str, at: DateTime<Utc>);

    async fn get_conn(&self, device_id: &str) -> ConnLookup;
    async fn family_of(&self, device_id: &str) -> Option<ProtocolFamily>;

    async fn is_online(&self, device_id: &str, now: DateTime<Utc>) -> bool;
    async fn is_online_weighted(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
        policy: &OnlinePolicy,
    ) -> bool;

    /// Devices this instance currently considers online.
    async fn online_count(&self, now: DateTime<Utc>) -> usize;
    async fn online_count_weighted(&self, now: DateTime<Utc>, policy: &OnlinePolicy) -> usize;
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
