//! Outbound command queue.
//!
//! Persistent, priority-ordered downlink delivery with at-most-one writer
//! per message: a row is `pending` until a worker pins it `sent`, then an
//! ACK (or the sweep) moves it to `done`, back to `pending` with backoff,
//! or to `dead` once retries are exhausted.
//!
//! Rows with `timeout_sec == 0` are fire-and-forget (heartbeat replies and
//! other unacknowledged downlinks): the worker completes them right after a
//! successful socket write instead of waiting for an ACK that will never
//! come.

use crate::config::OutboundConfig;
use crate::metrics::Metrics;
use crate::store::{NewOutbound, OutboundRow, Store, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gw_protocol::{Priority, ProtocolFamily};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod worker;

pub use worker::OutboundWorker;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue backpressure (depth {depth}, priority {priority} refused)")]
    Backpressure { depth: i64, priority: Priority },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Wire msg id binding
// ---------------------------------------------------------------------------

/// Derive the wire message id from the row id at send time. Family A
/// headers carry 16 bits, Family B 32; zero is avoided because several
/// firmwares treat it as "no id".
pub fn wire_msg_id(family: ProtocolFamily, row_id: i64) -> u32 {
    let msg_id = match family {
        ProtocolFamily::A => (row_id as u64 & 0xFFFF) as u32,
        ProtocolFamily::B => (row_id as u64 & 0xFFFF_FFFF) as u32,
    };
    if msg_id == 0 { 1 } else { msg_id }
}

/// Linear retry backoff: 3 s x attempt.
pub fn backoff(attempt_count: u32) -> ChronoDuration {
    ChronoDuration::seconds(3 * i64::from(attempt_count.max(1)))
}

// ---------------------------------------------------------------------------
// OutboundQueue
// ---------------------------------------------------------------------------

pub struct OutboundQueue {
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    cfg: OutboundConfig,
}

impl OutboundQueue {
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        cfg: OutboundConfig,
    ) -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue {
            store,
            metrics,
            cfg,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &OutboundConfig {
        &self.cfg
    }

    /// Admit and insert a new pending row.
    ///
    /// Backpressure thresholds on the pending backlog: above 200 rows the
    /// admission ceiling drops to normal, above 500 to high, and from 1000
    /// up only emergency traffic gets in. The producer sees the rejection
    /// and may re-issue at a higher priority.
    pub async fn enqueue(
        &self,
        phy_id: &str,
        family: ProtocolFamily,
        cmd: u16,
        payload: Vec<u8>,
        priority: Priority,
        timeout_sec: u32,
    ) -> Result<i64, EnqueueError> {
        let depth = self.store.outbound_depth().await?;
        let max_admitted = if depth >= 1000 {
            Priority::Emergency
        } else if depth > 500 {
            Priority::High
        } else if depth > 200 {
            Priority::Normal
        } else {
            Priority::Background
        };
        if priority > max_admitted {
            self.metrics
                .outbound_admission_rejected_total
                .with_label_values(&[&priority.as_i16().to_string()])
                .inc();
            warn!(phy_id, depth, priority = %priority, "outbound admission rejected");
            return Err(EnqueueError::Backpressure { depth, priority });
        }

        let id = self
            .store
            .insert_outbound(NewOutbound {
                phy_id: phy_id.to_owned(),
                family,
                cmd,
                payload,
                priority: priority.as_i16(),
                timeout_sec,
                msg_id: None,
                at: Utc::now(),
            })
            .await?;
        debug!(phy_id, id, cmd = %format!("{cmd:#06x}"), priority = %priority, "outbound enqueued");
        Ok(id)
    }

    /// Enqueue a reply frame that must echo the device's wire msg id and
    /// expects no ACK (heartbeat echoes and the like). Replies skip the
    /// backpressure gate: dropping them would make healthy devices look
    /// dead to their own firmware.
    pub async fn enqueue_reply(
        &self,
        phy_id: &str,
        family: ProtocolFamily,
        cmd: u16,
        payload: Vec<u8>,
        echo_msg_id: u32,
    ) -> Result<i64, EnqueueError> {
        let id = self
            .store
            .insert_outbound(NewOutbound {
                phy_id: phy_id.to_owned(),
                family,
                cmd,
                payload,
                priority: crate::config::priority_for_wire_cmd(cmd).as_i16(),
                timeout_sec: 0,
                msg_id: Some(echo_msg_id),
                at: Utc::now(),
            })
            .await?;
        debug!(phy_id, id, cmd = %format!("{cmd:#06x}"), "reply enqueued");
        Ok(id)
    }

    /// Handle an ACK frame matched by (device, wire msg id). Success
    /// completes the oldest outstanding sent row; failure applies the retry
    /// rule with the device's error code as the reason.
    pub async fn ack(
        &self,
        phy_id: &str,
        msg_id: u32,
        ok: bool,
        error_code: Option<u8>,
    ) -> Result<(), StoreError> {
        let Some(row) = self.store.oldest_sent_by_msg_id(phy_id, msg_id).await? else {
            debug!(phy_id, msg_id, "ack without outstanding sent row, ignoring");
            return Ok(());
        };
        if ok {
            self.store.mark_done(row.id, Utc::now()).await?;
            debug!(phy_id, id = row.id, msg_id, "outbound acknowledged");
        } else {
            let code = error_code.unwrap_or(0);
            info!(phy_id, id = row.id, msg_id, code, "device rejected downlink");
            self.retry_or_dead(&row, &format!("device nack, code {code}"))
                .await?;
        }
        Ok(())
    }

    /// Shared retry rule: bump the attempt count, requeue with backoff
    /// while attempts remain, otherwise dead-letter the row.
    pub async fn retry_or_dead(&self, row: &OutboundRow, reason: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let attempts = row.attempt_count + 1;
        if attempts < self.cfg.retry_max {
            self.store
                .requeue(row.id, now + backoff(attempts), attempts, reason)
                .await?;
            self.metrics.outbound_resend_total.inc();
            debug!(id = row.id, attempts, reason, "outbound requeued");
        } else {
            self.store.mark_dead(row.id, reason, now).await?;
            info!(id = row.id, attempts, reason, "outbound dead-lettered");
        }
        Ok(())
    }

    /// ACK-deadline sweep; returns the rows that timed out (the worker also
    /// records them against the session ledger).
    pub async fn sweep_timeouts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboundRow>, StoreError> {
        let rows = self.store.sent_timed_out(now).await?;
        for row in &rows {
            self.metrics.outbound_timeout_total.inc();
            self.retry_or_dead(row, "ack timeout").await?;
        }
        Ok(rows)
    }

    /// Refresh the per-status gauges.
    pub async fn refresh_gauges(&self) -> Result<(), StoreError> {
        let counts = self.store.counts_by_status().await?;
        let gauge = &self.metrics.outbound_queue_size;
        gauge.with_label_values(&["pending"]).set(counts.pending);
        gauge.with_label_values(&["sent"]).set(counts.sent);
        gauge.with_label_values(&["done"]).set(counts.done);
        gauge.with_label_values(&["dead"]).set(counts.dead);
        Ok(())
    }

    /// Purge dead rows older than the retention window.
    pub async fn purge_dead(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - ChronoDuration::days(i64::from(self.cfg.dead_retention_days));
        let purged = self.store.purge_dead_before(cutoff).await?;
        if purged > 0 {
            self.metrics
                .outbound_dead_cleanup_total
                .inc_by(purged);
            info!(purged, "dead outbound rows purged");
        }
        Ok(purged)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboundConfig;
    use crate::store::{MemStore, OutboundStatus};
    use std::time::Duration;

    fn queue_with(store: Arc<MemStore>) -> Arc<OutboundQueue> {
        OutboundQueue::new(
            store,
            Metrics::new(),
            OutboundConfig {
                throttle: Duration::from_millis(0),
                retry_max: 3,
                dead_retention_days: 7,
                batch_size: 20,
                tick: Duration::from_millis(50),
                ack_timeout_sec: 30,
            },
        )
    }

    async fn seed_normal(store: &MemStore, n: usize) {
        for _ in 0..n {
            store
                .seed_outbound(NewOutbound {
                    phy_id: "dev".to_owned(),
                    family: ProtocolFamily::A,
                    cmd: 0x23,
                    payload: vec![],
                    priority: Priority::Normal.as_i16(),
                    timeout_sec: 30,
                    msg_id: None,
                    at: Utc::now(),
                })
                .await;
        }
    }

    #[test]
    fn wire_msg_ids_fit_their_families_and_avoid_zero() {
        assert_eq!(wire_msg_id(ProtocolFamily::A, 1), 1);
        assert_eq!(wire_msg_id(ProtocolFamily::A, 0x1_0000), 1); // wraps, never 0
        assert_eq!(wire_msg_id(ProtocolFamily::A, 0x1_0005), 5);
        assert_eq!(wire_msg_id(ProtocolFamily::B, 0x1_0000_0005), 5);
        assert_eq!(wire_msg_id(ProtocolFamily::B, 0x1_0000_0000), 1);
    }

    #[test]
    fn backoff_is_linear_and_never_zero() {
        assert_eq!(backoff(0), ChronoDuration::seconds(3));
        assert_eq!(backoff(1), ChronoDuration::seconds(3));
        assert_eq!(backoff(2), ChronoDuration::seconds(6));
        assert_eq!(backoff(3), ChronoDuration::seconds(9));
    }

    #[tokio::test]
    async fn backpressure_caps_at_normal_above_200() {
        let store = Arc::new(MemStore::new());
        seed_normal(&store, 250).await;
        let queue = queue_with(store.clone());

        let low = queue
            .enqueue("dev", ProtocolFamily::A, 0x23, vec![], Priority::Low, 30)
            .await;
        assert!(matches!(low, Err(EnqueueError::Backpressure { .. })));
        let background = queue
            .enqueue("dev", ProtocolFamily::A, 0x23, vec![], Priority::Background, 30)
            .await;
        assert!(matches!(background, Err(EnqueueError::Backpressure { .. })));

        // Normal and better still get in at this tier.
        for priority in [Priority::Normal, Priority::High, Priority::Emergency] {
            let admitted = queue
                .enqueue("dev", ProtocolFamily::A, 0x23, vec![], priority, 30)
                .await;
            assert!(admitted.is_ok(), "{priority:?} must be admitted at depth 250");
        }
    }

    #[tokio::test]
    async fn backpressure_caps_at_high_above_500() {
        let store = Arc::new(MemStore::new());
        seed_normal(&store, 501).await;
        let queue = queue_with(store.clone());

        let normal = queue
            .enqueue("dev", ProtocolFamily::A, 0x23, vec![], Priority::Normal, 30)
            .await;
        assert!(matches!(normal, Err(EnqueueError::Backpressure { .. })));

        // High survives until the 1000 tier.
        let high = queue
            .enqueue("dev", ProtocolFamily::A, 0x20, vec![], Priority::High, 30)
            .await;
        assert!(high.is_ok());
        let emergency = queue
            .enqueue("dev", ProtocolFamily::A, 0x21, vec![], Priority::Emergency, 30)
            .await;
        assert!(emergency.is_ok());
    }

    #[tokio::test]
    async fn backpressure_admits_only_emergency_from_1000() {
        let store = Arc::new(MemStore::new());
        seed_normal(&store, 1000).await;
        let queue = queue_with(store.clone());

        let high = queue
            .enqueue("dev", ProtocolFamily::A, 0x20, vec![], Priority::High, 30)
            .await;
        assert!(matches!(high, Err(EnqueueError::Backpressure { .. })));

        let emergency = queue
            .enqueue("dev", ProtocolFamily::A, 0x21, vec![], Priority::Emergency, 30)
            .await;
        assert!(emergency.is_ok());
    }

    #[tokio::test]
    async fn successful_ack_completes_the_sent_row() {
        let store = Arc::new(MemStore::new());
        let queue = queue_with(store.clone());
        let id = queue
            .enqueue("dev", ProtocolFamily::A, 0x20, vec![], Priority::High, 30)
            .await
            .unwrap();
        let msg_id = wire_msg_id(ProtocolFamily::A, id);
        store.set_sent(id, msg_id, Utc::now()).await.unwrap();

        queue.ack("dev", msg_id, true, None).await.unwrap();
        assert_eq!(
            store.outbound_row(id).await.unwrap().unwrap().status,
            OutboundStatus::Done
        );
    }

    #[tokio::test]
    async fn nack_applies_retry_rule_then_dead() {
        let store = Arc::new(MemStore::new());
        let queue = queue_with(store.clone());
        let id = queue
            .enqueue("dev", ProtocolFamily::A, 0x20, vec![], Priority::High, 30)
            .await
            .unwrap();
        let msg_id = wire_msg_id(ProtocolFamily::A, id);

        // attempts 1 and 2 requeue, attempt 3 dead-letters
        for expected_attempts in 1..=2u32 {
            store.set_sent(id, msg_id, Utc::now()).await.unwrap();
            queue.ack("dev", msg_id, false, Some(2)).await.unwrap();
            let row = store.outbound_row(id).await.unwrap().unwrap();
            assert_eq!(row.status, OutboundStatus::Pending);
            assert_eq!(row.attempt_count, expected_attempts);
            assert!(row.not_before > Utc::now());
        }
        store.set_sent(id, msg_id, Utc::now()).await.unwrap();
        queue.ack("dev", msg_id, false, Some(2)).await.unwrap();
        let row = store.outbound_row(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboundStatus::Dead);
        assert!(row.last_error.as_deref().unwrap_or("").contains("nack"));
    }

    #[tokio::test]
    async fn ack_without_sent_row_is_ignored() {
        let store = Arc::new(MemStore::new());
        let queue = queue_with(store);
        queue.ack("dev", 42, true, None).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_times_out_overdue_sent_rows() {
        let store = Arc::new(MemStore::new());
        let queue = queue_with(store.clone());
        let id = queue
            .enqueue("dev", ProtocolFamily::A, 0x20, vec![], Priority::Normal, 1)
            .await
            .unwrap();
        store
            .set_sent(id, 1, Utc::now() - ChronoDuration::seconds(5))
            .await
            .unwrap();

        let timed_out = queue.sweep_timeouts(Utc::now()).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        let row = store.outbound_row(id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboundStatus::Pending);
        assert_eq!(row.attempt_count, 1);
        // notBefore is roughly now + 3s (linear backoff, first attempt)
        let delta = row.not_before - Utc::now();
        assert!(delta > ChronoDuration::seconds(2) && delta <= ChronoDuration::seconds(4));
    }

    #[tokio::test]
    async fn purge_counts_each_dead_row_exactly_once() {
        let store = Arc::new(MemStore::new());
        let queue = queue_with(store.clone());
        let old = Utc::now() - ChronoDuration::days(10);
        let id = store
            .seed_outbound(NewOutbound {
                phy_id: "dev".to_owned(),
                family: ProtocolFamily::A,
                cmd: 0x20,
                payload: vec![],
                priority: 3,
                timeout_sec: 30,
                msg_id: None,
                at: old,
            })
            .await;
        store.mark_dead(id, "retries exhausted", old).await.unwrap();

        assert_eq!(queue.purge_dead(Utc::now()).await.unwrap(), 1);
        assert_eq!(queue.purge_dead(Utc::now()).await.unwrap(), 0);
    }
}
