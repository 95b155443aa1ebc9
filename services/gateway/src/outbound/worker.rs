//! Outbound delivery worker.
//!
//! One worker per queue. Each tick: sweep ACK deadlines, refresh gauges,
//! hourly dead-row cleanup, then drain a batch of due pending rows with a
//! per-message throttle. In distributed mode a worker only sends rows whose
//! device the session registry maps to this instance; rows owned elsewhere
//! stay pending for their owner's worker, which is what guarantees a single
//! writer per message.

use super::{wire_msg_id, OutboundQueue};
use crate::adapters::ProtocolAdapter;
use crate::metrics::Metrics;
use crate::session::{ConnLookup, OnlinePolicy, SessionRegistry};
use crate::store::{CmdDirection, CmdLogEntry, OutboundRow};
use chrono::Utc;
use gw_protocol::ProtocolFamily;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct OutboundWorker {
    queue: Arc<OutboundQueue>,
    registry: Arc<dyn SessionRegistry>,
    adapters: HashMap<ProtocolFamily, Arc<dyn ProtocolAdapter>>,
    metrics: Arc<Metrics>,
    online_policy: OnlinePolicy,
    last_purge: Option<Instant>,
}

impl OutboundWorker {
    pub fn new(
        queue: Arc<OutboundQueue>,
        registry: Arc<dyn SessionRegistry>,
        adapters: HashMap<ProtocolFamily, Arc<dyn ProtocolAdapter>>,
        metrics: Arc<Metrics>,
        online_policy: OnlinePolicy,
    ) -> OutboundWorker {
        OutboundWorker {
            queue,
            registry,
            adapters,
            metrics,
            online_policy,
            last_purge: None,
        }
    }

    /// Run until shutdown flips; the in-progress tick always completes so a
    /// drain never abandons a half-sent row.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.queue.config().tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("outbound worker stopping");
                        break;
                    }
                }
                _ = tick.tick() => {
                    self.run_tick().await;
                }
            }
        }
    }

    /// One full maintenance + delivery pass. Public for tests; a single-row
    /// error is logged and never stops the worker.
    pub async fn run_tick(&mut self) {
        let now = Utc::now();

        match self.queue.sweep_timeouts(now).await {
            Ok(timed_out) => {
                for row in &timed_out {
                    self.registry.on_ack_timeout(&row.phy_id, now).await;
                }
            }
            Err(e) => error!(error = %e, "timeout sweep failed"),
        }

        if let Err(e) = self.queue.refresh_gauges().await {
            error!(error = %e, "gauge refresh failed");
        }
        let online = if self.online_policy.enabled {
            self.registry
                .online_count_weighted(now, &self.online_policy)
                .await
        } else {
            self.registry.online_count(now).await
        };
        self.metrics.session_online_count.set(online as i64);

        if self
            .last_purge
            .is_none_or(|at| at.elapsed() >= PURGE_INTERVAL)
        {
            if let Err(e) = self.queue.purge_dead(now).await {
                error!(error = %e, "dead row purge failed");
            }
            self.last_purge = Some(Instant::now());
        }

        let due = match self
            .queue
            .store()
            .due_pending(now, self.queue.config().batch_size)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "pending fetch failed");
                return;
            }
        };
        for row in due {
            self.try_send(row).await;
            tokio::time::sleep(self.queue.config().throttle).await;
        }
    }

    async fn try_send(&self, row: OutboundRow) {
        let Some(adapter) = self.adapters.get(&row.family) else {
            warn!(id = row.id, family = %row.family, "no adapter for family");
            if let Err(e) = self.queue.retry_or_dead(&row, "protocol family disabled").await {
                error!(error = %e, "retry bookkeeping failed");
            }
            return;
        };

        match self.registry.get_conn(&row.phy_id).await {
            ConnLookup::Remote { server_id, .. } => {
                // Another instance owns the device; leave the row pending
                // untouched for its worker.
                debug!(id = row.id, phy_id = %row.phy_id, owner = %server_id, "row owned remotely, deferring");
            }
            ConnLookup::NotFound => {
                if let Err(e) = self.queue.retry_or_dead(&row, "no connection available").await {
                    error!(error = %e, "retry bookkeeping failed");
                }
            }
            ConnLookup::Local(conn) => {
                let now = Utc::now();
                let msg_id = row.msg_id.unwrap_or_else(|| wire_msg_id(row.family, row.id));
                let pinned = match self.queue.store().set_sent(row.id, msg_id, now).await {
                    Ok(pinned) => pinned,
                    Err(e) => {
                        error!(id = row.id, error = %e, "sent pin failed");
                        return;
                    }
                };
                if !pinned {
                    // Another worker already owns this row.
                    return;
                }

                let frame = adapter.build_downlink(&row.phy_id, msg_id, row.cmd, &row.payload);
                match conn.send_bytes(frame).await {
                    Ok(()) => {
                        debug!(id = row.id, phy_id = %row.phy_id, msg_id, cmd = %format!("{:#06x}", row.cmd), "downlink sent");
                        if let Err(e) = self
                            .queue
                            .store()
                            .append_cmd_log(CmdLogEntry {
                                phy_id: row.phy_id.clone(),
                                msg_id,
                                cmd: row.cmd,
                                direction: CmdDirection::Downlink,
                                payload: row.payload.clone(),
                                success: true,
                                at: now,
                            })
                            .await
                        {
                            warn!(error = %e, "cmd log append failed");
                        }
                        // Fire-and-forget rows complete on write.
                        if row.timeout_sec == 0 {
                            if let Err(e) = self.queue.store().mark_done(row.id, now).await {
                                error!(error = %e, "fire-and-forget completion failed");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(id = row.id, phy_id = %row.phy_id, error = %e, "downlink write failed");
                        if let Err(e) = self
                            .queue
                            .retry_or_dead(&row, &format!("write failed: {e}"))
                            .await
                        {
                            error!(error = %e, "retry bookkeeping failed");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
