//! Postgres store: stitches the per-entity queries in [`crate::repo`] into
//! the `Store` trait. The SQL lives next to its table in `repo/`; this file
//! only owns the pool and the trait-level error mapping.

use super::*;
use crate::repo;
use sqlx::PgPool;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> PgStore {
        PgStore { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_device(&self, phy_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(repo::devices::ensure(&self.pool, phy_id, at).await?)
    }

    async fn touch_last_seen(&self, phy_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if repo::devices::touch_last_seen(&self.pool, phy_id, at).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn device(&self, phy_id: &str) -> Result<Option<DeviceRow>, StoreError> {
        Ok(repo::devices::fetch(&self.pool, phy_id).await?)
    }

    async fn upsert_port(&self, up: PortUpsert) -> Result<(), StoreError> {
        Ok(repo::ports::upsert(&self.pool, &up).await?)
    }

    async fn port(&self, phy_id: &str, port_no: u32) -> Result<Option<PortRow>, StoreError> {
        Ok(repo::ports::fetch(&self.pool, phy_id, port_no).await?)
    }

    async fn append_cmd_log(&self, entry: CmdLogEntry) -> Result<(), StoreError> {
        Ok(repo::cmd_log::append(&self.pool, &entry).await?)
    }

    async fn cmd_log_count(&self, phy_id: &str) -> Result<i64, StoreError> {
        Ok(repo::cmd_log::count_for_device(&self.pool, phy_id).await?)
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        Ok(repo::audit_log::append(&self.pool, &entry).await?)
    }

    async fn insert_outbound(&self, new: NewOutbound) -> Result<i64, StoreError> {
        Ok(repo::outbound::insert(&self.pool, &new).await?)
    }

    async fn outbound_depth(&self) -> Result<i64, StoreError> {
        Ok(repo::outbound::pending_depth(&self.pool).await?)
    }

    async fn due_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboundRow>, StoreError> {
        Ok(repo::outbound::due_pending(&self.pool, now, limit).await?)
    }

    async fn set_sent(&self, id: i64, msg_id: u32, at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(repo::outbound::set_sent(&self.pool, id, msg_id, at).await?)
    }

    async fn requeue(
        &self,
        id: i64,
        not_before: DateTime<Utc>,
        attempt_count: u32,
        last_error: &str,
    ) -> Result<(), StoreError> {
        Ok(repo::outbound::requeue(&self.pool, id, not_before, attempt_count, last_error).await?)
    }

    async fn mark_dead(&self, id: i64, reason: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(repo::outbound::mark_dead(&self.pool, id, reason, at).await?)
    }

    async fn mark_done(&self, id: i64, _at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(repo::outbound::mark_done(&self.pool, id).await?)
    }

    async fn oldest_sent_by_msg_id(
        &self,
        phy_id: &str,
        msg_id: u32,
    ) -> Result<Option<OutboundRow>, StoreError> {
        Ok(repo::outbound::oldest_sent_by_msg_id(&self.pool, phy_id, msg_id).await?)
    }

    async fn sent_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<OutboundRow>, StoreError> {
        Ok(repo::outbound::sent_timed_out(&self.pool, now).await?)
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        Ok(repo::outbound::counts_by_status(&self.pool).await?)
    }

    async fn purge_dead_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(repo::outbound::purge_dead_before(&self.pool, cutoff).await?)
    }

    async fn outbound_row(&self, id: i64) -> Result<Option<OutboundRow>, StoreError> {
        Ok(repo::outbound::fetch(&self.pool, id).await?)
    }
}
