//! Storage seam.
//!
//! The core writes device, port, queue, and audit state through the [`Store`]
//! trait so the driver and outbound worker do not care whether rows land in
//! Postgres or in test memory. The queue component is the sole caller of the
//! outbound status-transition methods; every transition is conditional on the
//! current status so a done row can never move again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gw_protocol::{PortReadings, PortStatus, ProtocolFamily};

pub mod mem;
pub mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub phy_id: String,
    pub lifecycle: String,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRow {
    pub phy_id: String,
    pub port_no: u32,
    pub status: PortStatus,
    pub raw_status: u8,
    pub readings: PortReadings,
    pub business_no: Option<String>,
    pub session_id: Option<String>,
    pub energy_cwh: Option<u64>,
    pub duration_sec: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// One port write. `raw_status` is stored verbatim; `status` is derived by
/// the caller so audit and API views cannot drift apart.
#[derive(Debug, Clone)]
pub struct PortUpsert {
    pub phy_id: String,
    pub port_no: u32,
    pub raw_status: u8,
    pub readings: PortReadings,
    pub business_no: Option<String>,
    pub session_id: Option<String>,
    pub energy_cwh: Option<u64>,
    pub duration_sec: Option<u64>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdDirection {
    Uplink,
    Downlink,
}

impl CmdDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            CmdDirection::Uplink => "uplink",
            CmdDirection::Downlink => "downlink",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CmdLogEntry {
    pub phy_id: String,
    pub msg_id: u32,
    pub cmd: u16,
    pub direction: CmdDirection,
    pub payload: Vec<u8>,
    pub success: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub phy_id: String,
    pub kind: String,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outbound queue rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStatus {
    Pending,
    Sent,
    Done,
    Dead,
}

impl OutboundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundStatus::Pending => "pending",
            OutboundStatus::Sent => "sent",
            OutboundStatus::Done => "done",
            OutboundStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<OutboundStatus> {
        match s {
            "pending" => Some(OutboundStatus::Pending),
            "sent" => Some(OutboundStatus::Sent),
            "done" => Some(OutboundStatus::Done),
            "dead" => Some(OutboundStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewOutbound {
    pub phy_id: String,
    pub family: ProtocolFamily,
    pub cmd: u16,
    pub payload: Vec<u8>,
    pub priority: i16,
    pub timeout_sec: u32,
    /// Preset wire msg id (replies echoing the device's id); None lets the
    /// worker derive one from the row id at send time.
    pub msg_id: Option<u32>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutboundRow {
    pub id: i64,
    pub phy_id: String,
    pub family: ProtocolFamily,
    pub cmd: u16,
    pub payload: Vec<u8>,
    pub priority: i16,
    pub status: OutboundStatus,
    pub msg_id: Option<u32>,
    pub attempt_count: u32,
    pub not_before: DateTime<Utc>,
    pub timeout_sec: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub sent: i64,
    pub done: i64,
    pub dead: i64,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(String),
    #[error("row not found")]
    NotFound,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Store: Send + Sync {
    // --- devices & ports ---------------------------------------------------

    /// Insert the device if unseen; never resets an existing row.
    async fn ensure_device(&self, phy_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Advance `last_seen_at` monotonically (max of current and `at`).
    async fn touch_last_seen(&self, phy_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn device(&self, phy_id: &str) -> Result<Option<DeviceRow>, StoreError>;

    async fn upsert_port(&self, up: PortUpsert) -> Result<(), StoreError>;

    async fn port(&self, phy_id: &str, port_no: u32) -> Result<Option<PortRow>, StoreError>;

    // --- audit -------------------------------------------------------------

    async fn append_cmd_log(&self, entry: CmdLogEntry) -> Result<(), StoreError>;

    async fn cmd_log_count(&self, phy_id: &str) -> Result<i64, StoreError>;

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;

    // --- outbound queue ----------------------------------------------------

    async fn insert_outbound(&self, new: NewOutbound) -> Result<i64, StoreError>;

    /// Pending-row backlog, the number admission thresholds are applied to.
    async fn outbound_depth(&self) -> Result<i64, StoreError>;

    /// Pending rows whose `not_before` has passed, ordered by
    /// (priority asc, created_at asc, id asc).
    async fn due_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboundRow>, StoreError>;

    /// pending -> sent, binding the wire msg id. Returns false if the row was
    /// not pending (another writer already pinned it).
    async fn set_sent(&self, id: i64, msg_id: u32, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// pending|sent -> pending with a new `not_before` and attempt count.
    async fn requeue(
        &self,
        id: i64,
        not_before: DateTime<Utc>,
        attempt_count: u32,
        last_error: &str,
    ) -> Result<(), StoreError>;

    /// pending|sent -> dead.
    async fn mark_dead(&self, id: i64, reason: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// sent -> done. Done rows never transition again.
    async fn mark_done(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// The oldest outstanding sent row for (device, msg_id); devices that
    /// reuse msg ids out of order resolve to the older row.
    async fn oldest_sent_by_msg_id(
        &self,
        phy_id: &str,
        msg_id: u32,
    ) -> Result<Option<OutboundRow>, StoreError>;

    /// Sent rows whose `sent_at + timeout_sec` has passed.
    async fn sent_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<OutboundRow>, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Delete dead rows older than `cutoff`; returns how many were purged.
    async fn purge_dead_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn outbound_row(&self, id: i64) -> Result<Option<OutboundRow>, StoreError>;
}
