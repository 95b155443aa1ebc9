use crate::store::{NewOutbound, OutboundRow, OutboundStatus, StatusCounts};
use chrono::{DateTime, Utc};
use gw_protocol::ProtocolFamily;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

fn family_from_str(s: &str) -> ProtocolFamily {
    if s == "B" {
        ProtocolFamily::B
    } else {
        ProtocolFamily::A
    }
}

pub(crate) fn from_row(row: &PgRow) -> OutboundRow {
    let family: String = row.get("family");
    let status: String = row.get("status");
    OutboundRow {
        id: row.get("id"),
        phy_id: row.get("device_id"),
        family: family_from_str(&family),
        cmd: row.get::<i32, _>("cmd") as u16,
        payload: row.get("payload"),
        priority: row.get("priority"),
        status: OutboundStatus::parse(&status).unwrap_or(OutboundStatus::Dead),
        msg_id: row.get::<Option<i64>, _>("msg_id").map(|v| v as u32),
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        not_before: row.get("not_before"),
        timeout_sec: row.get::<i32, _>("timeout_sec") as u32,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        sent_at: row.get("sent_at"),
    }
}

pub async fn insert(pool: &PgPool, new: &NewOutbound) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO outbound_queue
             (device_id, family, cmd, payload, priority, status, msg_id, not_before,
              timeout_sec, created_at)
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $7)
         RETURNING id",
    )
    .bind(&new.phy_id)
    .bind(new.family.as_str())
    .bind(i32::from(new.cmd))
    .bind(&new.payload)
    .bind(new.priority)
    .bind(new.msg_id.map(i64::from))
    .bind(new.at)
    .bind(new.timeout_sec as i32)
    .fetch_one(pool)
    .await?;
    Ok(row.get("id"))
}

/// Pending-row backlog, the number admission thresholds are applied to.
pub async fn pending_depth(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM outbound_queue WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}

pub async fn due_pending(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<OutboundRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM outbound_queue
         WHERE status = 'pending' AND not_before <= $1
         ORDER BY priority ASC, created_at ASC, id ASC
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

/// pending -> sent; false when another writer already pinned the row.
pub async fn set_sent(
    pool: &PgPool,
    id: i64,
    msg_id: u32,
    at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE outbound_queue
         SET status = 'sent', msg_id = $2, sent_at = $3, updated_at = now()
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .bind(i64::from(msg_id))
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn requeue(
    pool: &PgPool,
    id: i64,
    not_before: DateTime<Utc>,
    attempt_count: u32,
    last_error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE outbound_queue
         SET status = 'pending', not_before = $2, attempt_count = $3,
             last_error = $4, msg_id = NULL, sent_at = NULL, updated_at = now()
         WHERE id = $1 AND status IN ('pending', 'sent')",
    )
    .bind(id)
    .bind(not_before)
    .bind(attempt_count as i32)
    .bind(last_error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_dead(
    pool: &PgPool,
    id: i64,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE outbound_queue
         SET status = 'dead', last_error = $2, not_before = $3, updated_at = now()
         WHERE id = $1 AND status IN ('pending', 'sent')",
    )
    .bind(id)
    .bind(reason)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// sent -> done. Done rows never transition again.
pub async fn mark_done(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE outbound_queue SET status = 'done', updated_at = now()
         WHERE id = $1 AND status = 'sent'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Devices that reuse msg ids out of order resolve to the older sent row.
pub async fn oldest_sent_by_msg_id(
    pool: &PgPool,
    phy_id: &str,
    msg_id: u32,
) -> Result<Option<OutboundRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT * FROM outbound_queue
         WHERE device_id = $1 AND msg_id = $2 AND status = 'sent'
         ORDER BY sent_at ASC, id ASC
         LIMIT 1",
    )
    .bind(phy_id)
    .bind(i64::from(msg_id))
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(from_row))
}

pub async fn sent_timed_out(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<OutboundRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM outbound_queue
         WHERE status = 'sent'
           AND sent_at + make_interval(secs => timeout_sec) <= $1",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

pub async fn counts_by_status(pool: &PgPool) -> Result<StatusCounts, sqlx::Error> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM outbound_queue GROUP BY status")
        .fetch_all(pool)
        .await?;
    let mut counts = StatusCounts::default();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        match status.as_str() {
            "pending" => counts.pending = n,
            "sent" => counts.sent = n,
            "done" => counts.done = n,
            "dead" => counts.dead = n,
            _ => {}
        }
    }
    Ok(counts)
}

pub async fn purge_dead_before(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM outbound_queue WHERE status = 'dead' AND not_before < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn fetch(pool: &PgPool, id: i64) -> Result<Option<OutboundRow>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM outbound_queue WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(from_row))
}
