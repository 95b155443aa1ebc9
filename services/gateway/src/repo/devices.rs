use crate::store::DeviceRow;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

/// Insert the device if unseen; an existing row is left untouched.
pub async fn ensure(pool: &PgPool, phy_id: &str, at: DateTime<Utc>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO devices (phy_id, last_seen_at, created_at)
         VALUES ($1, $2, $2)
         ON CONFLICT (phy_id) DO NOTHING",
    )
    .bind(phy_id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Advance `last_seen_at` monotonically. Returns false when the device does
/// not exist.
pub async fn touch_last_seen(
    pool: &PgPool,
    phy_id: &str,
    at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE devices SET last_seen_at = GREATEST(last_seen_at, $2) WHERE phy_id = $1",
    )
    .bind(phy_id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn fetch(pool: &PgPool, phy_id: &str) -> Result<Option<DeviceRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT phy_id, lifecycle, last_seen_at, created_at FROM devices WHERE phy_id = $1",
    )
    .bind(phy_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| DeviceRow {
        phy_id: r.get("phy_id"),
        lifecycle: r.get("lifecycle"),
        last_seen_at: r.get("last_seen_at"),
        created_at: r.get("created_at"),
    }))
}
