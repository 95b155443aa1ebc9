use crate::store::CmdLogEntry;
use sqlx::{PgPool, Row};

pub async fn append(pool: &PgPool, entry: &CmdLogEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO cmd_log (device_id, msg_id, cmd, direction, payload, success, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&entry.phy_id)
    .bind(i64::from(entry.msg_id))
    .bind(i32::from(entry.cmd))
    .bind(entry.direction.as_str())
    .bind(&entry.payload)
    .bind(entry.success)
    .bind(entry.at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_for_device(pool: &PgPool, phy_id: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM cmd_log WHERE device_id = $1")
        .bind(phy_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}
