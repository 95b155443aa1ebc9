use crate::store::AuditEntry;
use sqlx::PgPool;

pub async fn append(pool: &PgPool, entry: &AuditEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_log (device_id, kind, detail, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(&entry.phy_id)
    .bind(&entry.kind)
    .bind(&entry.detail)
    .bind(entry.at)
    .execute(pool)
    .await?;
    Ok(())
}
