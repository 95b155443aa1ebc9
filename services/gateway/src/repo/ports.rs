use crate::store::{PortRow, PortUpsert};
use gw_protocol::{PortReadings, PortStatus};
use sqlx::{PgPool, Row};

/// Upsert one port snapshot. `raw_status` and the derived `status` are
/// always overwritten; readings and session metadata only when the report
/// carries them, so partial updates never erase known values.
pub async fn upsert(pool: &PgPool, up: &PortUpsert) -> Result<(), sqlx::Error> {
    let status = PortStatus::from_raw(up.raw_status);
    sqlx::query(
        r#"INSERT INTO ports
               (device_id, port_no, status, raw_status, power_w, voltage_dv, current_ma,
                temperature_c, business_no, session_id, energy_cwh, duration_sec, updated_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
           ON CONFLICT (device_id, port_no) DO UPDATE SET
               status        = EXCLUDED.status,
               raw_status    = EXCLUDED.raw_status,
               power_w       = COALESCE(EXCLUDED.power_w, ports.power_w),
               voltage_dv    = COALESCE(EXCLUDED.voltage_dv, ports.voltage_dv),
               current_ma    = COALESCE(EXCLUDED.current_ma, ports.current_ma),
               temperature_c = COALESCE(EXCLUDED.temperature_c, ports.temperature_c),
               business_no   = COALESCE(EXCLUDED.business_no, ports.business_no),
               session_id    = COALESCE(EXCLUDED.session_id, ports.session_id),
               energy_cwh    = COALESCE(EXCLUDED.energy_cwh, ports.energy_cwh),
               duration_sec  = COALESCE(EXCLUDED.duration_sec, ports.duration_sec),
               updated_at    = EXCLUDED.updated_at"#,
    )
    .bind(&up.phy_id)
    .bind(up.port_no as i32)
    .bind(status.as_str())
    .bind(i16::from(up.raw_status))
    .bind(up.readings.power_w.map(|v| v as i32))
    .bind(up.readings.voltage_dv.map(|v| v as i32))
    .bind(up.readings.current_ma.map(|v| v as i32))
    .bind(up.readings.temperature_c)
    .bind(&up.business_no)
    .bind(&up.session_id)
    .bind(up.energy_cwh.map(|v| v as i64))
    .bind(up.duration_sec.map(|v| v as i64))
    .bind(up.at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch(
    pool: &PgPool,
    phy_id: &str,
    port_no: u32,
) -> Result<Option<PortRow>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM ports WHERE device_id = $1 AND port_no = $2")
        .bind(phy_id)
        .bind(port_no as i32)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| {
        let status: String = r.get("status");
        PortRow {
            phy_id: r.get("device_id"),
            port_no: r.get::<i32, _>("port_no") as u32,
            status: PortStatus::parse(&status).unwrap_or(PortStatus::Offline),
            raw_status: r.get::<i16, _>("raw_status") as u8,
            readings: PortReadings {
                power_w: r.get::<Option<i32>, _>("power_w").map(|v| v as u32),
                voltage_dv: r.get::<Option<i32>, _>("voltage_dv").map(|v| v as u32),
                current_ma: r.get::<Option<i32>, _>("current_ma").map(|v| v as u32),
                temperature_c: r.get("temperature_c"),
            },
            business_no: r.get("business_no"),
            session_id: r.get("session_id"),
            energy_cwh: r.get::<Option<i64>, _>("energy_cwh").map(|v| v as u64),
            duration_sec: r.get::<Option<i64>, _>("duration_sec").map(|v| v as u64),
            updated_at: r.get("updated_at"),
        }
    }))
}
