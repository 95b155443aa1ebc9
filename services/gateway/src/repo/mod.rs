//! Per-entity Postgres queries.
//!
//! One module per table; plain runtime-bound `sqlx::query()` throughout.
//! [`crate::store::PgStore`] stitches these into the `Store` trait. Status
//! transitions on the outbound queue are single-row conditional UPDATEs
//! (`WHERE status = ...`) so the queue's no-double-send and done-is-final
//! guarantees hold across instances sharing one database.

pub mod audit_log;
pub mod cmd_log;
pub mod devices;
pub mod outbound;
pub mod ports;
