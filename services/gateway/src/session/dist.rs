//! Distributed session registry over a shared key-value store.
//!
//! Key shapes:
//! - `session:device:{device_id}` -> JSON registration, TTL = heartbeat timeout
//! - `session:conn:{server_id}:{conn_id}` -> device_id
//! - `session:server:{server_id}:conns` -> set of conn ids
//!
//! Every mutation is a small atomic pipeline keeping the three views
//! consistent. Shared-store failures degrade to local-only behavior: the
//! error is logged, the local tables stay authoritative for connections this
//! instance owns, and cross-instance lookups report NotFound until the store
//! recovers.

use super::{ConnLookup, LivenessLedger, LocalRegistry, OnlinePolicy, SessionRegistry};
use crate::gateway::conn::ConnWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gw_protocol::ProtocolFamily;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

// ---------------------------------------------------------------------------
// Kv seam
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv: {0}")]
    Backend(String),
}

/// One mutation inside an atomic pipeline.
#[derive(Debug, Clone)]
pub enum KvOp {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    Set {
        key: String,
        value: String,
    },
    Del {
        key: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
}

/// String/set store with atomic multi-key writes. Redis in production, a
/// mutex-guarded map in tests.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;
    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), KvError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(cfg: &crate::config::RedisConfig) -> Result<RedisKv, KvError> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}/{}", cfg.addr, cfg.db)
        } else {
            format!("redis://:{}@{}/{}", cfg.password, cfg.addr, cfg.db)
        };
        let client =
            redis::Client::open(url).map_err(|e| KvError::Backend(e.to_string()))?;
        let manager = tokio::time::timeout(
            cfg.dial_timeout,
            redis::aio::ConnectionManager::new(client),
        )
        .await
        .map_err(|_| KvError::Backend("redis dial timed out".to_owned()))?
        .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(RedisKv { manager })
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.manager.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                KvOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SETEX")
                        .arg(key)
                        .arg(ttl.as_secs().max(1))
                        .arg(value)
                        .ignore();
                }
                KvOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                KvOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                KvOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                KvOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
            }
        }
        let mut conn = self.manager.clone();
        let applied: Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;
        applied.map_err(|e| KvError::Backend(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, and the degraded fallback in dev)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemKvInner {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct MemKv {
    inner: Mutex<MemKvInner>,
}

impl MemKv {
    pub fn new() -> Arc<MemKv> {
        Arc::new(MemKv::default())
    }
}

#[async_trait]
impl Kv for MemKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut inner = self.inner.lock().await;
        match inner.strings.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                inner.strings.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .inner
            .lock()
            .await
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        for op in ops {
            match op {
                KvOp::SetEx { key, value, ttl } => {
                    inner
                        .strings
                        .insert(key, (value, Some(Instant::now() + ttl)));
                }
                KvOp::Set { key, value } => {
                    inner.strings.insert(key, (value, None));
                }
                KvOp::Del { key } => {
                    inner.strings.remove(&key);
                    inner.sets.remove(&key);
                }
                KvOp::SAdd { key, member } => {
                    inner.sets.entry(key).or_default().insert(member);
                }
                KvOp::SRem { key, member } => {
                    if let Some(set) = inner.sets.get_mut(&key) {
                        set.remove(&member);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registration JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Registration {
    server_id: String,
    conn_id: u64,
    family: ProtocolFamily,
    bound_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

fn device_key(device_id: &str) -> String {
    format!("session:device:{device_id}")
}

fn conn_key(server_id: &str, conn_id: u64) -> String {
    format!("session:conn:{server_id}:{conn_id}")
}

fn server_set_key(server_id: &str) -> String {
    format!("session:server:{server_id}:conns")
}

// ---------------------------------------------------------------------------
// DistRegistry
// ---------------------------------------------------------------------------

pub struct DistRegistry {
    local: Arc<LocalRegistry>,
    kv: Arc<dyn Kv>,
    heartbeat_timeout: Duration,
}

impl DistRegistry {
    pub fn new(
        server_id: &str,
        heartbeat_timeout: Duration,
        kv: Arc<dyn Kv>,
    ) -> Arc<DistRegistry> {
        Arc::new(DistRegistry {
            local: LocalRegistry::new(server_id, heartbeat_timeout),
            kv,
            heartbeat_timeout,
        })
    }

    async fn read_registration(&self, device_id: &str) -> Option<Registration> {
        match self.kv.get(&device_key(device_id)).await {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(device_id, error = %e, "shared store read failed, degrading to local");
                None
            }
        }
    }

    async fn apply_logged(&self, device_id: &str, ops: Vec<KvOp>) {
        if let Err(e) = self.kv.apply(ops).await {
            warn!(device_id, error = %e, "shared store write failed, session views may be stale");
        }
    }
}

#[async_trait]
impl SessionRegistry for DistRegistry {
    fn server_id(&self) -> &str {
        self.local.server_id()
    }

    async fn bind(
        &self,
        device_id: &str,
        conn: Arc<dyn ConnWriter>,
        family: ProtocolFamily,
        at: DateTime<Utc>,
    ) {
        let conn_id = conn.conn_id();
        self.local.bind(device_id, conn, family, at).await;

        // Reap the previous registration's conn views before installing ours.
        let mut ops = Vec::new();
        if let Some(old) = self.read_registration(device_id).await {
            if old.server_id != self.server_id() || old.conn_id != conn_id {
                ops.push(KvOp::Del {
                    key: conn_key(&old.server_id, old.conn_id),
                });
                ops.push(KvOp::SRem {
                    key: server_set_key(&old.server_id),
                    member: old.conn_id.to_string(),
                });
            }
        }
        let registration = Registration {
            server_id: self.server_id().to_owned(),
            conn_id,
            family,
            bound_at: at,
            last_seen: at,
        };
        ops.push(KvOp::SetEx {
            key: device_key(device_id),
            value: serde_json::to_string(&registration).unwrap_or_default(),
            ttl: self.heartbeat_timeout,
        });
        ops.push(KvOp::Set {
            key: conn_key(self.server_id(), conn_id),
            value: device_id.to_owned(),
        });
        ops.push(KvOp::SAdd {
            key: server_set_key(self.server_id()),
            member: conn_id.to_string(),
        });
        self.apply_logged(device_id, ops).await;
    }

    async fn unbind(&self, device_id: &str, conn_id: u64) {
        self.local.unbind(device_id, conn_id).await;
        if let Some(reg) = self.read_registration(device_id).await {
            if reg.server_id == self.server_id() && reg.conn_id == conn_id {
                self.apply_logged(
                    device_id,
                    vec![
                        KvOp::Del {
                            key: device_key(device_id),
                        },
                        KvOp::Del {
                            key: conn_key(self.server_id(), conn_id),
                        },
                        KvOp::SRem {
                            key: server_set_key(self.server_id()),
                            member: conn_id.to_string(),
                        },
                    ],
                )
                .await;
            }
        }
    }

    async fn on_heartbeat(&self, device_id: &str, at: DateTime<Utc>) {
        self.local.on_heartbeat(device_id, at).await;
        // Refresh the shared registration's freshness and TTL.
        if let Some(mut reg) = self.read_registration(device_id).await {
            if reg.server_id == self.server_id() {
                reg.last_seen = reg.last_seen.max(at);
                self.apply_logged(
                    device_id,
                    vec![KvOp::SetEx {
                        key: device_key(device_id),
                        value: serde_json::to_string(&reg).unwrap_or_default(),
                        ttl: self.heartbeat_timeout,
                    }],
                )
                .await;
            }
        }
    }

    async fn on_tcp_closed(&self, device_id: &str, at: DateTime<Utc>) {
        self.local.on_tcp_closed(device_id, at).await;
    }

    async fn on_ack_timeout(&self, device_id: &str, at: DateTime<Utc>) {
        self.local.on_ack_timeout(device_id, at).await;
    }

    async fn get_conn(&self, device_id: &str) -> ConnLookup {
        // Our own connections resolve without touching the shared store.
        if let ConnLookup::Local(conn) = self.local.get_conn(device_id).await {
            return ConnLookup::Local(conn);
        }
        match self.read_registration(device_id).await {
            Some(reg) if reg.server_id != self.server_id() => ConnLookup::Remote {
                server_id: reg.server_id,
                conn_id: reg.conn_id,
            },
            // A registration claiming our server id with no live local
            // connection is stale (crash leftovers); report NotFound.
            _ => ConnLookup::NotFound,
        }
    }

    async fn family_of(&self, device_id: &str) -> Option<ProtocolFamily> {
        if let Some(family) = self.local.family_of(device_id).await {
            return Some(family);
        }
        self.read_registration(device_id).await.map(|r| r.family)
    }

    async fn is_online(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        if self.local.is_online(device_id, now).await {
            return true;
        }
        // Remote devices: the TTL'd registration is the liveness signal.
        self.read_registration(device_id).await.is_some_and(|reg| {
            now.signed_duration_since(reg.last_seen)
                .to_std()
                .map_or(true, |age| age <= self.heartbeat_timeout)
        })
    }

    async fn is_online_weighted(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
        policy: &OnlinePolicy,
    ) -> bool {
        // Penalty ledgers are local observations; devices on other instances
        // fall back to the TTL'd registration.
        let ledger = self.local.ledger(device_id).await;
        if ledger.last_seen.is_some() {
            return super::is_online(&ledger, now, policy);
        }
        let remote_ledger = LivenessLedger {
            last_seen: self.read_registration(device_id).await.map(|r| r.last_seen),
            ..LivenessLedger::default()
        };
        super::is_online(&remote_ledger, now, policy)
    }

    async fn online_count(&self, now: DateTime<Utc>) -> usize {
        self.local.online_count(now).await
    }

    async fn online_count_weighted(&self, now: DateTime<Utc>, policy: &OnlinePolicy) -> usize {
        self.local.online_count_weighted(now, policy).await
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
