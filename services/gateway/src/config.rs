//! Gateway configuration loading.
//!
//! TOML is the sole config source. The only environment override is
//! `SERVER_ID`; an empty or absent value derives an instance id from the
//! hostname plus a random suffix.
//!
//! # Required fields
//! - `tcp.addr`
//! - `database.dsn`
//!
//! Everything else has defaults tuned for a single-instance deployment.

use gw_protocol::Priority;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Stable per-instance id; owns session registrations in distributed mode.
    pub server_id: String,
    pub tcp: TcpConfig,
    pub limiting: LimitingConfig,
    pub protocols: ProtocolsConfig,
    pub session: SessionConfig,
    pub outbound: OutboundConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub push: PushConfig,
    pub status_http: StatusHttpConfig,
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub addr: String,
    /// Long-lived read deadline once the connection has identified itself.
    pub read_timeout: Duration,
    /// Identification deadline for the first bytes.
    pub ident_timeout: Duration,
    pub write_timeout: Duration,
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct LimitingConfig {
    pub enabled: bool,
    pub rate_per_second: f64,
    pub rate_burst: u32,
    pub breaker_threshold: u32,
    pub breaker_timeout: Duration,
    pub breaker_half_open_max: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProtocolsConfig {
    pub enable_a: bool,
    pub enable_b: bool,
    /// Optional TOML dictionary mapping Family B end-reason codes to labels.
    pub reason_map: HashMap<u8, String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_timeout: Duration,
    pub weighted: WeightedPolicyConfig,
}

#[derive(Debug, Clone)]
pub struct WeightedPolicyConfig {
    pub enabled: bool,
    pub tcp_down_window: Duration,
    pub ack_window: Duration,
    pub tcp_down_penalty: f64,
    pub ack_timeout_penalty: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Pause between sends within one worker tick.
    pub throttle: Duration,
    pub retry_max: u32,
    pub dead_retention_days: u32,
    pub batch_size: i64,
    pub tick: Duration,
    /// Default ACK deadline for a sent row.
    pub ack_timeout_sec: u32,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub dsn: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub auto_migrate: bool,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub enabled: bool,
    pub addr: String,
    pub password: String,
    pub db: i64,
    pub pool_size: u32,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub webhook_url: String,
    pub secret: String,
    pub api_key: String,
    pub enable_queue: bool,
    pub enable_dedup: bool,
    pub dedup_ttl: Duration,
    pub worker_count: usize,
    /// Whether session lifecycle events are pushed at all. Settlement on a
    /// still-charging end status is the business plane's call, not ours.
    pub push_session_events: bool,
}

#[derive(Debug, Clone)]
pub struct StatusHttpConfig {
    pub bind: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server_id: Option<String>,
    tcp: Option<RawTcpConfig>,
    protocols: Option<RawProtocolsConfig>,
    session: Option<RawSessionConfig>,
    gateway: Option<RawOutboundConfig>,
    database: Option<RawDatabaseConfig>,
    redis: Option<RawRedisConfig>,
    thirdparty: Option<RawThirdPartyConfig>,
    status_http: Option<RawStatusHttpConfig>,
}

#[derive(Debug, Deserialize)]
struct RawTcpConfig {
    addr: Option<String>,
    read_timeout_sec: Option<u64>,
    ident_timeout_sec: Option<u64>,
    write_timeout_sec: Option<u64>,
    max_connections: Option<usize>,
    limiting: Option<RawLimitingConfig>,
}

#[derive(Debug, Deserialize)]
struct RawLimitingConfig {
    enabled: Option<bool>,
    rate_per_second: Option<f64>,
    rate_burst: Option<u32>,
    breaker_threshold: Option<u32>,
    breaker_timeout_ms: Option<u64>,
    breaker_half_open_max: Option<u32>,
    acquire_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawProtocolsConfig {
    enable_a: Option<bool>,
    enable_b: Option<bool>,
    #[serde(rename = "B")]
    b: Option<RawFamilyBConfig>,
}

#[derive(Debug, Deserialize)]
struct RawFamilyBConfig {
    reason_map_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSessionConfig {
    heartbeat_timeout_sec: Option<u64>,
    weighted_enabled: Option<bool>,
    tcp_down_window_sec: Option<u64>,
    ack_window_sec: Option<u64>,
    tcp_down_penalty: Option<f64>,
    ack_timeout_penalty: Option<f64>,
    threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawOutboundConfig {
    throttle_ms: Option<u64>,
    retry_max: Option<u32>,
    dead_retention_days: Option<u32>,
    batch_size: Option<i64>,
    tick_ms: Option<u64>,
    ack_timeout_sec: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawDatabaseConfig {
    dsn: Option<String>,
    max_open_conns: Option<u32>,
    max_idle_conns: Option<u32>,
    conn_max_lifetime_sec: Option<u64>,
    auto_migrate: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawRedisConfig {
    enabled: Option<bool>,
    addr: Option<String>,
    password: Option<String>,
    db: Option<i64>,
    pool_size: Option<u32>,
    dial_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawThirdPartyConfig {
    push: Option<RawPushConfig>,
}

#[derive(Debug, Deserialize)]
struct RawPushConfig {
    webhook_url: Option<String>,
    secret: Option<String>,
    api_key: Option<String>,
    enable_queue: Option<bool>,
    enable_dedup: Option<bool>,
    dedup_ttl_sec: Option<u64>,
    worker_count: Option<usize>,
    push_session_events: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawStatusHttpConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReasonMap {
    reasons: Option<HashMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a file path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_tcp = raw
        .tcp
        .ok_or_else(|| ConfigError::MissingField("tcp".to_owned()))?;
    let addr = raw_tcp
        .addr
        .ok_or_else(|| ConfigError::MissingField("tcp.addr".to_owned()))?;
    let ident_timeout_sec = raw_tcp.ident_timeout_sec.unwrap_or(5);
    if ident_timeout_sec > 5 {
        return Err(ConfigError::InvalidValue(
            "tcp.ident_timeout_sec must be at most 5".to_owned(),
        ));
    }
    let tcp = TcpConfig {
        addr,
        read_timeout: Duration::from_secs(raw_tcp.read_timeout_sec.unwrap_or(300)),
        ident_timeout: Duration::from_secs(ident_timeout_sec),
        write_timeout: Duration::from_secs(raw_tcp.write_timeout_sec.unwrap_or(10)),
        max_connections: raw_tcp.max_connections.unwrap_or(10_000),
    };

    let limiting = match raw_tcp.limiting {
        Some(l) => LimitingConfig {
            enabled: l.enabled.unwrap_or(true),
            rate_per_second: l.rate_per_second.unwrap_or(100.0),
            rate_burst: l.rate_burst.unwrap_or(200),
            breaker_threshold: l.breaker_threshold.unwrap_or(5),
            breaker_timeout: Duration::from_millis(l.breaker_timeout_ms.unwrap_or(30_000)),
            breaker_half_open_max: l.breaker_half_open_max.unwrap_or(4),
            acquire_timeout: Duration::from_millis(l.acquire_timeout_ms.unwrap_or(1_000)),
        },
        None => LimitingConfig {
            enabled: true,
            rate_per_second: 100.0,
            rate_burst: 200,
            breaker_threshold: 5,
            breaker_timeout: Duration::from_millis(30_000),
            breaker_half_open_max: 4,
            acquire_timeout: Duration::from_millis(1_000),
        },
    };

    let protocols = match raw.protocols {
        Some(p) => {
            let reason_map = match p.b.and_then(|b| b.reason_map_path) {
                Some(path) => load_reason_map(Path::new(&path))?,
                None => HashMap::new(),
            };
            ProtocolsConfig {
                enable_a: p.enable_a.unwrap_or(true),
                enable_b: p.enable_b.unwrap_or(true),
                reason_map,
            }
        }
        None => ProtocolsConfig {
            enable_a: true,
            enable_b: true,
            reason_map: HashMap::new(),
        },
    };
    if !protocols.enable_a && !protocols.enable_b {
        return Err(ConfigError::InvalidValue(
            "at least one protocol family must be enabled".to_owned(),
        ));
    }

    let session = match raw.session {
        Some(s) => SessionConfig {
            heartbeat_timeout: Duration::from_secs(s.heartbeat_timeout_sec.unwrap_or(60)),
            weighted: WeightedPolicyConfig {
                enabled: s.weighted_enabled.unwrap_or(false),
                tcp_down_window: Duration::from_secs(s.tcp_down_window_sec.unwrap_or(30)),
                ack_window: Duration::from_secs(s.ack_window_sec.unwrap_or(30)),
                tcp_down_penalty: s.tcp_down_penalty.unwrap_or(0.5),
                ack_timeout_penalty: s.ack_timeout_penalty.unwrap_or(0.5),
                threshold: s.threshold.unwrap_or(0.8),
            },
        },
        None => SessionConfig {
            heartbeat_timeout: Duration::from_secs(60),
            weighted: WeightedPolicyConfig {
                enabled: false,
                tcp_down_window: Duration::from_secs(30),
                ack_window: Duration::from_secs(30),
                tcp_down_penalty: 0.5,
                ack_timeout_penalty: 0.5,
                threshold: 0.8,
            },
        },
    };

    let outbound = match raw.gateway {
        Some(g) => OutboundConfig {
            throttle: Duration::from_millis(g.throttle_ms.unwrap_or(500)),
            retry_max: g.retry_max.unwrap_or(3),
            dead_retention_days: g.dead_retention_days.unwrap_or(7),
            batch_size: g.batch_size.unwrap_or(20),
            tick: Duration::from_millis(g.tick_ms.unwrap_or(1_000)),
            ack_timeout_sec: g.ack_timeout_sec.unwrap_or(30),
        },
        None => OutboundConfig {
            throttle: Duration::from_millis(500),
            retry_max: 3,
            dead_retention_days: 7,
            batch_size: 20,
            tick: Duration::from_millis(1_000),
            ack_timeout_sec: 30,
        },
    };

    let raw_db = raw
        .database
        .ok_or_else(|| ConfigError::MissingField("database".to_owned()))?;
    let database = DatabaseConfig {
        dsn: raw_db
            .dsn
            .ok_or_else(|| ConfigError::MissingField("database.dsn".to_owned()))?,
        max_open_conns: raw_db.max_open_conns.unwrap_or(10),
        max_idle_conns: raw_db.max_idle_conns.unwrap_or(2),
        conn_max_lifetime: Duration::from_secs(raw_db.conn_max_lifetime_sec.unwrap_or(1800)),
        auto_migrate: raw_db.auto_migrate.unwrap_or(true),
    };

    let redis = match raw.redis {
        Some(r) => RedisConfig {
            enabled: r.enabled.unwrap_or(false),
            addr: r.addr.unwrap_or_else(|| "127.0.0.1:6379".to_owned()),
            password: r.password.unwrap_or_default(),
            db: r.db.unwrap_or(0),
            pool_size: r.pool_size.unwrap_or(8),
            dial_timeout: Duration::from_millis(r.dial_timeout_ms.unwrap_or(3_000)),
            read_timeout: Duration::from_millis(r.read_timeout_ms.unwrap_or(2_000)),
            write_timeout: Duration::from_millis(r.write_timeout_ms.unwrap_or(2_000)),
        },
        None => RedisConfig {
            enabled: false,
            addr: "127.0.0.1:6379".to_owned(),
            password: String::new(),
            db: 0,
            pool_size: 8,
            dial_timeout: Duration::from_millis(3_000),
            read_timeout: Duration::from_millis(2_000),
            write_timeout: Duration::from_millis(2_000),
        },
    };

    let push = match raw.thirdparty.and_then(|t| t.push) {
        Some(p) => PushConfig {
            webhook_url: p.webhook_url.unwrap_or_default(),
            secret: p.secret.unwrap_or_default(),
            api_key: p.api_key.unwrap_or_default(),
            enable_queue: p.enable_queue.unwrap_or(true),
            enable_dedup: p.enable_dedup.unwrap_or(false),
            dedup_ttl: Duration::from_secs(p.dedup_ttl_sec.unwrap_or(60)),
            worker_count: p.worker_count.unwrap_or(2),
            push_session_events: p.push_session_events.unwrap_or(true),
        },
        None => PushConfig {
            webhook_url: String::new(),
            secret: String::new(),
            api_key: String::new(),
            enable_queue: true,
            enable_dedup: false,
            dedup_ttl: Duration::from_secs(60),
            worker_count: 2,
            push_session_events: true,
        },
    };

    let status_http = StatusHttpConfig {
        bind: raw
            .status_http
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
    };

    let server_id = resolve_server_id(raw.server_id);

    Ok(GatewayConfig {
        server_id,
        tcp,
        limiting,
        protocols,
        session,
        outbound,
        database,
        redis,
        push,
        status_http,
    })
}

/// Load the Family B reason-code dictionary: a TOML table of
/// `"<code>" = "<label>"` under `[reasons]`.
pub fn load_reason_map(path: &Path) -> Result<HashMap<u8, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(format!("reading reason map '{}': {}", path.display(), e))
    })?;
    let raw: RawReasonMap =
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut map = HashMap::new();
    for (code, label) in raw.reasons.unwrap_or_default() {
        let code: u8 = code.parse().map_err(|_| {
            ConfigError::InvalidValue(format!("reason code '{}' is not a u8", code))
        })?;
        map.insert(code, label);
    }
    Ok(map)
}

/// `SERVER_ID` env wins, then the config file, then hostname + random suffix.
fn resolve_server_id(from_config: Option<String>) -> String {
    match std::env::var("SERVER_ID") {
        Ok(v) if !v.trim().is_empty() => return v.trim().to_owned(),
        _ => {}
    }
    if let Some(id) = from_config {
        if !id.trim().is_empty() {
            return id.trim().to_owned();
        }
    }
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "gw".to_owned());
    let suffix: u32 = rand::random::<u32>() & 0x00FF_FFFF;
    format!("{}-{:06x}", host, suffix)
}

/// Sanity floor from the reference deployment: the heartbeat timeout must be
/// at least twice the device cadence (30 s) or jitter produces false
/// offline decisions.
pub fn validate_heartbeat_timeout(cfg: &SessionConfig) -> Result<(), ConfigError> {
    if cfg.heartbeat_timeout < Duration::from_secs(60) {
        return Err(ConfigError::InvalidValue(
            "session.heartbeat_timeout_sec must be at least 60 (2x device cadence)".to_owned(),
        ));
    }
    Ok(())
}

/// Priority assigned to an already-encoded wire cmd when re-enqueueing
/// without a `CoreCommand` (heartbeat replies and other adapter-originated
/// downlinks). Must agree with `CoreCommand::priority`.
pub fn priority_for_wire_cmd(cmd: u16) -> Priority {
    match cmd {
        // stop-charge on either family
        0x21 | 0x2002 => Priority::Emergency,
        // start-charge / status-query
        0x20 | 0x22 | 0x2001 => Priority::High,
        // heartbeat replies / parameter traffic
        0x01 | 0x0000 | 0x23 | 0x2003 | 0x2004 => Priority::Normal,
        // OTA
        0x3000 => Priority::Low,
        _ => Priority::Background,
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
