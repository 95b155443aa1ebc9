//! Webhook push collaborator.
//!
//! The business plane receives session and audit events as signed JSON
//! POSTs. Headers carry `{apiKey, signature, timestamp, nonce}` where the
//! signature is HMAC-SHA256 over `timestamp.nonce.body` with the shared
//! secret. Delivery is best-effort: a failed push is logged and counted,
//! never retried into the device path.

use crate::config::PushConfig;
use crate::metrics::Metrics;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// PushEvent
// ---------------------------------------------------------------------------

/// One event on its way to the business plane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PushEvent {
    pub kind: String,
    pub device_id: String,
    pub payload: serde_json::Value,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl PushEvent {
    pub fn new(kind: &str, device_id: &str, payload: serde_json::Value) -> PushEvent {
        PushEvent {
            kind: kind.to_owned(),
            device_id: device_id.to_owned(),
            payload,
            at: Utc::now(),
        }
    }

    /// Dedup key: same kind + device + payload within the TTL is one event.
    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.kind, self.device_id, self.payload)
    }
}

// ---------------------------------------------------------------------------
// EventPusher trait
// ---------------------------------------------------------------------------

/// Seam the driver core pushes through; tests plug in a recorder.
#[async_trait]
pub trait EventPusher: Send + Sync {
    async fn push(&self, event: PushEvent);
}

/// Disabled pusher (no webhook URL configured).
pub struct NoopPusher;

#[async_trait]
impl EventPusher for NoopPusher {
    async fn push(&self, event: PushEvent) {
        debug!(kind = %event.kind, device_id = %event.device_id, "push disabled, dropping event");
    }
}

// ---------------------------------------------------------------------------
// WebhookPusher
// ---------------------------------------------------------------------------

pub struct WebhookPusher {
    cfg: PushConfig,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
    queue_tx: Option<mpsc::Sender<PushEvent>>,
    dedup: Mutex<HashMap<String, Instant>>,
}

impl WebhookPusher {
    /// Build the pusher; when `enable_queue` is set, spawns `worker_count`
    /// delivery tasks draining a bounded channel.
    pub fn start(cfg: PushConfig, metrics: Arc<Metrics>) -> Arc<WebhookPusher> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let (queue_tx, queue_rx) = if cfg.enable_queue {
            let (tx, rx) = mpsc::channel::<PushEvent>(1024);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let pusher = Arc::new(WebhookPusher {
            cfg,
            client,
            metrics,
            queue_tx,
            dedup: Mutex::new(HashMap::new()),
        });

        if let Some(rx) = queue_rx {
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..pusher.cfg.worker_count.max(1) {
                let pusher = pusher.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let event = { rx.lock().await.recv().await };
                        match event {
                            Some(event) => pusher.deliver(&event).await,
                            None => break,
                        }
                    }
                });
            }
        }

        pusher
    }

    /// POST one event and record the outcome.
    async fn deliver(&self, event: &PushEvent) {
        match self.send_json(&self.cfg.webhook_url, event).await {
            Ok(status) if status < 300 => {
                self.metrics.push_total.with_label_values(&["ok"]).inc();
            }
            Ok(status) => {
                self.metrics.push_total.with_label_values(&["http_error"]).inc();
                warn!(kind = %event.kind, status, "webhook push rejected");
            }
            Err(e) => {
                self.metrics.push_total.with_label_values(&["error"]).inc();
                warn!(kind = %event.kind, error = %e, "webhook push failed");
            }
        }
    }

    /// Send signed JSON; returns the HTTP status.
    pub async fn send_json(
        &self,
        endpoint: &str,
        event: &PushEvent,
    ) -> Result<u16, PushError> {
        let body = serde_json::to_string(event).map_err(|e| PushError::Serialize(e.to_string()))?;
        let timestamp = Utc::now().timestamp().to_string();
        let nonce = uuid::Uuid::new_v4().to_string();
        let signature = sign(&self.cfg.secret, &timestamp, &nonce, &body);

        let response = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .header("X-Api-Key", &self.cfg.api_key)
            .header("X-Signature", signature)
            .header("X-Timestamp", timestamp)
            .header("X-Nonce", nonce)
            .body(body)
            .send()
            .await
            .map_err(|e| PushError::Http(e.to_string()))?;

        Ok(response.status().as_u16())
    }

    /// True when the event was already pushed inside the dedup TTL.
    async fn is_duplicate(&self, event: &PushEvent) -> bool {
        if !self.cfg.enable_dedup {
            return false;
        }
        let key = event.dedup_key();
        let mut dedup = self.dedup.lock().await;
        let now = Instant::now();
        dedup.retain(|_, seen| now.duration_since(*seen) < self.cfg.dedup_ttl);
        if dedup.contains_key(&key) {
            return true;
        }
        dedup.insert(key, now);
        false
    }
}

#[async_trait]
impl EventPusher for WebhookPusher {
    async fn push(&self, event: PushEvent) {
        if self.cfg.webhook_url.is_empty() {
            return;
        }
        if self.is_duplicate(&event).await {
            debug!(kind = %event.kind, device_id = %event.device_id, "duplicate push suppressed");
            return;
        }
        match &self.queue_tx {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    self.metrics.push_total.with_label_values(&["dropped"]).inc();
                }
            }
            None => self.deliver(&event).await,
        }
    }
}

/// HMAC-SHA256 over `timestamp.nonce.body`, hex-encoded.
pub fn sign(secret: &str, timestamp: &str, nonce: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(nonce.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("serialize: {0}")]
    Serialize(String),
    #[error("http: {0}")]
    Http(String),
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
