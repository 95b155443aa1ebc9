//! Admission control at the gateway boundary.
//!
//! Three independent gates run in front of every accepted socket: a
//! connection-count semaphore, a non-blocking token bucket, and a
//! three-state circuit breaker guarding the protocol hand-off. Each denial
//! closes the socket immediately and increments a counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

// ---------------------------------------------------------------------------
// Connection limiter
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("connection limit reached")]
    LimitSaturated,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("circuit breaker open")]
    BreakerOpen,
}

/// Semaphore cap on concurrently served connections. The permit must be
/// held for the whole connection lifetime and dropped on every exit path.
pub struct ConnLimiter {
    sem: Arc<Semaphore>,
    acquire_timeout: Duration,
    active: AtomicU64,
    rejected: AtomicU64,
}

impl ConnLimiter {
    pub fn new(max_connections: usize, acquire_timeout: Duration) -> Arc<ConnLimiter> {
        Arc::new(ConnLimiter {
            sem: Arc::new(Semaphore::new(max_connections)),
            acquire_timeout,
            active: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<ConnPermit, AdmissionError> {
        match tokio::time::timeout(self.acquire_timeout, self.sem.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                Ok(ConnPermit {
                    _permit: permit,
                    limiter: self.clone(),
                })
            }
            _ => {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                Err(AdmissionError::LimitSaturated)
            }
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// RAII permit; releasing is infallible and runs on every exit path.
pub struct ConnPermit {
    _permit: OwnedSemaphorePermit,
    limiter: Arc<ConnLimiter>,
}

impl Drop for ConnPermit {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Token-bucket rate limiter
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Non-blocking accept-rate limiter.
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    state: Mutex<BucketState>,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64, burst: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter {
            rate_per_second,
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            self.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn allowed_count(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probes: u32,
    half_open_successes: u32,
}

type TransitionHook = Box<dyn Fn(BreakerState, BreakerState) + Send + Sync>;

/// Three-state breaker guarding the protocol hand-off.
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    half_open_max: u32,
    inner: Mutex<BreakerInner>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration, half_open_max: u32) -> CircuitBreaker {
        CircuitBreaker {
            threshold,
            timeout,
            half_open_max: half_open_max.max(1),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_probes: 0,
                half_open_successes: 0,
            }),
            on_transition: None,
        }
    }

    pub fn with_transition_hook(
        mut self,
        hook: impl Fn(BreakerState, BreakerState) + Send + Sync + 'static,
    ) -> CircuitBreaker {
        self.on_transition = Some(Box::new(hook));
        self
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => inner.opened_at = Some(Instant::now()),
            BreakerState::HalfOpen => {
                inner.half_open_probes = 0;
                inner.half_open_successes = 0;
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
        }
        info!(from = from.as_str(), to = to.as_str(), "circuit breaker transition");
        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }

    /// Whether a call may proceed right now. Open flips to half-open once
    /// the cool-down has elapsed; half-open admits a bounded probe set.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.timeout);
                if cooled {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_probes = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes < self.half_open_max {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes * 2 >= self.half_open_max {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            // Any failure while probing trips straight back open.
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open),
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
