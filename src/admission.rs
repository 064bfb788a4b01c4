//! Per-source connection admission.
//!
//! A token bucket per source identity (the remote IP). Each new inbound
//! connection takes one token; a pipe that fails after resolution is credited
//! a token back so the user can retry without waiting for the refill.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Admission gate interface consulted by the connection host.
pub trait AdmissionGate: Send + Sync {
    /// Consume one token for `source`; false when the source is over its budget
    fn take(&self, source: &str) -> bool;

    /// Grant `source` extra tokens, allowed to exceed the bucket size
    fn credit(&self, source: &str, tokens: u32);
}

/// Individual bucket state for a source
#[derive(Debug, Clone)]
struct BucketState {
    /// Current number of tokens
    tokens: f64,
    /// Last time tokens were updated
    last_update: Instant,
}

/// Token bucket rate limiter with per-source tracking
#[derive(Debug)]
pub struct TokenBucket {
    /// Bucket size and tokens added per `interval`
    tokens: u32,
    interval: Duration,
    /// Idle buckets older than this are dropped by `cleanup_expired`
    sweep_min_ttl: Duration,
    buckets: DashMap<String, BucketState>,
}

impl TokenBucket {
    pub fn new(tokens: u32, interval: Duration, sweep_min_ttl: Duration) -> Self {
        Self {
            tokens: tokens.max(1),
            interval: if interval.is_zero() {
                Duration::from_secs(1)
            } else {
                interval
            },
            sweep_min_ttl,
            buckets: DashMap::new(),
        }
    }

    fn refill_rate(&self) -> f64 {
        self.tokens as f64 / self.interval.as_secs_f64()
    }

    /// Refill based on elapsed time; credited surplus above the bucket size is kept.
    fn refill(&self, state: &mut BucketState, now: Instant) {
        let max = self.tokens as f64;
        if state.tokens < max {
            let elapsed = now.duration_since(state.last_update).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.refill_rate()).min(max);
        }
        state.last_update = now;
    }

    fn fresh(&self, now: Instant) -> BucketState {
        BucketState {
            tokens: self.tokens as f64,
            last_update: now,
        }
    }

    /// Tokens currently available to `source`, rounded down.
    pub fn available(&self, source: &str) -> u32 {
        let now = Instant::now();
        match self.buckets.get_mut(source) {
            Some(mut state) => {
                self.refill(&mut state, now);
                state.tokens.floor() as u32
            }
            None => self.tokens,
        }
    }

    /// Drop buckets that have been idle long enough to be full again anyway.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now.duration_since(state.last_update) < self.sweep_min_ttl);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl AdmissionGate for TokenBucket {
    fn take(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut state = self
            .buckets
            .entry(source.to_string())
            .or_insert_with(|| self.fresh(now));
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            warn!(source, "Connection refused, admission budget exhausted");
            false
        }
    }

    fn credit(&self, source: &str, tokens: u32) {
        let now = Instant::now();
        let mut state = self
            .buckets
            .entry(source.to_string())
            .or_insert_with(|| self.fresh(now));
        self.refill(&mut state, now);
        state.tokens += tokens as f64;
        debug!(source, tokens, "Credited admission tokens");
    }
}

/// Shared admission gate handle.
pub type SharedTokenBucket = Arc<TokenBucket>;

/// Spawn the periodic idle-bucket cleanup. It stops when `shutdown` is cancelled.
pub fn spawn_cleanup(
    bucket: SharedTokenBucket,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = bucket.cleanup_expired();
                    if removed > 0 {
                        debug!(removed, "Dropped idle admission buckets");
                    }
                }
            }
        }
    })
}

/// Source identity for admission: the IP part of `ip:port`.
pub fn source_identity(remote_addr: &str) -> &str {
    if let Some(rest) = remote_addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match remote_addr.rsplit_once(':') {
        Some((ip, port)) if !ip.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => ip,
        _ => remote_addr,
    }
}
