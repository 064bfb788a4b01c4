//! Ephemeral in-memory session store.
//!
//! Three independent fields are kept per session: the ephemeral key, the
//! deposited upstream config and the status marker. Every entry carries its
//! own expiry, refreshed on write, and a background sweep reclaims lapsed
//! entries. Reads never return an expired entry even before it is swept.

use crate::crypto::EphemeralKey;
use crate::session::status::SessionStatus;
use crate::session::upstream::UpstreamConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// One field-kind across all sessions.
struct FieldMap<T> {
    entries: DashMap<String, Expiring<T>>,
}

impl<T: Clone> FieldMap<T> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn get(&self, session: &str) -> Option<T> {
        let entry = self.entries.get(session)?;
        if entry.is_expired(Instant::now()) {
            drop(entry);
            // Only drop it if nobody refreshed it in between
            self.entries
                .remove_if(session, |_, e| e.is_expired(Instant::now()));
            None
        } else {
            Some(entry.value.clone())
        }
    }

    fn set(&self, session: &str, value: T, ttl: Duration) {
        self.entries.insert(
            session.to_string(),
            Expiring {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn remove(&self, session: &str) {
        self.entries.remove(session);
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Session store shared by the coordinator, pipe hooks and approval actor.
pub struct SessionStore {
    secrets: FieldMap<EphemeralKey>,
    targets: FieldMap<UpstreamConfig>,
    statuses: FieldMap<SessionStatus>,
    ttl: Duration,
}

impl SessionStore {
    /// Create an empty store whose entries live `ttl` past their last write.
    pub fn new(ttl: Duration) -> Self {
        Self {
            secrets: FieldMap::new(),
            targets: FieldMap::new(),
            statuses: FieldMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get_secret(&self, session: &str) -> Option<EphemeralKey> {
        self.secrets.get(session)
    }

    pub fn set_secret(&self, session: &str, key: EphemeralKey) {
        trace!(session, "Storing session secret");
        self.secrets.set(session, key, self.ttl);
    }

    pub fn get_target(&self, session: &str) -> Option<UpstreamConfig> {
        self.targets.get(session)
    }

    pub fn set_target(&self, session: &str, target: UpstreamConfig) {
        trace!(session, host = %target.host, "Storing session target");
        self.targets.set(session, target, self.ttl);
    }

    /// `None` means no approval activity has been recorded (or it expired).
    pub fn get_status(&self, session: &str) -> Option<SessionStatus> {
        self.statuses.get(session)
    }

    pub fn set_status(&self, session: &str, status: SessionStatus) {
        trace!(session, %status, "Storing session status");
        self.statuses.set(session, status, self.ttl);
    }

    /// Drop the key and target; the status survives when `keep_status` is set.
    pub fn delete_session(&self, session: &str, keep_status: bool) {
        self.secrets.remove(session);
        self.targets.remove(session);
        if !keep_status {
            self.statuses.remove(session);
        }
    }

    /// Remove every lapsed entry, returning how many were reclaimed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        self.secrets.evict_expired(now)
            + self.targets.evict_expired(now)
            + self.statuses.evict_expired(now)
    }

    /// Total live-or-unswept entries across all fields.
    pub fn len(&self) -> usize {
        self.secrets.len() + self.targets.len() + self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .field("secrets", &self.secrets.len())
            .field("targets", &self.targets.len())
            .field("statuses", &self.statuses.len())
            .finish()
    }
}

/// Shared session store handle.
pub type SharedSessionStore = Arc<SessionStore>;

/// Create a new shared session store.
pub fn create_session_store(ttl: Duration) -> SharedSessionStore {
    Arc::new(SessionStore::new(ttl))
}

/// Spawn the periodic eviction pass. It stops when `shutdown` is cancelled.
pub fn spawn_sweeper(
    store: SharedSessionStore,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Session sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = store.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "Swept expired session entries");
                    }
                }
            }
        }
    })
}
