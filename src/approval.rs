//! The deposit side of the session broker.
//!
//! The approval actor seals an upstream's secrets under a fresh session key,
//! writes both into the store, then watches the session status until the
//! waiting coordinator (or the pipe hooks after it) leaves a terminal outcome.

use crate::crypto::{self, EphemeralKey};
use crate::error::BrokerResult;
use crate::session::{SessionStatus, SharedSessionStore, UpstreamConfig};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// What the approving user should be told.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected(String),
    /// The session status lapsed before any outcome was written
    Expired,
}

/// Approval actor bound to one session store.
#[derive(Debug, Clone)]
pub struct ApprovalActor {
    store: SharedSessionStore,
    outcome_poll_interval: Duration,
}

impl ApprovalActor {
    pub fn new(store: SharedSessionStore, outcome_poll_interval: Duration) -> Self {
        Self {
            store,
            outcome_poll_interval,
        }
    }

    /// Generate a session key and seal every upstream's password and private key.
    pub fn seal_upstreams(
        upstreams: Vec<UpstreamConfig>,
    ) -> BrokerResult<(EphemeralKey, Vec<UpstreamConfig>)> {
        let key = crypto::generate_key()?;
        let sealed = upstreams
            .into_iter()
            .map(|mut upstream| -> BrokerResult<UpstreamConfig> {
                upstream.password = crypto::seal(&upstream.password, &key)?;
                upstream.private_key_data = crypto::seal(&upstream.private_key_data, &key)?;
                Ok(upstream)
            })
            .collect::<BrokerResult<Vec<_>>>()?;
        Ok((key, sealed))
    }

    /// Hand a sealed upstream and its key to the session waiting on them.
    pub fn deposit(&self, session: &str, key: EphemeralKey, upstream: UpstreamConfig) {
        info!(session, host = %upstream.host, repo = %upstream.repo, "Depositing approved upstream");
        self.store.set_secret(session, key);
        self.store.set_target(session, upstream);
    }

    /// Seal a single plaintext upstream under a fresh key and deposit it.
    pub fn approve(&self, session: &str, upstream: UpstreamConfig) -> BrokerResult<()> {
        let (key, mut sealed) = Self::seal_upstreams(vec![upstream])?;
        if let Some(upstream) = sealed.pop() {
            self.deposit(session, key, upstream);
        }
        Ok(())
    }

    /// Wait for the session to leave the pending state.
    pub async fn await_outcome(&self, session: &str) -> ApprovalOutcome {
        loop {
            match self.store.get_status(session) {
                None => return ApprovalOutcome::Expired,
                Some(SessionStatus::AwaitingApproval) => {
                    debug!(session, "Waiting for connection to pick up approval");
                    tokio::time::sleep(self.outcome_poll_interval).await;
                }
                Some(SessionStatus::Approved) => return ApprovalOutcome::Approved,
                Some(other) => return ApprovalOutcome::Rejected(other.to_string()),
            }
        }
    }
}
