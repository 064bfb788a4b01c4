//! Approval state machine run inside keyboard-interactive authentication.
//!
//! One coordinator run per authentication attempt. The only state shared
//! with other runs (and with the approval actor) lives in the session store:
//!
//! | status on entry        | action                                          |
//! |------------------------|-------------------------------------------------|
//! | absent                 | prompt with the approval URL, mark pending, poll |
//! | `AwaitingApproval`     | poll without prompting again                     |
//! | `CredentialRejected`   | refuse immediately                               |
//! | `Failed` / `Approved`  | report the upstream failure once, then refuse    |
//!
//! Whatever happens, a terminal status is written when the run ends, including
//! when the run is dropped by the host mid-wait.

use crate::crypto;
use crate::error::{BrokerError, BrokerResult};
use crate::session::host::{ConnMetadata, Prompter};
use crate::session::status::SessionStatus;
use crate::session::store::{SessionStore, SharedSessionStore};
use crate::session::upstream::{split_host_port, Upstream, UpstreamAuth, UpstreamConfig};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Public URL of the approval front-end, used in the prompt
    pub base_url: String,
    /// Absolute bound on the wait, measured once at entry
    pub approval_timeout: Duration,
    /// Delay between store checks while waiting
    pub poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            approval_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl CoordinatorConfig {
    pub fn approval_url(&self, session: &str) -> String {
        format!("{}/pipe/{}", self.base_url.trim_end_matches('/'), session)
    }
}

/// Writes the run's final status when dropped.
struct StatusFinalizer<'a> {
    store: &'a SessionStore,
    session: &'a str,
    outcome: SessionStatus,
}

impl<'a> StatusFinalizer<'a> {
    fn new(store: &'a SessionStore, session: &'a str) -> Self {
        Self {
            store,
            session,
            outcome: SessionStatus::failed(BrokerError::Cancelled.to_string()),
        }
    }

    fn settle(&mut self, result: &BrokerResult<Upstream>) {
        self.outcome = match result {
            Ok(_) => SessionStatus::Approved,
            Err(BrokerError::BadUpstreamCredential) => SessionStatus::CredentialRejected,
            Err(e) => SessionStatus::failed(e.to_string()),
        };
    }
}

impl Drop for StatusFinalizer<'_> {
    fn drop(&mut self) {
        let outcome = std::mem::replace(&mut self.outcome, SessionStatus::Approved);
        self.store.set_status(self.session, outcome);
    }
}

/// Drives one connection through approval.
#[derive(Debug, Clone)]
pub struct ApprovalCoordinator {
    store: SharedSessionStore,
    config: CoordinatorConfig,
}

impl ApprovalCoordinator {
    pub fn new(store: SharedSessionStore, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Block until the session is approved and resolved, refused, timed out,
    /// or `cancel` fires because the inbound connection went away.
    pub async fn authenticate(
        &self,
        conn: &dyn ConnMetadata,
        prompter: &dyn Prompter,
        cancel: &CancellationToken,
    ) -> BrokerResult<Upstream> {
        let session = conn.unique_id();
        let mut finalizer = StatusFinalizer::new(&self.store, &session);

        let result = self.run(&session, conn, prompter, cancel).await;
        match &result {
            Ok(upstream) => info!(
                session = %session,
                host = %upstream.host,
                port = upstream.port,
                method = upstream.auth.method(),
                "Session approved"
            ),
            Err(e) => warn!(session = %session, error = %e, "Session not approved"),
        }

        finalizer.settle(&result);
        result
    }

    async fn run(
        &self,
        session: &str,
        conn: &dyn ConnMetadata,
        prompter: &dyn Prompter,
        cancel: &CancellationToken,
    ) -> BrokerResult<Upstream> {
        let deadline = Instant::now() + self.config.approval_timeout;

        match self.store.get_status(session) {
            None => {
                debug!(session, "New session, requesting approval");
                notify(
                    prompter,
                    &format!(
                        "please open {} with your browser to verify (timeout {}s)",
                        self.config.approval_url(session),
                        self.config.approval_timeout.as_secs()
                    ),
                )
                .await;
                self.store.set_status(session, SessionStatus::AwaitingApproval);
            }
            Some(SessionStatus::AwaitingApproval) => {
                debug!(session, "Approval already requested, waiting");
            }
            Some(SessionStatus::CredentialRejected) => {
                debug!(session, "Upstream failure already reported, refusing retry");
                return Err(BrokerError::BadUpstreamCredential);
            }
            Some(previous) => {
                let reason = match &previous {
                    SessionStatus::Failed(text) => text.as_str(),
                    _ => "credential was rejected after approval",
                };
                notify(
                    prompter,
                    &format!("your password/private key auth failed with upstream: {}", reason),
                )
                .await;
                self.store.set_status(session, SessionStatus::CredentialRejected);
                return Err(BrokerError::BadUpstreamCredential);
            }
        }

        let target = self.wait_for_target(session, deadline, cancel).await?;
        self.resolve(session, target, conn, prompter).await
    }

    async fn wait_for_target(
        &self,
        session: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> BrokerResult<UpstreamConfig> {
        loop {
            if let Some(target) = self.store.get_target(session) {
                return Ok(target);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::Timeout);
            }

            let wake = (now + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = sleep_until(wake) => {}
            }
        }
    }

    async fn resolve(
        &self,
        session: &str,
        target: UpstreamConfig,
        conn: &dyn ConnMetadata,
        prompter: &dyn Prompter,
    ) -> BrokerResult<Upstream> {
        let key = self
            .store
            .get_secret(session)
            .ok_or(BrokerError::SecretExpired)?;

        let (host, port) = split_host_port(&target.host)?;

        let password = Zeroizing::new(crypto::open(&target.password, &key)?);
        let private_key = Zeroizing::new(crypto::open(&target.private_key_data, &key)?);

        let username = if target.username.is_empty() {
            conn.user()
        } else {
            target.username.clone()
        };

        let auth = if !private_key.is_empty() {
            let der = BASE64
                .decode(private_key.trim())
                .map_err(|_| BrokerError::invalid_upstream("private key data is not valid base64"))?;
            UpstreamAuth::PrivateKey(Zeroizing::new(der))
        } else if !password.is_empty() {
            UpstreamAuth::Password(password)
        } else {
            UpstreamAuth::None
        };

        notify(
            prompter,
            &format!("piping to {}@{} with {}", username, target.host, auth.method()),
        )
        .await;

        Ok(Upstream {
            host,
            port,
            username,
            auth,
            ignore_host_key: target.known_hosts_data.is_empty(),
        })
    }
}

async fn notify(prompter: &dyn Prompter, message: &str) {
    if let Err(e) = prompter.prompt(message).await {
        debug!(error = %e, "Prompt not delivered");
    }
}
