use crate::admission::{source_identity, AdmissionGate};
use crate::error::{BrokerError, BrokerResult};
use crate::pipe::known_hosts::verify_host_key;
use crate::session::{
    ApprovalCoordinator, ConnMetadata, Prompter, SessionStatus, SharedSessionStore, Upstream,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle callbacks registered with the connection host.
///
/// Every callback is keyed by the connection's unique id, which doubles as
/// the session id in the store.
#[derive(Clone)]
pub struct PipeHooks {
    store: SharedSessionStore,
    coordinator: ApprovalCoordinator,
    admission: Arc<dyn AdmissionGate>,
}

impl PipeHooks {
    pub fn new(
        store: SharedSessionStore,
        coordinator: ApprovalCoordinator,
        admission: Arc<dyn AdmissionGate>,
    ) -> Self {
        Self {
            store,
            coordinator,
            admission,
        }
    }

    /// Gate a freshly accepted inbound connection.
    pub fn on_new_connection(&self, conn: &dyn ConnMetadata) -> BrokerResult<()> {
        let remote = conn.remote_addr();
        if self.admission.take(source_identity(&remote)) {
            debug!(session = %conn.unique_id(), remote = %remote, "Connection admitted");
            Ok(())
        } else {
            Err(BrokerError::TooManyConnections)
        }
    }

    /// Keyboard-interactive authentication: wait for out-of-band approval.
    pub async fn on_keyboard_interactive(
        &self,
        conn: &dyn ConnMetadata,
        prompter: &dyn Prompter,
        cancel: &CancellationToken,
    ) -> BrokerResult<Upstream> {
        self.coordinator.authenticate(conn, prompter, cancel).await
    }

    /// The upstream refused the credential we resolved. Record why, so the
    /// next attempt on this connection reports it instead of prompting anew.
    pub fn on_upstream_auth_failure(&self, conn: &dyn ConnMetadata, method: &str, err: &str) {
        let session = conn.unique_id();
        warn!(session = %session, method, error = err, "Upstream authentication failed");
        self.store.set_status(&session, SessionStatus::failed(err));
        self.store.delete_session(&session, true);
    }

    pub fn on_pipe_start(&self, conn: &dyn ConnMetadata) {
        let session = conn.unique_id();
        info!(session = %session, "Pipe started");
        self.store.set_status(&session, SessionStatus::Approved);
        self.store.delete_session(&session, true);
    }

    /// Pipe broke after resolution: forget the session and refund an attempt.
    pub fn on_pipe_error(&self, conn: &dyn ConnMetadata, err: &str) {
        let session = conn.unique_id();
        let remote = conn.remote_addr();
        warn!(session = %session, error = err, "Pipe error");
        self.store.delete_session(&session, false);
        self.admission.credit(source_identity(&remote), 1);
    }

    /// Check the upstream's host key against the session's known_hosts data.
    pub fn verify_host_key(
        &self,
        conn: &dyn ConnMetadata,
        hostname: &str,
        netaddr: &str,
        key: &[u8],
    ) -> BrokerResult<()> {
        let session = conn.unique_id();
        let target = self
            .store
            .get_target(&session)
            .ok_or(BrokerError::ConnectionExpired)?;

        if target.known_hosts_data.is_empty() {
            return Ok(());
        }

        verify_host_key(&target.known_hosts_data, hostname, netaddr, key)
    }
}

impl std::fmt::Debug for PipeHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeHooks")
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::TokenBucket;
    use crate::crypto::generate_key;
    use crate::session::{create_session_store, CoordinatorConfig, UpstreamConfig};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use std::time::Duration;

    struct TestConn;

    impl ConnMetadata for TestConn {
        fn unique_id(&self) -> String {
            "conn-1".to_string()
        }
        fn user(&self) -> String {
            "alice".to_string()
        }
        fn remote_addr(&self) -> String {
            "198.51.100.4:40000".to_string()
        }
    }

    fn hooks() -> (SharedSessionStore, Arc<TokenBucket>, PipeHooks) {
        let store = create_session_store(Duration::from_secs(60));
        let bucket = Arc::new(TokenBucket::new(
            1,
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let coordinator = ApprovalCoordinator::new(store.clone(), CoordinatorConfig::default());
        let hooks = PipeHooks::new(store.clone(), coordinator, bucket.clone());
        (store, bucket, hooks)
    }

    fn seed(store: &SharedSessionStore, known_hosts_data: &str) {
        store.set_secret("conn-1", generate_key().unwrap());
        store.set_target(
            "conn-1",
            UpstreamConfig {
                host: "h".to_string(),
                known_hosts_data: known_hosts_data.to_string(),
                ..Default::default()
            },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_and_pipe_error_credit() {
        let (store, bucket, hooks) = hooks();
        assert!(hooks.on_new_connection(&TestConn).is_ok());
        assert!(matches!(
            hooks.on_new_connection(&TestConn),
            Err(BrokerError::TooManyConnections)
        ));

        seed(&store, "");
        store.set_status("conn-1", SessionStatus::Approved);
        hooks.on_pipe_error(&TestConn, "connection reset");

        assert!(store.get_secret("conn-1").is_none());
        assert!(store.get_target("conn-1").is_none());
        assert!(store.get_status("conn-1").is_none());
        assert_eq!(bucket.available("198.51.100.4"), 1);
        assert!(hooks.on_new_connection(&TestConn).is_ok());
    }

    #[tokio::test]
    async fn test_pipe_start_keeps_status() {
        let (store, _, hooks) = hooks();
        seed(&store, "");
        hooks.on_pipe_start(&TestConn);

        assert!(store.get_secret("conn-1").is_none());
        assert!(store.get_target("conn-1").is_none());
        assert_eq!(store.get_status("conn-1"), Some(SessionStatus::Approved));
    }

    #[tokio::test]
    async fn test_upstream_auth_failure_records_error() {
        let (store, _, hooks) = hooks();
        seed(&store, "");
        hooks.on_upstream_auth_failure(&TestConn, "password", "ssh: handshake failed");

        assert!(store.get_target("conn-1").is_none());
        assert_eq!(
            store.get_status("conn-1"),
            Some(SessionStatus::failed("ssh: handshake failed"))
        );
    }

    #[tokio::test]
    async fn test_verify_host_key() {
        let (store, _, hooks) = hooks();
        assert!(matches!(
            hooks.verify_host_key(&TestConn, "h:22", "10.0.0.1:22", b"key"),
            Err(BrokerError::ConnectionExpired)
        ));

        seed(&store, "");
        assert!(hooks.verify_host_key(&TestConn, "h:22", "10.0.0.1:22", b"key").is_ok());

        let line = format!("h ssh-ed25519 {}", BASE64.encode(b"key"));
        seed(&store, &BASE64.encode(line));
        assert!(hooks.verify_host_key(&TestConn, "h:22", "10.0.0.1:22", b"key").is_ok());
        assert!(hooks.verify_host_key(&TestConn, "h:22", "10.0.0.1:22", b"other").is_err());
    }
}
