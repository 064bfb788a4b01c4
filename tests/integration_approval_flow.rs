//! End-to-end approval flow through the public API.
//!
//! The connection side runs the pipe hooks exactly as a host would; the
//! approval side deposits through `ApprovalActor` and waits for the outcome,
//! concurrently, sharing nothing but the session store.

use async_trait::async_trait;
use pipebridge::admission::TokenBucket;
use pipebridge::approval::{ApprovalActor, ApprovalOutcome};
use pipebridge::pipe::PipeHooks;
use pipebridge::session::{
    create_session_store, ApprovalCoordinator, ConnMetadata, CoordinatorConfig, HostError,
    PipeConfig, Prompter, SessionStatus, SharedSessionStore, UpstreamAuth,
};
use pipebridge::BrokerError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct MockConn {
    id: String,
    remote: String,
}

impl MockConn {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote: "192.0.2.10:50022".to_string(),
        }
    }
}

impl ConnMetadata for MockConn {
    fn unique_id(&self) -> String {
        self.id.clone()
    }
    fn user(&self) -> String {
        "octocat".to_string()
    }
    fn remote_addr(&self) -> String {
        self.remote.clone()
    }
}

/// Records prompts; optionally fails delivery to prove failures are ignored.
#[derive(Default)]
struct MockPrompter {
    messages: Mutex<Vec<String>>,
    broken: bool,
}

#[async_trait]
impl Prompter for MockPrompter {
    async fn prompt(&self, message: &str) -> Result<(), HostError> {
        self.messages.lock().unwrap().push(message.to_string());
        if self.broken {
            return Err("client went away".into());
        }
        Ok(())
    }
}

struct Harness {
    store: SharedSessionStore,
    hooks: PipeHooks,
    actor: ApprovalActor,
}

fn harness() -> Harness {
    let store = create_session_store(Duration::from_secs(60));
    let coordinator = ApprovalCoordinator::new(
        store.clone(),
        CoordinatorConfig {
            base_url: "https://pipe.example".to_string(),
            approval_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        },
    );
    let gate = Arc::new(TokenBucket::new(
        3,
        Duration::from_secs(60),
        Duration::from_secs(300),
    ));
    Harness {
        hooks: PipeHooks::new(store.clone(), coordinator, gate),
        actor: ApprovalActor::new(store.clone(), Duration::from_millis(300)),
        store,
    }
}

const PIPE_YAML: &str = r#"
version: "1.0"
upstreams:
  - host: build.example:2222
    username: ci
    password: s3cret
"#;

#[tokio::test(start_paused = true)]
async fn test_full_approval_and_pipe_start() {
    let h = harness();
    let conn = MockConn::new();
    let prompter = MockPrompter::default();
    let session = conn.unique_id();

    h.hooks.on_new_connection(&conn).unwrap();

    let approval = async {
        // user opens the link a few seconds after the prompt
        tokio::time::sleep(Duration::from_secs(3)).await;
        let config = PipeConfig::from_yaml(PIPE_YAML, "octocat/infra").unwrap();
        let (key, mut sealed) = ApprovalActor::seal_upstreams(config.upstreams).unwrap();
        h.actor.deposit(&session, key, sealed.remove(0));
        h.actor.await_outcome(&session).await
    };
    let cancel = CancellationToken::new();
    let connection = h.hooks.on_keyboard_interactive(&conn, &prompter, &cancel);

    let (outcome, upstream) = tokio::join!(approval, connection);
    let upstream = upstream.unwrap();

    assert_eq!(outcome, ApprovalOutcome::Approved);
    assert_eq!(upstream.host, "build.example");
    assert_eq!(upstream.port, 2222);
    assert_eq!(upstream.username, "ci");
    assert!(matches!(upstream.auth, UpstreamAuth::Password(ref pw) if pw.as_str() == "s3cret"));
    assert!(upstream.ignore_host_key);

    let messages = prompter.messages.lock().unwrap().clone();
    assert_eq!(
        messages[0],
        format!(
            "please open https://pipe.example/pipe/{} with your browser to verify (timeout 60s)",
            session
        )
    );
    assert_eq!(messages[1], "piping to ci@build.example:2222 with password");

    h.hooks.on_pipe_start(&conn);
    assert!(h.store.get_secret(&session).is_none());
    assert!(h.store.get_target(&session).is_none());
    assert_eq!(h.store.get_status(&session), Some(SessionStatus::Approved));
}

#[tokio::test(start_paused = true)]
async fn test_upstream_rejection_allows_one_retry() {
    let h = harness();
    let conn = MockConn::new();
    let session = conn.unique_id();

    let approval = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let config = PipeConfig::from_yaml(PIPE_YAML, "octocat/infra").unwrap();
        let (key, mut sealed) = ApprovalActor::seal_upstreams(config.upstreams).unwrap();
        h.actor.deposit(&session, key, sealed.remove(0));
    };
    let first = MockPrompter::default();
    let cancel = CancellationToken::new();
    let (_, resolved) = tokio::join!(
        approval,
        h.hooks.on_keyboard_interactive(&conn, &first, &cancel)
    );
    assert!(resolved.is_ok());

    // the upstream refuses the password
    h.hooks
        .on_upstream_auth_failure(&conn, "password", "ssh: unable to authenticate");
    assert!(h.store.get_target(&session).is_none());

    // host retries keyboard-interactive on the same connection
    let second = MockPrompter::default();
    let err = h
        .hooks
        .on_keyboard_interactive(&conn, &second, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::BadUpstreamCredential));
    assert!(second.messages.lock().unwrap()[0].contains("ssh: unable to authenticate"));

    // and again: condemned without another prompt
    let third = MockPrompter::default();
    let err = h
        .hooks
        .on_keyboard_interactive(&conn, &third, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::BadUpstreamCredential));
    assert!(third.messages.lock().unwrap().is_empty());

    assert_eq!(
        h.actor.await_outcome(&session).await,
        ApprovalOutcome::Rejected("bad upstream credential".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reported_to_approval_side() {
    let h = harness();
    let conn = MockConn::new();
    let session = conn.unique_id();
    let prompter = MockPrompter {
        broken: true,
        ..Default::default()
    };

    let started = tokio::time::Instant::now();
    let err = h
        .hooks
        .on_keyboard_interactive(&conn, &prompter, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(
        h.actor.await_outcome(&session).await,
        ApprovalOutcome::Rejected("timeout waiting for approval".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_are_isolated() {
    let h = harness();
    let conns: Vec<MockConn> = (0..8).map(|_| MockConn::new()).collect();
    let prompters: Vec<MockPrompter> = (0..8).map(|_| MockPrompter::default()).collect();

    let approvals = conns.iter().enumerate().map(|(i, conn)| {
        let actor = h.actor.clone();
        let session = conn.unique_id();
        async move {
            tokio::time::sleep(Duration::from_millis(250 * i as u64)).await;
            actor
                .approve(
                    &session,
                    pipebridge::session::UpstreamConfig {
                        host: format!("host-{}", i),
                        password: format!("pw-{}", i),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
    });
    let cancel = CancellationToken::new();
    let waits = conns
        .iter()
        .zip(prompters.iter())
        .map(|(conn, prompter)| h.hooks.on_keyboard_interactive(conn, prompter, &cancel));

    let (_, results) = tokio::join!(
        futures::future::join_all(approvals),
        futures::future::join_all(waits)
    );

    for (i, result) in results.into_iter().enumerate() {
        let upstream = result.unwrap();
        assert_eq!(upstream.host, format!("host-{}", i));
        assert_eq!(upstream.username, "octocat");
        assert!(matches!(upstream.auth, UpstreamAuth::Password(ref pw) if *pw.as_str() == format!("pw-{}", i)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_pipe_error_clears_session_and_refunds() {
    let h = harness();
    let conn = MockConn::new();
    let session = conn.unique_id();

    for _ in 0..3 {
        h.hooks.on_new_connection(&conn).unwrap();
    }
    assert!(matches!(
        h.hooks.on_new_connection(&conn),
        Err(BrokerError::TooManyConnections)
    ));

    h.store.set_status(&session, SessionStatus::Approved);
    h.hooks.on_pipe_error(&conn, "broken pipe");
    assert_eq!(h.store.get_status(&session), None);
    assert!(h.hooks.on_new_connection(&conn).is_ok());
}
