use pipebridge::{
    admission::{self, TokenBucket},
    approval::ApprovalActor,
    config::AppConfig,
    session::{self, ApprovalCoordinator},
    web,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipebridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting PipeBridge v{}", env!("CARGO_PKG_VERSION"));

    if let Ok(path) = dotenvy::dotenv() {
        info!("Loaded environment from {}", path.display());
    }

    let config = AppConfig::init()?;
    info!(
        base_url = %config.web.base_url,
        timeout_secs = config.approval.timeout_secs,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();

    // Session store shared by the approval API and the connection hooks
    let store = session::create_session_store(config.session.entry_ttl());
    let sweeper = session::spawn_sweeper(
        store.clone(),
        config.session.sweep_interval(),
        shutdown.clone(),
    );

    let gate = Arc::new(TokenBucket::new(
        config.admission.tokens,
        config.admission.interval(),
        config.admission.sweep_min_ttl(),
    ));
    let gate_cleanup = admission::spawn_cleanup(
        gate.clone(),
        config.admission.sweep_min_ttl().max(Duration::from_secs(1)),
        shutdown.clone(),
    );

    // Hooks the connection host registers for its callbacks
    let coordinator = ApprovalCoordinator::new(store.clone(), config.coordinator());
    let hooks = pipebridge::pipe::PipeHooks::new(store.clone(), coordinator, gate);
    info!(?hooks, "Pipe hooks ready");

    let web_state = web::WebState {
        store: store.clone(),
        actor: ApprovalActor::new(
            store,
            Duration::from_millis(config.approval.outcome_poll_interval_ms),
        ),
        base_url: config.web.base_url.clone(),
    };
    let app = web::create_router(web_state);

    let web_addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = TcpListener::bind(&web_addr).await?;
    info!("Approval API listening on http://{}", web_addr);

    let serve_shutdown = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = serve_shutdown.cancelled() => {}
        }
    });

    if let Err(e) = server.await {
        error!("Web server error: {}", e);
    }

    shutdown.cancel();
    let _ = tokio::join!(sweeper, gate_cleanup);
    info!("PipeBridge stopped");

    Ok(())
}
