use crate::config::Settings;
use crate::keys::KeyRegistry;
use crate::metrics::Metrics;
use crate::server::{self, AppState};
use crate::store::RateLimitStore;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Process lifecycle: load settings → load keys → connect store → register
/// script → install metrics → start reporter → bind listeners. Teardown
/// runs in reverse.
pub async fn run() -> Result<()> {
    init_tracing();

    // Phase 1: settings and the key registry — both fatal to fail.
    let settings = Settings::load()?;
    let keys = KeyRegistry::load(&settings.api_keys_file)?;

    // Phase 2: connect to the shared store and register the decision-engine
    // script. No listener is bound before this succeeds, so the very first
    // request never races script availability.
    let store = RateLimitStore::connect(&settings.redis_url).await?;

    // Phase 3: metrics recorder, then state assembly.
    let metrics = Metrics::install();
    let window_seconds = settings.window_seconds;
    let listen = settings.listen_addr.clone();
    let admin_listen = settings.admin_listen_addr.clone();
    let service_name = settings.service_name.clone();
    let state = AppState::new(settings, keys, store, metrics);

    // Phase 4: background metrics reporter.
    let shutdown = Arc::new(Notify::new());
    let reporter_handle = tokio::spawn(crate::metrics::reporter::run(
        service_name,
        state.counters.clone(),
        shutdown.clone(),
    ));

    // Phase 5: admin server (health/metrics) + primary API server.
    start_admin_server(&state, &admin_listen);

    tracing::info!(
        "server: starting rate limiter, listen={}, window_seconds={}",
        listen,
        window_seconds
    );

    let api_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_api_server(&listen, state, shutdown).await }
    });

    // Phase 6: block until signal, then tear down in reverse order.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = api_handle.await {
        tracing::error!("server: api task error: {}", e);
    }
    let _ = reporter_handle.await;
    state.store.close().await;

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(guard);
}

fn start_admin_server(state: &AppState, admin_listen: &str) {
    let state = state.clone();
    let admin_addr = admin_listen.to_string();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
