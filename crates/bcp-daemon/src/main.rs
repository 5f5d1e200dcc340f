//! bcp-daemon entry point.
//!
//! Boot order: tracing, configuration, store + migrations, scheduler,
//! then the HTTP listener. Handlers and state live in their own
//! modules; nothing here is worth testing in isolation.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use bcp_core::{DispatchTransport, QueueStore};
use bcp_daemon::{routes, state};
use bcp_scheduler::{HttpNotifier, LogNotifier, Scheduler, SchedulerConfig};

/// Comma-separated YAML layer list; unset runs on built-in defaults.
const ENV_CONFIG: &str = "BCP_CONFIG";
const ENV_ADDR: &str = "BCP_DAEMON_ADDR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience: pick up .env.local when it exists. Deployments
    // set real environment variables instead.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = load_config()?;

    let pool = bcp_store::connect_from_env().await?;
    bcp_store::migrate(&pool).await?;
    let store: Arc<dyn QueueStore> = Arc::new(bcp_store::PgQueueStore::new(pool));

    let (events_tx, _events_rx) = broadcast::channel(1024);

    let transport: Arc<dyn DispatchTransport> = match &config.dispatch_base_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        transport,
        SchedulerConfig {
            tick_interval: std::time::Duration::from_secs(config.tick_interval_secs),
            pass_deadline: std::time::Duration::from_secs(config.pass_deadline_secs),
        },
    )
    .with_events(events_tx.clone());
    let handle = scheduler.handle();

    let shutdown = CancellationToken::new();
    scheduler.spawn(shutdown.clone());

    let shared = Arc::new(state::AppState::new(
        store,
        handle,
        events_tx,
        &config.tokens,
    ));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr(&config);
    info!("bcp-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config() -> anyhow::Result<bcp_config::DaemonConfig> {
    match std::env::var(ENV_CONFIG) {
        Ok(paths) => {
            let layers: Vec<&str> = paths.split(',').map(str::trim).collect();
            let loaded = bcp_config::load_layered_yaml(&layers)?;
            info!(config_hash = %loaded.config_hash, layers = ?layers, "configuration loaded");
            Ok(loaded.config)
        }
        Err(_) => {
            info!("no {ENV_CONFIG} set; using built-in defaults");
            Ok(bcp_config::DaemonConfig::default())
        }
    }
}

/// `BCP_DAEMON_ADDR` wins over the config file when it parses.
fn bind_addr(config: &bcp_config::DaemonConfig) -> SocketAddr {
    std::env::var(ENV_ADDR)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(config.bind_addr)
}

/// Ctrl-C stops the scheduler first so no pass is mid-flight when the
/// listener closes.
async fn shutdown_signal(scheduler: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    scheduler.cancel();
}

/// CORS: localhost only, bare plus the operator-UI dev-server ports.
fn cors_localhost_only() -> CorsLayer {
    let mut origins: Vec<HeaderValue> = Vec::new();
    for host in ["localhost", "127.0.0.1"] {
        for port in ["", ":3000", ":5173"] {
            if let Ok(value) = HeaderValue::from_str(&format!("http://{host}{port}")) {
                origins.push(value);
            }
        }
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
