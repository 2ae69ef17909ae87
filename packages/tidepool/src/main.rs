use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod db;
mod events;
mod handlers;
mod metrics;
mod models;
mod repository;
#[cfg(test)]
mod test_helpers;

use crate::auth::AuthState;
use crate::config::{AuthConfig, EventsConfig, FileConfig, TidepoolConfig};
use crate::db::Database;
use crate::events::EventRegistry;
use crate::metrics::ServerMetrics;
use crate::repository::Repository;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "tide")]
#[command(about = "Live-syncing todo and calendar server")]
struct Cli {
    /// Port for the web server (overrides config.toml; default 3001)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config.toml; default 127.0.0.1)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Custom data directory (defaults to ~/.tidepool)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
#[allow(dead_code)]
pub(crate) struct AppState {
    pub config: Arc<TidepoolConfig>,
    /// Authentication configuration
    pub auth_config: Arc<AuthConfig>,
    pub db: Arc<Database>,
    pub repository: Arc<Repository>,
    /// Live event registry — one instance for the life of the process
    pub events: Arc<EventRegistry>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "tide=debug,tower_http=debug,info"
    } else {
        "tide=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Tidepool - live-syncing todo server");

    let config = Arc::new(TidepoolConfig::new(cli.data_dir)?);
    let file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .context("Failed to load configuration")?;
    let auth_config = Arc::new(AuthConfig::from_file(&file_config.auth));
    let events_config = EventsConfig::from_file(&file_config.events);

    info!(
        "Auth: session TTL {}s, registration {}",
        auth_config.session_ttl_secs,
        if auth_config.allow_registration {
            "open"
        } else {
            "closed"
        }
    );

    // Initialize database
    let db = Arc::new(Database::new(&config).await?);
    let repository = Arc::new(Repository::new(db.pool.clone()));

    // Initialize metrics and the event registry
    let metrics = Arc::new(ServerMetrics::new());
    let events = Arc::new(EventRegistry::new(Arc::clone(&metrics)));
    events.start(events_config.heartbeat_interval);

    // Spawn periodic expired session cleanup
    {
        let cleanup_repo = repository.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                match cleanup_repo.cleanup_expired_sessions().await {
                    Ok(n) if n > 0 => info!("Cleaned up {} expired sessions", n),
                    Ok(_) => {}
                    Err(e) => warn!("Session cleanup failed: {e:#}"),
                }
            }
        });
    }

    let app_state = AppState {
        config: config.clone(),
        auth_config: auth_config.clone(),
        db: db.clone(),
        repository: repository.clone(),
        events: events.clone(),
        metrics,
    };

    // Build auth sub-state
    let auth_state = AuthState {
        repository: repository.clone(),
        auth_config: auth_config.clone(),
    };

    // Build routes
    let app = Router::new()
        // Todo routes
        .route("/api/todos", get(handlers::list_todos))
        .route("/api/todos", post(handlers::create_todo))
        .route("/api/todos/{id}", put(handlers::update_todo))
        .route("/api/todos/{id}", delete(handlers::delete_todo))
        // Live event stream
        .route("/api/todos/events", get(handlers::todo_events))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler));

    // Merge auth routes and resolve sessions on every request
    let app = app
        .merge(auth::auth_routes().with_state(auth_state.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let host = cli
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = cli.port.or(file_config.server.port).unwrap_or(3001);
    let addr = format!("{host}:{port}").parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Tidepool listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/todos         - List todos");
    info!("  POST   /api/todos         - Create todo");
    info!("  PUT    /api/todos/:id     - Update todo");
    info!("  DELETE /api/todos/:id     - Delete todo");
    info!("  GET    /api/todos/events  - Live event stream (SSE)");

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Close every live stream and stop the heartbeat before exiting
    events.shutdown().await;

    info!("Shutdown complete");
    server_result
}
