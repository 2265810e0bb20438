//! Moltarena Server - Main entry point.
//!
//! This binary starts the realtime battle room hub with:
//! - Structured JSON logging for production
//! - A fail-fast startup probe against the data service
//! - Redis-backed coordination when configured, in-memory otherwise
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`moltarena_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! MOLTARENA_DATA_URL="http://localhost:4000" \
//! MOLTARENA_DATA_SERVICE_KEY="dev-key" \
//! MOLTARENA_REDIS_URL="redis://localhost:6379" \
//! PORT=8080 \
//! cargo run --release --bin moltarena-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use moltarena_server::config::Config;
use moltarena_server::data_service::{CredentialVerifier, DataServiceClient, RoomDirectory};
use moltarena_server::fanout::RoomBroadcaster;
use moltarena_server::registry::RoomRegistry;
use moltarena_server::router::{EventRouter, RouterConfig};
use moltarena_server::routes::{create_router, AppState};
use moltarena_server::store::{CoordinationStore, MemoryStore, RedisStore};

/// Cleanup interval for expired in-memory store claims (60 seconds).
const STORE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  MOLTARENA_DATA_URL          - Base URL of the data service");
            eprintln!("  MOLTARENA_DATA_SERVICE_KEY  - Service key for data service requests");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  MOLTARENA_REDIS_URL         - Coordination store (multi-instance)");
            eprintln!("  MOLTARENA_FRONTEND_ORIGIN   - Allowed CORS origin");
            eprintln!("  MOLTARENA_TURN_WINDOW_MS    - Turn submission window (default 10000)");
            eprintln!("  MOLTARENA_VOTE_TTL_SECS     - Vote flag lifetime (default 86400)");
            eprintln!("  PORT                        - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                    - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        data_service = %config.data_service_url,
        coordination = if config.redis_url.is_some() { "redis" } else { "memory" },
        "Moltarena server starting"
    );

    // Data service client, probed before accepting connections
    let data_client = match DataServiceClient::new(&config.data_service_url, &config.data_service_key)
    {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "Failed to create data service client");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = data_client.health_check_with_retry().await {
        error!(error = %err, "Data service unreachable, refusing to start");
        eprintln!("Error: data service unreachable: {err}");
        return ExitCode::from(1);
    }
    info!("Data service probe succeeded");

    // Coordination store
    let mut cleanup_handle = None;
    let store: Arc<dyn CoordinationStore> = match &config.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!("Connected to Redis coordination store");
                Arc::new(store)
            }
            Err(err) => {
                error!(error = %err, "Failed to connect to Redis, refusing to start");
                eprintln!("Error: Redis connection failed: {err}");
                return ExitCode::from(1);
            }
        },
        None => {
            warn!("Running with in-memory coordination store (single instance)");
            let memory = MemoryStore::new();
            cleanup_handle = Some(memory.spawn_cleanup_task(STORE_CLEANUP_INTERVAL));
            Arc::new(memory)
        }
    };

    // Realtime components
    let registry = Arc::new(RoomRegistry::new());
    let broadcaster = Arc::new(RoomBroadcaster::new(
        Arc::clone(&registry),
        Arc::clone(&store),
    ));
    let relay_handle = broadcaster.spawn_relay_task();
    info!(process_id = %broadcaster.process_id(), "Broadcast relay started");

    let router = Arc::new(EventRouter::new(
        Arc::clone(&registry),
        broadcaster,
        store,
        Arc::clone(&data_client) as Arc<dyn RoomDirectory>,
        RouterConfig {
            turn_window: config.turn_window,
            vote_ttl: config.vote_ttl,
        },
    ));

    let verifier: Arc<dyn CredentialVerifier> = data_client;
    let state = AppState::new(config.clone(), router, verifier, registry);

    // Create router
    let app = create_router(state);

    // Bind to address
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(port = config.port, address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    // Start server with graceful shutdown
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!("Server shutting down gracefully");

    relay_handle.abort();
    if let Some(handle) = cleanup_handle {
        handle.abort();
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// JSON-formatted output with environment-based filtering via `RUST_LOG`
/// and a default level of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for SIGTERM (container orchestrator shutdown) and SIGINT
/// (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
