#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use marlin::config;
use marlin::engine::SimpleEngine;
use marlin::handler::Handler;
use marlin::metrics::{self, MetricsListener};
use marlin::process::ProcessList;
use marlin::server::{self, Transport};
use marlin::session::SessionManager;

/// Global connection counter for generating unique connection IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Graceful shutdown timeout (wait for connections to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = config::load_or_default(&["config/marlin.toml", "marlin.toml"]);

    let process_list = Arc::new(ProcessList::new());
    let engine = Arc::new(SimpleEngine::new(process_list.clone()));
    let session_manager = Arc::new(SessionManager::new(process_list));
    let handler = Arc::new(
        Handler::new(engine, session_manager, config.handler.to_options())
            .with_listener(Arc::new(MetricsListener)),
    );

    info!(
        read_timeout_ms = config.handler.read_timeout_ms,
        disable_multi_statements = config.handler.disable_multi_statements,
        "Handler configured"
    );

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "marlin SQL server listening");

    // Start metrics server in background
    if config.metrics.enabled {
        let metrics_addr = format!(
            "{}:{}",
            config.server.listen_addr, config.metrics.listen_port
        );
        info!(metrics_addr = %metrics_addr, "Metrics server starting");
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    // Track active connections for graceful shutdown
    let mut connections: JoinSet<()> = JoinSet::new();

    // Main accept loop with graceful shutdown support
    loop {
        tokio::select! {
            // Handle shutdown signals
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }

            // Accept new connections
            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let conn_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();

                // The poller needs the descriptor and local port before the
                // stream disappears into the codec.
                #[cfg(unix)]
                let transport = match stream.local_addr() {
                    Ok(local) => Transport::Tcp {
                        raw_fd: stream.as_raw_fd(),
                        local_port: local.port(),
                    },
                    Err(_) => Transport::Other,
                };
                #[cfg(not(unix))]
                let transport = Transport::Other;

                info!(conn_id, peer = %peer_addr, "New connection");

                connections.spawn(async move {
                    let result = server::serve_connection(
                        handler,
                        stream,
                        conn_id,
                        peer_addr.to_string(),
                        transport,
                    )
                    .await;
                    match result {
                        Ok(()) => info!(conn_id, "Connection ended"),
                        Err(e) => warn!(conn_id, error = %e, "Connection ended with error"),
                    }
                });
            }
        }
    }

    // Graceful shutdown: wait for active connections to complete
    let active_count = connections.len();
    if active_count > 0 {
        info!(
            active_connections = active_count,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "Waiting for active connections to complete"
        );

        let shutdown_deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

        loop {
            if connections.is_empty() {
                info!("All connections completed gracefully");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(shutdown_deadline) => {
                    let remaining = connections.len();
                    warn!(
                        remaining_connections = remaining,
                        "Graceful shutdown timeout, aborting remaining connections"
                    );
                    connections.abort_all();
                    break;
                }

                Some(result) = connections.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }
    }

    info!("marlin shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
