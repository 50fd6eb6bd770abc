//! DB Tool Server - Main entry point.
//!
//! Exit codes: 0 clean shutdown, 1 startup or transport failure, 2 invalid
//! configuration.

use clap::Parser;
use db_tool_server::config::{Cli, ServerConfig, TransportMode};
use db_tool_server::protocol::ProtocolServer;
use db_tool_server::session::SessionState;
use db_tool_server::transport::{StdioTransport, TcpTransport, Transport, wait_for_os_signal};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

/// Initialize the tracing subscriber. Logs go to stderr; stdout carries frames.
fn init_tracing(log_level: &str, json_logs: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_ansi(false),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let config = match cli.into_server_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("Error: {e}");
            eprintln!();
            eprintln!("Usage: db-tool-server --database <url>");
            eprintln!("       db-tool-server --database <id>=<url>?writable=true");
            eprintln!("       db-tool-server --config <file.json>");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let session = match SessionState::from_config(&config) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    info!(
        transport = %config.transport,
        datasources = config.datasources.len(),
        "Starting DB Tool Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    session.warm_up().await;

    let code = run(&config, Arc::clone(&session)).await;

    info!("Closing all datasource pools");
    session.shutdown(config.protocol.shutdown_grace).await;
    info!("Server shutdown complete");

    // A blocking stdin read cannot be interrupted; leave without waiting on it.
    std::process::exit(i32::from(code));
}

async fn run(config: &ServerConfig, session: Arc<SessionState>) -> u8 {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_os_signal().await;
        info!("Shutdown signal received (send again to force exit)");
        let _ = shutdown_tx.send(true);
        wait_for_os_signal().await;
        warn!("Received second signal, forcing immediate exit");
        std::process::exit(i32::from(EXIT_STARTUP_FAILURE));
    });

    let server = ProtocolServer::new(session, config.protocol);
    let result = match config.transport {
        TransportMode::Stdio => {
            let transport = StdioTransport::new(server);
            info!(transport = transport.name(), "Transport ready");
            transport.run(shutdown_rx).await
        }
        TransportMode::Tcp => {
            let transport = match TcpTransport::bind(server, &config.listen).await {
                Ok(transport) => transport,
                Err(e) => {
                    error!(error = %e, listen = %config.listen, "Failed to start transport");
                    return EXIT_STARTUP_FAILURE;
                }
            };
            info!(transport = transport.name(), addr = ?transport.local_addr().ok(), "Transport ready");
            transport.run(shutdown_rx).await
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Transport failed");
            EXIT_STARTUP_FAILURE
        }
    }
}
