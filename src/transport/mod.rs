//! Byte-stream transports for the protocol server.
//!
//! - Stdio: one client over standard input/output (the host-launched mode)
//! - TCP: one independent client per accepted socket, all sharing one session

pub mod stdio;
pub mod tcp;

pub use stdio::StdioTransport;
pub use tcp::TcpTransport;

use crate::error::DbResult;
use std::future::Future;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// A transport feeds client byte streams into the protocol server.
pub trait Transport: Send + Sync {
    /// Serve until the transport is exhausted or `shutdown` is set.
    fn run(&self, shutdown: watch::Receiver<bool>) -> impl Future<Output = DbResult<()>> + Send;

    /// Name of this transport for logging.
    fn name(&self) -> &'static str;
}

/// Wait for SIGINT or SIGTERM.
///
/// If a handler cannot be installed the corresponding branch never fires.
pub async fn wait_for_os_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
