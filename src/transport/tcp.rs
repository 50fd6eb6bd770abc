//! TCP transport.
//!
//! Every accepted socket gets its own client state machine. A client's
//! `shutdown` request closes that client only; the listener stops on the
//! process shutdown signal.

use crate::db::Connector;
use crate::error::{DbError, DbResult};
use crate::protocol::ProtocolServer;
use crate::protocol::server::wait_for_signal;
use crate::transport::Transport;
use std::net::SocketAddr;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

pub struct TcpTransport<C: Connector> {
    server: ProtocolServer<C>,
    listener: TcpListener,
}

impl<C: Connector> TcpTransport<C> {
    /// Bind the listening socket.
    pub async fn bind(server: ProtocolServer<C>, addr: &str) -> DbResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DbError::internal(format!("Failed to bind {addr}: {e}")))?;
        Ok(Self { server, listener })
    }

    pub fn local_addr(&self) -> DbResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| DbError::internal(format!("Failed to read local address: {e}")))
    }
}

impl<C: Connector> Transport for TcpTransport<C> {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DbResult<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Listening on TCP");
        let mut clients = JoinSet::new();

        loop {
            while clients.try_join_next().is_some() {}

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = wait_for_signal(&mut shutdown) => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, peer = %peer, "Failed to set TCP_NODELAY");
            }

            let server = self.server.clone();
            let client_shutdown = shutdown.clone();
            let span = info_span!("client", peer = %peer);
            clients.spawn(
                async move {
                    info!("Client connected");
                    let (read_half, write_half) = stream.into_split();
                    match server
                        .serve(BufReader::new(read_half), write_half, client_shutdown)
                        .await
                    {
                        Ok(reason) => info!(reason = ?reason, "Client disconnected"),
                        Err(e) => warn!(error = %e, "Client connection failed"),
                    }
                }
                .instrument(span),
            );
        }

        info!(clients = clients.len(), "Listener stopped; waiting for clients");
        while clients.join_next().await.is_some() {}
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
