//! Stdio transport.
//!
//! Frames are read from stdin and written to stdout; logs go to stderr.

use crate::db::Connector;
use crate::error::DbResult;
use crate::protocol::ProtocolServer;
use crate::transport::Transport;
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::info;

pub struct StdioTransport<C: Connector> {
    server: ProtocolServer<C>,
}

impl<C: Connector> StdioTransport<C> {
    pub fn new(server: ProtocolServer<C>) -> Self {
        Self { server }
    }
}

impl<C: Connector> Transport for StdioTransport<C> {
    async fn run(&self, shutdown: watch::Receiver<bool>) -> DbResult<()> {
        info!(framing = %self.server.settings().framing, "Serving on stdio");
        let reason = self
            .server
            .serve(
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
                shutdown,
            )
            .await?;
        info!(reason = ?reason, "Stdio client finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}
