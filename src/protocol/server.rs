//! Per-client protocol loop.
//!
//! One reader drives the client state machine
//! (`Uninitialized -> Ready -> ShuttingDown -> Closed`); every tool call runs
//! as its own task and reports through a single writer task, so responses
//! leave in completion order tagged with their correlation id.

use crate::db::{Connector, SqlxConnector};
use crate::error::{DbError, DbResult};
use crate::protocol::envelope::{
    CorrelationId, Envelope, MessageType, Method, PROTOCOL_VERSION, RequestPayload, recover_id,
};
use crate::protocol::framing::{DEFAULT_MAX_FRAME_BYTES, FrameReader, FrameWriter, Framing};
use crate::session::SessionState;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
pub const DEFAULT_MAX_QUEUED: usize = 64;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Ready,
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub framing: Framing,
    pub max_frame_bytes: usize,
    /// Tool calls executing at once, per client
    pub max_in_flight: usize,
    /// Tool calls waiting for an execution slot before the reader stops reading
    pub max_queued: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            framing: Framing::Line,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_queued: DEFAULT_MAX_QUEUED,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Why a client loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `shutdown`
    ShutdownRequested,
    /// End of input stream
    TransportClosed,
    /// Process-wide shutdown signal
    Signal,
}

type CancelMap = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<()>>>>;

fn lock(map: &CancelMap) -> MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<()>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProtocolServer<C: Connector = SqlxConnector> {
    session: Arc<SessionState<C>>,
    settings: ServerSettings,
}

impl<C: Connector> Clone for ProtocolServer<C> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            settings: self.settings,
        }
    }
}

impl<C: Connector> ProtocolServer<C> {
    pub fn new(session: Arc<SessionState<C>>, settings: ServerSettings) -> Self {
        Self { session, settings }
    }

    pub fn session(&self) -> &Arc<SessionState<C>> {
        &self.session
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Serve one client until it shuts down, disconnects or `shutdown` fires.
    ///
    /// Returns an error only when the transport itself fails.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: W,
        mut shutdown: watch::Receiver<bool>,
    ) -> DbResult<CloseReason>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FrameReader::new(
            reader,
            self.settings.framing,
            self.settings.max_frame_bytes,
        );
        let (tx, rx) = mpsc::channel::<Envelope>(self.settings.max_in_flight.max(1) * 4);
        let writer_task = tokio::spawn(write_loop(
            FrameWriter::new(writer, self.settings.framing),
            rx,
        ));

        let mut client = Client {
            server: self.clone(),
            state: ClientState::Uninitialized,
            tx,
            cancels: Arc::new(Mutex::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(self.settings.max_in_flight.max(1))),
            queue: Arc::new(Semaphore::new(
                self.settings.max_in_flight.max(1) + self.settings.max_queued,
            )),
            tasks: JoinSet::new(),
        };

        let reason = loop {
            while client.tasks.try_join_next().is_some() {}

            let frame = tokio::select! {
                frame = frames.next_frame() => frame,
                _ = wait_for_signal(&mut shutdown) => break CloseReason::Signal,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break CloseReason::TransportClosed,
                Err(e) => {
                    error!(error = %e, "Transport read failed");
                    client.drain().await;
                    drop(client);
                    let _ = writer_task.await;
                    return Err(DbError::protocol(format!("Transport read failed: {e}")));
                }
            };

            let frame = match frame {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Discarding bad frame");
                    client.send(Envelope::failure(None, &DbError::protocol(e.to_string()))).await;
                    continue;
                }
            };

            if client.handle_frame(&frame).await {
                break CloseReason::ShutdownRequested;
            }
        };

        info!(reason = ?reason, in_flight = client.tasks.len(), "Client closing");
        client.drain().await;
        drop(client);
        if let Err(e) = writer_task.await {
            error!(error = %e, "Writer task failed");
        }
        debug!(state = ?ClientState::Closed, "Client closed");
        Ok(reason)
    }
}

/// State of one connected client.
struct Client<C: Connector> {
    server: ProtocolServer<C>,
    state: ClientState,
    tx: mpsc::Sender<Envelope>,
    cancels: CancelMap,
    /// Execution slots
    slots: Arc<Semaphore>,
    /// Execution slots plus queue depth
    queue: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl<C: Connector> Client<C> {
    async fn send(&self, envelope: Envelope) {
        if self.tx.send(envelope).await.is_err() {
            warn!("Writer closed; dropping response");
        }
    }

    /// Handle one decoded frame. Returns true once the client asked to shut down.
    async fn handle_frame(&mut self, frame: &[u8]) -> bool {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                match recover_id(frame) {
                    Some(id) => {
                        warn!(correlation_id = %id, error = %e, "Malformed envelope");
                        let err = DbError::protocol(format!("Malformed envelope: {e}"));
                        self.send(Envelope::failure(Some(id), &err)).await;
                    }
                    None => warn!(error = %e, "Dropping unparseable frame"),
                }
                return false;
            }
        };

        match envelope.kind {
            MessageType::Response => {
                warn!(correlation_id = ?envelope.id, "Ignoring response sent by client");
                false
            }
            MessageType::Notification => {
                self.handle_notification(&envelope.payload);
                false
            }
            MessageType::Request => {
                let Some(id) = envelope.id else {
                    warn!("Dropping request without an id");
                    return false;
                };
                match RequestPayload::parse(&envelope.payload) {
                    Ok(payload) => self.handle_request(id, payload).await,
                    Err(err) => {
                        self.send(Envelope::failure(Some(id), &err)).await;
                        false
                    }
                }
            }
        }
    }

    fn handle_notification(&mut self, payload: &JsonValue) {
        match RequestPayload::parse(payload) {
            Ok(RequestPayload::Method(Method::Cancel { id })) => {
                self.cancel(&id);
            }
            Ok(other) => debug!(payload = ?other, "Ignoring notification"),
            Err(e) => warn!(error = %e, "Ignoring malformed notification"),
        }
    }

    async fn handle_request(&mut self, id: CorrelationId, payload: RequestPayload) -> bool {
        let reply = match (self.state, payload) {
            (_, RequestPayload::Method(Method::Ping)) => Ok(json!({})),

            (ClientState::Uninitialized, RequestPayload::Method(Method::Initialize)) => {
                self.state = ClientState::Ready;
                info!(correlation_id = %id, "Client initialized");
                Ok(self.initialize_result())
            }
            (ClientState::Uninitialized, _) => Err(DbError::protocol(
                "Server not initialized; send 'initialize' first",
            )),

            (_, RequestPayload::Method(Method::Initialize)) => {
                Err(DbError::protocol("Already initialized"))
            }
            (_, RequestPayload::Method(Method::ListTools)) => {
                let tools = self.server.session.registry().descriptors();
                serde_json::to_value(tools)
                    .map(|tools| json!({ "tools": tools }))
                    .map_err(|e| DbError::internal(format!("Failed to encode tools: {e}")))
            }
            (_, RequestPayload::Method(Method::Cancel { id: target })) => {
                let cancelled = self.cancel(&target);
                Ok(json!({ "cancelled": cancelled }))
            }
            (_, RequestPayload::Method(Method::Shutdown)) => {
                self.state = ClientState::ShuttingDown;
                self.send(Envelope::success(Some(id), json!({}))).await;
                return true;
            }
            (_, RequestPayload::ToolCall { tool, arguments }) => {
                self.spawn_tool_call(id, tool, arguments).await;
                return false;
            }
        };

        self.send(Envelope::response(Some(id), reply)).await;
        false
    }

    fn initialize_result(&self) -> JsonValue {
        json!({
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": self.server.session.registry().enabled().len(),
                "cancel": true,
            },
        })
    }

    /// Signal an in-flight call. False when the id is unknown or already finished.
    fn cancel(&self, id: &CorrelationId) -> bool {
        let sender = lock(&self.cancels).remove(id);
        let cancelled = sender.is_some_and(|tx| tx.send(()).is_ok());
        debug!(correlation_id = %id, cancelled, "Cancel requested");
        cancelled
    }

    async fn spawn_tool_call(&mut self, id: CorrelationId, tool: String, arguments: JsonValue) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let duplicate = {
            let mut cancels = lock(&self.cancels);
            if cancels.contains_key(&id) {
                true
            } else {
                cancels.insert(id.clone(), cancel_tx);
                false
            }
        };
        if duplicate {
            let err = DbError::protocol(format!("Request id {id} is already in flight"));
            self.send(Envelope::failure(Some(id), &err)).await;
            return;
        }

        // Blocks the reader when the queue is full.
        let queued = match Arc::clone(&self.queue).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                lock(&self.cancels).remove(&id);
                self.send(Envelope::failure(Some(id), &DbError::Cancelled)).await;
                return;
            }
        };

        let session = Arc::clone(&self.server.session);
        let slots = Arc::clone(&self.slots);
        let cancels = Arc::clone(&self.cancels);
        let tx = self.tx.clone();
        let span = info_span!("request", correlation_id = %id, tool = %tool);

        self.tasks.spawn(
            async move {
                let _queued = queued;
                let started = Instant::now();
                let work = async {
                    let _slot = slots
                        .acquire()
                        .await
                        .map_err(|_| DbError::internal("Execution slots closed"))?;
                    session.dispatch(&tool, arguments).await
                };

                let outcome = tokio::select! {
                    Ok(()) = &mut cancel_rx => Err(DbError::Cancelled),
                    result = work => result,
                };
                lock(&cancels).remove(&id);

                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = outcome.is_ok(),
                    "Request finished"
                );
                if tx.send(Envelope::response(Some(id), outcome)).await.is_err() {
                    warn!("Writer closed before response could be sent");
                }
            }
            .instrument(span),
        );
    }

    /// Let in-flight calls finish within the grace period; cancel the rest.
    async fn drain(&mut self) {
        self.state = ClientState::ShuttingDown;
        self.queue.close();
        if self.tasks.is_empty() {
            return;
        }

        let grace = self.server.settings.shutdown_grace;
        let finished = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            let pending: Vec<CorrelationId> = lock(&self.cancels).drain().map(|(id, _)| id).collect();
            warn!(
                grace_ms = grace.as_millis() as u64,
                pending = pending.len(),
                "In-flight requests did not finish in time; aborting"
            );
            self.tasks.shutdown().await;
            for id in pending {
                self.send(Envelope::failure(Some(id), &DbError::Cancelled)).await;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, correlation_id = ?envelope.id, "Failed to encode response");
                let fallback = Envelope::failure(
                    envelope.id,
                    &DbError::internal("Failed to encode response"),
                );
                match fallback.encode() {
                    Ok(body) => body,
                    Err(_) => continue,
                }
            }
        };
        if let Err(e) = writer.write_frame(&body).await {
            error!(error = %e, "Transport write failed; dropping remaining responses");
            rx.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Resolves once the flag is set. A dropped sender never fires.
pub(crate) async fn wait_for_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
