//! Protocol server: envelopes, framing and the per-client dispatch loop.

pub mod envelope;
pub mod framing;
pub mod server;

pub use envelope::{CorrelationId, Envelope, MessageType, Method, PROTOCOL_VERSION, RequestPayload};
pub use framing::{DEFAULT_MAX_FRAME_BYTES, FrameError, FrameReader, FrameWriter, Framing};
pub use server::{
    ClientState, CloseReason, DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_QUEUED, DEFAULT_SHUTDOWN_GRACE,
    ProtocolServer, ServerSettings,
};
