//! Tunnel wire protocol: binary frames carrying HTTP requests to a
//! user-local agent and chunked responses back.
//!
//! Every WebSocket message is one binary frame:
//!
//! ```text
//! [4 bytes big-endian: JSON header length][JSON header][raw payload bytes]
//! ```
//!
//! Two header shapes exist. `request` travels server→agent with the HTTP
//! body as payload; `stream` travels agent→server with a response chunk as
//! payload. The first `stream` frame for an id carries `status` and
//! `headers`; later frames omit them; the last sets `done: true`.
//!
//! A third header type `"abort"` is reserved for request cancellation but
//! not implemented; agent-side timeouts cover it today.

mod frame;

pub use frame::{decode, encode, Frame, FrameHeader, ProtocolError};

/// Chunk size the agent should aim for when slicing response bodies.
pub const TARGET_CHUNK_BYTES: usize = 16 * 1024;

/// Hard cap on a single stream-chunk payload. Keeps per-request memory
/// bounded (`chunk cap * channel capacity`) and intermediaries happy.
pub const MAX_CHUNK_BYTES: usize = 32 * 1024;

/// Sanity bound on a whole frame. Anything larger is a protocol violation,
/// not a legitimate message.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
