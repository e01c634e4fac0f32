//! Streaming path: SSE emission and the upstream→downstream event state
//! machine.
//!
//! The emitter owns the client side of the socket (an mpsc channel feeding
//! the response body); the translator consumes upstream events and drives
//! the emitter so the client sees a well-formed Messages event stream.

pub mod emitter;
pub mod translator;

pub use emitter::SseEmitter;
pub use translator::{spawn_ping, SessionOutcome, StreamSession, PING_INTERVAL};
