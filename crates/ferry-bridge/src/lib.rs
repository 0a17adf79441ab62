//! Ferry Bridge
//!
//! Pushes run events to whoever is watching:
//!
//! - **Sessions**: duplex WebSocket connections keyed by session id. Each
//!   session owns an unbounded queue of [`Frame`]s; the server task for the
//!   connection drains it.
//! - **SSE subscribers**: per-run streams built on a broadcast channel. A
//!   stream ends after the run's terminal event.
//!
//! - **Logs**: a [`LogTail`] following the engine's log file, greeting new
//!   sessions with its tail and broadcasting appended lines.
//!
//! The bridge never blocks a producer. A closed session is pruned the next time
//! something is sent to it.

mod bridge;
mod frame;
mod logs;

pub use bridge::{EventBridge, RunEvent, SessionHandle};
pub use frame::{Frame, binary_frame};
pub use logs::LogTail;
