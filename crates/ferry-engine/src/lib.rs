//! Ferry Engine
//!
//! The boundary between ferry and the node-graph execution engine. Ferry never
//! runs graphs itself; it submits a [`Job`] through the [`Engine`] trait and
//! observes the run through the events the engine emits.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  submit / interrupt   ┌──────────────────────────┐
//! │    driver    │ ────────────────────▶ │  Engine (HttpEngine)     │
//! └──────────────┘                       └──────────────────────────┘
//!        ▲                                           │
//!        │ EngineMessage (mpsc)                      │ {type, data}
//!        │                                           ▼
//! ┌──────────────┐        notify         ┌──────────────────────────┐
//! │ ChannelNotif │ ◀──────────────────── │  POST /engine/events     │
//! └──────────────┘                       └──────────────────────────┘
//! ```
//!
//! Events travel as raw [`EngineMessage`] envelopes so they can be relayed
//! verbatim to live sessions; [`EngineMessage::decode`] turns one into a typed
//! [`EngineEvent`] for lifecycle decisions.

mod engine;
mod error;
mod events;
mod http;

pub use engine::{Engine, Job, Submission};
pub use error::EngineError;
pub use events::{ChannelNotifier, EngineEvent, EngineMessage, ExecutionNotifier};
pub use http::HttpEngine;
