//! Ferry Driver
//!
//! The [`RunLifecycleDriver`] sits between the engine and everything else.
//! It registers submitted runs, hands them to the [`Engine`](ferry_engine::Engine),
//! and then applies the engine's event stream:
//!
//! | event                        | effect                                       |
//! |------------------------------|----------------------------------------------|
//! | `execution_start`            | run → RUNNING                                |
//! | `executing {node}`           | progress update                              |
//! | `execution_cached {nodes}`   | nodes counted, no update                     |
//! | `executed {node, output}`    | files queued for upload, else output posted  |
//! | `executing {node: null}`     | graph drained; SUCCESS once uploads finish   |
//! | `execution_error`            | error posted, run → FAILED                   |
//! | `execution_interrupted`      | uploads dropped, run → CANCELLED             |
//!
//! Every event is also relayed to live sessions before it is applied.

mod driver;
mod error;
mod request;

pub use driver::RunLifecycleDriver;
pub use error::DriverError;
pub use request::{SubmitRequest, SubmitResponse};
