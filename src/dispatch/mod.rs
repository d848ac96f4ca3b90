//! Worker dispatch
//!
//! Workers connect to the [`DispatchRouter`] and announce themselves with an
//! empty message. Requests are handed out round robin over the workers in
//! registration order; control messages such as `STOP` go to every worker.
//! Delivery is send-and-forget: results come back through the aggregator.

mod registry;
mod router;
mod worker;

pub use registry::WorkerRegistry;
pub use router::{DispatchHandle, DispatchReceipt, DispatchRouter, DispatchRouterConfig, DispatchStats};
pub use worker::{EchoHandler, WorkHandler, Worker, WorkerConfig, WorkerExit, WorkerReport};
