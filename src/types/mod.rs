//! Type definitions for switchyard
//!
//! Identities, correlation ids and the event records that flow through the
//! broadcast log, the dispatch router and the result aggregator.

mod event;
mod identity;

pub use event::*;
pub use identity::*;
