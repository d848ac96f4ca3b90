//! Result aggregation
//!
//! Workers push completion envelopes to one collection point. The
//! [`ResultAggregator`] resolves each caller by correlation id, drops
//! results nobody is waiting for, and signals bulk completion once the
//! expected number of distinct requests has been resolved.

mod aggregator;
mod pending;

pub use aggregator::{
    AggregatorConfig, AggregatorHandle, AggregatorStats, BatchSummary, PendingBatch,
    PendingResponse, ResultAggregator,
};
pub use pending::{PendingRequest, PendingTable};
