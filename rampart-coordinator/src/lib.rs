//! RAMPART Coordinator - Dedup, Retry and Batch Execution
//!
//! - [`DedupCache`]: concurrent identical calls share one execution and its
//!   outcome for a short window.
//! - [`with_retry`]: sequential attempts with capped exponential backoff.
//! - [`run_batch`]: chunked, bounded-concurrency batches with progress
//!   callbacks and a single summary notification.
//!
//! [`OperationCoordinator`] bundles all three with configured defaults.

pub mod batch;
pub mod coordinator;
pub mod dedup;
pub mod retry;

pub use batch::{run_batch, BatchItem, BatchItemResult, BatchReport};
pub use coordinator::OperationCoordinator;
pub use dedup::DedupCache;
pub use retry::{with_retry, RetryPolicy};
