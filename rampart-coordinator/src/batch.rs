//! Bounded-concurrency batches.
//!
//! Items run in chunks of `concurrency`; a chunk finishes completely before
//! the next one starts. One item's failure never aborts the batch.

use std::future::Future;

use futures_util::future::join_all;
use rampart_core::{Notifier, OperationError, Severity};

/// Anything a batch can process. The id labels its result.
pub trait BatchItem {
    fn id(&self) -> String;
}

impl BatchItem for String {
    fn id(&self) -> String {
        self.clone()
    }
}

impl BatchItem for &str {
    fn id(&self) -> String {
        (*self).to_string()
    }
}

/// Outcome of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult {
    pub id: String,
    pub success: bool,
    pub error: Option<OperationError>,
}

/// Per-item results in input order, plus the tallies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub results: Vec<BatchItemResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// Raise one summary notification for the whole batch.
    ///
    /// `label` names the items in plural ("invitations"). Empty batches stay
    /// quiet.
    pub fn notify_summary(&self, notifier: &dyn Notifier, label: &str) {
        let total = self.total();
        if total == 0 {
            return;
        }
        let (message, severity) = if self.failed == 0 {
            (format!("All {total} {label} completed."), Severity::Info)
        } else if self.succeeded == 0 {
            (format!("All {total} {label} failed."), Severity::Error)
        } else {
            (
                format!(
                    "{} of {total} {label} completed; {} failed.",
                    self.succeeded, self.failed
                ),
                Severity::Warn,
            )
        };
        notifier.notify(&message, severity);
    }
}

/// Run `op` over `items`, `concurrency` at a time.
///
/// `on_progress(done, total)` fires after each chunk. A concurrency of zero
/// is treated as one.
pub async fn run_batch<I, R, F, Fut, P>(
    items: Vec<I>,
    op: F,
    concurrency: usize,
    mut on_progress: P,
) -> BatchReport
where
    I: BatchItem,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<R, OperationError>>,
    P: FnMut(usize, usize),
{
    let concurrency = concurrency.max(1);
    let total = items.len();
    let mut report = BatchReport {
        results: Vec::with_capacity(total),
        ..BatchReport::default()
    };

    let mut pending = items.into_iter();
    let mut chunk_index = 0usize;
    loop {
        let chunk: Vec<I> = pending.by_ref().take(concurrency).collect();
        if chunk.is_empty() {
            break;
        }

        let outcomes = join_all(chunk.into_iter().map(|item| {
            let id = item.id();
            let fut = op(item);
            async move { (id, fut.await) }
        }))
        .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => {
                    report.succeeded += 1;
                    report.results.push(BatchItemResult {
                        id,
                        success: true,
                        error: None,
                    });
                }
                Err(error) => {
                    tracing::debug!(id = %id, kind = %error.kind(), error = %error, "batch item failed");
                    report.failed += 1;
                    report.results.push(BatchItemResult {
                        id,
                        success: false,
                        error: Some(error),
                    });
                }
            }
        }

        chunk_index += 1;
        tracing::trace!(chunk = chunk_index, done = report.total(), total, "batch chunk finished");
        on_progress(report.total(), total);
    }

    tracing::info!(
        total,
        succeeded = report.succeeded,
        failed = report.failed,
        concurrency,
        "batch finished"
    );
    report
}
