//! Stage handlers run by the workflow runner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use obr_core::{defaults, RetryPolicy, Stage};

/// Progress callback type for stage handlers: `(batch number, rows consumed)`.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Context provided to stage handlers.
pub struct StageContext {
    /// Resource being processed.
    pub resource_id: String,
    /// Maximum rows read per batch.
    pub batch_size: i64,
    /// Retry policy wrapped around every batch.
    pub retry: RetryPolicy,
    progress_callback: Option<ProgressCallback>,
}

impl StageContext {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            batch_size: defaults::BATCH_SIZE,
            retry: RetryPolicy::default(),
            progress_callback: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report a committed batch to the callback.
    pub fn report_progress(&self, batch: u64, rows: u64) {
        if let Some(ref callback) = self.progress_callback {
            callback(batch, rows);
        }
    }
}

/// Counts for one completed stage run over a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub resource_id: String,
    pub stage: Option<Stage>,
    /// Batches committed.
    pub batches: u64,
    /// Input rows advanced past the stage gate, skipped rows included.
    pub consumed: u64,
    /// Input rows advanced without contributing (malformed concept, unknown context).
    pub skipped: u64,
    /// Expanded rows inserted, or score keys touched by aggregation.
    pub emitted: u64,
    /// Aggregated score rows for the resource after aggregation.
    pub total_entries: Option<i64>,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn new(resource_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            resource_id: resource_id.into(),
            stage: Some(stage),
            ..Self::default()
        }
    }

    /// The count the stage operation reports: rows emitted for the expanders,
    /// total aggregated entries for aggregation.
    pub fn count(&self) -> u64 {
        match self.total_entries {
            Some(total) => total.max(0) as u64,
            None => self.emitted,
        }
    }
}

/// Result of stage execution.
#[derive(Debug)]
pub enum StageResult {
    /// Stage drained its input.
    Success(StageReport),
    /// Stage stopped with an error; batches committed before it stay committed.
    Failed(String),
}

/// Trait for stage handlers.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage this handler runs.
    fn stage(&self) -> Stage;

    /// Run the stage over the resource until its input is drained.
    async fn execute(&self, ctx: StageContext) -> StageResult;

    fn can_handle(&self, stage: Stage) -> bool {
        self.stage() == stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_stage_context_defaults() {
        let ctx = StageContext::new("GEO");
        assert_eq!(ctx.resource_id, "GEO");
        assert_eq!(ctx.batch_size, defaults::BATCH_SIZE);
        assert_eq!(ctx.retry, RetryPolicy::default());
    }

    #[test]
    fn test_batch_size_floor() {
        assert_eq!(StageContext::new("R").with_batch_size(0).batch_size, 1);
    }

    #[test]
    fn test_progress_callback() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let ctx = StageContext::new("R").with_progress_callback(move |_, rows| {
            counter.fetch_add(rows, Ordering::SeqCst);
        });
        ctx.report_progress(1, 3);
        ctx.report_progress(2, 4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_report_count() {
        let mut report = StageReport::new("R", Stage::IsaClosure);
        report.emitted = 5;
        assert_eq!(report.count(), 5);
        report.total_entries = Some(12);
        assert_eq!(report.count(), 12);
    }
}
