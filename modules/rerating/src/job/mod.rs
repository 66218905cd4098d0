//! Batch-execution harness
//!
//! A job supplies a cursor of work items and a per-item callback; the
//! runner drives a pool of workers over the shared cursor and collects a
//! `JobExecutionResult`. The rerate engine only depends on the four hooks of
//! [`BatchJob`].

pub mod result;
pub mod runner;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use result::{ItemError, JobExecutionResult, JobReport};
pub use runner::run_job;

/// Errors that abort a whole job run
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job initialization failed: {0}")]
    Init(String),

    #[error("Work cursor failed: {0}")]
    Cursor(String),
}

/// A failed work item, reported against the item's unit count
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub item_id: String,
    pub units: u64,
    pub message: String,
}

impl ItemFailure {
    pub fn new(item_id: impl Into<String>, units: u64, message: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            units,
            message: message.into(),
        }
    }
}

/// Job-wide budget; once exceeded no new items are handed out
#[derive(Debug, Clone, Default)]
pub struct JobLimits {
    pub max_items: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl JobLimits {
    pub fn exhausted(&self, elapsed: Duration, items_processed: u64) -> bool {
        self.max_items.is_some_and(|max| items_processed >= max)
            || self.max_duration.is_some_and(|max| elapsed >= max)
    }
}

/// Forward-only source of work items, shared by all workers
///
/// The runner wraps it in a mutex so `next` is mutually exclusive: no two
/// workers ever receive the same item.
#[async_trait]
pub trait WorkCursor: Send {
    type Item: Send;

    async fn next(&mut self) -> Result<Option<Self::Item>, JobError>;
}

/// Outcome of job initialization
///
/// `cursor` is `None` when there is nothing to process; `context` is still
/// handed to `finalize` so the job can release what init created.
pub struct Prepared<C, K> {
    pub context: C,
    pub cursor: Option<K>,
}

#[async_trait]
pub trait BatchJob: Send + Sync + 'static {
    type Context: Send + Sync + 'static;
    type Cursor: WorkCursor + 'static;

    fn name(&self) -> &'static str;

    /// Prepare the run. An error here is fatal: no items are processed and
    /// `finalize` is not called, so the job must clean up before returning.
    async fn init_job_and_get_data_to_process(
        &self,
        result: &JobExecutionResult,
    ) -> Result<Prepared<Self::Context, Self::Cursor>, JobError>;

    /// Process one item, returning the number of units it covered
    async fn process_item(
        &self,
        context: &Self::Context,
        item: <Self::Cursor as WorkCursor>::Item,
        result: &JobExecutionResult,
    ) -> Result<u64, ItemFailure>;

    /// Called once after all workers finished
    async fn finalize(&self, context: &Self::Context, result: &JobExecutionResult);

    /// Error-report hook, called after `finalize`
    async fn on_summary_complete(&self, _result: &JobExecutionResult) {}
}
