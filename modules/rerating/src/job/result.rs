//! Job execution result shared by all workers of a run

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::ItemFailure;

/// One failed item as exposed in the job report
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemError {
    pub item_id: String,
    pub message: String,
}

/// Thread-safe accumulator of item outcomes and report lines
#[derive(Debug, Default)]
pub struct JobExecutionResult {
    succeeded: AtomicU64,
    failed: AtomicU64,
    stopped_early: AtomicBool,
    nothing_to_do: AtomicBool,
    errors: Mutex<Vec<ItemError>>,
    report: Mutex<Vec<String>>,
}

/// Snapshot of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<ItemError>,
    pub report: Vec<String>,
    pub stopped_early: bool,
    pub nothing_to_do: bool,
    pub duration_ms: u128,
}

impl JobReport {
    pub fn items_processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || !self.errors.is_empty()
    }

    /// Every item was handed out and none failed
    pub fn is_complete(&self) -> bool {
        !self.has_failures() && !self.stopped_early
    }
}

impl JobExecutionResult {
    pub fn register_success(&self, units: u64) {
        self.succeeded.fetch_add(units, Ordering::SeqCst);
    }

    pub fn register_failure(&self, failure: ItemFailure) {
        self.failed.fetch_add(failure.units, Ordering::SeqCst);
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ItemError {
                item_id: failure.item_id,
                message: failure.message,
            });
    }

    pub fn add_report(&self, line: impl Into<String>) {
        self.report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.into());
    }

    pub fn mark_stopped_early(&self) {
        self.stopped_early.store(true, Ordering::SeqCst);
    }

    pub fn mark_nothing_to_do(&self) {
        self.nothing_to_do.store(true, Ordering::SeqCst);
    }

    pub fn items_processed(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }

    pub fn stopped_early(&self) -> bool {
        self.stopped_early.load(Ordering::SeqCst)
    }

    /// True when any item or worker failed
    pub fn has_errors(&self) -> bool {
        !self
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }

    pub fn snapshot(&self, job: &str, duration: Duration) -> JobReport {
        JobReport {
            job: job.to_string(),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            errors: self
                .errors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            report: self
                .report
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            stopped_early: self.stopped_early.load(Ordering::SeqCst),
            nothing_to_do: self.nothing_to_do.load(Ordering::SeqCst),
            duration_ms: duration.as_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_success_and_failure_units() {
        let result = JobExecutionResult::default();
        result.register_success(10);
        result.register_success(5);
        result.register_failure(ItemFailure::new("chunk 16-20", 7, "deadlock detected"));

        let report = result.snapshot("test", Duration::from_millis(3));
        assert_eq!(report.succeeded, 15);
        assert_eq!(report.failed, 7);
        assert_eq!(report.items_processed(), 22);
        assert!(report.has_failures());
        assert_eq!(
            report.errors,
            vec![ItemError {
                item_id: "chunk 16-20".to_string(),
                message: "deadlock detected".to_string(),
            }]
        );
    }

    #[test]
    fn test_report_lines_keep_order() {
        let result = JobExecutionResult::default();
        result.add_report("first");
        result.add_report(String::from("second"));

        let report = result.snapshot("test", Duration::ZERO);
        assert_eq!(report.report, vec!["first", "second"]);
        assert!(!report.has_failures());
        assert!(!report.nothing_to_do);
        assert!(report.is_complete());
    }

    #[test]
    fn test_stopped_early_run_is_not_complete() {
        let result = JobExecutionResult::default();
        result.register_success(4);
        result.mark_stopped_early();

        let report = result.snapshot("test", Duration::ZERO);
        assert!(!report.has_failures());
        assert!(!report.is_complete());
    }
}
