//! Multi-worker job runner

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::{BatchJob, ItemFailure, JobError, JobExecutionResult, JobLimits, JobReport, WorkCursor};

/// Run a batch job with `workers` parallel workers over its cursor
///
/// Each worker pulls one item at a time and processes it to completion
/// before asking for the next. An item failure is recorded and the worker
/// moves on; a cursor failure stops all workers from taking new items.
///
/// # Returns
/// * `Ok(JobReport)` - the run completed (possibly with failed items)
/// * `Err(JobError)` - initialization failed; nothing was processed
pub async fn run_job<J: BatchJob>(
    job: Arc<J>,
    workers: usize,
    limits: JobLimits,
) -> Result<JobReport, JobError> {
    let started = Instant::now();
    let result = Arc::new(JobExecutionResult::default());

    let prepared = match job.init_job_and_get_data_to_process(&result).await {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!(job = job.name(), error = %e, "Job initialization failed");
            return Err(e);
        }
    };

    let context = Arc::new(prepared.context);

    match prepared.cursor {
        None => {
            tracing::info!(job = job.name(), "Nothing to process");
            result.mark_nothing_to_do();
        }
        Some(cursor) => {
            let cursor = Arc::new(Mutex::new(cursor));
            let stop = Arc::new(AtomicBool::new(false));
            let worker_count = workers.max(1);
            let parent = tracing::Span::current();

            tracing::info!(job = job.name(), workers = worker_count, "Starting workers");

            let mut handles = Vec::with_capacity(worker_count);
            for worker_id in 0..worker_count {
                let span = tracing::info_span!(parent: &parent, "worker", worker_id = worker_id);
                handles.push(tokio::spawn(
                    worker_loop(
                        job.clone(),
                        context.clone(),
                        cursor.clone(),
                        result.clone(),
                        limits.clone(),
                        started,
                        stop.clone(),
                    )
                    .instrument(span),
                ));
            }

            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(e) = handle.await {
                    tracing::error!(worker_id = worker_id, error = %e, "Worker task aborted");
                    result.register_failure(ItemFailure::new(
                        format!("worker {}", worker_id),
                        0,
                        format!("Worker task aborted: {}", e),
                    ));
                }
            }
        }
    }

    job.finalize(&context, &result).await;
    job.on_summary_complete(&result).await;

    let report = result.snapshot(job.name(), started.elapsed());

    tracing::info!(
        job = job.name(),
        succeeded = report.succeeded,
        failed = report.failed,
        stopped_early = report.stopped_early,
        duration_ms = report.duration_ms as u64,
        "Job run complete"
    );

    Ok(report)
}

async fn worker_loop<J: BatchJob>(
    job: Arc<J>,
    context: Arc<J::Context>,
    cursor: Arc<Mutex<J::Cursor>>,
    result: Arc<JobExecutionResult>,
    limits: JobLimits,
    started: Instant,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        if limits.exhausted(started.elapsed(), result.items_processed()) {
            if !stop.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    items_processed = result.items_processed(),
                    "Job limits reached, no new items will be submitted"
                );
                result.mark_stopped_early();
            }
            break;
        }

        let next = {
            let mut guard = cursor.lock().await;
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let next = guard.next().await;
            if next.is_err() {
                stop.store(true, Ordering::SeqCst);
            }
            next
        };

        let item = match next {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Work cursor failed, stopping submission");
                result.register_failure(ItemFailure::new("cursor", 0, e.to_string()));
                break;
            }
        };

        match job.process_item(&context, item, &result).await {
            Ok(units) => result.register_success(units),
            Err(failure) => {
                tracing::error!(
                    item_id = %failure.item_id,
                    units = failure.units,
                    error = %failure.message,
                    "Item processing failed"
                );
                result.register_failure(failure);
            }
        }
    }
}
