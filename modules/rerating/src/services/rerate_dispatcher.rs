//! Rerate dispatcher job
//!
//! Hands the `TO_RERATE` wallet operations left by the cancellation run to
//! the rating engine, in account-aligned batches sized with the same budget
//! rule as the cancellation chunks.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::Instrument;

use crate::config::{DispatchOptions, RerateOptions};
use crate::job::{BatchJob, ItemFailure, JobError, JobExecutionResult, Prepared};
use crate::rating::RatingEngine;
use crate::repos::dispatch_repo::{self, PendingFilter, PendingOperation};
use crate::services::chunk_cursor::{ChunkCursor, RowSource};
use crate::services::chunking::{effective_budget, Chunk};

/// `TO_RERATE` operations in (billing account, id) order
pub struct PendingOperationSource {
    pool: PgPool,
    filter: PendingFilter,
    after: Option<(i64, i64)>,
}

impl PendingOperationSource {
    pub fn new(pool: PgPool, filter: PendingFilter) -> Self {
        Self {
            pool,
            filter,
            after: None,
        }
    }
}

#[async_trait]
impl RowSource for PendingOperationSource {
    type Row = PendingOperation;

    async fn fetch_next(&mut self, limit: i64) -> Result<Vec<PendingOperation>, sqlx::Error> {
        let page = dispatch_repo::fetch_page(&self.pool, &self.filter, self.after, limit).await?;
        if let Some(last) = page.last() {
            self.after = Some((last.ba_id, last.id));
        }
        Ok(page)
    }
}

#[derive(Debug, Default)]
pub struct DispatchContext {
    submitted: AtomicU64,
    rerated: AtomicU64,
    rejected: AtomicU64,
}

pub struct RerateDispatcherJob {
    pool: PgPool,
    engine: Arc<dyn RatingEngine>,
    rerate: RerateOptions,
    dispatch: DispatchOptions,
}

impl RerateDispatcherJob {
    pub fn new(
        pool: PgPool,
        engine: Arc<dyn RatingEngine>,
        rerate: RerateOptions,
        dispatch: DispatchOptions,
    ) -> Self {
        Self {
            pool,
            engine,
            rerate,
            dispatch,
        }
    }

    fn filter(&self) -> PendingFilter {
        PendingFilter {
            scope: self.rerate.scope.clone(),
            cutoffs: self.rerate.cutoffs.clone(),
        }
    }
}

#[async_trait]
impl BatchJob for RerateDispatcherJob {
    type Context = DispatchContext;
    type Cursor = ChunkCursor<PendingOperationSource>;

    fn name(&self) -> &'static str {
        "rerate_dispatcher"
    }

    async fn init_job_and_get_data_to_process(
        &self,
        result: &JobExecutionResult,
    ) -> Result<Prepared<DispatchContext, Self::Cursor>, JobError> {
        let filter = self.filter();
        let pending = dispatch_repo::count_pending(&self.pool, &filter)
            .await
            .map_err(|e| JobError::Init(format!("Counting pending operations failed: {}", e)))?;
        let pending = pending.max(0) as u64;

        let budget = effective_budget(pending, self.rerate.workers, self.rerate.max_units_per_tx);
        tracing::info!(pending = pending, budget = budget, "Pending wallet operations counted");

        let cursor = if pending == 0 {
            result.add_report("0 WOs to submit for rerating");
            None
        } else {
            let source = PendingOperationSource::new(self.pool.clone(), filter);
            Some(ChunkCursor::new(source, budget))
        };

        Ok(Prepared {
            context: DispatchContext::default(),
            cursor,
        })
    }

    async fn process_item(
        &self,
        context: &DispatchContext,
        batch: Chunk<PendingOperation>,
        _result: &JobExecutionResult,
    ) -> Result<u64, ItemFailure> {
        let units = batch.units();
        let first_ba = batch.rows().first().map(|r| r.ba_id).unwrap_or_default();
        let wo_ids: Vec<i64> = batch.into_rows().into_iter().map(|r| r.id).collect();
        let span = tracing::info_span!(
            "rerate_batch",
            first_ba_id = first_ba,
            operations = wo_ids.len()
        );

        async {
            let outcome = self
                .engine
                .apply_mass_rerate(
                    &wo_ids,
                    self.dispatch.use_same_price_plan,
                    self.dispatch.edr_date_filter,
                )
                .await;

            match outcome {
                Ok(outcome) => {
                    context.submitted.fetch_add(units, Ordering::SeqCst);
                    context.rerated.fetch_add(outcome.rerated, Ordering::SeqCst);
                    context.rejected.fetch_add(outcome.failed, Ordering::SeqCst);
                    tracing::info!(
                        rerated = outcome.rerated,
                        failed = outcome.failed,
                        "Batch submitted for rerating"
                    );
                    Ok(units)
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        server_error = e.is_server_error(),
                        "Rating engine call failed"
                    );
                    Err(ItemFailure::new(
                        format!(
                            "wallet operations {}-{}",
                            wo_ids.iter().min().copied().unwrap_or_default(),
                            wo_ids.iter().max().copied().unwrap_or_default()
                        ),
                        units,
                        e.to_string(),
                    ))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn finalize(&self, context: &DispatchContext, result: &JobExecutionResult) {
        result.add_report(format!(
            "{} WOs were submitted for rerating",
            context.submitted.load(Ordering::SeqCst)
        ));

        let rejected = context.rejected.load(Ordering::SeqCst);
        if rejected > 0 {
            result.add_report(format!(
                "{} of {} submitted WOs were rejected by the rating engine",
                rejected,
                context.rerated.load(Ordering::SeqCst) + rejected
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{PartitionCutoffs, RerateScope};
    use crate::graph::GraphViews;
    use crate::rating::{RatingError, RerateOutcome};
    use crate::services::chunking::pack_chunks;
    use chrono::NaiveDate;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<(Vec<i64>, bool, Option<NaiveDate>)>>,
        fail: bool,
    }

    #[async_trait]
    impl RatingEngine for RecordingEngine {
        async fn apply_mass_rerate(
            &self,
            wo_ids: &[i64],
            use_same_price_plan: bool,
            edr_date_filter: Option<NaiveDate>,
        ) -> Result<RerateOutcome, RatingError> {
            self.calls
                .lock()
                .unwrap()
                .push((wo_ids.to_vec(), use_same_price_plan, edr_date_filter));
            if self.fail {
                return Err(RatingError::Api {
                    status_code: 503,
                    message: "rating engine unavailable".to_string(),
                });
            }
            Ok(RerateOutcome {
                rerated: wo_ids.len() as u64 - 1,
                failed: 1,
            })
        }
    }

    fn job(engine: Arc<RecordingEngine>) -> RerateDispatcherJob {
        // Never connects: process_item and finalize do not touch the pool
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        RerateDispatcherJob::new(
            pool,
            engine,
            RerateOptions {
                workers: 2,
                max_units_per_tx: 100,
                use_existing_views: false,
                views: GraphViews::new("rerate").unwrap(),
                scope: RerateScope::All,
                cutoffs: PartitionCutoffs::default(),
                allow_billed_items: false,
            },
            DispatchOptions {
                use_same_price_plan: true,
                edr_date_filter: NaiveDate::from_ymd_opt(2024, 7, 1),
            },
        )
    }

    fn batch(rows: &[(i64, i64)]) -> Chunk<PendingOperation> {
        let ops = rows.iter().map(|&(id, ba_id)| PendingOperation { id, ba_id });
        pack_chunks(ops, u64::MAX).remove(0)
    }

    #[tokio::test]
    async fn test_batch_is_forwarded_with_dispatch_options() {
        let engine = Arc::new(RecordingEngine::default());
        let job = job(engine.clone());
        let context = DispatchContext::default();
        let result = JobExecutionResult::default();

        let units = job
            .process_item(&context, batch(&[(10, 1), (11, 1), (12, 2)]), &result)
            .await
            .unwrap();
        job.finalize(&context, &result).await;

        assert_eq!(units, 3);
        assert_eq!(
            engine.calls.lock().unwrap().as_slice(),
            &[(vec![10, 11, 12], true, NaiveDate::from_ymd_opt(2024, 7, 1))]
        );

        let report = result.snapshot("rerate_dispatcher", std::time::Duration::ZERO);
        assert_eq!(
            report.report,
            vec![
                "3 WOs were submitted for rerating",
                "1 of 3 submitted WOs were rejected by the rating engine",
            ]
        );
    }

    #[tokio::test]
    async fn test_engine_failure_is_a_batch_failure() {
        let engine = Arc::new(RecordingEngine {
            fail: true,
            ..Default::default()
        });
        let job = job(engine);
        let context = DispatchContext::default();
        let result = JobExecutionResult::default();

        let failure = job
            .process_item(&context, batch(&[(20, 5), (21, 5)]), &result)
            .await
            .unwrap_err();

        assert_eq!(failure.item_id, "wallet operations 20-21");
        assert_eq!(failure.units, 2);
        assert!(failure.message.contains("503"));
        assert_eq!(context.submitted.load(Ordering::SeqCst), 0);
    }
}
