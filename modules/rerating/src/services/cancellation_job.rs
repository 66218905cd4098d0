//! Rating cancellation job
//!
//! Wires the view builder, summary calculator, chunk cursor and executor
//! into the batch harness.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::Instrument;

use crate::config::RerateOptions;
use crate::graph::GraphViews;
use crate::job::{BatchJob, ItemFailure, JobError, JobExecutionResult, Prepared};
use crate::repos::cancellation_repo::ChunkRange;
use crate::repos::graph_cursor_repo::{self, GraphRow};
use crate::services::cancellation_executor::apply_rating_cancellation;
use crate::services::chunk_cursor::{ChunkCursor, RowSource};
use crate::services::chunking::Chunk;
use crate::services::processing_summary::{compute_summary, ProcessingSummary};
use crate::services::view_builder::{build_graph_views, drop_graph_views};

/// Main-graph rows in id order, for the chunk cursor
pub struct GraphRowSource {
    pool: PgPool,
    views: GraphViews,
    exclude_billed: bool,
    after_id: i64,
}

impl GraphRowSource {
    pub fn new(pool: PgPool, views: GraphViews, exclude_billed: bool) -> Self {
        Self {
            pool,
            views,
            exclude_billed,
            after_id: 0,
        }
    }
}

#[async_trait]
impl RowSource for GraphRowSource {
    type Row = GraphRow;

    async fn fetch_next(&mut self, limit: i64) -> Result<Vec<GraphRow>, sqlx::Error> {
        let page = graph_cursor_repo::fetch_page(
            &self.pool,
            &self.views,
            self.exclude_billed,
            self.after_id,
            limit,
        )
        .await?;

        if let Some(last) = page.last() {
            self.after_id = last.id;
        }
        Ok(page)
    }
}

/// State shared by the workers of one cancellation run
pub struct CancellationContext {
    pub views: GraphViews,
    pub summary: ProcessingSummary,
    failed_to_rerate: AtomicU64,
    amount_put_back: Mutex<Decimal>,
}

impl CancellationContext {
    pub fn failed_to_rerate(&self) -> u64 {
        self.failed_to_rerate.load(Ordering::SeqCst)
    }

    /// Billed amount without tax added back by the chunks that committed
    pub fn amount_put_back(&self) -> Decimal {
        *self
            .amount_put_back
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_amount_put_back(&self, amount: Decimal) {
        *self
            .amount_put_back
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += amount;
    }
}

pub struct RatingCancellationJob {
    pool: PgPool,
    options: RerateOptions,
}

impl RatingCancellationJob {
    pub fn new(pool: PgPool, options: RerateOptions) -> Self {
        Self { pool, options }
    }

    fn exclude_billed(&self) -> bool {
        !self.options.allow_billed_items
    }
}

#[async_trait]
impl BatchJob for RatingCancellationJob {
    type Context = CancellationContext;
    type Cursor = ChunkCursor<GraphRowSource>;

    fn name(&self) -> &'static str {
        "rating_cancellation"
    }

    async fn init_job_and_get_data_to_process(
        &self,
        result: &JobExecutionResult,
    ) -> Result<Prepared<CancellationContext, Self::Cursor>, JobError> {
        let views = build_graph_views(&self.pool, &self.options)
            .await
            .map_err(|e| JobError::Init(e.to_string()))?;

        let summary = match compute_summary(&self.pool, &views, &self.options).await {
            Ok(summary) => summary,
            Err(e) => {
                // Views of a resumable run are kept; fresh ones are not
                if !self.options.use_existing_views {
                    if let Err(drop_err) = drop_graph_views(&self.pool, &views).await {
                        tracing::warn!(error = %drop_err, "Failed to drop graph views");
                    }
                }
                return Err(JobError::Init(format!("Processing summary failed: {}", e)));
            }
        };

        let cursor = if summary.is_empty() {
            result.add_report("0 WOs to rerate");
            None
        } else {
            let source = GraphRowSource::new(self.pool.clone(), views.clone(), self.exclude_billed());
            Some(ChunkCursor::new(source, summary.budget))
        };

        Ok(Prepared {
            context: CancellationContext {
                views,
                summary,
                failed_to_rerate: AtomicU64::new(0),
                amount_put_back: Mutex::new(Decimal::ZERO),
            },
            cursor,
        })
    }

    async fn process_item(
        &self,
        context: &CancellationContext,
        chunk: Chunk<GraphRow>,
        _result: &JobExecutionResult,
    ) -> Result<u64, ItemFailure> {
        let range = ChunkRange {
            views: &context.views,
            min_id: chunk.min_position(),
            max_id: chunk.max_position(),
            exclude_billed: self.exclude_billed(),
        };
        let units = chunk.units();
        let span = tracing::info_span!(
            "chunk",
            min_id = range.min_id,
            max_id = range.max_id,
            units = units,
            groups = chunk.group_count()
        );

        async {
            match apply_rating_cancellation(&self.pool, &range).await {
                Ok(report) => {
                    context
                        .failed_to_rerate
                        .fetch_add(report.failed_to_rerate, Ordering::SeqCst);
                    context.add_amount_put_back(report.amount_put_back);
                    tracing::info!(
                        rated_transactions = report.rated_transactions_canceled,
                        invoice_lines = report.invoice_lines_recalculated,
                        edrs = report.edrs_canceled,
                        operations = report.operations_canceled,
                        failed_to_rerate = report.failed_to_rerate,
                        "Chunk processed"
                    );
                    Ok(units)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Chunk failed");
                    Err(ItemFailure::new(
                        format!("chunk {}-{}", range.min_id, range.max_id),
                        units,
                        e.to_string(),
                    ))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn finalize(&self, context: &CancellationContext, result: &JobExecutionResult) {
        if self.exclude_billed() {
            result.add_report(format!(
                "{} WOs were reported as F_TO_RERATE",
                context.failed_to_rerate()
            ));
        }

        if context.summary.total_units > 0 {
            result.add_report(format!(
                "{} billed amount without tax put back onto invoice lines",
                context.amount_put_back().round_dp(2)
            ));
        }

        if result.has_errors() || result.stopped_early() {
            tracing::warn!(
                prefix = context.views.prefix(),
                "Graph views kept for a resumed run"
            );
            return;
        }

        if let Err(e) = drop_graph_views(&self.pool, &context.views).await {
            tracing::warn!(error = %e, "Failed to drop graph views");
            result.add_report(format!("Graph views could not be dropped: {}", e));
        }
    }

    async fn on_summary_complete(&self, result: &JobExecutionResult) {
        if result.has_errors() {
            tracing::warn!(
                "Rating cancellation finished with failed chunks; rerun with RERATE_USE_EXISTING_VIEWS=true"
            );
        }
    }
}
