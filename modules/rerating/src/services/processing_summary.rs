//! Processing-summary calculator
//!
//! Turns the main graph aggregates into the run's unit total and the
//! per-chunk budget.

use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::config::RerateOptions;
use crate::graph::GraphViews;
use crate::repos::summary_repo::{self, GraphSummaryRow};
use crate::services::chunking::effective_budget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub total_units: u64,
    pub total_groups: u64,
    pub billed_groups: u64,
    /// Distinct `id / max_units_per_tx` buckets of the main graph
    pub lots: u64,
    /// Pre-run estimate over the primary waves; the job reports what moved
    pub billed_amount_without_tax: Decimal,
    /// Per-chunk unit budget derived from the total and the worker count
    pub budget: u64,
    /// Billed groups are frozen and only get marked `F_TO_RERATE`
    pub billed_groups_frozen: bool,
}

impl ProcessingSummary {
    pub fn from_row(row: GraphSummaryRow, options: &RerateOptions) -> Self {
        let total_units = row.total_units.max(0) as u64;
        Self {
            total_units,
            total_groups: row.total_groups.max(0) as u64,
            billed_groups: row.billed_groups.max(0) as u64,
            lots: row.lots.max(0) as u64,
            billed_amount_without_tax: row.billed_amount_without_tax,
            budget: effective_budget(total_units, options.workers, options.max_units_per_tx),
            billed_groups_frozen: !options.allow_billed_items,
        }
    }

    /// True when there is neither rerating nor `F_TO_RERATE` marking to do
    pub fn is_empty(&self) -> bool {
        self.total_units == 0 && !(self.billed_groups_frozen && self.billed_groups > 0)
    }
}

/// Compute the summary of a run's views
pub async fn compute_summary(
    pool: &PgPool,
    views: &GraphViews,
    options: &RerateOptions,
) -> Result<ProcessingSummary, sqlx::Error> {
    let row = summary_repo::summarize(pool, views, !options.allow_billed_items).await?;
    let summary = ProcessingSummary::from_row(row, options);

    tracing::info!(
        total_units = summary.total_units,
        total_groups = summary.total_groups,
        billed_groups = summary.billed_groups,
        lots = summary.lots,
        billed_amount = %summary.billed_amount_without_tax,
        budget = summary.budget,
        "Processing summary computed"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{PartitionCutoffs, RerateScope};

    fn options(workers: usize, max_units_per_tx: u64, allow_billed_items: bool) -> RerateOptions {
        RerateOptions {
            workers,
            max_units_per_tx,
            use_existing_views: false,
            views: GraphViews::new("rerate").unwrap(),
            scope: RerateScope::All,
            cutoffs: PartitionCutoffs::default(),
            allow_billed_items,
        }
    }

    fn row(total_units: i64, billed_groups: i64) -> GraphSummaryRow {
        GraphSummaryRow {
            total_units,
            total_groups: 3,
            billed_groups,
            lots: 1,
            billed_amount_without_tax: Decimal::new(5000, 2),
        }
    }

    #[test]
    fn test_budget_from_total_and_workers() {
        let summary = ProcessingSummary::from_row(row(50, 0), &options(4, 100_000, false));

        assert_eq!(summary.total_units, 50);
        assert_eq!(summary.budget, 12);
        assert!(!summary.is_empty());
    }

    #[test]
    fn test_zero_units_is_empty() {
        let summary = ProcessingSummary::from_row(row(0, 0), &options(4, 100_000, false));

        assert!(summary.is_empty());
    }

    #[test]
    fn test_frozen_billed_groups_still_need_marking() {
        let frozen = ProcessingSummary::from_row(row(0, 2), &options(4, 100_000, false));
        assert!(!frozen.is_empty());
        assert_eq!(frozen.budget, 0);

        let allowed = ProcessingSummary::from_row(row(0, 2), &options(4, 100_000, true));
        assert!(allowed.is_empty());
    }
}
