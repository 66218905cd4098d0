//! Cancellation/recalculation executor
//!
//! Runs the fixed step sequence over one chunk's id range. Each step (and
//! each wave's recalculate-then-cancel pair) commits on its own, so a
//! failure rolls back only the failing step; the status guards make the
//! whole sequence safe to repeat.

use rust_decimal::Decimal;
use sqlx::PgPool;
use thiserror::Error;

use crate::repos::cancellation_repo::{self, ChunkRange, Wave};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

fn step_error(step: &'static str) -> impl FnOnce(sqlx::Error) -> ExecutorError {
    move |source| ExecutorError::Step { step, source }
}

/// Rows changed by each step of one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub failed_to_rerate: u64,
    pub invoice_lines_recalculated: u64,
    /// Billed amount without tax added back onto invoice lines, all waves
    pub amount_put_back: Decimal,
    pub rated_transactions_canceled: u64,
    pub edrs_canceled: u64,
    pub operations_canceled: u64,
}

impl ChunkReport {
    pub fn total_changes(&self) -> u64 {
        self.failed_to_rerate
            + self.invoice_lines_recalculated
            + self.rated_transactions_canceled
            + self.edrs_canceled
            + self.operations_canceled
    }
}

/// Apply the cancellation sequence to the rows `min_id..=max_id`
///
/// Order is fixed: F_TO_RERATE marking (when billed groups are frozen),
/// then for each wave the invoice line recalculation followed by the rated
/// transaction cancellation, then EDRs, then wave operations.
pub async fn apply_rating_cancellation(
    pool: &PgPool,
    range: &ChunkRange<'_>,
) -> Result<ChunkReport, ExecutorError> {
    let mut report = ChunkReport::default();

    if range.exclude_billed {
        let mut tx = pool.begin().await.map_err(step_error("mark_failed_to_rerate"))?;
        report.failed_to_rerate = cancellation_repo::tx_mark_failed_to_rerate(&mut tx, range)
            .await
            .map_err(step_error("mark_failed_to_rerate"))?;
        tx.commit().await.map_err(step_error("mark_failed_to_rerate"))?;

        tracing::debug!(rows = report.failed_to_rerate, "Marked F_TO_RERATE");
    }

    for wave in Wave::ALL {
        let step = wave_step(wave);
        let mut tx = pool.begin().await.map_err(step_error(step))?;

        let recalculated = cancellation_repo::tx_recalculate_invoice_lines(&mut tx, range, wave)
            .await
            .map_err(step_error(step))?;
        let canceled = cancellation_repo::tx_cancel_rated_transactions(&mut tx, range, wave)
            .await
            .map_err(step_error(step))?;

        tx.commit().await.map_err(step_error(step))?;

        tracing::debug!(
            wave = wave.label(),
            invoice_lines = recalculated.invoice_lines,
            amount = %recalculated.amount_without_tax,
            rated_transactions = canceled,
            "Wave cancelled"
        );

        report.invoice_lines_recalculated += recalculated.invoice_lines.max(0) as u64;
        report.amount_put_back += recalculated.amount_without_tax;
        report.rated_transactions_canceled += canceled;
    }

    let mut tx = pool.begin().await.map_err(step_error("cancel_edrs"))?;
    report.edrs_canceled = cancellation_repo::tx_cancel_edrs(&mut tx, range)
        .await
        .map_err(step_error("cancel_edrs"))?;
    tx.commit().await.map_err(step_error("cancel_edrs"))?;

    let mut tx = pool.begin().await.map_err(step_error("cancel_wave_operations"))?;
    report.operations_canceled = cancellation_repo::tx_cancel_wave_operations(&mut tx, range)
        .await
        .map_err(step_error("cancel_wave_operations"))?;
    tx.commit().await.map_err(step_error("cancel_wave_operations"))?;

    tracing::debug!(
        edrs = report.edrs_canceled,
        operations = report.operations_canceled,
        "Triggered EDRs and wave operations cancelled"
    );

    Ok(report)
}

fn wave_step(wave: Wave) -> &'static str {
    match wave {
        Wave::Primary => "cancel_primary_wave",
        Wave::PrimaryDiscount => "cancel_primary_discount_wave",
        Wave::Triggered => "cancel_triggered_wave",
        Wave::TriggeredDiscount => "cancel_triggered_discount_wave",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_names_the_step() {
        let err = step_error("cancel_edrs")(sqlx::Error::RowNotFound);

        assert!(err.to_string().starts_with("Step 'cancel_edrs' failed"));
    }

    #[test]
    fn test_total_changes() {
        let report = ChunkReport {
            failed_to_rerate: 2,
            invoice_lines_recalculated: 1,
            rated_transactions_canceled: 3,
            edrs_canceled: 0,
            operations_canceled: 4,
            ..Default::default()
        };

        assert_eq!(report.total_changes(), 10);
        assert_eq!(ChunkReport::default().total_changes(), 0);
    }
}
