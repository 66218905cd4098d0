//! Bulk ledger mutations of the cancellation executor
//!
//! Every statement joins the ledger against a graph view restricted to
//! `id BETWEEN $1 AND $2` (main rows) or `parent_id BETWEEN $1 AND $2`
//! (triggered rows), and guards on the current status so a re-run changes
//! nothing.

use rust_decimal::Decimal;
use sqlx::{FromRow, Postgres, Transaction};

use crate::graph::GraphViews;
use crate::models::{EdrStatus, RatedTransactionStatus, WalletOperationStatus};

/// Reject reason written on cancelled rated transactions and EDRs
pub const RERATED_REASON: &str = "origin wallet operation has been rerated";

/// Prefix of the reject reason on operations refused because of a billed line
pub const BILLED_LINE_REASON: &str = "Rerating refused, invoice line already billed: ";

/// The four cancellation targets of a group, in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wave {
    Primary,
    PrimaryDiscount,
    Triggered,
    TriggeredDiscount,
}

impl Wave {
    pub const ALL: [Wave; 4] = [
        Wave::Primary,
        Wave::PrimaryDiscount,
        Wave::Triggered,
        Wave::TriggeredDiscount,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Wave::Primary => "primary",
            Wave::PrimaryDiscount => "primary_discount",
            Wave::Triggered => "triggered",
            Wave::TriggeredDiscount => "triggered_discount",
        }
    }

    fn is_triggered(&self) -> bool {
        matches!(self, Wave::Triggered | Wave::TriggeredDiscount)
    }

    /// View holding the wave's rows
    fn view<'a>(&self, views: &'a GraphViews) -> &'a str {
        if self.is_triggered() {
            views.triggered()
        } else {
            views.main()
        }
    }

    /// Column carrying the main-graph row id
    fn range_column(&self) -> &'static str {
        if self.is_triggered() {
            "parent_id"
        } else {
            "id"
        }
    }

    /// Column with the wave's rated transaction ids
    fn rt_column(&self) -> &'static str {
        match self {
            Wave::Primary => "rt_ids",
            Wave::PrimaryDiscount => "drt_ids",
            Wave::Triggered => "trt_ids",
            Wave::TriggeredDiscount => "tdrt_ids",
        }
    }
}

/// Id range of one chunk over a run's views
#[derive(Debug, Clone, Copy)]
pub struct ChunkRange<'a> {
    pub views: &'a GraphViews,
    pub min_id: i64,
    pub max_id: i64,
    /// Skip groups on the billed-marker set
    pub exclude_billed: bool,
}

impl ChunkRange<'_> {
    /// ` AND NOT EXISTS (...)` for groups on the billed-marker set, or empty
    fn billed_exclusion(&self, alias: &str) -> String {
        if self.exclude_billed {
            format!(
                " AND NOT EXISTS (SELECT 1 FROM {} bm WHERE bm.ba_id = {alias}.ba_id)",
                self.views.billed_marker()
            )
        } else {
            String::new()
        }
    }
}

/// Mark the range's wallet operations whose group touches a billed line
///
/// The reject reason names the lowest billed invoice line id of the group.
pub async fn tx_mark_failed_to_rerate(
    tx: &mut Transaction<'_, Postgres>,
    range: &ChunkRange<'_>,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        r#"
        WITH targets AS (
            SELECT DISTINCT u.wo_id, b.billed_il_id
            FROM {main} g
            CROSS JOIN LATERAL (
                SELECT MIN(bm.billed_il_id) AS billed_il_id
                FROM {marker} bm
                WHERE bm.ba_id = g.ba_id
            ) b
            CROSS JOIN LATERAL UNNEST(g.wo_ids) AS u(wo_id)
            WHERE g.id BETWEEN $1 AND $2
              AND b.billed_il_id IS NOT NULL
        )
        UPDATE billing_wallet_operation wo
        SET status = $3,
            reject_reason = $4 || t.billed_il_id::TEXT,
            updated_at = NOW()
        FROM targets t
        WHERE wo.id = t.wo_id
          AND wo.status = $5
        "#,
        main = range.views.main(),
        marker = range.views.billed_marker(),
    );

    let result = sqlx::query(&sql)
        .bind(range.min_id)
        .bind(range.max_id)
        .bind(WalletOperationStatus::FailedToRerate.as_str())
        .bind(BILLED_LINE_REASON)
        .bind(WalletOperationStatus::ToRerate.as_str())
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected())
}

/// Invoice lines touched by one recalculation and the amount added to them
#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow)]
pub struct InvoiceLineRecalculation {
    pub invoice_lines: i64,
    pub amount_without_tax: Decimal,
}

/// Add the wave's still-billed rated amounts onto their invoice lines
///
/// Amounts are read from the live rated transactions, so once the wave's
/// transactions are cancelled the same call adds nothing.
pub async fn tx_recalculate_invoice_lines(
    tx: &mut Transaction<'_, Postgres>,
    range: &ChunkRange<'_>,
    wave: Wave,
) -> Result<InvoiceLineRecalculation, sqlx::Error> {
    let sql = format!(
        r#"
        WITH rts AS (
            SELECT DISTINCT UNNEST(g.{rt_column}) AS rt_id
            FROM {view} g
            WHERE g.{range_column} BETWEEN $1 AND $2{exclusion}
        ),
        deltas AS (
            SELECT rt.invoice_line_id AS il_id,
                   SUM(rt.amount_without_tax) AS amount_without_tax,
                   SUM(rt.amount_with_tax) AS amount_with_tax,
                   SUM(rt.amount_tax) AS amount_tax,
                   SUM(rt.quantity) AS quantity
            FROM rts
            JOIN billing_rated_transaction rt ON rt.id = rts.rt_id
            WHERE rt.status = $3
              AND rt.invoice_line_id IS NOT NULL
            GROUP BY rt.invoice_line_id
        ),
        updated AS (
            UPDATE billing_invoice_line il
            SET amount_without_tax = il.amount_without_tax + d.amount_without_tax,
                amount_with_tax = il.amount_with_tax + d.amount_with_tax,
                amount_tax = il.amount_tax + d.amount_tax,
                quantity = il.quantity + d.quantity,
                updated_at = NOW()
            FROM deltas d
            WHERE il.id = d.il_id
            RETURNING d.amount_without_tax
        )
        SELECT COUNT(*)::BIGINT AS invoice_lines,
               COALESCE(SUM(amount_without_tax), 0) AS amount_without_tax
        FROM updated
        "#,
        rt_column = wave.rt_column(),
        view = wave.view(range.views),
        range_column = wave.range_column(),
        exclusion = range.billed_exclusion("g"),
    );

    sqlx::query_as::<_, InvoiceLineRecalculation>(&sql)
        .bind(range.min_id)
        .bind(range.max_id)
        .bind(RatedTransactionStatus::Billed.as_str())
        .fetch_one(&mut **tx)
        .await
}

/// Cancel the wave's open or billed rated transactions
pub async fn tx_cancel_rated_transactions(
    tx: &mut Transaction<'_, Postgres>,
    range: &ChunkRange<'_>,
    wave: Wave,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        r#"
        UPDATE billing_rated_transaction rt
        SET status = $3,
            reject_reason = $4,
            updated_at = NOW()
        FROM (
            SELECT DISTINCT UNNEST(g.{rt_column}) AS rt_id
            FROM {view} g
            WHERE g.{range_column} BETWEEN $1 AND $2{exclusion}
        ) x
        WHERE rt.id = x.rt_id
          AND rt.status = ANY($5)
        "#,
        rt_column = wave.rt_column(),
        view = wave.view(range.views),
        range_column = wave.range_column(),
        exclusion = range.billed_exclusion("g"),
    );

    let result = sqlx::query(&sql)
        .bind(range.min_id)
        .bind(range.max_id)
        .bind(RatedTransactionStatus::Canceled.as_str())
        .bind(RERATED_REASON)
        .bind(vec![
            RatedTransactionStatus::Open.as_str(),
            RatedTransactionStatus::Billed.as_str(),
        ])
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected())
}

/// Cancel the EDRs of the range's triggered rows
pub async fn tx_cancel_edrs(
    tx: &mut Transaction<'_, Postgres>,
    range: &ChunkRange<'_>,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        r#"
        UPDATE rating_edr e
        SET status = $3,
            reject_reason = $4,
            updated_at = NOW()
        FROM (
            SELECT DISTINCT UNNEST(t.edr_ids) AS edr_id
            FROM {triggered} t
            WHERE t.parent_id BETWEEN $1 AND $2{exclusion}
        ) x
        WHERE e.id = x.edr_id
          AND e.status = $5
        "#,
        triggered = range.views.triggered(),
        exclusion = range.billed_exclusion("t"),
    );

    let result = sqlx::query(&sql)
        .bind(range.min_id)
        .bind(range.max_id)
        .bind(EdrStatus::Cancelled.as_str())
        .bind(RERATED_REASON)
        .bind(EdrStatus::Open.as_str())
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected())
}

/// Cancel discount, triggered and triggered-discount wallet operations
///
/// Primary operations stay `TO_RERATE` for the dispatcher.
pub async fn tx_cancel_wave_operations(
    tx: &mut Transaction<'_, Postgres>,
    range: &ChunkRange<'_>,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        r#"
        WITH targets AS (
            SELECT UNNEST(g.dwo_ids) AS wo_id
            FROM {main} g
            WHERE g.id BETWEEN $1 AND $2{main_exclusion}
            UNION
            SELECT UNNEST(t.two_ids || t.tdwo_ids)
            FROM {triggered} t
            WHERE t.parent_id BETWEEN $1 AND $2{triggered_exclusion}
        )
        UPDATE billing_wallet_operation wo
        SET status = $3,
            updated_at = NOW()
        FROM targets x
        WHERE wo.id = x.wo_id
          AND wo.status = ANY($4)
        "#,
        main = range.views.main(),
        triggered = range.views.triggered(),
        main_exclusion = range.billed_exclusion("g"),
        triggered_exclusion = range.billed_exclusion("t"),
    );

    let result = sqlx::query(&sql)
        .bind(range.min_id)
        .bind(range.max_id)
        .bind(WalletOperationStatus::Canceled.as_str())
        .bind(vec![
            WalletOperationStatus::Open.as_str(),
            WalletOperationStatus::Billed.as_str(),
        ])
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wave_order_and_columns() {
        let labels: Vec<&str> = Wave::ALL.iter().map(Wave::label).collect();
        assert_eq!(
            labels,
            vec!["primary", "primary_discount", "triggered", "triggered_discount"]
        );

        let views = GraphViews::new("rr").unwrap();
        assert_eq!(Wave::Primary.view(&views), "rr_main_graph");
        assert_eq!(Wave::PrimaryDiscount.rt_column(), "drt_ids");
        assert_eq!(Wave::Triggered.view(&views), "rr_triggered_graph");
        assert_eq!(Wave::TriggeredDiscount.range_column(), "parent_id");
    }

    #[test]
    fn test_billed_exclusion_follows_policy() {
        let views = GraphViews::new("rr").unwrap();
        let mut range = ChunkRange {
            views: &views,
            min_id: 1,
            max_id: 10,
            exclude_billed: true,
        };

        assert_eq!(
            range.billed_exclusion("g"),
            " AND NOT EXISTS (SELECT 1 FROM rr_billed_marker bm WHERE bm.ba_id = g.ba_id)"
        );

        range.exclude_billed = false;
        assert!(range.billed_exclusion("t").is_empty());
    }
}
