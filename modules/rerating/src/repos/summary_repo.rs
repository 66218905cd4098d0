//! Read-only aggregates over the main graph view

use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

use crate::graph::GraphViews;

/// Aggregates of one run's main graph
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct GraphSummaryRow {
    /// Wallet operations to rerate, excluding frozen groups
    pub total_units: i64,
    /// Billing accounts in the graph
    pub total_groups: i64,
    /// Billing accounts touching a billed invoice line
    pub billed_groups: i64,
    pub lots: i64,
    /// Billed amount moved back onto invoice lines (primary and discount waves)
    pub billed_amount_without_tax: Decimal,
}

/// Compute the summary; `exclude_billed` zeroes billed groups' units
pub async fn summarize(
    pool: &PgPool,
    views: &GraphViews,
    exclude_billed: bool,
) -> Result<GraphSummaryRow, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT COALESCE(SUM(g.wo_count) FILTER (WHERE NOT (g.billed AND $1)), 0)::BIGINT AS total_units,
               COUNT(DISTINCT g.ba_id)::BIGINT AS total_groups,
               COUNT(DISTINCT g.ba_id) FILTER (WHERE g.billed)::BIGINT AS billed_groups,
               COUNT(DISTINCT g.lot)::BIGINT AS lots,
               COALESCE(
                   SUM(g.rt_amount_without_tax + g.drt_amount_without_tax)
                       FILTER (WHERE NOT (g.billed AND $1)),
                   0
               ) AS billed_amount_without_tax
        FROM (
            SELECT m.*,
                   EXISTS (SELECT 1 FROM {marker} bm WHERE bm.ba_id = m.ba_id) AS billed
            FROM {main} m
        ) g
        "#,
        main = views.main(),
        marker = views.billed_marker(),
    );

    sqlx::query_as::<_, GraphSummaryRow>(&sql)
        .bind(exclude_billed)
        .fetch_one(pool)
        .await
}
