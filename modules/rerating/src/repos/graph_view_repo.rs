//! Repository for the dependency-graph materialized views
//!
//! The three views of a run are built in one transaction: Postgres DDL is
//! transactional, so a failure leaves none of them behind. Filters reach the
//! DDL as validated literals (see `crate::filters`).

use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::filters::{and_clause, LedgerEntity, PartitionCutoffs, RerateScope};
use crate::graph::{GraphNameError, GraphViews};
use crate::models::{EdrStatus, InvoiceLineStatus, WalletOperationStatus};

/// Errors that can occur while building or inspecting graph views
#[derive(Debug, Error)]
pub enum GraphViewError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid view prefix: {0}")]
    InvalidViewPrefix(String),

    #[error("Graph views missing: {0}")]
    MissingViews(String),
}

impl From<GraphNameError> for GraphViewError {
    fn from(err: GraphNameError) -> Self {
        match err {
            GraphNameError::InvalidPrefix(prefix) => GraphViewError::InvalidViewPrefix(prefix),
        }
    }
}

/// Filters applied to the ledger while the views are built
#[derive(Debug, Clone)]
pub struct GraphFilters<'a> {
    pub scope: &'a RerateScope,
    pub cutoffs: &'a PartitionCutoffs,
    pub max_units_per_tx: u64,
}

/// Create the main, triggered and billed-marker views with their indexes
pub async fn create_views(
    pool: &PgPool,
    views: &GraphViews,
    filters: &GraphFilters<'_>,
) -> Result<(), GraphViewError> {
    let mut tx = pool.begin().await?;

    for statement in [
        main_graph_sql(views, filters),
        triggered_graph_sql(views, filters.cutoffs),
        billed_marker_sql(views),
    ] {
        sqlx::query(&statement).execute(&mut *tx).await?;
    }

    create_indexes(&mut tx, views).await?;
    tx.commit().await?;

    // Planner statistics for the freshly built views
    for view in [views.main(), views.triggered(), views.billed_marker()] {
        sqlx::query(&format!("ANALYZE {view}")).execute(pool).await?;
    }

    Ok(())
}

/// Names of the run's views currently present in the database
pub async fn existing_views(pool: &PgPool, views: &GraphViews) -> Result<Vec<String>, GraphViewError> {
    let names: Vec<String> = views.drop_order().iter().map(|v| v.to_string()).collect();

    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT matviewname::TEXT
        FROM pg_matviews
        WHERE schemaname = current_schema()
          AND matviewname = ANY($1)
        "#,
    )
    .bind(&names)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Check that all three views exist; used before reusing a previous run's views
pub async fn ensure_views_exist(pool: &PgPool, views: &GraphViews) -> Result<(), GraphViewError> {
    let present = existing_views(pool, views).await?;
    let missing: Vec<&str> = views
        .drop_order()
        .into_iter()
        .filter(|name| !present.iter().any(|p| p == name))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(GraphViewError::MissingViews(missing.join(", ")))
    }
}

/// Drop the run's views, dependents first; absent views are ignored
pub async fn drop_views(pool: &PgPool, views: &GraphViews) -> Result<(), GraphViewError> {
    for view in views.drop_order() {
        sqlx::query(&format!("DROP MATERIALIZED VIEW IF EXISTS {view}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn create_indexes(
    tx: &mut Transaction<'_, Postgres>,
    views: &GraphViews,
) -> Result<(), sqlx::Error> {
    let main = views.main();
    let triggered = views.triggered();
    let marker = views.billed_marker();

    let statements = [
        format!("CREATE UNIQUE INDEX {main}_id_idx ON {main} (id)"),
        format!("CREATE INDEX {main}_ba_idx ON {main} (ba_id)"),
        format!("CREATE UNIQUE INDEX {triggered}_id_idx ON {triggered} (id)"),
        format!("CREATE INDEX {triggered}_parent_idx ON {triggered} (parent_id)"),
        format!("CREATE INDEX {marker}_id_idx ON {marker} (id)"),
        format!("CREATE INDEX {marker}_ba_idx ON {marker} (ba_id)"),
        format!("CREATE INDEX {marker}_il_idx ON {marker} (billed_il_id)"),
    ];

    for statement in statements {
        sqlx::query(&statement).execute(&mut **tx).await?;
    }
    Ok(())
}

fn quoted(value: &str) -> String {
    format!("'{value}'")
}

fn active_wo_statuses() -> String {
    format!(
        "({}, {})",
        quoted(WalletOperationStatus::Open.as_str()),
        quoted(WalletOperationStatus::Billed.as_str())
    )
}

/// One row per (billing account, invoice line, discount invoice line)
///
/// `wo_count` and the rated amounts are attributed to a single row per
/// operation or transaction, so a discount fan-out never counts twice.
/// Row ids are ordered by account size so each account's rows are
/// consecutive.
pub(crate) fn main_graph_sql(views: &GraphViews, filters: &GraphFilters<'_>) -> String {
    let cutoffs = filters.cutoffs;
    let billed = quoted(InvoiceLineStatus::Billed.as_str());
    let active = active_wo_statuses();
    // Lots are cut by the configured cap: the effective chunk budget needs
    // this view's totals and is only known once it exists.
    let lot_size = filters.max_units_per_tx.max(1);

    format!(
        r#"
        CREATE MATERIALIZED VIEW {main} AS
        WITH base AS (
            SELECT wo.billing_account_id AS ba_id,
                   wo.id AS wo_id,
                   rt.id AS rt_id,
                   rt.status AS rt_status,
                   rt.amount_without_tax AS rt_amount_without_tax,
                   rt.amount_with_tax AS rt_amount_with_tax,
                   rt.amount_tax AS rt_amount_tax,
                   rt.quantity AS rt_quantity,
                   il.id AS il_id,
                   il.status AS il_status,
                   dwo.id AS dwo_id,
                   drt.id AS drt_id,
                   drt.status AS drt_status,
                   drt.amount_without_tax AS drt_amount_without_tax,
                   drt.amount_with_tax AS drt_amount_with_tax,
                   drt.amount_tax AS drt_amount_tax,
                   drt.quantity AS drt_quantity,
                   dil.id AS dil_id,
                   dil.status AS dil_status,
                   ROW_NUMBER() OVER (
                       PARTITION BY wo.id ORDER BY dil.id NULLS FIRST, dwo.id NULLS FIRST
                   ) AS wo_rank,
                   ROW_NUMBER() OVER (
                       PARTITION BY rt.id ORDER BY wo.id, dil.id NULLS FIRST, dwo.id NULLS FIRST
                   ) AS rt_rank,
                   ROW_NUMBER() OVER (
                       PARTITION BY drt.id ORDER BY dwo.id
                   ) AS drt_rank
            FROM billing_wallet_operation wo
            LEFT JOIN billing_rated_transaction rt
                   ON rt.id = wo.rated_transaction_id{rt_cutoff}
            LEFT JOIN billing_invoice_line il
                   ON il.id = rt.invoice_line_id{il_cutoff}
            LEFT JOIN billing_wallet_operation dwo
                   ON dwo.discounted_wallet_operation_id = wo.id
                  AND dwo.status IN {active}{dwo_cutoff}
            LEFT JOIN billing_rated_transaction drt
                   ON drt.id = dwo.rated_transaction_id{drt_cutoff}
            LEFT JOIN billing_invoice_line dil
                   ON dil.id = drt.invoice_line_id{dil_cutoff}
            WHERE wo.status = {to_rerate}{scope}{wo_cutoff}
        ),
        grouped AS (
            SELECT ba_id,
                   il_id,
                   MAX(il_status) AS il_status,
                   dil_id,
                   MAX(dil_status) AS dil_status,
                   ARRAY_AGG(DISTINCT wo_id) AS wo_ids,
                   COUNT(DISTINCT wo_id) FILTER (WHERE wo_rank = 1) AS wo_count,
                   COALESCE(ARRAY_AGG(DISTINCT rt_id) FILTER (WHERE rt_id IS NOT NULL AND rt_rank = 1), '{{}}'::BIGINT[]) AS rt_ids,
                   COALESCE(SUM(rt_amount_without_tax) FILTER (WHERE rt_rank = 1 AND rt_status = {billed}), 0) AS rt_amount_without_tax,
                   COALESCE(SUM(rt_amount_with_tax) FILTER (WHERE rt_rank = 1 AND rt_status = {billed}), 0) AS rt_amount_with_tax,
                   COALESCE(SUM(rt_amount_tax) FILTER (WHERE rt_rank = 1 AND rt_status = {billed}), 0) AS rt_amount_tax,
                   COALESCE(SUM(rt_quantity) FILTER (WHERE rt_rank = 1 AND rt_status = {billed}), 0) AS rt_quantity,
                   COALESCE(ARRAY_AGG(DISTINCT dwo_id) FILTER (WHERE dwo_id IS NOT NULL), '{{}}'::BIGINT[]) AS dwo_ids,
                   COALESCE(ARRAY_AGG(DISTINCT drt_id) FILTER (WHERE drt_id IS NOT NULL AND drt_rank = 1), '{{}}'::BIGINT[]) AS drt_ids,
                   COALESCE(SUM(drt_amount_without_tax) FILTER (WHERE drt_rank = 1 AND drt_status = {billed}), 0) AS drt_amount_without_tax,
                   COALESCE(SUM(drt_amount_with_tax) FILTER (WHERE drt_rank = 1 AND drt_status = {billed}), 0) AS drt_amount_with_tax,
                   COALESCE(SUM(drt_amount_tax) FILTER (WHERE drt_rank = 1 AND drt_status = {billed}), 0) AS drt_amount_tax,
                   COALESCE(SUM(drt_quantity) FILTER (WHERE drt_rank = 1 AND drt_status = {billed}), 0) AS drt_quantity
            FROM base
            GROUP BY ba_id, il_id, dil_id
        ),
        sized AS (
            SELECT grouped.*,
                   (SUM(wo_count) OVER (PARTITION BY ba_id))::BIGINT AS group_units
            FROM grouped
        ),
        numbered AS (
            SELECT ROW_NUMBER() OVER (
                       ORDER BY group_units DESC, ba_id, il_id NULLS FIRST, dil_id NULLS FIRST
                   ) AS id,
                   sized.*
            FROM sized
        )
        SELECT id,
               id / {lot_size} AS lot,
               ba_id,
               il_id,
               il_status,
               dil_id,
               dil_status,
               wo_ids,
               wo_count,
               rt_ids,
               rt_amount_without_tax,
               rt_amount_with_tax,
               rt_amount_tax,
               rt_quantity,
               dwo_ids,
               drt_ids,
               drt_amount_without_tax,
               drt_amount_with_tax,
               drt_amount_tax,
               drt_quantity,
               group_units
        FROM numbered
        "#,
        main = views.main(),
        to_rerate = quoted(WalletOperationStatus::ToRerate.as_str()),
        scope = and_clause(filters.scope.render_literal("wo")),
        wo_cutoff = cutoffs.render_literal(LedgerEntity::WalletOperation, "wo"),
        rt_cutoff = cutoffs.render_literal(LedgerEntity::RatedTransaction, "rt"),
        il_cutoff = cutoffs.render_literal(LedgerEntity::InvoiceLine, "il"),
        dwo_cutoff = cutoffs.render_literal(LedgerEntity::WalletOperation, "dwo"),
        drt_cutoff = cutoffs.render_literal(LedgerEntity::RatedTransaction, "drt"),
        dil_cutoff = cutoffs.render_literal(LedgerEntity::InvoiceLine, "dil"),
    )
}

/// EDRs triggered by unbilled main rows, and the operations they triggered
///
/// Each triggering operation is attributed to one main row (`parent_id`),
/// which places the whole triggered subtree inside that row's chunk.
pub(crate) fn triggered_graph_sql(views: &GraphViews, cutoffs: &PartitionCutoffs) -> String {
    let billed = quoted(InvoiceLineStatus::Billed.as_str());
    let active = active_wo_statuses();

    format!(
        r#"
        CREATE MATERIALIZED VIEW {triggered} AS
        WITH sources AS (
            SELECT DISTINCT ON (u.wo_id) m.id AS parent_id, m.ba_id, u.wo_id
            FROM {main} m
            CROSS JOIN LATERAL UNNEST(m.wo_ids) AS u(wo_id)
            WHERE m.il_status IS DISTINCT FROM {billed}
              AND m.dil_status IS DISTINCT FROM {billed}
            ORDER BY u.wo_id, m.id
        ),
        base AS (
            SELECT s.parent_id,
                   s.ba_id,
                   e.id AS edr_id,
                   two.id AS two_id,
                   trt.id AS trt_id,
                   trt.status AS trt_status,
                   trt.amount_without_tax AS trt_amount_without_tax,
                   trt.amount_with_tax AS trt_amount_with_tax,
                   trt.amount_tax AS trt_amount_tax,
                   trt.quantity AS trt_quantity,
                   til.id AS til_id,
                   til.status AS til_status,
                   tdwo.id AS tdwo_id,
                   tdrt.id AS tdrt_id,
                   tdrt.status AS tdrt_status,
                   tdrt.amount_without_tax AS tdrt_amount_without_tax,
                   tdrt.amount_with_tax AS tdrt_amount_with_tax,
                   tdrt.amount_tax AS tdrt_amount_tax,
                   tdrt.quantity AS tdrt_quantity,
                   tdil.id AS tdil_id,
                   tdil.status AS tdil_status,
                   ROW_NUMBER() OVER (
                       PARTITION BY two.id ORDER BY tdil.id NULLS FIRST, tdwo.id NULLS FIRST
                   ) AS two_rank,
                   ROW_NUMBER() OVER (
                       PARTITION BY trt.id ORDER BY two.id, tdil.id NULLS FIRST, tdwo.id NULLS FIRST
                   ) AS trt_rank,
                   ROW_NUMBER() OVER (
                       PARTITION BY tdrt.id ORDER BY tdwo.id
                   ) AS tdrt_rank
            FROM sources s
            JOIN rating_edr e
              ON e.wallet_operation_id = s.wo_id
             AND e.status = {edr_open}{edr_cutoff}
            LEFT JOIN billing_wallet_operation two
                   ON two.edr_id = e.id
                  AND two.status IN {active}{two_cutoff}
            LEFT JOIN billing_rated_transaction trt
                   ON trt.id = two.rated_transaction_id{trt_cutoff}
            LEFT JOIN billing_invoice_line til
                   ON til.id = trt.invoice_line_id{til_cutoff}
            LEFT JOIN billing_wallet_operation tdwo
                   ON tdwo.discounted_wallet_operation_id = two.id
                  AND tdwo.status IN {active}{tdwo_cutoff}
            LEFT JOIN billing_rated_transaction tdrt
                   ON tdrt.id = tdwo.rated_transaction_id{tdrt_cutoff}
            LEFT JOIN billing_invoice_line tdil
                   ON tdil.id = tdrt.invoice_line_id{tdil_cutoff}
        ),
        grouped AS (
            SELECT parent_id,
                   ba_id,
                   til_id,
                   MAX(til_status) AS til_status,
                   tdil_id,
                   MAX(tdil_status) AS tdil_status,
                   ARRAY_AGG(DISTINCT edr_id) AS edr_ids,
                   COALESCE(ARRAY_AGG(DISTINCT two_id) FILTER (WHERE two_id IS NOT NULL), '{{}}'::BIGINT[]) AS two_ids,
                   COUNT(DISTINCT two_id) FILTER (WHERE two_rank = 1) AS two_count,
                   COALESCE(ARRAY_AGG(DISTINCT trt_id) FILTER (WHERE trt_id IS NOT NULL AND trt_rank = 1), '{{}}'::BIGINT[]) AS trt_ids,
                   COALESCE(SUM(trt_amount_without_tax) FILTER (WHERE trt_rank = 1 AND trt_status = {billed}), 0) AS trt_amount_without_tax,
                   COALESCE(SUM(trt_amount_with_tax) FILTER (WHERE trt_rank = 1 AND trt_status = {billed}), 0) AS trt_amount_with_tax,
                   COALESCE(SUM(trt_amount_tax) FILTER (WHERE trt_rank = 1 AND trt_status = {billed}), 0) AS trt_amount_tax,
                   COALESCE(SUM(trt_quantity) FILTER (WHERE trt_rank = 1 AND trt_status = {billed}), 0) AS trt_quantity,
                   COALESCE(ARRAY_AGG(DISTINCT tdwo_id) FILTER (WHERE tdwo_id IS NOT NULL), '{{}}'::BIGINT[]) AS tdwo_ids,
                   COALESCE(ARRAY_AGG(DISTINCT tdrt_id) FILTER (WHERE tdrt_id IS NOT NULL AND tdrt_rank = 1), '{{}}'::BIGINT[]) AS tdrt_ids,
                   COALESCE(SUM(tdrt_amount_without_tax) FILTER (WHERE tdrt_rank = 1 AND tdrt_status = {billed}), 0) AS tdrt_amount_without_tax,
                   COALESCE(SUM(tdrt_amount_with_tax) FILTER (WHERE tdrt_rank = 1 AND tdrt_status = {billed}), 0) AS tdrt_amount_with_tax,
                   COALESCE(SUM(tdrt_amount_tax) FILTER (WHERE tdrt_rank = 1 AND tdrt_status = {billed}), 0) AS tdrt_amount_tax,
                   COALESCE(SUM(tdrt_quantity) FILTER (WHERE tdrt_rank = 1 AND tdrt_status = {billed}), 0) AS tdrt_quantity
            FROM base
            GROUP BY parent_id, ba_id, til_id, tdil_id
        )
        SELECT ROW_NUMBER() OVER (
                   ORDER BY parent_id, til_id NULLS FIRST, tdil_id NULLS FIRST
               ) AS id,
               grouped.*
        FROM grouped
        "#,
        triggered = views.triggered(),
        main = views.main(),
        edr_open = quoted(EdrStatus::Open.as_str()),
        edr_cutoff = cutoffs.render_literal(LedgerEntity::Edr, "e"),
        two_cutoff = cutoffs.render_literal(LedgerEntity::WalletOperation, "two"),
        trt_cutoff = cutoffs.render_literal(LedgerEntity::RatedTransaction, "trt"),
        til_cutoff = cutoffs.render_literal(LedgerEntity::InvoiceLine, "til"),
        tdwo_cutoff = cutoffs.render_literal(LedgerEntity::WalletOperation, "tdwo"),
        tdrt_cutoff = cutoffs.render_literal(LedgerEntity::RatedTransaction, "tdrt"),
        tdil_cutoff = cutoffs.render_literal(LedgerEntity::InvoiceLine, "tdil"),
    )
}

/// Main-row ids whose wave already sits on a billed invoice line
pub(crate) fn billed_marker_sql(views: &GraphViews) -> String {
    format!(
        r#"
        CREATE MATERIALIZED VIEW {marker} AS
        SELECT m.id, m.ba_id, m.il_id AS billed_il_id
        FROM {main} m WHERE m.il_status = {billed}
        UNION
        SELECT m.id, m.ba_id, m.dil_id
        FROM {main} m WHERE m.dil_status = {billed}
        UNION
        SELECT t.parent_id, t.ba_id, t.til_id
        FROM {triggered} t WHERE t.til_status = {billed}
        UNION
        SELECT t.parent_id, t.ba_id, t.tdil_id
        FROM {triggered} t WHERE t.tdil_status = {billed}
        "#,
        marker = views.billed_marker(),
        main = views.main(),
        triggered = views.triggered(),
        billed = quoted(InvoiceLineStatus::Billed.as_str()),
    )
}
