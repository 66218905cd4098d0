//! Keyset pages over the main graph view, in row id order

use sqlx::{FromRow, PgPool};

use crate::graph::GraphViews;
use crate::services::chunking::Packable;

/// Main-graph row as seen by the chunk cursor
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct GraphRow {
    pub id: i64,
    pub ba_id: i64,
    /// Wave units of the row; zero for frozen billed groups
    pub units: i64,
}

impl Packable for GraphRow {
    fn group_key(&self) -> i64 {
        self.ba_id
    }

    fn units(&self) -> u64 {
        self.units.max(0) as u64
    }

    fn position(&self) -> i64 {
        self.id
    }
}

/// Fetch up to `limit` rows with `id > after_id`
pub async fn fetch_page(
    pool: &PgPool,
    views: &GraphViews,
    exclude_billed: bool,
    after_id: i64,
    limit: i64,
) -> Result<Vec<GraphRow>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT g.id,
               g.ba_id,
               CASE
                   WHEN $1 AND EXISTS (SELECT 1 FROM {marker} bm WHERE bm.ba_id = g.ba_id) THEN 0
                   ELSE g.wo_count
               END AS units
        FROM {main} g
        WHERE g.id > $2
        ORDER BY g.id
        LIMIT $3
        "#,
        main = views.main(),
        marker = views.billed_marker(),
    );

    sqlx::query_as::<_, GraphRow>(&sql)
        .bind(exclude_billed)
        .bind(after_id)
        .bind(limit)
        .fetch_all(pool)
        .await
}
