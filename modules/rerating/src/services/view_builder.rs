//! Dependency-graph view builder
//!
//! Produces the [`GraphViews`] handle consumed by every later stage. Views
//! are rebuilt from scratch unless reuse of a previous run's views is
//! requested.

use sqlx::PgPool;

use crate::config::RerateOptions;
use crate::graph::GraphViews;
use crate::repos::graph_view_repo::{self, GraphFilters, GraphViewError};

/// Build (or reuse) the views of a run and return their handle
///
/// # Errors
/// Any SQL failure is fatal for the run. Creation happens in a single
/// transaction and a best-effort drop follows a failure, so no partial view
/// set is left behind.
pub async fn build_graph_views(
    pool: &PgPool,
    options: &RerateOptions,
) -> Result<GraphViews, GraphViewError> {
    let views = options.views.clone();

    if options.use_existing_views {
        graph_view_repo::ensure_views_exist(pool, &views).await?;
        tracing::info!(main = views.main(), "Reusing existing graph views");
        return Ok(views);
    }

    graph_view_repo::drop_views(pool, &views).await?;

    let filters = GraphFilters {
        scope: &options.scope,
        cutoffs: &options.cutoffs,
        max_units_per_tx: options.max_units_per_tx,
    };

    if let Err(e) = graph_view_repo::create_views(pool, &views, &filters).await {
        tracing::error!(prefix = views.prefix(), error = %e, "Graph view creation failed");
        if let Err(drop_err) = graph_view_repo::drop_views(pool, &views).await {
            tracing::warn!(error = %drop_err, "Failed to drop graph views after creation failure");
        }
        return Err(e);
    }

    tracing::info!(
        main = views.main(),
        triggered = views.triggered(),
        billed_marker = views.billed_marker(),
        "Graph views created"
    );

    Ok(views)
}

/// Drop the views of a run
pub async fn drop_graph_views(pool: &PgPool, views: &GraphViews) -> Result<(), GraphViewError> {
    graph_view_repo::drop_views(pool, views).await?;
    tracing::info!(prefix = views.prefix(), "Graph views dropped");
    Ok(())
}
