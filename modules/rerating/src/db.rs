use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Initialize a connection pool to the ledger database
///
/// # Connection Limits
/// - Default: one connection per worker plus two for the cursor and view builder
/// - `DB_MAX_CONNECTIONS` overrides the computed maximum
/// - `DB_MIN_CONNECTIONS` / `DB_ACQUIRE_TIMEOUT_SECS` tune idle and wait behaviour
pub async fn init_pool(database_url: &str, workers: usize) -> Result<PgPool, sqlx::Error> {
    let max_connections = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(workers as u32 + 2);

    let min_connections = std::env::var("DB_MIN_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);

    // Bulk updates over large chunks hold connections for a while; workers
    // waiting for one should not fail fast.
    let acquire_timeout_secs = std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect(database_url)
        .await
}
