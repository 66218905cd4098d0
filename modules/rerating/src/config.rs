use chrono::NaiveDate;
use std::env;
use std::time::Duration;

use crate::filters::{LedgerEntity, PartitionCutoffs, RerateScope};
use crate::graph::GraphViews;
use crate::job::JobLimits;

/// Options of the rating cancellation run
#[derive(Debug, Clone)]
pub struct RerateOptions {
    pub workers: usize,
    pub max_units_per_tx: u64,
    pub use_existing_views: bool,
    pub views: GraphViews,
    pub scope: RerateScope,
    pub cutoffs: PartitionCutoffs,
    pub allow_billed_items: bool,
}

/// Options forwarded to the rating engine by the dispatcher
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub use_same_price_plan: bool,
    pub edr_date_filter: Option<NaiveDate>,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub rerate: RerateOptions,
    pub dispatch: DispatchOptions,
    pub limits: JobLimits,
    pub rating_engine_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from any key lookup (the environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| "DATABASE_URL must be set".to_string())?;

        let workers: usize = lookup("RERATE_WORKERS")
            .unwrap_or_else(|| "4".to_string())
            .parse()
            .map_err(|_| "RERATE_WORKERS must be a positive integer".to_string())?;
        if workers == 0 {
            return Err("RERATE_WORKERS must be at least 1".to_string());
        }

        let max_units_per_tx: u64 = lookup("RERATE_MAX_UNITS_PER_TX")
            .unwrap_or_else(|| "100000".to_string())
            .parse()
            .map_err(|_| "RERATE_MAX_UNITS_PER_TX must be a non-negative integer".to_string())?;

        let use_existing_views = parse_flag(&lookup, "RERATE_USE_EXISTING_VIEWS")?;
        let allow_billed_items = parse_flag(&lookup, "RERATE_ALLOW_BILLED_ITEMS")?;
        let use_same_price_plan = parse_flag(&lookup, "RERATE_USE_SAME_PRICE_PLAN")?;

        let prefix = lookup("RERATE_VIEW_PREFIX").unwrap_or_else(|| "rerate".to_string());
        let views = GraphViews::new(&prefix).map_err(|e| e.to_string())?;

        let scope = RerateScope::parse(
            &lookup("RERATE_TARGET").unwrap_or_else(|| "ALL".to_string()),
            &lookup("RERATE_BATCH_IDS").unwrap_or_default(),
        )
        .map_err(|e| e.to_string())?;

        let cutoff = |key: &str, entity: LedgerEntity| {
            PartitionCutoffs::parse_date(entity, lookup(key).as_deref()).map_err(|e| e.to_string())
        };
        let cutoffs = PartitionCutoffs {
            wallet_operation: cutoff("RERATE_CUTOFF_WO", LedgerEntity::WalletOperation)?,
            rated_transaction: cutoff("RERATE_CUTOFF_RT", LedgerEntity::RatedTransaction)?,
            invoice_line: cutoff("RERATE_CUTOFF_IL", LedgerEntity::InvoiceLine)?,
            edr: cutoff("RERATE_CUTOFF_EDR", LedgerEntity::Edr)?,
        };

        let edr_date_filter = match lookup("RERATE_EDR_DATE_FILTER").filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .map_err(|_| "RERATE_EDR_DATE_FILTER must be YYYY-MM-DD".to_string())?,
            ),
            None => None,
        };

        let max_items = match lookup("JOB_MAX_ITEMS") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| "JOB_MAX_ITEMS must be a non-negative integer".to_string())?,
            ),
            None => None,
        };

        let max_duration = match lookup("JOB_MAX_DURATION_SECS") {
            Some(raw) => Some(Duration::from_secs(
                raw.parse::<u64>()
                    .map_err(|_| "JOB_MAX_DURATION_SECS must be a non-negative integer".to_string())?,
            )),
            None => None,
        };

        let rating_engine_url = lookup("RATING_ENGINE_URL").filter(|s| !s.trim().is_empty());

        Ok(Config {
            database_url,
            rerate: RerateOptions {
                workers,
                max_units_per_tx,
                use_existing_views,
                views,
                scope,
                cutoffs,
                allow_billed_items,
            },
            dispatch: DispatchOptions {
                use_same_price_plan,
                edr_date_filter,
            },
            limits: JobLimits {
                max_items,
                max_duration,
            },
            rating_engine_url,
        })
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<bool, String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "" | "false" | "0" | "no" => Ok(false),
            "true" | "1" | "yes" => Ok(true),
            _ => Err(format!("{key} must be true or false")),
        },
    }
}
