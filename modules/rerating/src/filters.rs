//! Typed filter predicates for graph and dispatcher queries
//!
//! Two renderings exist for every predicate:
//! - `push_bound` appends the predicate to a `QueryBuilder` with bound
//!   parameters (all DML and SELECT statements).
//! - `render_literal` produces a SQL fragment from validated typed values,
//!   for `CREATE MATERIALIZED VIEW` which cannot take bind parameters.
//!
//! Only `i64` ids and `NaiveDate` values ever reach a literal, so no caller
//! supplied text is interpolated.

use chrono::NaiveDate;
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;

/// Errors raised while parsing filter configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Unknown rerate target: {0} (expected ALL, NO_BATCH or WITH_BATCH)")]
    UnknownTarget(String),

    #[error("Invalid batch id: {0}")]
    InvalidBatchId(String),

    #[error("Batch ids are only allowed with the WITH_BATCH target")]
    BatchIdsWithoutBatchTarget,

    #[error("Invalid cutoff date for {entity}: {value}")]
    InvalidCutoffDate { entity: &'static str, value: String },
}

/// Which TO_RERATE wallet operations a run targets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RerateScope {
    #[default]
    All,
    /// Operations not attached to any rerate batch
    NoBatch,
    /// Operations attached to a batch; an empty list means any batch
    WithBatch(Vec<i64>),
}

impl RerateScope {
    /// Parse the target keyword and the comma separated batch id list
    pub fn parse(target: &str, batch_ids: &str) -> Result<Self, FilterError> {
        let ids = parse_batch_ids(batch_ids)?;

        match target.trim().to_uppercase().as_str() {
            "ALL" | "" if ids.is_empty() => Ok(RerateScope::All),
            "NO_BATCH" if ids.is_empty() => Ok(RerateScope::NoBatch),
            "ALL" | "" | "NO_BATCH" => Err(FilterError::BatchIdsWithoutBatchTarget),
            "WITH_BATCH" => Ok(RerateScope::WithBatch(ids)),
            other => Err(FilterError::UnknownTarget(other.to_string())),
        }
    }

    /// Render the predicate on `alias.rerate_batch_id` as a literal fragment
    pub fn render_literal(&self, alias: &str) -> Option<String> {
        match self {
            RerateScope::All => None,
            RerateScope::NoBatch => Some(format!("{alias}.rerate_batch_id IS NULL")),
            RerateScope::WithBatch(ids) if ids.is_empty() => {
                Some(format!("{alias}.rerate_batch_id IS NOT NULL"))
            }
            RerateScope::WithBatch(ids) => {
                let list = ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(format!("{alias}.rerate_batch_id IN ({list})"))
            }
        }
    }

    /// Append ` AND <predicate>` with bound parameters
    pub fn push_bound(&self, qb: &mut QueryBuilder<'_, Postgres>, alias: &str) {
        match self {
            RerateScope::All => {}
            RerateScope::NoBatch => {
                qb.push(format!(" AND {alias}.rerate_batch_id IS NULL"));
            }
            RerateScope::WithBatch(ids) if ids.is_empty() => {
                qb.push(format!(" AND {alias}.rerate_batch_id IS NOT NULL"));
            }
            RerateScope::WithBatch(ids) => {
                qb.push(format!(" AND {alias}.rerate_batch_id = ANY("));
                qb.push_bind(ids.clone());
                qb.push(")");
            }
        }
    }
}

fn parse_batch_ids(raw: &str) -> Result<Vec<i64>, FilterError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| FilterError::InvalidBatchId(s.to_string()))
        })
        .collect()
}

/// Ledger entities that carry a partitioning date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntity {
    WalletOperation,
    RatedTransaction,
    InvoiceLine,
    Edr,
}

impl LedgerEntity {
    /// Partition key column of the entity's table
    pub fn date_column(&self) -> &'static str {
        match self {
            LedgerEntity::WalletOperation => "operation_date",
            LedgerEntity::RatedTransaction => "usage_date",
            LedgerEntity::InvoiceLine => "value_date",
            LedgerEntity::Edr => "event_date",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LedgerEntity::WalletOperation => "wallet_operation",
            LedgerEntity::RatedTransaction => "rated_transaction",
            LedgerEntity::InvoiceLine => "invoice_line",
            LedgerEntity::Edr => "edr",
        }
    }
}

/// Per-entity lower bounds on the partition date
///
/// Rows older than the cutoff are never part of a rerate run, which lets
/// the planner prune whole partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionCutoffs {
    pub wallet_operation: Option<NaiveDate>,
    pub rated_transaction: Option<NaiveDate>,
    pub invoice_line: Option<NaiveDate>,
    pub edr: Option<NaiveDate>,
}

impl PartitionCutoffs {
    pub fn get(&self, entity: LedgerEntity) -> Option<NaiveDate> {
        match entity {
            LedgerEntity::WalletOperation => self.wallet_operation,
            LedgerEntity::RatedTransaction => self.rated_transaction,
            LedgerEntity::InvoiceLine => self.invoice_line,
            LedgerEntity::Edr => self.edr,
        }
    }

    /// Parse an optional `YYYY-MM-DD` cutoff for one entity
    pub fn parse_date(
        entity: LedgerEntity,
        raw: Option<&str>,
    ) -> Result<Option<NaiveDate>, FilterError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(None),
            Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| FilterError::InvalidCutoffDate {
                    entity: entity.label(),
                    value: value.to_string(),
                }),
        }
    }

    /// ` AND alias.<date column> >= DATE 'YYYY-MM-DD'`, or empty when unset
    pub fn render_literal(&self, entity: LedgerEntity, alias: &str) -> String {
        match self.get(entity) {
            Some(date) => format!(
                " AND {alias}.{} >= DATE '{}'",
                entity.date_column(),
                date.format("%Y-%m-%d")
            ),
            None => String::new(),
        }
    }

    pub fn push_bound(
        &self,
        qb: &mut QueryBuilder<'_, Postgres>,
        entity: LedgerEntity,
        alias: &str,
    ) {
        if let Some(date) = self.get(entity) {
            qb.push(format!(" AND {alias}.{} >= ", entity.date_column()));
            qb.push_bind(date);
        }
    }
}

/// Render an optional literal predicate as ` AND <predicate>`
pub fn and_clause(predicate: Option<String>) -> String {
    predicate.map(|p| format!(" AND {p}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scope_targets() {
        assert_eq!(RerateScope::parse("ALL", ""), Ok(RerateScope::All));
        assert_eq!(RerateScope::parse("no_batch", " "), Ok(RerateScope::NoBatch));
        assert_eq!(
            RerateScope::parse("WITH_BATCH", "3, 7,11"),
            Ok(RerateScope::WithBatch(vec![3, 7, 11]))
        );
        assert_eq!(
            RerateScope::parse("WITH_BATCH", ""),
            Ok(RerateScope::WithBatch(vec![]))
        );
    }

    #[test]
    fn test_parse_scope_rejects_bad_input() {
        assert_eq!(
            RerateScope::parse("SOME_BATCH", ""),
            Err(FilterError::UnknownTarget("SOME_BATCH".to_string()))
        );
        assert_eq!(
            RerateScope::parse("WITH_BATCH", "1,2); DROP TABLE x; --"),
            Err(FilterError::InvalidBatchId("2); DROP TABLE x; --".to_string()))
        );
        assert_eq!(
            RerateScope::parse("NO_BATCH", "4"),
            Err(FilterError::BatchIdsWithoutBatchTarget)
        );
    }

    #[test]
    fn test_scope_literal_rendering() {
        assert_eq!(RerateScope::All.render_literal("wo"), None);
        assert_eq!(
            RerateScope::NoBatch.render_literal("wo").unwrap(),
            "wo.rerate_batch_id IS NULL"
        );
        assert_eq!(
            RerateScope::WithBatch(vec![]).render_literal("wo").unwrap(),
            "wo.rerate_batch_id IS NOT NULL"
        );
        assert_eq!(
            RerateScope::WithBatch(vec![5, 9]).render_literal("wo").unwrap(),
            "wo.rerate_batch_id IN (5, 9)"
        );
    }

    #[test]
    fn test_scope_bound_rendering_uses_parameters() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM billing_wallet_operation wo WHERE TRUE");
        RerateScope::WithBatch(vec![5, 9]).push_bound(&mut qb, "wo");
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM billing_wallet_operation wo WHERE TRUE AND wo.rerate_batch_id = ANY($1)"
        );
    }

    #[test]
    fn test_cutoff_rendering() {
        let cutoffs = PartitionCutoffs {
            rated_transaction: NaiveDate::from_ymd_opt(2024, 3, 1),
            ..Default::default()
        };

        assert_eq!(
            cutoffs.render_literal(LedgerEntity::RatedTransaction, "rt"),
            " AND rt.usage_date >= DATE '2024-03-01'"
        );
        assert_eq!(cutoffs.render_literal(LedgerEntity::InvoiceLine, "il"), "");

        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        cutoffs.push_bound(&mut qb, LedgerEntity::RatedTransaction, "rt");
        cutoffs.push_bound(&mut qb, LedgerEntity::Edr, "e");
        assert_eq!(qb.sql(), "SELECT 1 WHERE TRUE AND rt.usage_date >= $1");
    }

    #[test]
    fn test_parse_cutoff_date() {
        assert_eq!(
            PartitionCutoffs::parse_date(LedgerEntity::Edr, Some("2025-01-31")),
            Ok(NaiveDate::from_ymd_opt(2025, 1, 31))
        );
        assert_eq!(PartitionCutoffs::parse_date(LedgerEntity::Edr, None), Ok(None));
        assert_eq!(PartitionCutoffs::parse_date(LedgerEntity::Edr, Some("")), Ok(None));
        assert!(matches!(
            PartitionCutoffs::parse_date(LedgerEntity::Edr, Some("31/01/2025")),
            Err(FilterError::InvalidCutoffDate { entity: "edr", .. })
        ));
    }

    #[test]
    fn test_and_clause() {
        assert_eq!(and_clause(None), "");
        assert_eq!(and_clause(Some("x = 1".to_string())), " AND x = 1");
    }
}
