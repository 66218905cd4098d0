//! Queries over wallet operations awaiting rerating

use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use crate::filters::{LedgerEntity, PartitionCutoffs, RerateScope};
use crate::models::{RatedTransactionStatus, WalletOperationStatus};
use crate::services::chunking::Packable;

/// A `TO_RERATE` wallet operation; each one is a single unit of work
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PendingOperation {
    pub id: i64,
    pub ba_id: i64,
}

impl Packable for PendingOperation {
    fn group_key(&self) -> i64 {
        self.ba_id
    }

    fn units(&self) -> u64 {
        1
    }

    fn position(&self) -> i64 {
        self.id
    }
}

/// Filters shared by the count and page queries
#[derive(Debug, Clone, Default)]
pub struct PendingFilter {
    pub scope: RerateScope,
    pub cutoffs: PartitionCutoffs,
}

impl PendingFilter {
    /// Operations still attached to an open or billed rated transaction
    /// are never eligible.
    fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" WHERE wo.status = ");
        qb.push_bind(WalletOperationStatus::ToRerate.as_str());
        qb.push(
            " AND (wo.rated_transaction_id IS NULL OR EXISTS (\
             SELECT 1 FROM billing_rated_transaction rt \
             WHERE rt.id = wo.rated_transaction_id AND rt.status = ",
        );
        qb.push_bind(RatedTransactionStatus::Canceled.as_str());
        qb.push("))");
        self.scope.push_bound(qb, "wo");
        self.cutoffs
            .push_bound(qb, LedgerEntity::WalletOperation, "wo");
    }
}

/// Number of operations awaiting rerating
pub async fn count_pending(pool: &PgPool, filter: &PendingFilter) -> Result<i64, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM billing_wallet_operation wo");
    filter.push_where(&mut qb);

    let (count,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
    Ok(count)
}

/// Next page in (billing account, id) order after the given key
pub async fn fetch_page(
    pool: &PgPool,
    filter: &PendingFilter,
    after: Option<(i64, i64)>,
    limit: i64,
) -> Result<Vec<PendingOperation>, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(
        "SELECT wo.id, wo.billing_account_id AS ba_id FROM billing_wallet_operation wo",
    );
    filter.push_where(&mut qb);

    if let Some((ba_id, id)) = after {
        qb.push(" AND (wo.billing_account_id, wo.id) > (");
        qb.push_bind(ba_id);
        qb.push(", ");
        qb.push_bind(id);
        qb.push(")");
    }

    qb.push(" ORDER BY wo.billing_account_id, wo.id LIMIT ");
    qb.push_bind(limit);

    qb.build_query_as::<PendingOperation>().fetch_all(pool).await
}
