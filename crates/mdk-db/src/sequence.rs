//! Branch+domain scoped bill-number allocation.
//!
//! One `number_sequences` row per `(branch_code, domain)` pair. Allocation
//! is a single upsert-increment that returns the new value:
//!
//! - the row lock serializes same-key callers, so two concurrent visits on
//!   one branch get distinct consecutive numbers;
//! - different keys live on different rows and never block each other;
//! - the statement runs on the pool, NOT inside the caller's transaction.
//!   It commits on its own, which makes the new value durable before any
//!   bill references it. If the enclosing visit creation then fails, the
//!   consumed number becomes a gap - never a duplicate.

use crate::{is_transient_conflict, StoreError};
use mdk_billing::{BillNumber, BranchCode, SequenceDomain};
use mdk_config::AllocatorConfig;
use sqlx::PgPool;
use std::time::Duration;

const ALLOCATE_SQL: &str = r#"
insert into number_sequences (branch_code, domain, last_value)
values ($1, $2, 1)
on conflict (branch_code, domain) do update
    set last_value = number_sequences.last_value + 1,
        updated_at = now()
returning last_value
"#;

/// Allocate the next bill number for `(branch, domain)`.
///
/// Retries only transient serialization/lock failures, with exponential
/// backoff, up to `policy.max_attempts`. Anything else (constraint
/// violations included) fails immediately: retrying a non-transient error
/// can only mint numbers that end up as gaps.
pub async fn allocate_bill_number(
    pool: &PgPool,
    branch: &BranchCode,
    domain: SequenceDomain,
    policy: AllocatorConfig,
) -> Result<BillNumber, StoreError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        match sqlx::query_scalar::<_, i64>(ALLOCATE_SQL)
            .bind(branch.as_str())
            .bind(domain.as_key())
            .fetch_one(pool)
            .await
        {
            Ok(sequence) => return Ok(BillNumber::new(domain, branch.clone(), sequence)),
            Err(e) => {
                if !is_transient_conflict(&e) {
                    return Err(StoreError::from(e));
                }
                if attempt >= policy.max_attempts {
                    return Err(StoreError::Contention { attempts: attempt });
                }
                // 25ms, 50ms, 100ms, ... capped well below any client timeout.
                let shift = (attempt - 1).min(10);
                let delay = policy.backoff_ms.saturating_mul(1u64 << shift);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// Read the last allocated value without consuming one. `None` means the
/// counter has never been touched (next allocation returns 1).
pub async fn peek_sequence(
    pool: &PgPool,
    branch: &BranchCode,
    domain: SequenceDomain,
) -> Result<Option<i64>, StoreError> {
    let value = sqlx::query_scalar::<_, i64>(
        r#"
        select last_value
        from number_sequences
        where branch_code = $1
          and domain = $2
        "#,
    )
    .bind(branch.as_str())
    .bind(domain.as_key())
    .fetch_optional(pool)
    .await?;

    Ok(value)
}
