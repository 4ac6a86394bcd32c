//! Ledger store contract.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use vouchsafe_core::{AccountId, RecordId, VoucherId};
use vouchsafe_voucher::{CodeHash, RedemptionRecord, Voucher, VoucherUpdate};

/// Store operation error.
///
/// These are **infrastructure failures** (connectivity, timeouts, codec
/// breakage) as opposed to domain rejections, which travel through
/// [`CommitOutcome`] / [`UpdateOutcome`]. All variants are transient from
/// the caller's point of view: retrying the whole redemption attempt is
/// safe because the commit is idempotent per (voucher, account) pair.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out during {0}")]
    Timeout(&'static str),

    #[error("stored value could not be decoded: {0}")]
    Serialization(String),
}

/// Input to the atomic redemption commit.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub voucher_id: VoucherId,
    pub account_id: AccountId,
    /// Audit record to append; already frozen by the engine.
    pub record: RedemptionRecord,
}

/// Result of the atomic redemption commit.
///
/// The non-`Committed` variants are how a race loser finds out it lost:
/// the conditional transaction refused, and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// All three writes applied: usage increment, idempotency marker,
    /// audit append.
    Committed { used_count: u32 },
    /// The bounded usage limit was already fully consumed.
    Exhausted,
    /// This (voucher, account) pair has already redeemed.
    AlreadyRedeemed,
    /// The voucher vanished (deleted) between resolution and commit.
    VoucherGone,
}

/// Result of a conditional administrative update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(Voucher),
    Missing,
    /// A bounded `usage_limit` below the live `used_count` was refused.
    LimitBelowUsed,
}

/// Key-addressed ledger store.
///
/// ## Contract
///
/// - Strong read-after-write consistency per key.
/// - `put_voucher` stores the record **and** its hash→id index entry.
/// - `commit_redemption` is a single conditional transaction, serialized
///   per voucher id: it increments `used_count` only while a bounded limit
///   holds, inserts the (voucher, account) idempotency marker only if
///   absent, and appends the audit record: all three or none. This must
///   hold across independent service instances sharing one store, so
///   adapters enforce it with the store's own primitive, never an
///   in-process lock.
/// - `update_voucher` applies a partial update inside the same atomicity
///   scope, so the `usage_limit >= used_count` check cannot race a commit.
/// - Rate counters are fixed windows: incrementing (re)arms the TTL, and a
///   counter resets only by expiry. `now` is passed in so adapters without
///   a server clock stay deterministic.
/// - Every operation is bounded by an ambient timeout; none may block
///   indefinitely.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ── Vouchers ──────────────────────────────────────────────────────

    /// Store a freshly issued voucher and index its code hash.
    async fn put_voucher(&self, voucher: &Voucher) -> Result<(), StoreError>;

    async fn voucher(&self, id: VoucherId) -> Result<Option<Voucher>, StoreError>;

    /// All vouchers, newest first. Deleted vouchers appear only when asked.
    async fn list_vouchers(&self, include_deleted: bool) -> Result<Vec<Voucher>, StoreError>;

    async fn update_voucher(
        &self,
        id: VoucherId,
        update: &VoucherUpdate,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Soft-delete: flag the record and drop the hash index entry. Returns
    /// `false` when the voucher does not exist.
    async fn delete_voucher(&self, id: VoucherId) -> Result<bool, StoreError>;

    /// Resolve a presented code's hash to a voucher id.
    async fn resolve_code(&self, hash: &CodeHash) -> Result<Option<VoucherId>, StoreError>;

    // ── Redemption ────────────────────────────────────────────────────

    async fn commit_redemption(&self, req: CommitRequest) -> Result<CommitOutcome, StoreError>;

    /// Has this (voucher, account) pair already redeemed? Read-only gate;
    /// the commit re-checks atomically.
    async fn has_redemption(
        &self,
        voucher_id: VoucherId,
        account_id: AccountId,
    ) -> Result<bool, StoreError>;

    // ── Audit trail ───────────────────────────────────────────────────

    async fn record(&self, id: RecordId) -> Result<Option<RedemptionRecord>, StoreError>;

    /// Records for one voucher, oldest first, bounded.
    async fn records_for_voucher(
        &self,
        voucher_id: VoucherId,
        limit: usize,
    ) -> Result<Vec<RedemptionRecord>, StoreError>;

    /// Most recent records across all vouchers, newest first, bounded.
    async fn recent_records(&self, limit: usize) -> Result<Vec<RedemptionRecord>, StoreError>;

    // ── Rate-limit counters ───────────────────────────────────────────

    /// Live failed-attempt count for a source identity.
    async fn attempt_count(&self, source: &str, now: DateTime<Utc>) -> Result<u32, StoreError>;

    /// Record one failed attempt; (re)arms the window TTL. Returns the new
    /// count.
    async fn record_failed_attempt(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u32, StoreError>;
}
