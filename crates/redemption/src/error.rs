//! Error taxonomy for the redemption core.

use serde::Serialize;
use thiserror::Error;

use vouchsafe_account::AccountServiceError;
use vouchsafe_core::{AccountId, CreditAmount, DomainError, RecordId, VoucherId};
use vouchsafe_store::StoreError;
use vouchsafe_voucher::RedeemBlock;

/// Terminal, deterministic rejection of a redemption attempt.
///
/// Exactly one reason per attempt; no partial mutation accompanies any of
/// them (the only counter already moved is the rate window, which a
/// rate-limited attempt inherited from earlier failures).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    RateLimited,
    InvalidCode,
    CodeDisabled,
    CodeExpired,
    CodeExhausted,
    InvalidAccount,
    AlreadyRedeemed,
}

impl RejectReason {
    /// Stable wire code.
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::RateLimited => "RATE_LIMITED",
            RejectReason::InvalidCode => "INVALID_CODE",
            RejectReason::CodeDisabled => "CODE_DISABLED",
            RejectReason::CodeExpired => "CODE_EXPIRED",
            RejectReason::CodeExhausted => "CODE_EXHAUSTED",
            RejectReason::InvalidAccount => "INVALID_ACCOUNT",
            RejectReason::AlreadyRedeemed => "ALREADY_REDEEMED",
        }
    }
}

impl core::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

impl From<RedeemBlock> for RejectReason {
    fn from(block: RedeemBlock) -> Self {
        match block {
            RedeemBlock::Disabled => RejectReason::CodeDisabled,
            RedeemBlock::Expired => RejectReason::CodeExpired,
            RedeemBlock::Exhausted => RejectReason::CodeExhausted,
        }
    }
}

/// Failure of a redemption attempt.
#[derive(Debug, Error)]
pub enum RedeemError {
    /// Terminal rejection at one of the gates.
    #[error("redemption rejected: {0}")]
    Rejected(RejectReason),

    /// Store or account service unavailable/timeout. Transient: the caller
    /// may retry the whole attempt; the commit's idempotency marker makes
    /// a retried attempt safe.
    #[error("dependency failure: {0}")]
    Dependency(String),

    /// The ledger committed but the credit call failed. The credit is
    /// at-most-once, so the core never retries it; this surfaces the
    /// committed record as repair evidence for manual reconciliation.
    #[error("redemption {record_id} committed but credit was not applied: {cause}")]
    ReconciliationNeeded {
        record_id: RecordId,
        voucher_id: VoucherId,
        account_id: AccountId,
        amount: CreditAmount,
        cause: String,
    },
}

impl From<StoreError> for RedeemError {
    fn from(value: StoreError) -> Self {
        RedeemError::Dependency(value.to_string())
    }
}

impl From<AccountServiceError> for RedeemError {
    fn from(value: AccountServiceError) -> Self {
        RedeemError::Dependency(value.to_string())
    }
}

/// Failure of an administrative operation.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
