//! Voucher record and lifecycle commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use vouchsafe_core::{CreditAmount, DomainError, DomainResult, VoucherId};

use crate::code::CodeHash;

/// Usage limit applied when the creator does not name one.
pub const DEFAULT_USAGE_LIMIT: u32 = 1;

/// Upper bound on batch creation.
pub const BATCH_MAX: u32 = 100;

/// A bounded-use credit grant, addressed by the keyed hash of its secret code.
///
/// # Invariants
/// - `used_count <= usage_limit` whenever `usage_limit > 0` (`0` = unlimited).
/// - `used_count` is monotonically non-decreasing; only the redemption commit
///   increments it.
/// - `code_hash` resolves to exactly one voucher id.
///
/// The plaintext code is deliberately absent: it exists only in the creation
/// response, and the keyed hash is the sole lookup truth afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: VoucherId,
    pub code_hash: CodeHash,
    pub name: String,
    pub amount: CreditAmount,
    /// `0` means unlimited; any positive value bounds `used_count`.
    pub usage_limit: u32,
    pub used_count: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    /// Soft-deletion flag. Deleted vouchers keep their record (audit rows
    /// stay joinable) but lose their hash-index entry and leave default
    /// listings.
    pub deleted: bool,
}

impl Voucher {
    /// Materialize a voucher from a validated [`NewVoucher`].
    pub fn issue(
        id: VoucherId,
        code_hash: CodeHash,
        spec: &NewVoucher,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            code_hash,
            name: spec.name.clone(),
            amount: spec.amount,
            usage_limit: spec.usage_limit.unwrap_or(DEFAULT_USAGE_LIMIT),
            used_count: 0,
            expires_at: spec.expires_at,
            active: true,
            tags: spec.tags.clone(),
            created_at,
            created_by: spec.created_by.clone(),
            deleted: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage_limit > 0 && self.used_count >= self.usage_limit
    }

    /// Expiry uses strict greater-than: a voucher expiring exactly at `now`
    /// is still valid.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    /// Gate check for redemption: disabled, expired, exhausted, in that
    /// order, matching the engine's rejection precedence.
    pub fn check_redeemable(&self, now: DateTime<Utc>) -> Result<(), RedeemBlock> {
        if self.deleted || !self.active {
            return Err(RedeemBlock::Disabled);
        }
        if self.is_expired_at(now) {
            return Err(RedeemBlock::Expired);
        }
        if self.is_exhausted() {
            return Err(RedeemBlock::Exhausted);
        }
        Ok(())
    }
}

/// Why a voucher's own state blocks redemption.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RedeemBlock {
    Disabled,
    Expired,
    Exhausted,
}

/// Command: create a voucher (single, or one of a batch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVoucher {
    pub name: String,
    pub amount: CreditAmount,
    /// `None` -> [`DEFAULT_USAGE_LIMIT`]; explicit `0` -> unlimited.
    pub usage_limit: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub created_by: String,
}

impl NewVoucher {
    pub fn validate(&self) -> DomainResult<()> {
        if self.amount.is_zero() {
            return Err(DomainError::validation("amount must be greater than 0"));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        Ok(())
    }

    /// Child name used during batch creation ("Launch promo #3").
    pub fn batch_child(&self, index: u32) -> Self {
        Self {
            name: format!("{} #{}", self.name, index),
            ..self.clone()
        }
    }
}

/// Validate a batch count against the `[1, BATCH_MAX]` window.
pub fn validate_batch_count(count: u32) -> DomainResult<()> {
    if count < 1 || count > BATCH_MAX {
        return Err(DomainError::validation(format!(
            "batch count must be between 1 and {BATCH_MAX}"
        )));
    }
    Ok(())
}

/// Command: partial administrative update.
///
/// Typed optional fields instead of a runtime field-name allowlist; absent
/// fields are untouched. `expires_at` is doubly optional so callers can
/// distinguish "leave alone" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherUpdate {
    pub name: Option<String>,
    pub amount: Option<CreditAmount>,
    pub usage_limit: Option<u32>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub active: Option<bool>,
    pub tags: Option<Vec<String>>,
}

/// Present-but-null deserializes to `Some(None)`; an absent field falls back
/// to the `default` of `None`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl VoucherUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Field-local validation (no knowledge of the current record).
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(amount) = self.amount {
            if amount.is_zero() {
                return Err(DomainError::validation("amount must be greater than 0"));
            }
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(DomainError::validation("name cannot be empty"));
            }
        }
        Ok(())
    }

    /// Apply onto an existing voucher.
    ///
    /// Rejects a bounded `usage_limit` below the current `used_count`; the
    /// store applies this under its own atomicity scope so the check can't
    /// race a concurrent commit.
    pub fn apply_to(&self, voucher: &mut Voucher) -> DomainResult<()> {
        self.validate()?;

        if let Some(limit) = self.usage_limit {
            if limit > 0 && limit < voucher.used_count {
                return Err(DomainError::validation(format!(
                    "usage limit {limit} is below the current used count {}",
                    voucher.used_count
                )));
            }
            voucher.usage_limit = limit;
        }
        if let Some(name) = &self.name {
            voucher.name = name.clone();
        }
        if let Some(amount) = self.amount {
            voucher.amount = amount;
        }
        if let Some(expires_at) = self.expires_at {
            voucher.expires_at = expires_at;
        }
        if let Some(active) = self.active {
            voucher.active = active;
        }
        if let Some(tags) = &self.tags {
            voucher.tags = tags.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vouchsafe_core::VoucherId;

    fn test_spec() -> NewVoucher {
        NewVoucher {
            name: "Test voucher".to_string(),
            amount: CreditAmount::from_minor_units(1000).unwrap(),
            usage_limit: None,
            expires_at: None,
            tags: vec![],
            created_by: "admin".to_string(),
        }
    }

    fn test_voucher() -> Voucher {
        Voucher::issue(
            VoucherId::new(),
            CodeHash::from_hex("ab".repeat(32)),
            &test_spec(),
            Utc::now(),
        )
    }

    #[test]
    fn issue_applies_default_usage_limit() {
        let voucher = test_voucher();
        assert_eq!(voucher.usage_limit, DEFAULT_USAGE_LIMIT);
        assert_eq!(voucher.used_count, 0);
        assert!(voucher.active);
        assert!(!voucher.deleted);
    }

    #[test]
    fn zero_amount_is_rejected() {
        let spec = NewVoucher {
            amount: CreditAmount::ZERO,
            ..test_spec()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn batch_count_window() {
        assert!(validate_batch_count(0).is_err());
        assert!(validate_batch_count(1).is_ok());
        assert!(validate_batch_count(BATCH_MAX).is_ok());
        assert!(validate_batch_count(BATCH_MAX + 1).is_err());
    }

    #[test]
    fn expiry_boundary_is_strict() {
        let now = Utc::now();
        let mut voucher = test_voucher();
        voucher.expires_at = Some(now);

        // Equal-to-expiry is still valid; one instant later it is not.
        assert!(!voucher.is_expired_at(now));
        assert!(voucher.is_expired_at(now + Duration::milliseconds(1)));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let mut voucher = test_voucher();
        voucher.usage_limit = 0;
        voucher.used_count = u32::MAX;
        assert!(!voucher.is_exhausted());
    }

    #[test]
    fn redeemable_check_ordering() {
        let now = Utc::now();
        let mut voucher = test_voucher();

        voucher.active = false;
        voucher.expires_at = Some(now - Duration::hours(1));
        // Disabled wins over expired.
        assert_eq!(voucher.check_redeemable(now), Err(RedeemBlock::Disabled));

        voucher.active = true;
        assert_eq!(voucher.check_redeemable(now), Err(RedeemBlock::Expired));

        voucher.expires_at = None;
        voucher.used_count = voucher.usage_limit;
        assert_eq!(voucher.check_redeemable(now), Err(RedeemBlock::Exhausted));

        voucher.used_count = 0;
        assert!(voucher.check_redeemable(now).is_ok());
    }

    #[test]
    fn deleted_voucher_is_not_redeemable() {
        let mut voucher = test_voucher();
        voucher.deleted = true;
        assert_eq!(
            voucher.check_redeemable(Utc::now()),
            Err(RedeemBlock::Disabled)
        );
    }

    #[test]
    fn update_cannot_shrink_limit_below_used_count() {
        let mut voucher = test_voucher();
        voucher.usage_limit = 5;
        voucher.used_count = 3;

        let update = VoucherUpdate {
            usage_limit: Some(2),
            ..Default::default()
        };
        assert!(update.apply_to(&mut voucher).is_err());
        // Nothing was applied.
        assert_eq!(voucher.usage_limit, 5);

        let update = VoucherUpdate {
            usage_limit: Some(3),
            ..Default::default()
        };
        assert!(update.apply_to(&mut voucher).is_ok());
        assert_eq!(voucher.usage_limit, 3);

        // Unlimited is always acceptable.
        let update = VoucherUpdate {
            usage_limit: Some(0),
            ..Default::default()
        };
        assert!(update.apply_to(&mut voucher).is_ok());
    }

    #[test]
    fn update_clears_expiry_with_explicit_null() {
        let mut voucher = test_voucher();
        voucher.expires_at = Some(Utc::now());

        // Absent field leaves expiry alone.
        let update = VoucherUpdate::default();
        update.apply_to(&mut voucher).unwrap();
        assert!(voucher.expires_at.is_some());

        // Explicit null clears it.
        let update = VoucherUpdate {
            expires_at: Some(None),
            ..Default::default()
        };
        update.apply_to(&mut voucher).unwrap();
        assert!(voucher.expires_at.is_none());
    }

    #[test]
    fn update_distinguishes_absent_and_null_in_json() {
        let update: VoucherUpdate = serde_json::from_str(r#"{"active": false}"#).unwrap();
        assert_eq!(update.expires_at, None);

        let update: VoucherUpdate = serde_json::from_str(r#"{"expires_at": null}"#).unwrap();
        assert_eq!(update.expires_at, Some(None));
    }
}
