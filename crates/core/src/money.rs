//! Credit amounts as fixed-point minor units.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DomainError, DomainResult};

/// A credit amount in minor units (e.g. cents).
///
/// Non-negative by construction, including through `Deserialize` (wire
/// input runs the same validation as [`CreditAmount::from_minor_units`]).
/// Voucher grants additionally require a strictly positive amount; that
/// rule lives with voucher validation, since an account's credit *limit*
/// may legitimately be zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(transparent)]
pub struct CreditAmount(i64);

impl<'de> Deserialize<'de> for CreditAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let units = i64::deserialize(deserializer)?;
        CreditAmount::from_minor_units(units).map_err(serde::de::Error::custom)
    }
}

impl CreditAmount {
    pub const ZERO: CreditAmount = CreditAmount(0);

    /// Build an amount from minor units, rejecting negatives.
    pub fn from_minor_units(units: i64) -> DomainResult<Self> {
        if units < 0 {
            return Err(DomainError::validation("amount cannot be negative"));
        }
        Ok(Self(units))
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: CreditAmount) -> Option<CreditAmount> {
        self.0.checked_add(other.0).map(CreditAmount)
    }

    /// Addition that pins at `i64::MAX` instead of wrapping.
    pub fn saturating_add(self, other: CreditAmount) -> CreditAmount {
        CreditAmount(self.0.saturating_add(other.0))
    }
}

impl core::fmt::Display for CreditAmount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Two-decimal rendering of minor units ("1050" -> "10.50").
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}
