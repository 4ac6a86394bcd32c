//! Redemption records: the append-only audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vouchsafe_core::{AccountId, CreditAmount, RecordId, VoucherId};

use crate::voucher::Voucher;

/// One successful redemption, frozen at commit time.
///
/// Snapshots (voucher name, account name, amount, limits) are immutable
/// copies: the credited amount is never re-derived from the voucher, which
/// may be edited or deleted later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub id: RecordId,
    pub voucher_id: VoucherId,
    pub voucher_name: String,
    pub account_id: AccountId,
    pub account_name: String,
    pub amount: CreditAmount,
    pub redeemed_at: DateTime<Utc>,
    /// Source identity of the redeeming request (e.g. network origin).
    pub source: String,
    pub limit_before: CreditAmount,
    pub limit_after: CreditAmount,
}

impl RedemptionRecord {
    /// Freeze a record for the given voucher/account at `redeemed_at`.
    pub fn freeze(
        id: RecordId,
        voucher: &Voucher,
        account_id: AccountId,
        account_name: impl Into<String>,
        limit_before: CreditAmount,
        source: impl Into<String>,
        redeemed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            voucher_id: voucher.id,
            voucher_name: voucher.name.clone(),
            account_id,
            account_name: account_name.into(),
            amount: voucher.amount,
            redeemed_at,
            source: source.into(),
            limit_before,
            limit_after: limit_before.saturating_add(voucher.amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeHash;
    use crate::voucher::NewVoucher;

    #[test]
    fn freeze_snapshots_voucher_state() {
        let spec = NewVoucher {
            name: "Spring promo".to_string(),
            amount: CreditAmount::from_minor_units(1000).unwrap(),
            usage_limit: Some(3),
            expires_at: None,
            tags: vec!["spring".to_string()],
            created_by: "admin".to_string(),
        };
        let mut voucher = Voucher::issue(
            VoucherId::new(),
            CodeHash::from_hex("cd".repeat(32)),
            &spec,
            Utc::now(),
        );

        let record = RedemptionRecord::freeze(
            RecordId::new(),
            &voucher,
            AccountId::new(),
            "Team Alpha",
            CreditAmount::from_minor_units(500).unwrap(),
            "203.0.113.9",
            Utc::now(),
        );

        assert_eq!(record.voucher_name, "Spring promo");
        assert_eq!(record.amount.minor_units(), 1000);
        assert_eq!(record.limit_before.minor_units(), 500);
        assert_eq!(record.limit_after.minor_units(), 1500);

        // A later voucher edit must not reach through into the snapshot.
        voucher.name = "Renamed".to_string();
        assert_eq!(record.voucher_name, "Spring promo");
    }
}
