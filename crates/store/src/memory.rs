//! In-memory ledger store.
//!
//! Intended for tests/dev. One `RwLock` guards all tables, so the commit's
//! conditional section is trivially atomic; the Redis adapter gets the same
//! effect from a server-side script.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use vouchsafe_core::{AccountId, RecordId, VoucherId};
use vouchsafe_voucher::{CodeHash, RedemptionRecord, Voucher, VoucherUpdate};

use crate::ledger::{
    CommitOutcome, CommitRequest, LedgerStore, StoreError, UpdateOutcome,
};

#[derive(Debug, Clone)]
struct AttemptWindow {
    count: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    vouchers: HashMap<VoucherId, Voucher>,
    code_index: HashMap<CodeHash, VoucherId>,
    records: HashMap<RecordId, RedemptionRecord>,
    by_voucher: HashMap<VoucherId, Vec<RecordId>>,
    by_account: HashMap<AccountId, Vec<RecordId>>,
    redeemed_pairs: HashSet<(VoucherId, AccountId)>,
    /// Append order; newest last.
    recent: Vec<RecordId>,
    attempts: HashMap<String, AttemptWindow>,
}

/// In-memory ledger store.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn put_voucher(&self, voucher: &Voucher) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state
            .code_index
            .insert(voucher.code_hash.clone(), voucher.id);
        state.vouchers.insert(voucher.id, voucher.clone());
        Ok(())
    }

    async fn voucher(&self, id: VoucherId) -> Result<Option<Voucher>, StoreError> {
        Ok(self.read()?.vouchers.get(&id).cloned())
    }

    async fn list_vouchers(&self, include_deleted: bool) -> Result<Vec<Voucher>, StoreError> {
        let state = self.read()?;
        let mut vouchers: Vec<Voucher> = state
            .vouchers
            .values()
            .filter(|v| include_deleted || !v.deleted)
            .cloned()
            .collect();
        // Newest first; id as a tiebreak keeps the order stable.
        vouchers.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(vouchers)
    }

    async fn update_voucher(
        &self,
        id: VoucherId,
        update: &VoucherUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.write()?;
        let Some(voucher) = state.vouchers.get_mut(&id) else {
            return Ok(UpdateOutcome::Missing);
        };
        // Field-local validation already happened in the engine; the only
        // state-dependent failure left in apply_to is the limit/used check,
        // which must run here, under the same lock the commit takes.
        match update.apply_to(voucher) {
            Ok(()) => Ok(UpdateOutcome::Updated(voucher.clone())),
            Err(_) => Ok(UpdateOutcome::LimitBelowUsed),
        }
    }

    async fn delete_voucher(&self, id: VoucherId) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let Some(hash) = state.vouchers.get(&id).map(|v| v.code_hash.clone()) else {
            return Ok(false);
        };
        state.code_index.remove(&hash);
        if let Some(voucher) = state.vouchers.get_mut(&id) {
            voucher.deleted = true;
        }
        Ok(true)
    }

    async fn resolve_code(&self, hash: &CodeHash) -> Result<Option<VoucherId>, StoreError> {
        Ok(self.read()?.code_index.get(hash).copied())
    }

    async fn commit_redemption(&self, req: CommitRequest) -> Result<CommitOutcome, StoreError> {
        let mut state = self.write()?;

        let Some(voucher) = state.vouchers.get(&req.voucher_id) else {
            return Ok(CommitOutcome::VoucherGone);
        };
        if voucher.deleted {
            return Ok(CommitOutcome::VoucherGone);
        }
        // Marker check first: a same-account loser must see AlreadyRedeemed
        // even when the voucher is also out of headroom.
        if state
            .redeemed_pairs
            .contains(&(req.voucher_id, req.account_id))
        {
            return Ok(CommitOutcome::AlreadyRedeemed);
        }
        if voucher.is_exhausted() {
            return Ok(CommitOutcome::Exhausted);
        }

        // All checks passed under the write lock: apply all three writes.
        let used_count = {
            let voucher = state
                .vouchers
                .get_mut(&req.voucher_id)
                .ok_or_else(|| StoreError::Unavailable("voucher vanished mid-commit".to_string()))?;
            voucher.used_count += 1;
            voucher.used_count
        };
        state
            .redeemed_pairs
            .insert((req.voucher_id, req.account_id));
        let record_id = req.record.id;
        state.records.insert(record_id, req.record);
        state
            .by_voucher
            .entry(req.voucher_id)
            .or_default()
            .push(record_id);
        state
            .by_account
            .entry(req.account_id)
            .or_default()
            .push(record_id);
        state.recent.push(record_id);

        Ok(CommitOutcome::Committed { used_count })
    }

    async fn has_redemption(
        &self,
        voucher_id: VoucherId,
        account_id: AccountId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .redeemed_pairs
            .contains(&(voucher_id, account_id)))
    }

    async fn record(&self, id: RecordId) -> Result<Option<RedemptionRecord>, StoreError> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    async fn records_for_voucher(
        &self,
        voucher_id: VoucherId,
        limit: usize,
    ) -> Result<Vec<RedemptionRecord>, StoreError> {
        let state = self.read()?;
        let ids = state.by_voucher.get(&voucher_id);
        Ok(ids
            .map(|ids| {
                ids.iter()
                    .take(limit)
                    .filter_map(|id| state.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<RedemptionRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .recent
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn attempt_count(&self, source: &str, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let state = self.read()?;
        Ok(state
            .attempts
            .get(source)
            .filter(|w| w.expires_at > now)
            .map(|w| w.count)
            .unwrap_or(0))
    }

    async fn record_failed_attempt(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u32, StoreError> {
        let mut state = self.write()?;
        let entry = state
            .attempts
            .entry(source.to_string())
            .and_modify(|w| {
                if w.expires_at > now {
                    w.count += 1;
                } else {
                    w.count = 1;
                }
                w.expires_at = now + window;
            })
            .or_insert(AttemptWindow {
                count: 1,
                expires_at: now + window,
            });
        Ok(entry.count)
    }
}
