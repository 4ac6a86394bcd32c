//! Redemption engine (application-level orchestration).
//!
//! ## Redemption flow
//!
//! ```text
//! redeem(code, credential, source)
//!   ↓
//! 1. Rate gate (failed-attempt window per source)
//!   ↓
//! 2. Resolve code (keyed hash -> voucher id; miss bumps the rate counter)
//!   ↓
//! 3. Validate voucher (active, unexpired, headroom)
//!   ↓
//! 4. Validate account credential
//!   ↓
//! 5. Idempotency read gate ((voucher, account) pair unseen)
//!   ↓
//! 6. Atomic store commit (usage increment + marker + audit, all or none)
//!   ↓
//! 7. Apply credit increase at the account service
//! ```
//!
//! Steps 1–5 are reads with cheap early rejection; step 6 is the
//! serialization point. Two racers reaching step 6 resolve there: the loser
//! observes `CODE_EXHAUSTED` or `ALREADY_REDEEMED` with zero side effects,
//! never a silent overcommit. The credit call comes after the commit, so a
//! failing billing side can never be double-credited; it surfaces as a
//! reconciliation failure carrying the committed record id instead.
//!
//! The engine is an explicit value with injected dependencies (store,
//! account service, clock, code generator) so tests substitute
//! deterministic doubles for time and randomness.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use vouchsafe_account::{AccountService, CredentialToken};
use vouchsafe_core::{Clock, CreditAmount, DomainError, RecordId, VoucherId};
use vouchsafe_store::{CommitOutcome, CommitRequest, LedgerStore, UpdateOutcome};
use vouchsafe_voucher::{
    validate_batch_count, CodeGenerator, NewVoucher, PlainCode, RedemptionRecord, Voucher,
    VoucherUpdate,
};

use crate::error::{AdminError, RedeemError, RejectReason};
use crate::ratelimit::RateLimitPolicy;

/// Default page bound for per-voucher record queries.
pub const DEFAULT_RECORDS_LIMIT: usize = 50;

/// Default bound for the global record listing.
pub const DEFAULT_RECENT_LIMIT: usize = 100;

/// Attempts at generating a non-colliding code before giving up.
const ISSUE_ATTEMPTS: usize = 3;

/// A freshly created voucher together with its plaintext code.
///
/// The plaintext exists only here: hand it to the creator and drop it.
#[derive(Debug)]
pub struct IssuedVoucher {
    pub voucher: Voucher,
    pub code: PlainCode,
}

/// Successful redemption result for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionReceipt {
    pub credited_amount: CreditAmount,
    pub new_credit_limit: CreditAmount,
}

/// Voucher listing filter.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Exact plaintext code to look up (re-hashed; deleted vouchers never
    /// resolve since their index entry is gone).
    pub code: Option<String>,
    pub include_deleted: bool,
}

/// The redemption ledger core.
pub struct RedemptionEngine {
    store: Arc<dyn LedgerStore>,
    accounts: Arc<dyn AccountService>,
    clock: Arc<dyn Clock>,
    codes: CodeGenerator,
    rate_limit: RateLimitPolicy,
}

impl RedemptionEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        accounts: Arc<dyn AccountService>,
        clock: Arc<dyn Clock>,
        codes: CodeGenerator,
    ) -> Self {
        Self {
            store,
            accounts,
            clock,
            codes,
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    // ── Redemption ────────────────────────────────────────────────────

    /// Redeem a presented code against an account credential.
    #[instrument(skip_all, fields(source = %source))]
    pub async fn redeem(
        &self,
        code: &str,
        credential: &CredentialToken,
        source: &str,
    ) -> Result<RedemptionReceipt, RedeemError> {
        let now = self.clock.now();

        // 1. Rate gate.
        let attempts = self.store.attempt_count(source, now).await?;
        if self.rate_limit.is_blocked(attempts) {
            warn!(attempts, "redemption attempt rate limited");
            return Err(RedeemError::Rejected(RejectReason::RateLimited));
        }

        // 2. Resolve the presented code; unknown codes feed the counter.
        let hash = self.codes.hash(code.trim());
        let Some(voucher_id) = self.store.resolve_code(&hash).await? else {
            let count = self
                .store
                .record_failed_attempt(source, now, self.rate_limit.window)
                .await?;
            info!(count, "unknown code presented");
            return Err(RedeemError::Rejected(RejectReason::InvalidCode));
        };
        let Some(voucher) = self.store.voucher(voucher_id).await? else {
            // Dangling index entry; treat like an unknown code.
            self.store
                .record_failed_attempt(source, now, self.rate_limit.window)
                .await?;
            return Err(RedeemError::Rejected(RejectReason::InvalidCode));
        };

        // 3. Voucher state gate.
        if let Err(block) = voucher.check_redeemable(now) {
            return Err(RedeemError::Rejected(block.into()));
        }

        // 4. Account credential gate.
        let Some(profile) = self.accounts.validate_credential(credential).await? else {
            return Err(RedeemError::Rejected(RejectReason::InvalidAccount));
        };

        // 5. Idempotency read gate (the commit re-checks atomically).
        if self
            .store
            .has_redemption(voucher_id, profile.account_id)
            .await?
        {
            return Err(RedeemError::Rejected(RejectReason::AlreadyRedeemed));
        }

        // 6 + 7 run as a spawned task so an attempt abandoned by its caller
        //    mid-flight still resolves fully; a dropped future must never
        //    strand a committed ledger without its credit outcome.
        let record = RedemptionRecord::freeze(
            RecordId::new(),
            &voucher,
            profile.account_id,
            profile.name.clone(),
            profile.credit_limit,
            source,
            now,
        );
        let store = Arc::clone(&self.store);
        let accounts = Arc::clone(&self.accounts);
        let account_id = profile.account_id;
        let amount = voucher.amount;

        let task = tokio::spawn(async move {
            let record_id = record.id;

            // 6. Atomic commit, the serialization point. Losers reject here
            //    with nothing written and nothing credited.
            let outcome = store
                .commit_redemption(CommitRequest {
                    voucher_id,
                    account_id,
                    record,
                })
                .await?;
            match outcome {
                CommitOutcome::Committed { used_count } => {
                    info!(
                        voucher_id = %voucher_id,
                        account_id = %account_id,
                        used_count,
                        "redemption committed"
                    );
                }
                CommitOutcome::Exhausted => {
                    return Err(RedeemError::Rejected(RejectReason::CodeExhausted));
                }
                CommitOutcome::AlreadyRedeemed => {
                    return Err(RedeemError::Rejected(RejectReason::AlreadyRedeemed));
                }
                CommitOutcome::VoucherGone => {
                    return Err(RedeemError::Rejected(RejectReason::InvalidCode));
                }
            }

            // 7. Credit application. At-most-once: never retried here. A
            //    failure leaves the ledger ahead of the money, which the
            //    committed record documents for manual repair.
            match accounts.apply_credit_increase(account_id, amount).await {
                Ok(new_credit_limit) => {
                    info!(
                        amount = %amount,
                        new_credit_limit = %new_credit_limit,
                        "credit applied"
                    );
                    Ok(RedemptionReceipt {
                        credited_amount: amount,
                        new_credit_limit,
                    })
                }
                Err(cause) => {
                    warn!(
                        record_id = %record_id,
                        %cause,
                        "ledger committed but credit application failed"
                    );
                    Err(RedeemError::ReconciliationNeeded {
                        record_id,
                        voucher_id,
                        account_id,
                        amount,
                        cause: cause.to_string(),
                    })
                }
            }
        });
        task.await
            .map_err(|e| RedeemError::Dependency(format!("commit task aborted: {e}")))?
    }

    // ── Administrative operations ─────────────────────────────────────

    /// Create one voucher; the plaintext code is returned exactly once.
    #[instrument(skip_all, fields(name = %spec.name))]
    pub async fn create_voucher(&self, spec: NewVoucher) -> Result<IssuedVoucher, AdminError> {
        spec.validate()?;

        // Regenerate on the (cosmically unlikely) hash collision so a
        // lookup hash always resolves to exactly one voucher.
        for _ in 0..ISSUE_ATTEMPTS {
            let (code, hash) = self.codes.generate();
            if self.store.resolve_code(&hash).await?.is_some() {
                continue;
            }
            let voucher = Voucher::issue(VoucherId::new(), hash, &spec, self.clock.now());
            self.store.put_voucher(&voucher).await?;
            info!(voucher_id = %voucher.id, "voucher issued");
            return Ok(IssuedVoucher { voucher, code });
        }
        Err(AdminError::Domain(DomainError::conflict(
            "code generation kept colliding",
        )))
    }

    /// Create `count` vouchers from one template; children are numbered.
    #[instrument(skip_all, fields(name = %template.name, count))]
    pub async fn create_batch(
        &self,
        template: NewVoucher,
        count: u32,
    ) -> Result<Vec<IssuedVoucher>, AdminError> {
        template.validate()?;
        validate_batch_count(count)?;

        let mut issued = Vec::with_capacity(count as usize);
        for index in 1..=count {
            let spec = if count > 1 {
                template.batch_child(index)
            } else {
                template.clone()
            };
            issued.push(self.create_voucher(spec).await?);
        }
        Ok(issued)
    }

    /// List vouchers, newest first.
    pub async fn list_vouchers(&self, filter: ListFilter) -> Result<Vec<Voucher>, AdminError> {
        if let Some(code) = &filter.code {
            let hash = self.codes.hash(code.trim());
            let Some(id) = self.store.resolve_code(&hash).await? else {
                return Ok(vec![]);
            };
            return Ok(self.store.voucher(id).await?.into_iter().collect());
        }
        Ok(self.store.list_vouchers(filter.include_deleted).await?)
    }

    /// Fetch one voucher (deleted included; the flag tells the caller).
    pub async fn voucher(&self, id: VoucherId) -> Result<Voucher, AdminError> {
        self.store
            .voucher(id)
            .await?
            .ok_or(AdminError::Domain(DomainError::NotFound))
    }

    /// Apply a partial update.
    #[instrument(skip_all, fields(voucher_id = %id))]
    pub async fn update_voucher(
        &self,
        id: VoucherId,
        update: VoucherUpdate,
    ) -> Result<Voucher, AdminError> {
        update.validate()?;
        match self.store.update_voucher(id, &update).await? {
            UpdateOutcome::Updated(voucher) => Ok(voucher),
            UpdateOutcome::Missing => Err(AdminError::Domain(DomainError::NotFound)),
            UpdateOutcome::LimitBelowUsed => Err(AdminError::Domain(DomainError::validation(
                "usage limit cannot drop below the current used count",
            ))),
        }
    }

    /// Soft-delete a voucher; its code stops resolving immediately.
    #[instrument(skip_all, fields(voucher_id = %id))]
    pub async fn delete_voucher(&self, id: VoucherId) -> Result<(), AdminError> {
        if self.store.delete_voucher(id).await? {
            info!("voucher deleted");
            Ok(())
        } else {
            Err(AdminError::Domain(DomainError::NotFound))
        }
    }

    // ── Audit queries ─────────────────────────────────────────────────

    /// Redemption records for one voucher (oldest first, bounded).
    pub async fn records_for_voucher(
        &self,
        id: VoucherId,
        limit: Option<usize>,
    ) -> Result<Vec<RedemptionRecord>, AdminError> {
        let limit = limit.unwrap_or(DEFAULT_RECORDS_LIMIT);
        Ok(self.store.records_for_voucher(id, limit).await?)
    }

    /// Fetch one redemption record by id (survives voucher deletion).
    pub async fn record(&self, id: RecordId) -> Result<Option<RedemptionRecord>, AdminError> {
        Ok(self.store.record(id).await?)
    }

    /// Most recent records across all vouchers (newest first, bounded).
    pub async fn recent_records(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<RedemptionRecord>, AdminError> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT);
        Ok(self.store.recent_records(limit).await?)
    }
}

impl core::fmt::Debug for RedemptionEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedemptionEngine")
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}
