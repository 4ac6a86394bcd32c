//! Account service contract + in-memory double.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vouchsafe_core::{AccountId, CreditAmount};

/// An opaque account credential as presented by the redeeming caller.
///
/// `Debug` is redacted: credentials routinely end up in trace spans.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialToken(String);

impl CredentialToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for CredentialToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("CredentialToken(****)")
    }
}

/// The validated identity behind a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub account_id: AccountId,
    pub name: String,
    pub credit_limit: CreditAmount,
}

/// Failure talking to the account service (transient; caller may retry the
/// whole redemption attempt).
#[derive(Debug, Clone, Error)]
pub enum AccountServiceError {
    #[error("account service unavailable: {0}")]
    Unavailable(String),

    #[error("account service timed out during {0}")]
    Timeout(&'static str),
}

/// External credential/billing service.
///
/// `apply_credit_increase` is a real side effect with at-most-once
/// semantics: the engine never retries it on its own.
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Resolve a credential to its account, or `None` when it is invalid.
    async fn validate_credential(
        &self,
        token: &CredentialToken,
    ) -> Result<Option<AccountProfile>, AccountServiceError>;

    /// Raise the account's credit limit by `delta`; returns the new limit.
    async fn apply_credit_increase(
        &self,
        account_id: AccountId,
        delta: CreditAmount,
    ) -> Result<CreditAmount, AccountServiceError>;
}

#[derive(Debug, Clone)]
struct AccountState {
    profile: AccountProfile,
}

/// In-memory account service for tests/dev.
///
/// Accounts are registered by token; `fail_credit_increases` simulates the
/// billing side going away between credential validation and the credit
/// call, which is the window reconciliation handling cares about.
#[derive(Debug, Default)]
pub struct InMemoryAccountService {
    by_token: RwLock<HashMap<String, AccountState>>,
    fail_credit_increases: AtomicBool,
}

impl InMemoryAccountService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account and return its id.
    pub fn register(
        &self,
        token: &CredentialToken,
        name: impl Into<String>,
        credit_limit: CreditAmount,
    ) -> AccountId {
        let account_id = AccountId::new();
        let state = AccountState {
            profile: AccountProfile {
                account_id,
                name: name.into(),
                credit_limit,
            },
        };
        self.by_token
            .write()
            .expect("account lock poisoned")
            .insert(token.expose().to_string(), state);
        account_id
    }

    /// Make subsequent `apply_credit_increase` calls fail.
    pub fn fail_credit_increases(&self, fail: bool) {
        self.fail_credit_increases.store(fail, Ordering::SeqCst);
    }

    /// Current credit limit for a registered token.
    pub fn credit_limit(&self, token: &CredentialToken) -> Option<CreditAmount> {
        self.by_token
            .read()
            .expect("account lock poisoned")
            .get(token.expose())
            .map(|s| s.profile.credit_limit)
    }
}

#[async_trait]
impl AccountService for InMemoryAccountService {
    async fn validate_credential(
        &self,
        token: &CredentialToken,
    ) -> Result<Option<AccountProfile>, AccountServiceError> {
        let accounts = self.by_token.read().expect("account lock poisoned");
        Ok(accounts.get(token.expose()).map(|s| s.profile.clone()))
    }

    async fn apply_credit_increase(
        &self,
        account_id: AccountId,
        delta: CreditAmount,
    ) -> Result<CreditAmount, AccountServiceError> {
        if self.fail_credit_increases.load(Ordering::SeqCst) {
            return Err(AccountServiceError::Unavailable(
                "simulated billing outage".to_string(),
            ));
        }

        let mut accounts = self.by_token.write().expect("account lock poisoned");
        let state = accounts
            .values_mut()
            .find(|s| s.profile.account_id == account_id)
            .ok_or_else(|| {
                AccountServiceError::Unavailable(format!("unknown account {account_id}"))
            })?;

        state.profile.credit_limit = state.profile.credit_limit.saturating_add(delta);
        Ok(state.profile.credit_limit)
    }
}
