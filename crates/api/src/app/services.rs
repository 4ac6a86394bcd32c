//! Infrastructure wiring for the API process.

use std::sync::Arc;

use vouchsafe_account::InMemoryAccountService;
use vouchsafe_core::SystemClock;
use vouchsafe_redemption::RedemptionEngine;
use vouchsafe_store::InMemoryLedgerStore;
#[cfg(feature = "redis")]
use vouchsafe_store::RedisLedgerStore;
use vouchsafe_voucher::CodeGenerator;

/// Process configuration read from the environment by `main.rs`.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Deployment secret keying the code lookup digest.
    pub code_secret: String,
    /// When set (and the `redis` feature is on), vouchers persist in Redis;
    /// otherwise everything lives in process memory.
    pub redis_url: Option<String>,
}

/// Services shared by all handlers.
pub struct AppServices {
    pub engine: RedemptionEngine,
}

/// Wire the engine against the configured store.
///
/// The account service here is the in-memory double: production deployments
/// substitute a client for the real credential/billing system at this seam.
pub async fn build_services(config: &ApiConfig) -> anyhow::Result<AppServices> {
    let accounts = Arc::new(InMemoryAccountService::new());
    tracing::warn!("using in-memory account service; wire a real billing client for production");

    let clock = Arc::new(SystemClock);
    let codes = CodeGenerator::new(config.code_secret.as_bytes());

    #[cfg(feature = "redis")]
    if let Some(redis_url) = &config.redis_url {
        let store = Arc::new(RedisLedgerStore::connect(redis_url, None).await?);
        tracing::info!("voucher ledger persisted in redis");
        return Ok(AppServices {
            engine: RedemptionEngine::new(store, accounts, clock, codes),
        });
    }

    #[cfg(not(feature = "redis"))]
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but the redis feature is off; falling back to memory");
    }

    let store = Arc::new(InMemoryLedgerStore::new());
    tracing::info!("voucher ledger held in process memory");
    Ok(AppServices {
        engine: RedemptionEngine::new(store, accounts, clock, codes),
    })
}
