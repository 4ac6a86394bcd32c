//! Secret-code generation and the keyed lookup digest.
//!
//! A plain code is `RC_` plus 12 uppercase hex characters drawn from 6
//! random bytes (48 bits of entropy). Presented codes are resolved through
//! `hex(HMAC-SHA256(deployment_secret, plain_code))`; the store never sees
//! the plaintext, so its data alone cannot be reversed into a working code.

use std::sync::Mutex;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Fixed public prefix on every plain code.
pub const CODE_PREFIX: &str = "RC_";

/// Random suffix length in bytes (rendered as twice as many hex chars).
const CODE_RANDOM_BYTES: usize = 6;

type HmacSha256 = Hmac<Sha256>;

/// A plaintext voucher code.
///
/// Returned exactly once, in the creation response. `Debug` redacts the
/// random suffix so the secret cannot leak through logs.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PlainCode(String);

impl PlainCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for PlainCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::fmt::Debug for PlainCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PlainCode({CODE_PREFIX}****)")
    }
}

/// Keyed one-way digest of a plain code; the store's lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeHash(String);

impl CodeHash {
    /// Wrap an already-hex digest (store round-trips, test fixtures).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CodeHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces plain codes and their lookup hashes.
///
/// The random source is injected so tests can seed it; production uses the
/// OS generator. The deployment secret keys the digest: two deployments
/// sharing a store cannot forge each other's lookups.
pub struct CodeGenerator {
    key: Vec<u8>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl CodeGenerator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self::with_rng(secret, OsRng)
    }

    pub fn with_rng(secret: impl AsRef<[u8]>, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            rng: Mutex::new(Box::new(rng)),
        }
    }

    /// Generate a fresh `(plain code, lookup hash)` pair.
    pub fn generate(&self) -> (PlainCode, CodeHash) {
        let mut suffix = [0u8; CODE_RANDOM_BYTES];
        {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            rng.fill_bytes(&mut suffix);
        }
        let plain = PlainCode(format!("{CODE_PREFIX}{}", hex::encode_upper(suffix)));
        let hash = self.hash(plain.as_str());
        (plain, hash)
    }

    /// Keyed digest of a presented code.
    pub fn hash(&self, code: &str) -> CodeHash {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(code.as_bytes());
        CodeHash(hex::encode(mac.finalize().into_bytes()))
    }
}

impl core::fmt::Debug for CodeGenerator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeGenerator").finish_non_exhaustive()
    }
}
