//! Redis-backed ledger store.
//!
//! Layout (`{prefix}` defaults to `vouchsafe`):
//! - `{prefix}:voucher:{id}`: voucher hash (string fields)
//! - `{prefix}:vouchers`: set of voucher ids (listing index)
//! - `{prefix}:voucher:code_index`: hash, code hash -> voucher id
//! - `{prefix}:redeemed:{voucher_id}`: set of account ids (idempotency markers)
//! - `{prefix}:record:{id}`: redemption record (JSON string)
//! - `{prefix}:records:by_voucher:{id}` / `{prefix}:records:by_account:{id}`: id lists
//! - `{prefix}:records:recent`: global id list, newest first
//! - `{prefix}:redeem_attempt:{source}`: failed-attempt counter with TTL
//!
//! The redemption commit runs as a server-executed Lua script: the
//! usage-limit check, the idempotency-marker insert and the audit appends
//! happen in one script invocation, so the conditional transaction holds
//! across service instances sharing this Redis.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::{RedisResult, Script};
use tracing::instrument;

use vouchsafe_core::{AccountId, CreditAmount, RecordId, VoucherId};
use vouchsafe_voucher::{CodeHash, RedemptionRecord, Voucher, VoucherUpdate};

use crate::ledger::{
    CommitOutcome, CommitRequest, LedgerStore, StoreError, UpdateOutcome,
};

const DEFAULT_KEY_PREFIX: &str = "vouchsafe";

/// Ambient per-operation timeout.
const DEFAULT_OP_TIMEOUT: StdDuration = StdDuration::from_secs(5);

const COMMIT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'gone'
end
if redis.call('HGET', KEYS[1], 'deleted') == 'true' then
  return 'gone'
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return 'already'
end
local limit = tonumber(redis.call('HGET', KEYS[1], 'usage_limit'))
local used = tonumber(redis.call('HGET', KEYS[1], 'used_count'))
if limit > 0 and used >= limit then
  return 'exhausted'
end
local new_used = redis.call('HINCRBY', KEYS[1], 'used_count', 1)
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2])
redis.call('RPUSH', KEYS[4], ARGV[3])
redis.call('RPUSH', KEYS[5], ARGV[3])
redis.call('LPUSH', KEYS[6], ARGV[3])
return 'committed:' .. tostring(new_used)
";

const UPDATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'missing'
end
if ARGV[1] ~= '' then
  local new_limit = tonumber(ARGV[1])
  local used = tonumber(redis.call('HGET', KEYS[1], 'used_count'))
  if new_limit > 0 and new_limit < used then
    return 'limit_below_used'
  end
  redis.call('HSET', KEYS[1], 'usage_limit', ARGV[1])
end
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 'updated'
";

/// Redis ledger store.
#[derive(Clone)]
pub struct RedisLedgerStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    op_timeout: StdDuration,
    commit_script: Script,
    update_script: Script,
}

impl RedisLedgerStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - connection URL (e.g. "redis://localhost:6379")
    /// * `key_prefix` - key namespace (default: "vouchsafe")
    pub async fn connect(
        redis_url: impl AsRef<str>,
        key_prefix: Option<String>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            op_timeout: DEFAULT_OP_TIMEOUT,
            commit_script: Script::new(COMMIT_SCRIPT),
            update_script: Script::new(UPDATE_SCRIPT),
        })
    }

    pub fn with_op_timeout(mut self, op_timeout: StdDuration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    fn voucher_key(&self, id: VoucherId) -> String {
        format!("{}:voucher:{id}", self.key_prefix)
    }

    fn vouchers_key(&self) -> String {
        format!("{}:vouchers", self.key_prefix)
    }

    fn code_index_key(&self) -> String {
        format!("{}:voucher:code_index", self.key_prefix)
    }

    fn marker_key(&self, voucher_id: VoucherId) -> String {
        format!("{}:redeemed:{voucher_id}", self.key_prefix)
    }

    fn record_key(&self, id: RecordId) -> String {
        format!("{}:record:{id}", self.key_prefix)
    }

    fn by_voucher_key(&self, voucher_id: VoucherId) -> String {
        format!("{}:records:by_voucher:{voucher_id}", self.key_prefix)
    }

    fn by_account_key(&self, account_id: AccountId) -> String {
        format!("{}:records:by_account:{account_id}", self.key_prefix)
    }

    fn recent_key(&self) -> String {
        format!("{}:records:recent", self.key_prefix)
    }

    fn attempt_key(&self, source: &str) -> String {
        format!("{}:redeem_attempt:{source}", self.key_prefix)
    }

    /// Bound a Redis future by the ambient timeout and map its errors.
    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(format!("{op}: {e}"))),
            Err(_) => Err(StoreError::Timeout(op)),
        }
    }

    async fn fetch_record(&self, id: RecordId) -> Result<Option<RedemptionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .timed("record", async move {
                redis::cmd("GET")
                    .arg(self.record_key(id))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn fetch_records_by_ids(
        &self,
        ids: Vec<String>,
    ) -> Result<Vec<RedemptionRecord>, StoreError> {
        let mut records = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let id: RecordId = raw_id
                .parse()
                .map_err(|e| StoreError::Serialization(format!("record id: {e}")))?;
            if let Some(record) = self.fetch_record(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    #[instrument(skip(self, voucher), fields(voucher_id = %voucher.id))]
    async fn put_voucher(&self, voucher: &Voucher) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let voucher_key = self.voucher_key(voucher.id);
        let fields = voucher_to_fields(voucher);

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let cmd = pipe.cmd("HSET").arg(&voucher_key);
            for (field, value) in &fields {
                cmd.arg(field).arg(value);
            }
            cmd.ignore();
        }
        pipe.cmd("SADD")
            .arg(self.vouchers_key())
            .arg(voucher.id.to_string())
            .ignore();
        pipe.cmd("HSET")
            .arg(self.code_index_key())
            .arg(voucher.code_hash.as_str())
            .arg(voucher.id.to_string())
            .ignore();

        self.timed("put_voucher", async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn voucher(&self, id: VoucherId) -> Result<Option<Voucher>, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.voucher_key(id);
        let fields: HashMap<String, String> = self
            .timed("voucher", async move {
                redis::cmd("HGETALL").arg(key).query_async(&mut conn).await
            })
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        voucher_from_fields(&fields).map(Some)
    }

    async fn list_vouchers(&self, include_deleted: bool) -> Result<Vec<Voucher>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .timed("list_vouchers", async move {
                redis::cmd("SMEMBERS")
                    .arg(self.vouchers_key())
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let mut vouchers = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let id: VoucherId = raw_id
                .parse()
                .map_err(|e| StoreError::Serialization(format!("voucher id: {e}")))?;
            if let Some(voucher) = self.voucher(id).await? {
                if include_deleted || !voucher.deleted {
                    vouchers.push(voucher);
                }
            }
        }
        vouchers.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(vouchers)
    }

    #[instrument(skip(self, update), fields(voucher_id = %id))]
    async fn update_voucher(
        &self,
        id: VoucherId,
        update: &VoucherUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut conn = self.conn.clone();

        // ARGV[1] carries the usage limit (or '' when untouched); the rest
        // are plain field/value pairs. The script re-checks the limit
        // against the live used_count so the window cannot race a commit.
        let mut invocation = self.update_script.prepare_invoke();
        invocation.key(self.voucher_key(id));
        match update.usage_limit {
            Some(limit) => invocation.arg(limit.to_string()),
            None => invocation.arg(""),
        };
        if let Some(name) = &update.name {
            invocation.arg("name").arg(name);
        }
        if let Some(amount) = update.amount {
            invocation.arg("amount").arg(amount.minor_units().to_string());
        }
        if let Some(expires_at) = &update.expires_at {
            let rendered = expires_at.map(|t| t.to_rfc3339()).unwrap_or_default();
            invocation.arg("expires_at").arg(rendered);
        }
        if let Some(active) = update.active {
            invocation.arg("active").arg(active.to_string());
        }
        if let Some(tags) = &update.tags {
            let rendered = serde_json::to_string(tags)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            invocation.arg("tags").arg(rendered);
        }

        let verdict: String = self
            .timed("update_voucher", async {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        match verdict.as_str() {
            "missing" => Ok(UpdateOutcome::Missing),
            "limit_below_used" => Ok(UpdateOutcome::LimitBelowUsed),
            "updated" => {
                let voucher = self.voucher(id).await?.ok_or_else(|| {
                    StoreError::Unavailable("voucher vanished after update".to_string())
                })?;
                Ok(UpdateOutcome::Updated(voucher))
            }
            other => Err(StoreError::Serialization(format!(
                "unexpected update verdict: {other}"
            ))),
        }
    }

    #[instrument(skip(self), fields(voucher_id = %id))]
    async fn delete_voucher(&self, id: VoucherId) -> Result<bool, StoreError> {
        let Some(voucher) = self.voucher(id).await? else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.voucher_key(id))
            .arg("deleted")
            .arg("true")
            .ignore();
        pipe.cmd("HDEL")
            .arg(self.code_index_key())
            .arg(voucher.code_hash.as_str())
            .ignore();

        self.timed("delete_voucher", async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await?;
        Ok(true)
    }

    async fn resolve_code(&self, hash: &CodeHash) -> Result<Option<VoucherId>, StoreError> {
        let mut conn = self.conn.clone();
        let hash = hash.as_str().to_string();
        let raw: Option<String> = self
            .timed("resolve_code", async move {
                redis::cmd("HGET")
                    .arg(self.code_index_key())
                    .arg(hash)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        raw.map(|raw| {
            raw.parse()
                .map_err(|e| StoreError::Serialization(format!("voucher id: {e}")))
        })
        .transpose()
    }

    #[instrument(
        skip(self, req),
        fields(voucher_id = %req.voucher_id, account_id = %req.account_id)
    )]
    async fn commit_redemption(&self, req: CommitRequest) -> Result<CommitOutcome, StoreError> {
        let record_json = serde_json::to_string(&req.record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let mut invocation = self.commit_script.prepare_invoke();
        invocation
            .key(self.voucher_key(req.voucher_id))
            .key(self.marker_key(req.voucher_id))
            .key(self.record_key(req.record.id))
            .key(self.by_voucher_key(req.voucher_id))
            .key(self.by_account_key(req.account_id))
            .key(self.recent_key())
            .arg(req.account_id.to_string())
            .arg(record_json)
            .arg(req.record.id.to_string());

        let verdict: String = self
            .timed("commit_redemption", async {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        match verdict.as_str() {
            "gone" => Ok(CommitOutcome::VoucherGone),
            "already" => Ok(CommitOutcome::AlreadyRedeemed),
            "exhausted" => Ok(CommitOutcome::Exhausted),
            committed => {
                let used_count = committed
                    .strip_prefix("committed:")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| {
                        StoreError::Serialization(format!(
                            "unexpected commit verdict: {committed}"
                        ))
                    })?;
                Ok(CommitOutcome::Committed { used_count })
            }
        }
    }

    async fn has_redemption(
        &self,
        voucher_id: VoucherId,
        account_id: AccountId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let is_member: bool = self
            .timed("has_redemption", async move {
                redis::cmd("SISMEMBER")
                    .arg(self.marker_key(voucher_id))
                    .arg(account_id.to_string())
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(is_member)
    }

    async fn record(&self, id: RecordId) -> Result<Option<RedemptionRecord>, StoreError> {
        self.fetch_record(id).await
    }

    async fn records_for_voucher(
        &self,
        voucher_id: VoucherId,
        limit: usize,
    ) -> Result<Vec<RedemptionRecord>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        // LRANGE end is inclusive; 0..limit-1 is exactly `limit` entries.
        let end = limit.saturating_sub(1) as isize;
        let ids: Vec<String> = self
            .timed("records_for_voucher", async move {
                redis::cmd("LRANGE")
                    .arg(self.by_voucher_key(voucher_id))
                    .arg(0)
                    .arg(end)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        self.fetch_records_by_ids(ids).await
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<RedemptionRecord>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let end = limit.saturating_sub(1) as isize;
        let ids: Vec<String> = self
            .timed("recent_records", async move {
                redis::cmd("LRANGE")
                    .arg(self.recent_key())
                    .arg(0)
                    .arg(end)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        self.fetch_records_by_ids(ids).await
    }

    async fn attempt_count(&self, source: &str, _now: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.attempt_key(source);
        let count: Option<u32> = self
            .timed("attempt_count", async move {
                redis::cmd("GET").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn record_failed_attempt(
        &self,
        source: &str,
        _now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.attempt_key(source);
        let window_secs = window.num_seconds().max(1);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCR").arg(&key);
        pipe.cmd("EXPIRE").arg(&key).arg(window_secs).ignore();

        let (count,): (u32,) = self
            .timed("record_failed_attempt", async move {
                pipe.query_async(&mut conn).await
            })
            .await?;
        Ok(count)
    }
}

impl core::fmt::Debug for RedisLedgerStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLedgerStore")
            .field("key_prefix", &self.key_prefix)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

fn voucher_to_fields(voucher: &Voucher) -> Vec<(String, String)> {
    vec![
        ("id".to_string(), voucher.id.to_string()),
        ("code_hash".to_string(), voucher.code_hash.as_str().to_string()),
        ("name".to_string(), voucher.name.clone()),
        (
            "amount".to_string(),
            voucher.amount.minor_units().to_string(),
        ),
        ("usage_limit".to_string(), voucher.usage_limit.to_string()),
        ("used_count".to_string(), voucher.used_count.to_string()),
        (
            "expires_at".to_string(),
            voucher
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        ),
        ("active".to_string(), voucher.active.to_string()),
        (
            "tags".to_string(),
            serde_json::to_string(&voucher.tags).unwrap_or_else(|_| "[]".to_string()),
        ),
        ("created_at".to_string(), voucher.created_at.to_rfc3339()),
        ("created_by".to_string(), voucher.created_by.clone()),
        ("deleted".to_string(), voucher.deleted.to_string()),
    ]
}

fn voucher_from_fields(fields: &HashMap<String, String>) -> Result<Voucher, StoreError> {
    let get = |name: &str| -> Result<&str, StoreError> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Serialization(format!("missing voucher field: {name}")))
    };
    let bad = |name: &str, e: &dyn core::fmt::Display| {
        StoreError::Serialization(format!("voucher field {name}: {e}"))
    };

    let expires_at = match get("expires_at")? {
        "" => None,
        raw => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| bad("expires_at", &e))?
                .with_timezone(&Utc),
        ),
    };

    Ok(Voucher {
        id: get("id")?.parse().map_err(|e| bad("id", &e))?,
        code_hash: CodeHash::from_hex(get("code_hash")?),
        name: get("name")?.to_string(),
        amount: CreditAmount::from_minor_units(
            get("amount")?.parse().map_err(|e| bad("amount", &e))?,
        )
        .map_err(|e| bad("amount", &e))?,
        usage_limit: get("usage_limit")?
            .parse()
            .map_err(|e| bad("usage_limit", &e))?,
        used_count: get("used_count")?
            .parse()
            .map_err(|e| bad("used_count", &e))?,
        expires_at,
        active: get("active")?.parse().map_err(|e| bad("active", &e))?,
        tags: serde_json::from_str(get("tags")?).map_err(|e| bad("tags", &e))?,
        created_at: DateTime::parse_from_rfc3339(get("created_at")?)
            .map_err(|e| bad("created_at", &e))?
            .with_timezone(&Utc),
        created_by: get("created_by")?.to_string(),
        deleted: get("deleted")?.parse().map_err(|e| bad("deleted", &e))?,
    })
}
