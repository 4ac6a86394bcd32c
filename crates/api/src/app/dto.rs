//! Request DTOs and JSON mapping helpers.
//!
//! Amounts cross the wire as integer minor units (cents); partial updates
//! reuse the typed `VoucherUpdate` structure directly, so "absent" and
//! "null" stay distinguishable.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use vouchsafe_core::CreditAmount;
use vouchsafe_redemption::IssuedVoucher;
use vouchsafe_voucher::{NewVoucher, RedemptionRecord, Voucher};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateVoucherRequest {
    pub name: Option<String>,
    /// Minor units; must be positive.
    pub amount: i64,
    pub usage_limit: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    pub name: Option<String>,
    pub amount: i64,
    pub usage_limit: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
    pub count: u32,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
    pub credential: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListVouchersQuery {
    pub code: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct RecordsQuery {
    pub limit: Option<usize>,
}

impl CreateVoucherRequest {
    pub fn into_spec(self, created_by: String) -> Result<NewVoucher, axum::response::Response> {
        new_voucher_spec(
            self.name,
            self.amount,
            self.usage_limit,
            self.expires_at,
            self.tags,
            created_by,
        )
    }
}

impl BatchCreateRequest {
    pub fn into_spec(self, created_by: String) -> Result<NewVoucher, axum::response::Response> {
        new_voucher_spec(
            self.name,
            self.amount,
            self.usage_limit,
            self.expires_at,
            self.tags,
            created_by,
        )
    }
}

fn new_voucher_spec(
    name: Option<String>,
    amount: i64,
    usage_limit: Option<u32>,
    expires_at: Option<DateTime<Utc>>,
    tags: Option<Vec<String>>,
    created_by: String,
) -> Result<NewVoucher, axum::response::Response> {
    let amount = CreditAmount::from_minor_units(amount).map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
    })?;
    Ok(NewVoucher {
        name: name.unwrap_or_else(|| "Unnamed voucher".to_string()),
        amount,
        usage_limit,
        expires_at,
        tags: tags.unwrap_or_default(),
        created_by,
    })
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn voucher_to_json(v: &Voucher) -> serde_json::Value {
    serde_json::json!({
        "id": v.id.to_string(),
        "name": v.name,
        "amount": v.amount.minor_units(),
        "usage_limit": v.usage_limit,
        "used_count": v.used_count,
        "expires_at": v.expires_at.map(|t| t.to_rfc3339()),
        "active": v.active,
        "tags": v.tags,
        "created_at": v.created_at.to_rfc3339(),
        "created_by": v.created_by,
        "deleted": v.deleted,
    })
}

/// Creation response: the only place the plaintext code ever appears.
pub fn issued_to_json(issued: &IssuedVoucher) -> serde_json::Value {
    let mut json = voucher_to_json(&issued.voucher);
    json["code"] = serde_json::Value::String(issued.code.as_str().to_string());
    json
}

pub fn record_to_json(r: &RedemptionRecord) -> serde_json::Value {
    serde_json::json!({
        "id": r.id.to_string(),
        "voucher_id": r.voucher_id.to_string(),
        "voucher_name": r.voucher_name,
        "account_id": r.account_id.to_string(),
        "account_name": r.account_name,
        "amount": r.amount.minor_units(),
        "redeemed_at": r.redeemed_at.to_rfc3339(),
        "source": r.source,
        "limit_before": r.limit_before.minor_units(),
        "limit_after": r.limit_after.minor_units(),
    })
}
