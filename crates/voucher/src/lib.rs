//! `vouchsafe-voucher` — voucher domain model.
//!
//! The voucher record and its lifecycle commands, the secret-code generator,
//! and the immutable redemption record. Pure domain logic: no storage, no IO.

pub mod code;
pub mod record;
pub mod voucher;

pub use code::{CodeGenerator, CodeHash, PlainCode, CODE_PREFIX};
pub use record::RedemptionRecord;
pub use voucher::{
    validate_batch_count, NewVoucher, RedeemBlock, Voucher, VoucherUpdate, BATCH_MAX,
    DEFAULT_USAGE_LIMIT,
};
