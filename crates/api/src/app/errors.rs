//! Consistent JSON error responses.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use vouchsafe_core::DomainError;
use vouchsafe_redemption::{AdminError, RedeemError, RejectReason};

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn admin_error_to_response(err: AdminError) -> axum::response::Response {
    match err {
        AdminError::Domain(DomainError::NotFound) => {
            json_error(StatusCode::NOT_FOUND, "not_found", "not found")
        }
        AdminError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        AdminError::Domain(DomainError::InvalidId(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_id", msg)
        }
        AdminError::Domain(DomainError::InvariantViolation(msg)) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        AdminError::Domain(DomainError::Conflict(msg)) => {
            json_error(StatusCode::CONFLICT, "conflict", msg)
        }
        AdminError::Store(e) => json_error(StatusCode::BAD_GATEWAY, "store_error", e.to_string()),
    }
}

pub fn redeem_error_to_response(err: RedeemError) -> axum::response::Response {
    match err {
        RedeemError::Rejected(reason) => {
            let status = match reason {
                RejectReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                RejectReason::InvalidCode => StatusCode::NOT_FOUND,
                RejectReason::InvalidAccount => StatusCode::UNAUTHORIZED,
                RejectReason::CodeDisabled
                | RejectReason::CodeExpired
                | RejectReason::CodeExhausted
                | RejectReason::AlreadyRedeemed => StatusCode::CONFLICT,
            };
            (
                status,
                axum::Json(json!({
                    "error": reason.code(),
                    "message": format!("redemption rejected: {reason}"),
                })),
            )
                .into_response()
        }
        RedeemError::Dependency(msg) => {
            json_error(StatusCode::BAD_GATEWAY, "dependency_unavailable", msg)
        }
        RedeemError::ReconciliationNeeded {
            record_id, cause, ..
        } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({
                "error": "reconciliation_needed",
                "message": format!("credit was not applied: {cause}"),
                "record_id": record_id.to_string(),
            })),
        )
            .into_response(),
    }
}
