use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use vouchsafe_account::CredentialToken;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Source identity of the redeeming request. Behind a proxy the client IP
/// travels in `x-forwarded-for` (first hop wins); otherwise "unknown", which
/// throttles all unattributed traffic as one source.
fn source_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn redeem(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::RedeemRequest>,
) -> axum::response::Response {
    let source = source_identity(&headers);
    let credential = CredentialToken::new(body.credential);

    match services
        .engine
        .redeem(&body.code, &credential, &source)
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "credited_amount": receipt.credited_amount.minor_units(),
                "new_credit_limit": receipt.new_credit_limit.minor_units(),
            })),
        )
            .into_response(),
        Err(e) => errors::redeem_error_to_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_identity_takes_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(source_identity(&headers), "203.0.113.7");
    }

    #[test]
    fn missing_header_falls_back_to_unknown() {
        assert_eq!(source_identity(&HeaderMap::new()), "unknown");
    }
}
