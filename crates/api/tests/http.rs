//! HTTP round-trips over the full router with in-memory infrastructure.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Extension, Router};
use http_body_util::BodyExt;
use tower::ServiceExt;

use vouchsafe_account::{CredentialToken, InMemoryAccountService};
use vouchsafe_api::app::{routes, services::AppServices};
use vouchsafe_core::{CreditAmount, SystemClock};
use vouchsafe_redemption::RedemptionEngine;
use vouchsafe_store::InMemoryLedgerStore;
use vouchsafe_voucher::CodeGenerator;

fn test_app() -> (Router, Arc<InMemoryAccountService>) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let accounts = Arc::new(InMemoryAccountService::new());
    let engine = RedemptionEngine::new(
        store,
        accounts.clone(),
        Arc::new(SystemClock),
        CodeGenerator::new("http-test-secret"),
    );
    let app = routes::router().layer(Extension(Arc::new(AppServices { engine })));
    (app, accounts)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn create_redeem_and_audit_round_trip() {
    let (app, accounts) = test_app();
    let token = CredentialToken::new("cred-1");
    accounts.register(&token, "Team HTTP", CreditAmount::from_minor_units(500).unwrap());

    // Create: plaintext code appears exactly here.
    let response = app
        .clone()
        .oneshot(post_json(
            "/admin/vouchers",
            serde_json::json!({ "name": "HTTP promo", "amount": 1000 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let code = created["code"].as_str().unwrap().to_string();
    let voucher_id = created["id"].as_str().unwrap().to_string();
    assert!(code.starts_with("RC_"));

    // Listings never echo the code back.
    let response = app
        .clone()
        .oneshot(Request::get("/admin/vouchers").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let listed = json_body(response).await;
    assert_eq!(listed["items"][0].get("code"), None);

    // Redeem.
    let response = app
        .clone()
        .oneshot(post_json(
            "/redeem",
            serde_json::json!({ "code": code, "credential": "cred-1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = json_body(response).await;
    assert_eq!(receipt["credited_amount"], 1000);
    assert_eq!(receipt["new_credit_limit"], 1500);

    // Second redemption by the same account conflicts.
    let response = app
        .clone()
        .oneshot(post_json(
            "/redeem",
            serde_json::json!({ "code": code, "credential": "cred-1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let rejection = json_body(response).await;
    assert_eq!(rejection["error"], "ALREADY_REDEEMED");

    // Audit trail shows the single redemption.
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/admin/vouchers/{voucher_id}/records"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let records = json_body(response).await;
    assert_eq!(records["items"].as_array().unwrap().len(), 1);
    assert_eq!(records["items"][0]["amount"], 1000);
}

#[tokio::test]
async fn invalid_inputs_map_to_client_errors() {
    let (app, _) = test_app();

    // Non-positive amount.
    let response = app
        .clone()
        .oneshot(post_json(
            "/admin/vouchers",
            serde_json::json!({ "amount": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Batch count outside [1, 100].
    let response = app
        .clone()
        .oneshot(post_json(
            "/admin/vouchers/batch",
            serde_json::json!({ "amount": 100, "count": 101 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Malformed voucher id.
    let response = app
        .clone()
        .oneshot(
            Request::get("/admin/vouchers/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown code on redeem.
    let response = app
        .clone()
        .oneshot(post_json(
            "/redeem",
            serde_json::json!({ "code": "RC_DEADBEEF0000", "credential": "nope" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_is_open() {
    let (app, _) = test_app();
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
