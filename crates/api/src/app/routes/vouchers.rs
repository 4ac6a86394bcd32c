//! Administrative voucher routes.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use vouchsafe_core::{RecordId, VoucherId};
use vouchsafe_redemption::ListFilter;
use vouchsafe_voucher::VoucherUpdate;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route(
            "/vouchers",
            get(list_vouchers).post(create_voucher),
        )
        .route("/vouchers/batch", axum::routing::post(batch_create))
        .route(
            "/vouchers/:id",
            get(get_voucher).put(update_voucher).delete(delete_voucher),
        )
        .route("/vouchers/:id/records", get(voucher_records))
        .route("/records", get(recent_records))
        .route("/records/:id", get(get_record))
}

/// Creator identity; real authentication happens upstream.
fn created_by(headers: &HeaderMap) -> String {
    headers
        .get("x-admin-user")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "admin".to_string())
}

fn parse_voucher_id(raw: &str) -> Result<VoucherId, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "malformed voucher id")
    })
}

pub async fn list_vouchers(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListVouchersQuery>,
) -> axum::response::Response {
    let filter = ListFilter {
        code: query.code.filter(|c| !c.trim().is_empty()),
        include_deleted: query.include_deleted,
    };
    match services.engine.list_vouchers(filter).await {
        Ok(vouchers) => {
            let items: Vec<_> = vouchers.iter().map(dto::voucher_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn create_voucher(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::CreateVoucherRequest>,
) -> axum::response::Response {
    let spec = match body.into_spec(created_by(&headers)) {
        Ok(spec) => spec,
        Err(resp) => return resp,
    };
    match services.engine.create_voucher(spec).await {
        Ok(issued) => (StatusCode::CREATED, Json(dto::issued_to_json(&issued))).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn batch_create(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<dto::BatchCreateRequest>,
) -> axum::response::Response {
    let count = body.count;
    let spec = match body.into_spec(created_by(&headers)) {
        Ok(spec) => spec,
        Err(resp) => return resp,
    };
    match services.engine.create_batch(spec, count).await {
        Ok(issued) => {
            let items: Vec<_> = issued.iter().map(dto::issued_to_json).collect();
            (
                StatusCode::CREATED,
                Json(serde_json::json!({ "items": items })),
            )
                .into_response()
        }
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn get_voucher(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_voucher_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.engine.voucher(id).await {
        Ok(voucher) => (StatusCode::OK, Json(dto::voucher_to_json(&voucher))).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn update_voucher(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(update): Json<VoucherUpdate>,
) -> axum::response::Response {
    let id = match parse_voucher_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.engine.update_voucher(id, update).await {
        Ok(voucher) => (StatusCode::OK, Json(dto::voucher_to_json(&voucher))).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn delete_voucher(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_voucher_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.engine.delete_voucher(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "deleted": true })),
        )
            .into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn voucher_records(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::RecordsQuery>,
) -> axum::response::Response {
    let id = match parse_voucher_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.engine.records_for_voucher(id, query.limit).await {
        Ok(records) => {
            let items: Vec<_> = records.iter().map(dto::record_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn recent_records(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::RecordsQuery>,
) -> axum::response::Response {
    match services.engine.recent_records(query.limit).await {
        Ok(records) => {
            let items: Vec<_> = records.iter().map(dto::record_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::admin_error_to_response(e),
    }
}

pub async fn get_record(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: RecordId = match id.parse() {
        Ok(id) => id,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_id",
                "malformed record id",
            )
        }
    };
    match services.engine.record(id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(dto::record_to_json(&record))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "record not found"),
        Err(e) => errors::admin_error_to_response(e),
    }
}
