use axum::{routing::get, routing::post, Router};

pub mod redeem;
pub mod system;
pub mod vouchers;

/// Full routing tree. Administrative authentication happens upstream
/// (reverse proxy / gateway); these routes assume it is done.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/redeem", post(redeem::redeem))
        .nest("/admin", vouchers::router())
}
