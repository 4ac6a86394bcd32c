use vouchsafe_api::app::{self, ApiConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vouchsafe_observability::init();

    let code_secret = std::env::var("VOUCHSAFE_CODE_SECRET").unwrap_or_else(|_| {
        tracing::warn!("VOUCHSAFE_CODE_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let config = ApiConfig {
        code_secret,
        redis_url: std::env::var("REDIS_URL").ok(),
    };

    let bind = std::env::var("VOUCHSAFE_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let app = app::build_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
