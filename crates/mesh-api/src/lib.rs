pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// The API router, with every route nested under `/api`.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/state", get(handlers::handle_state))
        .route("/nodes", get(handlers::handle_nodes))
        .route("/link", get(handlers::handle_link))
        .route("/hotspot", post(handlers::handle_hotspot))
        .route("/connect", post(handlers::handle_connect))
        .route("/station/disconnect", post(handlers::handle_disconnect))
        .route("/concurrency/probe", post(handlers::handle_probe))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
