pub mod auth;
pub mod config;
pub mod http_api;
pub mod state;
pub mod ws_common;
pub mod ws_connector;
pub mod ws_observer;

pub use state::AppState;

use axum::{Router, routing::get};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/connectors", get(ws_connector::ws_connector_handler))
        .route("/ws/v1/observers", get(ws_observer::ws_observer_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/v1/sensors", get(http_api::list_sensors))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
