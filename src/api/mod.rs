pub mod dto;
pub mod errors;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::service::EnergyService;
use handlers::ApiDoc;

pub fn router(service: EnergyService) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route(
            "/devices/{device_id}/readings/latest",
            get(handlers::get_latest_reading),
        )
        .route("/devices/{device_id}/readings", post(handlers::post_readings))
        .route("/devices/{device_id}/usage", get(handlers::get_usage))
        .route("/devices/{device_id}/analytics", get(handlers::get_analytics))
        .route("/devices/{device_id}/predictions", get(handlers::get_prediction))
        .route("/devices/{device_id}/relay", post(handlers::post_relay))
        .route("/devices/{device_id}/config", post(handlers::post_config))
        .route("/devices/{device_id}/alerts", get(handlers::get_active_alerts))
        .route(
            "/devices/{device_id}/alerts/{alert_id}/resolve",
            post(handlers::post_resolve_alert),
        )
        .route(
            "/devices/{device_id}/status-history",
            get(handlers::get_status_history),
        )
        .with_state(service)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
