use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use serde_json::Value;
use utoipa::OpenApi;
use uuid::Uuid;

use super::{
    dto::{
        AnalyticsQuery, ConfigRequest, PredictionQuery, ReadingDto, RelayRequest,
        ResolveAlertRequest, StatusHistoryQuery, UsageQuery,
    },
    errors::AppError,
};
use crate::{
    analytics::{
        metrics::{BaseMetrics, PeakHour, PowerFactorQuality, QualityGrade, Stats, VoltageQuality},
        prediction::{HorizonForecast, Prediction, PredictionMethod},
        tariff::CostBreakdown,
        EnergyAnalysis, PredictionOptions, DEFAULT_LOOKBACK_DAYS,
    },
    db::models::{
        Alert, AlertType, Device, DeviceConfig, DeviceStatus, DeviceStatusLog, Period,
        ServiceType, UsageStatistics,
    },
    service::{EnergyService, TimeRange, UsageHistory, DEFAULT_STATUS_HISTORY},
};

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// Latest reading of a device.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/readings/latest",
    params(("device_id" = String, Path, description = "Device serial")),
    responses(
        (status = 200, description = "Latest reading", body = ReadingDto),
        (status = 404, description = "Unknown device or no readings yet"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "readings"
)]
pub async fn get_latest_reading(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
) -> Result<Json<ReadingDto>, AppError> {
    let reading = service.latest_reading(&device_id).await?;
    Ok(Json(reading.into()))
}

/// Record one reading object, or an array of them, for a device.
///
/// Readings go through the same validation, alerting and usage aggregation
/// as broker telemetry. The whole batch is rejected if any item is invalid.
#[utoipa::path(
    post,
    path = "/devices/{device_id}/readings",
    params(("device_id" = String, Path, description = "Device serial")),
    request_body(content = Object, description = "Telemetry sample or array of samples"),
    responses(
        (status = 201, description = "Readings recorded", body = Vec<ReadingDto>),
        (status = 400, description = "Validation failed"),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "readings"
)]
pub async fn post_readings(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Vec<ReadingDto>>), AppError> {
    let readings = service.record_reading(&device_id, body).await?;
    Ok((
        StatusCode::CREATED,
        Json(readings.into_iter().map(Into::into).collect()),
    ))
}

// ---------------------------------------------------------------------------
// Usage and analytics
// ---------------------------------------------------------------------------

/// Aggregated usage rows for a time range.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/usage",
    params(("device_id" = String, Path, description = "Device serial"), UsageQuery),
    responses(
        (status = 200, description = "Usage history", body = UsageHistory),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "analytics"
)]
pub async fn get_usage(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
    Query(q): Query<UsageQuery>,
) -> Result<Json<UsageHistory>, AppError> {
    Ok(Json(service.usage_history(&device_id, q.range).await?))
}

/// Metrics, cost, peak hours, supply quality and recommendations for a window.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/analytics",
    params(("device_id" = String, Path, description = "Device serial"), AnalyticsQuery),
    responses(
        (status = 200, description = "Energy analysis", body = EnergyAnalysis),
        (status = 400, description = "Invalid window"),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "analytics"
)]
pub async fn get_analytics(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
    Query(q): Query<AnalyticsQuery>,
) -> Result<Json<EnergyAnalysis>, AppError> {
    let to = q.to.unwrap_or_else(Utc::now);
    let from = q.from.unwrap_or(to - Duration::hours(24));
    Ok(Json(service.analyze(&device_id, from, to).await?))
}

/// Consumption forecast for the next day, week and month.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/predictions",
    params(("device_id" = String, Path, description = "Device serial"), PredictionQuery),
    responses(
        (status = 200, description = "Prediction", body = Prediction),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "analytics"
)]
pub async fn get_prediction(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
    Query(q): Query<PredictionQuery>,
) -> Result<Json<Prediction>, AppError> {
    let options = PredictionOptions {
        method: q.method,
        lookback_days: q.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
    };
    Ok(Json(service.predict_energy_consumption(&device_id, options).await?))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Switch the relay. The stored relay state changes only after the device
/// command was delivered.
#[utoipa::path(
    post,
    path = "/devices/{device_id}/relay",
    params(("device_id" = String, Path, description = "Device serial")),
    request_body = RelayRequest,
    responses(
        (status = 200, description = "Updated device", body = Device),
        (status = 403, description = "Caller does not own the device"),
        (status = 404, description = "Unknown device"),
        (status = 502, description = "Command could not be delivered"),
    ),
    tag = "control"
)]
pub async fn post_relay(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
    Json(req): Json<RelayRequest>,
) -> Result<Json<Device>, AppError> {
    Ok(Json(service.control_relay(&device_id, req.user_id, req.state).await?))
}

/// Push new limits to the device.
#[utoipa::path(
    post,
    path = "/devices/{device_id}/config",
    params(("device_id" = String, Path, description = "Device serial")),
    request_body = ConfigRequest,
    responses(
        (status = 200, description = "Updated device", body = Device),
        (status = 400, description = "Invalid configuration"),
        (status = 403, description = "Caller does not own the device"),
        (status = 404, description = "Unknown device"),
        (status = 502, description = "Command could not be delivered"),
    ),
    tag = "control"
)]
pub async fn post_config(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
    Json(req): Json<ConfigRequest>,
) -> Result<Json<Device>, AppError> {
    Ok(Json(service.update_config(&device_id, req.user_id, req.config).await?))
}

// ---------------------------------------------------------------------------
// Alerts and status history
// ---------------------------------------------------------------------------

/// Active alerts of a device, newest first.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/alerts",
    params(("device_id" = String, Path, description = "Device serial")),
    responses(
        (status = 200, description = "Active alerts", body = Vec<Alert>),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "alerts"
)]
pub async fn get_active_alerts(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
) -> Result<Json<Vec<Alert>>, AppError> {
    Ok(Json(service.list_active_alerts(&device_id).await?))
}

/// Mark an alert resolved.
#[utoipa::path(
    post,
    path = "/devices/{device_id}/alerts/{alert_id}/resolve",
    params(
        ("device_id" = String, Path, description = "Device serial"),
        ("alert_id" = Uuid, Path, description = "Alert id"),
    ),
    request_body = ResolveAlertRequest,
    responses(
        (status = 200, description = "Resolved alert", body = Alert),
        (status = 403, description = "Caller does not own the device"),
        (status = 404, description = "Unknown device or alert"),
    ),
    tag = "alerts"
)]
pub async fn post_resolve_alert(
    State(service): State<EnergyService>,
    Path((device_id, alert_id)): Path<(String, Uuid)>,
    Json(req): Json<ResolveAlertRequest>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(service.resolve_alert(&device_id, req.user_id, alert_id).await?))
}

/// Recent connection-status transitions.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/status-history",
    params(("device_id" = String, Path, description = "Device serial"), StatusHistoryQuery),
    responses(
        (status = 200, description = "Status log entries", body = Vec<DeviceStatusLog>),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "alerts"
)]
pub async fn get_status_history(
    State(service): State<EnergyService>,
    Path(device_id): Path<String>,
    Query(q): Query<StatusHistoryQuery>,
) -> Result<Json<Vec<DeviceStatusLog>>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_STATUS_HISTORY);
    Ok(Json(service.status_history(&device_id, limit).await?))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        get_latest_reading,
        post_readings,
        get_usage,
        get_analytics,
        get_prediction,
        post_relay,
        post_config,
        get_active_alerts,
        post_resolve_alert,
        get_status_history,
        health
    ),
    components(schemas(
        ReadingDto,
        RelayRequest,
        ConfigRequest,
        ResolveAlertRequest,
        Alert,
        AlertType,
        DeviceStatusLog,
        Device,
        DeviceStatus,
        DeviceConfig,
        UsageHistory,
        UsageStatistics,
        Period,
        TimeRange,
        EnergyAnalysis,
        BaseMetrics,
        Stats,
        PeakHour,
        VoltageQuality,
        PowerFactorQuality,
        QualityGrade,
        CostBreakdown,
        ServiceType,
        Prediction,
        PredictionMethod,
        HorizonForecast,
    )),
    tags(
        (name = "readings",  description = "Telemetry readings"),
        (name = "analytics", description = "Usage, analysis and forecasts"),
        (name = "control",   description = "Device commands"),
        (name = "alerts",    description = "Alerts and status history"),
        (name = "system",    description = "System endpoints"),
    ),
    info(
        title = "Home Energy Service API",
        version = "0.1.0",
        description = "REST API over the home energy telemetry pipeline"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
