use crate::db::recent_readings;
use crate::errors::Error;
use crate::model::{LiveView, ProcessParameters, ReadingsResponse};
use crate::mqtt::MqttLiveSource;
use crate::predict::{Prediction, Predictor};
use crate::registry::Registry;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    pool: PgPool,
    live: Arc<MqttLiveSource>,
    predictor: Arc<dyn Predictor>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DevicesResponse {
    observed: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PredictionResponse {
    device_id: String,
    reading_timestamp: DateTime<Utc>,
    is_offline: bool,
    generated_at: DateTime<Utc>,
    #[serde(flatten)]
    prediction: Prediction,
}

pub fn create_router(
    registry: Arc<Registry>,
    pool: PgPool,
    live: Arc<MqttLiveSource>,
    predictor: Arc<dyn Predictor>,
) -> Router {
    let state = AppState {
        registry,
        pool,
        live,
        predictor,
    };

    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route(
            "/api/v1/devices/:device_id/live",
            get(get_live).delete(release_live),
        )
        .route("/api/v1/devices/:device_id/readings", get(get_readings))
        .route("/api/v1/devices/:device_id/latest-data", get(get_latest_data))
        .route("/api/v1/devices/:device_id/prediction", get(get_prediction))
        .with_state(state)
}

async fn list_devices(State(state): State<AppState>) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        observed: state.registry.observed().await,
    })
}

async fn get_live(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Json<LiveView> {
    Json(state.registry.view(&device_id).await)
}

async fn release_live(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> StatusCode {
    if state.registry.release(&device_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_readings(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(10).clamp(1, 1000);

    let data = recent_readings(&state.pool, &device_id, limit).await?;

    Ok(Json(ReadingsResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn get_latest_data(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<ProcessParameters>, AppError> {
    let snapshot = state
        .live
        .latest(&device_id)
        .ok_or(Error::NoData(device_id))?;

    Ok(Json(ProcessParameters::from_snapshot(&snapshot)))
}

async fn get_prediction(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<PredictionResponse>, AppError> {
    // only devices already observed through the live route are predicted on
    let view = state
        .registry
        .peek(&device_id)
        .await
        .ok_or_else(|| Error::NoData(device_id.clone()))?;
    let reading = view
        .current_reading
        .ok_or_else(|| Error::NoData(device_id.clone()))?;

    Ok(Json(PredictionResponse {
        device_id,
        reading_timestamp: reading.timestamp,
        is_offline: view.is_offline,
        generated_at: Utc::now(),
        prediction: state.predictor.predict(&reading),
    }))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(Error::NoData(_)) = self.0.downcast_ref::<Error>() {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "No data available for this device" })),
            )
                .into_response();
        }

        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
