use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use ersha_core::DeviceId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::export::{ExportFormat, ExportPayload};
use crate::query::QueryOptions;
use crate::service::StorageService;
use crate::storage::PointStorage;
use crate::telemetry::LifecycleEvent;

pub struct AppState<S: PointStorage> {
    pub service: StorageService<S>,
    pub lifecycle: mpsc::Sender<LifecycleEvent>,
}

impl<S: PointStorage> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn error_response(status: StatusCode, message: String) -> Response {
    let api_response = ApiResponse::<()> {
        success: false,
        data: None,
        message: Some(message),
    };
    (status, Json(api_response)).into_response()
}

fn success_response<T: Serialize>(data: T) -> Response {
    let api_response = ApiResponse {
        success: true,
        data: Some(data),
        message: None,
    };
    (StatusCode::OK, Json(api_response)).into_response()
}

pub fn router<S: PointStorage>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/statistics", get(all_statistics::<S>))
        .route("/statistics/{device_id}", get(device_statistics::<S>))
        .route("/export", get(export::<S>))
        .route("/devices/{device_id}", delete(unregister::<S>))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn all_statistics<S: PointStorage>(State(state): State<AppState<S>>) -> Response {
    success_response(state.service.get_all_statistics().await)
}

async fn device_statistics<S: PointStorage>(
    Path(device_id): Path<String>,
    State(state): State<AppState<S>>,
) -> Response {
    match state
        .service
        .get_device_statistics(&DeviceId::from(device_id))
        .await
    {
        Some(stats) => success_response(stats),
        None => error_response(StatusCode::NOT_FOUND, "Device not found".to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub device_id: Option<String>,
    pub sensor_type: Option<String>,
    pub start_time: Option<jiff::Timestamp>,
    pub end_time: Option<jiff::Timestamp>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub format: ExportFormat,
}

impl ExportParams {
    fn query_options(&self) -> QueryOptions {
        let mut builder = QueryOptions::builder();
        if let Some(device_id) = &self.device_id {
            builder = builder.device(device_id.as_str());
        }
        if let Some(sensor_type) = &self.sensor_type {
            builder = builder.sensor_types([sensor_type.as_str()]);
        }
        if let Some(start) = self.start_time {
            builder = builder.start_time(start);
        }
        if let Some(end) = self.end_time {
            builder = builder.end_time(end);
        }
        if let Some(limit) = self.limit {
            builder = builder.limit(limit);
        }
        builder.build()
    }
}

async fn export<S: PointStorage>(
    Query(params): Query<ExportParams>,
    State(state): State<AppState<S>>,
) -> Response {
    let content_type = match params.format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
        ExportFormat::Excel => "application/vnd.ms-excel",
    };

    match state
        .service
        .export_data(&params.query_options(), params.format)
        .await
    {
        Ok(ExportPayload::Text(text)) => {
            ([(header::CONTENT_TYPE, content_type)], text).into_response()
        }
        Ok(ExportPayload::Binary(bytes)) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to export data: {}", e),
        ),
    }
}

async fn unregister<S: PointStorage>(
    Path(device_id): Path<String>,
    State(state): State<AppState<S>>,
) -> Response {
    let event = LifecycleEvent::DeviceUnregistered {
        device_id: DeviceId::from(device_id),
    };
    match state.lifecycle.send(event).await {
        Ok(()) => {
            let api_response = ApiResponse::<()> {
                success: true,
                data: None,
                message: Some("Unregistration queued".to_string()),
            };
            (StatusCode::ACCEPTED, Json(api_response)).into_response()
        }
        Err(e) => {
            warn!(error = ?e, "Lifecycle channel closed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service is shutting down".to_string(),
            )
        }
    }
}
