use crate::config::ApiConfig;
use crate::session::{CalibrationOutcome, CaptureOutcome, CaptureSession, SessionError};
use crate::vision_client::{CalibrationThresholds, DeviceMode};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use qc_storage::{
    style_code_from_file_name, EvidenceImage, ImageAsset, ImageRole, IngestError, Measurement,
    MeasurementQuery, MeasurementRecord, PipelineError, QcDefect, QcStatus, QcSummary,
    ReportStore, SavedReport, SizeStandard, StandardsIngestor, StandardsStore,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<CaptureSession>,
    pub reports: Arc<dyn ReportStore>,
    pub standards: Arc<dyn StandardsStore>,
    pub ingestor: Arc<StandardsIngestor>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn session_error(err: SessionError) -> ApiError {
    match err {
        SessionError::Transport(e) => {
            error!(error = %e, "Vision backend request failed");
            api_error(StatusCode::BAD_GATEWAY, "VISION_ERROR", e.to_string())
        }
        SessionError::Validation(message) => {
            api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
        }
        SessionError::CaptureInProgress => api_error(
            StatusCode::CONFLICT,
            "CAPTURE_IN_PROGRESS",
            "A camera grab is already in progress",
        ),
        SessionError::NoCapture => api_error(
            StatusCode::NOT_FOUND,
            "NO_CAPTURE",
            "No capture is waiting to be saved",
        ),
        SessionError::Persistence(PipelineError::Validation(message)) => {
            api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
        }
        e @ (SessionError::Persistence(_) | SessionError::Interrupted(_)) => {
            error!(error = %e, "Failed to save report");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                "Failed to save report",
            )
        }
    }
}

fn store_error(err: impl std::fmt::Display, what: &str) -> ApiError {
    error!(error = %err, "Failed to {}", what);
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "STORE_ERROR",
        format!("Failed to {}", what),
    )
}

/// Evidence image as sent to the UI
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageView {
    pub role: ImageRole,
    /// `data:<mime>;base64,<payload>`
    pub data_url: String,
}

impl From<&EvidenceImage> for ImageView {
    fn from(image: &EvidenceImage) -> Self {
        Self {
            role: image.role,
            data_url: format!(
                "data:{};base64,{}",
                image.content_type,
                STANDARD.encode(&image.data)
            ),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: DeviceMode,
}

#[derive(Debug, Deserialize)]
pub struct RotateRequest {
    #[serde(default)]
    pub angle: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CalibrationBody {
    pub pixels_per_cm: f64,
}

#[derive(Debug, Deserialize)]
pub struct CalibrateRequest {
    #[serde(default)]
    pub thresholds: Option<CalibrationThresholds>,
}

/// Calibration attempt result; nothing is applied
#[derive(Debug, Serialize, Deserialize)]
pub struct CalibrateResponse {
    pub success: bool,
    pub pixels_per_cm: Option<f64>,
    pub message: Option<String>,
    pub debug_image: Option<ImageView>,
}

impl From<CalibrationOutcome> for CalibrateResponse {
    fn from(outcome: CalibrationOutcome) -> Self {
        let debug_image = outcome.debug_image().map(ImageView::from);
        match outcome {
            CalibrationOutcome::Detected { pixels_per_cm, .. } => Self {
                success: true,
                pixels_per_cm: Some(pixels_per_cm.get()),
                message: None,
                debug_image,
            },
            CalibrationOutcome::Rejected { reason, .. } => Self {
                success: false,
                pixels_per_cm: None,
                message: Some(reason),
                debug_image,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureRequest {
    #[serde(default)]
    pub garment_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub garment_type: String,
    pub pixels_per_cm: f64,
    pub detected_size: String,
    pub confidence: f64,
    pub qc_status: QcStatus,
    pub qc_failures: Vec<String>,
    /// Set when the QC status and failure reasons disagree
    pub qc_defect: Option<QcDefect>,
    pub measurements: Vec<Measurement>,
    pub images: Vec<ImageView>,
}

impl From<&CaptureOutcome> for CaptureResponse {
    fn from(outcome: &CaptureOutcome) -> Self {
        let result = &outcome.result;
        Self {
            garment_type: outcome.garment_type.clone(),
            pixels_per_cm: outcome.pixels_per_cm.get(),
            detected_size: result.detected_size.clone(),
            confidence: result.confidence,
            qc_status: result.qc_status,
            qc_failures: result.qc_failures.clone(),
            qc_defect: outcome.defect(),
            measurements: result.measurements.clone(),
            images: result.images.iter().map(ImageView::from).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SaveReportRequest {
    /// External garment reference (PO, batch, ticket)
    #[serde(default)]
    pub garment_ref: Option<String>,
}

/// Query parameters for report history
#[derive(Debug, Deserialize)]
pub struct ReportListQuery {
    /// Filter by tenant; defaults to every tenant
    pub tenant_id: Option<String>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportListResponse {
    pub reports: Vec<MeasurementRecord>,
    pub summary: QcSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportImagesResponse {
    pub measurement_id: Uuid,
    pub images: Vec<ImageAsset>,
}

/// Query parameters for standards upload
#[derive(Debug, Deserialize)]
pub struct StandardsUploadQuery {
    pub garment_type: String,
    /// Explicit style code; otherwise derived from `file_name`
    pub style_code: Option<String>,
    pub file_name: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/mode", get(get_mode).post(set_mode))
        .route("/api/rotate-camera", post(rotate_camera))
        .route("/api/calibration", get(get_calibration))
        .route("/api/calibrate", post(calibrate))
        .route("/api/calibration/apply", post(apply_calibration))
        .route("/api/capture", post(capture))
        .route("/api/reports", get(list_reports).post(save_report))
        .route("/api/reports/:measurement_id/images", get(report_images))
        .route(
            "/api/standards",
            post(upload_standards).layer(DefaultBodyLimit::max(config.max_standard_bytes)),
        )
        .route(
            "/api/standards/:garment_type/:style_code",
            get(get_standard),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "qc-console"
    }))
}

async fn get_mode(State(state): State<AppState>) -> Json<ModeBody> {
    Json(ModeBody {
        mode: state.session.modes().current(),
    })
}

#[instrument(skip(state))]
async fn set_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeBody>,
) -> Result<Json<ModeBody>, ApiError> {
    state
        .session
        .modes()
        .set_mode(request.mode)
        .await
        .map_err(|e| session_error(e.into()))?;

    Ok(Json(request))
}

#[instrument(skip(state))]
async fn rotate_camera(
    State(state): State<AppState>,
    Json(request): Json<RotateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rotation = state
        .session
        .rotate_camera(request.angle)
        .await
        .map_err(session_error)?;

    Ok(Json(serde_json::json!({ "rotation": rotation })))
}

async fn get_calibration(State(state): State<AppState>) -> Json<CalibrationBody> {
    Json(CalibrationBody {
        pixels_per_cm: state.session.pixels_per_cm().get(),
    })
}

#[instrument(skip(state))]
async fn calibrate(
    State(state): State<AppState>,
    Json(request): Json<CalibrateRequest>,
) -> Result<Json<CalibrateResponse>, ApiError> {
    let outcome = state
        .session
        .detect_calibration(request.thresholds.unwrap_or_default())
        .await
        .map_err(session_error)?;

    Ok(Json(outcome.into()))
}

#[instrument(skip(state))]
async fn apply_calibration(
    State(state): State<AppState>,
    Json(request): Json<CalibrationBody>,
) -> Result<Json<CalibrationBody>, ApiError> {
    let applied = state
        .session
        .apply_calibration(request.pixels_per_cm)
        .map_err(session_error)?;

    Ok(Json(CalibrationBody {
        pixels_per_cm: applied.get(),
    }))
}

#[instrument(skip(state))]
async fn capture(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<CaptureResponse>, ApiError> {
    let outcome = state
        .session
        .capture(request.garment_type.as_deref())
        .await
        .map_err(session_error)?;

    Ok(Json(CaptureResponse::from(&outcome)))
}

#[instrument(skip(state))]
async fn save_report(
    State(state): State<AppState>,
    Json(request): Json<SaveReportRequest>,
) -> Result<(StatusCode, Json<SavedReport>), ApiError> {
    let saved = state
        .session
        .save_last_capture(request.garment_ref)
        .await
        .map_err(session_error)?;

    Ok((StatusCode::CREATED, Json(saved)))
}

/// Report history, newest first, with a pass-rate summary
#[instrument(skip(state))]
async fn list_reports(
    State(state): State<AppState>,
    Query(params): Query<ReportListQuery>,
) -> Result<Json<ReportListResponse>, ApiError> {
    let query = MeasurementQuery {
        tenant_id: params.tenant_id,
        limit: params.limit.clamp(1, 500),
        ascending: false,
    };

    let reports = state
        .reports
        .list_measurements(&query)
        .await
        .map_err(|e| store_error(e, "query reports"))?;

    let summary = QcSummary::from_records(&reports);

    Ok(Json(ReportListResponse { reports, summary }))
}

#[instrument(skip(state))]
async fn report_images(
    State(state): State<AppState>,
    Path(measurement_id): Path<Uuid>,
) -> Result<Json<ReportImagesResponse>, ApiError> {
    let images = state
        .reports
        .measurement_images(measurement_id)
        .await
        .map_err(|e| store_error(e, "query report images"))?;

    Ok(Json(ReportImagesResponse {
        measurement_id,
        images,
    }))
}

#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn upload_standards(
    State(state): State<AppState>,
    Query(params): Query<StandardsUploadQuery>,
    body: Bytes,
) -> Result<Json<SizeStandard>, ApiError> {
    let style_code = match (params.style_code, params.file_name.as_deref()) {
        (Some(style_code), _) => style_code,
        (None, Some(file_name)) => style_code_from_file_name(file_name).map_err(ingest_error)?,
        (None, None) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "style_code or file_name is required",
            ))
        }
    };

    let standard = state
        .ingestor
        .ingest_csv(&params.garment_type, &style_code, body.as_ref())
        .await
        .map_err(ingest_error)?;

    info!(
        garment_type = %standard.garment_type,
        style_code = %standard.style_code,
        "Standards sheet ingested"
    );

    Ok(Json(standard))
}

fn ingest_error(err: IngestError) -> ApiError {
    match err {
        IngestError::Store(e) => store_error(e, "store size standard"),
        other => {
            warn!(error = %other, "Rejected standards sheet");
            api_error(StatusCode::BAD_REQUEST, "INVALID_STANDARD", other.to_string())
        }
    }
}

#[instrument(skip(state))]
async fn get_standard(
    State(state): State<AppState>,
    Path((garment_type, style_code)): Path<(String, String)>,
) -> Result<Json<SizeStandard>, ApiError> {
    let standard = state
        .standards
        .fetch_standard(&garment_type, &style_code)
        .await
        .map_err(|e| store_error(e, "query size standard"))?;

    standard.map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Size standard not found",
        )
    })
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting console API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
