//! HTTP client for the kiosk's vision backend.
//!
//! The backend owns the camera and the measurement algorithms. This module
//! only speaks its request/response contract: multipart form requests in,
//! JSON out, evidence images as base64 data URLs.

use crate::config::VisionConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use qc_storage::{CaptureResult, EvidenceImage, ImageRole, Measurement, PixelsPerCm, QcStatus};
use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument};

/// Operating mode of the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceMode {
    /// Plain camera passthrough
    #[default]
    Raw,
    /// Calibration overlay
    Calibration,
    /// Measurement overlay
    Measure,
}

impl DeviceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMode::Raw => "RAW",
            DeviceMode::Calibration => "CALIBRATION",
            DeviceMode::Measure => "MEASURE",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failures talking to the vision backend.
///
/// None of these is a QC outcome; a FAIL verdict arrives as a successful
/// [`CaptureResult`].
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision backend request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("vision backend request timed out")]
    Timeout,

    #[error("vision backend error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("malformed vision backend response: {0}")]
    Malformed(String),

    #[error("vision backend could not process the capture: {0}")]
    Processing(String),
}

impl From<reqwest::Error> for VisionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VisionError::Timeout
        } else if err.is_decode() {
            VisionError::Malformed(err.to_string())
        } else {
            VisionError::Request(err)
        }
    }
}

/// Edge-detection thresholds for a calibration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationThresholds {
    pub t1: u32,
    pub t2: u32,
}

impl Default for CalibrationThresholds {
    fn default() -> Self {
        Self { t1: 50, t2: 150 }
    }
}

/// What the backend reported for a calibration attempt, before interpretation
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub success: bool,
    /// `None` when the backend sent nothing numeric
    pub pixels_per_cm: Option<f64>,
    pub message: Option<String>,
    pub debug_image: Option<EvidenceImage>,
}

/// Vision backend operations used by the console
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Request a device mode; returns once the request is acknowledged
    async fn set_mode(&self, mode: DeviceMode) -> Result<(), VisionError>;

    /// Grab a frame and look for the calibration target
    async fn calibrate(
        &self,
        thresholds: CalibrationThresholds,
    ) -> Result<CalibrationReport, VisionError>;

    /// Grab a frame and measure the garment on it
    async fn capture(
        &self,
        pixels_per_cm: PixelsPerCm,
        garment_type: &str,
    ) -> Result<CaptureResult, VisionError>;

    /// Set camera rotation in degrees; returns the rotation now in effect
    async fn rotate_camera(&self, angle: u16) -> Result<u16, VisionError>;

    /// Calibration the backend persisted from an earlier session, unvalidated
    async fn saved_calibration(&self) -> Result<Option<f64>, VisionError>;
}

#[derive(Debug, Deserialize)]
struct CalibrateResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    pixels_per_cm: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    debug_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    #[serde(default)]
    measure_image: Option<String>,
    #[serde(default)]
    detect_image: Option<String>,
    #[serde(default)]
    edge_image: Option<String>,
    #[serde(default)]
    debug_image: Option<String>,
    #[serde(default)]
    detected_size: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    qc_status: Option<String>,
    #[serde(default)]
    qc_failures: Vec<String>,
    #[serde(default)]
    data: Vec<Measurement>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RotationResponse {
    rotation: u16,
}

#[derive(Debug, Deserialize)]
struct SavedCalibrationResponse {
    #[serde(default)]
    pixels_per_cm: Option<serde_json::Value>,
}

/// reqwest-backed [`VisionBackend`]
pub struct HttpVisionClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVisionClient {
    /// Create a client with the configured timeouts
    pub fn new(config: &VisionConfig) -> Result<Self, VisionError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(VisionError::Request)?;

        Ok(Self::with_client(client, config.base_url.clone()))
    }

    /// Create a client reusing an existing [`reqwest::Client`]
    pub fn with_client(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: Form,
    ) -> Result<T, VisionError> {
        let response = self
            .client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Ensure the response has a success status code
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, VisionError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(VisionError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, VisionError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl VisionBackend for HttpVisionClient {
    #[instrument(skip(self))]
    async fn set_mode(&self, mode: DeviceMode) -> Result<(), VisionError> {
        let form = Form::new().text("mode", mode.as_str());

        let response = self
            .client
            .post(self.url("/api/set-mode"))
            .multipart(form)
            .send()
            .await?;
        Self::ensure_success(response).await?;

        debug!(%mode, "Device mode requested");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn calibrate(
        &self,
        thresholds: CalibrationThresholds,
    ) -> Result<CalibrationReport, VisionError> {
        let form = Form::new()
            .text("t1", thresholds.t1.to_string())
            .text("t2", thresholds.t2.to_string());

        let response: CalibrateResponse = self.post_form("/api/calibrate", form).await?;
        calibration_report(response)
    }

    #[instrument(skip(self), fields(pixels_per_cm = pixels_per_cm.get()))]
    async fn capture(
        &self,
        pixels_per_cm: PixelsPerCm,
        garment_type: &str,
    ) -> Result<CaptureResult, VisionError> {
        let form = Form::new()
            .text("use_internal_cam", "true")
            .text("pixels_per_cm", pixels_per_cm.get().to_string())
            .text("manual_garment_type", garment_type.to_string())
            .text("save_report", "false");

        let response: ProcessResponse = self.post_form("/process", form).await?;
        capture_result(response)
    }

    #[instrument(skip(self))]
    async fn rotate_camera(&self, angle: u16) -> Result<u16, VisionError> {
        let form = Form::new().text("angle", angle.to_string());

        let response: RotationResponse = self.post_form("/api/rotate-camera", form).await?;
        Ok(response.rotation)
    }

    #[instrument(skip(self))]
    async fn saved_calibration(&self) -> Result<Option<f64>, VisionError> {
        let response = self.client.get(self.url("/api/calibration")).send().await?;
        let saved: SavedCalibrationResponse = Self::parse_response(response).await?;

        Ok(saved.pixels_per_cm.as_ref().and_then(numeric))
    }
}

/// Accepts JSON numbers and numeric strings
fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn calibration_report(response: CalibrateResponse) -> Result<CalibrationReport, VisionError> {
    let debug_image = match response.debug_image.as_deref() {
        Some(encoded) => decode_image(ImageRole::Debug, encoded)?,
        None => None,
    };

    Ok(CalibrationReport {
        success: response.success,
        pixels_per_cm: response.pixels_per_cm.as_ref().and_then(numeric),
        message: response.message.filter(|m| !m.trim().is_empty()),
        debug_image,
    })
}

fn capture_result(response: ProcessResponse) -> Result<CaptureResult, VisionError> {
    if let Some(error) = response.error.filter(|e| !e.trim().is_empty()) {
        return Err(VisionError::Processing(error));
    }

    let encoded = [
        (ImageRole::Measure, response.measure_image),
        (ImageRole::Detect, response.detect_image),
        (ImageRole::Edge, response.edge_image),
        (ImageRole::Debug, response.debug_image),
    ];

    let mut images = Vec::new();
    for (role, data) in encoded {
        if let Some(image) = data.as_deref().map(|d| decode_image(role, d)).transpose()?.flatten() {
            images.push(image);
        }
    }

    Ok(CaptureResult {
        images,
        detected_size: response.detected_size.unwrap_or_default(),
        confidence: response.confidence.unwrap_or_default(),
        qc_status: response
            .qc_status
            .as_deref()
            .map(QcStatus::parse)
            .unwrap_or_default(),
        qc_failures: response.qc_failures,
        measurements: response.data,
    })
}

/// Decode a `data:<mime>;base64,<payload>` string, or bare base64 as PNG.
///
/// Empty input means the backend produced no image for the role.
pub fn decode_image(role: ImageRole, encoded: &str) -> Result<Option<EvidenceImage>, VisionError> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Ok(None);
    }

    let (content_type, payload) = match encoded.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest.split_once(',').ok_or_else(|| {
                VisionError::Malformed(format!("{} image: data URL has no payload", role))
            })?;
            let mime = header.strip_suffix(";base64").ok_or_else(|| {
                VisionError::Malformed(format!("{} image: data URL is not base64", role))
            })?;
            let mime = if mime.is_empty() { "image/png" } else { mime };
            (mime.to_string(), payload)
        }
        None => ("image/png".to_string(), encoded),
    };

    let data = STANDARD
        .decode(payload)
        .map_err(|e| VisionError::Malformed(format!("{} image: {}", role, e)))?;

    Ok(Some(EvidenceImage {
        role,
        content_type,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::time::Duration;

    fn png_data_url(bytes: &[u8]) -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(bytes))
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String, timeout: Duration) -> HttpVisionClient {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap();
        HttpVisionClient::with_client(client, base_url)
    }

    #[test]
    fn test_device_mode_strings() {
        assert_eq!(DeviceMode::default(), DeviceMode::Raw);
        assert_eq!(DeviceMode::Calibration.as_str(), "CALIBRATION");
        assert_eq!(
            serde_json::to_string(&DeviceMode::Measure).unwrap(),
            "\"MEASURE\""
        );
        let mode: DeviceMode = serde_json::from_str("\"RAW\"").unwrap();
        assert_eq!(mode, DeviceMode::Raw);
    }

    #[test]
    fn test_decode_data_url() {
        let image = decode_image(ImageRole::Measure, "data:image/jpeg;base64,AQID")
            .unwrap()
            .unwrap();

        assert_eq!(image.role, ImageRole::Measure);
        assert_eq!(image.content_type, "image/jpeg");
        assert_eq!(image.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_bare_base64_and_empty() {
        let image = decode_image(ImageRole::Edge, "AQID").unwrap().unwrap();
        assert_eq!(image.content_type, "image/png");

        assert!(decode_image(ImageRole::Edge, "  ").unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_image(ImageRole::Detect, "data:image/png;base64,@@@"),
            Err(VisionError::Malformed(_))
        ));
        assert!(matches!(
            decode_image(ImageRole::Detect, "data:image/png,AQID"),
            Err(VisionError::Malformed(_))
        ));
    }

    #[test]
    fn test_capture_result_mapping() {
        let response: ProcessResponse = serde_json::from_value(serde_json::json!({
            "measure_image": png_data_url(&[1, 2]),
            "detect_image": png_data_url(&[3]),
            "edge_image": "",
            "detected_size": "M",
            "confidence": 0.91,
            "qc_status": "FAIL",
            "qc_failures": ["Waist +2.1cm over tolerance"],
            "data": [{ "name": "Waist", "value": 84.1 }]
        }))
        .unwrap();

        let result = capture_result(response).unwrap();
        assert_eq!(result.images.len(), 2);
        assert!(result.image(ImageRole::Edge).is_none());
        assert_eq!(result.qc_status, QcStatus::Fail);
        assert_eq!(result.qc_failures.len(), 1);
        assert_eq!(result.measurements[0].unit, "cm");
        assert!(result.qc_defect().is_none());
    }

    #[test]
    fn test_backend_error_is_processing_failure() {
        let response: ProcessResponse =
            serde_json::from_value(serde_json::json!({ "error": "No garment detected" })).unwrap();

        assert!(matches!(
            capture_result(response),
            Err(VisionError::Processing(message)) if message == "No garment detected"
        ));
    }

    #[test]
    fn test_calibration_report_keeps_non_numeric_as_none() {
        let response: CalibrateResponse = serde_json::from_value(serde_json::json!({
            "success": true,
            "pixels_per_cm": "n/a",
            "message": "A4 paper not detected"
        }))
        .unwrap();

        let report = calibration_report(response).unwrap();
        assert!(report.success);
        assert!(report.pixels_per_cm.is_none());
        assert_eq!(report.message.as_deref(), Some("A4 paper not detected"));
    }

    #[tokio::test]
    async fn test_capture_over_http() {
        let router = Router::new().route(
            "/process",
            post(|| async {
                Json(serde_json::json!({
                    "measure_image": png_data_url(&[9, 9]),
                    "detected_size": "L",
                    "confidence": 0.8,
                    "qc_status": "PASS",
                    "qc_failures": [],
                    "data": []
                }))
            }),
        );
        let base_url = serve(router).await;
        let client = client(base_url, Duration::from_secs(5));

        let result = client
            .capture(PixelsPerCm::new(8.8).unwrap(), "trousers")
            .await
            .unwrap();

        assert_eq!(result.detected_size, "L");
        assert_eq!(result.qc_status, QcStatus::Pass);
        assert_eq!(result.image(ImageRole::Measure).unwrap().data, vec![9, 9]);
    }

    #[tokio::test]
    async fn test_error_status_is_api_error() {
        let router = Router::new().route(
            "/api/set-mode",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "camera busy") }),
        );
        let base_url = serve(router).await;
        let client = client(base_url, Duration::from_secs(5));

        let err = client.set_mode(DeviceMode::Measure).await.unwrap_err();
        assert!(matches!(err, VisionError::Api { status: 503, ref body } if body == "camera busy"));
    }

    #[tokio::test]
    async fn test_slow_backend_is_timeout() {
        let router = Router::new().route(
            "/api/calibrate",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(serde_json::json!({ "success": true, "pixels_per_cm": 9.1 }))
            }),
        );
        let base_url = serve(router).await;
        let client = client(base_url, Duration::from_millis(100));

        let err = client
            .calibrate(CalibrationThresholds::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::Timeout));
    }
}
