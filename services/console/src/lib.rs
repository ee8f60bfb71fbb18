//! QC Console - operator service for the garment measurement kiosk
//!
//! The console sits between the kiosk UI and the vision backend that owns the
//! camera. It handles:
//!
//! - Device modes, entered for the duration of one operation and always restored
//! - Calibration: detection is a dry run, applying is a separate explicit step
//! - Captures, serialized so only one camera grab is in flight
//! - Saving the last capture as a QC report (see [`qc_storage::ReportPipeline`])
//! - Size standard uploads and report history over HTTP
//!
//! # Example
//!
//! ```rust,no_run
//! use qc_console::{CaptureSession, DeviceModeController, HttpVisionClient, SessionSettings};
//! use qc_console::config::Config;
//! use qc_storage::{PgRecordStore, PixelsPerCm, ReportPipeline, S3Uploader};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!
//!     let vision = Arc::new(HttpVisionClient::new(&config.vision)?);
//!     let store = Arc::new(PgRecordStore::new(&config.database).await?);
//!     let uploader = Arc::new(S3Uploader::new(&config.s3).await?);
//!     let pipeline = ReportPipeline::new(uploader, store, config.pipeline.clone());
//!
//!     let session = CaptureSession::new(
//!         vision.clone(),
//!         DeviceModeController::new(vision),
//!         Arc::new(pipeline),
//!         SessionSettings {
//!             tenant_id: config.session.tenant_id.clone(),
//!             default_garment_type: config.session.garment_type.clone(),
//!             pixels_per_cm: PixelsPerCm::new(config.session.default_pixels_per_cm)?,
//!         },
//!     );
//!
//!     let outcome = session.capture(Some("trousers")).await?;
//!     if !outcome.is_qc_fail() {
//!         session.save_last_capture(Some("PO-1182".to_string())).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod device_mode;
pub mod session;
pub mod vision_client;

#[cfg(test)]
mod testing;

// Re-export main types
pub use api::{create_router, start_api_server, AppState, ErrorResponse};
pub use config::{ApiConfig, Config, ServiceConfig, SessionConfig, VisionConfig};
pub use device_mode::{DeviceModeController, ModeGuard};
pub use session::{
    CalibrationOutcome, CaptureOutcome, CaptureSession, SessionError, SessionSettings,
    SUPPORTED_ROTATIONS,
};
pub use vision_client::{
    decode_image, CalibrationReport, CalibrationThresholds, DeviceMode, HttpVisionClient,
    VisionBackend, VisionError,
};
