//! Capture and calibration session for one physical device.
//!
//! The session owns the calibration constant and the last capture awaiting
//! review. Detecting a calibration and applying it are separate steps; only
//! [`CaptureSession::apply_calibration`] (and the startup bootstrap) write the
//! constant.
//!
//! Precondition: exactly one session drives a device. The session keeps its
//! own camera grabs from overlapping but cannot see other processes.

use crate::device_mode::DeviceModeController;
use crate::vision_client::{
    CalibrationReport, CalibrationThresholds, DeviceMode, VisionBackend, VisionError,
};
use parking_lot::{Mutex, RwLock};
use qc_storage::{
    CaptureResult, EvidenceImage, InvalidCalibration, PipelineError, PixelsPerCm, QcDefect,
    QcStatus, ReportContext, ReportPipeline, SavedReport,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Camera rotations the device supports, in degrees
pub const SUPPORTED_ROTATIONS: [u16; 4] = [0, 90, 180, 270];

/// Errors from session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] VisionError),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("a camera grab is already in progress")]
    CaptureInProgress,

    #[error("no capture is waiting to be saved")]
    NoCapture,

    #[error(transparent)]
    Persistence(#[from] PipelineError),

    #[error("report save task failed: {0}")]
    Interrupted(String),
}

impl From<InvalidCalibration> for SessionError {
    fn from(err: InvalidCalibration) -> Self {
        SessionError::Validation(err.to_string())
    }
}

/// Interpreted calibration attempt. Neither variant changes session state.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Detected {
        pixels_per_cm: PixelsPerCm,
        debug_image: Option<EvidenceImage>,
    },
    Rejected {
        reason: String,
        debug_image: Option<EvidenceImage>,
    },
}

impl CalibrationOutcome {
    pub fn debug_image(&self) -> Option<&EvidenceImage> {
        match self {
            CalibrationOutcome::Detected { debug_image, .. }
            | CalibrationOutcome::Rejected { debug_image, .. } => debug_image.as_ref(),
        }
    }

    fn from_report(report: CalibrationReport) -> Self {
        let CalibrationReport {
            success,
            pixels_per_cm,
            message,
            debug_image,
        } = report;

        match (success, pixels_per_cm.map(PixelsPerCm::new)) {
            (true, Some(Ok(pixels_per_cm))) => CalibrationOutcome::Detected {
                pixels_per_cm,
                debug_image,
            },
            (true, Some(Err(invalid))) => CalibrationOutcome::Rejected {
                reason: message.unwrap_or_else(|| invalid.to_string()),
                debug_image,
            },
            (true, None) => CalibrationOutcome::Rejected {
                reason: message
                    .unwrap_or_else(|| "backend returned no pixels-per-cm value".to_string()),
                debug_image,
            },
            (false, _) => CalibrationOutcome::Rejected {
                reason: message.unwrap_or_else(|| "calibration target not detected".to_string()),
                debug_image,
            },
        }
    }
}

/// A measurement together with what it was measured with
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub result: CaptureResult,
    pub garment_type: String,
    pub pixels_per_cm: PixelsPerCm,
}

impl CaptureOutcome {
    /// FAIL is a reportable verdict, not an error
    pub fn is_qc_fail(&self) -> bool {
        self.result.qc_status == QcStatus::Fail
    }

    pub fn defect(&self) -> Option<QcDefect> {
        self.result.qc_defect()
    }
}

/// Fixed per-device session settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub tenant_id: String,
    pub default_garment_type: String,
    pub pixels_per_cm: PixelsPerCm,
}

pub struct CaptureSession {
    vision: Arc<dyn VisionBackend>,
    modes: DeviceModeController,
    pipeline: Arc<ReportPipeline>,
    settings: SessionSettings,
    calibration: RwLock<PixelsPerCm>,
    camera: tokio::sync::Mutex<()>,
    last_capture: Arc<Mutex<Option<CaptureOutcome>>>,
}

impl CaptureSession {
    pub fn new(
        vision: Arc<dyn VisionBackend>,
        modes: DeviceModeController,
        pipeline: Arc<ReportPipeline>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            vision,
            modes,
            pipeline,
            calibration: RwLock::new(settings.pixels_per_cm),
            settings,
            camera: tokio::sync::Mutex::new(()),
            last_capture: Arc::new(Mutex::new(None)),
        }
    }

    pub fn modes(&self) -> &DeviceModeController {
        &self.modes
    }

    pub fn tenant_id(&self) -> &str {
        &self.settings.tenant_id
    }

    /// Calibration constant in effect
    pub fn pixels_per_cm(&self) -> PixelsPerCm {
        *self.calibration.read()
    }

    /// Run a calibration attempt in CALIBRATION mode. Never changes the constant.
    #[instrument(skip(self))]
    pub async fn detect_calibration(
        &self,
        thresholds: CalibrationThresholds,
    ) -> Result<CalibrationOutcome, SessionError> {
        let _camera = self
            .camera
            .try_lock()
            .map_err(|_| SessionError::CaptureInProgress)?;

        let report = self
            .modes
            .with_mode(DeviceMode::Calibration, || self.vision.calibrate(thresholds))
            .await??;

        let outcome = CalibrationOutcome::from_report(report);
        match &outcome {
            CalibrationOutcome::Detected { pixels_per_cm, .. } => {
                info!(pixels_per_cm = pixels_per_cm.get(), "Calibration target detected")
            }
            CalibrationOutcome::Rejected { reason, .. } => {
                info!(reason = %reason, "Calibration attempt rejected")
            }
        }

        Ok(outcome)
    }

    /// Replace the calibration constant. Invalid values leave it untouched.
    #[instrument(skip(self))]
    pub fn apply_calibration(&self, value: f64) -> Result<PixelsPerCm, SessionError> {
        let pixels_per_cm = PixelsPerCm::new(value)?;

        let previous = std::mem::replace(&mut *self.calibration.write(), pixels_per_cm);
        info!(
            previous = previous.get(),
            pixels_per_cm = pixels_per_cm.get(),
            "Calibration applied"
        );

        Ok(pixels_per_cm)
    }

    /// Measure the garment in front of the camera in MEASURE mode.
    ///
    /// A second call while one is outstanding fails with
    /// [`SessionError::CaptureInProgress`] instead of grabbing again.
    #[instrument(skip(self))]
    pub async fn capture(&self, garment_type: Option<&str>) -> Result<CaptureOutcome, SessionError> {
        let _camera = self
            .camera
            .try_lock()
            .map_err(|_| SessionError::CaptureInProgress)?;

        let garment_type = garment_type
            .map(str::trim)
            .unwrap_or(self.settings.default_garment_type.as_str())
            .to_string();
        if garment_type.is_empty() {
            return Err(SessionError::Validation(
                "garment type must not be empty".to_string(),
            ));
        }

        let pixels_per_cm = self.pixels_per_cm();
        let result = self
            .modes
            .with_mode(DeviceMode::Measure, || {
                self.vision.capture(pixels_per_cm, &garment_type)
            })
            .await??;

        if let Some(defect) = result.qc_defect() {
            warn!(
                ?defect,
                qc_status = %result.qc_status,
                failures = result.qc_failures.len(),
                "Vision backend returned an inconsistent QC verdict"
            );
        }

        info!(
            garment_type = %garment_type,
            detected_size = %result.detected_size,
            qc_status = %result.qc_status,
            images = result.images.len(),
            "Capture complete"
        );

        let outcome = CaptureOutcome {
            result,
            garment_type,
            pixels_per_cm,
        };
        *self.last_capture.lock() = Some(outcome.clone());

        Ok(outcome)
    }

    /// Most recent capture not yet saved
    pub fn last_capture(&self) -> Option<CaptureOutcome> {
        self.last_capture.lock().clone()
    }

    /// Save the most recent capture as a report.
    ///
    /// The capture is consumed on success. If the save fails nothing was
    /// written, so the capture stays available for another attempt. The save
    /// runs on its own task: dropping this future does not abandon uploads
    /// that already started.
    #[instrument(skip(self))]
    pub async fn save_last_capture(
        &self,
        garment_ref: Option<String>,
    ) -> Result<SavedReport, SessionError> {
        let outcome = self
            .last_capture
            .lock()
            .take()
            .ok_or(SessionError::NoCapture)?;

        let context = ReportContext {
            tenant_id: self.settings.tenant_id.clone(),
            garment_type: outcome.garment_type.clone(),
            pixels_per_cm: outcome.pixels_per_cm,
            garment_ref,
        };

        let pipeline = self.pipeline.clone();
        let last_capture = self.last_capture.clone();
        let save = tokio::spawn(async move {
            match pipeline.save(&outcome.result, &context).await {
                Ok(saved) => {
                    if !saved.is_complete() {
                        warn!(
                            measurement_id = %saved.measurement_id,
                            warnings = saved.warnings.len(),
                            "Report saved with missing evidence"
                        );
                    }
                    Ok(saved)
                }
                Err(e) => {
                    let mut slot = last_capture.lock();
                    if slot.is_none() {
                        *slot = Some(outcome);
                    }
                    Err(e)
                }
            }
        });

        match save.await {
            Ok(result) => result.map_err(Into::into),
            Err(e) => Err(SessionError::Interrupted(e.to_string())),
        }
    }

    /// Set camera rotation; returns the rotation the backend reports
    #[instrument(skip(self))]
    pub async fn rotate_camera(&self, angle: u16) -> Result<u16, SessionError> {
        if !SUPPORTED_ROTATIONS.contains(&angle) {
            return Err(SessionError::Validation(format!(
                "rotation must be one of {:?} degrees, got {}",
                SUPPORTED_ROTATIONS, angle
            )));
        }

        let rotation = self.vision.rotate_camera(angle).await?;
        info!(rotation, "Camera rotated");
        Ok(rotation)
    }

    /// Apply the calibration the backend saved earlier, if it is valid.
    ///
    /// Returns the applied value, or `None` when there was nothing usable.
    #[instrument(skip(self))]
    pub async fn load_saved_calibration(&self) -> Result<Option<PixelsPerCm>, SessionError> {
        let Some(value) = self.vision.saved_calibration().await? else {
            info!("No saved calibration on the vision backend");
            return Ok(None);
        };

        match self.apply_calibration(value) {
            Ok(applied) => Ok(Some(applied)),
            Err(e) => {
                warn!(value, error = %e, "Ignoring saved calibration");
                Ok(None)
            }
        }
    }
}
