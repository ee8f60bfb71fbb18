//! In-memory collaborators for unit tests.

use crate::vision_client::{
    CalibrationReport, CalibrationThresholds, DeviceMode, VisionBackend, VisionError,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use qc_storage::{
    AssetUploader, CaptureResult, EvidenceImage, ImageAsset, ImageRole, MeasurementQuery,
    MeasurementRecord, NewMeasurement, PixelsPerCm, QcStatus, ReportStore, SizeStandard,
    StandardsStore, StoreError, UploadError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Vision backend with canned responses that records mode requests
pub(crate) struct FakeVision {
    pub modes: Mutex<Vec<DeviceMode>>,
    pub calibration: Mutex<Option<Result<CalibrationReport, VisionError>>>,
    pub capture: Mutex<Option<CaptureResult>>,
    pub captures: AtomicUsize,
    pub rotations: AtomicUsize,
    pub saved: Option<f64>,
    /// Signalled when a capture reaches the backend
    pub started: Notify,
    /// When set, captures wait for it before answering
    pub gate: Option<Notify>,
}

impl FakeVision {
    pub fn new() -> Self {
        Self {
            modes: Mutex::new(Vec::new()),
            calibration: Mutex::new(None),
            capture: Mutex::new(None),
            captures: AtomicUsize::new(0),
            rotations: AtomicUsize::new(0),
            saved: None,
            started: Notify::new(),
            gate: None,
        }
    }

    pub fn with_calibration(self, report: Result<CalibrationReport, VisionError>) -> Self {
        *self.calibration.lock() = Some(report);
        self
    }

    pub fn with_capture(self, result: CaptureResult) -> Self {
        *self.capture.lock() = Some(result);
        self
    }

    pub fn with_saved(mut self, pixels_per_cm: f64) -> Self {
        self.saved = Some(pixels_per_cm);
        self
    }

    pub fn with_gate(mut self) -> Self {
        self.gate = Some(Notify::new());
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl VisionBackend for FakeVision {
    async fn set_mode(&self, mode: DeviceMode) -> Result<(), VisionError> {
        self.modes.lock().push(mode);
        Ok(())
    }

    async fn calibrate(
        &self,
        _thresholds: CalibrationThresholds,
    ) -> Result<CalibrationReport, VisionError> {
        self.calibration
            .lock()
            .take()
            .unwrap_or(Err(VisionError::Timeout))
    }

    async fn capture(
        &self,
        _pixels_per_cm: PixelsPerCm,
        _garment_type: &str,
    ) -> Result<CaptureResult, VisionError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let result = self.capture.lock().clone();
        result.ok_or(VisionError::Timeout)
    }

    async fn rotate_camera(&self, angle: u16) -> Result<u16, VisionError> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(angle)
    }

    async fn saved_calibration(&self) -> Result<Option<f64>, VisionError> {
        Ok(self.saved)
    }
}

/// Uploader that always succeeds
pub(crate) struct FakeUploader;

#[async_trait]
impl AssetUploader for FakeUploader {
    async fn put(
        &self,
        _data: Vec<u8>,
        _content_type: &str,
        path: &str,
    ) -> Result<String, UploadError> {
        Ok(format!("https://cdn.test/{}", path))
    }
}

/// Uploader that takes `delay` per object and counts finished puts
pub(crate) struct SlowUploader {
    pub delay: Duration,
    pub completed: AtomicUsize,
}

impl SlowUploader {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AssetUploader for SlowUploader {
    async fn put(
        &self,
        _data: Vec<u8>,
        _content_type: &str,
        path: &str,
    ) -> Result<String, UploadError> {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://cdn.test/{}", path))
    }
}

/// Report and standards store kept in memory
#[derive(Default)]
pub(crate) struct MemoryStore {
    pub fail_inserts: bool,
    pub inserted: Mutex<Vec<NewMeasurement>>,
    pub records: Mutex<Vec<MeasurementRecord>>,
    pub links: Mutex<Vec<ImageAsset>>,
    pub standards: Mutex<HashMap<(String, String), SizeStandard>>,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            fail_inserts: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn insert_measurement(&self, record: &NewMeasurement) -> Result<Uuid, StoreError> {
        if self.fail_inserts {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }

        let id = Uuid::new_v4();
        self.inserted.lock().push(record.clone());
        self.records.lock().push(MeasurementRecord {
            id,
            tenant_id: record.tenant_id.clone(),
            garment_ref: record.garment_ref.clone(),
            garment_type: record.garment_type.clone(),
            detected_size: record.detected_size.clone(),
            confidence: record.confidence,
            pixels_per_cm: record.pixels_per_cm.get(),
            qc_status: record.qc_status,
            qc_failures: record.qc_failures.clone(),
            measurements: record.measurements.clone(),
            measured_at: Utc::now(),
        });
        Ok(id)
    }

    async fn link_image(
        &self,
        measurement_id: Uuid,
        role: ImageRole,
        reference: &str,
    ) -> Result<(), StoreError> {
        let mut links = self.links.lock();
        links.retain(|l| !(l.measurement_id == measurement_id && l.role == role));
        links.push(ImageAsset {
            measurement_id,
            role,
            reference: reference.to_string(),
        });
        Ok(())
    }

    async fn list_measurements(
        &self,
        query: &MeasurementQuery,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .iter()
            .filter(|r| query.tenant_id.as_ref().map_or(true, |t| &r.tenant_id == t))
            .cloned()
            .collect();

        records.sort_by_key(|r| r.measured_at);
        if !query.ascending {
            records.reverse();
        }
        records.truncate(query.limit.max(0) as usize);
        Ok(records)
    }

    async fn measurement_images(&self, measurement_id: Uuid) -> Result<Vec<ImageAsset>, StoreError> {
        Ok(self
            .links
            .lock()
            .iter()
            .filter(|l| l.measurement_id == measurement_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StandardsStore for MemoryStore {
    async fn upsert_standard(&self, standard: &SizeStandard) -> Result<(), StoreError> {
        self.standards.lock().insert(
            (standard.garment_type.clone(), standard.style_code.clone()),
            standard.clone(),
        );
        Ok(())
    }

    async fn fetch_standard(
        &self,
        garment_type: &str,
        style_code: &str,
    ) -> Result<Option<SizeStandard>, StoreError> {
        Ok(self
            .standards
            .lock()
            .get(&(garment_type.to_string(), style_code.to_string()))
            .cloned())
    }
}

/// A PASS capture with one MEASURE image
pub(crate) fn passing_capture() -> CaptureResult {
    CaptureResult {
        images: vec![EvidenceImage {
            role: ImageRole::Measure,
            content_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        }],
        detected_size: "M".to_string(),
        confidence: 0.9,
        qc_status: QcStatus::Pass,
        ..Default::default()
    }
}
