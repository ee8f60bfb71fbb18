//! Domain types shared by the capture session and the persistence pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Rejected calibration value
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("calibration constant must be a finite positive number, got {0}")]
pub struct InvalidCalibration(pub f64);

/// Pixels-per-centimeter scale factor.
///
/// Always finite and strictly positive; the only way to build one is through
/// [`PixelsPerCm::new`] or `TryFrom<f64>`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct PixelsPerCm(f64);

impl PixelsPerCm {
    pub fn new(value: f64) -> Result<Self, InvalidCalibration> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(InvalidCalibration(value))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for PixelsPerCm {
    type Error = InvalidCalibration;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PixelsPerCm> for f64 {
    fn from(value: PixelsPerCm) -> Self {
        value.0
    }
}

impl fmt::Display for PixelsPerCm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} px/cm", self.0)
    }
}

/// Role an evidence image plays in a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageRole {
    /// Annotated measurement overlay
    Measure,
    /// Garment detection overlay
    Detect,
    /// Edge map
    Edge,
    /// Backend debug output
    Debug,
}

impl ImageRole {
    pub const ALL: [ImageRole; 4] = [
        ImageRole::Measure,
        ImageRole::Detect,
        ImageRole::Edge,
        ImageRole::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageRole::Measure => "MEASURE",
            ImageRole::Detect => "DETECT",
            ImageRole::Edge => "EDGE",
            ImageRole::Debug => "DEBUG",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// QC verdict for a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QcStatus {
    Pass,
    Fail,
    #[default]
    Unknown,
}

impl QcStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QcStatus::Pass => "PASS",
            QcStatus::Fail => "FAIL",
            QcStatus::Unknown => "UNKNOWN",
        }
    }

    /// Anything that is not PASS or FAIL is UNKNOWN
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PASS" => QcStatus::Pass,
            "FAIL" => QcStatus::Fail,
            _ => QcStatus::Unknown,
        }
    }
}

impl fmt::Display for QcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_unit() -> String {
    "cm".to_string()
}

/// Binary evidence image produced by the vision backend
#[derive(Clone, PartialEq)]
pub struct EvidenceImage {
    pub role: ImageRole,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for EvidenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceImage")
            .field("role", &self.role)
            .field("content_type", &self.content_type)
            .field("size_bytes", &self.data.len())
            .finish()
    }
}

/// Inconsistency between a QC status and its failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcDefect {
    /// FAIL reported with no reasons
    FailWithoutReasons,
    /// Reasons reported for a capture that did not FAIL
    ReasonsWithoutFail,
}

/// Result of one measurement request
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    pub images: Vec<EvidenceImage>,
    pub detected_size: String,
    pub confidence: f64,
    pub qc_status: QcStatus,
    pub qc_failures: Vec<String>,
    pub measurements: Vec<Measurement>,
}

impl CaptureResult {
    pub fn image(&self, role: ImageRole) -> Option<&EvidenceImage> {
        self.images.iter().find(|image| image.role == role)
    }

    /// Flags a status/reasons mismatch instead of silently accepting it
    pub fn qc_defect(&self) -> Option<QcDefect> {
        match (self.qc_status, self.qc_failures.is_empty()) {
            (QcStatus::Fail, true) => Some(QcDefect::FailWithoutReasons),
            (QcStatus::Pass | QcStatus::Unknown, false) => Some(QcDefect::ReasonsWithoutFail),
            _ => None,
        }
    }
}

/// Insert payload for a measurement record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMeasurement {
    pub tenant_id: String,
    pub garment_ref: Option<String>,
    pub garment_type: String,
    pub detected_size: String,
    pub confidence: f64,
    pub pixels_per_cm: PixelsPerCm,
    pub qc_status: QcStatus,
    pub qc_failures: Vec<String>,
    pub measurements: Vec<Measurement>,
}

/// Durable QC report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub garment_ref: Option<String>,
    pub garment_type: String,
    pub detected_size: String,
    pub confidence: f64,
    pub pixels_per_cm: f64,
    pub qc_status: QcStatus,
    pub qc_failures: Vec<String>,
    pub measurements: Vec<Measurement>,
    pub measured_at: DateTime<Utc>,
}

/// Evidence image linked to a measurement record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub measurement_id: Uuid,
    pub role: ImageRole,
    pub reference: String,
}

/// Aggregate over a page of reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcSummary {
    pub total: usize,
    pub passed: usize,
    /// Rounded to a whole percent, 0 when there are no reports
    pub pass_rate_percent: u32,
}

impl QcSummary {
    pub fn from_records(records: &[MeasurementRecord]) -> Self {
        let total = records.len();
        let passed = records
            .iter()
            .filter(|r| r.qc_status == QcStatus::Pass)
            .count();
        let pass_rate_percent = if total == 0 {
            0
        } else {
            (passed as f64 / total as f64 * 100.0).round() as u32
        };

        Self {
            total,
            passed,
            pass_rate_percent,
        }
    }
}

/// One point-of-measure row for one size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointOfMeasure {
    pub code: String,
    pub description: String,
    /// Free text; numeric interpretation happens at QC comparison time
    pub tol_minus: String,
    pub tol_plus: String,
    /// Nominal value for this size, empty when the sheet had no value
    pub value: String,
}

/// All points of measure for one size label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeColumn {
    pub size: String,
    pub points: Vec<PointOfMeasure>,
}

/// Per-size tolerance table keyed by (garment type, style code)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeStandard {
    pub garment_type: String,
    pub style_code: String,
    pub unit: String,
    /// Sizes in sheet column order
    pub sizes: Vec<SizeColumn>,
}

impl SizeStandard {
    pub fn size(&self, label: &str) -> Option<&[PointOfMeasure]> {
        self.sizes
            .iter()
            .find(|column| column.size == label)
            .map(|column| column.points.as_slice())
    }

    pub fn size_labels(&self) -> impl Iterator<Item = &str> {
        self.sizes.iter().map(|column| column.size.as_str())
    }
}
