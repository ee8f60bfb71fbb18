//! QC Storage
//!
//! Report persistence and size-standard ingestion for the garment QC kiosk.
//! A saved report is a measurement record in PostgreSQL plus its evidence
//! images in S3-compatible object storage.
//!
//! ## Report flow
//!
//! ```text
//! CaptureResult ──▶ insert record ──▶ upload evidence (concurrent) ──▶ link images
//!                    │ fails: nothing written    │ fails: warning      │ fails: warning
//!                    ▼                           ▼                     ▼
//!                 PipelineError               SavedReport.warnings  SavedReport.warnings
//! ```
//!
//! The record insert is the only step that can fail a save. Evidence upload and
//! linkage are best-effort and reported back as [`PersistenceWarning`]s.
//!
//! ## Standards flow
//!
//! ```text
//! CSV sheet ──▶ StandardTable (typed rows) ──▶ include filter + size pivot ──▶ upsert
//! ```

pub mod config;
pub mod model;
pub mod record_store;
pub mod report_pipeline;
pub mod s3_uploader;
pub mod standards_ingest;

pub use config::{DatabaseConfig, PipelineConfig, S3Config};
pub use model::{
    CaptureResult, EvidenceImage, ImageAsset, ImageRole, InvalidCalibration, Measurement,
    MeasurementRecord, NewMeasurement, PixelsPerCm, PointOfMeasure, QcDefect, QcStatus,
    QcSummary, SizeColumn, SizeStandard,
};
pub use record_store::{MeasurementQuery, PgRecordStore, ReportStore, StandardsStore, StoreError};
pub use report_pipeline::{
    PersistenceWarning, PipelineError, ReportContext, ReportPipeline, SavedReport,
};
pub use s3_uploader::{evidence_key, AssetUploader, S3Uploader, UploadError};
pub use standards_ingest::{
    style_code_from_file_name, IngestError, StandardTable, StandardsIngestor,
};
