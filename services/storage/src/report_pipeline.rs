//! QC report persistence.
//!
//! A report is saved in three ordered phases:
//!
//! ```text
//! insert record ──▶ upload evidence (concurrent, joined) ──▶ link uploaded images
//!   (fatal)              (per-image, best effort)               (per-image, best effort)
//! ```
//!
//! Only the insert decides success. Once the record exists its ID is always
//! returned; missing evidence shows up as [`PersistenceWarning`]s.

use crate::config::PipelineConfig;
use crate::model::{CaptureResult, ImageAsset, ImageRole, NewMeasurement, PixelsPerCm};
use crate::record_store::{ReportStore, StoreError};
use crate::s3_uploader::{evidence_key, AssetUploader};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that abort a save. Nothing is written when one is returned.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid report: {0}")]
    Validation(String),

    #[error("failed to insert measurement record: {0}")]
    Insert(#[source] StoreError),
}

/// Non-fatal gap in a saved report's evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceWarning {
    UploadFailed {
        role: ImageRole,
        path: String,
        reason: String,
    },
    LinkFailed {
        role: ImageRole,
        reference: String,
        reason: String,
    },
}

/// Who and what a capture is being saved for
#[derive(Debug, Clone)]
pub struct ReportContext {
    /// Factory identifier
    pub tenant_id: String,
    pub garment_type: String,
    /// Calibration the capture was measured with
    pub pixels_per_cm: PixelsPerCm,
    /// Optional external garment reference (PO, batch, ticket)
    pub garment_ref: Option<String>,
}

/// Outcome of a save
#[derive(Debug, Clone, Serialize)]
pub struct SavedReport {
    pub measurement_id: Uuid,
    /// Images that were uploaded and linked
    pub images: Vec<ImageAsset>,
    pub warnings: Vec<PersistenceWarning>,
}

impl SavedReport {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

struct UploadJob {
    role: ImageRole,
    path: String,
    content_type: String,
    data: Vec<u8>,
}

/// Saves captures as durable reports
pub struct ReportPipeline {
    uploader: Arc<dyn AssetUploader>,
    reports: Arc<dyn ReportStore>,
    config: PipelineConfig,
}

impl ReportPipeline {
    pub fn new(
        uploader: Arc<dyn AssetUploader>,
        reports: Arc<dyn ReportStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            uploader,
            reports,
            config,
        }
    }

    /// Persist a capture.
    ///
    /// Fails only on validation or record insert; in both cases no upload is
    /// attempted.
    #[instrument(skip(self, capture, context), fields(tenant_id = %context.tenant_id, garment_type = %context.garment_type))]
    pub async fn save(
        &self,
        capture: &CaptureResult,
        context: &ReportContext,
    ) -> Result<SavedReport, PipelineError> {
        let record = build_record(capture, context)?;

        let measurement_id = self
            .reports
            .insert_measurement(&record)
            .await
            .map_err(PipelineError::Insert)?;

        info!(measurement_id = %measurement_id, qc_status = %record.qc_status, "Measurement record saved");
        metrics::counter!("qc.reports.saved").increment(1);

        let jobs = self.upload_jobs(capture, &context.tenant_id, measurement_id);
        let mut warnings = Vec::new();

        let uploaded = self.upload_all(jobs, &mut warnings).await;

        let mut images = Vec::with_capacity(uploaded.len());
        for (role, reference) in uploaded {
            match self
                .reports
                .link_image(measurement_id, role, &reference)
                .await
            {
                Ok(()) => images.push(ImageAsset {
                    measurement_id,
                    role,
                    reference,
                }),
                Err(e) => {
                    warn!(
                        measurement_id = %measurement_id,
                        role = %role,
                        error = %e,
                        "Failed to link evidence image"
                    );
                    metrics::counter!("qc.images.link_failed").increment(1);
                    warnings.push(PersistenceWarning::LinkFailed {
                        role,
                        reference,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(
            measurement_id = %measurement_id,
            linked = images.len(),
            warnings = warnings.len(),
            "Report save finished"
        );

        Ok(SavedReport {
            measurement_id,
            images,
            warnings,
        })
    }

    fn upload_jobs(
        &self,
        capture: &CaptureResult,
        tenant_id: &str,
        measurement_id: Uuid,
    ) -> Vec<UploadJob> {
        let mut jobs: Vec<UploadJob> = Vec::new();

        for image in &capture.images {
            if !self.config.persisted_roles.contains(&image.role) {
                continue;
            }
            if jobs.iter().any(|job| job.role == image.role) {
                warn!(role = %image.role, "Duplicate evidence role in capture, keeping the first");
                continue;
            }

            jobs.push(UploadJob {
                role: image.role,
                path: evidence_key(
                    &self.config.key_prefix,
                    tenant_id,
                    measurement_id,
                    image.role,
                ),
                content_type: image.content_type.clone(),
                data: image.data.clone(),
            });
        }

        jobs
    }

    /// Upload every job and wait for all of them to settle.
    ///
    /// Returns `(role, reference)` for successes, in role order.
    async fn upload_all(
        &self,
        jobs: Vec<UploadJob>,
        warnings: &mut Vec<PersistenceWarning>,
    ) -> Vec<(ImageRole, String)> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let uploader = self.uploader.clone();
        let concurrency = self.config.upload_concurrency.max(1);

        let results: Vec<_> = stream::iter(jobs)
            .map(move |job| {
                let uploader = uploader.clone();
                async move {
                    let result = uploader.put(job.data, &job.content_type, &job.path).await;
                    (job.role, job.path, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut uploaded = Vec::with_capacity(results.len());
        for (role, path, result) in results {
            match result {
                Ok(reference) => {
                    metrics::counter!("qc.images.uploaded").increment(1);
                    uploaded.push((role, reference));
                }
                Err(e) => {
                    warn!(role = %role, path = %path, error = %e, "Evidence upload failed");
                    metrics::counter!("qc.images.upload_failed").increment(1);
                    warnings.push(PersistenceWarning::UploadFailed {
                        role,
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        uploaded.sort_by_key(|(role, _)| *role);
        uploaded
    }
}

fn build_record(
    capture: &CaptureResult,
    context: &ReportContext,
) -> Result<NewMeasurement, PipelineError> {
    if context.tenant_id.trim().is_empty() {
        return Err(PipelineError::Validation("tenant id is required".to_string()));
    }
    if context.garment_type.trim().is_empty() {
        return Err(PipelineError::Validation(
            "garment type is required".to_string(),
        ));
    }

    let garment_ref = context
        .garment_ref
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(String::from);

    Ok(NewMeasurement {
        tenant_id: context.tenant_id.clone(),
        garment_ref,
        garment_type: context.garment_type.clone(),
        detected_size: capture.detected_size.clone(),
        confidence: capture.confidence,
        pixels_per_cm: context.pixels_per_cm,
        qc_status: capture.qc_status,
        qc_failures: capture.qc_failures.clone(),
        measurements: capture.measurements.clone(),
    })
}
