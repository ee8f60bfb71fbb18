use crate::config::S3Config;
use crate::model::ImageRole;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors from the object store
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("object key must not be empty")]
    EmptyKey,

    #[error("upload of {key} failed: {message}")]
    Request { key: String, message: String },
}

impl UploadError {
    fn request(key: &str, err: impl std::fmt::Display) -> Self {
        UploadError::Request {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// Durable object storage for evidence images.
///
/// `put` must overwrite when called twice with the same path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetUploader: Send + Sync {
    /// Store `data` at `path` and return a stable reference to it
    async fn put(&self, data: Vec<u8>, content_type: &str, path: &str)
        -> Result<String, UploadError>;
}

/// S3 (or S3-compatible) evidence uploader
pub struct S3Uploader {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Uploader {
    /// Create a new S3 uploader
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for R2/MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 uploader initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Reference handed back to callers for a stored key
    pub fn reference_for(&self, key: &str) -> String {
        public_reference(self.config.public_base_url.as_deref(), key)
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        key: &str,
    ) -> Result<(), UploadError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| UploadError::request(key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    /// Multipart upload for large objects; the upload is aborted if any part fails
    async fn multipart_upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        key: &str,
    ) -> Result<(), UploadError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| UploadError::request(key, DisplayErrorContext(&e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| UploadError::request(key, "no upload id in response"))?
            .to_string();

        let result = self.upload_parts(&data, key, &upload_id).await;

        if result.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(
                    key = %key,
                    error = %DisplayErrorContext(&e),
                    "Failed to abort multipart upload"
                );
            }
        }

        result
    }

    async fn upload_parts(&self, data: &[u8], key: &str, upload_id: &str) -> Result<(), UploadError> {
        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);

        for (index, chunk) in data.chunks(part_size).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| UploadError::request(key, DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(upload_part_response.e_tag().map(String::from))
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| UploadError::request(key, DisplayErrorContext(&e)))?;

        Ok(())
    }
}

#[async_trait]
impl AssetUploader for S3Uploader {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        data: Vec<u8>,
        content_type: &str,
        path: &str,
    ) -> Result<String, UploadError> {
        if path.is_empty() {
            return Err(UploadError::EmptyKey);
        }

        let size_bytes = data.len();
        debug!(key = %path, size_bytes, "Uploading object to S3");

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(data, content_type, path).await?;
        } else {
            self.simple_upload(data, content_type, path).await?;
        }

        info!(key = %path, size_bytes, "Object uploaded");

        Ok(self.reference_for(path))
    }
}

/// Suffix of every evidence object key
const EVIDENCE_EXTENSION: &str = "png";

/// Object key for one evidence image.
///
/// Format: `{prefix}/{tenant}/{tenant}_{measurement_id}_{ROLE}.png`. The key
/// depends only on tenant, record and role, so saving the same record/role
/// twice overwrites whatever content type was sent. The real type travels in
/// the `Content-Type` of the put.
pub fn evidence_key(
    prefix: &str,
    tenant_id: &str,
    measurement_id: Uuid,
    role: ImageRole,
) -> String {
    let tenant = sanitize_path_component(tenant_id);
    let prefix = prefix.trim_matches('/');

    let file_name = format!(
        "{tenant}_{measurement_id}_{role}.{EVIDENCE_EXTENSION}",
        role = role.as_str(),
    );

    if prefix.is_empty() {
        format!("{tenant}/{file_name}")
    } else {
        format!("{prefix}/{tenant}/{file_name}")
    }
}

fn public_reference(public_base_url: Option<&str>, key: &str) -> String {
    match public_base_url.map(|base| base.trim_end_matches('/')) {
        Some(base) if !base.is_empty() => format!("{}/{}", base, key),
        _ => key.to_string(),
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_key_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = evidence_key("garment", "factory-01", id, ImageRole::Measure);

        assert_eq!(
            key,
            "garment/factory-01/factory-01_550e8400-e29b-41d4-a716-446655440000_MEASURE.png"
        );
    }

    #[test]
    fn test_evidence_key_is_deterministic_per_role() {
        let id = Uuid::new_v4();
        let a = evidence_key("garment", "f1", id, ImageRole::Detect);
        let b = evidence_key("garment", "f1", id, ImageRole::Detect);
        let c = evidence_key("garment", "f1", id, ImageRole::Edge);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_evidence_key_sanitizes_tenant() {
        let id = Uuid::new_v4();
        let key = evidence_key("/garment/", "../Acme Ltd", id, ImageRole::Debug);

        assert!(key.starts_with("garment/___Acme_Ltd/___Acme_Ltd_"));
        assert!(!key.contains(".."));
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("factory-001"), "factory-001");
        assert_eq!(sanitize_path_component("plant/line"), "plant_line");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }

    #[test]
    fn test_public_reference() {
        assert_eq!(
            public_reference(Some("https://cdn.example.com/"), "garment/a.png"),
            "https://cdn.example.com/garment/a.png"
        );
        assert_eq!(public_reference(Some(""), "garment/a.png"), "garment/a.png");
        assert_eq!(public_reference(None, "garment/a.png"), "garment/a.png");
    }
}
