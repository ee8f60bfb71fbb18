use crate::model::ImageRole;
use serde::Deserialize;
use std::time::Duration;

/// S3-compatible object storage configuration (AWS, R2, MinIO)
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding evidence images
    pub bucket: String,
    /// Region (`auto` for R2)
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for R2, MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL for stored objects; references are bare keys without it
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Report pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum evidence uploads in flight for one report
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Evidence roles that are persisted with a report
    #[serde(default = "default_persisted_roles")]
    pub persisted_roles: Vec<ImageRole>,
    /// Top-level key prefix for evidence objects
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

// Default value functions
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_upload_concurrency() -> usize {
    ImageRole::ALL.len()
}

fn default_persisted_roles() -> Vec<ImageRole> {
    ImageRole::ALL.to_vec()
}

fn default_key_prefix() -> String {
    "garment".to_string()
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: default_upload_concurrency(),
            persisted_roles: default_persisted_roles(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_multipart_threshold(), 5 * 1024 * 1024);
        assert_eq!(default_key_prefix(), "garment");

        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.upload_concurrency, 4);
        assert_eq!(pipeline.persisted_roles.len(), 4);
    }

    #[test]
    fn test_pipeline_roles_deserialize() {
        let pipeline: PipelineConfig =
            serde_json::from_str(r#"{ "persisted_roles": ["MEASURE", "DETECT"] }"#).unwrap();

        assert_eq!(
            pipeline.persisted_roles,
            vec![ImageRole::Measure, ImageRole::Detect]
        );
        assert_eq!(pipeline.key_prefix, "garment");
    }
}
