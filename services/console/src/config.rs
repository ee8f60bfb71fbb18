use qc_storage::{DatabaseConfig, PipelineConfig, S3Config};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the console service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Vision backend configuration
    pub vision: VisionConfig,
    /// Capture session configuration
    pub session: SessionConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Report pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Vision backend connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// Base URL, e.g. `http://kiosk.local:8000`
    pub base_url: String,
    /// Whole-request timeout; a capture includes the camera grab
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Capture session settings
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Factory identifier stamped on every report
    pub tenant_id: String,
    /// Garment type declared to the backend when a capture names none
    #[serde(default = "default_garment_type")]
    pub garment_type: String,
    /// Calibration used until one is applied
    #[serde(default = "default_pixels_per_cm")]
    pub default_pixels_per_cm: f64,
    /// Reset camera rotation to 0 on startup
    #[serde(default = "default_true")]
    pub reset_rotation_on_start: bool,
    /// Apply the backend's saved calibration on startup
    #[serde(default = "default_true")]
    pub load_saved_calibration: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = allow all)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted standards sheet
    #[serde(default = "default_max_standard_bytes")]
    pub max_standard_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "qc-console".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_garment_type() -> String {
    "tshirt".to_string()
}

fn default_pixels_per_cm() -> f64 {
    8.8
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_standard_bytes() -> usize {
    1024 * 1024 // 1MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.log_format", default_log_format())?
            .set_default("service.metrics_port", i64::from(default_metrics_port()))?
            .set_default("api.host", default_api_host())?
            .set_default("api.port", i64::from(default_api_port()))?
            // Add config file if present
            .add_source(config::File::with_name("config/console").required(false))
            .add_source(config::File::with_name("/etc/qc/console").required(false))
            // Override with environment variables
            // QC_CONSOLE__VISION__BASE_URL -> vision.base_url
            .add_source(
                config::Environment::with_prefix("QC_CONSOLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl VisionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_standard_bytes: default_max_standard_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_pixels_per_cm(), 8.8);
        assert_eq!(default_request_timeout_secs(), 30);
        assert_eq!(default_max_standard_bytes(), 1024 * 1024);

        let service = ServiceConfig::default();
        assert_eq!(service.name, "qc-console");
        assert_eq!(service.log_format, "json");
    }

    #[test]
    fn test_session_config_defaults() {
        let session: SessionConfig =
            serde_json::from_str(r#"{ "tenant_id": "factory-01" }"#).unwrap();

        assert_eq!(session.tenant_id, "factory-01");
        assert_eq!(session.default_pixels_per_cm, 8.8);
        assert!(session.reset_rotation_on_start);
        assert!(session.load_saved_calibration);
    }

    #[test]
    fn test_vision_timeouts() {
        let vision: VisionConfig =
            serde_json::from_str(r#"{ "base_url": "http://localhost:8000" }"#).unwrap();

        assert_eq!(vision.request_timeout(), Duration::from_secs(30));
        assert_eq!(vision.connect_timeout(), Duration::from_secs(5));
    }
}
