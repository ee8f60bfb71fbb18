use crate::config::DatabaseConfig;
use crate::model::{
    ImageAsset, ImageRole, Measurement, MeasurementRecord, NewMeasurement, QcStatus, SizeColumn,
    SizeStandard,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors from the record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Query parameters for report history
#[derive(Debug, Clone)]
pub struct MeasurementQuery {
    /// Filter by tenant (factory) ID
    pub tenant_id: Option<String>,
    /// Maximum number of results
    pub limit: i64,
    /// Order by measurement time (true = oldest first)
    pub ascending: bool,
}

impl Default for MeasurementQuery {
    fn default() -> Self {
        Self {
            tenant_id: None,
            limit: 100,
            ascending: false,
        }
    }
}

/// Measurement records and their evidence links
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Insert a record and return its generated ID
    async fn insert_measurement(&self, record: &NewMeasurement) -> Result<Uuid, StoreError>;

    /// Associate one stored image with a record; relinking a role replaces it
    async fn link_image(
        &self,
        measurement_id: Uuid,
        role: ImageRole,
        reference: &str,
    ) -> Result<(), StoreError>;

    async fn list_measurements(
        &self,
        query: &MeasurementQuery,
    ) -> Result<Vec<MeasurementRecord>, StoreError>;

    async fn measurement_images(&self, measurement_id: Uuid) -> Result<Vec<ImageAsset>, StoreError>;
}

/// Size standards keyed by (garment type, style code)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StandardsStore: Send + Sync {
    /// Insert or fully replace the standard for its key
    async fn upsert_standard(&self, standard: &SizeStandard) -> Result<(), StoreError>;

    async fn fetch_standard(
        &self,
        garment_type: &str,
        style_code: &str,
    ) -> Result<Option<SizeStandard>, StoreError>;
}

#[derive(Debug, FromRow)]
struct MeasurementRow {
    id: Uuid,
    tenant_id: String,
    garment_ref: Option<String>,
    garment_type: String,
    detected_size: String,
    confidence: f64,
    pixels_per_cm: f64,
    qc_status: String,
    qc_failures: Json<Vec<String>>,
    measurement_data: Json<Vec<Measurement>>,
    measured_at: DateTime<Utc>,
}

impl From<MeasurementRow> for MeasurementRecord {
    fn from(row: MeasurementRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            garment_ref: row.garment_ref,
            garment_type: row.garment_type,
            detected_size: row.detected_size,
            confidence: row.confidence,
            pixels_per_cm: row.pixels_per_cm,
            qc_status: QcStatus::parse(&row.qc_status),
            qc_failures: row.qc_failures.0,
            measurements: row.measurement_data.0,
            measured_at: row.measured_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ImageRow {
    measurement_id: Uuid,
    image_type: String,
    storage_url: String,
}

#[derive(Debug, FromRow)]
struct StandardRow {
    garment_type: String,
    style_code: String,
    unit: String,
    sizes: Json<Vec<SizeColumn>>,
}

/// PostgreSQL-backed report and standards store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReportStore for PgRecordStore {
    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, garment_type = %record.garment_type))]
    async fn insert_measurement(&self, record: &NewMeasurement) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO measurements (
                id, tenant_id, garment_ref, garment_type, detected_size,
                confidence, pixels_per_cm, qc_status, qc_failures,
                measurement_data, measured_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9,
                $10, NOW()
            )
            "#,
        )
        .bind(id)
        .bind(&record.tenant_id)
        .bind(&record.garment_ref)
        .bind(&record.garment_type)
        .bind(&record.detected_size)
        .bind(record.confidence)
        .bind(record.pixels_per_cm.get())
        .bind(record.qc_status.as_str())
        .bind(Json(&record.qc_failures))
        .bind(Json(&record.measurements))
        .execute(&self.pool)
        .await?;

        debug!(measurement_id = %id, "Measurement record inserted");

        Ok(id)
    }

    #[instrument(skip(self))]
    async fn link_image(
        &self,
        measurement_id: Uuid,
        role: ImageRole,
        reference: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO measurement_images (measurement_id, image_type, storage_url, linked_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (measurement_id, image_type)
            DO UPDATE SET storage_url = EXCLUDED.storage_url, linked_at = NOW()
            "#,
        )
        .bind(measurement_id)
        .bind(role.as_str())
        .bind(reference)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_measurements(
        &self,
        query: &MeasurementQuery,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        let mut sql = String::from(
            r#"
            SELECT id, tenant_id, garment_ref, garment_type, detected_size,
                   confidence, pixels_per_cm, qc_status, qc_failures,
                   measurement_data, measured_at
            FROM measurements
            WHERE 1=1
            "#,
        );

        let mut param_count = 0;

        if query.tenant_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND tenant_id = ${}", param_count));
        }

        if query.ascending {
            sql.push_str(" ORDER BY measured_at ASC");
        } else {
            sql.push_str(" ORDER BY measured_at DESC");
        }

        param_count += 1;
        sql.push_str(&format!(" LIMIT ${}", param_count));

        let mut query_builder = sqlx::query_as::<_, MeasurementRow>(&sql);

        if let Some(ref tenant_id) = query.tenant_id {
            query_builder = query_builder.bind(tenant_id);
        }
        query_builder = query_builder.bind(query.limit.max(0));

        let rows = query_builder.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(MeasurementRecord::from).collect())
    }

    async fn measurement_images(&self, measurement_id: Uuid) -> Result<Vec<ImageAsset>, StoreError> {
        let rows = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT measurement_id, image_type, storage_url
            FROM measurement_images
            WHERE measurement_id = $1
            ORDER BY image_type
            "#,
        )
        .bind(measurement_id)
        .fetch_all(&self.pool)
        .await?;

        let images = rows
            .into_iter()
            .filter_map(|row| match ImageRole::parse(&row.image_type) {
                Some(role) => Some(ImageAsset {
                    measurement_id: row.measurement_id,
                    role,
                    reference: row.storage_url,
                }),
                None => {
                    warn!(image_type = %row.image_type, "Skipping image with unknown role");
                    None
                }
            })
            .collect();

        Ok(images)
    }
}

#[async_trait]
impl StandardsStore for PgRecordStore {
    #[instrument(skip(self, standard), fields(garment_type = %standard.garment_type, style_code = %standard.style_code))]
    async fn upsert_standard(&self, standard: &SizeStandard) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO garment_standards (garment_type, style_code, unit, sizes, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (garment_type, style_code)
            DO UPDATE SET unit = EXCLUDED.unit, sizes = EXCLUDED.sizes, updated_at = NOW()
            "#,
        )
        .bind(&standard.garment_type)
        .bind(&standard.style_code)
        .bind(&standard.unit)
        .bind(Json(&standard.sizes))
        .execute(&self.pool)
        .await?;

        debug!(sizes = standard.sizes.len(), "Size standard upserted");

        Ok(())
    }

    async fn fetch_standard(
        &self,
        garment_type: &str,
        style_code: &str,
    ) -> Result<Option<SizeStandard>, StoreError> {
        let row = sqlx::query_as::<_, StandardRow>(
            r#"
            SELECT garment_type, style_code, unit, sizes
            FROM garment_standards
            WHERE garment_type = $1 AND style_code = $2
            "#,
        )
        .bind(garment_type)
        .bind(style_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SizeStandard {
            garment_type: row.garment_type,
            style_code: row.style_code,
            unit: row.unit,
            sizes: row.sizes.0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_query_defaults() {
        let query = MeasurementQuery::default();

        assert_eq!(query.limit, 100);
        assert!(!query.ascending);
        assert!(query.tenant_id.is_none());
    }

    #[test]
    fn test_row_conversion_normalizes_status() {
        let row = MeasurementRow {
            id: Uuid::new_v4(),
            tenant_id: "factory-1".to_string(),
            garment_ref: Some("PO-1182".to_string()),
            garment_type: "trousers".to_string(),
            detected_size: "M".to_string(),
            confidence: 0.93,
            pixels_per_cm: 8.8,
            qc_status: "fail".to_string(),
            qc_failures: Json(vec!["Waist out of tolerance".to_string()]),
            measurement_data: Json(vec![Measurement {
                name: "Waist".to_string(),
                value: 84.2,
                unit: "cm".to_string(),
            }]),
            measured_at: Utc::now(),
        };

        let record = MeasurementRecord::from(row);
        assert_eq!(record.qc_status, QcStatus::Fail);
        assert_eq!(record.measurements.len(), 1);
        assert_eq!(record.garment_ref.as_deref(), Some("PO-1182"));
    }
}
