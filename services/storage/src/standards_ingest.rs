//! Size-standard spreadsheet ingestion.
//!
//! Expected layout (one header row, then one row per point of measure):
//!
//! ```text
//! col 1    col 2     col 3        col 4    col 5    col 6..
//! include  POM code  description  tol (-)  tol (+)  one column per size label
//! ```
//!
//! Input is decoded into [`StandardTable`] first, so shape problems in
//! included rows are reported with a 1-based row/column locator. Excluded
//! rows are not checked at all. Only then are rows filtered by the include
//! flag and pivoted into a per-size [`SizeStandard`].

use crate::model::{PointOfMeasure, SizeColumn, SizeStandard};
use crate::record_store::{StandardsStore, StoreError};
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Index of the first size column (0-based)
pub const SIZE_COLUMN_OFFSET: usize = 5;

const CORE_COLUMN_NAMES: [&str; SIZE_COLUMN_OFFSET] = [
    "include flag",
    "POM code",
    "description",
    "minus tolerance",
    "plus tolerance",
];

/// Errors from standards ingestion
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed CSV near line {line}: {message}")]
    Csv { line: u64, message: String },

    #[error("table has no header row")]
    EmptyTable,

    #[error("header row has {found} columns, expected {SIZE_COLUMN_OFFSET} core columns followed by at least one size label")]
    MissingSizeColumns { found: usize },

    #[error("header column {column}: duplicate size label '{label}'")]
    DuplicateSize { column: usize, label: String },

    #[error("row {row}, column {column}: missing {name}")]
    MissingColumn {
        row: usize,
        column: usize,
        name: &'static str,
    },

    #[error("row {row}, column {column}: {name} must not be empty")]
    EmptyField {
        row: usize,
        column: usize,
        name: &'static str,
    },

    #[error("row {row}, column {column}: value '{value}' has no size label")]
    UnlabeledValue {
        row: usize,
        column: usize,
        value: String,
    },

    #[error("no rows are marked for inclusion")]
    NoIncludedRows,

    #[error("garment type must not be empty")]
    EmptyGarmentType,

    #[error("style code must not be empty")]
    EmptyStyleCode,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One decoded data row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardRow {
    /// 1-based row number in the source table
    pub row: usize,
    pub include: bool,
    pub code: String,
    pub description: String,
    pub tol_minus: String,
    pub tol_plus: String,
    /// One value per size label, empty when the sheet had none
    pub values: Vec<String>,
}

/// Decoded but not yet filtered standards sheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardTable {
    sizes: Vec<String>,
    rows: Vec<StandardRow>,
}

impl StandardTable {
    /// Decode an in-memory table whose first row is the header
    pub fn from_rows<R, C>(rows: R) -> Result<Self, IngestError>
    where
        R: IntoIterator<Item = Vec<C>>,
        C: Into<String>,
    {
        let numbered = rows
            .into_iter()
            .enumerate()
            .map(|(index, cells)| (index + 1, cells.into_iter().map(Into::into).collect()));

        Self::decode(numbered)
    }

    /// Decode CSV text
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, IngestError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (index, record) in csv_reader.records().enumerate() {
            let record = record.map_err(|e| IngestError::Csv {
                line: e.position().map(|p| p.line()).unwrap_or(index as u64 + 1),
                message: e.to_string(),
            })?;

            let row = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(index + 1);
            rows.push((row, record.iter().map(String::from).collect()));
        }

        Self::decode(rows)
    }

    fn decode<I>(rows: I) -> Result<Self, IngestError>
    where
        I: IntoIterator<Item = (usize, Vec<String>)>,
    {
        let mut rows = rows
            .into_iter()
            .filter(|(_, cells)| cells.iter().any(|cell| !cell.trim().is_empty()));

        let (_, header) = rows.next().ok_or(IngestError::EmptyTable)?;
        let size_columns = decode_header(&header)?;
        let sizes = size_columns.iter().map(|(_, label)| label.clone()).collect();

        let rows = rows
            .map(|(row, cells)| decode_row(row, &cells, &size_columns))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { sizes, rows })
    }

    /// Size labels in column order
    pub fn sizes(&self) -> &[String] {
        &self.sizes
    }

    pub fn rows(&self) -> &[StandardRow] {
        &self.rows
    }

    pub fn included_rows(&self) -> impl Iterator<Item = &StandardRow> {
        self.rows.iter().filter(|row| row.include)
    }

    /// Filter by the include flag and pivot into one entry list per size
    pub fn into_standard(
        self,
        garment_type: &str,
        style_code: &str,
        unit: &str,
    ) -> Result<SizeStandard, IngestError> {
        let garment_type = garment_type.trim();
        let style_code = style_code.trim();
        if garment_type.is_empty() {
            return Err(IngestError::EmptyGarmentType);
        }
        if style_code.is_empty() {
            return Err(IngestError::EmptyStyleCode);
        }

        let included: Vec<StandardRow> = self.rows.into_iter().filter(|row| row.include).collect();
        if included.is_empty() {
            return Err(IngestError::NoIncludedRows);
        }

        let sizes = self
            .sizes
            .into_iter()
            .enumerate()
            .map(|(index, size)| SizeColumn {
                size,
                points: included
                    .iter()
                    .map(|row| PointOfMeasure {
                        code: row.code.clone(),
                        description: row.description.clone(),
                        tol_minus: row.tol_minus.clone(),
                        tol_plus: row.tol_plus.clone(),
                        value: row.values[index].clone(),
                    })
                    .collect(),
            })
            .collect();

        Ok(SizeStandard {
            garment_type: garment_type.to_string(),
            style_code: style_code.to_string(),
            unit: unit.to_string(),
            sizes,
        })
    }
}

/// Returns `(column index, label)` for every labelled size column
fn decode_header(header: &[String]) -> Result<Vec<(usize, String)>, IngestError> {
    let mut size_columns: Vec<(usize, String)> = Vec::new();

    for (index, label) in header.iter().enumerate().skip(SIZE_COLUMN_OFFSET) {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        if size_columns.iter().any(|(_, existing)| existing == label) {
            return Err(IngestError::DuplicateSize {
                column: index + 1,
                label: label.to_string(),
            });
        }
        size_columns.push((index, label.to_string()));
    }

    if size_columns.is_empty() {
        return Err(IngestError::MissingSizeColumns {
            found: header.len(),
        });
    }

    Ok(size_columns)
}

fn decode_row(
    row: usize,
    cells: &[String],
    size_columns: &[(usize, String)],
) -> Result<StandardRow, IngestError> {
    let cell = |index: usize| {
        cells
            .get(index)
            .map(|cell| cell.trim().to_string())
            .unwrap_or_default()
    };

    let include = cells.first().map_or(false, |flag| is_truthy(flag));
    if !include {
        // Excluded rows are kept as given, unchecked
        return Ok(StandardRow {
            row,
            include,
            code: cell(1),
            description: cell(2),
            tol_minus: cell(3),
            tol_plus: cell(4),
            values: size_columns.iter().map(|(column, _)| cell(*column)).collect(),
        });
    }

    if cells.len() < SIZE_COLUMN_OFFSET {
        return Err(IngestError::MissingColumn {
            row,
            column: cells.len() + 1,
            name: CORE_COLUMN_NAMES[cells.len()],
        });
    }

    let code = cell(1);
    if code.is_empty() {
        return Err(IngestError::EmptyField {
            row,
            column: 2,
            name: CORE_COLUMN_NAMES[1],
        });
    }

    for (index, value) in cells.iter().enumerate().skip(SIZE_COLUMN_OFFSET) {
        let labelled = size_columns.iter().any(|(column, _)| *column == index);
        if !labelled && !value.trim().is_empty() {
            return Err(IngestError::UnlabeledValue {
                row,
                column: index + 1,
                value: value.trim().to_string(),
            });
        }
    }

    let values = size_columns.iter().map(|(column, _)| cell(*column)).collect();

    Ok(StandardRow {
        row,
        include,
        code,
        description: cell(2),
        tol_minus: cell(3),
        tol_plus: cell(4),
        values,
    })
}

/// `TRUE` or `1`, case-insensitively; everything else excludes the row
fn is_truthy(cell: &str) -> bool {
    let value = cell.trim().trim_start_matches('\u{feff}');
    value.eq_ignore_ascii_case("TRUE") || value == "1"
}

/// Style code for an uploaded sheet: the file name without directory or extension
pub fn style_code_from_file_name(file_name: &str) -> Result<String, IngestError> {
    let base = file_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let stem = match base.rfind('.') {
        Some(dot) if dot + 1 < base.len() => &base[..dot],
        _ => base,
    };

    let stem = stem.trim();
    if stem.is_empty() {
        return Err(IngestError::EmptyStyleCode);
    }

    Ok(stem.to_string())
}

/// Writes decoded standards through to the standards store
pub struct StandardsIngestor {
    store: Arc<dyn StandardsStore>,
    unit: String,
}

impl StandardsIngestor {
    pub fn new(store: Arc<dyn StandardsStore>) -> Self {
        Self {
            store,
            unit: "cm".to_string(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Pivot `table` and replace the stored standard for its key
    #[instrument(skip(self, table))]
    pub async fn ingest(
        &self,
        garment_type: &str,
        style_code: &str,
        table: StandardTable,
    ) -> Result<SizeStandard, IngestError> {
        let total_rows = table.rows().len();
        let standard = table.into_standard(garment_type, style_code, &self.unit)?;

        debug!(
            total_rows,
            included_rows = standard.sizes.first().map(|s| s.points.len()).unwrap_or(0),
            sizes = standard.sizes.len(),
            "Standards sheet pivoted"
        );

        self.store.upsert_standard(&standard).await?;

        metrics::counter!("qc.standards.ingested").increment(1);
        info!(
            garment_type = %standard.garment_type,
            style_code = %standard.style_code,
            sizes = standard.sizes.len(),
            "Size standard stored"
        );

        Ok(standard)
    }

    /// Decode CSV text and ingest it
    pub async fn ingest_csv<R: Read>(
        &self,
        garment_type: &str,
        style_code: &str,
        reader: R,
    ) -> Result<SizeStandard, IngestError> {
        if garment_type.trim().is_empty() {
            return Err(IngestError::EmptyGarmentType);
        }
        if style_code.trim().is_empty() {
            return Err(IngestError::EmptyStyleCode);
        }

        let table = StandardTable::from_csv(reader)?;
        self.ingest(garment_type, style_code, table).await
    }
}
