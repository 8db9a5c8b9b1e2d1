//! Parse functions - validate extracted CSVs against the fixed schema

use crate::ingestion::error::LoadError;
use crate::ingestion::schema::column_names;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;

/// One availability CSV row, in schema column order
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AvailabilityRow {
    pub frn: Option<i64>,
    pub provider_id: Option<i64>,
    pub brand_name: Option<String>,
    pub location_id: Option<i64>,
    pub technology: Option<i32>,
    pub max_advertised_download_speed: Option<i32>,
    pub max_advertised_upload_speed: Option<i32>,
    pub low_latency: Option<i32>,
    pub business_residential_code: Option<String>,
    pub state_usps: Option<String>,
    pub block_geoid: Option<i64>,
    pub h3_res8_id: Option<String>,
}

/// True when the file has no bytes at all
pub fn is_empty_file(path: &Path) -> Result<bool, LoadError> {
    Ok(fs::metadata(path)?.len() == 0)
}

/// Check that the header row names the fixed columns in order
pub fn validate_header(path: &Path) -> Result<(), LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();
    let expected = column_names();

    if headers != expected {
        return Err(LoadError::Rejected(format!(
            "unexpected CSV header in {:?}: got {:?}, expected {:?}",
            path, headers, expected
        )));
    }

    debug!("Header of {:?} matches the fixed schema", path);
    Ok(())
}

/// Open a typed row reader over a validated CSV
pub fn row_reader(path: &Path) -> Result<csv::Reader<fs::File>, LoadError> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Fields)
        .from_path(path)?;
    Ok(reader)
}

/// Read and type-check every row. Fails on the first bad row.
pub fn read_rows(path: &Path) -> Result<Vec<AvailabilityRow>, LoadError> {
    if is_empty_file(path)? {
        return Ok(Vec::new());
    }
    validate_header(path)?;

    let mut reader = row_reader(path)?;
    let mut rows = Vec::new();
    for (idx, result) in reader.deserialize::<AvailabilityRow>().enumerate() {
        let row = result.map_err(|e| LoadError::Rejected(format!("row {}: {}", idx + 1, e)))?;
        rows.push(row);
    }
    Ok(rows)
}
