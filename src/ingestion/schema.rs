//! Fixed destination table layout for availability snapshots

use crate::ingestion::error::InvalidTableName;
use crate::ingestion::types::SnapshotDate;
use std::fmt;

/// Postgres truncates identifiers beyond this
const MAX_IDENTIFIER_LEN: usize = 63;

/// Server-generated surrogate key, never present in the CSV
pub const SURROGATE_KEY: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
}

/// Column order matches the published CSV header
pub const COLUMNS: [Column; 12] = [
    Column { name: "frn", sql_type: "BIGINT" },
    Column { name: "provider_id", sql_type: "BIGINT" },
    Column { name: "brand_name", sql_type: "TEXT" },
    Column { name: "location_id", sql_type: "BIGINT" },
    Column { name: "technology", sql_type: "INTEGER" },
    Column { name: "max_advertised_download_speed", sql_type: "INTEGER" },
    Column { name: "max_advertised_upload_speed", sql_type: "INTEGER" },
    Column { name: "low_latency", sql_type: "INTEGER" },
    Column { name: "business_residential_code", sql_type: "TEXT" },
    Column { name: "state_usps", sql_type: "TEXT" },
    Column { name: "block_geoid", sql_type: "BIGINT" },
    Column { name: "h3_res8_id", sql_type: "TEXT" },
];

pub fn column_names() -> Vec<&'static str> {
    COLUMNS.iter().map(|c| c.name).collect()
}

/// A table name that is safe to interpolate into SQL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTableName> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
            Ok(TableName(name))
        } else {
            Err(InvalidTableName(name))
        }
    }

    pub fn for_snapshot(snapshot: &SnapshotDate) -> Self {
        // Digits and underscores only, always valid
        TableName(format!("bdc_{}", snapshot.date().format("%Y_%m_%d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn create_table_sql(table: &TableName) -> String {
    let columns = COLUMNS
        .iter()
        .map(|c| format!("    {} {}", c.name, c.sql_type))
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n{columns},\n    {key} BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY\n)",
        table = table,
        columns = columns,
        key = SURROGATE_KEY,
    )
}

pub fn copy_sql(table: &TableName) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true, DELIMITER ',')",
        table,
        column_names().join(", ")
    )
}

/// Compare a reused table's columns against the fixed layout.
/// The surrogate key is ignored; order is not significant.
pub fn matches_fixed_columns(found: &[String]) -> bool {
    let mut found: Vec<&str> = found
        .iter()
        .map(String::as_str)
        .filter(|c| *c != SURROGATE_KEY)
        .collect();
    let mut expected = column_names();
    found.sort_unstable();
    expected.sort_unstable();
    found == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(TableName::new("bdc_2023_12_31").is_ok());
        assert!(TableName::new("_staging").is_ok());
        assert!(TableName::new("").is_err());
        assert!(TableName::new("2023_bdc").is_err());
        assert!(TableName::new("bdc; DROP TABLE x").is_err());
        assert!(TableName::new("BDC").is_err());
        assert!(TableName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_create_table_sql_keeps_column_order() {
        let table = TableName::new("bdc_2023_12_31").unwrap();
        let sql = create_table_sql(&table);

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS bdc_2023_12_31"));
        let positions: Vec<usize> = COLUMNS
            .iter()
            .map(|c| sql.find(&format!("{} {}", c.name, c.sql_type)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(sql.contains("id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY"));
    }

    #[test]
    fn test_copy_sql_lists_columns_without_key() {
        let table = TableName::new("bdc_2023_12_31").unwrap();
        let sql = copy_sql(&table);
        assert!(sql.starts_with("COPY bdc_2023_12_31 (frn, provider_id, brand_name,"));
        assert!(sql.contains("h3_res8_id) FROM STDIN"));
        assert!(!sql.contains("(id"));
    }

    #[test]
    fn test_matches_fixed_columns() {
        let mut found: Vec<String> = column_names().iter().map(|c| c.to_string()).collect();
        found.push("id".to_string());
        found.reverse();
        assert!(matches_fixed_columns(&found));

        found.pop();
        assert!(!matches_fixed_columns(&found));
    }
}
