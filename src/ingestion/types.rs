//! Core data types for the ingestion pipeline
//! Pure data structures validated at the JSON boundary

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::ingestion::schema::TableName;

/// One dated release of the catalog, e.g. `2023-12-31`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotDate(NaiveDate);

impl SnapshotDate {
    pub fn new(date: NaiveDate) -> Self {
        SnapshotDate(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Destination table for this snapshot: `2023-12-31` -> `bdc_2023_12_31`
    pub fn table_name(&self) -> TableName {
        TableName::for_snapshot(self)
    }
}

impl FromStr for SnapshotDate {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // The catalog sometimes renders dates with a time component
        let day = s.split_once('T').map(|(d, _)| d).unwrap_or(s);
        NaiveDate::parse_from_str(day, "%Y-%m-%d").map(SnapshotDate)
    }
}

impl TryFrom<String> for SnapshotDate {
    type Error = chrono::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SnapshotDate> for String {
    fn from(value: SnapshotDate) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SnapshotDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Catalog `data_type` that a snapshot date belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataKind {
    Availability,
    Challenge,
    Other(String),
}

impl DataKind {
    pub fn as_str(&self) -> &str {
        match self {
            DataKind::Availability => "availability",
            DataKind::Challenge => "challenge",
            DataKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for DataKind {
    fn from(value: &str) -> Self {
        match value {
            "availability" => DataKind::Availability,
            "challenge" => DataKind::Challenge,
            other => DataKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque catalog file identifier; the API renders it as a string or a number
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "String")]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        FileId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<serde_json::Value> for FileId {
    type Error = String;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Ok(FileId(s.trim().to_string())),
            serde_json::Value::Number(n) => Ok(FileId(n.to_string())),
            other => Err(format!("invalid file_id: {}", other)),
        }
    }
}

impl From<FileId> for String {
    fn from(value: FileId) -> Self {
        value.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entry of the `listAsOfDates` response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DateEntry {
    pub data_type: String,
    pub as_of_date: SnapshotDate,
}

/// Metadata for one downloadable file - the unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub file_id: FileId,
    pub file_name: String,
    pub technology_type: String,
    pub file_type: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub file_size: Option<u64>,

    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub technology_code: Option<String>,
    #[serde(default)]
    pub technology_code_desc: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub state_fips: Option<String>,
    #[serde(default)]
    pub state_name: Option<String>,
}

/// Accepts a number, a numeric string, or null
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid file size: {}", n))),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid file size: {}", s))),
        Some(other) => Err(D::Error::custom(format!("invalid file size: {}", other))),
    }
}

/// Accepts a string, a number, or null
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!("expected string or number, got {}", other))),
    }
}

/// Which descriptors a run ingests. Matching is exact equality on each field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub technology_type: String,
    pub file_type: String,
    pub excluded_technologies: Vec<String>,
}

impl Default for FileFilter {
    fn default() -> Self {
        FileFilter {
            technology_type: "Fixed Broadband".to_string(),
            file_type: "csv".to_string(),
            excluded_technologies: vec!["GSO Satellite".to_string(), "NGSO Satellite".to_string()],
        }
    }
}

impl FileFilter {
    pub fn matches(&self, descriptor: &FileDescriptor) -> bool {
        if descriptor.technology_type != self.technology_type {
            return false;
        }
        if descriptor.file_type != self.file_type {
            return false;
        }
        match &descriptor.technology_code_desc {
            Some(desc) => !self.excluded_technologies.iter().any(|t| t == desc),
            None => true,
        }
    }
}

/// Result of provisioning the destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    AlreadyExisted,
}

/// Per-file pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Extracting,
    Loading,
    Archiving,
    Cleaning,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetching => write!(f, "fetching"),
            Stage::Extracting => write!(f, "extracting"),
            Stage::Loading => write!(f, "loading"),
            Stage::Archiving => write!(f, "archiving"),
            Stage::Cleaning => write!(f, "cleaning"),
        }
    }
}

/// Terminal state of a snapshot run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithFailures,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::CompletedWithFailures => write!(f, "completed with failures"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// A descriptor that did not make it through the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub descriptor: FileDescriptor,
    pub stage: Stage,
    pub kind: crate::ingestion::error::ErrorKind,
    pub message: String,
    /// Extracted CSV left in the exports directory, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_file: Option<PathBuf>,
}

impl FileFailure {
    /// True once the file's rows are in the table; a retry must not load it again
    pub fn rows_committed(&self) -> bool {
        matches!(self.stage, Stage::Archiving | Stage::Cleaning)
    }
}

/// Run statistics, reported once the run ends
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub snapshot: SnapshotDate,
    pub table: String,
    pub status: RunStatus,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped_duplicates: usize,
    pub rows_loaded: u64,
    pub failed: Vec<FileFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn new(snapshot: SnapshotDate, table: &TableName) -> Self {
        RunSummary {
            snapshot,
            table: table.to_string(),
            status: RunStatus::Running,
            attempted: 0,
            succeeded: 0,
            skipped_duplicates: 0,
            rows_loaded: 0,
            failed: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn finish(&mut self, aborted: bool) {
        self.status = if aborted {
            RunStatus::Aborted
        } else if self.failed.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithFailures
        };
        self.finished_at = Some(Utc::now());
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): attempted: {}, succeeded: {}, failed: {}, duplicates skipped: {}, rows loaded: {}",
            self.table,
            self.status,
            self.attempted,
            self.succeeded,
            self.failed.len(),
            self.skipped_duplicates,
            self.rows_loaded
        )
    }
}
