//! Error types for each pipeline component

use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

/// Coarse error classification carried into the run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    CatalogUnavailable,
    MalformedCatalog,
    TransientFetchError,
    PermanentFetchError,
    CorruptArchive,
    LoadRejected,
    StoreUnavailable,
    Timeout,
    TransportError,
    RejectedByDestination,
    LocalIo,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Discovery-time failures. These abort the run.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request to {url} failed: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("catalog returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("invalid catalog client configuration: {0}")]
    Config(String),

    #[error("malformed catalog response: {0}")]
    Malformed(String),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::Malformed(_) => ErrorKind::MalformedCatalog,
            _ => ErrorKind::CatalogUnavailable,
        }
    }
}

/// Download failures for a single file
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure downloading file {file_id}: {reason}")]
    Transient { file_id: String, reason: String },

    #[error("permanent failure downloading file {file_id}: HTTP {status}")]
    Permanent { file_id: String, status: u16 },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Transient { .. } => ErrorKind::TransientFetchError,
            FetchError::Permanent { .. } => ErrorKind::PermanentFetchError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The upstream bytes are final, so this is never retried
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("I/O error during extraction: {0}")]
    Io(#[from] io::Error),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::CorruptArchive(_) => ErrorKind::CorruptArchive,
            ExtractError::Io(_) => ErrorKind::LocalIo,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    /// Nothing from the file was committed
    #[error("load rejected: {0}")]
    Rejected(String),

    #[error("database error: {0}")]
    Store(#[source] sqlx::Error),

    #[error("I/O error reading CSV: {0}")]
    Io(#[from] io::Error),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Rejected(_) => ErrorKind::LoadRejected,
            LoadError::Store(_) => ErrorKind::StoreUnavailable,
            LoadError::Io(_) => ErrorKind::LocalIo,
        }
    }
}

impl From<sqlx::Error> for LoadError {
    /// Data exceptions (SQLSTATE class 22) and integrity violations (class 23)
    /// mean the file's content was refused; anything else is a store failure.
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                if code.starts_with("22") || code.starts_with("23") {
                    return LoadError::Rejected(db.message().to_string());
                }
            }
        }
        LoadError::Store(err)
    }
}

impl From<csv::Error> for LoadError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv::ErrorKind::Io(e) => LoadError::Io(e),
                other => LoadError::Rejected(format!("{:?}", other)),
            }
        } else {
            LoadError::Rejected(err.to_string())
        }
    }
}

/// Table provisioning failures. These abort the run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidTableName(#[from] InvalidTableName),

    #[error("table {table} exists with columns {found:?}, expected {expected:?}")]
    SchemaMismatch {
        table: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        // Every provisioning failure leaves the store unusable for this run
        ErrorKind::StoreUnavailable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid table name: {0:?}")]
pub struct InvalidTableName(pub String);

/// Upload failures for the archive stage
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Upload did not finish in time; compressing may help
    #[error("archive upload timed out: {0}")]
    Timeout(String),

    #[error("archive upload failed: {0}")]
    Transport(String),

    #[error("archive destination rejected upload with HTTP {status}: {body}")]
    RejectedByDestination { status: u16, body: String },

    #[error("failed to compress archive artifact: {0}")]
    Compression(#[from] zip::result::ZipError),

    #[error("I/O error during archiving: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Timeout(_) => ErrorKind::Timeout,
            ArchiveError::Transport(_) => ErrorKind::TransportError,
            ArchiveError::RejectedByDestination { .. } => ErrorKind::RejectedByDestination,
            ArchiveError::Compression(_) | ArchiveError::Io(_) => ErrorKind::LocalIo,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ArchiveError::Timeout(_) | ArchiveError::Transport(_))
    }
}

/// Any failure inside one descriptor's pipeline
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("failed to remove working file: {0}")]
    Cleanup(#[source] io::Error),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Fetch(e) => e.kind(),
            StageError::Extract(e) => e.kind(),
            StageError::Load(e) => e.kind(),
            StageError::Archive(e) => e.kind(),
            StageError::Cleanup(_) => ErrorKind::LocalIo,
        }
    }
}

/// Run-fatal errors: raised before any file is touched
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] CatalogError),

    #[error("no {0} snapshots published")]
    NoSnapshots(String),

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisionError),

    #[error("cannot prepare exports directory: {0}")]
    Workspace(#[from] io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Discovery(e) => e.kind(),
            PipelineError::NoSnapshots(_) => ErrorKind::CatalogUnavailable,
            PipelineError::Provisioning(e) => e.kind(),
            PipelineError::Workspace(_) => ErrorKind::LocalIo,
        }
    }
}
