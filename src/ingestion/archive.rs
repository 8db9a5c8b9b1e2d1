//! Archive functions - forward processed files to long-term storage

use crate::ingestion::error::ArchiveError;
use crate::ingestion::utils::remove_if_exists;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::CompressionMethod;

pub const DEFAULT_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// External storage that accepts one file per call
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, path: &Path, file_name: &str, table_name: &str) -> Result<(), ArchiveError>;
}

/// Multipart POST to a webhook, with `filename` and `table_name` query parameters
#[derive(Debug, Clone)]
pub struct WebhookUploader {
    http: Client,
    url: String,
}

impl WebhookUploader {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ArchiveError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArchiveError::Transport(e.to_string()))?;
        Ok(WebhookUploader {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Uploader for WebhookUploader {
    async fn upload(&self, path: &Path, file_name: &str, table_name: &str) -> Result<(), ArchiveError> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();

        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, length).file_name(file_name.to_string());
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(&self.url)
            .query(&[("filename", file_name), ("table_name", table_name)])
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ArchiveError::Timeout(e.to_string())
                } else {
                    ArchiveError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            info!("Uploaded {} ({} bytes) for {}", file_name, length, table_name);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

fn classify_status(status: StatusCode, body: String) -> ArchiveError {
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ArchiveError::Timeout(format!("HTTP {}", status))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ArchiveError::Transport(format!("HTTP {}: {}", status, body))
    } else {
        ArchiveError::RejectedByDestination {
            status: status.as_u16(),
            body,
        }
    }
}

/// What was sent to storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub uploaded: PathBuf,
    pub compressed: bool,
    pub bytes: u64,
}

/// Files at or above the threshold are zipped before upload
pub fn needs_compression(size: u64, threshold: u64) -> bool {
    size >= threshold
}

/// Zip `source` into `<source>.zip`. Output is byte-identical for identical input.
pub fn compress_file(source: &Path) -> Result<PathBuf, ArchiveError> {
    let entry_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ArchiveError::Io(io::Error::new(io::ErrorKind::InvalidInput, "no file name")))?;
    let target = zip_path_for(source);

    let size = fs::metadata(source)?.len();
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
        .large_file(size >= u32::MAX as u64);

    let mut input = BufReader::new(fs::File::open(source)?);
    let mut writer = zip::ZipWriter::new(BufWriter::new(fs::File::create(&target)?));
    writer.start_file(entry_name, options)?;
    io::copy(&mut input, &mut writer)?;
    writer.finish()?;

    info!("Compressed {:?} ({} bytes) to {:?}", source, size, target);
    Ok(target)
}

fn zip_path_for(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(".zip");
    PathBuf::from(name)
}

/// Chooses between uploading a file as-is or compressed, and removes local
/// copies only after the destination confirms the upload.
pub struct SizeGatedArchiver<U> {
    uploader: U,
    threshold_bytes: u64,
}

impl<U: Uploader> SizeGatedArchiver<U> {
    pub fn new(uploader: U, threshold_bytes: u64) -> Self {
        SizeGatedArchiver {
            uploader,
            threshold_bytes,
        }
    }

    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    /// Upload `path` and remove it once the upload is confirmed.
    ///
    /// A timeout on an uncompressed upload is retried once compressed. On any
    /// failure the original stays on disk; the derived zip is removed since it
    /// is rebuilt on the next attempt.
    pub async fn archive(&self, path: &Path, table_name: &str) -> Result<ArchiveOutcome, ArchiveError> {
        let size = tokio::fs::metadata(path).await?.len();

        if !needs_compression(size, self.threshold_bytes) {
            match self.upload_as_is(path, table_name).await {
                Ok(()) => {
                    remove_if_exists(path)?;
                    return Ok(ArchiveOutcome {
                        uploaded: path.to_path_buf(),
                        compressed: false,
                        bytes: size,
                    });
                }
                Err(ArchiveError::Timeout(reason)) => {
                    warn!("Upload of {:?} timed out ({}), retrying compressed", path, reason);
                }
                Err(e) => return Err(e),
            }
        }

        self.upload_compressed(path, table_name).await
    }

    /// Like [`archive`](Self::archive) but always uploads the compressed form.
    /// Used once an earlier attempt timed out even after compression.
    pub async fn archive_compressed(&self, path: &Path, table_name: &str) -> Result<ArchiveOutcome, ArchiveError> {
        self.upload_compressed(path, table_name).await
    }

    async fn upload_as_is(&self, path: &Path, table_name: &str) -> Result<(), ArchiveError> {
        let file_name = file_name_of(path);
        self.uploader.upload(path, &file_name, table_name).await
    }

    async fn upload_compressed(&self, path: &Path, table_name: &str) -> Result<ArchiveOutcome, ArchiveError> {
        let source = path.to_path_buf();
        let zipped = tokio::task::spawn_blocking(move || compress_file(&source))
            .await
            .map_err(|e| ArchiveError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        let bytes = tokio::fs::metadata(&zipped).await?.len();

        let result = self.uploader.upload(&zipped, &file_name_of(&zipped), table_name).await;
        if let Err(e) = result {
            if let Err(cleanup) = remove_if_exists(&zipped) {
                warn!("Failed to remove {:?}: {}", zipped, cleanup);
            }
            return Err(e);
        }

        remove_if_exists(&zipped)?;
        remove_if_exists(path)?;
        Ok(ArchiveOutcome {
            uploaded: zipped,
            compressed: true,
            bytes,
        })
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
