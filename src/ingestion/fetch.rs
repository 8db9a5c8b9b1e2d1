//! Fetch functions - retrieve raw file bytes from the catalog

use crate::ingestion::catalog::BdcClient;
use crate::ingestion::error::FetchError;
use crate::ingestion::types::FileId;
use crate::ingestion::utils::join_url;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::info;

impl BdcClient {
    /// Download one availability archive.
    ///
    /// Timeouts, connection failures, 429 and 5xx are transient; any other
    /// non-success status is permanent. Retrying is the caller's decision.
    pub async fn download(&self, file_id: &FileId) -> Result<Bytes, FetchError> {
        let url = join_url(
            &self.base_url,
            &format!("downloads/downloadfile/availability/{}", file_id),
        );
        info!("Downloading file {} from {}", file_id, url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| transient(file_id, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(file_id, status));
        }

        let bytes = response.bytes().await.map_err(|e| transient(file_id, &e))?;
        info!("Downloaded {} bytes for file {}", bytes.len(), file_id);
        Ok(bytes)
    }
}

fn transient(file_id: &FileId, err: &reqwest::Error) -> FetchError {
    let reason = if err.is_timeout() {
        format!("timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    };
    FetchError::Transient {
        file_id: file_id.to_string(),
        reason,
    }
}

pub(crate) fn classify_status(file_id: &FileId, status: StatusCode) -> FetchError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        FetchError::Transient {
            file_id: file_id.to_string(),
            reason: format!("HTTP {}", status),
        }
    } else {
        FetchError::Permanent {
            file_id: file_id.to_string(),
            status: status.as_u16(),
        }
    }
}
