//! Remote catalog - snapshot dates and per-snapshot file listings

use crate::ingestion::error::{CatalogError, FetchError};
use crate::ingestion::types::{DataKind, DateEntry, FileDescriptor, FileFilter, FileId, SnapshotDate};
use crate::ingestion::utils::{build_catalog_client, join_url, ClientConfig};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

/// Read-only view of the remote dataset.
///
/// Implementations return the raw catalog; filtering and ordering are applied
/// by [`list_snapshot_dates`] and [`list_files`].
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn list_dates(&self) -> Result<Vec<DateEntry>, CatalogError>;

    async fn list_descriptors(
        &self,
        snapshot: &SnapshotDate,
        category: &str,
        subcategory: &str,
    ) -> Result<Vec<FileDescriptor>, CatalogError>;

    /// Full body of one file. Never retries.
    async fn fetch(&self, file_id: &FileId) -> Result<Bytes, FetchError>;
}

/// All release dates of `kind`, newest first
pub async fn list_snapshot_dates<S: RemoteSource + ?Sized>(
    source: &S,
    kind: &DataKind,
) -> Result<Vec<SnapshotDate>, CatalogError> {
    let entries = source.list_dates().await?;
    let mut dates: Vec<SnapshotDate> = entries
        .into_iter()
        .filter(|e| e.data_type == kind.as_str())
        .map(|e| e.as_of_date)
        .collect();

    dates.sort_unstable_by(|a, b| b.cmp(a));
    dates.dedup();

    info!("Found {} {} snapshot dates", dates.len(), kind);
    Ok(dates)
}

/// Descriptors for one snapshot that pass `filter`, ordered by state FIPS code
pub async fn list_files<S: RemoteSource + ?Sized>(
    source: &S,
    snapshot: &SnapshotDate,
    category: &str,
    subcategory: &str,
    filter: &FileFilter,
) -> Result<Vec<FileDescriptor>, CatalogError> {
    let listed = source.list_descriptors(snapshot, category, subcategory).await?;
    let total = listed.len();

    let mut files: Vec<FileDescriptor> = listed.into_iter().filter(|d| filter.matches(d)).collect();
    files.sort_by(|a, b| {
        a.state_fips
            .cmp(&b.state_fips)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });

    info!(
        "Snapshot {} lists {} files, {} match {} / {}",
        snapshot,
        total,
        files.len(),
        filter.technology_type,
        filter.file_type
    );
    Ok(files)
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// HTTP client for the BDC public map API
#[derive(Debug, Clone)]
pub struct BdcClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
}

impl BdcClient {
    pub fn new(config: &ClientConfig) -> Result<Self, CatalogError> {
        let http = build_catalog_client(config).map_err(CatalogError::Config)?;
        Ok(BdcClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CatalogError> {
        debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| CatalogError::Unavailable {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| CatalogError::Unavailable {
                url: url.to_string(),
                source,
            })?;

        let envelope: Envelope<T> = serde_json::from_slice(&body)
            .map_err(|e| CatalogError::Malformed(format!("{}: {}", url, e)))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl RemoteSource for BdcClient {
    async fn list_dates(&self) -> Result<Vec<DateEntry>, CatalogError> {
        let url = join_url(&self.base_url, "listAsOfDates");
        self.get_data(&url, &[]).await
    }

    async fn list_descriptors(
        &self,
        snapshot: &SnapshotDate,
        category: &str,
        subcategory: &str,
    ) -> Result<Vec<FileDescriptor>, CatalogError> {
        let url = join_url(
            &self.base_url,
            &format!("downloads/listAvailabilityData/{}", snapshot),
        );
        self.get_data(&url, &[("category", category), ("subcategory", subcategory)])
            .await
    }

    async fn fetch(&self, file_id: &FileId) -> Result<Bytes, FetchError> {
        self.download(file_id).await
    }
}
