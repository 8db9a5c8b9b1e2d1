//! Utility functions for common operations

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Client;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Connection settings for the remote catalog
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub username: String,
    pub api_key: String,
    pub user_agent: String,
    /// Short: a dead host should fail fast
    pub connect_timeout: Duration,
    /// Long: state archives run to hundreds of megabytes
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "https://broadbandmap.fcc.gov/api/public/map".to_string(),
            username: String::new(),
            api_key: String::new(),
            user_agent: concat!("bdc-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Build the HTTP client used for catalog listings and downloads.
/// Credentials travel as the `username` and `hash_value` headers.
pub fn build_catalog_client(config: &ClientConfig) -> Result<Client, String> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&config.user_agent).map_err(|e| format!("user agent: {}", e))?,
    );

    let mut username =
        HeaderValue::from_str(&config.username).map_err(|e| format!("username header: {}", e))?;
    username.set_sensitive(true);
    headers.insert("username", username);

    let mut hash_value =
        HeaderValue::from_str(&config.api_key).map_err(|e| format!("hash_value header: {}", e))?;
    hash_value.set_sensitive(true);
    headers.insert("hash_value", hash_value);

    Client::builder()
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .build()
        .map_err(|e| e.to_string())
}

/// Join a base URL and a path without doubling slashes
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
