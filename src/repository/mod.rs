// src/repository/mod.rs

//! Repository access and synchronization
//!
//! This module provides functionality for:
//! - Fetching repository catalogs with conditional requests
//! - Streaming package downloads
//! - Decoding the JSON catalog format ([`catalog`])
//! - Synchronizing catalogs into the metadata store ([`sync`])
//!
//! Network access goes through the [`Transport`] trait so that sync and
//! install logic never talk to `reqwest` directly.

pub mod catalog;
pub mod sync;

pub use sync::{SyncMode, SyncOutcome, SyncReport, sync_all, sync_repository};

use crate::error::{Error, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_DISPOSITION, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts for requests failing before a response arrives
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Cache validators stored from a previous full fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Result of a (possibly conditional) catalog fetch
#[derive(Debug)]
pub enum FetchOutcome {
    /// Upstream reports the catalog unchanged
    NotModified,
    /// Full response body plus fresh validators
    Fetched {
        body: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// An open package download
pub struct Download {
    /// Filename suggested by a `Content-Disposition` header
    pub filename_hint: Option<String>,
    /// URL after redirects
    pub final_url: String,
    pub reader: Box<dyn Read + Send>,
}

impl Download {
    /// Pick the on-disk filename for this download
    ///
    /// Prefers the server's hint, then the basename of the final URL, then
    /// `fallback`. Directory components are always stripped.
    pub fn filename(&self, fallback: &str) -> String {
        self.filename_hint
            .as_deref()
            .and_then(sanitize_filename)
            .or_else(|| url_basename(&self.final_url).and_then(sanitize_filename))
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Network seam used by sync and install
pub trait Transport: Send + Sync {
    /// Fetch a catalog, sending `validators` as conditional headers if given
    fn fetch(&self, url: &str, validators: Option<&Validators>) -> Result<FetchOutcome>;

    /// Open a streaming download
    fn download(&self, url: &str) -> Result<Download>;
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
}

impl RepositoryClient {
    /// Create a new repository client with the given timeout
    ///
    /// The timeout covers the whole transfer, body included.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Send a request, retrying connection-level failures
    fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Response>
    where
        F: Fn() -> reqwest::blocking::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send() {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempt >= self.max_retries || e.is_timeout() {
                        return Err(Error::NetworkError(format!(
                            "Failed to reach {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Request to {} failed (attempt {}): {}, retrying...", url, attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

fn header_string(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl Transport for RepositoryClient {
    fn fetch(&self, url: &str, validators: Option<&Validators>) -> Result<FetchOutcome> {
        info!("Fetching repository catalog from {}", url);

        let response = self.send_with_retry(url, || {
            let mut request = self.client.get(url);
            if let Some(validators) = validators {
                if let Some(etag) = &validators.etag {
                    request = request.header(IF_NONE_MATCH, etag.as_str());
                }
                if let Some(last_modified) = &validators.last_modified {
                    request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
                }
            }
            request
        })?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("{} not modified since last fetch", url);
            return Ok(FetchOutcome::NotModified);
        }

        if !response.status().is_success() {
            return Err(Error::NetworkError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let etag = header_string(&response, ETAG);
        let last_modified = header_string(&response, LAST_MODIFIED);
        let body = response
            .bytes()
            .map_err(|e| Error::NetworkError(format!("Failed to read {}: {}", url, e)))?
            .to_vec();

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(FetchOutcome::Fetched {
            body,
            etag,
            last_modified,
        })
    }

    fn download(&self, url: &str) -> Result<Download> {
        info!("Downloading {}", url);

        let response = self.send_with_retry(url, || self.client.get(url))?;

        if !response.status().is_success() {
            return Err(Error::NetworkError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let filename_hint = header_string(&response, CONTENT_DISPOSITION)
            .as_deref()
            .and_then(disposition_filename);
        let final_url = response.url().to_string();

        Ok(Download {
            filename_hint,
            final_url,
            reader: Box::new(response),
        })
    }
}

/// Extract `filename=` from a `Content-Disposition` header value
pub fn disposition_filename(header: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .map(|v| v.split('"').next().unwrap_or(""))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Last path segment of a URL, without query or fragment
fn url_basename(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Reduce a suggested filename to a safe basename
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

/// Current time as Unix seconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
