//! Source fetchers
//!
//! A fetcher returns the raw bytes of one extract. The orchestrator never
//! sees transport details: every failure that survives the retry policy
//! becomes [`IngestError::SourceUnavailable`].

use crate::error::{IngestError, IngestResult};
use crate::utils::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const USER_AGENT: &str = concat!("erq-ingest/", env!("CARGO_PKG_VERSION"));

/// Raw extract with provenance
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSource {
    pub bytes: Vec<u8>,
    pub location: String,
    /// Hex SHA-256 of `bytes`
    pub checksum: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedSource {
    pub fn new(bytes: Vec<u8>, location: impl Into<String>) -> Self {
        let checksum = checksum(&bytes);
        Self {
            bytes,
            location: location.into(),
            checksum,
            fetched_at: Utc::now(),
        }
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self) -> IngestResult<FetchedSource>;

    /// URL or path, for logs and provenance
    fn location(&self) -> &str;
}

#[derive(Debug)]
struct FetchFailure {
    message: String,
    retryable: bool,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// HTTP(S) fetcher with per-request timeout and retry
pub struct HttpFetcher {
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration, policy: RetryPolicy) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
            policy,
        })
    }

    async fn attempt(&self) -> Result<Vec<u8>, FetchFailure> {
        tracing::debug!(url = %self.url, "Requesting extract");

        let response = self.client.get(&self.url).send().await.map_err(|e| FetchFailure {
            message: if e.is_timeout() {
                format!("timed out: {e}")
            } else {
                format!("request failed: {e}")
            },
            retryable: true,
        })?;

        let status = response.status();
        if !status.is_success() {
            // client errors will not fix themselves, except throttling
            let retryable = status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408;
            return Err(FetchFailure {
                message: format!("HTTP {status}"),
                retryable,
            });
        }

        let body = response.bytes().await.map_err(|e| FetchFailure {
            message: format!("body read failed: {e}"),
            retryable: true,
        })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self) -> IngestResult<FetchedSource> {
        let bytes = retry_with_backoff("fetch extract", self.policy, |e: &FetchFailure| e.retryable, || {
            self.attempt()
        })
        .await
        .map_err(|e| IngestError::SourceUnavailable(format!("{}: {}", self.url, e)))?;

        tracing::info!(url = %self.url, bytes = bytes.len(), "Fetched extract");
        Ok(FetchedSource::new(bytes, self.url.clone()))
    }

    fn location(&self) -> &str {
        &self.url
    }
}

/// Local file fetcher, for replays and tests
pub struct FileFetcher {
    path: PathBuf,
    location: String,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = path.display().to_string();
        Self { path, location }
    }
}

#[async_trait]
impl SourceFetcher for FileFetcher {
    async fn fetch(&self) -> IngestResult<FetchedSource> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| IngestError::SourceUnavailable(format!("{}: {}", self.location, e)))?;
        tracing::info!(path = %self.location, bytes = bytes.len(), "Read extract");
        Ok(FetchedSource::new(bytes, self.location.clone()))
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// Fetcher for a configured location: `http(s)://` URL or file path
pub fn fetcher_for(
    location: &str,
    timeout: Duration,
    policy: RetryPolicy,
) -> IngestResult<Box<dyn SourceFetcher>> {
    let lower = location.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(Box::new(HttpFetcher::new(location, timeout, policy)?));
    }
    let path = location.strip_prefix("file://").unwrap_or(location);
    Ok(Box::new(FileFetcher::new(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn file_fetcher_reads_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"a;b\n1;2\n").unwrap();

        let fetcher = FileFetcher::new(file.path());
        let fetched = fetcher.fetch().await.unwrap();
        assert_eq!(fetched.bytes, b"a;b\n1;2\n");
        assert_eq!(fetched.checksum, checksum(b"a;b\n1;2\n"));
    }

    #[tokio::test]
    async fn missing_file_is_source_unavailable() {
        let fetcher = FileFetcher::new("/nonexistent/erq/extract.csv");
        assert!(matches!(fetcher.fetch().await, Err(IngestError::SourceUnavailable(_))));
    }

    #[tokio::test]
    async fn unreachable_host_is_source_unavailable_after_retries() {
        let policy = RetryPolicy {
            attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        // port 9 on loopback refuses connections
        let fetcher = HttpFetcher::new("http://127.0.0.1:9/extract.csv", Duration::from_secs(2), policy).unwrap();
        assert!(matches!(fetcher.fetch().await, Err(IngestError::SourceUnavailable(_))));
    }

    #[test]
    fn location_scheme_selects_fetcher() {
        let policy = RetryPolicy::default();
        let http = fetcher_for("https://example.org/x.csv", Duration::from_secs(1), policy).unwrap();
        assert_eq!(http.location(), "https://example.org/x.csv");
        let file = fetcher_for("file:///tmp/x.csv", Duration::from_secs(1), policy).unwrap();
        assert_eq!(file.location(), "/tmp/x.csv");
    }
}
