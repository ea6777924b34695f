use super::resolver::{self, DownloadCandidate};
use super::AssetSource;
use crate::error::{Error, Result};
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Size and timing heuristics used to tell a real artifact from a provider's
/// error or confirmation page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    /// A downloaded file must be strictly larger than this to be kept.
    pub min_asset_bytes: u64,
    /// HTML bodies smaller than this are treated as error pages.
    pub html_error_page_bytes: usize,
    /// How much of the body is buffered before deciding what the response is.
    /// Never less than `html_error_page_bytes` in practice, see [`FetchPolicy::sniff_limit`].
    pub sniff_bytes: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            min_asset_bytes: 10_000,
            html_error_page_bytes: 10_000,
            sniff_bytes: 64 * 1024,
            request_timeout_secs: 600,
            connect_timeout_secs: 30,
        }
    }
}

impl FetchPolicy {
    /// Bytes to buffer up front. A short HTML page has to be seen in full to
    /// be recognised as one.
    pub fn sniff_limit(&self) -> usize {
        self.sniff_bytes.max(self.html_error_page_bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    AlreadyPresent,
    Downloaded { url: String, bytes: u64 },
}

pub struct AssetFetcher {
    client: Client,
    policy: FetchPolicy,
}

impl AssetFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(policy.connect_timeout_secs))
            .timeout(Duration::from_secs(policy.request_timeout_secs))
            .user_agent(concat!("dfu-serve/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Makes sure `destination` exists, downloading it from `source` if needed.
    ///
    /// An existing file short-circuits everything, including URL validation.
    pub async fn ensure(&self, source: &AssetSource, destination: &Path) -> Result<FetchOutcome> {
        if tokio::fs::try_exists(destination).await? {
            tracing::info!("{} already present: {:?}", source.description, destination);
            return Ok(FetchOutcome::AlreadyPresent);
        }

        if !source.is_configured() {
            return Err(Error::SourceNotConfigured(source.description.clone()));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("Downloading {} from {}", source.description, source.url);

        let candidates = resolver::resolve(&source.url);
        match self.fetch(&candidates, destination).await {
            Ok(outcome) => {
                tracing::info!("{} downloaded to {:?}", source.description, destination);
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!("Failed to download {}: {}", source.description, e);
                Err(e)
            }
        }
    }

    /// Tries each candidate in order until one produces a plausible artifact.
    ///
    /// Bytes go to a `.part` file next to `destination` and are renamed into
    /// place only once validated, so a failed fetch leaves nothing behind.
    pub async fn fetch(&self, candidates: &[DownloadCandidate], destination: &Path) -> Result<FetchOutcome> {
        if candidates.is_empty() {
            return Err(Error::DownloadFailed("No download candidates".to_string()));
        }

        let staging = staging_path(destination);
        let mut failures = Vec::with_capacity(candidates.len());

        for (attempt, candidate) in candidates.iter().enumerate() {
            tracing::info!("Attempt {}/{}: {}", attempt + 1, candidates.len(), candidate.url);

            match self.fetch_candidate(candidate, &staging, destination).await {
                Ok(bytes) => {
                    tracing::info!("Download succeeded: {} bytes", bytes);
                    return Ok(FetchOutcome::Downloaded {
                        url: candidate.url.clone(),
                        bytes,
                    });
                }
                Err(e) => {
                    tracing::warn!("Attempt {} failed: {}", attempt + 1, e);
                    discard(&staging).await;
                    failures.push(format!("{}: {}", candidate.url, e));
                }
            }
        }

        Err(Error::DownloadFailed(format!(
            "all {} candidates failed [{}]",
            candidates.len(),
            failures.join("; ")
        )))
    }

    async fn fetch_candidate(
        &self,
        candidate: &DownloadCandidate,
        staging: &Path,
        destination: &Path,
    ) -> Result<u64> {
        let response = self.get(&candidate.url).await?;
        let final_url = response.url().to_string();
        let mut html = is_html(&response);
        let mut stream = Box::pin(response.bytes_stream());
        let (mut head, mut exhausted) = read_prefix(&mut stream, self.policy.sniff_limit()).await?;

        if let Some(rule) = candidate.confirm {
            if html && rule.is_interstitial(&final_url, &head) {
                let token = rule.extract_token(&head).ok_or_else(|| {
                    Error::DownloadFailed("confirmation page without a token".to_string())
                })?;
                tracing::info!(
                    "Confirmation page detected, retrying with token {}...",
                    &token[..token.len().min(10)]
                );

                let response = self.get(&rule.follow_up_url(&candidate.url, &token)).await?;
                html = is_html(&response);
                stream = Box::pin(response.bytes_stream());
                (head, exhausted) = read_prefix(&mut stream, self.policy.sniff_limit()).await?;
            }
        }

        if html && exhausted && head.len() < self.policy.html_error_page_bytes {
            return Err(Error::DownloadFailed(format!(
                "received a {} byte HTML page instead of the artifact",
                head.len()
            )));
        }

        let mut file = tokio::fs::File::create(staging).await?;
        file.write_all(&head).await?;
        if !exhausted {
            while let Some(chunk) = stream.next().await {
                file.write_all(chunk?.as_ref()).await?;
            }
        }
        file.flush().await?;
        drop(file);

        let size = tokio::fs::metadata(staging).await?.len();
        if size <= self.policy.min_asset_bytes {
            return Err(Error::DownloadFailed(format!(
                "file too small: {} bytes (need more than {})",
                size, self.policy.min_asset_bytes
            )));
        }

        tokio::fs::rename(staging, destination).await?;
        Ok(size)
    }

    async fn get(&self, url: &str) -> Result<Response> {
        Ok(self.client.get(url).send().await?.error_for_status()?)
    }
}

fn is_html(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

/// Buffers up to `limit` bytes. The flag is true when the stream ended first.
async fn read_prefix<S, B>(stream: &mut S, limit: usize) -> Result<(Vec<u8>, bool)>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut head = Vec::new();
    while head.len() < limit {
        match stream.next().await {
            Some(chunk) => head.extend_from_slice(chunk?.as_ref()),
            None => return Ok((head, true)),
        }
    }
    Ok((head, false))
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partial file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove partial file {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn staging_file_sits_next_to_destination() {
        let staging = staging_path(Path::new("/data/models/detector.weights"));
        assert_eq!(staging, PathBuf::from("/data/models/detector.weights.part"));
    }

    #[tokio::test]
    async fn prefix_reports_exhaustion() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![Ok(b"abc".to_vec()), Ok(b"def".to_vec())];
        let mut short = stream::iter(chunks);
        let (head, exhausted) = read_prefix(&mut short, 1024).await.unwrap();
        assert_eq!(head, b"abcdef");
        assert!(exhausted);

        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![Ok(vec![0u8; 8]), Ok(vec![1u8; 8]), Ok(vec![2u8; 8])];
        let mut long = stream::iter(chunks);
        let (head, exhausted) = read_prefix(&mut long, 10).await.unwrap();
        assert_eq!(head.len(), 16);
        assert!(!exhausted);
        assert_eq!(long.next().await.unwrap().unwrap(), vec![2u8; 8]);
    }

    #[test]
    fn sniff_window_covers_error_page_threshold() {
        let policy = FetchPolicy {
            sniff_bytes: 16,
            html_error_page_bytes: 4096,
            ..FetchPolicy::default()
        };
        assert_eq!(policy.sniff_limit(), 4096);
        assert_eq!(FetchPolicy::default().sniff_limit(), 64 * 1024);
    }

    #[tokio::test]
    async fn existing_destination_skips_unconfigured_source() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("classifier.weights");
        std::fs::write(&destination, b"weights").unwrap();

        let fetcher = AssetFetcher::new(FetchPolicy::default()).unwrap();
        let outcome = fetcher
            .ensure(&AssetSource::new("not a url", "classifier"), &destination)
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = AssetFetcher::new(FetchPolicy::default()).unwrap();

        let err = fetcher
            .ensure(&AssetSource::none("classifier"), &dir.path().join("classifier.weights"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SourceNotConfigured(_)));
    }
}
