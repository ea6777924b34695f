pub mod fetcher;
pub mod resolver;

pub use fetcher::{AssetFetcher, FetchOutcome, FetchPolicy};
pub use resolver::{resolve, ConfirmRule, DownloadCandidate};

use serde::Serialize;

/// A configured remote location for one model artifact.
///
/// An empty `url` means no remote source is configured; callers go straight
/// to whatever is already on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetSource {
    pub url: String,
    pub description: String,
}

impl AssetSource {
    pub fn new(url: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            description: description.into(),
        }
    }

    pub fn none(description: impl Into<String>) -> Self {
        Self::new(String::new(), description)
    }

    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}
