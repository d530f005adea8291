//! Upstream fetch capability
//!
//! The coordinator only sees this trait: list the versions of a package,
//! download one artifact. Transport, proxy chaining and retry policy all
//! live behind it.

pub mod crates_io;

pub use crates_io::CratesIoFetcher;

#[cfg(test)]
use mockall::automock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("package not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Downloaded artifact bytes plus their digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPayload {
    pub bytes: Vec<u8>,
    pub checksum: String,
}

/// Trait for retrieving version listings and artifacts from upstream
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// Fetches all known versions for a package
    ///
    /// # Returns
    /// * `Ok(Vec<String>)` - version identifiers, yanked releases excluded
    /// * `Err(FetchError)` - if the fetch fails
    async fn list_versions(&self, package: &str) -> Result<Vec<String>, FetchError>;

    /// Downloads the artifact for one (package, version) pair
    async fn fetch_artifact(
        &self,
        package: &str,
        version: &str,
    ) -> Result<ArtifactPayload, FetchError>;
}
