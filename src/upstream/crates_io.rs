//! crates.io API implementation of the upstream fetcher

use serde::Deserialize;
use tracing::{debug, warn};

use crate::checksum::sha256_hex;
use crate::upstream::{ArtifactPayload, FetchError, UpstreamFetcher};

/// Response from the crates.io versions API
#[derive(Debug, Deserialize)]
struct CrateResponse {
    versions: Vec<VersionJson>,
}

#[derive(Debug, Deserialize)]
struct VersionJson {
    num: String,
    #[serde(default)]
    yanked: bool,
}

/// Fetcher for the crates.io registry API, optionally routed through a
/// chained HTTP/SOCKS proxy and presenting a configurable user-agent.
pub struct CratesIoFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl CratesIoFetcher {
    pub fn new(
        base_url: &str,
        user_agent: &str,
        proxy_url: Option<&str>,
    ) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent);
        if let Some(proxy_url) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl UpstreamFetcher for CratesIoFetcher {
    async fn list_versions(&self, package: &str) -> Result<Vec<String>, FetchError> {
        let url = format!("{}/api/v1/crates/{}", self.base_url, package);
        debug!("listing versions from {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(package.to_string()));
        }

        if !status.is_success() {
            warn!("crates.io returned status {}: {}", status, url);
            return Err(FetchError::InvalidResponse(format!(
                "unexpected status: {status}"
            )));
        }

        let info: CrateResponse = response.json().await.map_err(|e| {
            warn!("failed to parse crates.io response: {}", e);
            FetchError::InvalidResponse(e.to_string())
        })?;

        Ok(info
            .versions
            .into_iter()
            .filter(|v| !v.yanked)
            .map(|v| v.num)
            .collect())
    }

    async fn fetch_artifact(
        &self,
        package: &str,
        version: &str,
    ) -> Result<ArtifactPayload, FetchError> {
        let url = format!(
            "{}/api/v1/crates/{}/{}/download",
            self.base_url, package, version
        );
        debug!("downloading artifact from {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(format!("{package}@{version}")));
        }

        if !status.is_success() {
            warn!("crates.io returned status {}: {}", status, url);
            return Err(FetchError::InvalidResponse(format!(
                "unexpected status: {status}"
            )));
        }

        let bytes = response.bytes().await?.to_vec();
        let checksum = sha256_hex(&bytes);

        Ok(ArtifactPayload { bytes, checksum })
    }
}
