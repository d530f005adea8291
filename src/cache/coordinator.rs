//! Request coordination
//!
//! For every (package, version-or-latest) request the coordinator
//! classifies the cache state as hit, stale or miss, collapses concurrent
//! refreshes for the same key into a single upstream fetch, and keeps the
//! artifact store and version registry consistent. It never mutates
//! storage directly; all writes go through the stores' atomic primitives.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cache::artifact::{ArtifactEntry, ArtifactKey, ArtifactStore};
use crate::cache::current_timestamp_ms;
use crate::cache::error::{ProxyError, RefreshError};
use crate::cache::inflight::{FlightTicket, InFlightTable};
use crate::cache::versions::{VersionRecord, VersionRegistry};
use crate::semver::max_version;
use crate::upstream::{FetchError, UpstreamFetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Explicit(String),
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub package: String,
    pub selector: VersionSelector,
    pub force_refresh: bool,
}

impl ArtifactRequest {
    pub fn explicit(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            selector: VersionSelector::Explicit(version.into()),
            force_refresh: false,
        }
    }

    pub fn latest(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            selector: VersionSelector::Latest,
            force_refresh: false,
        }
    }
}

/// How the returned artifact was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStatus {
    /// Served from cache without upstream contact
    Hit,
    /// Fetched (or adopted from an in-flight fetch) during this request
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub status: ServeStatus,
    pub entry: ArtifactEntry,
}

/// TTL and failure policy, fixed at startup
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl_artifact_ms: i64,
    pub ttl_version_ms: i64,
    pub stale_on_upstream_error: bool,
}

pub struct Coordinator {
    store: Arc<ArtifactStore>,
    versions: Arc<VersionRegistry>,
    fetcher: Arc<dyn UpstreamFetcher>,
    artifact_flights: Arc<InFlightTable<ArtifactKey, ArtifactEntry>>,
    version_flights: Arc<InFlightTable<String, VersionRecord>>,
    policy: CachePolicy,
}

impl Coordinator {
    pub fn new(
        store: Arc<ArtifactStore>,
        versions: Arc<VersionRegistry>,
        fetcher: Arc<dyn UpstreamFetcher>,
        artifact_flights: Arc<InFlightTable<ArtifactKey, ArtifactEntry>>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            store,
            versions,
            fetcher,
            artifact_flights,
            version_flights: Arc::new(InFlightTable::new()),
            policy,
        }
    }

    /// Resolve a request to a definitive artifact reference.
    pub async fn handle(&self, request: ArtifactRequest) -> Result<Served, ProxyError> {
        self.handle_at(request, current_timestamp_ms()).await
    }

    /// Like [`handle`](Self::handle) with an explicit clock reading, so
    /// freshness decisions can be pinned in tests and maintenance tools.
    pub async fn handle_at(
        &self,
        request: ArtifactRequest,
        now_ms: i64,
    ) -> Result<Served, ProxyError> {
        let version = self.resolve_version(&request, now_ms).await?;
        let key = ArtifactKey::new(request.package, version);

        if let Some(entry) = self.store.get(&key.package, &key.version)? {
            if entry.is_fresh(self.policy.ttl_artifact_ms, now_ms) {
                if self.store.verify(&entry)? {
                    debug!("cache hit for {}", key);
                    return Ok(Served {
                        status: ServeStatus::Hit,
                        entry,
                    });
                }
                warn!("checksum mismatch for {}, treating as miss", key);
            } else {
                debug!("cache entry for {} is stale", key);
            }
        }

        match self.refresh_artifact(&key, now_ms).await {
            Ok(entry) => Ok(Served {
                status: ServeStatus::Refreshed,
                entry,
            }),
            Err(err) => self.maybe_serve_stale(&key, err),
        }
    }

    /// Explicit versions pass through untouched; "latest" resolves against
    /// the version registry, refreshing the record when absent or expired.
    async fn resolve_version(
        &self,
        request: &ArtifactRequest,
        now_ms: i64,
    ) -> Result<String, ProxyError> {
        match &request.selector {
            VersionSelector::Explicit(version) => Ok(version.clone()),
            VersionSelector::Latest => {
                let record = self
                    .fresh_record(&request.package, request.force_refresh, now_ms)
                    .await?;
                record.latest.ok_or_else(|| {
                    RefreshError::NotFoundUpstream(request.package.clone()).into()
                })
            }
        }
    }

    /// A version record that satisfies the version TTL, refreshed through
    /// the per-package single-flight when stale, absent or forced.
    pub async fn fresh_record(
        &self,
        package: &str,
        force_refresh: bool,
        now_ms: i64,
    ) -> Result<VersionRecord, ProxyError> {
        if !force_refresh {
            if let Some(record) = self.versions.get_record(package)? {
                if record.is_fresh(self.policy.ttl_version_ms, now_ms) {
                    return Ok(record);
                }
                debug!("version record for {} is stale", package);
            }
        }

        let mut rx = match self.version_flights.join(&package.to_string()) {
            FlightTicket::Leader(rx) => {
                self.spawn_version_refresh(package.to_string(), now_ms);
                rx
            }
            FlightTicket::Waiter(rx) => {
                debug!("joining in-flight version refresh for {}", package);
                rx
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome.map_err(ProxyError::from),
            Err(_) => Err(ProxyError::RefreshAbandoned(package.to_string())),
        }
    }

    async fn refresh_artifact(
        &self,
        key: &ArtifactKey,
        now_ms: i64,
    ) -> Result<ArtifactEntry, ProxyError> {
        let mut rx = match self.artifact_flights.join(key) {
            FlightTicket::Leader(rx) => {
                self.spawn_artifact_refresh(key.clone(), now_ms);
                rx
            }
            FlightTicket::Waiter(rx) => {
                debug!("joining in-flight artifact refresh for {}", key);
                rx
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome.map_err(ProxyError::from),
            Err(_) => Err(ProxyError::RefreshAbandoned(key.to_string())),
        }
    }

    /// The refresh runs detached from the requesting caller, so a client
    /// disconnect never cancels a fetch other waiters depend on.
    fn spawn_artifact_refresh(&self, key: ArtifactKey, now_ms: i64) {
        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);
        let flights = Arc::clone(&self.artifact_flights);

        tokio::spawn(async move {
            let outcome = fetch_and_store(&store, fetcher.as_ref(), &key, now_ms).await;
            flights.complete(&key, outcome);
        });
    }

    fn spawn_version_refresh(&self, package: String, now_ms: i64) {
        let versions = Arc::clone(&self.versions);
        let fetcher = Arc::clone(&self.fetcher);
        let flights = Arc::clone(&self.version_flights);

        tokio::spawn(async move {
            let outcome = list_and_record(&versions, fetcher.as_ref(), &package, now_ms).await;
            flights.complete(&package, outcome);
        });
    }

    /// Stale-on-error is an explicit opt-in and applies to transport
    /// failures only; a package that is gone upstream stays an error.
    /// The stale entry still has to pass checksum verification.
    fn maybe_serve_stale(&self, key: &ArtifactKey, err: ProxyError) -> Result<Served, ProxyError> {
        if self.policy.stale_on_upstream_error
            && matches!(err, ProxyError::Refresh(RefreshError::Transport(_)))
        {
            if let Some(entry) = self.store.get(&key.package, &key.version)? {
                if self.store.verify(&entry)? {
                    warn!("upstream unavailable, serving stale entry for {}: {}", key, err);
                    return Ok(Served {
                        status: ServeStatus::Hit,
                        entry,
                    });
                }
                warn!("stale entry for {} fails checksum, not serving it", key);
            }
        }
        Err(err)
    }
}

async fn fetch_and_store(
    store: &ArtifactStore,
    fetcher: &dyn UpstreamFetcher,
    key: &ArtifactKey,
    now_ms: i64,
) -> Result<ArtifactEntry, RefreshError> {
    info!("fetching {} from upstream", key);

    let payload = fetcher
        .fetch_artifact(&key.package, &key.version)
        .await
        .map_err(|e| refresh_error(&key.to_string(), e))?;

    store
        .put(
            &key.package,
            &key.version,
            &payload.bytes,
            &payload.checksum,
            now_ms,
        )
        .map_err(|e| {
            error!("failed to store {}: {}", key, e);
            RefreshError::StoreWrite(e.to_string())
        })
}

async fn list_and_record(
    registry: &VersionRegistry,
    fetcher: &dyn UpstreamFetcher,
    package: &str,
    now_ms: i64,
) -> Result<VersionRecord, RefreshError> {
    info!("refreshing version list for {}", package);

    let versions = fetcher
        .list_versions(package)
        .await
        .map_err(|e| refresh_error(package, e))?;

    if versions.is_empty() {
        return Err(RefreshError::NotFoundUpstream(package.to_string()));
    }

    let latest = max_version(&versions);

    registry
        .upsert(package, &versions, latest.as_deref(), now_ms)
        .map_err(|e| {
            error!("failed to record versions for {}: {}", package, e);
            RefreshError::StoreWrite(e.to_string())
        })
}

fn refresh_error(subject: &str, err: FetchError) -> RefreshError {
    match err {
        FetchError::NotFound(_) => RefreshError::NotFoundUpstream(subject.to_string()),
        FetchError::Network(e) => RefreshError::Transport(e.to_string()),
        FetchError::InvalidResponse(msg) => RefreshError::Transport(msg),
    }
}
