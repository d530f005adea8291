//! HTTP front end
//!
//! A thin shell over the coordinator: it parses crates.io-shaped download
//! paths, hands the request to the cache engine, and streams the resulting
//! artifact back. Also hosts the background sweep task.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::cache::artifact::ArtifactStore;
use crate::cache::coordinator::{
    ArtifactRequest, CachePolicy, Coordinator, ServeStatus, VersionSelector,
};
use crate::cache::current_timestamp_ms;
use crate::cache::error::{ProxyError, RefreshError};
use crate::cache::inflight::InFlightTable;
use crate::cache::sweeper::Sweeper;
use crate::cache::versions::VersionRegistry;
use crate::config::{Config, SWEEP_INTERVAL_SECS};
use crate::upstream::{CratesIoFetcher, UpstreamFetcher};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<ArtifactStore>,
}

#[derive(Debug, Deserialize)]
struct RefreshParams {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
struct PackageInfo {
    name: String,
    latest: Option<String>,
    versions: Vec<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/crates/:package", get(package_info))
        .route("/api/v1/crates/:package/:version/download", get(download))
        .with_state(state)
}

async fn download(
    State(state): State<AppState>,
    Path((package, version)): Path<(String, String)>,
    Query(params): Query<RefreshParams>,
) -> Response {
    let selector = if version == "latest" {
        VersionSelector::Latest
    } else {
        VersionSelector::Explicit(version)
    };
    let request = ArtifactRequest {
        package,
        selector,
        force_refresh: params.refresh,
    };

    let served = match state.coordinator.handle(request).await {
        Ok(served) => served,
        Err(err) => return error_response(err),
    };

    let bytes = match state.store.read_bytes(&served.entry) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("failed to read cached artifact: {}", err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "cache read failed").into_response();
        }
    };

    let cache_status = match served.status {
        ServeStatus::Hit => "HIT",
        ServeStatus::Refreshed => "MISS",
    };
    debug!(
        "serving {}@{} ({}, {} bytes)",
        served.entry.package, served.entry.version, cache_status, bytes.len()
    );

    (
        [
            (header::CONTENT_TYPE, "application/gzip"),
            (header::HeaderName::from_static("x-cache"), cache_status),
        ],
        bytes,
    )
        .into_response()
}

async fn package_info(
    State(state): State<AppState>,
    Path(package): Path<String>,
    Query(params): Query<RefreshParams>,
) -> Response {
    match state
        .coordinator
        .fresh_record(&package, params.refresh, current_timestamp_ms())
        .await
    {
        Ok(record) => Json(PackageInfo {
            name: record.package,
            latest: record.latest,
            versions: record.versions,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: ProxyError) -> Response {
    let status = match &err {
        ProxyError::Refresh(RefreshError::NotFoundUpstream(_)) => StatusCode::NOT_FOUND,
        ProxyError::Refresh(RefreshError::Transport(_)) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

/// Build all shared components and serve until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(ArtifactStore::new(&config.cache.storage_root)?);
    let versions = Arc::new(VersionRegistry::new(&config.db_path())?);
    let fetcher: Arc<dyn UpstreamFetcher> = Arc::new(CratesIoFetcher::new(
        &config.upstream.registry_url,
        &config.user_agent.value,
        config.upstream.proxy_url.as_deref(),
    )?);
    let artifact_flights = Arc::new(InFlightTable::new());

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&store),
        Arc::clone(&versions),
        fetcher,
        Arc::clone(&artifact_flights),
        CachePolicy {
            ttl_artifact_ms: config.ttl_artifact_ms(),
            ttl_version_ms: config.ttl_version_ms(),
            stale_on_upstream_error: config.cache.stale_on_upstream_error,
        },
    ));

    let sweeper = Sweeper::new(
        Arc::clone(&store),
        versions,
        artifact_flights,
        config.ttl_artifact_ms(),
        config.ttl_version_ms(),
    );
    spawn_sweep_task(sweeper);

    let app = build_router(AppState { coordinator, store });
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!("listening on {}", config.server.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_sweep_task(sweeper: Sweeper) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

        loop {
            interval.tick().await;
            match sweeper.sweep(current_timestamp_ms()) {
                Ok(report) if report.artifacts_removed + report.records_removed > 0 => {
                    info!(
                        "periodic sweep removed {} artifacts, {} records",
                        report.artifacts_removed, report.records_removed
                    );
                }
                Ok(_) => debug!("periodic sweep found nothing expired"),
                Err(e) => error!("periodic sweep failed: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::checksum::sha256_hex;
    use crate::upstream::{ArtifactPayload, FetchError, MockUpstreamFetcher};

    const HOUR_MS: i64 = 3_600_000;

    fn app(fetcher: MockUpstreamFetcher) -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path().join("cache")).unwrap());
        let versions = Arc::new(VersionRegistry::in_memory().unwrap());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            versions,
            Arc::new(fetcher),
            Arc::new(InFlightTable::new()),
            CachePolicy {
                ttl_artifact_ms: HOUR_MS,
                ttl_version_ms: HOUR_MS,
                stale_on_upstream_error: false,
            },
        ));
        let router = build_router(AppState { coordinator, store });
        (dir, router)
    }

    fn payload(bytes: &[u8]) -> ArtifactPayload {
        ArtifactPayload {
            bytes: bytes.to_vec(),
            checksum: sha256_hex(bytes),
        }
    }

    #[tokio::test]
    async fn download_misses_then_hits() {
        let mut fetcher = MockUpstreamFetcher::new();
        fetcher
            .expect_fetch_artifact()
            .times(1)
            .returning(|_, _| Ok(payload(b"crate-bytes")));
        let (_dir, router) = app(fetcher);

        let first = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/crates/serde/1.0.0/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
        let body = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"crate-bytes");

        let second = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/crates/serde/1.0.0/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    }

    #[tokio::test]
    async fn download_latest_resolves_through_version_registry() {
        let mut fetcher = MockUpstreamFetcher::new();
        fetcher
            .expect_list_versions()
            .times(1)
            .returning(|_| Ok(vec!["0.9.0".to_string(), "1.2.0".to_string()]));
        fetcher
            .expect_fetch_artifact()
            .times(1)
            .returning(|_, version| {
                assert_eq!(version, "1.2.0");
                Ok(payload(b"latest-bytes"))
            });
        let (_dir, router) = app(fetcher);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/crates/serde/latest/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_package_maps_to_404() {
        let mut fetcher = MockUpstreamFetcher::new();
        fetcher
            .expect_list_versions()
            .times(1)
            .returning(|_| Err(FetchError::NotFound("ghost".to_string())));
        let (_dir, router) = app(fetcher);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/crates/ghost/latest/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn package_info_returns_versions_and_latest() {
        let mut fetcher = MockUpstreamFetcher::new();
        fetcher
            .expect_list_versions()
            .times(1)
            .returning(|_| Ok(vec!["1.0.0".to_string(), "1.1.0".to_string()]));
        let (_dir, router) = app(fetcher);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/crates/serde")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["name"], "serde");
        assert_eq!(info["latest"], "1.1.0");
        assert_eq!(info["versions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_maps_to_bad_gateway() {
        let mut fetcher = MockUpstreamFetcher::new();
        fetcher
            .expect_fetch_artifact()
            .times(1)
            .returning(|_, _| Err(FetchError::InvalidResponse("boom".to_string())));
        let (_dir, router) = app(fetcher);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/crates/serde/1.0.0/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
