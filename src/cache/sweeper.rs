//! Maintenance sweeps over both stores
//!
//! Removes artifacts past their TTL (never ones a refresh is actively
//! replacing) and version records that are both expired and no longer
//! backed by any artifact. `stats` is read-only.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::artifact::{ArtifactEntry, ArtifactKey, ArtifactStore};
use crate::cache::error::SweepError;
use crate::cache::inflight::InFlightTable;
use crate::cache::versions::VersionRegistry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub artifacts_removed: u64,
    pub records_removed: u64,
    pub bytes_reclaimed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub fresh_entries: u64,
    pub stale_entries: u64,
    pub total_bytes: u64,
}

pub struct Sweeper {
    store: Arc<ArtifactStore>,
    versions: Arc<VersionRegistry>,
    artifact_flights: Arc<InFlightTable<ArtifactKey, ArtifactEntry>>,
    ttl_artifact_ms: i64,
    ttl_version_ms: i64,
}

impl Sweeper {
    pub fn new(
        store: Arc<ArtifactStore>,
        versions: Arc<VersionRegistry>,
        artifact_flights: Arc<InFlightTable<ArtifactKey, ArtifactEntry>>,
        ttl_artifact_ms: i64,
        ttl_version_ms: i64,
    ) -> Self {
        Self {
            store,
            versions,
            artifact_flights,
            ttl_artifact_ms,
            ttl_version_ms,
        }
    }

    /// Purge expired entries from both stores.
    pub fn sweep(&self, now_ms: i64) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport::default();

        for entry in self.store.list()? {
            if entry.is_fresh(self.ttl_artifact_ms, now_ms) {
                continue;
            }
            let key = entry.key();
            if self.artifact_flights.contains(&key) {
                debug!("skipping {}: refresh in flight", key);
                continue;
            }
            self.store.delete(&key.package, &key.version)?;
            report.artifacts_removed += 1;
            report.bytes_reclaimed += entry.size;
        }

        // Records go only once no artifact for the package remains
        for record in self.versions.list_records()? {
            if record.is_fresh(self.ttl_version_ms, now_ms) {
                continue;
            }
            if self.store.has_entries(&record.package)? {
                continue;
            }
            self.versions.delete(&record.package)?;
            report.records_removed += 1;
        }

        info!(
            "sweep removed {} artifacts, {} records, reclaimed {} bytes",
            report.artifacts_removed, report.records_removed, report.bytes_reclaimed
        );
        Ok(report)
    }

    /// Read-only snapshot of the artifact store.
    pub fn stats(&self, now_ms: i64) -> Result<CacheStats, SweepError> {
        let mut stats = CacheStats::default();

        for entry in self.store.list()? {
            stats.total_entries += 1;
            stats.total_bytes += entry.size;
            if entry.is_fresh(self.ttl_artifact_ms, now_ms) {
                stats.fresh_entries += 1;
            } else {
                stats.stale_entries += 1;
            }
        }

        Ok(stats)
    }
}
