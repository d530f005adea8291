//! Embedded version registry
//!
//! Records, per package, the known version set, the version currently
//! resolved as "latest", and a freshness timestamp that is independent
//! from artifact TTLs. Backed by sqlite so lookups survive restarts
//! without re-scanning the artifact tree.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::cache::error::RegistryDbError;

/// Known version state of one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub package: String,
    pub versions: Vec<String>,
    pub latest: Option<String>,
    pub refreshed_at: i64,
}

impl VersionRecord {
    pub fn is_fresh(&self, ttl_ms: i64, now_ms: i64) -> bool {
        now_ms - self.refreshed_at <= ttl_ms
    }
}

pub struct VersionRegistry {
    conn: Mutex<Connection>,
}

impl VersionRegistry {
    pub fn new(db_path: &Path) -> Result<Self, RegistryDbError> {
        info!("opening version registry at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.create_schema()?;

        Ok(registry)
    }

    /// In-memory registry, used by tests and one-shot maintenance commands.
    pub fn in_memory() -> Result<Self, RegistryDbError> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.create_schema()?;
        Ok(registry)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryDbError> {
        self.conn.lock().map_err(|_| RegistryDbError::LockPoisoned)
    }

    fn create_schema(&self) -> Result<(), RegistryDbError> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS packages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_name TEXT NOT NULL UNIQUE,
                latest TEXT,
                refreshed_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_refreshed_at ON packages(refreshed_at)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE,
                UNIQUE(package_id, version)
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_package_id ON versions(package_id)",
            [],
        )?;

        debug!("version registry schema ready");
        Ok(())
    }

    pub fn get_record(&self, package: &str) -> Result<Option<VersionRecord>, RegistryDbError> {
        let conn = self.lock_conn()?;

        let row = conn.query_row(
            "SELECT id, latest, refreshed_at FROM packages WHERE package_name = ?1",
            [package],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        );

        let (package_id, latest, refreshed_at) = match row {
            Ok(values) => values,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut stmt =
            conn.prepare("SELECT version FROM versions WHERE package_id = ?1 ORDER BY id")?;
        let versions = stmt
            .query_map([package_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(Some(VersionRecord {
            package: package.to_string(),
            versions,
            latest,
            refreshed_at,
        }))
    }

    /// Replace the record wholesale. `refreshed_at` is monotonic: under
    /// racing writers the larger timestamp wins, so a slow writer cannot
    /// move a record backwards in time.
    pub fn upsert(
        &self,
        package: &str,
        versions: &[String],
        latest: Option<&str>,
        now_ms: i64,
    ) -> Result<VersionRecord, RegistryDbError> {
        if let Some(latest) = latest {
            if !versions.iter().any(|v| v == latest) {
                return Err(RegistryDbError::LatestNotKnown {
                    package: package.to_string(),
                    latest: latest.to_string(),
                });
            }
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let rows_affected = tx.execute(
            r#"
            INSERT INTO packages (package_name, latest, refreshed_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(package_name) DO UPDATE SET
                latest = excluded.latest,
                refreshed_at = excluded.refreshed_at
            WHERE excluded.refreshed_at >= packages.refreshed_at
            "#,
            (package, latest, now_ms),
        )?;

        if rows_affected > 0 {
            let package_id: i64 = tx.query_row(
                "SELECT id FROM packages WHERE package_name = ?1",
                [package],
                |row| row.get(0),
            )?;

            tx.execute("DELETE FROM versions WHERE package_id = ?1", [package_id])?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO versions (package_id, version) VALUES (?1, ?2)")?;
                for version in versions {
                    stmt.execute((package_id, version))?;
                }
            }
            debug!("saved {} versions for {}", versions.len(), package);
        } else {
            debug!("upsert for {} lost to a newer writer, keeping record", package);
        }

        tx.commit()?;
        drop(conn);

        // Either our write or the newer one that beat us
        self.get_record(package)?
            .ok_or(RegistryDbError::Database(
                rusqlite::Error::QueryReturnedNoRows,
            ))
    }

    pub fn delete(&self, package: &str) -> Result<(), RegistryDbError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            DELETE FROM versions WHERE package_id IN
                (SELECT id FROM packages WHERE package_name = ?1)
            "#,
            [package],
        )?;
        tx.execute("DELETE FROM packages WHERE package_name = ?1", [package])?;

        tx.commit()?;
        Ok(())
    }

    /// Every record in the registry, for maintenance scans.
    pub fn list_records(&self) -> Result<Vec<VersionRecord>, RegistryDbError> {
        let names: Vec<String> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare("SELECT package_name FROM packages ORDER BY package_name")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?
        };

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = self.get_record(&name)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn registry() -> (TempDir, VersionRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = VersionRegistry::new(&dir.path().join("versions.db")).unwrap();
        (dir, registry)
    }

    fn versions(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn upsert_creates_record_with_latest() {
        let (_dir, registry) = registry();

        let record = registry
            .upsert("serde", &versions(&["1.0.0", "1.1.0"]), Some("1.1.0"), 1_000)
            .unwrap();

        assert_eq!(record.package, "serde");
        assert_eq!(record.versions, versions(&["1.0.0", "1.1.0"]));
        assert_eq!(record.latest, Some("1.1.0".to_string()));
        assert_eq!(record.refreshed_at, 1_000);
    }

    #[test]
    fn upsert_replaces_version_set_wholesale() {
        let (_dir, registry) = registry();

        registry
            .upsert("serde", &versions(&["1.0.0"]), Some("1.0.0"), 1_000)
            .unwrap();
        let record = registry
            .upsert("serde", &versions(&["1.1.0", "2.0.0"]), Some("2.0.0"), 2_000)
            .unwrap();

        assert_eq!(record.versions, versions(&["1.1.0", "2.0.0"]));
        assert_eq!(record.latest, Some("2.0.0".to_string()));
    }

    #[test]
    fn upsert_rejects_latest_outside_version_set() {
        let (_dir, registry) = registry();

        let result = registry.upsert("serde", &versions(&["1.0.0"]), Some("9.9.9"), 1_000);
        assert!(matches!(
            result,
            Err(RegistryDbError::LatestNotKnown { .. })
        ));
    }

    #[test]
    fn refreshed_at_never_moves_backwards() {
        let (_dir, registry) = registry();

        registry
            .upsert("serde", &versions(&["1.0.0", "1.1.0"]), Some("1.1.0"), 5_000)
            .unwrap();

        // A slower writer with an older timestamp arrives late and loses
        let record = registry
            .upsert("serde", &versions(&["1.0.0"]), Some("1.0.0"), 3_000)
            .unwrap();

        assert_eq!(record.refreshed_at, 5_000);
        assert_eq!(record.latest, Some("1.1.0".to_string()));
        assert_eq!(record.versions, versions(&["1.0.0", "1.1.0"]));
    }

    #[test]
    fn upsert_with_equal_timestamp_wins() {
        let (_dir, registry) = registry();

        registry
            .upsert("serde", &versions(&["1.0.0"]), Some("1.0.0"), 5_000)
            .unwrap();
        let record = registry
            .upsert("serde", &versions(&["1.0.0", "1.1.0"]), Some("1.1.0"), 5_000)
            .unwrap();

        assert_eq!(record.latest, Some("1.1.0".to_string()));
    }

    #[test]
    fn get_record_returns_none_for_unknown_package() {
        let (_dir, registry) = registry();
        assert!(registry.get_record("unknown").unwrap().is_none());
    }

    #[rstest]
    #[case(3_600_000, 1_000, 3_000_000, true)]
    #[case(3_600_000, 1_000, 3_601_001, false)]
    fn record_freshness_respects_ttl(
        #[case] ttl_ms: i64,
        #[case] refreshed_at: i64,
        #[case] now_ms: i64,
        #[case] expected: bool,
    ) {
        let (_dir, registry) = registry();
        let record = registry
            .upsert("serde", &versions(&["1.0.0"]), Some("1.0.0"), refreshed_at)
            .unwrap();
        assert_eq!(record.is_fresh(ttl_ms, now_ms), expected);
    }

    #[test]
    fn delete_removes_record_and_versions() {
        let (_dir, registry) = registry();
        registry
            .upsert("serde", &versions(&["1.0.0"]), Some("1.0.0"), 1_000)
            .unwrap();

        registry.delete("serde").unwrap();

        assert!(registry.get_record("serde").unwrap().is_none());
        assert!(registry.list_records().unwrap().is_empty());
    }

    #[test]
    fn list_records_returns_all_packages() {
        let (_dir, registry) = registry();
        registry
            .upsert("serde", &versions(&["1.0.0"]), Some("1.0.0"), 1_000)
            .unwrap();
        registry
            .upsert("tokio", &versions(&["1.49.0"]), Some("1.49.0"), 2_000)
            .unwrap();

        let records = registry.list_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].package, "serde");
        assert_eq!(records[1].package, "tokio");
    }

    #[test]
    fn records_survive_reopening_the_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("versions.db");

        {
            let registry = VersionRegistry::new(&db_path).unwrap();
            registry
                .upsert("serde", &versions(&["1.0.0"]), Some("1.0.0"), 1_000)
                .unwrap();
        }

        let reopened = VersionRegistry::new(&db_path).unwrap();
        let record = reopened.get_record("serde").unwrap().unwrap();
        assert_eq!(record.latest, Some("1.0.0".to_string()));
        assert_eq!(record.refreshed_at, 1_000);
    }
}
