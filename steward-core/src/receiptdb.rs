use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rusqlite::{params, Connection};
use thiserror::Error;

use steward_types::Version;

#[derive(Debug, Error)]
pub enum ReceiptDbError {
    #[error("Database error")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not read host receipts")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("IO error at {}", .1.display())]
    Io(#[source] std::io::Error, PathBuf),
}

/// Read-only view of the host's package receipts, as the probe needs it.
pub trait ReceiptQuery {
    /// Installed version for a package id, if the package is present.
    fn installed_version(&self, packageid: &str) -> Option<Version>;
}

/// One file laid down by an installed package, with recorded ownership.
#[derive(Debug, Clone)]
pub struct ReceiptPath {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// One host package receipt, as enumerated by the platform adapter.
#[derive(Debug, Clone)]
pub struct HostReceipt {
    pub packageid: String,
    pub version: Version,
    pub install_location: String,
    pub paths: Vec<ReceiptPath>,
}

/// Adapter over the platform's native receipt registry. The native
/// implementation shells out to the package utility; tests provide a fake.
pub trait ReceiptSource {
    fn receipts(&self) -> Result<Vec<HostReceipt>, Box<dyn std::error::Error + Send + Sync>>;

    /// Modification time of the newest source receipt, for staleness checks.
    fn newest_receipt_time(&self) -> Option<SystemTime>;

    /// Remove the receipt for a package id from the host registry.
    fn forget(&self, packageid: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Local relational mirror of the host's package receipts:
/// which packages are installed, and which filesystem paths each lays
/// claim to. Receipt-based removal needs the reverse direction — "which
/// paths belong to these packages and nobody else" — which the native
/// registry cannot answer directly.
pub struct PackageDb {
    conn: Connection,
    db_path: PathBuf,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pkgs (
    pkg_key INTEGER PRIMARY KEY AUTOINCREMENT,
    packageid VARCHAR NOT NULL,
    version VARCHAR NOT NULL,
    install_location VARCHAR NOT NULL
);
CREATE TABLE IF NOT EXISTS paths (
    path_key INTEGER PRIMARY KEY AUTOINCREMENT,
    path VARCHAR NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS pkgs_paths (
    pkg_key INTEGER NOT NULL,
    path_key INTEGER NOT NULL,
    uid INTEGER,
    gid INTEGER,
    mode INTEGER
);
CREATE INDEX IF NOT EXISTS idx_paths_path ON paths (path);
CREATE INDEX IF NOT EXISTS idx_pkgs_packageid ON pkgs (packageid);
CREATE INDEX IF NOT EXISTS idx_pkgs_paths_pkg ON pkgs_paths (pkg_key);
CREATE INDEX IF NOT EXISTS idx_pkgs_paths_path ON pkgs_paths (path_key);
";

impl PackageDb {
    pub fn open(db_path: &Path) -> Result<PackageDb, ReceiptDbError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(PackageDb {
            conn,
            db_path: db_path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<PackageDb, ReceiptDbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(PackageDb {
            conn,
            db_path: PathBuf::new(),
        })
    }

    /// Whether the database is older than the newest source receipt and
    /// must be rebuilt before removal queries can be trusted.
    pub fn is_stale(&self, source: &dyn ReceiptSource) -> bool {
        let db_mtime = std::fs::metadata(&self.db_path)
            .and_then(|meta| meta.modified())
            .ok();
        match (db_mtime, source.newest_receipt_time()) {
            (Some(db), Some(src)) => src > db,
            (None, Some(_)) => true,
            _ => self.package_count().unwrap_or(0) == 0,
        }
    }

    pub fn package_count(&self) -> Result<u64, ReceiptDbError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pkgs", params![], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Rebuilds the mirror from the host's receipts. Idempotent and
    /// resumable: packages already present are skipped, packages no longer
    /// on the host are dropped.
    pub fn rebuild(&mut self, source: &dyn ReceiptSource) -> Result<(), ReceiptDbError> {
        let receipts = source.receipts().map_err(ReceiptDbError::Source)?;
        log::info!("Rebuilding package path database ({} receipts)", receipts.len());

        let host_ids: Vec<&str> = receipts.iter().map(|r| r.packageid.as_str()).collect();

        // Drop packages that vanished from the host.
        let known: Vec<(i64, String)> = {
            let mut stmt = self.conn.prepare("SELECT pkg_key, packageid FROM pkgs")?;
            let rows = stmt.query_map(params![], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for (pkg_key, packageid) in &known {
            if !host_ids.contains(&packageid.as_str()) {
                self.remove_pkg_rows(*pkg_key)?;
            }
        }

        for receipt in &receipts {
            if self.pkg_key(&receipt.packageid)?.is_some() {
                continue;
            }
            self.insert_receipt(receipt)?;
        }

        Ok(())
    }

    fn insert_receipt(&mut self, receipt: &HostReceipt) -> Result<(), ReceiptDbError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO pkgs (packageid, version, install_location) VALUES (?1, ?2, ?3)",
            params![
                receipt.packageid,
                receipt.version.to_string(),
                receipt.install_location
            ],
        )?;
        let pkg_key = tx.last_insert_rowid();

        {
            let mut find_path = tx.prepare("SELECT path_key FROM paths WHERE path = ?1")?;
            let mut add_path = tx.prepare("INSERT INTO paths (path) VALUES (?1)")?;
            let mut link = tx.prepare(
                "INSERT INTO pkgs_paths (pkg_key, path_key, uid, gid, mode) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for entry in &receipt.paths {
                let existing: Option<i64> = find_path
                    .query_row(params![entry.path], |row| row.get(0))
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let path_key = match existing {
                    Some(key) => key,
                    None => {
                        add_path.execute(params![entry.path])?;
                        tx.last_insert_rowid()
                    }
                };
                link.execute(params![
                    pkg_key,
                    path_key,
                    entry.uid,
                    entry.gid,
                    entry.mode
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn pkg_key(&self, packageid: &str) -> Result<Option<i64>, ReceiptDbError> {
        let key = self
            .conn
            .query_row(
                "SELECT pkg_key FROM pkgs WHERE packageid = ?1",
                params![packageid],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(key)
    }

    fn remove_pkg_rows(&self, pkg_key: i64) -> Result<(), ReceiptDbError> {
        self.conn
            .execute("DELETE FROM pkgs WHERE pkg_key = ?1", params![pkg_key])?;
        self.conn.execute(
            "DELETE FROM pkgs_paths WHERE pkg_key = ?1",
            params![pkg_key],
        )?;
        // Orphaned paths rows are harmless; they are pruned on rebuild.
        Ok(())
    }

    /// Filesystem paths referenced by the given package ids and by no other
    /// installed package — the set receipt-based removal may delete.
    /// Returned as absolute paths, deepest first, ready for bottom-up
    /// deletion.
    pub fn paths_unique_to(&self, packageids: &[&str]) -> Result<Vec<PathBuf>, ReceiptDbError> {
        if packageids.is_empty() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut locations = Vec::new();
        for packageid in packageids {
            if let Some(key) = self.pkg_key(packageid)? {
                keys.push(key.to_string());
                let location: String = self.conn.query_row(
                    "SELECT install_location FROM pkgs WHERE pkg_key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                locations.push(location);
            } else {
                log::warn!("No receipt for {} in package database", packageid);
            }
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let key_list = keys.join(",");
        let sql = format!(
            "SELECT paths.path, pkgs.install_location \
             FROM paths \
             JOIN pkgs_paths ON paths.path_key = pkgs_paths.path_key \
             JOIN pkgs ON pkgs.pkg_key = pkgs_paths.pkg_key \
             WHERE pkgs_paths.pkg_key IN ({keys}) \
             AND paths.path_key NOT IN \
                 (SELECT path_key FROM pkgs_paths WHERE pkg_key NOT IN ({keys}))",
            keys = key_list
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut paths: Vec<PathBuf> = rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(path, location)| {
                let mut base = PathBuf::from(if location.is_empty() {
                    "/".to_string()
                } else {
                    location
                });
                base.push(path.trim_start_matches('/'));
                base
            })
            .collect();

        paths.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| b.cmp(a))
        });
        paths.dedup();
        Ok(paths)
    }

    /// Forgets the given packages: host registry first, then our mirror.
    pub fn forget(
        &mut self,
        packageids: &[&str],
        source: &dyn ReceiptSource,
    ) -> Result<(), ReceiptDbError> {
        for packageid in packageids {
            source.forget(packageid).map_err(ReceiptDbError::Source)?;
            if let Some(key) = self.pkg_key(packageid)? {
                self.remove_pkg_rows(key)?;
            }
        }
        Ok(())
    }
}

impl ReceiptQuery for PackageDb {
    fn installed_version(&self, packageid: &str) -> Option<Version> {
        self.conn
            .query_row(
                "SELECT version FROM pkgs WHERE packageid = ?1",
                params![packageid],
                |row| row.get::<_, String>(0),
            )
            .ok()
            .map(|raw| Version::new(&raw))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory receipt registry for tests.
    #[derive(Default)]
    pub struct FakeReceipts {
        pub receipts: Vec<HostReceipt>,
        pub forgotten: std::cell::RefCell<Vec<String>>,
    }

    impl FakeReceipts {
        pub fn with(entries: &[(&str, &str)]) -> FakeReceipts {
            let receipts = entries
                .iter()
                .map(|(id, vers)| HostReceipt {
                    packageid: id.to_string(),
                    version: Version::new(vers),
                    install_location: "/".to_string(),
                    paths: Vec::new(),
                })
                .collect();
            FakeReceipts {
                receipts,
                forgotten: Default::default(),
            }
        }
    }

    impl ReceiptSource for FakeReceipts {
        fn receipts(
            &self,
        ) -> Result<Vec<HostReceipt>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.receipts.clone())
        }

        fn newest_receipt_time(&self) -> Option<SystemTime> {
            Some(SystemTime::now())
        }

        fn forget(
            &self,
            packageid: &str,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.forgotten.borrow_mut().push(packageid.to_string());
            Ok(())
        }
    }

    impl ReceiptQuery for FakeReceipts {
        fn installed_version(&self, packageid: &str) -> Option<Version> {
            self.receipts
                .iter()
                .find(|r| r.packageid == packageid)
                .map(|r| r.version.clone())
        }
    }

    fn path(p: &str, mode: u32) -> ReceiptPath {
        ReceiptPath {
            path: p.to_string(),
            uid: 0,
            gid: 0,
            mode,
        }
    }

    fn receipt(id: &str, location: &str, paths: Vec<ReceiptPath>) -> HostReceipt {
        HostReceipt {
            packageid: id.to_string(),
            version: Version::new("1.0"),
            install_location: location.to_string(),
            paths,
        }
    }

    #[test]
    fn test_rebuild_and_query() {
        let mut db = PackageDb::open_in_memory().unwrap();
        let source = FakeReceipts {
            receipts: vec![
                receipt(
                    "com.example.foo",
                    "/",
                    vec![
                        path("Applications/Foo.app", 0o755),
                        path("Library/Shared/common.dylib", 0o644),
                    ],
                ),
                receipt(
                    "com.example.bar",
                    "/",
                    vec![
                        path("Applications/Bar.app", 0o755),
                        path("Library/Shared/common.dylib", 0o644),
                    ],
                ),
            ],
            forgotten: Default::default(),
        };
        db.rebuild(&source).unwrap();
        assert_eq!(db.package_count().unwrap(), 2);

        // The shared dylib belongs to both packages, so it is not unique
        // to foo and must survive foo's removal.
        let unique = db.paths_unique_to(&["com.example.foo"]).unwrap();
        assert_eq!(unique, vec![PathBuf::from("/Applications/Foo.app")]);

        // Removing both packages frees the shared path too.
        let both = db
            .paths_unique_to(&["com.example.foo", "com.example.bar"])
            .unwrap();
        assert!(both.contains(&PathBuf::from("/Library/Shared/common.dylib")));
        assert_eq!(both.len(), 3);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let mut db = PackageDb::open_in_memory().unwrap();
        let source = FakeReceipts {
            receipts: vec![receipt("com.example.foo", "/", vec![path("usr/bin/foo", 0o755)])],
            forgotten: Default::default(),
        };
        db.rebuild(&source).unwrap();
        db.rebuild(&source).unwrap();
        assert_eq!(db.package_count().unwrap(), 1);
    }

    #[test]
    fn test_rebuild_drops_vanished_packages() {
        let mut db = PackageDb::open_in_memory().unwrap();
        let source = FakeReceipts {
            receipts: vec![
                receipt("com.example.foo", "/", vec![]),
                receipt("com.example.bar", "/", vec![]),
            ],
            forgotten: Default::default(),
        };
        db.rebuild(&source).unwrap();

        let source = FakeReceipts {
            receipts: vec![receipt("com.example.foo", "/", vec![])],
            forgotten: Default::default(),
        };
        db.rebuild(&source).unwrap();
        assert_eq!(db.package_count().unwrap(), 1);
        assert!(db.installed_version("com.example.bar").is_none());
    }

    #[test]
    fn test_forget() {
        let mut db = PackageDb::open_in_memory().unwrap();
        let source = FakeReceipts {
            receipts: vec![receipt("com.example.foo", "/", vec![])],
            forgotten: Default::default(),
        };
        db.rebuild(&source).unwrap();
        db.forget(&["com.example.foo"], &source).unwrap();
        assert_eq!(db.package_count().unwrap(), 0);
        assert_eq!(
            *source.forgotten.borrow(),
            vec!["com.example.foo".to_string()]
        );
    }

    #[test]
    fn test_paths_sorted_deepest_first() {
        let mut db = PackageDb::open_in_memory().unwrap();
        let source = FakeReceipts {
            receipts: vec![receipt(
                "com.example.foo",
                "/opt/foo",
                vec![
                    path("bin", 0o755),
                    path("bin/foo", 0o755),
                    path("share/doc/foo/README", 0o644),
                ],
            )],
            forgotten: Default::default(),
        };
        db.rebuild(&source).unwrap();
        let unique = db.paths_unique_to(&["com.example.foo"]).unwrap();
        assert_eq!(unique[0], PathBuf::from("/opt/foo/share/doc/foo/README"));
        assert_eq!(unique.last().unwrap(), &PathBuf::from("/opt/foo/bin"));
    }
}
