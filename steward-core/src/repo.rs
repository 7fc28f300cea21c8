pub mod file;
pub mod http;

use std::path::Path;
use std::time::SystemTime;

use thiserror::Error;

pub use file::FileRepo;
pub use http::HttpRepo;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Transport error for {0}")]
    Transport(String, #[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("IO error for {0}")]
    Io(String, #[source] std::io::Error),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }
}

/// Outcome of a conditional fetch.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The resource was downloaded to the destination path.
    Fetched,
    /// The cached copy is current; the destination was not written.
    NotModified,
}

/// Minimal read/write interface onto a software repository. The core
/// addresses everything by repository-relative path (`catalogs/<name>`,
/// `manifests/<name>`, `pkgs/<location>`, ...); transports beyond the
/// filesystem and HTTP pair live outside the core.
pub trait Repo {
    fn get(&self, relpath: &str) -> Result<Vec<u8>, RepoError>;

    fn put(&self, relpath: &str, data: &[u8]) -> Result<(), RepoError>;

    fn list(&self, prefix: &str) -> Result<Vec<String>, RepoError>;

    fn delete(&self, relpath: &str) -> Result<(), RepoError>;

    /// Stream `relpath` to `dest`. When `if_newer_than` is given, the
    /// transport may answer `NotModified` instead of transferring bytes;
    /// catalogs, manifests and pkginfo use this for revalidation. Installer
    /// payloads are verified by hash instead and fetch unconditionally.
    fn fetch_to_file(
        &self,
        relpath: &str,
        dest: &Path,
        if_newer_than: Option<SystemTime>,
    ) -> Result<FetchOutcome, RepoError>;
}

/// Refresh one cached repository document in place.
///
/// The cached copy's modification time is the revalidation hint. On a
/// transport failure with a cache present the stale copy is kept and
/// `Ok(false)` is returned so the caller can mark the run offline.
pub fn refresh_cached(
    repo: &dyn Repo,
    relpath: &str,
    cache_path: &Path,
) -> Result<bool, RepoError> {
    let cached_mtime = std::fs::metadata(cache_path)
        .and_then(|meta| meta.modified())
        .ok();

    match repo.fetch_to_file(relpath, cache_path, cached_mtime) {
        Ok(FetchOutcome::Fetched) => {
            log::debug!("Fetched {}", relpath);
            Ok(true)
        }
        Ok(FetchOutcome::NotModified) => {
            log::debug!("{} is up to date in local cache", relpath);
            Ok(true)
        }
        Err(e) if e.is_not_found() => Err(e),
        Err(e) => {
            if cache_path.exists() {
                log::warn!("Using cached copy of {}: {}", relpath, e);
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}
