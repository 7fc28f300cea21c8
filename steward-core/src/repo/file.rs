use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{FetchOutcome, Repo, RepoError};

/// Repository rooted at a local directory (or mounted file share). The
/// layout mirrors the served repository: `catalogs/`, `manifests/`,
/// `pkgsinfo/`, `pkgs/`, `icons/`.
pub struct FileRepo {
    root: PathBuf,
}

impl FileRepo {
    pub fn new<P: AsRef<Path>>(root: P) -> FileRepo {
        FileRepo {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, relpath: &str) -> PathBuf {
        // Relative paths come from manifests and pkginfo; refuse any
        // component that would escape the repository root.
        let mut path = self.root.clone();
        for part in relpath.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                continue;
            }
            path.push(part);
        }
        path
    }
}

impl Repo for FileRepo {
    fn get(&self, relpath: &str) -> Result<Vec<u8>, RepoError> {
        let path = self.full_path(relpath);
        if !path.exists() {
            return Err(RepoError::NotFound(relpath.to_string()));
        }
        fs::read(&path).map_err(|e| RepoError::Io(relpath.to_string(), e))
    }

    fn put(&self, relpath: &str, data: &[u8]) -> Result<(), RepoError> {
        let path = self.full_path(relpath);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RepoError::Io(relpath.to_string(), e))?;
        }
        fs::write(&path, data).map_err(|e| RepoError::Io(relpath.to_string(), e))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RepoError> {
        let dir = self.full_path(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut stack = vec![dir.clone()];
        while let Some(cur) = stack.pop() {
            let entries =
                fs::read_dir(&cur).map_err(|e| RepoError::Io(prefix.to_string(), e))?;
            for entry in entries {
                let entry = entry.map_err(|e| RepoError::Io(prefix.to_string(), e))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, relpath: &str) -> Result<(), RepoError> {
        let path = self.full_path(relpath);
        if !path.exists() {
            return Err(RepoError::NotFound(relpath.to_string()));
        }
        fs::remove_file(&path).map_err(|e| RepoError::Io(relpath.to_string(), e))
    }

    fn fetch_to_file(
        &self,
        relpath: &str,
        dest: &Path,
        if_newer_than: Option<SystemTime>,
    ) -> Result<FetchOutcome, RepoError> {
        let src = self.full_path(relpath);
        if !src.exists() {
            return Err(RepoError::NotFound(relpath.to_string()));
        }

        if let Some(threshold) = if_newer_than {
            let src_mtime = fs::metadata(&src)
                .and_then(|meta| meta.modified())
                .map_err(|e| RepoError::Io(relpath.to_string(), e))?;
            if src_mtime <= threshold {
                return Ok(FetchOutcome::NotModified);
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RepoError::Io(relpath.to_string(), e))?;
        }
        fs::copy(&src, dest).map_err(|e| RepoError::Io(relpath.to_string(), e))?;
        Ok(FetchOutcome::Fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_repo() -> (tempfile::TempDir, FileRepo) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileRepo::new(tmp.path());
        (tmp, repo)
    }

    #[test]
    fn test_put_get_list_delete() {
        let (_tmp, repo) = make_repo();
        repo.put("catalogs/production", b"hello").unwrap();
        assert_eq!(repo.get("catalogs/production").unwrap(), b"hello");
        assert_eq!(
            repo.list("catalogs").unwrap(),
            vec!["catalogs/production".to_string()]
        );
        repo.delete("catalogs/production").unwrap();
        assert!(repo.get("catalogs/production").unwrap_err().is_not_found());
    }

    #[test]
    fn test_fetch_not_modified() {
        let (tmp, repo) = make_repo();
        repo.put("manifests/site_default", b"manifest").unwrap();

        let dest = tmp.path().join("cache").join("site_default");
        assert_eq!(
            repo.fetch_to_file("manifests/site_default", &dest, None)
                .unwrap(),
            FetchOutcome::Fetched
        );

        // A hint in the future means the cache is current.
        let later = SystemTime::now() + std::time::Duration::from_secs(60);
        assert_eq!(
            repo.fetch_to_file("manifests/site_default", &dest, Some(later))
                .unwrap(),
            FetchOutcome::NotModified
        );
    }

    #[test]
    fn test_path_traversal_neutralized() {
        let (_tmp, repo) = make_repo();
        repo.put("pkgs/a.pkg", b"payload").unwrap();
        // ".." components are dropped, so this stays inside the root.
        assert_eq!(repo.get("../pkgs/a.pkg").unwrap(), b"payload");
    }
}
