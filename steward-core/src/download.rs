use std::path::{Path, PathBuf};
use std::time::Instant;

use sha2::{Digest as _, Sha256};

use steward_types::plan::{InstallPlan, ProblemItem};

use crate::repo::{Repo, RepoError};

/// Fetches the installer payloads for a finalized plan into the local
/// cache, verifying each by hash, and purges cache entries the plan no
/// longer references.
pub struct DownloadScheduler<'a> {
    repo: &'a dyn Repo,
    cache_dir: PathBuf,
}

/// Names that failed to download this run; the executor seeds its skipped
/// set with these so dependents are deferred too.
#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub failed: Vec<String>,
}

impl<'a> DownloadScheduler<'a> {
    pub fn new(repo: &'a dyn Repo, cache_dir: PathBuf) -> DownloadScheduler<'a> {
        DownloadScheduler { repo, cache_dir }
    }

    /// Downloads every planned install item. Items whose payload cannot be
    /// fetched or fails verification are dropped from the install list and
    /// recorded as problem items.
    pub fn run(&self, plan: &mut InstallPlan) -> DownloadSummary {
        let mut summary = DownloadSummary::default();
        let mut failed_indices = Vec::new();

        for (index, item) in plan.managed_installs.iter_mut().enumerate() {
            let location = match item.info.installer_item_location.clone() {
                Some(loc) => loc,
                None => {
                    // Script-only and metadata items carry no payload.
                    continue;
                }
            };
            let basename = item
                .info
                .installer_item_basename()
                .unwrap_or(&location)
                .to_string();
            let cache_path = self.cache_dir.join(&basename);

            match self.fetch_item(&location, &cache_path, item.info.installer_item_hash.as_deref())
            {
                Ok(throughput) => {
                    item.installer_item = Some(basename);
                    if let Some(kbps) = throughput {
                        item.download_kbytes_per_sec = Some(kbps);
                    }
                }
                Err(note) => {
                    log::warn!(
                        "Could not download {}: {}",
                        item.info.name_and_version(),
                        note
                    );
                    summary.failed.push(item.info.name.clone());
                    failed_indices.push(index);
                    plan.problem_items.push(ProblemItem {
                        name: item.info.name.clone(),
                        version: Some(item.info.version.clone()),
                        display_name: item.info.display_name.clone(),
                        note,
                    });
                }
            }
        }

        for index in failed_indices.into_iter().rev() {
            plan.managed_installs.remove(index);
        }

        self.purge_unreferenced(plan);
        summary
    }

    /// Fetches one payload into the cache, unless a verified copy is
    /// already present. Returns the observed throughput in kB/s for a real
    /// transfer, `None` for a cache hit.
    fn fetch_item(
        &self,
        location: &str,
        cache_path: &Path,
        expected_hash: Option<&str>,
    ) -> Result<Option<u64>, String> {
        if cache_path.exists() {
            match expected_hash {
                Some(hash) if file_sha256(cache_path).as_deref() == Some(hash) => {
                    log::debug!(
                        "{} is already in the cache and verified",
                        cache_path.display()
                    );
                    return Ok(None);
                }
                None => {
                    log::debug!("{} is already in the cache", cache_path.display());
                    return Ok(None);
                }
                Some(_) => {
                    log::info!(
                        "Cached {} does not match expected hash; refetching",
                        cache_path.display()
                    );
                }
            }
        }

        let relpath = format!("pkgs/{}", location.trim_start_matches('/'));
        let tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.cache_dir)
            .map_err(|e| format!("could not create temp file: {}", e))?;

        let started = Instant::now();
        match self.repo.fetch_to_file(&relpath, tmp.path(), None) {
            Ok(_) => {}
            Err(RepoError::NotFound(_)) => {
                return Err("installer item not found in repository".to_string());
            }
            Err(e) => return Err(format!("download failed: {}", e)),
        }
        let elapsed = started.elapsed();

        if let Some(expected) = expected_hash {
            let actual = file_sha256(tmp.path())
                .ok_or_else(|| "could not hash downloaded file".to_string())?;
            if !actual.eq_ignore_ascii_case(expected) {
                // The temp file is dropped with the handle.
                return Err("integrity check failed".to_string());
            }
        }

        let size = std::fs::metadata(tmp.path()).map(|m| m.len()).unwrap_or(0);
        tmp.persist(cache_path)
            .map_err(|e| format!("could not move download into cache: {}", e.error))?;

        let throughput = if elapsed.as_millis() > 0 {
            Some((size as u128 * 1000 / 1024 / elapsed.as_millis()) as u64)
        } else {
            None
        };
        log::info!(
            "Downloaded {} ({} bytes{})",
            cache_path.display(),
            size,
            throughput
                .map(|t| format!(", {} kB/s", t))
                .unwrap_or_default()
        );
        Ok(throughput)
    }

    /// Removes cache files no plan item references. This lets an
    /// administrator pull an item back by removing it from the manifest
    /// before it installs.
    fn purge_unreferenced(&self, plan: &InstallPlan) {
        let referenced = plan.referenced_cache_files();
        let entries = match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Could not scan cache directory: {}", e);
                return;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if referenced.iter().any(|r| *r == name) {
                continue;
            }
            log::info!("Removing {} from cache", name);
            if let Err(e) = std::fs::remove_file(entry.path()) {
                log::warn!("Could not remove {}: {}", name, e);
            }
        }
    }
}

/// Hex sha256 of a file's contents.
pub fn file_sha256(path: &Path) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.input(&data);
    Some(format!("{:x}", hasher.result()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::FileRepo;
    use steward_types::plan::PlanItem;
    use steward_types::{PkgInfo, Version};

    fn plan_item(name: &str, location: &str, hash: Option<String>) -> PlanItem {
        PlanItem::new(
            PkgInfo::builder()
                .name(name)
                .version(Version::new("1.0"))
                .installer_item_location(Some(location.to_string()))
                .installer_item_hash(hash)
                .build(),
        )
    }

    fn sha256_hex(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.input(data);
        format!("{:x}", hasher.result())
    }

    struct Fixture {
        _repo_dir: tempfile::TempDir,
        cache_dir: tempfile::TempDir,
        repo: FileRepo,
    }

    impl Fixture {
        fn new() -> Fixture {
            let repo_dir = tempfile::tempdir().unwrap();
            let cache_dir = tempfile::tempdir().unwrap();
            let repo = FileRepo::new(repo_dir.path());
            Fixture {
                _repo_dir: repo_dir,
                cache_dir,
                repo,
            }
        }

        fn scheduler(&self) -> DownloadScheduler<'_> {
            DownloadScheduler::new(&self.repo, self.cache_dir.path().to_path_buf())
        }
    }

    #[test]
    fn test_fetch_verify_and_cache_hit() {
        let fixture = Fixture::new();
        fixture.repo.put("pkgs/apps/Foo-1.0.pkg", b"payload").unwrap();

        let mut plan = InstallPlan::default();
        plan.managed_installs.push(plan_item(
            "Foo",
            "apps/Foo-1.0.pkg",
            Some(sha256_hex(b"payload")),
        ));

        let summary = fixture.scheduler().run(&mut plan);
        assert!(summary.failed.is_empty());
        assert_eq!(
            plan.managed_installs[0].installer_item.as_deref(),
            Some("Foo-1.0.pkg")
        );
        assert!(fixture.cache_dir.path().join("Foo-1.0.pkg").exists());

        // Second run: verified cache hit, still referenced, not refetched.
        let summary = fixture.scheduler().run(&mut plan);
        assert!(summary.failed.is_empty());
        assert!(fixture.cache_dir.path().join("Foo-1.0.pkg").exists());
    }

    #[test]
    fn test_integrity_failure_drops_item() {
        let fixture = Fixture::new();
        fixture.repo.put("pkgs/apps/Foo-1.0.pkg", b"tampered").unwrap();

        let mut plan = InstallPlan::default();
        plan.managed_installs.push(plan_item(
            "Foo",
            "apps/Foo-1.0.pkg",
            Some(sha256_hex(b"payload")),
        ));

        let summary = fixture.scheduler().run(&mut plan);
        assert_eq!(summary.failed, vec!["Foo".to_string()]);
        assert!(plan.managed_installs.is_empty());
        assert_eq!(plan.problem_items.len(), 1);
        assert_eq!(plan.problem_items[0].note, "integrity check failed");
        // Nothing left behind in the cache.
        assert!(!fixture.cache_dir.path().join("Foo-1.0.pkg").exists());
    }

    #[test]
    fn test_missing_payload_is_problem() {
        let fixture = Fixture::new();
        let mut plan = InstallPlan::default();
        plan.managed_installs
            .push(plan_item("Foo", "apps/Foo-1.0.pkg", None));

        let summary = fixture.scheduler().run(&mut plan);
        assert_eq!(summary.failed, vec!["Foo".to_string()]);
        assert_eq!(
            plan.problem_items[0].note,
            "installer item not found in repository"
        );
    }

    #[test]
    fn test_purge_unreferenced_cache_entries() {
        let fixture = Fixture::new();
        std::fs::write(fixture.cache_dir.path().join("Stale-0.9.pkg"), b"old").unwrap();
        fixture.repo.put("pkgs/apps/Foo-1.0.pkg", b"payload").unwrap();

        let mut plan = InstallPlan::default();
        plan.managed_installs.push(plan_item(
            "Foo",
            "apps/Foo-1.0.pkg",
            Some(sha256_hex(b"payload")),
        ));

        fixture.scheduler().run(&mut plan);
        assert!(!fixture.cache_dir.path().join("Stale-0.9.pkg").exists());
        assert!(fixture.cache_dir.path().join("Foo-1.0.pkg").exists());
    }
}
