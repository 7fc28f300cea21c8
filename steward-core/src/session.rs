use std::cell::Cell;
use std::fs::File;
use std::path::Path;
use std::process::Command;

use chrono::Utc;
use thiserror::Error;

use steward_types::plan::InstallPlan;
use steward_types::report::{Report, ReportItem};
use steward_types::{Catalog, Manifest};

use crate::catalogdb::CatalogDb;
use crate::conditions::Facts;
use crate::config::Config;
use crate::download::DownloadScheduler;
use crate::executor::adapters::Adapters;
use crate::executor::profilereceipts::ProfileReceipts;
use crate::executor::Executor;
use crate::probe::{AppRegistry, StateProbe};
use crate::receiptdb::PackageDb;
use crate::repo::{refresh_cached, Repo, RepoError};
use crate::resolver::{expand_manifest, ManifestLoadError, ManifestLoader, Resolver};
use crate::selfserve::SelfServeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Refresh, resolve and persist the plan; no downloads, no installs.
    CheckOnly,
    /// Execute a previously persisted plan; no catalog refresh.
    InstallOnly,
    /// The full reconciliation.
    Auto,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Another instance holds the session lock")]
    LockHeld,

    #[error("Could not create session lock")]
    Lock(#[source] std::io::Error),

    #[error("No manifest could be retrieved for this client")]
    NoManifest,

    #[error("Catalog {0} is malformed")]
    CatalogParse(String, #[source] plist::Error),

    #[error("No catalogs are available")]
    NoCatalogs,

    #[error("Repository unreachable and no cached state exists")]
    RepoUnreachable(#[source] RepoError),

    #[error("No install plan exists; run a check first")]
    NoPlan,

    #[error("Persisted install plan is unreadable")]
    PlanParse(#[source] plist::Error),

    #[error("Could not persist session state")]
    Persist(#[source] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestLoadError),
}

impl SessionError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::RepoUnreachable(_) => 3,
            _ => 2,
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    pub updates_available: bool,
    pub install_failures: bool,
    pub restart_needed: bool,
    pub stopped: bool,
}

impl SessionOutcome {
    pub fn exit_code(&self, mode: RunMode) -> i32 {
        if self.install_failures {
            4
        } else if self.restart_needed {
            5
        } else if mode == RunMode::CheckOnly && self.updates_available {
            1
        } else {
            0
        }
    }
}

/// One end-to-end reconciliation: refresh, probe, resolve, download,
/// install, report. Single-threaded and cooperative throughout; the stop
/// file is honored between items.
pub struct Session {
    config: Config,
    repo: Box<dyn Repo>,
    adapters: Adapters,
    unattended: bool,
}

impl Session {
    pub fn new(
        config: Config,
        repo: Box<dyn Repo>,
        adapters: Adapters,
        unattended: bool,
    ) -> Session {
        Session {
            config,
            repo,
            adapters,
            unattended,
        }
    }

    pub fn run(&mut self, mode: RunMode) -> Result<SessionOutcome, SessionError> {
        // A second instance must exit immediately rather than queue.
        let lock_file = File::create(self.config.lock_path()).map_err(SessionError::Lock)?;
        let mut lock = fd_lock::FdLock::new(lock_file);
        let _guard = lock.try_lock().map_err(|_| SessionError::LockHeld)?;

        let mut report = Report::default();
        report.start_time = Some(Utc::now().to_rfc3339());

        let result = self.run_locked(mode, &mut report);

        report.end_time = Some(Utc::now().to_rfc3339());
        if let Err(e) = &result {
            report.error(format!("{}", e));
        }
        if let Err(e) = write_plist(&self.config.report_path(), &report) {
            log::warn!("Could not write report: {}", e);
        }

        result
    }

    fn run_locked(
        &mut self,
        mode: RunMode,
        report: &mut Report,
    ) -> Result<SessionOutcome, SessionError> {
        let mut outcome = SessionOutcome::default();

        let mut plan = match mode {
            RunMode::InstallOnly => self.load_plan()?,
            RunMode::CheckOnly | RunMode::Auto => self.check_phase(report)?,
        };

        report.items_to_install = plan
            .managed_installs
            .iter()
            .map(|item| ReportItem {
                display_name: item.info.display_name().to_string(),
                name: item.name().to_string(),
                version: item.version().clone(),
            })
            .collect();
        report.items_to_remove = plan
            .removals
            .iter()
            .map(|item| ReportItem {
                display_name: item.info.display_name().to_string(),
                name: item.name().to_string(),
                version: item.version().clone(),
            })
            .collect();
        report.problem_items = plan.problem_items.clone();

        outcome.updates_available = !plan.is_empty();

        if mode == RunMode::CheckOnly {
            // The plan was persisted at the end of the check phase.
            return Ok(outcome);
        }

        // Download phase.
        let downloads =
            DownloadScheduler::new(self.repo.as_ref(), self.config.cache_dir()).run(&mut plan);
        write_plist(&self.config.install_plan_path(), &plan).map_err(SessionError::Persist)?;

        // Install phase.
        let plan_path = self.config.install_plan_path();
        let report_path = self.config.report_path();
        let mut persist = |plan: &InstallPlan, report: &Report| {
            if let Err(e) = write_plist(&plan_path, plan) {
                log::warn!("Could not persist plan: {}", e);
            }
            if let Err(e) = write_plist(&report_path, report) {
                log::warn!("Could not persist report: {}", e);
            }
        };

        let mut self_serve = SelfServeStore::load(self.config.self_serve_manifest_path());
        let mut profile_receipts = ProfileReceipts::load(self.config.profile_receipts_path());
        let mut package_db = PackageDb::open(&self.config.package_db_path())
            .map_err(|e| SessionError::Persist(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        if !plan.removals.is_empty() && package_db.is_stale(self.adapters.receipt_source.as_ref())
        {
            if let Err(e) = package_db.rebuild(self.adapters.receipt_source.as_ref()) {
                report.warn(format!("Could not rebuild package database: {}", e));
            }
        }

        let stop_path = self.config.stop_requested_path();
        let stop_requested = move || stop_path.exists();
        let executor = Executor {
            adapters: &self.adapters,
            cache_dir: self.config.cache_dir(),
            unattended: self.unattended,
            force_delete_bundles: self.config.settings().force_delete_bundles,
            stop_requested: &stop_requested,
        };

        let install_summary = executor.run_installs(
            &mut plan,
            report,
            &mut self_serve,
            &mut profile_receipts,
            &downloads.failed,
            &mut persist,
        );
        outcome.restart_needed |= install_summary.restart_needed;
        outcome.stopped |= install_summary.stopped;

        if !outcome.stopped {
            let removal_summary = executor.run_removals(
                &mut plan,
                report,
                &mut package_db,
                &mut profile_receipts,
                &mut persist,
            );
            outcome.restart_needed |= removal_summary.restart_needed;
            outcome.stopped |= removal_summary.stopped;
        }

        if let Err(e) = self_serve.save() {
            report.warn(format!("Could not save self-serve manifest: {}", e));
        }
        if let Err(e) = profile_receipts.save() {
            report.warn(format!("Could not save profile receipts: {}", e));
        }

        outcome.install_failures = report.install_failures();
        outcome.updates_available = !plan.is_empty();
        report.restart_required = outcome.restart_needed;

        write_plist(&self.config.install_plan_path(), &plan).map_err(SessionError::Persist)?;
        Ok(outcome)
    }

    /// Phases 2–4: refresh catalogs and manifests, probe, resolve, persist.
    fn check_phase(&mut self, report: &mut Report) -> Result<InstallPlan, SessionError> {
        let facts = self.gather_facts();
        let self_serve = SelfServeStore::load(self.config.self_serve_manifest_path());

        let loader = CachedManifestLoader {
            repo: self.repo.as_ref(),
            manifests_dir: self.config.manifests_dir(),
            offline: Cell::new(false),
        };

        let identifier = self.config.client_identifier();
        report.manifest_name = Some(identifier.clone());
        log::info!("Using manifest {}", identifier);

        let effective = match expand_manifest(&identifier, &loader, &facts, self_serve.manifest())
        {
            Ok(effective) => effective,
            Err(ManifestLoadError::NotFound(_)) if identifier != "site_default" => {
                log::warn!(
                    "No manifest named {}; falling back to site_default",
                    identifier
                );
                report.manifest_name = Some("site_default".to_string());
                expand_manifest("site_default", &loader, &facts, self_serve.manifest())
                    .map_err(|_| SessionError::NoManifest)?
            }
            Err(ManifestLoadError::NotFound(_)) => return Err(SessionError::NoManifest),
            Err(e) => return Err(e.into()),
        };

        if effective.catalogs.is_empty() {
            return Err(SessionError::NoCatalogs);
        }

        let mut catalogs = Vec::new();
        for name in &effective.catalogs {
            match self.fetch_catalog(name)? {
                Some((catalog, offline)) => {
                    if offline {
                        report.offline_check = true;
                    }
                    catalogs.push((name.clone(), catalog));
                }
                None => {
                    report.warn(format!("Catalog {} does not exist in the repository", name));
                }
            }
        }
        if loader.offline.get() {
            report.offline_check = true;
        }
        if catalogs.is_empty() {
            return Err(SessionError::NoCatalogs);
        }

        let catalog_db = CatalogDb::new(catalogs);
        log::info!("Catalog database holds {} items", catalog_db.len());

        let mut package_db = PackageDb::open(&self.config.package_db_path())
            .map_err(|e| SessionError::Persist(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        if package_db.is_stale(self.adapters.receipt_source.as_ref()) {
            if let Err(e) = package_db.rebuild(self.adapters.receipt_source.as_ref()) {
                report.warn(format!("Could not rebuild package database: {}", e));
            }
        }

        let probe = StateProbe::new(AppRegistry::discover());
        let resolver = Resolver {
            catalogs: &catalog_db,
            probe: &probe,
            receipts: &package_db,
            facts: &facts,
            self_serve: self_serve.manifest(),
            space_margin_kb: self.config.settings().space_margin_kb,
        };

        let resolved = resolver.resolve(&effective);
        let plan = InstallPlan {
            managed_installs: resolved.install_list,
            removals: resolved.removals,
            optional_installs: resolved.optional_installs,
            problem_items: resolved.problem_items,
        };

        write_plist(&self.config.install_plan_path(), &plan).map_err(SessionError::Persist)?;
        log::info!(
            "Resolved plan: {} installs, {} removals, {} problems",
            plan.managed_installs.len(),
            plan.removals.len(),
            plan.problem_items.len()
        );
        Ok(plan)
    }

    /// Fetches one catalog, falling back to the cached copy when the
    /// transport fails. `Ok(None)` means the catalog does not exist at
    /// all; a transport failure with no cache aborts the session. A
    /// malformed catalog also aborts, leaving the last known good state
    /// untouched.
    fn fetch_catalog(&self, name: &str) -> Result<Option<(Catalog, bool)>, SessionError> {
        let cache_path = self.config.catalogs_dir().join(name);
        let relpath = format!("catalogs/{}", name);

        let offline = match refresh_cached(self.repo.as_ref(), &relpath, &cache_path) {
            Ok(fresh) => !fresh,
            Err(e) if e.is_not_found() => {
                if !cache_path.exists() {
                    return Ok(None);
                }
                log::warn!("Catalog {} vanished from the repository; using cache", name);
                true
            }
            Err(e) => {
                if cache_path.exists() {
                    true
                } else {
                    return Err(SessionError::RepoUnreachable(e));
                }
            }
        };

        let catalog: Catalog = plist::from_file(&cache_path)
            .map_err(|e| SessionError::CatalogParse(name.to_string(), e))?;
        Ok(Some((catalog, offline)))
    }

    fn load_plan(&self) -> Result<InstallPlan, SessionError> {
        let path = self.config.install_plan_path();
        if !path.exists() {
            return Err(SessionError::NoPlan);
        }
        plist::from_file(&path).map_err(SessionError::PlanParse)
    }

    fn gather_facts(&self) -> Facts {
        Facts::gather(
            &host_os_version(),
            std::env::consts::ARCH,
            available_disk_kb(self.config.base_dir()),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Loads manifests through the repository with conditional revalidation,
/// falling back to the cached copy when the transport fails.
struct CachedManifestLoader<'a> {
    repo: &'a dyn Repo,
    manifests_dir: std::path::PathBuf,
    offline: Cell<bool>,
}

impl<'a> ManifestLoader for CachedManifestLoader<'a> {
    fn load(&self, name: &str) -> Result<Manifest, ManifestLoadError> {
        let cache_path = self.manifests_dir.join(name.trim_start_matches('/'));
        let relpath = format!("manifests/{}", name);

        match refresh_cached(self.repo, &relpath, &cache_path) {
            Ok(true) => {}
            Ok(false) => self.offline.set(true),
            Err(e) if e.is_not_found() => {
                if !cache_path.exists() {
                    return Err(ManifestLoadError::NotFound(name.to_string()));
                }
            }
            Err(e) => {
                if !cache_path.exists() {
                    return Err(ManifestLoadError::Read(name.to_string(), Box::new(e)));
                }
                self.offline.set(true);
            }
        }

        plist::from_file(&cache_path)
            .map_err(|e| ManifestLoadError::Parse(name.to_string(), e))
    }
}

fn write_plist<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    plist::to_writer_xml(file, value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn host_os_version() -> String {
    if cfg!(target_os = "macos") {
        if let Ok(output) = Command::new("/usr/bin/sw_vers")
            .arg("-productVersion")
            .output()
        {
            if output.status.success() {
                return String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
        }
    }

    if let Ok(text) = std::fs::read_to_string("/etc/os-release") {
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("VERSION_ID=") {
                return value.trim_matches('"').to_string();
            }
        }
    }

    "0".to_string()
}

#[cfg(unix)]
fn available_disk_kb(path: &Path) -> u64 {
    let c_path = match std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes()) {
        Ok(c) => c,
        Err(_) => return u64::max_value(),
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } == 0 {
        (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64) / 1024
    } else {
        u64::max_value()
    }
}

#[cfg(not(unix))]
fn available_disk_kb(_path: &Path) -> u64 {
    u64::max_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let mut outcome = SessionOutcome::default();
        assert_eq!(outcome.exit_code(RunMode::Auto), 0);
        assert_eq!(outcome.exit_code(RunMode::CheckOnly), 0);

        outcome.updates_available = true;
        assert_eq!(outcome.exit_code(RunMode::CheckOnly), 1);
        assert_eq!(outcome.exit_code(RunMode::Auto), 0);

        outcome.restart_needed = true;
        assert_eq!(outcome.exit_code(RunMode::Auto), 5);

        outcome.install_failures = true;
        assert_eq!(outcome.exit_code(RunMode::Auto), 4);
    }

    #[test]
    fn test_host_os_version_has_content() {
        assert!(!host_os_version().is_empty());
    }
}
