//! End-to-end reconciliation scenarios against a temp-dir file repository
//! with fake platform adapters.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use steward_core::executor::adapters::{
    Adapters, ImageMounter, InstallOutcome, PackageInstaller, ProcessError, ProcessQuery,
    ProfileManager, ProgressEvent,
};
use steward_core::receiptdb::{HostReceipt, ReceiptPath, ReceiptSource};
use steward_core::repo::{FileRepo, Repo};
use steward_core::selfserve::SelfServeStore;
use steward_core::{Config, Permission, RunMode, Session};

use steward_types::pkginfo::{Receipt, UninstallMethod};
use steward_types::plan::InstallPlan;
use steward_types::report::Report;
use steward_types::{Catalog, Manifest, PkgInfo, Version};

/// Mutable host state shared by the fake adapters: which packages are
/// "installed", and which installer invocations should fail.
#[derive(Default)]
struct FakeHost {
    receipts: Vec<HostReceipt>,
    fail_payloads: HashSet<String>,
    installed_payloads: Vec<String>,
    forgotten: Vec<String>,
}

type SharedHost = Arc<Mutex<FakeHost>>;

impl FakeHost {
    fn add_receipt(&mut self, packageid: &str, version: &str) {
        self.receipts.retain(|r| r.packageid != packageid);
        self.receipts.push(HostReceipt {
            packageid: packageid.to_string(),
            version: Version::new(version),
            install_location: "/".to_string(),
            paths: Vec::new(),
        });
    }
}

struct FakeInstaller(SharedHost);

impl PackageInstaller for FakeInstaller {
    fn install(
        &self,
        pkg_path: &Path,
        _progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<InstallOutcome, ProcessError> {
        let basename = pkg_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut host = self.0.lock().unwrap();
        host.installed_payloads.push(basename.clone());

        if host.fail_payloads.contains(&basename) {
            return Ok(InstallOutcome {
                status: 1,
                needs_restart: false,
            });
        }

        // `Name-Version.pkg` becomes a receipt for com.test.<name>.
        let stem = basename.trim_end_matches(".pkg");
        if let Some(dash) = stem.rfind('-') {
            let (name, version) = (&stem[..dash], &stem[dash + 1..]);
            let packageid = format!("com.test.{}", name.to_lowercase());
            host.add_receipt(&packageid, version);
        }
        Ok(InstallOutcome::ok())
    }
}

struct FakeMounter;

impl ImageMounter for FakeMounter {
    fn mount(&self, _image_path: &Path) -> Result<PathBuf, ProcessError> {
        Err(ProcessError::NotFound)
    }

    fn unmount(&self, _mountpoint: &Path) -> Result<(), ProcessError> {
        Ok(())
    }
}

struct FakeProfiles;

impl ProfileManager for FakeProfiles {
    fn install(
        &self,
        _profile_path: &Path,
        _identifier: &str,
    ) -> Result<InstallOutcome, ProcessError> {
        Ok(InstallOutcome::ok())
    }

    fn remove(&self, _identifier: &str) -> Result<InstallOutcome, ProcessError> {
        Ok(InstallOutcome::ok())
    }
}

struct NothingRunning;

impl ProcessQuery for NothingRunning {
    fn any_running(&self, _app_names: &[String]) -> Option<String> {
        None
    }
}

struct FakeSource(SharedHost);

impl ReceiptSource for FakeSource {
    fn receipts(&self) -> Result<Vec<HostReceipt>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.lock().unwrap().receipts.clone())
    }

    fn newest_receipt_time(&self) -> Option<std::time::SystemTime> {
        Some(std::time::SystemTime::now())
    }

    fn forget(&self, packageid: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut host = self.0.lock().unwrap();
        host.receipts.retain(|r| r.packageid != packageid);
        host.forgotten.push(packageid.to_string());
        Ok(())
    }
}

struct World {
    _repo_dir: tempfile::TempDir,
    _state_dir: tempfile::TempDir,
    repo_path: PathBuf,
    state_path: PathBuf,
    host: SharedHost,
}

impl World {
    fn new() -> World {
        let repo_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let repo_path = repo_dir.path().to_path_buf();
        let state_path = state_dir.path().to_path_buf();
        World {
            _repo_dir: repo_dir,
            _state_dir: state_dir,
            repo_path,
            state_path,
            host: Arc::new(Mutex::new(FakeHost::default())),
        }
    }

    fn publish_catalog(&self, name: &str, items: &[PkgInfo]) {
        let catalog = Catalog::from(items.to_vec());
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &catalog).unwrap();
        FileRepo::new(&self.repo_path)
            .put(&format!("catalogs/{}", name), &buf)
            .unwrap();
        // Publish payloads for everything in the catalog.
        for item in items {
            if let Some(location) = &item.installer_item_location {
                FileRepo::new(&self.repo_path)
                    .put(&format!("pkgs/{}", location), b"payload-bytes")
                    .unwrap();
            }
        }
    }

    fn publish_manifest(&self, name: &str, manifest: &Manifest) {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, manifest).unwrap();
        FileRepo::new(&self.repo_path)
            .put(&format!("manifests/{}", name), &buf)
            .unwrap();
    }

    fn adapters(&self) -> Adapters {
        Adapters {
            package_installer: Box::new(FakeInstaller(Arc::clone(&self.host))),
            image_mounter: Box::new(FakeMounter),
            profiles: Box::new(FakeProfiles),
            processes: Box::new(NothingRunning),
            receipt_source: Box::new(FakeSource(Arc::clone(&self.host))),
        }
    }

    fn session(&self) -> Session {
        let mut config = Config::load(&self.state_path, Permission::ReadWrite).unwrap();
        config.settings_mut().client_identifier = Some("site_default".to_string());
        Session::new(
            config,
            Box::new(FileRepo::new(&self.repo_path)),
            self.adapters(),
            false,
        )
    }

    fn plan(&self) -> InstallPlan {
        plist::from_file(self.state_path.join("InstallInfo.plist")).unwrap()
    }

    fn report(&self) -> Report {
        plist::from_file(self.state_path.join("ManagedInstallReport.plist")).unwrap()
    }

    fn cache_files(&self) -> Vec<String> {
        std::fs::read_dir(self.state_path.join("Cache"))
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
    }
}

fn item(name: &str, version: &str) -> PkgInfo {
    PkgInfo::builder()
        .name(name)
        .version(Version::new(version))
        .catalogs(vec!["production".to_string()])
        .installer_item_location(Some(format!("apps/{}-{}.pkg", name, version)))
        .receipts(vec![Receipt::builder()
            .packageid(format!("com.test.{}", name.to_lowercase()))
            .version(Version::new(version))
            .build()])
        .build()
}

fn manifest(installs: &[&str], uninstalls: &[&str]) -> Manifest {
    Manifest::builder()
        .catalogs(vec!["production".to_string()])
        .managed_installs(installs.iter().map(|s| s.to_string()).collect())
        .managed_uninstalls(uninstalls.iter().map(|s| s.to_string()).collect())
        .build()
}

#[test]
fn scenario_straight_install() {
    let world = World::new();
    world.publish_catalog("production", &[item("FooApp", "2.0")]);
    world.publish_manifest("site_default", &manifest(&["FooApp"], &[]));

    // Check phase sees the pending install.
    let outcome = world.session().run(RunMode::CheckOnly).unwrap();
    assert!(outcome.updates_available);
    assert_eq!(outcome.exit_code(RunMode::CheckOnly), 1);
    let plan = world.plan();
    assert_eq!(plan.managed_installs.len(), 1);
    assert_eq!(plan.managed_installs[0].info.name, "FooApp");

    // Full run installs it.
    let outcome = world.session().run(RunMode::Auto).unwrap();
    assert!(!outcome.install_failures);
    assert_eq!(outcome.exit_code(RunMode::Auto), 0);

    let report = world.report();
    assert_eq!(report.install_results.len(), 1);
    assert_eq!(report.install_results[0].status, 0);
    assert_eq!(report.install_results[0].name, "FooApp");

    // The receipt exists, the plan and cache are empty.
    assert!(world
        .host
        .lock()
        .unwrap()
        .receipts
        .iter()
        .any(|r| r.packageid == "com.test.fooapp"));
    assert!(world.plan().managed_installs.is_empty());
    assert!(world.cache_files().is_empty());

    // A second run has nothing to do.
    let outcome = world.session().run(RunMode::Auto).unwrap();
    assert!(!outcome.updates_available);
    let report = world.report();
    assert!(report.install_results.is_empty());
}

#[test]
fn scenario_dependency_ordering_and_skip() {
    let world = World::new();
    let mut app = item("App", "1.0");
    app.requires = vec!["Lib".to_string()];
    world.publish_catalog("production", &[item("Lib", "1.0"), app]);
    world.publish_manifest("site_default", &manifest(&["App"], &[]));

    world.session().run(RunMode::CheckOnly).unwrap();
    let plan = world.plan();
    let names: Vec<&str> = plan
        .managed_installs
        .iter()
        .map(|i| i.info.name.as_str())
        .collect();
    assert_eq!(names, vec!["Lib", "App"]);

    // Make Lib's installer fail: App must be skipped with a note naming
    // Lib, and the next check schedules both again.
    world
        .host
        .lock()
        .unwrap()
        .fail_payloads
        .insert("Lib-1.0.pkg".to_string());

    let outcome = world.session().run(RunMode::Auto).unwrap();
    assert!(outcome.install_failures);
    assert_eq!(outcome.exit_code(RunMode::Auto), 4);

    let report = world.report();
    assert_eq!(report.install_results.len(), 1);
    assert_eq!(report.install_results[0].name, "Lib");
    assert_ne!(report.install_results[0].status, 0);
    assert_eq!(report.skipped_items.len(), 1);
    assert_eq!(report.skipped_items[0].name, "App");
    assert!(report.skipped_items[0].note.contains("Lib"));

    world.host.lock().unwrap().fail_payloads.clear();
    world.session().run(RunMode::CheckOnly).unwrap();
    let plan = world.plan();
    let names: Vec<&str> = plan
        .managed_installs
        .iter()
        .map(|i| i.info.name.as_str())
        .collect();
    assert_eq!(names, vec!["Lib", "App"]);
}

#[test]
fn scenario_update_chain() {
    let world = World::new();
    let mut update = item("BaseUpdate", "1.1");
    update.update_for = vec!["Base".to_string()];
    world.publish_catalog("production", &[item("Base", "1.0"), update]);
    world.publish_manifest("site_default", &manifest(&["Base"], &[]));

    // Base is already installed at a satisfying version.
    world.host.lock().unwrap().add_receipt("com.test.base", "1.0");

    world.session().run(RunMode::CheckOnly).unwrap();
    let plan = world.plan();
    let names: Vec<&str> = plan
        .managed_installs
        .iter()
        .map(|i| i.info.name.as_str())
        .collect();
    assert_eq!(names, vec!["BaseUpdate"]);
}

#[test]
fn scenario_removal_with_reverse_dependency() {
    let world = World::new();

    let removable = |name: &str| {
        let mut info = item(name, "1.0");
        info.uninstallable = true;
        info.uninstall_method = Some(UninstallMethod::ReceiptRemoval);
        info
    };
    let mut app = removable("App");
    app.requires = vec!["Lib".to_string()];
    world.publish_catalog("production", &[removable("Lib"), app]);
    world.publish_manifest("site_default", &manifest(&[], &["Lib"]));

    {
        let mut host = world.host.lock().unwrap();
        host.add_receipt("com.test.lib", "1.0");
        host.add_receipt("com.test.app", "1.0");
    }

    world.session().run(RunMode::CheckOnly).unwrap();
    let plan = world.plan();
    let names: Vec<&str> = plan.removals.iter().map(|i| i.info.name.as_str()).collect();
    assert_eq!(names, vec!["App", "Lib"]);

    let outcome = world.session().run(RunMode::Auto).unwrap();
    assert!(!outcome.install_failures);

    let report = world.report();
    assert_eq!(report.removal_results.len(), 2);
    assert!(report.removal_results.iter().all(|r| r.status == 0));

    let host = world.host.lock().unwrap();
    assert!(host.forgotten.contains(&"com.test.app".to_string()));
    assert!(host.forgotten.contains(&"com.test.lib".to_string()));
    assert!(host.receipts.is_empty());
}

#[test]
fn scenario_conflicting_install_and_uninstall() {
    let world = World::new();
    let mut x = item("X", "1.0");
    x.uninstallable = true;
    x.uninstall_method = Some(UninstallMethod::ReceiptRemoval);
    world.publish_catalog("production", &[x]);
    world.publish_manifest("site_default", &manifest(&["X"], &["X"]));

    world.host.lock().unwrap().add_receipt("com.test.x", "1.0");

    world.session().run(RunMode::CheckOnly).unwrap();
    let plan = world.plan();
    assert!(plan.managed_installs.is_empty());
    let names: Vec<&str> = plan.removals.iter().map(|i| i.info.name.as_str()).collect();
    assert_eq!(names, vec!["X"]);
}

#[test]
fn scenario_self_serve_on_demand() {
    let world = World::new();
    let mut reset = item("Reset", "1.0");
    reset.on_demand = true;
    world.publish_catalog("production", &[reset]);

    let mut site = manifest(&[], &[]);
    site.optional_installs = vec!["Reset".to_string()];
    world.publish_manifest("site_default", &site);

    // Reset is already installed; only the OnDemand choice makes it run.
    world.host.lock().unwrap().add_receipt("com.test.reset", "1.0");

    // The user asks for it.
    {
        let session = world.session();
        let mut store = SelfServeStore::load(session.config().self_serve_manifest_path());
        store.add_install("Reset");
        store.save().unwrap();
    }

    let outcome = world.session().run(RunMode::Auto).unwrap();
    assert!(!outcome.install_failures);
    let report = world.report();
    assert_eq!(report.install_results.len(), 1);
    assert_eq!(report.install_results[0].name, "Reset");

    // The choice was cleared after the successful run.
    let session = world.session();
    let store = SelfServeStore::load(session.config().self_serve_manifest_path());
    assert!(store.manifest().managed_installs.is_empty());

    // A later session schedules nothing.
    let outcome = world.session().run(RunMode::Auto).unwrap();
    assert!(!outcome.updates_available);
    assert!(world.report().install_results.is_empty());
}

#[test]
fn scenario_offline_check_uses_cache() {
    let world = World::new();
    world.publish_catalog("production", &[item("FooApp", "2.0")]);
    world.publish_manifest("site_default", &manifest(&["FooApp"], &[]));

    // Prime the cache.
    world.session().run(RunMode::CheckOnly).unwrap();

    // Repository vanishes; the cached catalogs and manifest still drive a
    // successful offline check.
    std::fs::remove_dir_all(world.repo_path.join("catalogs")).unwrap();
    std::fs::remove_dir_all(world.repo_path.join("manifests")).unwrap();

    let outcome = world.session().run(RunMode::CheckOnly).unwrap();
    assert!(outcome.updates_available);
    let plan = world.plan();
    assert_eq!(plan.managed_installs.len(), 1);
}
