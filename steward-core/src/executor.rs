pub mod adapters;
pub mod profilereceipts;

use std::path::{Path, PathBuf};
use std::time::Instant;

use steward_types::pkginfo::{InstallerType, ItemToCopy, UninstallMethod};
use steward_types::plan::{InstallPlan, PlanItem};
use steward_types::report::{InstallResult, Report, SkippedItem};

use crate::catalogdb::split_name_and_version;
use crate::receiptdb::PackageDb;
use crate::scripts;
use crate::selfserve::SelfServeStore;

use adapters::{Adapters, InstallOutcome, ProgressEvent};
use profilereceipts::ProfileReceipts;

/// Outcome of an executor pass.
#[derive(Debug, Default)]
pub struct ExecSummary {
    pub restart_needed: bool,
    /// The stop file appeared; remaining items were left in the plan.
    pub stopped: bool,
}

/// Consumes the ordered install and removal lists, strictly in resolver
/// order, one item at a time. Cancellation takes effect between items,
/// never mid-item.
pub struct Executor<'a> {
    pub adapters: &'a Adapters,
    pub cache_dir: PathBuf,
    /// Gate on `unattended_install` / `unattended_uninstall` and running
    /// blocking applications.
    pub unattended: bool,
    pub force_delete_bundles: bool,
    pub stop_requested: &'a dyn Fn() -> bool,
}

impl<'a> Executor<'a> {
    /// Runs the install list. Successful items leave the plan; failed and
    /// skipped items stay for the next run. `names_already_skipped` seeds
    /// the skip set (e.g. download failures) so their dependents defer.
    pub fn run_installs(
        &self,
        plan: &mut InstallPlan,
        report: &mut Report,
        self_serve: &mut SelfServeStore,
        profile_receipts: &mut ProfileReceipts,
        names_already_skipped: &[String],
        persist: &mut dyn FnMut(&InstallPlan, &Report),
    ) -> ExecSummary {
        let mut summary = ExecSummary::default();
        let mut skipped: Vec<(String, String)> = names_already_skipped
            .iter()
            .map(|name| (name.clone(), String::new()))
            .collect();

        let total = plan.managed_installs.len();
        let mut index = 0;
        let mut position = 0;

        while index < plan.managed_installs.len() {
            if (self.stop_requested)() {
                log::warn!("Stop requested; leaving remaining items for next run");
                summary.stopped = true;
                break;
            }

            let item = plan.managed_installs[index].clone();
            position += 1;

            if self.unattended {
                if !item.info.unattended_install {
                    log::info!(
                        "Skipping install of {} because it is not unattended",
                        item.name()
                    );
                    self.mark_skipped(&item, "not allowed unattended", &mut skipped, report);
                    index += 1;
                    continue;
                }
                if let Some(app) = self
                    .adapters
                    .processes
                    .any_running(&item.info.blocking_applications)
                {
                    log::info!(
                        "Skipping install of {} because {} is running",
                        item.name(),
                        app
                    );
                    self.mark_skipped(
                        &item,
                        &format!("blocking application {} is running", app),
                        &mut skipped,
                        report,
                    );
                    index += 1;
                    continue;
                }
            }

            if let Some(prereq) = first_skipped_prereq(&item, &skipped) {
                log::info!(
                    "Skipping install of {} because prerequisite {} was skipped",
                    item.name(),
                    prereq
                );
                self.mark_skipped(
                    &item,
                    &format!("prerequisite {} was skipped", prereq),
                    &mut skipped,
                    report,
                );
                index += 1;
                continue;
            }

            log::info!(
                "Installing {} ({} of {})",
                item.info.display_name(),
                position,
                total
            );
            let started = Instant::now();
            let mut status = 0;

            if let Some(script) = &item.info.preinstall_script {
                status = match scripts::run_embedded_script("preinstall", script) {
                    Ok(code) => code,
                    Err(e) => {
                        log::error!("preinstall script for {} failed: {}", item.name(), e);
                        -1
                    }
                };
            }

            let mut restart_hint = false;
            if status == 0 {
                let (payload_status, payload_restart) =
                    self.install_payload(&item, profile_receipts);
                status = payload_status;
                restart_hint = payload_restart;
            }

            if status == 0 {
                if let Some(script) = &item.info.postinstall_script {
                    // A postinstall failure is reported but does not
                    // invalidate the install.
                    match scripts::run_embedded_script("postinstall", script) {
                        Ok(0) => {}
                        Ok(code) => {
                            report.warn(format!(
                                "Postinstall script for {} returned {}",
                                item.name(),
                                code
                            ));
                        }
                        Err(e) => {
                            report.warn(format!(
                                "Postinstall script for {} failed to run: {}",
                                item.name(),
                                e
                            ));
                        }
                    }
                }
            }

            if status == 0 && (restart_hint || item.info.restart_action.wants_restart()) {
                summary.restart_needed = true;
            }

            if status == 0 && item.info.on_demand {
                // A satisfied OnDemand request is complete; clear the
                // user's self-serve choice so it does not re-run.
                self_serve.remove_install(item.name());
            }

            report.install_results.push(InstallResult {
                display_name: item.info.display_name().to_string(),
                name: item.name().to_string(),
                version: item.version().clone(),
                status,
                duration_seconds: started.elapsed().as_secs(),
                unattended: self.unattended,
                download_kbytes_per_sec: item.download_kbytes_per_sec,
            });

            if status == 0 {
                log::info!("Install of {}-{} succeeded", item.name(), item.version());
                plan.managed_installs.remove(index);
                self.release_cache_file(&item, plan);
            } else {
                log::error!(
                    "Install of {}-{} failed with status {}",
                    item.name(),
                    item.version(),
                    status
                );
                // Anything later in the list that needs this item must be
                // skipped as well.
                skipped.push((
                    item.name().to_string(),
                    item.version().normalized(),
                ));
                index += 1;
            }

            persist(plan, report);
        }

        summary
    }

    /// Runs the removal list: dependents first, the same gating and
    /// bookkeeping as installs.
    pub fn run_removals(
        &self,
        plan: &mut InstallPlan,
        report: &mut Report,
        package_db: &mut PackageDb,
        profile_receipts: &mut ProfileReceipts,
        persist: &mut dyn FnMut(&InstallPlan, &Report),
    ) -> ExecSummary {
        let mut summary = ExecSummary::default();
        let mut skipped_items: Vec<PlanItem> = Vec::new();
        let mut index = 0;

        while index < plan.removals.len() {
            if (self.stop_requested)() {
                log::warn!("Stop requested; leaving remaining removals for next run");
                summary.stopped = true;
                break;
            }

            let item = plan.removals[index].clone();

            if self.unattended {
                if !item.info.unattended_uninstall {
                    self.mark_removal_skipped(
                        &item,
                        "not allowed unattended",
                        &mut skipped_items,
                        report,
                    );
                    index += 1;
                    continue;
                }
                if let Some(app) = self
                    .adapters
                    .processes
                    .any_running(&item.info.blocking_applications)
                {
                    self.mark_removal_skipped(
                        &item,
                        &format!("blocking application {} is running", app),
                        &mut skipped_items,
                        report,
                    );
                    index += 1;
                    continue;
                }
            }

            // If a dependent's removal was skipped, this item must stay.
            let blocking_note = skipped_items
                .iter()
                .find(|skipped| {
                    skipped.info.requires.iter().any(|reference| {
                        split_name_and_version(reference).0 == item.name()
                    })
                })
                .map(|dependent| {
                    format!("dependent item {} was not removed", dependent.name())
                });
            if let Some(note) = blocking_note {
                log::info!("Skipping removal of {}: {}", item.name(), note);
                self.mark_removal_skipped(&item, &note, &mut skipped_items, report);
                index += 1;
                continue;
            }

            log::info!("Removing {}", item.info.display_name());
            let started = Instant::now();
            let mut status = 0;

            if let Some(script) = &item.info.preuninstall_script {
                status = match scripts::run_embedded_script("preuninstall", script) {
                    Ok(code) => code,
                    Err(e) => {
                        log::error!("preuninstall script for {} failed: {}", item.name(), e);
                        -1
                    }
                };
            }

            let mut restart_hint = false;
            if status == 0 {
                let (removal_status, removal_restart) =
                    self.remove_payload(&item, package_db, profile_receipts);
                status = removal_status;
                restart_hint = removal_restart;
            }

            if status == 0 {
                if let Some(script) = &item.info.postuninstall_script {
                    match scripts::run_embedded_script("postuninstall", script) {
                        Ok(0) => {}
                        Ok(code) => report.warn(format!(
                            "Postuninstall script for {} returned {}",
                            item.name(),
                            code
                        )),
                        Err(e) => report.warn(format!(
                            "Postuninstall script for {} failed to run: {}",
                            item.name(),
                            e
                        )),
                    }
                }
            }

            if status == 0 && (restart_hint || item.info.restart_action.wants_restart()) {
                summary.restart_needed = true;
            }

            report.removal_results.push(InstallResult {
                display_name: item.info.display_name().to_string(),
                name: item.name().to_string(),
                version: item.version().clone(),
                status,
                duration_seconds: started.elapsed().as_secs(),
                unattended: self.unattended,
                download_kbytes_per_sec: None,
            });

            if status == 0 {
                log::info!("Removal of {} succeeded", item.name());
                plan.removals.remove(index);
            } else {
                log::error!("Removal of {} failed with status {}", item.name(), status);
                skipped_items.push(item);
                index += 1;
            }

            persist(plan, report);
        }

        summary
    }

    fn mark_skipped(
        &self,
        item: &PlanItem,
        note: &str,
        skipped: &mut Vec<(String, String)>,
        report: &mut Report,
    ) {
        skipped.push((item.name().to_string(), item.version().normalized()));
        report.skipped_items.push(SkippedItem {
            name: item.name().to_string(),
            version: item.version().clone(),
            note: note.to_string(),
        });
    }

    fn mark_removal_skipped(
        &self,
        item: &PlanItem,
        note: &str,
        skipped: &mut Vec<PlanItem>,
        report: &mut Report,
    ) {
        report.skipped_items.push(SkippedItem {
            name: item.name().to_string(),
            version: item.version().clone(),
            note: note.to_string(),
        });
        skipped.push(item.clone());
    }

    /// Dispatches one install by installer type. Returns `(status,
    /// restart_hint)`.
    fn install_payload(
        &self,
        item: &PlanItem,
        profile_receipts: &mut ProfileReceipts,
    ) -> (i32, bool) {
        let needs_payload = !matches!(
            item.info.installer_type,
            InstallerType::ScriptOnly | InstallerType::Nopkg | InstallerType::AppleUpdateMetadata
        );
        let payload_path = if needs_payload {
            let path = item
                .installer_item
                .as_deref()
                .or_else(|| item.info.installer_item_basename())
                .map(|basename| self.cache_dir.join(basename));
            match path {
                Some(path) if path.exists() => Some(path),
                Some(path) => {
                    log::error!("Installer item {} was not found", path.display());
                    return (-1, false);
                }
                None => {
                    log::error!("{} has no installer item", item.name());
                    return (-1, false);
                }
            }
        } else {
            None
        };

        match (item.info.installer_type, payload_path) {
            (InstallerType::PlatformPackage, Some(path)) => {
                let mut on_progress = |event: ProgressEvent| match event {
                    ProgressEvent::Percent(pct) => log::debug!("{}: {:.1}%", item.name(), pct),
                    ProgressEvent::Phase(phase) => log::info!("{}: {}", item.name(), phase),
                    ProgressEvent::Status(status) => log::debug!("{}: {}", item.name(), status),
                };
                match self.adapters.package_installer.install(&path, &mut on_progress) {
                    Ok(outcome) => (outcome.status, outcome.needs_restart),
                    Err(e) => {
                        log::error!("Installer failed for {}: {}", item.name(), e);
                        (-1, false)
                    }
                }
            }
            (InstallerType::DiskImageCopy, Some(path))
            | (InstallerType::BundleCopyFromImage, Some(path)) => {
                match self.install_from_image(&path, &item.info.items_to_copy) {
                    Ok(outcome) => (outcome.status, outcome.needs_restart),
                    Err(note) => {
                        log::error!("Copy install for {} failed: {}", item.name(), note);
                        (-1, false)
                    }
                }
            }
            (InstallerType::ConfigurationProfile, Some(path)) => {
                let identifier = match &item.info.payload_identifier {
                    Some(id) => id.clone(),
                    None => {
                        log::error!("{} has no payload identifier", item.name());
                        return (-1, false);
                    }
                };
                match self.adapters.profiles.install(&path, &identifier) {
                    Ok(outcome) if outcome.succeeded() => {
                        let hash = item
                            .info
                            .installer_item_hash
                            .clone()
                            .or_else(|| crate::download::file_sha256(&path))
                            .unwrap_or_default();
                        profile_receipts.record(&identifier, hash);
                        (0, outcome.needs_restart)
                    }
                    Ok(outcome) => (outcome.status, false),
                    Err(e) => {
                        log::error!("Profile install for {} failed: {}", item.name(), e);
                        (-1, false)
                    }
                }
            }
            // No payload: the work happens in the embedded scripts; the
            // restart hint comes from the pkginfo record.
            (InstallerType::ScriptOnly, _) | (InstallerType::Nopkg, _) => (0, false),
            (InstallerType::AppleUpdateMetadata, _) => (0, false),
            // Unreachable: payload presence was established above.
            (_, None) => (-1, false),
        }
    }

    fn install_from_image(
        &self,
        image_path: &Path,
        items_to_copy: &[ItemToCopy],
    ) -> Result<InstallOutcome, String> {
        let mountpoint = self
            .adapters
            .image_mounter
            .mount(image_path)
            .map_err(|e| format!("could not mount image: {}", e))?;

        let result = self.copy_items(&mountpoint, items_to_copy);

        if let Err(e) = self.adapters.image_mounter.unmount(&mountpoint) {
            log::warn!("Could not unmount {}: {}", mountpoint.display(), e);
        }

        result.map(|_| InstallOutcome::ok())
    }

    fn copy_items(&self, mountpoint: &Path, items: &[ItemToCopy]) -> Result<(), String> {
        let items = if items.is_empty() {
            // Single-bundle images: copy the first application bundle at
            // the image root into the applications directory.
            let bundle = find_app_bundle(mountpoint)
                .ok_or_else(|| "no application bundle found on image".to_string())?;
            vec![ItemToCopy::builder()
                .source_item(bundle)
                .destination_path("/Applications")
                .build()]
        } else {
            items.to_vec()
        };

        for entry in &items {
            let source = mountpoint.join(entry.source_item.trim_start_matches('/'));
            let destination = PathBuf::from(entry.full_destination_path());
            log::info!(
                "Copying {} to {}",
                source.display(),
                destination.display()
            );

            if destination.exists() {
                remove_path(&destination)
                    .map_err(|e| format!("could not replace {}: {}", destination.display(), e))?;
            }
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("could not create {}: {}", parent.display(), e))?;
            }
            copy_recursive(&source, &destination)
                .map_err(|e| format!("copy failed: {}", e))?;

            #[cfg(unix)]
            apply_ownership(&destination, entry)?;
        }
        Ok(())
    }

    /// Dispatches one removal by uninstall method.
    fn remove_payload(
        &self,
        item: &PlanItem,
        package_db: &mut PackageDb,
        profile_receipts: &mut ProfileReceipts,
    ) -> (i32, bool) {
        let method = match &item.info.uninstall_method {
            Some(method) => method.clone(),
            None => {
                log::error!("{} has no uninstall method", item.name());
                return (-1, false);
            }
        };

        match method {
            UninstallMethod::ReceiptRemoval => {
                let packageids: Vec<&str> =
                    item.packages.iter().map(|s| s.as_str()).collect();
                if packageids.is_empty() {
                    log::warn!("{} has no receipts to remove", item.name());
                    return (0, false);
                }
                match self.remove_by_receipts(&packageids, package_db) {
                    Ok(()) => (0, false),
                    Err(e) => {
                        log::error!("Receipt removal for {} failed: {}", item.name(), e);
                        (-1, false)
                    }
                }
            }
            UninstallMethod::RemoveCopiedItems => {
                let mut status = 0;
                for entry in &item.info.items_to_copy {
                    let destination = PathBuf::from(entry.full_destination_path());
                    if !destination.exists() {
                        log::debug!("{} does not exist", destination.display());
                        continue;
                    }
                    log::info!("Removing {}", destination.display());
                    if let Err(e) = remove_path(&destination) {
                        log::error!("Could not remove {}: {}", destination.display(), e);
                        status = -1;
                    }
                }
                (status, false)
            }
            UninstallMethod::RemoveProfile => {
                let identifier = match &item.info.payload_identifier {
                    Some(id) => id.clone(),
                    None => {
                        log::error!("{} has no payload identifier", item.name());
                        return (-1, false);
                    }
                };
                match self.adapters.profiles.remove(&identifier) {
                    Ok(outcome) if outcome.succeeded() => {
                        profile_receipts.forget(&identifier);
                        (0, outcome.needs_restart)
                    }
                    Ok(outcome) => (outcome.status, false),
                    Err(e) => {
                        log::error!("Profile removal for {} failed: {}", item.name(), e);
                        (-1, false)
                    }
                }
            }
            UninstallMethod::UninstallScript => {
                let script = match &item.info.uninstall_script {
                    Some(script) => script,
                    None => {
                        log::error!("{} has no uninstall script", item.name());
                        return (-1, false);
                    }
                };
                match scripts::run_embedded_script("uninstall", script) {
                    Ok(code) => (code, false),
                    Err(e) => {
                        log::error!("Uninstall script for {} failed: {}", item.name(), e);
                        (-1, false)
                    }
                }
            }
            UninstallMethod::InstallerSpecific(command) => {
                log::error!(
                    "{} declares uninstall method {} which this agent does not provide",
                    item.name(),
                    command
                );
                (-1, false)
            }
        }
    }

    /// Deletes the filesystem paths unique to the given packages, bottom
    /// up, then forgets their receipts.
    fn remove_by_receipts(
        &self,
        packageids: &[&str],
        package_db: &mut PackageDb,
    ) -> Result<(), String> {
        let paths = package_db
            .paths_unique_to(packageids)
            .map_err(|e| e.to_string())?;
        log::info!("{} paths to remove", paths.len());

        let mut errors = 0;
        for path in &paths {
            if !path.exists() {
                continue;
            }
            let is_dir = path.is_dir();
            let is_bundle = path.extension().map(|ext| ext == "app").unwrap_or(false);

            let result = if is_dir {
                if dir_is_empty(path) {
                    std::fs::remove_dir(path)
                } else if is_bundle && self.force_delete_bundles {
                    std::fs::remove_dir_all(path)
                } else {
                    log::warn!(
                        "Not removing {}: directory is not empty",
                        path.display()
                    );
                    continue;
                }
            } else {
                std::fs::remove_file(path)
            };

            if let Err(e) = result {
                log::error!("Could not remove {}: {}", path.display(), e);
                errors += 1;
            }
        }

        package_db
            .forget(packageids, self.adapters.receipt_source.as_ref())
            .map_err(|e| e.to_string())?;

        if errors > 0 {
            Err(format!("{} paths could not be removed", errors))
        } else {
            Ok(())
        }
    }

    /// Deletes the cached payload once nothing left in the plan references
    /// it. Several items may share one installer item.
    fn release_cache_file(&self, done: &PlanItem, plan: &InstallPlan) {
        let basename = match done
            .installer_item
            .as_deref()
            .or_else(|| done.info.installer_item_basename())
        {
            Some(name) => name.to_string(),
            None => return,
        };

        let still_referenced = plan.managed_installs.iter().any(|item| {
            item.installer_item.as_deref() == Some(basename.as_str())
                || item.info.installer_item_basename() == Some(basename.as_str())
        });
        if still_referenced {
            return;
        }

        let path = self.cache_dir.join(&basename);
        if path.exists() {
            log::info!("Removing {} from cache", basename);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

/// First prerequisite of `item` present in the skipped set, matching on
/// bare name or `name-version`.
fn first_skipped_prereq<'p>(
    item: &'p PlanItem,
    skipped: &[(String, String)],
) -> Option<&'p str> {
    item.prerequisites().find(|reference| {
        let (name, version) = split_name_and_version(reference);
        skipped.iter().any(|(skipped_name, skipped_version)| {
            if skipped_name != name {
                return false;
            }
            match &version {
                Some(wanted) => &wanted.normalized() == skipped_version,
                None => true,
            }
        })
    })
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn copy_recursive(source: &Path, destination: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(destination)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &destination.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(source, destination).map(|_| ())
    }
}

fn find_app_bundle(mountpoint: &Path) -> Option<String> {
    let entries = std::fs::read_dir(mountpoint).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && path.extension().map(|ext| ext == "app").unwrap_or(false) {
            return Some(entry.file_name().to_string_lossy().into_owned());
        }
    }
    None
}

#[cfg(unix)]
fn apply_ownership(path: &Path, entry: &ItemToCopy) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = &entry.mode {
        let mode = u32::from_str_radix(mode, 8)
            .map_err(|_| format!("invalid mode string {}", mode))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| format!("could not set mode on {}: {}", path.display(), e))?;
    }

    let uid = entry.user.as_deref().and_then(lookup_uid);
    let gid = entry.group.as_deref().and_then(lookup_gid);
    if uid.is_some() || gid.is_some() {
        let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| "path contains interior NUL".to_string())?;
        let rc = unsafe {
            libc::chown(
                c_path.as_ptr(),
                uid.unwrap_or(u32::max_value()),
                gid.unwrap_or(u32::max_value()),
            )
        };
        if rc != 0 {
            log::warn!(
                "Could not change ownership of {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            );
        }
    }
    Ok(())
}

#[cfg(unix)]
fn lookup_uid(user: &str) -> Option<u32> {
    if let Ok(numeric) = user.parse::<u32>() {
        return Some(numeric);
    }
    let c_name = std::ffi::CString::new(user).ok()?;
    let record = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if record.is_null() {
        None
    } else {
        Some(unsafe { (*record).pw_uid })
    }
}

#[cfg(unix)]
fn lookup_gid(group: &str) -> Option<u32> {
    if let Ok(numeric) = group.parse::<u32>() {
        return Some(numeric);
    }
    let c_name = std::ffi::CString::new(group).ok()?;
    let record = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if record.is_null() {
        None
    } else {
        Some(unsafe { (*record).gr_gid })
    }
}
