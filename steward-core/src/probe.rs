pub mod apps;

use std::path::Path;

use md5::{Digest as _, Md5};

use steward_types::pkginfo::{InstallsItem, PkgInfo};
use steward_types::Version;

use crate::receiptdb::ReceiptQuery;
use crate::scripts;

pub use apps::{AppRecord, AppRegistry};

/// Result of one installs-array probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    NotPresent,
    Lower,
    Equal,
    Higher,
    /// A filesystem item exists (and its checksum, if given, matches).
    Match,
    /// A filesystem item exists but its checksum differs.
    Mismatch,
}

/// Aggregated installed state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    NotInstalled,
    /// Installed, but at a lower version than the pkginfo's.
    Older,
    Current,
    Newer,
}

impl InstallStatus {
    /// Installed at a version satisfying the pkginfo (equal or higher).
    pub fn satisfies(&self) -> bool {
        matches!(self, InstallStatus::Current | InstallStatus::Newer)
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self, InstallStatus::NotInstalled)
    }
}

/// Answers "is item X installed, and at what version?" for one session.
/// Holds the application registry so the expensive scan happens once.
pub struct StateProbe {
    apps: AppRegistry,
}

impl StateProbe {
    pub fn new(apps: AppRegistry) -> StateProbe {
        StateProbe { apps }
    }

    /// Determines the installed state of an item.
    ///
    /// Decision order: `installcheck_script` short-circuits everything;
    /// else the `installs` array; else `receipts`; an item with none of
    /// these cannot be detected and reports not-installed with a warning.
    pub fn status(&self, info: &PkgInfo, receipts: &dyn ReceiptQuery) -> InstallStatus {
        if let Some(script) = &info.installcheck_script {
            return match scripts::run_embedded_script("installcheck", script) {
                // Exit 0 means "needs install".
                Ok(0) => InstallStatus::NotInstalled,
                Ok(_) => InstallStatus::Current,
                Err(e) => {
                    log::warn!("installcheck script for {} failed to run: {}", info.name, e);
                    InstallStatus::NotInstalled
                }
            };
        }

        if !info.installs.is_empty() {
            let results: Vec<ProbeResult> = info
                .installs
                .iter()
                .map(|item| self.evaluate_installs_item(item))
                .collect();
            return aggregate(&results);
        }

        if !info.receipts.is_empty() {
            let results: Vec<ProbeResult> = info
                .receipts
                .iter()
                .filter(|receipt| !receipt.optional)
                .map(|receipt| {
                    match receipts.installed_version(&receipt.packageid) {
                        Some(installed) => compare_versions(&installed, &receipt.version),
                        None => ProbeResult::NotPresent,
                    }
                })
                .collect();
            if results.is_empty() {
                // All receipts optional; nothing to decide with.
                return InstallStatus::NotInstalled;
            }
            return aggregate(&results);
        }

        log::warn!(
            "{} has no installcheck_script, installs or receipts; cannot detect installed state",
            info.name
        );
        InstallStatus::NotInstalled
    }

    /// Whether an item is present for removal purposes. An
    /// `uninstallcheck_script` short-circuits: exit 0 means "needs
    /// removal". Otherwise the regular installed-state decision applies.
    pub fn needs_removal(&self, info: &PkgInfo, receipts: &dyn ReceiptQuery) -> bool {
        if let Some(script) = &info.uninstallcheck_script {
            return match scripts::run_embedded_script("uninstallcheck", script) {
                Ok(0) => true,
                Ok(_) => false,
                Err(e) => {
                    log::warn!(
                        "uninstallcheck script for {} failed to run: {}",
                        info.name,
                        e
                    );
                    false
                }
            };
        }
        self.status(info, receipts).is_installed()
    }

    /// Evaluates one entry of the `installs` array.
    pub fn evaluate_installs_item(&self, item: &InstallsItem) -> ProbeResult {
        match item {
            InstallsItem::File { path, md5checksum } => {
                probe_file(Path::new(path), md5checksum.as_deref())
            }
            InstallsItem::Application {
                path,
                bundle_identifier,
                bundle_name,
                ..
            } => {
                if let Some(path) = path {
                    return self.probe_versioned(
                        &bundle_info_path(Path::new(path)),
                        item,
                    );
                }

                // No path given: consult the application registry by
                // bundle identifier, then by name.
                let candidates = self
                    .apps
                    .find(bundle_identifier.as_deref(), bundle_name.as_deref());
                if candidates.is_empty() {
                    log::debug!("Found no matching applications on disk");
                    return ProbeResult::NotPresent;
                }

                let mut end_result = ProbeResult::NotPresent;
                for app in candidates {
                    let result =
                        self.probe_versioned(&bundle_info_path(&app.path), item);
                    match result {
                        ProbeResult::Equal | ProbeResult::Higher => return result,
                        ProbeResult::Lower => end_result = ProbeResult::Lower,
                        _ => {}
                    }
                }
                end_result
            }
            InstallsItem::Bundle { path, .. } => {
                self.probe_versioned(&bundle_info_path(Path::new(path)), item)
            }
            InstallsItem::Plist { path, .. } => {
                self.probe_versioned(Path::new(path), item)
            }
        }
    }

    /// Compares the version in the plist at `plist_path` against the
    /// probe's expected version.
    fn probe_versioned(&self, plist_path: &Path, item: &InstallsItem) -> ProbeResult {
        if !plist_path.exists() {
            log::debug!("No plist found at {}", plist_path.display());
            return ProbeResult::NotPresent;
        }

        let value: plist::Value = match plist::from_file(plist_path) {
            Ok(v) => v,
            Err(_) => {
                log::debug!("{} may not be a plist", plist_path.display());
                return ProbeResult::NotPresent;
            }
        };
        let dict = match value.as_dictionary() {
            Some(d) => d,
            None => return ProbeResult::NotPresent,
        };

        let expected = match item.expected_version() {
            Some(v) => v,
            None => {
                log::warn!("No expected version for probe at {}", plist_path.display());
                return ProbeResult::NotPresent;
            }
        };

        let installed = dict
            .get(item.version_key())
            .and_then(value_as_version);
        let installed = match installed {
            Some(v) => v,
            None => {
                log::debug!("No version info in {}", plist_path.display());
                return ProbeResult::NotPresent;
            }
        };

        // An installed copy below minimum_update_version does not count as
        // an older install of this item; the item simply does not apply.
        if let Some(minimum) = item.minimum_update_version() {
            if &installed < minimum {
                log::debug!(
                    "Installed version {} is below minimum update version {}",
                    installed,
                    minimum
                );
                return ProbeResult::NotPresent;
            }
        }

        compare_versions(&installed, expected)
    }
}

fn bundle_info_path(bundle_path: &Path) -> std::path::PathBuf {
    bundle_path.join("Contents").join("Info.plist")
}

fn value_as_version(value: &plist::Value) -> Option<Version> {
    match value {
        plist::Value::String(s) => Some(Version::new(s)),
        plist::Value::Integer(i) => Some(Version::new(&i.to_string())),
        plist::Value::Real(r) => Some(Version::new(&r.to_string())),
        _ => None,
    }
}

fn compare_versions(installed: &Version, expected: &Version) -> ProbeResult {
    use std::cmp::Ordering;
    match installed.cmp(expected) {
        Ordering::Less => ProbeResult::Lower,
        Ordering::Equal => ProbeResult::Equal,
        Ordering::Greater => ProbeResult::Higher,
    }
}

fn probe_file(path: &Path, md5checksum: Option<&str>) -> ProbeResult {
    if !path.exists() {
        return ProbeResult::NotPresent;
    }
    let checksum = match md5checksum {
        Some(c) => c,
        None => return ProbeResult::Match,
    };

    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("Could not read {}: {}", path.display(), e);
            return ProbeResult::NotPresent;
        }
    };
    let mut hasher = Md5::new();
    hasher.input(&data);
    let on_disk = format!("{:x}", hasher.result());

    if on_disk.eq_ignore_ascii_case(checksum) {
        ProbeResult::Match
    } else {
        log::debug!(
            "Checksums differ at {}: expected {}, got {}",
            path.display(),
            checksum,
            on_disk
        );
        ProbeResult::Mismatch
    }
}

/// Folds probe results into an item status: every probe equal-or-better
/// means installed; any missing probe means not installed; otherwise at
/// least one lower (or mismatched) probe means an older install.
pub fn aggregate(results: &[ProbeResult]) -> InstallStatus {
    if results.is_empty() {
        return InstallStatus::NotInstalled;
    }
    if results.iter().any(|r| *r == ProbeResult::NotPresent) {
        return InstallStatus::NotInstalled;
    }
    if results
        .iter()
        .any(|r| matches!(r, ProbeResult::Lower | ProbeResult::Mismatch))
    {
        return InstallStatus::Older;
    }
    if results.iter().any(|r| *r == ProbeResult::Higher) {
        return InstallStatus::Newer;
    }
    InstallStatus::Current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiptdb::tests::FakeReceipts;
    use steward_types::pkginfo::Receipt;

    fn probe_with_apps(apps: Vec<AppRecord>) -> StateProbe {
        StateProbe::new(AppRegistry::from_records(apps))
    }

    #[test]
    fn test_aggregate_rules() {
        use InstallStatus::*;
        use ProbeResult::*;

        assert_eq!(aggregate(&[Equal, Higher]), Newer);
        assert_eq!(aggregate(&[Equal, Equal]), Current);
        assert_eq!(aggregate(&[Equal, Match]), Current);
        assert_eq!(aggregate(&[Equal, NotPresent]), NotInstalled);
        assert_eq!(aggregate(&[Lower, Equal]), Older);
        assert_eq!(aggregate(&[Lower, NotPresent]), NotInstalled);
        assert_eq!(aggregate(&[Mismatch]), Older);
        assert_eq!(aggregate(&[]), NotInstalled);
    }

    #[test]
    fn test_file_probe_with_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, b"hello").unwrap();

        // md5("hello")
        let good = "5d41402abc4b2a76b9719d911017c592";
        assert_eq!(probe_file(&path, Some(good)), ProbeResult::Match);
        assert_eq!(
            probe_file(&path, Some("00000000000000000000000000000000")),
            ProbeResult::Mismatch
        );
        assert_eq!(probe_file(&path, None), ProbeResult::Match);
        assert_eq!(
            probe_file(&tmp.path().join("missing"), None),
            ProbeResult::NotPresent
        );
    }

    #[test]
    fn test_application_probe_by_bundle_id() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = tmp.path().join("FooApp.app");
        apps::write_bundle(&bundle, "com.example.fooapp", "FooApp", "2.0");

        let probe = StateProbe::new(AppRegistry::scan(&[tmp.path().to_path_buf()]));
        let item = InstallsItem::Application {
            path: None,
            bundle_identifier: Some("com.example.fooapp".into()),
            bundle_name: None,
            short_version: Some(Version::new("2.0")),
            bundle_version: None,
            version_comparison_key: None,
            minimum_update_version: None,
        };
        assert_eq!(probe.evaluate_installs_item(&item), ProbeResult::Equal);

        let newer_wanted = InstallsItem::Application {
            path: None,
            bundle_identifier: Some("com.example.fooapp".into()),
            bundle_name: None,
            short_version: Some(Version::new("3.0")),
            bundle_version: None,
            version_comparison_key: None,
            minimum_update_version: None,
        };
        assert_eq!(
            probe.evaluate_installs_item(&newer_wanted),
            ProbeResult::Lower
        );
    }

    #[test]
    fn test_receipt_status() {
        let probe = probe_with_apps(vec![]);
        let receipts = FakeReceipts::with(&[("com.example.foo.pkg", "1.0")]);

        let info = PkgInfo::builder()
            .name("Foo")
            .version(Version::new("1.0"))
            .receipts(vec![Receipt::builder()
                .packageid("com.example.foo.pkg")
                .version(Version::new("1.0"))
                .build()])
            .build();
        assert_eq!(probe.status(&info, &receipts), InstallStatus::Current);

        let newer = PkgInfo::builder()
            .name("Foo")
            .version(Version::new("2.0"))
            .receipts(vec![Receipt::builder()
                .packageid("com.example.foo.pkg")
                .version(Version::new("2.0"))
                .build()])
            .build();
        assert_eq!(probe.status(&newer, &receipts), InstallStatus::Older);

        let missing = PkgInfo::builder()
            .name("Bar")
            .version(Version::new("1.0"))
            .receipts(vec![Receipt::builder()
                .packageid("com.example.bar.pkg")
                .version(Version::new("1.0"))
                .build()])
            .build();
        assert_eq!(probe.status(&missing, &receipts), InstallStatus::NotInstalled);
    }

    #[test]
    fn test_undetectable_item() {
        let probe = probe_with_apps(vec![]);
        let receipts = FakeReceipts::default();
        let info = PkgInfo::builder()
            .name("Ghost")
            .version(Version::new("1.0"))
            .build();
        assert_eq!(probe.status(&info, &receipts), InstallStatus::NotInstalled);
    }
}
