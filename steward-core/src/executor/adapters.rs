use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::receiptdb::{HostReceipt, ReceiptPath, ReceiptSource};

use steward_types::Version;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Not found")]
    NotFound,

    #[error("Command failed with exit code {0}")]
    Failed(i32),
}

/// Exit status plus restart hint, the whole contract between the core and
/// a native installer invocation.
#[derive(Debug, Clone, Copy)]
pub struct InstallOutcome {
    pub status: i32,
    pub needs_restart: bool,
}

impl InstallOutcome {
    pub fn ok() -> InstallOutcome {
        InstallOutcome {
            status: 0,
            needs_restart: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// Structured progress parsed from a native installer's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Percent(f32),
    Phase(String),
    Status(String),
}

/// Drives the platform's package installer command.
pub trait PackageInstaller {
    fn install(
        &self,
        pkg_path: &Path,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<InstallOutcome, ProcessError>;
}

/// Mounts and unmounts disk images holding copy-style payloads.
pub trait ImageMounter {
    fn mount(&self, image_path: &Path) -> Result<PathBuf, ProcessError>;
    fn unmount(&self, mountpoint: &Path) -> Result<(), ProcessError>;
}

/// Installs and removes configuration profiles.
pub trait ProfileManager {
    fn install(&self, profile_path: &Path, identifier: &str)
        -> Result<InstallOutcome, ProcessError>;
    fn remove(&self, identifier: &str) -> Result<InstallOutcome, ProcessError>;
}

/// Answers whether any of the named applications is currently running.
pub trait ProcessQuery {
    /// The first running blocking application, if any.
    fn any_running(&self, app_names: &[String]) -> Option<String>;
}

/// The full set of platform adapters the executor dispatches to. Native
/// implementations shell out to host utilities; tests substitute fakes.
pub struct Adapters {
    pub package_installer: Box<dyn PackageInstaller>,
    pub image_mounter: Box<dyn ImageMounter>,
    pub profiles: Box<dyn ProfileManager>,
    pub processes: Box<dyn ProcessQuery>,
    pub receipt_source: Box<dyn ReceiptSource>,
}

impl Adapters {
    pub fn native() -> Adapters {
        Adapters {
            package_installer: Box::new(NativePackageInstaller),
            image_mounter: Box::new(NativeImageMounter),
            profiles: Box::new(NativeProfileManager),
            processes: Box::new(NativeProcessQuery),
            receipt_source: Box::new(NativeReceiptSource),
        }
    }
}

/// Parses one line of `installer -verboseR` output.
///
/// The command reports percentage lines (`installer:%25.5`), phase lines
/// (`installer:PHASE:Preparing…`) and status lines
/// (`installer:STATUS:Running package scripts…`); anything else prefixed
/// `installer:` is surfaced as status text.
pub fn parse_installer_line(line: &str) -> Option<ProgressEvent> {
    let rest = line.strip_prefix("installer:")?;
    if let Some(percent) = rest.strip_prefix('%') {
        return percent.trim().parse::<f32>().ok().map(ProgressEvent::Percent);
    }
    if let Some(phase) = rest.strip_prefix("PHASE:") {
        return Some(ProgressEvent::Phase(phase.trim().to_string()));
    }
    if let Some(status) = rest.strip_prefix("STATUS:") {
        return Some(ProgressEvent::Status(status.trim().to_string()));
    }
    Some(ProgressEvent::Status(rest.trim().to_string()))
}

/// Whether an installer output line declares that a restart is needed.
pub fn line_requests_restart(line: &str) -> bool {
    line.contains("requires restarting now")
        || line.contains("RestartAction: RequireRestart")
        || line.contains("RestartAction: RecommendRestart")
}

struct NativePackageInstaller;

impl PackageInstaller for NativePackageInstaller {
    fn install(
        &self,
        pkg_path: &Path,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<InstallOutcome, ProcessError> {
        log::info!("Running installer for {}", pkg_path.display());
        let mut child = Command::new("/usr/sbin/installer")
            .arg("-verboseR")
            .arg("-pkg")
            .arg(pkg_path)
            .arg("-target")
            .arg("/")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut needs_restart = false;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                if line_requests_restart(&line) {
                    needs_restart = true;
                }
                if let Some(event) = parse_installer_line(&line) {
                    progress(event);
                }
            }
        }

        let status = child.wait()?;
        Ok(InstallOutcome {
            status: status.code().unwrap_or(-1),
            needs_restart,
        })
    }
}

struct NativeImageMounter;

impl ImageMounter for NativeImageMounter {
    fn mount(&self, image_path: &Path) -> Result<PathBuf, ProcessError> {
        log::info!("Mounting disk image {}", image_path.display());
        let output = Command::new("/usr/bin/hdiutil")
            .args(&["attach", "-nobrowse", "-noverify", "-plist"])
            .arg(image_path)
            .output()?;
        if !output.status.success() {
            return Err(ProcessError::Failed(output.status.code().unwrap_or(-1)));
        }

        parse_mountpoint(&output.stdout).ok_or(ProcessError::NotFound)
    }

    fn unmount(&self, mountpoint: &Path) -> Result<(), ProcessError> {
        log::info!("Unmounting {}", mountpoint.display());
        let output = Command::new("/usr/bin/hdiutil")
            .args(&["detach", "-force"])
            .arg(mountpoint)
            .output()?;
        if !output.status.success() {
            return Err(ProcessError::Failed(output.status.code().unwrap_or(-1)));
        }
        Ok(())
    }
}

/// Pulls the first mountpoint out of `hdiutil attach -plist` output.
fn parse_mountpoint(plist_bytes: &[u8]) -> Option<PathBuf> {
    let value: plist::Value = plist::from_reader_xml(plist_bytes).ok()?;
    let entities = value
        .as_dictionary()?
        .get("system-entities")?
        .as_array()?;
    for entity in entities {
        if let Some(point) = entity
            .as_dictionary()
            .and_then(|d| d.get("mount-point"))
            .and_then(|v| v.as_string())
        {
            return Some(PathBuf::from(point));
        }
    }
    None
}

struct NativeProfileManager;

impl ProfileManager for NativeProfileManager {
    fn install(
        &self,
        profile_path: &Path,
        identifier: &str,
    ) -> Result<InstallOutcome, ProcessError> {
        log::info!("Installing profile {} ({})", identifier, profile_path.display());
        let output = Command::new("/usr/bin/profiles")
            .args(&["install", "-path"])
            .arg(profile_path)
            .output()?;
        Ok(InstallOutcome {
            status: output.status.code().unwrap_or(-1),
            needs_restart: false,
        })
    }

    fn remove(&self, identifier: &str) -> Result<InstallOutcome, ProcessError> {
        log::info!("Removing profile {}", identifier);
        let output = Command::new("/usr/bin/profiles")
            .args(&["remove", "-identifier", identifier])
            .output()?;
        Ok(InstallOutcome {
            status: output.status.code().unwrap_or(-1),
            needs_restart: false,
        })
    }
}

struct NativeProcessQuery;

impl ProcessQuery for NativeProcessQuery {
    fn any_running(&self, app_names: &[String]) -> Option<String> {
        if app_names.is_empty() {
            return None;
        }
        let output = Command::new("/bin/ps")
            .args(&["-axo", "comm="])
            .output()
            .ok()?;
        let listing = String::from_utf8_lossy(&output.stdout);

        for wanted in app_names {
            let stem = wanted.trim_end_matches(".app");
            for line in listing.lines() {
                let proc_name = line.rsplit('/').next().unwrap_or(line).trim();
                if proc_name.eq_ignore_ascii_case(stem) {
                    return Some(wanted.clone());
                }
            }
        }
        None
    }
}

struct NativeReceiptSource;

impl ReceiptSource for NativeReceiptSource {
    fn receipts(&self) -> Result<Vec<HostReceipt>, Box<dyn std::error::Error + Send + Sync>> {
        // `pkgutil --pkgs` then one `--export-plist` per package.
        let output = Command::new("/usr/sbin/pkgutil").arg("--pkgs").output()?;
        if !output.status.success() {
            return Err("could not enumerate host receipts".into());
        }
        let ids = String::from_utf8_lossy(&output.stdout);

        let mut receipts = Vec::new();
        for packageid in ids.lines().map(str::trim).filter(|s| !s.is_empty()) {
            match self.export(packageid) {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => log::warn!("Could not read receipt for {}: {}", packageid, e),
            }
        }
        Ok(receipts)
    }

    fn newest_receipt_time(&self) -> Option<std::time::SystemTime> {
        let receipts_dir = Path::new("/var/db/receipts");
        let entries = std::fs::read_dir(receipts_dir).ok()?;
        entries
            .flatten()
            .filter_map(|entry| entry.metadata().ok())
            .filter_map(|meta| meta.modified().ok())
            .max()
    }

    fn forget(&self, packageid: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let output = Command::new("/usr/sbin/pkgutil")
            .args(&["--forget", packageid])
            .output()?;
        if !output.status.success() {
            return Err(format!("could not forget receipt for {}", packageid).into());
        }
        Ok(())
    }
}

impl NativeReceiptSource {
    fn export(
        &self,
        packageid: &str,
    ) -> Result<HostReceipt, Box<dyn std::error::Error + Send + Sync>> {
        let output = Command::new("/usr/sbin/pkgutil")
            .args(&["--export-plist", packageid])
            .output()?;
        if !output.status.success() {
            return Err(format!("pkgutil exited with {:?}", output.status.code()).into());
        }

        let value: plist::Value = plist::from_reader_xml(output.stdout.as_slice())?;
        let dict = value.as_dictionary().ok_or("receipt is not a dictionary")?;

        let version = dict
            .get("pkg-version")
            .and_then(|v| v.as_string())
            .unwrap_or("0");
        let volume = dict.get("volume").and_then(|v| v.as_string()).unwrap_or("/");
        let location = dict
            .get("install-location")
            .and_then(|v| v.as_string())
            .unwrap_or("");
        let install_location = Path::new(volume)
            .join(location.trim_start_matches('/'))
            .to_string_lossy()
            .into_owned();

        let mut paths = Vec::new();
        if let Some(path_dict) = dict.get("paths").and_then(|v| v.as_dictionary()) {
            for (path, meta) in path_dict {
                let meta = meta.as_dictionary();
                let field = |key: &str| {
                    meta.and_then(|m| m.get(key))
                        .and_then(|v| v.as_signed_integer())
                        .unwrap_or(0) as u32
                };
                paths.push(ReceiptPath {
                    path: path.clone(),
                    uid: field("uid"),
                    gid: field("gid"),
                    mode: field("mode"),
                });
            }
        }

        Ok(HostReceipt {
            packageid: packageid.to_string(),
            version: Version::new(version),
            install_location,
            paths,
        })
    }
}
