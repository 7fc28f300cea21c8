use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No default managed-installs directory found for this platform")]
    NoDefaultPath,

    #[error("Error loading settings.toml file")]
    SettingsFile(#[source] FileError),

    #[error("Could not create managed-installs directory at {}", .1.display())]
    CreateDir(#[source] std::io::Error, PathBuf),
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("The file is read only and could not be written to")]
    ReadOnly,

    #[error("Could not read file")]
    Read(#[source] std::io::Error),

    #[error("Could not write file")]
    Write(#[source] std::io::Error),

    #[error("Could not convert from TOML format")]
    FromToml(#[from] toml::de::Error),

    #[error("Could not convert into TOML format")]
    ToToml(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

/// Persisted agent settings, loaded from `settings.toml` under the
/// managed-installs directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL or path of the software repository.
    pub repo_url: Option<Url>,

    /// Identifier used to select this client's manifest; defaults to the
    /// hostname, then `site_default`.
    #[serde(default)]
    pub client_identifier: Option<String>,

    /// Safety margin added to the disk-space check, in kilobytes.
    #[serde(default = "default_space_margin_kb")]
    pub space_margin_kb: u64,

    /// Delete whole application bundles during receipt-based removal even
    /// when their directories are not empty.
    #[serde(default)]
    pub force_delete_bundles: bool,
}

fn default_space_margin_kb() -> u64 {
    // 100 MB, matching the long-standing fudge factor.
    100_000
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            repo_url: None,
            client_identifier: None,
            space_margin_kb: default_space_margin_kb(),
            force_delete_bundles: false,
        }
    }
}

impl Settings {
    fn load(path: &Path) -> Result<Settings, FileError> {
        let text = fs::read_to_string(path).map_err(FileError::Read)?;
        Ok(toml::from_str(&text)?)
    }

    fn save(&self, path: &Path) -> Result<(), FileError> {
        let bytes = toml::to_vec(self)?;
        let mut file = File::create(path).map_err(FileError::Write)?;
        file.write_all(&bytes).map_err(FileError::Write)?;
        Ok(())
    }

    fn create(path: &Path) -> Result<Settings, FileError> {
        let settings = Settings::default();
        settings.save(path)?;
        Ok(settings)
    }
}

/// Session-scoped configuration: the managed-installs directory layout plus
/// loaded settings. Passed explicitly through the call graph; there are no
/// process-wide singletons.
#[derive(Debug, Clone)]
pub struct Config {
    base_dir: PathBuf,
    settings: Settings,
    permission: Permission,
}

impl Config {
    pub fn load_default() -> Result<Config, Error> {
        let base = default_base_dir().ok_or(Error::NoDefaultPath)?;
        Self::load(base, Permission::ReadWrite)
    }

    pub fn load<P: AsRef<Path>>(base_dir: P, permission: Permission) -> Result<Config, Error> {
        let base_dir = base_dir.as_ref().to_path_buf();

        if permission == Permission::ReadWrite {
            for dir in &[
                base_dir.clone(),
                base_dir.join("Cache"),
                base_dir.join("catalogs"),
                base_dir.join("manifests"),
            ] {
                fs::create_dir_all(dir).map_err(|e| Error::CreateDir(e, dir.clone()))?;
            }
        }

        let settings_path = base_dir.join("settings.toml");
        let settings = match Settings::load(&settings_path) {
            Ok(v) => v,
            Err(FileError::Read(_)) if permission != Permission::ReadOnly => {
                Settings::create(&settings_path).map_err(Error::SettingsFile)?
            }
            Err(e) => return Err(Error::SettingsFile(e)),
        };

        Ok(Config {
            base_dir,
            settings,
            permission,
        })
    }

    pub fn new(base_dir: PathBuf, settings: Settings) -> Config {
        Config {
            base_dir,
            settings,
            permission: Permission::ReadWrite,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `Cache/` — downloaded installer payloads.
    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("Cache")
    }

    /// `catalogs/` — cached catalog documents.
    pub fn catalogs_dir(&self) -> PathBuf {
        self.base_dir.join("catalogs")
    }

    /// `manifests/` — cached manifests and the self-serve manifest.
    pub fn manifests_dir(&self) -> PathBuf {
        self.base_dir.join("manifests")
    }

    pub fn install_plan_path(&self) -> PathBuf {
        self.base_dir.join("InstallInfo.plist")
    }

    pub fn report_path(&self) -> PathBuf {
        self.base_dir.join("ManagedInstallReport.plist")
    }

    pub fn self_serve_manifest_path(&self) -> PathBuf {
        self.manifests_dir().join("SelfServeManifest")
    }

    pub fn profile_receipts_path(&self) -> PathBuf {
        self.base_dir.join("ConfigProfileData.plist")
    }

    pub fn package_db_path(&self) -> PathBuf {
        self.base_dir.join("pkgdata.sqlite")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join("steward.lock")
    }

    /// Presence of this file requests a stop between items.
    pub fn stop_requested_path(&self) -> PathBuf {
        self.base_dir.join("stop_requested")
    }

    /// Presence of this file tells an external logout helper to run the
    /// install phase at next logout.
    pub fn install_at_logout_path(&self) -> PathBuf {
        self.base_dir.join("InstallAtLogout")
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested_path().exists()
    }

    /// The manifest name to fetch for this client.
    pub fn client_identifier(&self) -> String {
        if let Some(id) = self
            .settings
            .client_identifier
            .as_ref()
            .filter(|s| !s.is_empty())
        {
            return id.clone();
        }

        match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(_) => "site_default".to_string(),
        }
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        return Some(PathBuf::from("/Library/Managed Installs"));
    }
    directories::ProjectDirs::from("", "", "steward")
        .map(|dirs| dirs.data_dir().to_path_buf())
}
