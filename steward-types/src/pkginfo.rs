use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::version::Version;

/// Metadata record describing one installable software item.
///
/// Administrators extend pkginfo with their own keys; anything this struct
/// does not model lands in `extra` and survives a round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct PkgInfo {
    #[builder(setter(into))]
    pub name: String,

    #[builder(setter(into))]
    pub version: Version,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub catalogs: Vec<String>,

    #[serde(default)]
    #[builder(default)]
    pub installer_type: InstallerType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub installer_item_location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub installer_item_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub installer_item_size: Option<u64>,

    /// Size on disk once installed, in kilobytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub installed_size: Option<u64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub uninstallable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub uninstall_method: Option<UninstallMethod>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub installs: Vec<InstallsItem>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub receipts: Vec<Receipt>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub requires: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub update_for: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub blocking_applications: Vec<String>,

    #[serde(
        rename = "RestartAction",
        default,
        skip_serializing_if = "RestartAction::is_none"
    )]
    #[builder(default)]
    pub restart_action: RestartAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub minimum_os_version: Option<Version>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub maximum_os_version: Option<Version>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub supported_architectures: Vec<String>,

    #[serde(
        rename = "minimum_munki_version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[builder(default)]
    pub minimum_agent_version: Option<Version>,

    /// Predicate over host facts gating installability, e.g.
    /// `machine_type == "laptop" AND os_vers >= "11.0"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub installable_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub force_install_after_date: Option<plist::Date>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub unattended_install: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub unattended_uninstall: bool,

    /// Install again every time the user asks, regardless of installed state.
    #[serde(rename = "OnDemand", default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub on_demand: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub featured: bool,

    /// Relative paths of items to copy out of a mounted disk image, for the
    /// `disk_image_copy` installer type and `remove_copied_items` removal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub items_to_copy: Vec<ItemToCopy>,

    /// Payload identifier for configuration profiles.
    #[serde(
        rename = "PayloadIdentifier",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[builder(default)]
    pub payload_identifier: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub installcheck_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub uninstallcheck_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub preinstall_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub postinstall_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub preuninstall_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub postuninstall_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub uninstall_script: Option<String>,

    /// Administrator-defined keys we don't model, preserved verbatim.
    #[serde(flatten)]
    #[builder(default)]
    pub extra: BTreeMap<String, plist::Value>,
}

impl PkgInfo {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// `name-version`, the identity of this record within a catalog.
    pub fn name_and_version(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Cache filename for the installer payload, the basename of
    /// `installer_item_location`.
    pub fn installer_item_basename(&self) -> Option<&str> {
        self.installer_item_location
            .as_deref()
            .map(|loc| loc.rsplit('/').next().unwrap_or(loc))
    }
}

impl fmt::Display for PkgInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerType {
    PlatformPackage,
    DiskImageCopy,
    BundleCopyFromImage,
    ConfigurationProfile,
    ScriptOnly,
    AppleUpdateMetadata,
    Nopkg,
}

impl Default for InstallerType {
    fn default() -> Self {
        InstallerType::PlatformPackage
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallMethod {
    ReceiptRemoval,
    RemoveCopiedItems,
    RemoveProfile,
    UninstallScript,
    /// Installer-specific removal command, named by the administrator.
    InstallerSpecific(String),
}

impl UninstallMethod {
    pub fn as_str(&self) -> &str {
        match self {
            UninstallMethod::ReceiptRemoval => "receipt_removal",
            UninstallMethod::RemoveCopiedItems => "remove_copied_items",
            UninstallMethod::RemoveProfile => "remove_profile",
            UninstallMethod::UninstallScript => "uninstall_script",
            UninstallMethod::InstallerSpecific(name) => name,
        }
    }
}

impl fmt::Display for UninstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for UninstallMethod {
    fn from(raw: &str) -> UninstallMethod {
        match raw {
            "receipt_removal" => UninstallMethod::ReceiptRemoval,
            "remove_copied_items" => UninstallMethod::RemoveCopiedItems,
            "remove_profile" => UninstallMethod::RemoveProfile,
            "uninstall_script" => UninstallMethod::UninstallScript,
            other => UninstallMethod::InstallerSpecific(other.to_string()),
        }
    }
}

impl Serialize for UninstallMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UninstallMethod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(UninstallMethod::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartAction {
    None,
    LogoutRequired,
    RestartRequired,
    RestartRecommended,
    LogoutRecommended,
}

impl RestartAction {
    pub fn is_none(&self) -> bool {
        *self == RestartAction::None
    }

    /// Whether a successful install/removal of an item with this action
    /// should raise the session's restart flag.
    pub fn wants_restart(&self) -> bool {
        matches!(
            self,
            RestartAction::RestartRequired | RestartAction::RestartRecommended
        )
    }
}

impl Default for RestartAction {
    fn default() -> Self {
        RestartAction::None
    }
}

/// One entry of an item's `installs` array: a description of how to detect
/// installed state on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallsItem {
    Application {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(
            rename = "CFBundleIdentifier",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        bundle_identifier: Option<String>,
        #[serde(
            rename = "CFBundleName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        bundle_name: Option<String>,
        #[serde(
            rename = "CFBundleShortVersionString",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        short_version: Option<Version>,
        #[serde(
            rename = "CFBundleVersion",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        bundle_version: Option<Version>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_comparison_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_update_version: Option<Version>,
    },
    Bundle {
        path: String,
        #[serde(
            rename = "CFBundleShortVersionString",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        short_version: Option<Version>,
        #[serde(
            rename = "CFBundleVersion",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        bundle_version: Option<Version>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_comparison_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_update_version: Option<Version>,
    },
    Plist {
        path: String,
        #[serde(
            rename = "CFBundleShortVersionString",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        short_version: Option<Version>,
        #[serde(
            rename = "CFBundleVersion",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        bundle_version: Option<Version>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_comparison_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_update_version: Option<Version>,
    },
    File {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        md5checksum: Option<String>,
    },
}

impl InstallsItem {
    pub fn path(&self) -> Option<&str> {
        match self {
            InstallsItem::Application { path, .. } => path.as_deref(),
            InstallsItem::Bundle { path, .. }
            | InstallsItem::Plist { path, .. }
            | InstallsItem::File { path, .. } => Some(path),
        }
    }

    /// The version the probe expects, honoring `version_comparison_key`:
    /// default `CFBundleShortVersionString`, else `CFBundleVersion`.
    pub fn expected_version(&self) -> Option<&Version> {
        let (short, bundle, key) = match self {
            InstallsItem::Application {
                short_version,
                bundle_version,
                version_comparison_key,
                ..
            }
            | InstallsItem::Bundle {
                short_version,
                bundle_version,
                version_comparison_key,
                ..
            }
            | InstallsItem::Plist {
                short_version,
                bundle_version,
                version_comparison_key,
                ..
            } => (short_version, bundle_version, version_comparison_key),
            InstallsItem::File { .. } => return None,
        };

        match key.as_deref() {
            Some("CFBundleVersion") => bundle.as_ref(),
            Some("CFBundleShortVersionString") => short.as_ref(),
            Some(_) => None,
            None => short.as_ref().or_else(|| bundle.as_ref()),
        }
    }

    /// The plist key the installed version is read from.
    pub fn version_key(&self) -> &str {
        match self {
            InstallsItem::Application {
                short_version,
                version_comparison_key,
                ..
            }
            | InstallsItem::Bundle {
                short_version,
                version_comparison_key,
                ..
            }
            | InstallsItem::Plist {
                short_version,
                version_comparison_key,
                ..
            } => match version_comparison_key {
                Some(key) => key,
                None if short_version.is_some() => "CFBundleShortVersionString",
                None => "CFBundleVersion",
            },
            InstallsItem::File { .. } => "",
        }
    }

    pub fn minimum_update_version(&self) -> Option<&Version> {
        match self {
            InstallsItem::Application {
                minimum_update_version,
                ..
            }
            | InstallsItem::Bundle {
                minimum_update_version,
                ..
            }
            | InstallsItem::Plist {
                minimum_update_version,
                ..
            } => minimum_update_version.as_ref(),
            InstallsItem::File { .. } => None,
        }
    }
}

/// Evidence that a platform package was installed, for receipt-based state
/// detection and removal.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Receipt {
    #[builder(setter(into))]
    pub packageid: String,

    #[builder(setter(into))]
    pub version: Version,

    /// Optional receipts are ignored by the installed-state probe; they
    /// record packages the installer may or may not lay down.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub optional: bool,
}

/// One item copied out of a mounted disk image onto the destination volume.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ItemToCopy {
    #[builder(setter(into))]
    pub source_item: String,

    #[builder(setter(into))]
    pub destination_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub destination_item: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub group: Option<String>,

    /// Octal mode string, e.g. `"755"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub mode: Option<String>,
}

impl ItemToCopy {
    /// Full destination path: `destination_path` joined with the item's
    /// basename (or `destination_item` when renaming on copy).
    pub fn full_destination_path(&self) -> String {
        let basename = self
            .destination_item
            .as_deref()
            .unwrap_or_else(|| {
                self.source_item
                    .rsplit('/')
                    .next()
                    .unwrap_or(&self.source_item)
            });
        format!(
            "{}/{}",
            self.destination_path.trim_end_matches('/'),
            basename
        )
    }
}
