use serde::{Deserialize, Serialize};

use crate::pkginfo::PkgInfo;
use crate::version::Version;

/// One scheduled install or removal: a snapshot of the resolved pkginfo
/// plus the bookkeeping the executor needs. Snapshots are persisted so the
/// install phase never re-consults catalogs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    #[serde(flatten)]
    pub info: PkgInfo,

    /// Cache filename of the downloaded payload (basename of
    /// `installer_item_location`), set by the download scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_item: Option<String>,

    /// For receipt-based removal: the package ids to remove, computed at
    /// resolve time from the item's receipts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,

    /// Observed download throughput, for the report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_kbytes_per_sec: Option<u64>,

    /// Why the item is in `problem_items`, when it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PlanItem {
    pub fn new(info: PkgInfo) -> PlanItem {
        PlanItem {
            info,
            installer_item: None,
            packages: Vec::new(),
            download_kbytes_per_sec: None,
            note: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn version(&self) -> &Version {
        &self.info.version
    }

    /// All prerequisite references of this item: `requires` plus
    /// `update_for`. Used for skip propagation.
    pub fn prerequisites(&self) -> impl Iterator<Item = &str> {
        self.info
            .requires
            .iter()
            .chain(self.info.update_for.iter())
            .map(|s| s.as_str())
    }
}

/// An item that could not be scheduled, with a human-readable note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemItem {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    pub note: String,
}

/// Display snapshot of one optional install, for the UI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionalDisplayItem {
    pub name: String,
    pub version: Version,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub installed: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub featured: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_item_size: Option<u64>,
}

/// The install plan persisted between the check phase and the install
/// phase, conventionally `InstallInfo.plist`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallPlan {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_installs: Vec<PlanItem>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removals: Vec<PlanItem>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_installs: Vec<OptionalDisplayItem>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problem_items: Vec<ProblemItem>,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.managed_installs.is_empty() && self.removals.is_empty()
    }

    /// Cache basenames referenced by pending installs. Files outside this
    /// set are stale and may be purged.
    pub fn referenced_cache_files(&self) -> Vec<&str> {
        self.managed_installs
            .iter()
            .filter_map(|item| {
                item.installer_item
                    .as_deref()
                    .or_else(|| item.info.installer_item_basename())
            })
            .collect()
    }
}
