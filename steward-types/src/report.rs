use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Outcome of one install or removal attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResult {
    pub display_name: String,
    pub name: String,
    pub version: Version,

    /// Exit status of the operation; 0 is success, negative codes are
    /// agent-internal failures.
    pub status: i32,

    pub duration_seconds: u64,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unattended: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_kbytes_per_sec: Option<u64>,
}

impl InstallResult {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// Per-run record written at session end, conventionally
/// `ManagedInstallReport.plist`. Complete for every run: every item the
/// resolver saw appears either here or in the plan's problem list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "StartTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(rename = "EndTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,

    #[serde(rename = "ManifestName", default, skip_serializing_if = "Option::is_none")]
    pub manifest_name: Option<String>,

    /// Whether the run fell back to cached catalogs/manifests because the
    /// repository was unreachable.
    #[serde(rename = "OfflineCheck", default, skip_serializing_if = "std::ops::Not::not")]
    pub offline_check: bool,

    #[serde(rename = "ItemsToInstall", default, skip_serializing_if = "Vec::is_empty")]
    pub items_to_install: Vec<ReportItem>,

    #[serde(rename = "ItemsToRemove", default, skip_serializing_if = "Vec::is_empty")]
    pub items_to_remove: Vec<ReportItem>,

    #[serde(rename = "InstallResults", default, skip_serializing_if = "Vec::is_empty")]
    pub install_results: Vec<InstallResult>,

    #[serde(rename = "RemovalResults", default, skip_serializing_if = "Vec::is_empty")]
    pub removal_results: Vec<InstallResult>,

    #[serde(rename = "SkippedItems", default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_items: Vec<SkippedItem>,

    #[serde(rename = "ProblemItems", default, skip_serializing_if = "Vec::is_empty")]
    pub problem_items: Vec<crate::plan::ProblemItem>,

    #[serde(rename = "Warnings", default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    #[serde(rename = "Errors", default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(rename = "RestartRequired", default, skip_serializing_if = "std::ops::Not::not")]
    pub restart_required: bool,
}

/// Summary line for a planned install or removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportItem {
    pub display_name: String,
    pub name: String,
    pub version: Version,
}

/// An item deferred in this run, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedItem {
    pub name: String,
    pub version: Version,
    pub note: String,
}

impl Report {
    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        log::warn!("{}", msg);
        self.warnings.push(msg);
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        log::error!("{}", msg);
        self.errors.push(msg);
    }

    pub fn install_failures(&self) -> bool {
        self.install_results.iter().any(|r| !r.succeeded())
            || self.removal_results.iter().any(|r| !r.succeeded())
    }
}
