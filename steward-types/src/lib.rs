#![deny(rust_2018_idioms)]

pub mod catalog;
pub mod manifest;
pub mod pkginfo;
pub mod plan;
pub mod report;
pub mod version;

pub use catalog::Catalog;
pub use manifest::{ConditionalItems, Manifest, SelfServeManifest};
pub use pkginfo::{
    InstallerType, InstallsItem, ItemToCopy, PkgInfo, Receipt, RestartAction, UninstallMethod,
};
pub use plan::{InstallPlan, OptionalDisplayItem, PlanItem, ProblemItem};
pub use report::{InstallResult, Report, ReportItem, SkippedItem};
pub use version::Version;
