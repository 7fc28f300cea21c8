use std::collections::HashSet;

use thiserror::Error;

use steward_types::manifest::{ConditionalItems, Manifest, SelfServeManifest};
use steward_types::plan::{OptionalDisplayItem, PlanItem, ProblemItem};
use steward_types::{PkgInfo, Version};

use crate::catalogdb::{split_name_and_version, CatalogDb};
use crate::conditions::Facts;
use crate::probe::{InstallStatus, StateProbe};
use crate::receiptdb::ReceiptQuery;

/// The agent's own version, gating items that declare
/// `minimum_agent_version`.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ManifestLoadError {
    #[error("Manifest not found: {0}")]
    NotFound(String),

    #[error("Could not read manifest {0}")]
    Read(String, #[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Manifest {0} is malformed")]
    Parse(String, #[source] plist::Error),
}

/// Provides manifest documents by name during expansion. The session loads
/// them from the repository cache; tests provide them from memory.
pub trait ManifestLoader {
    fn load(&self, name: &str) -> Result<Manifest, ManifestLoadError>;
}

/// The effective manifest: every included manifest inlined, matching
/// conditional sublists merged, self-serve choices applied.
#[derive(Debug, Clone, Default)]
pub struct EffectiveManifest {
    pub catalogs: Vec<String>,
    pub managed_installs: Vec<String>,
    pub managed_uninstalls: Vec<String>,
    pub managed_updates: Vec<String>,
    pub optional_installs: Vec<String>,
    pub featured_items: Vec<String>,
}

impl EffectiveManifest {
    fn push_unique(list: &mut Vec<String>, value: &str) {
        if !list.iter().any(|existing| existing == value) {
            list.push(value.to_string());
        }
    }

    fn merge_lists(&mut self, manifest: &ManifestLists<'_>) {
        for name in manifest.catalogs {
            Self::push_unique(&mut self.catalogs, name);
        }
        for name in manifest.managed_installs {
            Self::push_unique(&mut self.managed_installs, name);
        }
        for name in manifest.managed_uninstalls {
            Self::push_unique(&mut self.managed_uninstalls, name);
        }
        for name in manifest.managed_updates {
            Self::push_unique(&mut self.managed_updates, name);
        }
        for name in manifest.optional_installs {
            Self::push_unique(&mut self.optional_installs, name);
        }
        for name in manifest.featured_items {
            Self::push_unique(&mut self.featured_items, name);
        }
    }
}

struct ManifestLists<'a> {
    catalogs: &'a [String],
    managed_installs: &'a [String],
    managed_uninstalls: &'a [String],
    managed_updates: &'a [String],
    optional_installs: &'a [String],
    featured_items: &'a [String],
}

/// Recursively expands a manifest. A manifest referenced twice anywhere in
/// the inclusion graph is inlined once; the repeat is silently skipped.
pub fn expand_manifest(
    root_name: &str,
    loader: &dyn ManifestLoader,
    facts: &Facts,
    self_serve: &SelfServeManifest,
) -> Result<EffectiveManifest, ManifestLoadError> {
    let mut effective = EffectiveManifest::default();
    let mut visited = HashSet::new();
    expand_into(root_name, loader, facts, &mut effective, &mut visited)?;

    // Self-serve choices join the managed lists; explicit uninstalls win
    // over installs.
    for name in &self_serve.managed_installs {
        EffectiveManifest::push_unique(&mut effective.managed_installs, name);
    }
    for name in &self_serve.managed_uninstalls {
        EffectiveManifest::push_unique(&mut effective.managed_uninstalls, name);
    }
    let uninstalls: HashSet<&str> = effective
        .managed_uninstalls
        .iter()
        .map(|s| s.as_str())
        .collect();
    effective
        .managed_installs
        .retain(|name| !uninstalls.contains(name.as_str()));

    Ok(effective)
}

fn expand_into(
    name: &str,
    loader: &dyn ManifestLoader,
    facts: &Facts,
    effective: &mut EffectiveManifest,
    visited: &mut HashSet<String>,
) -> Result<(), ManifestLoadError> {
    if !visited.insert(name.to_string()) {
        log::debug!("Manifest {} already included; skipping repeat", name);
        return Ok(());
    }

    let manifest = loader.load(name)?;
    log::debug!("Expanding manifest {}", name);

    effective.merge_lists(&ManifestLists {
        catalogs: &manifest.catalogs,
        managed_installs: &manifest.managed_installs,
        managed_uninstalls: &manifest.managed_uninstalls,
        managed_updates: &manifest.managed_updates,
        optional_installs: &manifest.optional_installs,
        featured_items: &manifest.featured_items,
    });

    for conditional in &manifest.conditional_items {
        merge_conditional(conditional, loader, facts, effective, visited)?;
    }

    for included in &manifest.included_manifests {
        match expand_into(included, loader, facts, effective, visited) {
            Ok(()) => {}
            Err(ManifestLoadError::NotFound(missing)) => {
                // A missing included manifest is not fatal; the rest of the
                // expansion stands.
                log::warn!("Included manifest {} not found", missing);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

fn merge_conditional(
    conditional: &ConditionalItems,
    loader: &dyn ManifestLoader,
    facts: &Facts,
    effective: &mut EffectiveManifest,
    visited: &mut HashSet<String>,
) -> Result<(), ManifestLoadError> {
    match facts.evaluate(&conditional.condition) {
        Ok(true) => {}
        Ok(false) => {
            log::debug!("Condition `{}` is false; skipping", conditional.condition);
            return Ok(());
        }
        Err(e) => {
            log::warn!(
                "Could not evaluate condition `{}`: {}",
                conditional.condition,
                e
            );
            return Ok(());
        }
    }

    effective.merge_lists(&ManifestLists {
        catalogs: &[],
        managed_installs: &conditional.managed_installs,
        managed_uninstalls: &conditional.managed_uninstalls,
        managed_updates: &conditional.managed_updates,
        optional_installs: &conditional.optional_installs,
        featured_items: &conditional.featured_items,
    });

    for nested in &conditional.conditional_items {
        merge_conditional(nested, loader, facts, effective, visited)?;
    }

    for included in &conditional.included_manifests {
        if let Err(ManifestLoadError::NotFound(missing)) =
            expand_into(included, loader, facts, effective, visited)
        {
            log::warn!("Included manifest {} not found", missing);
        }
    }

    Ok(())
}

/// Output of a resolve pass: the ordered plan plus everything that could
/// not be scheduled.
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    pub install_list: Vec<PlanItem>,
    pub removals: Vec<PlanItem>,
    pub optional_installs: Vec<OptionalDisplayItem>,
    pub problem_items: Vec<ProblemItem>,
}

/// The dependency resolver. Consumes the catalog database and the
/// installed-state probe, emits an ordered plan.
pub struct Resolver<'a> {
    pub catalogs: &'a CatalogDb,
    pub probe: &'a StateProbe,
    pub receipts: &'a dyn ReceiptQuery,
    pub facts: &'a Facts,
    pub self_serve: &'a SelfServeManifest,
    /// Safety margin for the disk-space check, in kilobytes.
    pub space_margin_kb: u64,
}

struct ResolveState {
    outcome: ResolveOutcome,
    /// Names scheduled for install in this pass.
    scheduled: HashSet<String>,
    /// Names found installed at a satisfying version.
    up_to_date: HashSet<String>,
    /// Names that failed to schedule, so repeats don't re-report.
    failed: HashSet<String>,
    /// Names scheduled for removal.
    removing: HashSet<String>,
    /// Requested removals, consulted when a dependency pull conflicts.
    uninstall_requests: HashSet<String>,
    /// Cycle guards.
    install_stack: Vec<String>,
    removal_stack: Vec<String>,
}

impl<'a> Resolver<'a> {
    pub fn resolve(&self, manifest: &EffectiveManifest) -> ResolveOutcome {
        let mut state = ResolveState {
            outcome: ResolveOutcome::default(),
            scheduled: HashSet::new(),
            up_to_date: HashSet::new(),
            failed: HashSet::new(),
            removing: HashSet::new(),
            uninstall_requests: manifest
                .managed_uninstalls
                .iter()
                .map(|reference| split_name_and_version(reference).0.to_string())
                .collect(),
            install_stack: Vec::new(),
            removal_stack: Vec::new(),
        };

        for reference in &manifest.managed_installs {
            log::debug!("Processing managed install {}", reference);
            self.process_install(reference, &mut state);
        }

        for reference in &manifest.managed_updates {
            log::debug!("Processing managed update {}", reference);
            self.process_managed_update(reference, &mut state);
        }

        for reference in &manifest.managed_uninstalls {
            log::debug!("Processing managed uninstall {}", reference);
            self.process_removal(reference, &mut state);
        }

        self.build_optional_display(manifest, &mut state);
        self.enforce_disk_budget(&mut state);

        state.outcome
    }

    /// Schedules one install reference, dependencies first. Returns true
    /// when the item is satisfied: already installed or now scheduled.
    fn process_install(&self, reference: &str, state: &mut ResolveState) -> bool {
        let (name, wanted_version) = split_name_and_version(reference);

        if state.scheduled.contains(name) || state.up_to_date.contains(name) {
            return true;
        }
        if state.failed.contains(name) {
            return false;
        }
        if state.install_stack.iter().any(|n| n == name) {
            log::warn!("Circular dependency at {}; breaking cycle", name);
            return true;
        }
        if state.uninstall_requests.contains(name) {
            // A dependency pull cannot override an explicit removal.
            log::debug!("{} is scheduled for removal; not installing", name);
            state.failed.insert(name.to_string());
            return false;
        }

        let item = match self.catalogs.resolve(reference) {
            Some(item) => item.clone(),
            None => {
                self.problem(state, name, None, "not found in catalogs");
                state.failed.insert(name.to_string());
                return false;
            }
        };

        if let Err(note) = self.check_installable(&item) {
            self.problem(state, &item.name, Some(item.version.clone()), &note);
            state.failed.insert(name.to_string());
            return false;
        }

        let status = self.probe.status(&item, self.receipts);
        let on_demand_requested = item.on_demand
            && self
                .self_serve
                .managed_installs
                .iter()
                .any(|chosen| chosen == name);

        let needs_install = match status {
            InstallStatus::NotInstalled | InstallStatus::Older => true,
            // An OnDemand self-serve choice re-runs even when installed.
            InstallStatus::Current | InstallStatus::Newer => on_demand_requested,
        };

        if !needs_install {
            log::debug!("{} is already installed at a satisfying version", name);
            state.up_to_date.insert(name.to_string());
            self.process_updates(name, state);
            return true;
        }

        if wanted_version.is_none() && status == InstallStatus::Older {
            log::info!("Update available for {}", name);
        }

        state.install_stack.push(name.to_string());
        for required in item.requires.clone() {
            log::debug!("{} requires {}", name, required);
            if !self.process_install(&required, state) {
                state.install_stack.pop();
                self.problem(
                    state,
                    &item.name,
                    Some(item.version.clone()),
                    &format!("dependency {} could not be resolved", required),
                );
                state.failed.insert(name.to_string());
                return false;
            }
        }
        state.install_stack.pop();

        log::info!("Scheduling {}-{} for install", item.name, item.version);
        state.scheduled.insert(name.to_string());
        state.outcome.install_list.push(PlanItem::new(item));

        self.process_updates(name, state);
        true
    }

    /// Schedules items declaring `update_for` the given name. Called both
    /// for items being installed and for items found installed, so updates
    /// apply to an already-satisfied base too.
    fn process_updates(&self, name: &str, state: &mut ResolveState) {
        for updater in self.catalogs.updaters_for(name) {
            let updater_name = updater.name.clone();
            log::debug!("{} is an update for {}", updater_name, name);
            self.process_install(&updater_name, state);
        }
    }

    /// `managed_updates` entries apply only to items already installed;
    /// they never pull a missing item onto the machine.
    fn process_managed_update(&self, reference: &str, state: &mut ResolveState) {
        let (name, _) = split_name_and_version(reference);
        if state.scheduled.contains(name) || state.removing.contains(name) {
            return;
        }
        let item = match self.catalogs.resolve(reference) {
            Some(item) => item.clone(),
            None => {
                self.problem(state, name, None, "not found in catalogs");
                return;
            }
        };

        if self.probe.status(&item, self.receipts).is_installed() {
            self.process_install(reference, state);
        } else {
            log::debug!("{} is not installed; managed update does not apply", name);
        }
    }

    /// Schedules one removal, dependents first.
    fn process_removal(&self, reference: &str, state: &mut ResolveState) -> bool {
        let (name, wanted_version) = split_name_and_version(reference);

        if state.removing.contains(name) {
            return true;
        }
        if state.removal_stack.iter().any(|n| n == name) {
            return true;
        }

        // Find the installed incarnation; it may be older than the
        // catalog's newest.
        let candidates: Vec<&PkgInfo> = match &wanted_version {
            Some(vers) => self
                .catalogs
                .newest(name, Some(vers))
                .into_iter()
                .collect(),
            None => self.catalogs.all_versions(name),
        };

        if candidates.is_empty() {
            self.problem(state, name, None, "not found in catalogs");
            return false;
        }

        let installed = candidates
            .into_iter()
            .find(|item| self.probe.needs_removal(item, self.receipts));
        let item = match installed {
            Some(item) => item.clone(),
            None => {
                log::debug!("{} is not installed; nothing to remove", name);
                return true;
            }
        };

        if !item.uninstallable || item.uninstall_method.is_none() {
            self.problem(
                state,
                &item.name,
                Some(item.version.clone()),
                "cannot be removed: no uninstall method",
            );
            return false;
        }

        // Installed items requiring this one must go first.
        state.removal_stack.push(name.to_string());
        for dependent in self.catalogs.items_requiring(name) {
            if dependent.name == item.name {
                continue;
            }
            if !self
                .probe
                .status(dependent, self.receipts)
                .is_installed()
            {
                continue;
            }
            log::info!(
                "{} is installed and requires {}; removing it as well",
                dependent.name,
                name
            );
            let dependent_name = dependent.name.clone();
            if !self.process_removal(&dependent_name, state) {
                state.removal_stack.pop();
                self.problem(
                    state,
                    &item.name,
                    Some(item.version.clone()),
                    &format!("dependent item {} could not be removed", dependent_name),
                );
                return false;
            }
        }
        state.removal_stack.pop();

        let mut plan_item = PlanItem::new(item);
        if plan_item.info.uninstall_method
            == Some(steward_types::pkginfo::UninstallMethod::ReceiptRemoval)
        {
            plan_item.packages = plan_item
                .info
                .receipts
                .iter()
                .filter(|receipt| !receipt.optional)
                .filter(|receipt| {
                    self.receipts
                        .installed_version(&receipt.packageid)
                        .is_some()
                })
                .map(|receipt| receipt.packageid.clone())
                .collect();
        }

        log::info!(
            "Scheduling {}-{} for removal",
            plan_item.info.name,
            plan_item.info.version
        );
        state.removing.insert(name.to_string());
        state.outcome.removals.push(plan_item);
        true
    }

    fn build_optional_display(&self, manifest: &EffectiveManifest, state: &mut ResolveState) {
        let mut seen = HashSet::new();
        let names = manifest
            .optional_installs
            .iter()
            .chain(manifest.featured_items.iter());

        for reference in names {
            let (name, _) = split_name_and_version(reference);
            if !seen.insert(name.to_string()) {
                continue;
            }
            let item = match self.catalogs.resolve(reference) {
                Some(item) => item,
                None => {
                    log::warn!("Optional install {} not found in catalogs", reference);
                    continue;
                }
            };
            if self.check_installable(item).is_err() {
                continue;
            }

            let status = self.probe.status(item, self.receipts);
            state.outcome.optional_installs.push(OptionalDisplayItem {
                name: item.name.clone(),
                version: item.version.clone(),
                display_name: item.display_name.clone(),
                description: item.description.clone(),
                installed: status.satisfies(),
                featured: item.featured
                    || manifest.featured_items.iter().any(|f| {
                        split_name_and_version(f).0 == item.name
                    }),
                installer_item_size: item.installer_item_size,
            });
        }
    }

    /// Gating predicates from the pkginfo record. An `Err` carries the
    /// problem note.
    fn check_installable(&self, item: &PkgInfo) -> Result<(), String> {
        let os_version = self.facts.os_version();
        if let Some(minimum) = &item.minimum_os_version {
            if &os_version < minimum {
                return Err(format!(
                    "requires operating system version {} or later",
                    minimum
                ));
            }
        }
        if let Some(maximum) = &item.maximum_os_version {
            if &os_version > maximum {
                return Err(format!(
                    "not supported past operating system version {}",
                    maximum
                ));
            }
        }
        if !item.supported_architectures.is_empty() {
            let arch = self.facts.arch();
            if !item
                .supported_architectures
                .iter()
                .any(|supported| supported == arch)
            {
                return Err(format!("not supported on {} hardware", arch));
            }
        }
        if let Some(minimum) = &item.minimum_agent_version {
            if &Version::new(AGENT_VERSION) < minimum {
                return Err(format!("requires agent version {} or later", minimum));
            }
        }
        if let Some(condition) = &item.installable_condition {
            match self.facts.evaluate(condition) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(format!("installable condition not met: {}", condition));
                }
                Err(e) => {
                    return Err(format!("installable condition failed to evaluate: {}", e));
                }
            }
        }
        Ok(())
    }

    /// Demotes items from the end of the install list until the plan fits
    /// in the available disk space plus the safety margin. Dependents sit
    /// after their requirements, so popping from the end never strands a
    /// scheduled dependent.
    fn enforce_disk_budget(&self, state: &mut ResolveState) {
        let available = self.facts.available_disk_kb();

        loop {
            let needed: u64 = state
                .outcome
                .install_list
                .iter()
                .map(|item| {
                    item.info.installer_item_size.unwrap_or(0)
                        + item.info.installed_size.unwrap_or(0)
                })
                .sum();

            if needed == 0 || needed + self.space_margin_kb <= available {
                return;
            }

            let victim = match state.outcome.install_list.pop() {
                Some(v) => v,
                None => return,
            };
            log::warn!(
                "Insufficient disk space for {}-{}; deferring",
                victim.info.name,
                victim.info.version
            );
            state.scheduled.remove(victim.name());
            self.problem(
                state,
                &victim.info.name,
                Some(victim.info.version.clone()),
                "insufficient disk space",
            );
        }
    }

    fn problem(
        &self,
        state: &mut ResolveState,
        name: &str,
        version: Option<Version>,
        note: &str,
    ) {
        log::warn!("{}: {}", name, note);
        if state
            .outcome
            .problem_items
            .iter()
            .any(|existing| existing.name == name && existing.note == note)
        {
            return;
        }
        let display_name = self
            .catalogs
            .newest(name, None)
            .and_then(|item| item.display_name.clone());
        state.outcome.problem_items.push(ProblemItem {
            name: name.to_string(),
            version,
            display_name,
            note: note.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::AppRegistry;
    use crate::receiptdb::tests::FakeReceipts;
    use hashbrown::HashMap;
    use steward_types::pkginfo::{Receipt, UninstallMethod};
    use steward_types::Catalog;

    struct MapLoader(HashMap<String, Manifest>);

    impl ManifestLoader for MapLoader {
        fn load(&self, name: &str) -> Result<Manifest, ManifestLoadError> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| ManifestLoadError::NotFound(name.to_string()))
        }
    }

    fn item(name: &str, version: &str) -> PkgInfo {
        // Detection via receipt on "<name>.pkg".
        PkgInfo::builder()
            .name(name)
            .version(Version::new(version))
            .installer_item_location(Some(format!("apps/{}-{}.pkg", name, version)))
            .receipts(vec![Receipt::builder()
                .packageid(format!("com.test.{}", name.to_lowercase()))
                .version(Version::new(version))
                .build()])
            .build()
    }

    fn removable(name: &str, version: &str) -> PkgInfo {
        let mut info = item(name, version);
        info.uninstallable = true;
        info.uninstall_method = Some(UninstallMethod::ReceiptRemoval);
        info
    }

    fn catalog_db(items: Vec<PkgInfo>) -> CatalogDb {
        CatalogDb::new(vec![("production".to_string(), Catalog::from(items))])
    }

    fn facts() -> Facts {
        Facts::gather("12.0", "x86_64", u64::max_value() / 2)
    }

    struct Fixture {
        db: CatalogDb,
        probe: StateProbe,
        receipts: FakeReceipts,
        facts: Facts,
        self_serve: SelfServeManifest,
    }

    impl Fixture {
        fn new(items: Vec<PkgInfo>, installed: &[(&str, &str)]) -> Fixture {
            Fixture {
                db: catalog_db(items),
                probe: StateProbe::new(AppRegistry::from_records(vec![])),
                receipts: FakeReceipts::with(installed),
                facts: facts(),
                self_serve: SelfServeManifest::default(),
            }
        }

        fn resolver(&self) -> Resolver<'_> {
            Resolver {
                catalogs: &self.db,
                probe: &self.probe,
                receipts: &self.receipts,
                facts: &self.facts,
                self_serve: &self.self_serve,
                space_margin_kb: 100_000,
            }
        }

        fn manifest(installs: &[&str], uninstalls: &[&str]) -> EffectiveManifest {
            EffectiveManifest {
                catalogs: vec!["production".to_string()],
                managed_installs: installs.iter().map(|s| s.to_string()).collect(),
                managed_uninstalls: uninstalls.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    fn names(list: &[PlanItem]) -> Vec<&str> {
        list.iter().map(|item| item.name()).collect()
    }

    #[test]
    fn test_straight_install() {
        let fixture = Fixture::new(vec![item("FooApp", "2.0")], &[]);
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["FooApp"], &[]));
        assert_eq!(names(&outcome.install_list), vec!["FooApp"]);
        assert!(outcome.problem_items.is_empty());
    }

    #[test]
    fn test_already_installed_is_skipped() {
        let fixture = Fixture::new(
            vec![item("FooApp", "2.0")],
            &[("com.test.fooapp", "2.0")],
        );
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["FooApp"], &[]));
        assert!(outcome.install_list.is_empty());
    }

    #[test]
    fn test_dependency_ordering() {
        let mut app = item("App", "1.0");
        app.requires = vec!["Lib".to_string()];
        let fixture = Fixture::new(vec![item("Lib", "1.0"), app], &[]);
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["App"], &[]));
        assert_eq!(names(&outcome.install_list), vec!["Lib", "App"]);
    }

    #[test]
    fn test_missing_dependency_is_problem() {
        let mut app = item("App", "1.0");
        app.requires = vec!["Ghost".to_string()];
        let fixture = Fixture::new(vec![app], &[]);
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["App"], &[]));
        assert!(outcome.install_list.is_empty());
        let notes: Vec<&str> = outcome
            .problem_items
            .iter()
            .map(|p| p.note.as_str())
            .collect();
        assert!(notes.contains(&"not found in catalogs"));
        assert!(notes
            .iter()
            .any(|note| note.contains("dependency Ghost could not be resolved")));
    }

    #[test]
    fn test_update_chain() {
        let mut update = item("BaseUpdate", "1.1");
        update.update_for = vec!["Base".to_string()];
        let fixture = Fixture::new(
            vec![item("Base", "1.0"), update],
            &[("com.test.base", "1.0")],
        );
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["Base"], &[]));
        // Base is current; only its update installs.
        assert_eq!(names(&outcome.install_list), vec!["BaseUpdate"]);
    }

    #[test]
    fn test_update_follows_base_when_both_install() {
        let mut update = item("BaseUpdate", "1.1");
        update.update_for = vec!["Base".to_string()];
        let fixture = Fixture::new(vec![item("Base", "1.0"), update], &[]);
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["Base"], &[]));
        assert_eq!(names(&outcome.install_list), vec!["Base", "BaseUpdate"]);
    }

    #[test]
    fn test_removal_with_reverse_dependency() {
        let mut app = removable("App", "1.0");
        app.requires = vec!["Lib".to_string()];
        let fixture = Fixture::new(
            vec![removable("Lib", "1.0"), app],
            &[("com.test.lib", "1.0"), ("com.test.app", "1.0")],
        );
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&[], &["Lib"]));
        // Dependents before dependencies.
        assert_eq!(names(&outcome.removals), vec!["App", "Lib"]);
        assert_eq!(outcome.removals[0].packages, vec!["com.test.app"]);
    }

    #[test]
    fn test_uninstall_wins_conflict() {
        // The expansion step strips conflicting installs; a dependency
        // pull must not reintroduce one.
        let mut app = item("App", "1.0");
        app.requires = vec!["X".to_string()];
        let fixture = Fixture::new(
            vec![removable("X", "1.0"), app],
            &[("com.test.x", "1.0")],
        );
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["App"], &["X"]));
        assert!(names(&outcome.install_list).is_empty());
        assert_eq!(names(&outcome.removals), vec!["X"]);
    }

    #[test]
    fn test_not_uninstallable_is_problem() {
        let fixture = Fixture::new(
            vec![item("Locked", "1.0")],
            &[("com.test.locked", "1.0")],
        );
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&[], &["Locked"]));
        assert!(outcome.removals.is_empty());
        assert_eq!(outcome.problem_items.len(), 1);
        assert!(outcome.problem_items[0].note.contains("no uninstall method"));
    }

    #[test]
    fn test_managed_update_only_when_installed() {
        let fixture = Fixture::new(vec![item("Tool", "2.0")], &[]);
        let mut manifest = Fixture::manifest(&[], &[]);
        manifest.managed_updates = vec!["Tool".to_string()];
        let outcome = fixture.resolver().resolve(&manifest);
        assert!(outcome.install_list.is_empty());

        let fixture = Fixture::new(
            vec![item("Tool", "2.0")],
            &[("com.test.tool", "1.0")],
        );
        let mut manifest = Fixture::manifest(&[], &[]);
        manifest.managed_updates = vec!["Tool".to_string()];
        let outcome = fixture.resolver().resolve(&manifest);
        assert_eq!(names(&outcome.install_list), vec!["Tool"]);
    }

    #[test]
    fn test_on_demand_reinstalls_when_chosen() {
        let mut reset = item("Reset", "1.0");
        reset.on_demand = true;
        let mut fixture = Fixture::new(vec![reset], &[("com.test.reset", "1.0")]);
        fixture.self_serve.add_install("Reset");

        let mut manifest = Fixture::manifest(&[], &[]);
        manifest.managed_installs = vec!["Reset".to_string()];
        let outcome = fixture.resolver().resolve(&manifest);
        assert_eq!(names(&outcome.install_list), vec!["Reset"]);
    }

    #[test]
    fn test_precondition_failures() {
        let mut needs_new_os = item("Modern", "1.0");
        needs_new_os.minimum_os_version = Some(Version::new("13.0"));
        let mut wrong_arch = item("Intel", "1.0");
        wrong_arch.supported_architectures = vec!["arm64".to_string()];
        let mut gated = item("Gated", "1.0");
        gated.installable_condition = Some(r#"machine_type == "server""#.to_string());
        let mut needs_new_agent = item("Future", "1.0");
        needs_new_agent.minimum_agent_version = Some(Version::new("99.0"));

        let mut fixture = Fixture::new(
            vec![needs_new_os, wrong_arch, gated, needs_new_agent],
            &[],
        );
        fixture.facts.set_str("machine_type", "laptop");
        let outcome = fixture.resolver().resolve(&Fixture::manifest(
            &["Modern", "Intel", "Gated", "Future"],
            &[],
        ));
        assert!(outcome.install_list.is_empty());
        assert_eq!(outcome.problem_items.len(), 4);
        let future = outcome
            .problem_items
            .iter()
            .find(|p| p.name == "Future")
            .unwrap();
        assert!(future.note.contains("requires agent version 99.0"));
    }

    #[test]
    fn test_minimum_agent_version_key_reaches_gate() {
        // The wire key must land in the typed field and drive the gate;
        // a document that only reaches the unknown-key catch-all would
        // install unconditionally.
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>name</key>
    <string>Future</string>
    <key>version</key>
    <string>1.0</string>
    <key>installer_item_location</key>
    <string>apps/Future-1.0.pkg</string>
    <key>minimum_munki_version</key>
    <string>99.0</string>
</dict>
</plist>"#;
        let info: PkgInfo = plist::from_reader_xml(xml.as_bytes()).unwrap();
        assert_eq!(info.minimum_agent_version, Some(Version::new("99.0")));

        let fixture = Fixture::new(vec![info], &[]);
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["Future"], &[]));
        assert!(outcome.install_list.is_empty());
        assert_eq!(outcome.problem_items.len(), 1);
        assert_eq!(outcome.problem_items[0].name, "Future");
        assert!(outcome.problem_items[0]
            .note
            .contains("requires agent version 99.0"));
    }

    #[test]
    fn test_disk_budget_demotes_lowest_priority() {
        let mut big_a = item("BigA", "1.0");
        big_a.installer_item_size = Some(600_000);
        let mut big_b = item("BigB", "1.0");
        big_b.installer_item_size = Some(600_000);

        let mut fixture = Fixture::new(vec![big_a, big_b], &[]);
        fixture.facts.set_number("available_disk_space", 800_000.0);
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["BigA", "BigB"], &[]));
        // BigB came later in the manifest, so it is demoted first.
        assert_eq!(names(&outcome.install_list), vec!["BigA"]);
        assert_eq!(outcome.problem_items.len(), 1);
        assert_eq!(outcome.problem_items[0].name, "BigB");
        assert_eq!(outcome.problem_items[0].note, "insufficient disk space");
    }

    #[test]
    fn test_dedup_across_lists() {
        let mut app = item("App", "1.0");
        app.requires = vec!["Lib".to_string()];
        let mut tool = item("Tool", "1.0");
        tool.requires = vec!["Lib".to_string()];
        let fixture = Fixture::new(vec![item("Lib", "1.0"), app, tool], &[]);
        let outcome = fixture
            .resolver()
            .resolve(&Fixture::manifest(&["App", "Tool", "Lib"], &[]));
        assert_eq!(names(&outcome.install_list), vec!["Lib", "App", "Tool"]);
    }

    #[test]
    fn test_expand_manifest_cycles_and_conditionals() {
        let mut manifests = HashMap::new();
        manifests.insert(
            "site_default".to_string(),
            Manifest::builder()
                .catalogs(vec!["production".into()])
                .managed_installs(vec!["FooApp".into()])
                .included_manifests(vec!["groups/lab".into()])
                .conditional_items(vec![ConditionalItems::builder()
                    .condition(r#"machine_type == "laptop""#.to_string())
                    .managed_installs(vec!["BatteryTool".into()])
                    .build()])
                .build(),
        );
        manifests.insert(
            "groups/lab".to_string(),
            Manifest::builder()
                .managed_installs(vec!["LabTool".into()])
                // Cycle back to the root; must be a silent no-op.
                .included_manifests(vec!["site_default".into()])
                .build(),
        );

        let loader = MapLoader(manifests);
        let mut facts = facts();
        facts.set_str("machine_type", "laptop");
        let self_serve = SelfServeManifest::default();

        let effective =
            expand_manifest("site_default", &loader, &facts, &self_serve).unwrap();
        assert_eq!(
            effective.managed_installs,
            vec!["FooApp", "BatteryTool", "LabTool"]
        );
        assert_eq!(effective.catalogs, vec!["production"]);
    }

    #[test]
    fn test_expand_merges_self_serve_and_resolves_conflicts() {
        let mut manifests = HashMap::new();
        manifests.insert(
            "site_default".to_string(),
            Manifest::builder()
                .managed_installs(vec!["X".into(), "Y".into()])
                .build(),
        );
        let loader = MapLoader(manifests);

        let mut self_serve = SelfServeManifest::default();
        self_serve.add_install("Z");
        self_serve.add_uninstall("X");

        let effective =
            expand_manifest("site_default", &loader, &facts(), &self_serve).unwrap();
        // X is both an install and an uninstall; uninstall wins.
        assert_eq!(effective.managed_installs, vec!["Y", "Z"]);
        assert_eq!(effective.managed_uninstalls, vec!["X"]);
    }
}
