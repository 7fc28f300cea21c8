use hashbrown::HashMap;
use itertools::Itertools;

use steward_types::{Catalog, PkgInfo, Version};

/// In-memory index over all catalog items for one session, built from the
/// catalogs named by the manifest, concatenated in manifest-declared order.
/// Discarded at session end.
pub struct CatalogDb {
    items: Vec<Entry>,
    by_name: HashMap<String, Vec<usize>>,
    by_name_version: HashMap<(String, String), usize>,
    updaters: HashMap<String, Vec<usize>>,
    by_hash: HashMap<String, usize>,
}

struct Entry {
    info: PkgInfo,
    /// Position of the item's catalog in the manifest's catalog list;
    /// earlier catalogs win version conflicts.
    catalog_rank: usize,
}

/// Splits a manifest reference like `FooApp-2.0` into name and version.
/// The split happens at the last `-` that introduces a leading digit; a
/// reference without one is a bare name.
pub fn split_name_and_version(reference: &str) -> (&str, Option<Version>) {
    if let Some(pos) = reference.rfind('-') {
        let (name, vers) = (&reference[..pos], &reference[pos + 1..]);
        if !name.is_empty()
            && vers
                .chars()
                .next()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
        {
            return (name, Some(Version::new(vers)));
        }
    }
    (reference, None)
}

impl CatalogDb {
    pub fn new(catalogs: Vec<(String, Catalog)>) -> CatalogDb {
        let mut db = CatalogDb {
            items: Vec::new(),
            by_name: HashMap::new(),
            by_name_version: HashMap::new(),
            updaters: HashMap::new(),
            by_hash: HashMap::new(),
        };

        for (rank, (catalog_name, catalog)) in catalogs.into_iter().enumerate() {
            log::debug!("Indexing catalog {}", catalog_name);
            for info in catalog {
                db.insert(info, rank);
            }
        }

        // Within each name: catalog priority first, newest version next.
        for indices in db.by_name.values_mut() {
            let items = &db.items;
            indices.sort_by(|&a, &b| {
                items[a]
                    .catalog_rank
                    .cmp(&items[b].catalog_rank)
                    .then_with(|| items[b].info.version.cmp(&items[a].info.version))
            });
        }

        db
    }

    fn insert(&mut self, info: PkgInfo, catalog_rank: usize) {
        let idx = self.items.len();
        let key = (info.name.clone(), info.version.normalized());

        // First occurrence of a (name, version) wins; later catalogs may
        // repeat the same record.
        if self.by_name_version.contains_key(&key) {
            return;
        }

        self.by_name
            .entry(info.name.clone())
            .or_insert_with(Vec::new)
            .push(idx);
        self.by_name_version.insert(key, idx);
        for target in &info.update_for {
            self.updaters
                .entry(target.clone())
                .or_insert_with(Vec::new)
                .push(idx);
        }
        if let Some(hash) = &info.installer_item_hash {
            self.by_hash.entry(hash.clone()).or_insert(idx);
        }

        self.items.push(Entry { info, catalog_rank });
    }

    /// The newest item for `name`, or the exact version when a constraint
    /// is given (modulo right-zero equivalence). When catalogs disagree,
    /// the first catalog in manifest order wins even if a later catalog
    /// carries a higher version.
    pub fn newest(&self, name: &str, version: Option<&Version>) -> Option<&PkgInfo> {
        match version {
            Some(vers) => self
                .by_name_version
                .get(&(name.to_string(), vers.normalized()))
                .map(|&idx| &self.items[idx].info),
            None => self
                .by_name
                .get(name)
                .and_then(|indices| indices.first())
                .map(|&idx| &self.items[idx].info),
        }
    }

    /// Resolves a `name` or `name-version` manifest reference.
    pub fn resolve(&self, reference: &str) -> Option<&PkgInfo> {
        let (name, version) = split_name_and_version(reference);
        match self.newest(name, version.as_ref()) {
            Some(item) => Some(item),
            // A reference like "real-name-with-dash" would have been split;
            // retry verbatim before giving up.
            None if version.is_some() => self.newest(reference, None),
            None => None,
        }
    }

    /// All versions of `name`, catalog priority first, newest first.
    pub fn all_versions(&self, name: &str) -> Vec<&PkgInfo> {
        self.by_name
            .get(name)
            .map(|indices| indices.iter().map(|&idx| &self.items[idx].info).collect())
            .unwrap_or_default()
    }

    /// Items declaring `update_for` the given name, newest first, one per
    /// item name.
    pub fn updaters_for(&self, name: &str) -> Vec<&PkgInfo> {
        let indices = match self.updaters.get(name) {
            Some(v) => v,
            None => return Vec::new(),
        };
        indices
            .iter()
            .map(|&idx| &self.items[idx].info)
            .sorted_by(|a, b| b.version.cmp(&a.version))
            .unique_by(|info| info.name.as_str())
            .collect()
    }

    /// Items whose `requires` references the given name (with or without a
    /// version suffix). Drives the reverse-dependency walk for removals.
    pub fn items_requiring(&self, name: &str) -> Vec<&PkgInfo> {
        self.items
            .iter()
            .filter(|entry| {
                entry.info.requires.iter().any(|reference| {
                    let (req_name, _) = split_name_and_version(reference);
                    req_name == name || reference == name
                })
            })
            .map(|entry| &entry.info)
            .unique_by(|info| info.name.as_str())
            .collect()
    }

    /// Whether any catalog item carries this payload hash. Used by admin
    /// import tooling to ask "is this payload already represented?".
    pub fn item_for_hash(&self, hash: &str) -> Option<&PkgInfo> {
        self.by_hash.get(hash).map(|&idx| &self.items[idx].info)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
