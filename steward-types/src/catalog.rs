use serde::{Deserialize, Serialize};

use crate::pkginfo::PkgInfo;

/// A catalog is an ordered array of pkginfo records. The repository stores
/// one document per catalog name under `catalogs/<name>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog(pub Vec<PkgInfo>);

impl Catalog {
    pub fn iter(&self) -> std::slice::Iter<'_, PkgInfo> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Catalog {
    type Item = PkgInfo;
    type IntoIter = std::vec::IntoIter<PkgInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<PkgInfo>> for Catalog {
    fn from(items: Vec<PkgInfo>) -> Catalog {
        Catalog(items)
    }
}
