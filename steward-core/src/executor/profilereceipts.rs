use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Receipt for one installed configuration profile: payload hash plus
/// install date, keyed by payload identifier. The profile tool keeps no
/// version record of its own, so this is how re-installs are detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReceipt {
    pub hash: String,
    pub install_date: plist::Date,
}

#[derive(Debug)]
pub struct ProfileReceipts {
    path: PathBuf,
    data: BTreeMap<String, ProfileReceipt>,
    dirty: bool,
}

impl ProfileReceipts {
    pub fn load(path: PathBuf) -> ProfileReceipts {
        let data = if path.exists() {
            match plist::from_file(&path) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("Could not read profile receipts: {}; starting fresh", e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        ProfileReceipts {
            path,
            data,
            dirty: false,
        }
    }

    pub fn record(&mut self, identifier: &str, payload_hash: String) {
        self.data.insert(
            identifier.to_string(),
            ProfileReceipt {
                hash: payload_hash,
                install_date: plist::Date::from(std::time::SystemTime::now()),
            },
        );
        self.dirty = true;
    }

    pub fn forget(&mut self, identifier: &str) {
        if self.data.remove(identifier).is_some() {
            self.dirty = true;
        }
    }

    pub fn get(&self, identifier: &str) -> Option<&ProfileReceipt> {
        self.data.get(identifier)
    }

    pub fn save(&mut self) -> Result<(), std::io::Error> {
        if !self.dirty {
            return Ok(());
        }
        let file = std::fs::File::create(&self.path)?;
        plist::to_writer_xml(file, &self.data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.dirty = false;
        Ok(())
    }
}
