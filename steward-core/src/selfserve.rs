use std::path::PathBuf;

use steward_types::SelfServeManifest;

/// Write-through store for the user's self-serve manifest. The manifest is
/// the user's: the core re-reads it at session start and writes it only on
/// deliberate changes (a new choice, or clearing a satisfied OnDemand
/// request).
#[derive(Debug)]
pub struct SelfServeStore {
    path: PathBuf,
    manifest: SelfServeManifest,
    dirty: bool,
}

impl SelfServeStore {
    pub fn load(path: PathBuf) -> SelfServeStore {
        let manifest = if path.exists() {
            match plist::from_file(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    log::warn!("Self-serve manifest is unreadable: {}; ignoring it", e);
                    SelfServeManifest::default()
                }
            }
        } else {
            SelfServeManifest::default()
        };
        SelfServeStore {
            path,
            manifest,
            dirty: false,
        }
    }

    pub fn manifest(&self) -> &SelfServeManifest {
        &self.manifest
    }

    /// The user chose to install an optional item.
    pub fn add_install(&mut self, name: &str) {
        if self.manifest.add_install(name) {
            self.dirty = true;
        }
    }

    /// The user chose to remove an optional item.
    pub fn add_uninstall(&mut self, name: &str) {
        if self.manifest.add_uninstall(name) {
            self.dirty = true;
        }
    }

    /// Clears an install choice, e.g. once an OnDemand item has run.
    pub fn remove_install(&mut self, name: &str) {
        if self.manifest.remove_install(name) {
            log::debug!("Cleared self-serve install choice for {}", name);
            self.dirty = true;
        }
    }

    pub fn remove_uninstall(&mut self, name: &str) {
        if self.manifest.remove_uninstall(name) {
            self.dirty = true;
        }
    }

    pub fn save(&mut self) -> Result<(), std::io::Error> {
        if !self.dirty {
            return Ok(());
        }
        let file = std::fs::File::create(&self.path)?;
        plist::to_writer_xml(file, &self.manifest)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.dirty = false;
        Ok(())
    }
}
