use std::path::{Path, PathBuf};

use serde::Deserialize;

use steward_types::Version;

/// One installed application bundle, as discovered on disk.
#[derive(Debug, Clone)]
pub struct AppRecord {
    pub path: PathBuf,
    pub name: String,
    pub bundle_identifier: Option<String>,
    pub version: Option<Version>,
}

#[derive(Debug, Deserialize)]
struct BundlePlistInfo {
    #[serde(rename = "CFBundleIdentifier")]
    identifier: Option<String>,
    #[serde(rename = "CFBundleName")]
    name: Option<String>,
    #[serde(rename = "CFBundleVersion")]
    version: Option<String>,
    #[serde(rename = "CFBundleShortVersionString")]
    short_version: Option<String>,
}

/// Registry of installed applications, built by scanning the application
/// directories once per session. Application probes without a `path`
/// resolve against this, by bundle identifier first, then by bundle name.
pub struct AppRegistry {
    apps: Vec<AppRecord>,
}

impl AppRegistry {
    /// Scans the standard application directories.
    pub fn discover() -> AppRegistry {
        let mut roots = vec![PathBuf::from("/Applications")];
        if let Some(base) = directories::BaseDirs::new() {
            roots.push(base.home_dir().join("Applications"));
        }
        Self::scan(&roots)
    }

    /// Scans the given directories (two levels deep, as application folders
    /// commonly group bundles one directory down).
    pub fn scan(roots: &[PathBuf]) -> AppRegistry {
        let mut apps = Vec::new();
        for root in roots {
            scan_dir(root, 0, &mut apps);
        }
        log::debug!("Application registry holds {} bundles", apps.len());
        AppRegistry { apps }
    }

    pub fn from_records(apps: Vec<AppRecord>) -> AppRegistry {
        AppRegistry { apps }
    }

    /// All records matching a bundle identifier or, failing that, a bundle
    /// name; highest version first.
    pub fn find(&self, bundle_identifier: Option<&str>, name: Option<&str>) -> Vec<&AppRecord> {
        let mut matches: Vec<&AppRecord> = self
            .apps
            .iter()
            .filter(|app| {
                if let Some(wanted) = bundle_identifier {
                    if app.bundle_identifier.as_deref() == Some(wanted) {
                        return true;
                    }
                }
                if let Some(wanted) = name {
                    if app.name == wanted {
                        return true;
                    }
                }
                false
            })
            .collect();

        matches.sort_by(|a, b| b.version.cmp(&a.version));
        matches
    }
}

fn scan_dir(dir: &Path, depth: usize, out: &mut Vec<AppRecord>) {
    if depth > 2 {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(v) => v,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.extension().map(|e| e == "app").unwrap_or(false) {
            if let Some(record) = read_bundle(&path) {
                out.push(record);
            }
        } else {
            scan_dir(&path, depth + 1, out);
        }
    }
}

/// Reads the identity of one application bundle from its `Info.plist`.
pub fn read_bundle(bundle_path: &Path) -> Option<AppRecord> {
    let info_path = bundle_path.join("Contents").join("Info.plist");
    let info: BundlePlistInfo = plist::from_file(&info_path).ok()?;

    let name = info
        .name
        .or_else(|| {
            bundle_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_default();

    Some(AppRecord {
        path: bundle_path.to_path_buf(),
        name,
        bundle_identifier: info.identifier,
        version: info
            .short_version
            .or(info.version)
            .map(|raw| Version::new(&raw)),
    })
}

#[cfg(test)]
pub(crate) fn write_bundle(
    bundle_path: &Path,
    identifier: &str,
    name: &str,
    version: &str,
) {
    let contents = bundle_path.join("Contents");
    std::fs::create_dir_all(&contents).unwrap();
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "CFBundleIdentifier".into(),
        plist::Value::String(identifier.into()),
    );
    dict.insert("CFBundleName".into(), plist::Value::String(name.into()));
    dict.insert(
        "CFBundleShortVersionString".into(),
        plist::Value::String(version.into()),
    );
    let file = std::fs::File::create(contents.join("Info.plist")).unwrap();
    plist::to_writer_xml(file, &plist::Value::Dictionary(dict)).unwrap();
}
