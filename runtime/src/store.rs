//! Local bundle store.
//!
//! Bundles are kept by content digest under `<home>/bundles/`, and
//! `<home>/repositories.json` maps `name → version → digest`:
//!
//! ```text
//!   ~/.cnab/
//!   ├── repositories.json
//!   └── bundles/
//!       └── <sha256 hex>
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use cnab_push_core::error::{PushError, Result};
use semver::Version;

use crate::bundle::Bundle;

/// Environment variable overriding the store location.
pub const HOME_ENV: &str = "CNAB_HOME";

const REPOSITORIES_FILE: &str = "repositories.json";
const BUNDLES_DIR: &str = "bundles";

/// name → version → digest
type Repositories = BTreeMap<String, BTreeMap<String, String>>;

/// Bundles stored on local disk.
#[derive(Debug, Clone)]
pub struct BundleStore {
    home: PathBuf,
}

impl BundleStore {
    /// Store rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Store at `$CNAB_HOME`, else `~/.cnab`.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|h| !h.is_empty()) {
            return Ok(Self::new(home));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            PushError::Config("Cannot determine home directory for the bundle store".to_string())
        })?;
        Ok(Self::new(home.join(".cnab")))
    }

    /// Path of the bundle named by `name[:version]`. Without a version the
    /// highest stored version is used.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let (name, version) = match name.rsplit_once(':') {
            Some((n, v)) if !v.is_empty() => (n, Some(v)),
            _ => (name, None),
        };

        let repositories = self.load_repositories()?;
        let versions = repositories.get(name).ok_or_else(|| {
            PushError::Bundle(format!("Bundle {} not found in {}", name, self.home.display()))
        })?;

        let (version, digest) = match version {
            Some(v) => versions.get_key_value(v).ok_or_else(|| {
                PushError::Bundle(format!("Bundle {} has no version {}", name, v))
            })?,
            None => versions
                .iter()
                .max_by(|a, b| compare_versions(a.0, b.0))
                .ok_or_else(|| PushError::Bundle(format!("Bundle {} has no versions", name)))?,
        };

        tracing::debug!(bundle = name, version = %version, digest = %digest, "Resolved stored bundle");
        Ok(self.bundle_path(digest))
    }

    /// Load a bundle: from the file at `argument` when `is_file`, else by
    /// name from the store.
    pub fn load(&self, argument: &str, is_file: bool) -> Result<Bundle> {
        let path = if is_file {
            PathBuf::from(argument)
        } else {
            self.resolve(argument)?
        };
        Bundle::load(&path)
    }

    /// Store `bundle` under its name and version. Returns its digest.
    pub fn put(&self, bundle: &Bundle) -> Result<String> {
        let data = bundle.to_canonical_json()?;
        let digest = bundle.digest()?;

        let path = self.bundle_path(&digest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &data)?;

        let mut repositories = self.load_repositories()?;
        repositories
            .entry(bundle.name.clone())
            .or_default()
            .insert(bundle.version.clone(), digest.clone());
        let index = serde_json::to_vec_pretty(&repositories)?;
        std::fs::write(self.home.join(REPOSITORIES_FILE), index)?;

        Ok(digest)
    }

    fn bundle_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.home.join(BUNDLES_DIR).join(hex)
    }

    fn load_repositories(&self) -> Result<Repositories> {
        let path = self.home.join(REPOSITORIES_FILE);
        if !path.exists() {
            return Ok(Repositories::new());
        }
        let data = std::fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|e| {
            PushError::Bundle(format!("Failed to parse {}: {}", path.display(), e))
        })
    }
}

/// Order versions by semver precedence. A leading `v` is ignored, semver
/// versions sort above anything else, and non-semver strings compare
/// lexically.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| Version::parse(v.strip_prefix('v').unwrap_or(v)).ok();
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(version: &str) -> Bundle {
        Bundle::from_slice(
            format!(
                r#"{{"schemaVersion":"v1.0.0","name":"hello","version":"{}","invocationImages":[]}}"#,
                version
            )
            .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_put_and_resolve_version() {
        let tmp = TempDir::new().unwrap();
        let store = BundleStore::new(tmp.path());
        let digest = store.put(&bundle("0.1.0")).unwrap();

        let path = store.resolve("hello:0.1.0").unwrap();
        assert!(path.ends_with(digest.strip_prefix("sha256:").unwrap()));
        assert_eq!(store.load("hello:0.1.0", false).unwrap().version, "0.1.0");
    }

    #[test]
    fn test_resolve_picks_highest_version() {
        let tmp = TempDir::new().unwrap();
        let store = BundleStore::new(tmp.path());
        store.put(&bundle("0.9.0")).unwrap();
        store.put(&bundle("0.10.0")).unwrap();
        store.put(&bundle("0.2.1")).unwrap();

        assert_eq!(store.load("hello", false).unwrap().version, "0.10.0");
    }

    #[test]
    fn test_resolve_unknown() {
        let tmp = TempDir::new().unwrap();
        let store = BundleStore::new(tmp.path());
        assert!(matches!(store.resolve("nope"), Err(PushError::Bundle(_))));

        store.put(&bundle("1.0.0")).unwrap();
        assert!(matches!(store.resolve("hello:2.0.0"), Err(PushError::Bundle(_))));
    }

    #[test]
    fn test_load_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.json");
        std::fs::write(&path, bundle("3.0.0").to_canonical_json().unwrap()).unwrap();

        let store = BundleStore::new(tmp.path().join("unused"));
        let loaded = store.load(path.to_str().unwrap(), true).unwrap();
        assert_eq!(loaded.version, "3.0.0");
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("0.10.0", "0.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("v1.2.0", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0-beta", "1.0.0-alpha"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0-rc1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0", "latest"), Ordering::Greater);
        assert_eq!(compare_versions("nightly", "latest"), Ordering::Greater);
    }

    #[test]
    fn test_resolve_prefers_release_over_prerelease() {
        let tmp = TempDir::new().unwrap();
        let store = BundleStore::new(tmp.path());
        store.put(&bundle("1.0.0-rc1")).unwrap();
        store.put(&bundle("1.0.0")).unwrap();
        store.put(&bundle("0.9.0")).unwrap();

        assert_eq!(store.load("hello", false).unwrap().version, "1.0.0");
    }
}
