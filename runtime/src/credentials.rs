//! Registry credential store.
//!
//! Reads per-registry credentials from a Docker-style `config.json`
//! (`$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cnab_push_core::error::{PushError, Result};
use serde::Deserialize;

/// Per-registry entry of the `auths` section.
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    /// base64 of `username:password`
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

/// Subset of the Docker CLI configuration file that holds credentials.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
}

/// Read-only view of the local registry credential store.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store at the default location.
    ///
    /// Honors `DOCKER_CONFIG`, then falls back to `~/.docker/config.json`.
    pub fn default_path() -> Result<Self> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Ok(Self::new(PathBuf::from(dir).join("config.json")));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            PushError::Credential("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self::new(home.join(".docker").join("config.json")))
    }

    /// Credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get credentials for a registry. Returns `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let mut all = self.load_all()?;
        Ok(all.remove(&normalize_registry(registry)))
    }

    /// All stored credentials, keyed by normalized registry name.
    ///
    /// Entries that cannot be decoded are skipped with a warning.
    pub fn load_all(&self) -> Result<HashMap<String, (String, String)>> {
        let file = self.load()?;

        if file.creds_store.is_some() || !file.cred_helpers.is_empty() {
            tracing::debug!(
                path = %self.path.display(),
                "Credential helpers are configured but not consulted"
            );
        }

        let mut credentials = HashMap::new();
        for (server, entry) in file.auths {
            match decode_entry(&entry) {
                Ok(Some(pair)) => {
                    credentials.insert(normalize_registry(&server), pair);
                }
                Ok(None) => {
                    if entry.identity_token.is_some() {
                        tracing::debug!(registry = %server, "Skipping identity token credentials");
                    }
                }
                Err(e) => {
                    tracing::warn!(registry = %server, error = %e, "Ignoring malformed credentials");
                }
            }
        }
        Ok(credentials)
    }

    /// Load the credential file from disk. Returns empty if not found.
    fn load(&self) -> Result<ConfigFile> {
        if !self.path.exists() {
            return Ok(ConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            PushError::Credential(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if data.trim().is_empty() {
            return Ok(ConfigFile::default());
        }
        serde_json::from_str(&data).map_err(|e| {
            PushError::Credential(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Decode one `auths` entry into `(username, password)`.
fn decode_entry(entry: &AuthEntry) -> Result<Option<(String, String)>> {
    if let Some(ref auth) = entry.auth {
        if !auth.is_empty() {
            let decoded = STANDARD
                .decode(auth.trim())
                .map_err(|e| PushError::Credential(format!("Invalid base64 auth: {}", e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| PushError::Credential("Auth is not valid UTF-8".to_string()))?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                PushError::Credential("Auth must have the form username:password".to_string())
            })?;
            return Ok(Some((username.to_string(), password.to_string())));
        }
    }
    match (&entry.username, &entry.password) {
        (Some(u), Some(p)) if !u.is_empty() => Ok(Some((u.clone(), p.clone()))),
        _ => Ok(None),
    }
}

/// Normalize registry names: strip scheme and path, lowercase, and fold the
/// Docker Hub aliases into `index.docker.io`.
pub fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(&r);
    let host = r.split('/').next().unwrap_or(r);
    if host == "docker.io" || host == "registry-1.docker.io" || host == "index.docker.io" {
        "index.docker.io".to_string()
    } else {
        host.to_string()
    }
}
