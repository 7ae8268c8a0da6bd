//! Resolver configuration shared by fix-up and push.
//!
//! Holds the per-registry credentials and the set of registries reached over
//! plain HTTP. Built once per invocation, read-only afterwards.

use std::collections::{BTreeSet, HashMap};

use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;

use crate::credentials::{normalize_registry, CredentialStore};

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Whether no credentials are set.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    /// Username, when set.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Convert to oci-distribution auth type.
    pub(crate) fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Authentication and transport settings for every registry touched by a push.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    credentials: HashMap<String, RegistryAuth>,
    fallback: RegistryAuth,
    insecure_registries: BTreeSet<String>,
}

impl ResolverConfig {
    /// Anonymous configuration with the given plain-HTTP registries.
    pub fn new<I, S>(insecure_registries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            credentials: HashMap::new(),
            fallback: RegistryAuth::anonymous(),
            insecure_registries: insecure_registries
                .into_iter()
                .map(|r| r.as_ref().trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// Build from a credential store. Best effort: an unreadable or malformed
    /// store is logged and the configuration falls back to anonymous access.
    pub fn from_credential_store<I, S>(store: &CredentialStore, insecure_registries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::new(insecure_registries);
        match store.load_all() {
            Ok(credentials) => {
                tracing::debug!(
                    path = %store.path().display(),
                    registries = credentials.len(),
                    "Loaded registry credentials"
                );
                for (registry, (username, password)) in credentials {
                    config
                        .credentials
                        .insert(registry, RegistryAuth::basic(username, password));
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %store.path().display(),
                    error = %e,
                    "Failed to load registry credentials, continuing anonymously"
                );
            }
        }
        config.fallback = RegistryAuth::from_env();
        config
    }

    /// Build from the default credential store location, falling back to env
    /// vars, then anonymous.
    pub fn from_default_credential_store<I, S>(insecure_registries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match CredentialStore::default_path() {
            Ok(store) => Self::from_credential_store(&store, insecure_registries),
            Err(e) => {
                tracing::warn!(error = %e, "No credential store available");
                let mut config = Self::new(insecure_registries);
                config.fallback = RegistryAuth::from_env();
                config
            }
        }
    }

    /// Set explicit credentials for a registry.
    pub fn with_credentials(mut self, registry: &str, auth: RegistryAuth) -> Self {
        self.credentials.insert(normalize_registry(registry), auth);
        self
    }

    /// Credentials used when the store has no entry for a registry.
    pub fn with_fallback(mut self, auth: RegistryAuth) -> Self {
        self.fallback = auth;
        self
    }

    /// Credentials for `registry`.
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        self.credentials
            .get(&normalize_registry(registry))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Whether `registry` is reached over plain HTTP.
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_registries
            .contains(&registry.trim().to_lowercase())
    }

    /// Plain-HTTP registries, sorted.
    pub fn insecure_registries(&self) -> Vec<String> {
        self.insecure_registries.iter().cloned().collect()
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}
