//! Registry credentials and where they come from.
//!
//! The auth handler asks a [`CredentialProvider`] for credentials by registry
//! host. Providers: a fixed pair, the environment, and the persistent
//! [`CredentialStore`] at `~/.hoist/auth/credentials.json`.

use std::collections::HashMap;
use std::path::PathBuf;

use hoist_core::error::{HoistError, Result};
use serde::{Deserialize, Serialize};

/// Credentials presented to a registry or its token service.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Username and password, sent as HTTP Basic.
    Basic { username: String, password: String },
    /// OAuth2 refresh token exchanged at the token endpoint.
    IdentityToken(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
        }
    }
}

/// Looks up credentials for a registry host.
pub trait CredentialProvider: Send + Sync {
    fn get_credentials(&self, registry: &str) -> Option<Credentials>;
}

/// No credentials for any registry.
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn get_credentials(&self, _registry: &str) -> Option<Credentials> {
        None
    }
}

/// The same credentials for every registry.
pub struct StaticCredentials(pub Credentials);

impl CredentialProvider for StaticCredentials {
    fn get_credentials(&self, _registry: &str) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

/// Credentials from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn get_credentials(&self, _registry: &str) -> Option<Credentials> {
        let username = std::env::var("REGISTRY_USERNAME").ok()?;
        let password = std::env::var("REGISTRY_PASSWORD").ok()?;
        Some(Credentials::Basic { username, password })
    }
}

/// Tries each provider in order and returns the first hit.
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Credential store at the default path, then the environment.
    ///
    /// A missing home directory only drops the store from the chain.
    pub fn standard() -> Self {
        let mut providers: Vec<Box<dyn CredentialProvider>> = Vec::new();
        match CredentialStore::default_path() {
            Ok(store) => providers.push(Box::new(store)),
            Err(e) => tracing::debug!(error = %e, "Credential store unavailable"),
        }
        providers.push(Box::new(EnvCredentials));
        Self::new(providers)
    }
}

impl CredentialProvider for CredentialChain {
    fn get_credentials(&self, registry: &str) -> Option<Credentials> {
        self.providers
            .iter()
            .find_map(|p| p.get_credentials(registry))
    }
}

/// Per-registry credential entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity_token: Option<String>,
}

impl CredentialEntry {
    fn credentials(&self) -> Credentials {
        match self.identity_token {
            Some(ref token) => Credentials::IdentityToken(token.clone()),
            None => Credentials::basic(&self.username, &self.password),
        }
    }
}

/// Persistent credential file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: HashMap<String, CredentialEntry>,
}

/// Persistent credential store for container registries.
///
/// Writes are atomic (write tmp, rename).
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store at `~/.hoist/auth/credentials.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            HoistError::Config("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self {
            path: home.join(".hoist").join("auth").join("credentials.json"),
        })
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store username/password for a registry. Overwrites an existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        self.insert(
            registry,
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
                identity_token: None,
            },
        )
    }

    /// Store an OAuth2 identity token for a registry.
    pub fn store_identity_token(&self, registry: &str, token: &str) -> Result<()> {
        self.insert(
            registry,
            CredentialEntry {
                username: String::new(),
                password: String::new(),
                identity_token: Some(token.to_string()),
            },
        )
    }

    fn insert(&self, registry: &str, entry: CredentialEntry) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(normalize_registry(registry), entry);
        self.save(&file)
    }

    pub fn get(&self, registry: &str) -> Result<Option<Credentials>> {
        let file = self.load()?;
        Ok(file
            .registries
            .get(&normalize_registry(registry))
            .map(CredentialEntry::credentials))
    }

    /// Remove credentials for a registry. Returns true if an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file
            .registries
            .remove(&normalize_registry(registry))
            .is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    /// Registries with stored credentials, sorted.
    pub fn list_registries(&self) -> Result<Vec<String>> {
        let file = self.load()?;
        let mut registries: Vec<String> = file.registries.keys().cloned().collect();
        registries.sort();
        Ok(registries)
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            HoistError::Config(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            HoistError::Config(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HoistError::Config(format!(
                    "Failed to create credential store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp_path, &data).map_err(|e| {
            HoistError::Config(format!(
                "Failed to write credential store {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            HoistError::Config(format!(
                "Failed to rename credential store {} -> {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

impl CredentialProvider for CredentialStore {
    fn get_credentials(&self, registry: &str) -> Option<Credentials> {
        match self.get(registry) {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                None
            }
        }
    }
}

/// Docker Hub is reachable under several names; they share one entry.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("credentials.json"))
    }

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        let creds = store.get("ghcr.io").unwrap();
        assert_eq!(creds, Some(Credentials::basic("user1", "pass1")));
    }

    #[test]
    fn test_get_nonexistent() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_identity_token_entry() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store_identity_token("myacr.azurecr.io", "refresh").unwrap();
        assert_eq!(
            store.get_credentials("myacr.azurecr.io"),
            Some(Credentials::IdentityToken("refresh".to_string()))
        );
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        assert!(store.remove("ghcr.io").unwrap());
        assert_eq!(store.get("ghcr.io").unwrap(), None);
        assert!(!store.remove("ghcr.io").unwrap());
    }

    #[test]
    fn test_list_registries() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("quay.io", "u2", "p2").unwrap();
        store.store("ghcr.io", "u1", "p1").unwrap();
        assert_eq!(store.list_registries().unwrap(), vec!["ghcr.io", "quay.io"]);
    }

    #[test]
    fn test_docker_io_normalization() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("docker.io", "user", "pass").unwrap();
        let expected = Some(Credentials::basic("user", "pass"));
        assert_eq!(store.get("index.docker.io").unwrap(), expected);
        assert_eq!(store.get("registry-1.docker.io").unwrap(), expected);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth").join("credentials.json");

        CredentialStore::new(path.clone())
            .store("ghcr.io", "user", "pass")
            .unwrap();
        let creds = CredentialStore::new(path).get("ghcr.io").unwrap();
        assert_eq!(creds, Some(Credentials::basic("user", "pass")));
    }

    #[test]
    fn test_corrupt_store_yields_no_credentials() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "not json").unwrap();

        let store = CredentialStore::new(path);
        assert!(store.get("ghcr.io").is_err());
        assert_eq!(store.get_credentials("ghcr.io"), None);
    }

    #[test]
    fn test_chain_first_hit_wins() {
        let chain = CredentialChain::new(vec![
            Box::new(Anonymous),
            Box::new(StaticCredentials(Credentials::basic("a", "1"))),
            Box::new(StaticCredentials(Credentials::basic("b", "2"))),
        ]);
        assert_eq!(
            chain.get_credentials("ghcr.io"),
            Some(Credentials::basic("a", "1"))
        );
        assert_eq!(CredentialChain::new(Vec::new()).get_credentials("x"), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let basic = format!("{:?}", Credentials::basic("user", "hunter2"));
        assert!(basic.contains("user"));
        assert!(!basic.contains("hunter2"));
        let token = format!("{:?}", Credentials::IdentityToken("secret".to_string()));
        assert!(!token.contains("secret"));
    }
}
