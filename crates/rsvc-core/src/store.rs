//! Storage abstraction for persisted rules and the local identity.
//!
//! Two seams: [`RuleStore`] holds the versioned rule document, and [`KeyStore`]
//! holds secret blobs such as the local identity record. Both ship an in-memory
//! implementation for tests and a file-backed one for the agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use rsvc_crypto::identity::Identity;

use crate::rule::{RuleFile, RuleRecord};

pub use crate::errors::StoreError;

// ============================================================================
// Rule store
// ============================================================================

/// Persistence for Persistent rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Load every persisted rule record. A missing document is empty.
    async fn load_rules(&self) -> Result<Vec<RuleRecord>, StoreError>;

    /// Replace the persisted rule set.
    async fn save_rules(&self, rules: Vec<RuleRecord>) -> Result<(), StoreError>;
}

/// Thread-safe in-memory rule store for tests.
#[derive(Default)]
pub struct InMemoryRuleStore {
    records: RwLock<Vec<RuleRecord>>,
    saves: AtomicUsize,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with records, as if persisted by an earlier run.
    pub fn with_records(records: Vec<RuleRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save_rules` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn records(&self) -> Vec<RuleRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn load_rules(&self) -> Result<Vec<RuleRecord>, StoreError> {
        Ok(self.records.read().await.clone())
    }

    async fn save_rules(&self, rules: Vec<RuleRecord>) -> Result<(), StoreError> {
        *self.records.write().await = rules;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`RuleFile`] with records left undecoded so one bad entry can be skipped.
#[derive(Deserialize)]
struct RawRuleFile {
    version: u32,
    #[serde(default, rename = "rule")]
    rules: Vec<toml::Value>,
}

/// Rule store backed by a TOML document on disk.
#[derive(Debug, Clone)]
pub struct TomlRuleStore {
    path: PathBuf,
}

impl TomlRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleStore for TomlRuleStore {
    async fn load_rules(&self) -> Result<Vec<RuleRecord>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: RawRuleFile =
            toml::from_str(&content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if file.version != RuleFile::CURRENT_VERSION {
            return Err(StoreError::UnsupportedVersion(file.version));
        }
        let total = file.rules.len();
        let records: Vec<RuleRecord> = file
            .rules
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| match value.try_into::<RuleRecord>() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), index, error = %e, "Skipping unreadable rule record");
                    None
                }
            })
            .collect();
        debug!(path = %self.path.display(), total, read = records.len(), "Rule document read");
        Ok(records)
    }

    async fn save_rules(&self, rules: Vec<RuleRecord>) -> Result<(), StoreError> {
        let content = toml::to_string_pretty(&RuleFile::new(rules))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Atomic replace
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Saved rule document");
        Ok(())
    }
}

// ============================================================================
// Key store
// ============================================================================

/// Storage for secret key material.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn store_key(&self, key_id: &str, key_data: &[u8]) -> Result<(), StoreError>;
    async fn load_key(&self, key_id: &str) -> Result<Zeroizing<Vec<u8>>, StoreError>;
    async fn key_exists(&self, key_id: &str) -> bool;
}

/// In-memory key store for tests.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn store_key(&self, key_id: &str, key_data: &[u8]) -> Result<(), StoreError> {
        self.keys
            .write()
            .await
            .insert(key_id.to_string(), Zeroizing::new(key_data.to_vec()));
        Ok(())
    }

    async fn load_key(&self, key_id: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        self.keys
            .read()
            .await
            .get(key_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key_id.to_string()))
    }

    async fn key_exists(&self, key_id: &str) -> bool {
        self.keys.read().await.contains_key(key_id)
    }
}

/// Key store keeping one file per key in a directory, readable by the owner only.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, key_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !key_id.is_empty()
            && key_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::Io(format!("invalid key id '{}'", key_id)));
        }
        Ok(self.dir.join(format!("{}.key", key_id)))
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn store_key(&self, key_id: &str, key_data: &[u8]) -> Result<(), StoreError> {
        let path = self.key_path(key_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, key_data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await?;
        }

        debug!(key_id, "Stored key");
        Ok(())
    }

    async fn load_key(&self, key_id: &str) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let path = self.key_path(key_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Zeroizing::new(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn key_exists(&self, key_id: &str) -> bool {
        match self.key_path(key_id) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Identity record
// ============================================================================

/// Serialized local identity as kept in a [`KeyStore`].
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityRecord {
    pub version: u32,
    pub id: String,
    pub name: String,
    #[serde(rename = "privateKeyPEM")]
    pub private_key_pem: String,
    #[serde(rename = "publicKeyPEM")]
    pub public_key_pem: String,
}

impl IdentityRecord {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn from_identity(identity: &Identity) -> Result<Self, StoreError> {
        let private_key_pem = identity
            .private_key_pem()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let public_key_pem = identity
            .public_key_pem()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            version: Self::CURRENT_VERSION,
            id: identity.id().to_string(),
            name: identity.name().to_string(),
            private_key_pem: private_key_pem.to_string(),
            public_key_pem,
        })
    }

    /// Rebuild the identity, checking the stored id against the key.
    pub fn to_identity(&self) -> Result<Identity, StoreError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(StoreError::UnsupportedVersion(self.version));
        }
        let identity = Identity::from_pem(self.name.clone(), &self.private_key_pem)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if identity.id() != self.id {
            return Err(StoreError::Serialization(format!(
                "stored id {} does not match key",
                self.id
            )));
        }
        Ok(identity)
    }

    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        serde_json::to_vec_pretty(self)
            .map(Zeroizing::new)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Persistence, Rule, RulePolicy};

    fn sample_records() -> Vec<RuleRecord> {
        vec![
            Rule::new("clock", "alice")
                .with_policy(RulePolicy::Allow)
                .with_persistence(Persistence::Persistent)
                .to_record(),
            Rule::new("camera", "bob")
                .with_policy(RulePolicy::Deny)
                .with_persistence(Persistence::Persistent)
                .to_record(),
        ]
    }

    #[tokio::test]
    async fn test_in_memory_rule_store_counts_saves() {
        let store = InMemoryRuleStore::new();
        assert!(store.load_rules().await.unwrap().is_empty());

        store.save_rules(sample_records()).await.unwrap();
        store.save_rules(sample_records()).await.unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.records().await, sample_records());
    }

    #[tokio::test]
    async fn test_toml_rule_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlRuleStore::new(dir.path().join("nested").join("rules.toml"));

        // Missing file reads as empty
        assert!(store.load_rules().await.unwrap().is_empty());

        store.save_rules(sample_records()).await.unwrap();
        assert_eq!(store.load_rules().await.unwrap(), sample_records());

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("version = 1"));
    }

    #[tokio::test]
    async fn test_toml_rule_store_rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, "version = 7\n").unwrap();

        let store = TomlRuleStore::new(&path);
        assert_eq!(
            store.load_rules().await,
            Err(StoreError::UnsupportedVersion(7))
        );
    }

    #[tokio::test]
    async fn test_toml_rule_store_skips_unreadable_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            r#"version = 1

[[rule]]
CredentialsID = "alice"
serviceName = "clock"
Policy = 2
Targets = 0
Persistence = 1

[[rule]]
CredentialsID = "bob"
serviceName = "clock"
Targets = 0
Persistence = 1

[[rule]]
CredentialsID = "carol"
serviceName = "clock"
Policy = "allow"
Targets = 0
Persistence = 1
"#,
        )
        .unwrap();

        let records = TomlRuleStore::new(&path).load_rules().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].credentials_id, "alice");
    }

    #[tokio::test]
    async fn test_file_key_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());

        assert!(!store.key_exists("local_identity").await);
        assert!(matches!(
            store.load_key("local_identity").await,
            Err(StoreError::NotFound(_))
        ));

        store.store_key("local_identity", b"secret").await.unwrap();
        assert!(store.key_exists("local_identity").await);
        assert_eq!(store.load_key("local_identity").await.unwrap().as_slice(), b"secret");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("local_identity.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(store.store_key("../escape", b"x").await.is_err());
    }

    #[test]
    fn test_identity_record_round_trip() {
        let identity = Identity::generate("workstation");
        let record = IdentityRecord::from_identity(&identity).unwrap();
        let json = record.to_json().unwrap();

        let text = std::str::from_utf8(&json).unwrap();
        assert!(text.contains("\"privateKeyPEM\""));
        assert!(text.contains("\"publicKeyPEM\""));

        let restored = IdentityRecord::from_json(&json).unwrap().to_identity().unwrap();
        assert_eq!(restored.id(), identity.id());
        assert!(restored.has_private_key());
    }

    #[test]
    fn test_identity_record_rejects_mismatched_id() {
        let identity = Identity::generate("workstation");
        let mut record = IdentityRecord::from_identity(&identity).unwrap();
        record.id = "0".repeat(64);
        assert!(record.to_identity().is_err());

        let public_only = identity.strip_private();
        assert!(IdentityRecord::from_identity(&public_only).is_err());
    }
}
