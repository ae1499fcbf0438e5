use async_trait::async_trait;
use dashmap::DashMap;
use dotenvy::Error as DotenvError;
use rand::{RngCore, rng};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{error, info};

/// Secrets are addressed by key and revealed through an opaque handle, so a
/// handle can be passed around without carrying the secret itself.
#[async_trait]
pub trait SecretsManagerType: Send + Sync {
    fn get(&self, key: &str) -> Option<u32>;
    fn keys(&self) -> Vec<String>;
    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError>;
    async fn update_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError>;
    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError>;
    async fn reveal(&self, handle: u32) -> Result<Option<String>, SecretsError>;
    fn name(&self) -> &'static str;
    fn clone_box(&self) -> Arc<dyn SecretsManagerType>;
    fn debug_box(&self) -> String;
}

pub struct SecretsManager(pub Arc<dyn SecretsManagerType + Send + Sync>);

impl SecretsManager {
    pub fn keys(&self) -> Vec<String> {
        self.0.keys()
    }

    pub async fn add_secret(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        self.0.add_secret(key, value).await
    }

    pub async fn update_secret(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        self.0.update_secret(key, value).await
    }

    pub async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        self.0.delete_secret(key).await
    }

    pub async fn get_secret(&self, key: &str) -> Result<Option<String>, SecretsError> {
        match self.0.get(key) {
            Some(handle) => self.0.reveal(handle).await,
            None => Ok(None),
        }
    }
}

impl Clone for SecretsManager {
    fn clone(&self) -> Self {
        SecretsManager(self.0.clone_box())
    }
}

impl Debug for SecretsManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

impl Serialize for SecretsManager {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("SecretsManager", 2)?;
        state.serialize_field("name", self.0.name())?;
        state.serialize_field("keys", &self.0.keys())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for SecretsManager {
    fn deserialize<D>(_deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Err(serde::de::Error::custom(
            "SecretsManager cannot be deserialized dynamically",
        ))
    }
}

#[derive(Debug, Clone, Error)]
pub enum SecretsError {
    #[error("secret store io error: {0}")]
    Io(String),
    #[error("secret not found")]
    NotFound,
}

/// Secrets kept in memory and mirrored to a `.env` file in the root directory.
#[derive(Clone)]
pub struct EnvSecretsManager {
    keys: Arc<DashMap<String, u32>>,
    secrets: Arc<DashMap<u32, String>>,
    env_path: Option<PathBuf>,
}

impl EnvSecretsManager {
    pub fn new(dotenv_dir: Option<PathBuf>) -> Arc<Self> {
        let env_path = dotenv_dir.map(|dir| dir.join(".env"));
        let mgr = Arc::new(Self {
            keys: Arc::new(DashMap::new()),
            secrets: Arc::new(DashMap::new()),
            env_path: env_path.clone(),
        });

        match env_path {
            Some(path) if path.exists() => mgr.load_dotenv(&path),
            Some(path) => info!(".env file {} not found, starting empty", path.display()),
            None => info!("secrets are kept in memory only"),
        }

        mgr
    }

    fn put(&self, key: &str, secret: &str) {
        let handle = match self.keys.get(key) {
            Some(handle) => *handle,
            None => {
                let id = rng().next_u32();
                self.keys.insert(key.to_string(), id);
                id
            }
        };
        self.secrets.insert(handle, secret.to_string());
    }

    fn load_dotenv(&self, path: &Path) {
        match dotenvy::from_path_iter(path) {
            Ok(iter) => {
                self.keys.clear();
                self.secrets.clear();
                for item in iter {
                    match item {
                        Ok((k, v)) => self.put(&k, &v),
                        Err(e) => error!("Malformed line in {}: {}", path.display(), e),
                    }
                }
                info!(".env loaded from {}", path.display());
            }
            Err(DotenvError::Io(io)) if io.kind() == std::io::ErrorKind::NotFound => {
                info!(".env file {} not found, skipping", path.display());
            }
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
            }
        }
    }

    fn write_dotenv(&self) -> Result<(), SecretsError> {
        let Some(path) = &self.env_path else {
            return Ok(());
        };

        let mut lines: Vec<String> = self
            .keys
            .iter()
            .filter_map(|entry| {
                self.secrets
                    .get(entry.value())
                    .map(|value| format!("{}={}", entry.key(), value.replace('\n', "\\n")))
            })
            .collect();
        lines.sort();

        let mut out = lines.join("\n");
        out.push('\n');
        std::fs::write(path, out).map_err(|e| {
            error!("Failed to write to .env file {}: {}", path.display(), e);
            SecretsError::Io(e.to_string())
        })
    }
}

impl Debug for EnvSecretsManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvSecretsManager {{ keys: {:?} }}", self.keys())
    }
}

#[async_trait]
impl SecretsManagerType for EnvSecretsManager {
    fn get(&self, key: &str) -> Option<u32> {
        self.keys.get(key).map(|handle| *handle)
    }

    fn keys(&self) -> Vec<String> {
        self.keys.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        self.put(key, secret);
        self.write_dotenv()
    }

    async fn update_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        self.put(key, secret);
        self.write_dotenv()
    }

    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        if let Some((_, handle)) = self.keys.remove(key) {
            self.secrets.remove(&handle);
        }
        self.write_dotenv()
    }

    async fn reveal(&self, handle: u32) -> Result<Option<String>, SecretsError> {
        Ok(self.secrets.get(&handle).map(|secret| secret.clone()))
    }

    fn name(&self) -> &'static str {
        "EnvSecrets"
    }

    fn clone_box(&self) -> Arc<dyn SecretsManagerType> {
        Arc::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("SecretsManager {{ keys: {:?} }}", self.keys())
    }
}

/// Secrets that never touch the filesystem.
pub struct MemorySecretsManager {
    handles: Arc<DashMap<String, u32>>,
    secrets: Arc<DashMap<String, String>>,
    next_handle: Arc<AtomicU32>,
}

impl MemorySecretsManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handles: Arc::new(DashMap::new()),
            secrets: Arc::new(DashMap::new()),
            next_handle: Arc::new(AtomicU32::new(1)),
        })
    }
}

impl Clone for MemorySecretsManager {
    fn clone(&self) -> Self {
        Self {
            handles: self.handles.clone(),
            secrets: self.secrets.clone(),
            next_handle: self.next_handle.clone(),
        }
    }
}

#[async_trait]
impl SecretsManagerType for MemorySecretsManager {
    fn get(&self, key: &str) -> Option<u32> {
        self.handles.get(key).map(|v| *v)
    }

    fn keys(&self) -> Vec<String> {
        self.handles.iter().map(|kv| kv.key().clone()).collect()
    }

    async fn add_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        self.handles
            .entry(key.to_string())
            .or_insert_with(|| self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.secrets.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    async fn update_secret(&self, key: &str, secret: &str) -> Result<(), SecretsError> {
        if !self.handles.contains_key(key) {
            return Err(SecretsError::NotFound);
        }
        self.secrets.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<(), SecretsError> {
        let existed_h = self.handles.remove(key).is_some();
        let existed_s = self.secrets.remove(key).is_some();
        if existed_h || existed_s {
            Ok(())
        } else {
            Err(SecretsError::NotFound)
        }
    }

    async fn reveal(&self, handle: u32) -> Result<Option<String>, SecretsError> {
        let key = self
            .handles
            .iter()
            .find(|kv| *kv.value() == handle)
            .map(|kv| kv.key().clone());

        Ok(key.and_then(|key| self.secrets.get(&key).map(|v| v.clone())))
    }

    fn name(&self) -> &'static str {
        "MemorySecretsManager"
    }

    fn clone_box(&self) -> Arc<dyn SecretsManagerType> {
        Arc::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!(
            "MemorySecretsManager {{ handles: {}, secrets: {} }}",
            self.handles.len(),
            self.secrets.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_env_manager_without_file() {
        let mgr = EnvSecretsManager::new(None);

        mgr.add_secret("foo", "bar").await.unwrap();
        assert_eq!(mgr.keys(), vec!["foo".to_string()]);

        let handle = mgr.get("foo").unwrap();
        assert_eq!(mgr.reveal(handle).await.unwrap(), Some("bar".to_string()));

        mgr.update_secret("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo"), Some(handle));
        assert_eq!(mgr.reveal(handle).await.unwrap(), Some("baz".to_string()));

        mgr.delete_secret("foo").await.unwrap();
        assert!(mgr.get("foo").is_none());
        assert_eq!(mgr.reveal(handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dotenv_write_on_add_update_delete() {
        let dir = tempdir().unwrap();
        let mgr = EnvSecretsManager::new(Some(dir.path().to_path_buf()));

        mgr.add_secret("X", "1").await.unwrap();
        let env_path = dir.path().join(".env");
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("X=1"));

        mgr.update_secret("X", "2").await.unwrap();
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("X=2"));
        assert!(!content.contains("X=1"));

        mgr.delete_secret("X").await.unwrap();
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(!content.contains("X="));
    }

    #[tokio::test]
    async fn test_dotenv_is_loaded_on_start() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".env"), "CLOUDANT_A_USERNAME=admin\n").unwrap();

        let mgr = SecretsManager(EnvSecretsManager::new(Some(dir.path().to_path_buf())));
        assert_eq!(
            mgr.get_secret("CLOUDANT_A_USERNAME").await.unwrap(),
            Some("admin".to_string())
        );
        assert_eq!(mgr.get_secret("MISSING").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_manager_shares_state_between_clones() {
        let mgr = SecretsManager(MemorySecretsManager::new());
        let clone = mgr.clone();

        mgr.add_secret("k", "v").await.unwrap();
        assert_eq!(clone.get_secret("k").await.unwrap(), Some("v".to_string()));

        assert!(matches!(
            clone.update_secret("other", "x").await,
            Err(SecretsError::NotFound)
        ));
        clone.delete_secret("k").await.unwrap();
        assert_eq!(mgr.get_secret("k").await.unwrap(), None);
    }
}
