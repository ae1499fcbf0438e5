use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::secret::{SecretsError, SecretsManager};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// What the admin surface shows: never the password itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_password: Option<bool>,
}

/// A credential change as posted by the editor.
///
/// An empty or missing `username` removes it. An empty `password` removes
/// it, a missing one keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialUpdate {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Credentials of `cloudant` configuration entities, keyed by entity id.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    secrets: SecretsManager,
}

/// Encodes an entity id into the `[A-Z0-9_]` alphabet of secret keys.
///
/// Lower-case letters and digits are upper-cased, every other byte becomes
/// `_` plus two hex digits. `_` only ever starts an escape, so distinct ids
/// never share a key.
fn key_part(id: &str) -> String {
    let mut part = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() {
            part.push(byte.to_ascii_uppercase() as char);
        } else {
            part.push('_');
            part.push_str(&hex::encode_upper([byte]));
        }
    }
    part
}

pub fn username_key(id: &str) -> String {
    format!("CLOUDANT_{}_USERNAME", key_part(id))
}

pub fn password_key(id: &str) -> String {
    format!("CLOUDANT_{}_PASSWORD", key_part(id))
}

impl CredentialStore {
    pub fn new(secrets: SecretsManager) -> Self {
        Self { secrets }
    }

    pub async fn load(&self, id: &str) -> Result<Credentials, SecretsError> {
        Ok(Credentials {
            username: self.secrets.get_secret(&username_key(id)).await?,
            password: self.secrets.get_secret(&password_key(id)).await?,
        })
    }

    pub async fn summary(&self, id: &str) -> Result<CredentialSummary, SecretsError> {
        let credentials = self.load(id).await?;
        if credentials.username.is_none() && credentials.password.is_none() {
            return Ok(CredentialSummary::default());
        }
        Ok(CredentialSummary {
            username: credentials.username,
            has_password: Some(credentials.password.is_some()),
        })
    }

    pub async fn update(&self, id: &str, update: CredentialUpdate) -> Result<(), SecretsError> {
        match update.username.as_deref() {
            Some(username) if !username.is_empty() => {
                self.put(&username_key(id), username).await?;
            }
            _ => self.remove(&username_key(id)).await?,
        }

        match update.password.as_deref() {
            Some("") => self.remove(&password_key(id)).await?,
            Some(password) => self.put(&password_key(id), password).await?,
            None => debug!(id, "password unchanged"),
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), SecretsError> {
        self.remove(&username_key(id)).await?;
        self.remove(&password_key(id)).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        if self.secrets.0.get(key).is_some() {
            self.secrets.update_secret(key, value).await
        } else {
            self.secrets.add_secret(key, value).await
        }
    }

    async fn remove(&self, key: &str) -> Result<(), SecretsError> {
        match self.secrets.delete_secret(key).await {
            Ok(()) | Err(SecretsError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::MemorySecretsManager;

    fn store() -> CredentialStore {
        CredentialStore::new(SecretsManager(MemorySecretsManager::new()))
    }

    #[test]
    fn test_keys_are_escaped() {
        assert_eq!(username_key("a1b2.c3"), "CLOUDANT_A1B2_2EC3_USERNAME");
        assert_eq!(password_key("cfg"), "CLOUDANT_CFG_PASSWORD");
        assert_eq!(username_key("A_b"), "CLOUDANT__41_5FB_USERNAME");
        assert_eq!(username_key("é"), "CLOUDANT__C3_A9_USERNAME");
    }

    #[test]
    fn test_similar_ids_get_distinct_keys() {
        let ids = ["a.b", "a_b", "A-B", "a-b", "ab", "AB", "a b", "a__b", "a_5Fb"];
        let keys: std::collections::HashSet<String> = ids.iter().map(|id| username_key(id)).collect();
        assert_eq!(keys.len(), ids.len());
    }

    #[tokio::test]
    async fn test_credentials_of_similar_ids_stay_isolated() {
        let store = store();
        store
            .update("a.b", CredentialUpdate { username: Some("alice".into()), password: Some("pw-a".into()) })
            .await
            .unwrap();
        store
            .update("a-b", CredentialUpdate { username: Some("bob".into()), password: None })
            .await
            .unwrap();

        assert_eq!(store.load("A-B").await.unwrap(), Credentials::default());
        assert_eq!(store.load("a-b").await.unwrap().username.as_deref(), Some("bob"));

        store.delete("a_b").await.unwrap();
        let kept = store.load("a.b").await.unwrap();
        assert_eq!(kept.username.as_deref(), Some("alice"));
        assert_eq!(kept.password.as_deref(), Some("pw-a"));
    }

    #[tokio::test]
    async fn test_update_and_summary() {
        let store = store();
        assert_eq!(store.summary("cfg").await.unwrap(), CredentialSummary::default());

        store
            .update("cfg", CredentialUpdate { username: Some("admin".into()), password: Some("pw".into()) })
            .await
            .unwrap();
        assert_eq!(
            store.summary("cfg").await.unwrap(),
            CredentialSummary { username: Some("admin".into()), has_password: Some(true) }
        );

        // missing password keeps the stored one
        store
            .update("cfg", CredentialUpdate { username: Some("other".into()), password: None })
            .await
            .unwrap();
        let loaded = store.load("cfg").await.unwrap();
        assert_eq!(loaded.username.as_deref(), Some("other"));
        assert_eq!(loaded.password.as_deref(), Some("pw"));

        // empty values clear
        store
            .update("cfg", CredentialUpdate { username: Some(String::new()), password: Some(String::new()) })
            .await
            .unwrap();
        assert_eq!(store.load("cfg").await.unwrap(), Credentials::default());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        store.delete("never-stored").await.unwrap();

        store
            .update("cfg", CredentialUpdate { username: Some("u".into()), password: Some("p".into()) })
            .await
            .unwrap();
        store.delete("cfg").await.unwrap();
        assert_eq!(store.load("cfg").await.unwrap(), Credentials::default());
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let summary = CredentialSummary { username: Some("u".into()), has_password: Some(false) };
        assert_eq!(
            serde_json::to_value(summary).unwrap(),
            serde_json::json!({"username": "u", "hasPassword": false})
        );
        assert_eq!(serde_json::to_value(CredentialSummary::default()).unwrap(), serde_json::json!({}));
    }
}
