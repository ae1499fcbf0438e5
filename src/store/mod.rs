//! The document database boundary.
//!
//! Nodes only talk to a [`DocumentStore`]; wire protocol, authentication and
//! transport retries belong to the implementation behind it.

pub mod http;
pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{connection::ConnectionDescriptor, document::Document, message::is_truthy};

pub const DEFAULT_SEARCH_LIMIT: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    FileExists,
    Forbidden,
    Conflict,
    Transient,
    Other,
}

/// An error reported by the database, shaped like CouchDB's `{error, reason}` body.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error}: {reason}")]
pub struct StoreError {
    #[serde(default)]
    pub status: Option<u16>,
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

impl StoreError {
    pub fn new(status: Option<u16>, error: &str, reason: &str) -> Self {
        Self {
            status,
            error: error.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(reason: &str) -> Self {
        Self::new(Some(404), "not_found", reason)
    }

    pub fn file_exists(reason: &str) -> Self {
        Self::new(Some(412), "file_exists", reason)
    }

    pub fn forbidden(reason: &str) -> Self {
        Self::new(Some(403), "forbidden", reason)
    }

    pub fn conflict(reason: &str) -> Self {
        Self::new(Some(409), "conflict", reason)
    }

    /// The request never produced a response.
    pub fn transport(reason: &str) -> Self {
        Self::new(None, "transport_error", reason)
    }

    pub fn kind(&self) -> ErrorKind {
        match (self.error.as_str(), self.status) {
            ("not_found", _) | (_, Some(404)) => ErrorKind::NotFound,
            ("file_exists", _) | (_, Some(412)) => ErrorKind::FileExists,
            ("forbidden", _) | (_, Some(403)) => ErrorKind::Forbidden,
            ("conflict", _) | (_, Some(409)) => ErrorKind::Conflict,
            (_, None) | (_, Some(429)) => ErrorKind::Transient,
            (_, Some(status)) if status >= 500 => ErrorKind::Transient,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// `{ok, id, rev}` as returned by writes and deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    #[serde(default)]
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

/// Options for `_all_docs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListOptions {
    pub include_docs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descending: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startkey: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endkey: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            include_docs: true,
            limit: None,
            skip: None,
            descending: None,
            startkey: None,
            endkey: None,
            keys: None,
        }
    }
}

impl ListOptions {
    /// Reads the recognised list options out of an object payload.
    pub fn from_payload(payload: &Value) -> Self {
        let Some(options) = payload.as_object() else {
            return Self::default();
        };
        Self {
            include_docs: options.get("include_docs").map(is_truthy).unwrap_or(true),
            limit: options.get("limit").and_then(Value::as_u64),
            skip: options.get("skip").and_then(Value::as_u64),
            descending: options.get("descending").and_then(Value::as_bool),
            startkey: options.get("startkey").or_else(|| options.get("start_key")).cloned(),
            endkey: options.get("endkey").or_else(|| options.get("end_key")).cloned(),
            keys: options.get("keys").and_then(|keys| {
                keys.as_array().map(|keys| {
                    keys.iter()
                        .filter_map(|k| k.as_str().map(str::to_string))
                        .collect()
                })
            }),
        }
    }
}

/// Options for a search index query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub query: String,
    pub include_docs: bool,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
}

impl SearchOptions {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            include_docs: true,
            limit: DEFAULT_SEARCH_LIMIT,
            sort: None,
            bookmark: None,
        }
    }

    /// Builds search options from a message payload.
    ///
    /// An explicit `query` or `q` wins; otherwise the payload's fields become
    /// `key:value` terms.
    pub fn from_payload(payload: &Value) -> Self {
        let empty = Map::new();
        let options = payload.as_object().unwrap_or(&empty);

        let query = options
            .get("query")
            .filter(|q| is_truthy(q))
            .or_else(|| options.get("q").filter(|q| is_truthy(q)))
            .map(value_as_text)
            .unwrap_or_else(|| format_search_query(payload));

        Self {
            query,
            include_docs: options.get("include_docs").map(is_truthy).unwrap_or(true),
            limit: options
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_SEARCH_LIMIT),
            sort: options.get("sort").filter(|s| !s.is_null()).cloned(),
            bookmark: options.get("bookmark").and_then(Value::as_str).map(str::to_string),
        }
    }
}

/// `key:value` pairs joined by spaces for objects, the value itself otherwise.
pub fn format_search_query(query: &Value) -> String {
    match query {
        Value::Object(fields) => {
            if let Some(q) = fields.get("q") {
                return value_as_text(q);
            }
            fields
                .iter()
                .map(|(key, value)| format!("{}:{}", key, value_as_text(value)))
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string()
        }
        other => value_as_text(other),
    }
}

pub(crate) fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_database(&self, database: &str) -> Result<Value, StoreError>;
    async fn list(&self, database: &str, options: &ListOptions) -> Result<Value, StoreError>;
    async fn get(&self, database: &str, id: &str) -> Result<Value, StoreError>;
    async fn insert(&self, database: &str, doc: &Document) -> Result<WriteReceipt, StoreError>;
    async fn destroy(&self, database: &str, id: &str, rev: &str) -> Result<WriteReceipt, StoreError>;
    async fn search(
        &self,
        database: &str,
        design: &str,
        index: &str,
        options: &SearchOptions,
    ) -> Result<Value, StoreError>;
    async fn get_attachment(&self, database: &str, id: &str, name: &str) -> Result<Vec<u8>, StoreError>;
}

/// Builds a store client for a resolved connection.
pub trait Connector: Send + Sync {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

/// Connects over HTTP with [`http::CouchClient`].
#[derive(Debug, Clone, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::new(http::CouchClient::new(descriptor)?))
    }
}

/// Hands out the same store regardless of the descriptor.
#[derive(Clone)]
pub struct SharedConnector(pub Arc<dyn DocumentStore>);

impl Connector for SharedConnector {
    fn connect(&self, _descriptor: &ConnectionDescriptor) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(self.0.clone())
    }
}

impl fmt::Debug for SharedConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedConnector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_kinds() {
        assert_eq!(StoreError::not_found("missing").kind(), ErrorKind::NotFound);
        assert_eq!(StoreError::new(Some(404), "whatever", "").kind(), ErrorKind::NotFound);
        assert_eq!(StoreError::file_exists("db").kind(), ErrorKind::FileExists);
        assert_eq!(StoreError::forbidden("key").kind(), ErrorKind::Forbidden);
        assert_eq!(StoreError::transport("reset").kind(), ErrorKind::Transient);
        assert_eq!(StoreError::new(Some(503), "unavailable", "").kind(), ErrorKind::Transient);
        assert_eq!(StoreError::new(Some(400), "bad_request", "").kind(), ErrorKind::Other);
    }

    #[test]
    fn test_search_query_from_fields() {
        let query = format_search_query(&json!({"name": "bob", "age": 4}));
        assert_eq!(query, "name:bob age:4");
        let query = format_search_query(&json!({"z": "last", "a": "first", "m": 2}));
        assert_eq!(query, "z:last a:first m:2");
        assert_eq!(format_search_query(&json!({"q": "a:b", "x": 1})), "a:b");
        assert_eq!(format_search_query(&json!("free text")), "free text");
    }

    #[test]
    fn test_search_options_defaults_and_overrides() {
        let defaults = SearchOptions::from_payload(&json!("name:bob"));
        assert_eq!(defaults.query, "name:bob");
        assert!(defaults.include_docs);
        assert_eq!(defaults.limit, 200);

        let custom = SearchOptions::from_payload(&json!({
            "query": "type:x",
            "limit": 5,
            "include_docs": false,
            "sort": "-name"
        }));
        assert_eq!(custom.query, "type:x");
        assert_eq!(custom.limit, 5);
        assert!(!custom.include_docs);
        assert_eq!(custom.sort, Some(json!("-name")));

        let with_q = SearchOptions::from_payload(&json!({"q": "k:v", "limit": null}));
        assert_eq!(with_q.query, "k:v");
        assert_eq!(with_q.limit, 200);
    }

    #[test]
    fn test_list_options_from_payload() {
        assert_eq!(ListOptions::from_payload(&json!("ignored")), ListOptions::default());
        let options = ListOptions::from_payload(&json!({"limit": 2, "keys": ["a", "b"], "descending": true}));
        assert!(options.include_docs);
        assert_eq!(options.limit, Some(2));
        assert_eq!(options.keys, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(options.descending, Some(true));
    }
}
