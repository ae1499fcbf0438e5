use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use super::{DocumentStore, ListOptions, SearchOptions, StoreError, WriteReceipt, value_as_text};
use crate::document::{Document, is_design_document};

#[derive(Debug, Default)]
struct Database {
    docs: BTreeMap<String, Map<String, Value>>,
    attachments: BTreeMap<(String, String), Vec<u8>>,
}

/// An in-process document store with CouchDB-like responses.
///
/// Used by the test suites and for dry runs of a flow. It also records how
/// often each write-side operation was called and can be told to fail
/// inserts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: DashMap<String, Database>,
    forbid_create: AtomicBool,
    insert_failures: Mutex<VecDeque<StoreError>>,
    persistent_insert_failure: Mutex<Option<StoreError>>,
    inserts: AtomicUsize,
    creates: AtomicUsize,
    destroys: AtomicUsize,
    attachment_reads: AtomicUsize,
}

fn db_missing() -> StoreError {
    StoreError::not_found("Database does not exist.")
}

fn doc_missing() -> StoreError {
    StoreError::not_found("missing")
}

fn next_rev(previous: Option<&str>) -> String {
    let generation = previous
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, uuid::Uuid::new_v4().simple())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(self, name: &str) -> Self {
        self.databases.insert(name.to_string(), Database::default());
        self
    }

    /// Makes every `create_database` answer `forbidden`, as Cloudant does
    /// for API keys without admin rights.
    pub fn forbid_create(&self, forbid: bool) {
        self.forbid_create.store(forbid, Ordering::SeqCst);
    }

    /// The next insert fails with `error` instead of writing.
    pub async fn fail_next_insert(&self, error: StoreError) {
        self.insert_failures.lock().await.push_back(error);
    }

    /// Every insert fails with `error` until cleared with `None`.
    pub async fn fail_all_inserts(&self, error: Option<StoreError>) {
        *self.persistent_insert_failure.lock().await = error;
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn attachment_calls(&self) -> usize {
        self.attachment_reads.load(Ordering::SeqCst)
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn drop_database(&self, name: &str) -> bool {
        self.databases.remove(name).is_some()
    }

    pub fn document(&self, database: &str, id: &str) -> Option<Value> {
        self.databases
            .get(database)
            .and_then(|db| db.docs.get(id).cloned())
            .map(Value::Object)
    }

    pub fn document_count(&self, database: &str) -> usize {
        self.databases.get(database).map(|db| db.docs.len()).unwrap_or(0)
    }

    /// Seeds a document, creating the database when needed.
    pub fn put_document(&self, database: &str, doc: Value) -> Result<WriteReceipt, StoreError> {
        self.databases.entry(database.to_string()).or_default();
        let fields = match doc {
            Value::Object(fields) => fields,
            other => {
                return Err(StoreError::new(
                    Some(400),
                    "bad_request",
                    &format!("Document must be a JSON object, got {other}"),
                ));
            }
        };
        self.write(database, fields)
    }

    /// Adds a binary attachment to an existing document and bumps its revision.
    pub fn put_attachment(
        &self,
        database: &str,
        id: &str,
        name: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<WriteReceipt, StoreError> {
        let mut db = self.databases.get_mut(database).ok_or_else(db_missing)?;
        let db = &mut *db;
        let doc = db.docs.get_mut(id).ok_or_else(doc_missing)?;

        let rev = next_rev(doc.get("_rev").and_then(Value::as_str));
        let revpos = rev.split_once('-').map(|(n, _)| n.to_string()).unwrap_or_default();
        let manifest = doc
            .entry("_attachments")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(manifest) = manifest {
            manifest.insert(
                name.to_string(),
                json!({
                    "content_type": content_type,
                    "length": data.len(),
                    "revpos": revpos.parse::<u64>().unwrap_or(1),
                    "stub": true
                }),
            );
        }
        doc.insert("_rev".to_string(), Value::String(rev.clone()));
        db.attachments
            .insert((id.to_string(), name.to_string()), data.to_vec());

        Ok(WriteReceipt {
            ok: true,
            id: id.to_string(),
            rev,
        })
    }

    fn write(&self, database: &str, mut fields: Map<String, Value>) -> Result<WriteReceipt, StoreError> {
        let mut db = self.databases.get_mut(database).ok_or_else(db_missing)?;
        let db = &mut *db;

        let id = match fields.get("_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().simple().to_string(),
        };

        let current_rev = db
            .docs
            .get(&id)
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let given_rev = fields.get("_rev").and_then(Value::as_str).map(str::to_string);
        if current_rev != given_rev {
            return Err(StoreError::conflict("Document update conflict."));
        }

        let rev = next_rev(current_rev.as_deref());
        let revpos = rev
            .split_once('-')
            .and_then(|(n, _)| n.parse::<u64>().ok())
            .unwrap_or(1);

        if let Some(Value::Object(manifest)) = fields.get_mut("_attachments") {
            for (name, entry) in manifest.iter_mut() {
                let Some(data) = entry.get("data").and_then(Value::as_str) else {
                    continue;
                };
                let bytes = STANDARD.decode(data).map_err(|e| {
                    StoreError::new(Some(400), "bad_request", &format!("Invalid attachment data for {name}: {e}"))
                })?;
                let content_type = entry
                    .get("content_type")
                    .cloned()
                    .unwrap_or_else(|| json!("application/octet-stream"));
                *entry = json!({
                    "content_type": content_type,
                    "length": bytes.len(),
                    "revpos": revpos,
                    "stub": true
                });
                db.attachments.insert((id.clone(), name.clone()), bytes);
            }
        }

        fields.insert("_id".to_string(), Value::String(id.clone()));
        fields.insert("_rev".to_string(), Value::String(rev.clone()));
        db.docs.insert(id.clone(), fields);

        Ok(WriteReceipt { ok: true, id, rev })
    }

    fn row(id: &str, doc: &Map<String, Value>, include_docs: bool) -> Value {
        let mut row = json!({
            "id": id,
            "key": id,
            "value": { "rev": doc.get("_rev").cloned().unwrap_or(Value::Null) },
        });
        if include_docs {
            row["doc"] = Value::Object(doc.clone());
        }
        row
    }
}

fn matches_terms(doc: &Map<String, Value>, query: &str) -> bool {
    query.split_whitespace().all(|term| {
        if term == "*:*" {
            return true;
        }
        match term.split_once(':') {
            Some((field, expected)) => doc
                .get(field)
                .map(|value| value_as_text(value) == expected.trim_matches('"'))
                .unwrap_or(false),
            None => doc.values().any(|value| value_as_text(value) == term),
        }
    })
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_database(&self, database: &str) -> Result<Value, StoreError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.forbid_create.load(Ordering::SeqCst) {
            return Err(StoreError::forbidden(
                "You are not allowed to access this db.",
            ));
        }
        if self.databases.contains_key(database) {
            return Err(StoreError::file_exists(
                "The database could not be created, the file already exists.",
            ));
        }
        self.databases.insert(database.to_string(), Database::default());
        Ok(json!({ "ok": true }))
    }

    async fn list(&self, database: &str, options: &ListOptions) -> Result<Value, StoreError> {
        let db = self.databases.get(database).ok_or_else(db_missing)?;

        let mut rows: Vec<Value> = match &options.keys {
            Some(keys) => keys
                .iter()
                .map(|key| match db.docs.get(key) {
                    Some(doc) => Self::row(key, doc, options.include_docs),
                    None => json!({ "key": key, "error": "not_found" }),
                })
                .collect(),
            None => {
                let start = options.startkey.as_ref().map(value_as_text);
                let end = options.endkey.as_ref().map(value_as_text);
                db.docs
                    .iter()
                    .filter(|(id, _)| start.as_deref().map(|s| id.as_str() >= s).unwrap_or(true))
                    .filter(|(id, _)| end.as_deref().map(|e| id.as_str() <= e).unwrap_or(true))
                    .map(|(id, doc)| Self::row(id, doc, options.include_docs))
                    .collect()
            }
        };

        if options.descending == Some(true) {
            rows.reverse();
        }
        let total_rows = db.docs.len();
        let offset = options.skip.unwrap_or(0) as usize;
        let rows: Vec<Value> = rows
            .into_iter()
            .skip(offset)
            .take(options.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .collect();

        Ok(json!({ "total_rows": total_rows, "offset": offset, "rows": rows }))
    }

    async fn get(&self, database: &str, id: &str) -> Result<Value, StoreError> {
        let db = self.databases.get(database).ok_or_else(db_missing)?;
        db.docs
            .get(id)
            .cloned()
            .map(Value::Object)
            .ok_or_else(doc_missing)
    }

    async fn insert(&self, database: &str, doc: &Document) -> Result<WriteReceipt, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.insert_failures.lock().await.pop_front() {
            return Err(error);
        }
        if let Some(error) = self.persistent_insert_failure.lock().await.clone() {
            return Err(error);
        }
        self.write(database, doc.as_map().clone())
    }

    async fn destroy(&self, database: &str, id: &str, rev: &str) -> Result<WriteReceipt, StoreError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        let mut db = self.databases.get_mut(database).ok_or_else(db_missing)?;
        let current = db
            .docs
            .get(id)
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(doc_missing)?;
        if current != rev {
            return Err(StoreError::conflict("Document update conflict."));
        }

        db.docs.remove(id);
        db.attachments.retain(|(doc_id, _), _| doc_id != id);
        Ok(WriteReceipt {
            ok: true,
            id: id.to_string(),
            rev: next_rev(Some(&current)),
        })
    }

    async fn search(
        &self,
        database: &str,
        _design: &str,
        _index: &str,
        options: &SearchOptions,
    ) -> Result<Value, StoreError> {
        let db = self.databases.get(database).ok_or_else(db_missing)?;

        let matching: Vec<(&String, &Map<String, Value>)> = db
            .docs
            .iter()
            .filter(|(id, _)| !is_design_document(id))
            .filter(|(_, doc)| matches_terms(doc, &options.query))
            .collect();

        let rows: Vec<Value> = matching
            .iter()
            .take(options.limit as usize)
            .map(|(id, doc)| {
                let mut row = json!({ "id": id, "order": [], "fields": {} });
                if options.include_docs {
                    row["doc"] = Value::Object((*doc).clone());
                }
                row
            })
            .collect();

        Ok(json!({
            "total_rows": matching.len(),
            "bookmark": options.bookmark.clone().unwrap_or_default(),
            "rows": rows,
        }))
    }

    async fn get_attachment(&self, database: &str, id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        self.attachment_reads.fetch_add(1, Ordering::SeqCst);
        let db = self.databases.get(database).ok_or_else(db_missing)?;
        if !db.docs.contains_key(id) {
            return Err(doc_missing());
        }
        db.attachments
            .get(&(id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found("Document is missing attachment"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ErrorKind;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => Document::from(map),
            _ => panic!("test documents are objects"),
        }
    }

    #[tokio::test]
    async fn test_insert_requires_database() {
        let store = MemoryStore::new();
        let err = store.insert("db", &doc(json!({"a": 1}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        store.create_database("db").await.unwrap();
        let receipt = store.insert("db", &doc(json!({"_id": "x", "a": 1}))).await.unwrap();
        assert!(receipt.ok);
        assert_eq!(receipt.id, "x");
        assert!(receipt.rev.starts_with("1-"));
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_create_database_twice() {
        let store = MemoryStore::new();
        store.create_database("db").await.unwrap();
        let err = store.create_database("db").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileExists);

        store.forbid_create(true);
        let err = store.create_database("other").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(store.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_update_needs_current_rev() {
        let store = MemoryStore::new().with_database("db");
        let first = store.insert("db", &doc(json!({"_id": "x"}))).await.unwrap();

        let err = store.insert("db", &doc(json!({"_id": "x"}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let second = store
            .insert("db", &doc(json!({"_id": "x", "_rev": first.rev})))
            .await
            .unwrap();
        assert!(second.rev.starts_with("2-"));
    }

    #[tokio::test]
    async fn test_destroy() {
        let store = MemoryStore::new().with_database("db");
        let receipt = store.insert("db", &doc(json!({"_id": "x"}))).await.unwrap();

        let err = store.destroy("db", "x", "1-wrong").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        store.destroy("db", "x", &receipt.rev).await.unwrap();
        assert!(store.document("db", "x").is_none());
        assert_eq!(store.destroy_calls(), 2);
    }

    #[tokio::test]
    async fn test_inline_attachments_become_stubs() {
        let store = MemoryStore::new().with_database("db");
        store
            .insert(
                "db",
                &doc(json!({
                    "_id": "x",
                    "_attachments": {
                        "a.txt": {"content_type": "text/plain", "data": STANDARD.encode("hello")}
                    }
                })),
            )
            .await
            .unwrap();

        let stored = store.document("db", "x").unwrap();
        assert_eq!(stored["_attachments"]["a.txt"]["stub"], json!(true));
        assert_eq!(stored["_attachments"]["a.txt"]["length"], json!(5));
        assert_eq!(store.get_attachment("db", "x", "a.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_list_includes_design_documents() {
        let store = MemoryStore::new();
        store.put_document("db", json!({"_id": "_design/views"})).unwrap();
        store.put_document("db", json!({"_id": "a", "v": 1})).unwrap();
        store.put_document("db", json!({"_id": "b", "v": 2})).unwrap();

        let all = store.list("db", &ListOptions::default()).await.unwrap();
        assert_eq!(all["total_rows"], json!(3));
        assert_eq!(all["rows"].as_array().unwrap().len(), 3);

        let options = ListOptions {
            include_docs: false,
            limit: Some(1),
            descending: Some(true),
            ..ListOptions::default()
        };
        let page = store.list("db", &options).await.unwrap();
        assert_eq!(page["rows"][0]["id"], json!("b"));
        assert!(page["rows"][0].get("doc").is_none());
    }

    #[tokio::test]
    async fn test_search_matches_terms() {
        let store = MemoryStore::new();
        store.put_document("db", json!({"_id": "a", "kind": "cat", "name": "tom"})).unwrap();
        store.put_document("db", json!({"_id": "b", "kind": "dog", "name": "rex"})).unwrap();

        let found = store
            .search("db", "animals", "by_kind", &SearchOptions::new("kind:cat"))
            .await
            .unwrap();
        assert_eq!(found["total_rows"], json!(1));
        assert_eq!(found["rows"][0]["doc"]["name"], json!("tom"));

        let everything = store
            .search("db", "animals", "by_kind", &SearchOptions::new("*:*"))
            .await
            .unwrap();
        assert_eq!(everything["total_rows"], json!(2));
    }

    #[tokio::test]
    async fn test_injected_insert_failures() {
        let store = MemoryStore::new().with_database("db");
        store.fail_next_insert(StoreError::new(Some(500), "boom", "")).await;

        assert!(store.insert("db", &doc(json!({}))).await.is_err());
        assert!(store.insert("db", &doc(json!({}))).await.is_ok());

        store.fail_all_inserts(Some(StoreError::not_found("gone"))).await;
        assert!(store.insert("db", &doc(json!({}))).await.is_err());
        assert!(store.insert("db", &doc(json!({}))).await.is_err());
        store.fail_all_inserts(None).await;
        assert!(store.insert("db", &doc(json!({}))).await.is_ok());
    }
}
