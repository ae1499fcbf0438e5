//! Turning arbitrary message payloads into documents the database accepts.
//!
//! CouchDB reserves every top-level field starting with `_`; only a fixed
//! set of them may appear in a document body. Payloads coming out of a flow
//! can be anything (objects, JSON text, bare scalars), so they are first
//! classified and then mapped onto a [`Document`].

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RESERVED_PREFIX: char = '_';

/// Underscore fields CouchDB accepts in a document body.
pub const RESERVED_KEYS: [&str; 9] = [
    "_id",
    "_rev",
    "_attachments",
    "_deleted",
    "_revisions",
    "_revs_info",
    "_conflicts",
    "_deleted_conflicts",
    "_local_seq",
];

pub const DESIGN_PREFIX: &str = "_design/";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("_id").and_then(Value::as_str)
    }

    pub fn rev(&self) -> Option<&str> {
        self.0.get("_rev").and_then(Value::as_str)
    }

    pub fn attachments(&self) -> Option<&Map<String, Value>> {
        self.0.get("_attachments").and_then(Value::as_object)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// What an inbound payload turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// An object, either given directly or parsed from JSON text.
    Structured(Map<String, Value>),
    /// Anything that is not an object: numbers, booleans, null, arrays,
    /// or JSON text that parses to one of those.
    Scalar(Value),
    /// Text that is not JSON at all.
    Unparsable(String),
}

impl RawPayload {
    pub fn classify(raw: &Value) -> Self {
        match raw {
            Value::Object(map) => RawPayload::Structured(map.clone()),
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => RawPayload::Structured(map),
                Ok(_) => RawPayload::Scalar(raw.clone()),
                Err(_) => RawPayload::Unparsable(text.clone()),
            },
            other => RawPayload::Scalar(other.clone()),
        }
    }

    pub fn into_document(self, fallback_key: &str) -> Document {
        match self {
            RawPayload::Structured(map) => Document(map),
            RawPayload::Scalar(value) => wrap(fallback_key, value),
            RawPayload::Unparsable(text) => wrap(fallback_key, Value::String(text)),
        }
    }
}

fn wrap(key: &str, value: Value) -> Document {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Document(map)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedKey {
    pub from: String,
    pub to: String,
}

impl fmt::Display for RenamedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Property '{}' renamed to '{}'.", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub document: Document,
    pub renamed: Vec<RenamedKey>,
}

/// Never fails: the worst case is a single-key wrapper document.
pub fn normalize(raw: &Value, fallback_key: &str) -> Normalized {
    let document = RawPayload::classify(raw).into_document(fallback_key);
    let (document, renamed) = clean_keys(document);
    Normalized { document, renamed }
}

pub fn is_valid_field_name(key: &str) -> bool {
    !key.starts_with(RESERVED_PREFIX) || RESERVED_KEYS.contains(&key)
}

/// Strips one leading underscore from every non-reserved field.
pub fn clean_keys(document: Document) -> (Document, Vec<RenamedKey>) {
    let mut map = document.0;
    let invalid: Vec<String> = map
        .keys()
        .filter(|key| !is_valid_field_name(key))
        .cloned()
        .collect();

    let mut renamed = Vec::with_capacity(invalid.len());
    for key in invalid {
        if let Some(value) = map.shift_remove(&key) {
            let new_key = key[RESERVED_PREFIX.len_utf8()..].to_string();
            map.insert(new_key.clone(), value);
            renamed.push(RenamedKey { from: key, to: new_key });
        }
    }
    (Document(map), renamed)
}

static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\\/]+").expect("valid separator pattern"));

/// Lower-cases, drops leading underscores and collapses whitespace and
/// slash runs into a single hyphen.
pub fn clean_database_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let trimmed = lowered.trim_start_matches(RESERVED_PREFIX);
    SEPARATORS.replace_all(trimmed, "-").into_owned()
}

/// A database name that already went through [`clean_database_name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn new(raw: &str) -> Self {
        Self(clean_database_name(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_design_document(id: &str) -> bool {
    id.starts_with(DESIGN_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_passes_through() {
        let out = normalize(&json!({"name": "a", "_id": "x"}), "payload");
        assert_eq!(out.document.into_value(), json!({"name": "a", "_id": "x"}));
        assert!(out.renamed.is_empty());
    }

    #[test]
    fn test_json_text_is_parsed() {
        let out = normalize(&json!(r#"{"name":"a"}"#), "payload");
        assert_eq!(out.document.into_value(), json!({"name": "a"}));
    }

    #[test]
    fn test_unparsable_text_is_wrapped() {
        for raw in ["hello", "{broken", ""] {
            let out = normalize(&json!(raw), "payload");
            assert_eq!(out.document.into_value(), json!({ "payload": raw }));
        }
    }

    #[test]
    fn test_scalars_are_wrapped_under_fallback_key() {
        for raw in [json!(42), json!(true), json!(null), json!([1, 2]), json!("42")] {
            let out = normalize(&raw, "msg");
            assert_eq!(out.document.into_value(), json!({ "msg": raw.clone() }));
        }
    }

    #[test]
    fn test_reserved_prefix_is_stripped() {
        let out = normalize(&json!({"_secret": 1, "_rev": "1-a", "plain": 2}), "payload");
        let doc = out.document.into_value();
        assert_eq!(doc, json!({"secret": 1, "_rev": "1-a", "plain": 2}));
        assert_eq!(
            out.renamed,
            vec![RenamedKey { from: "_secret".into(), to: "secret".into() }]
        );
        assert_eq!(out.renamed[0].to_string(), "Property '_secret' renamed to 'secret'.");
    }

    #[test]
    fn test_every_allowlisted_key_survives() {
        let mut raw = Map::new();
        for key in RESERVED_KEYS {
            raw.insert(key.to_string(), json!(key));
        }
        let out = normalize(&Value::Object(raw.clone()), "payload");
        assert!(out.renamed.is_empty());
        assert_eq!(out.document.as_map(), &raw);
    }

    #[test]
    fn test_clean_database_name() {
        assert_eq!(clean_database_name("Test DB"), "test-db");
        assert_eq!(clean_database_name("_users"), "users");
        assert_eq!(clean_database_name("a / b\\\\c"), "a-b-c");
        assert_eq!(clean_database_name("plain"), "plain");
    }

    #[test]
    fn test_clean_database_name_is_idempotent() {
        let samples = ["Test DB", "__x", "_ _a", " _lead", "A\t\nB", "_/_x", "ÄÖ db", "", "_"];
        for sample in samples {
            let once = clean_database_name(sample);
            assert_eq!(clean_database_name(&once), once, "input {sample:?}");
        }
    }

    #[test]
    fn test_clean_database_name_is_idempotent_for_all_short_inputs() {
        const ALPHABET: [char; 9] = ['_', ' ', '/', '\\', '\t', 'a', 'B', '-', 'É'];
        let mut inputs = vec![String::new()];
        for _ in 0..4 {
            let longer: Vec<String> = inputs
                .iter()
                .filter(|s| s.chars().count() == inputs.last().map_or(0, |l| l.chars().count()))
                .flat_map(|s| ALPHABET.iter().map(move |c| format!("{s}{c}")))
                .collect();
            inputs.extend(longer);
        }
        assert_eq!(inputs.len(), 1 + 9 + 81 + 729 + 6561);

        for input in &inputs {
            let once = clean_database_name(input);
            assert_eq!(clean_database_name(&once), once, "input {input:?}");
            assert!(!once.starts_with('_'), "input {input:?}");
        }
    }

    #[test]
    fn test_design_documents() {
        assert!(is_design_document("_design/views"));
        assert!(!is_design_document("doc_design/"));
    }
}
