//! Platform service bindings, as injected by Cloud Foundry in `VCAP_SERVICES`.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const VCAP_SERVICES: &str = "VCAP_SERVICES";

static CLOUDANT_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^cloudant").expect("valid label pattern"));

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error("could not read service bindings from {0}: {1}")]
    Io(PathBuf, String),
    #[error("malformed service bindings: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub credentials: Map<String, Value>,
}

impl ServiceInstance {
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).and_then(Value::as_str)
    }
}

/// The `{name, label}` pair listed by the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub label: String,
}

/// Bindings grouped by service label, in the shape of `VCAP_SERVICES`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceBindings(BTreeMap<String, Vec<ServiceInstance>>);

impl ServiceBindings {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, ServicesError> {
        if raw.trim().is_empty() {
            return Ok(Self::empty());
        }
        serde_json::from_str(raw).map_err(|e| ServicesError::Parse(e.to_string()))
    }

    /// Reads `VCAP_SERVICES`; an unset variable means no bindings.
    pub fn from_env() -> Result<Self, ServicesError> {
        match std::env::var(VCAP_SERVICES) {
            Ok(raw) => Self::from_json(&raw),
            Err(_) => Ok(Self::empty()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ServicesError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ServicesError::Io(path.to_path_buf(), e.to_string()))?;
        Self::from_json(&raw)
    }

    /// Finds a bound instance by its instance name.
    pub fn get(&self, name: &str) -> Option<&ServiceInstance> {
        self.0
            .values()
            .flat_map(|instances| instances.iter())
            .find(|instance| instance.name == name)
    }

    pub fn cloudant_services(&self) -> Vec<ServiceSummary> {
        self.0
            .iter()
            .filter(|(label, _)| CLOUDANT_LABEL.is_match(label))
            .flat_map(|(_, instances)| instances.iter())
            .map(|instance| ServiceSummary {
                name: instance.name.clone(),
                label: instance.label.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where the admin surface re-reads bindings from on each request.
#[derive(Debug, Clone)]
pub enum ServiceSource {
    Environment,
    File(PathBuf),
    Fixed(ServiceBindings),
}

impl ServiceSource {
    pub fn load(&self) -> Result<ServiceBindings, ServicesError> {
        match self {
            ServiceSource::Environment => ServiceBindings::from_env(),
            ServiceSource::File(path) => ServiceBindings::from_file(path),
            ServiceSource::Fixed(bindings) => Ok(bindings.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "cloudantNoSQLDB": [
            {"name": "my-db", "label": "cloudantNoSQLDB",
             "credentials": {"host": "acme.cloudant.com", "username": "u", "password": "p"}}
        ],
        "Cloudant-Dedicated": [
            {"name": "dedicated", "label": "Cloudant-Dedicated", "credentials": {}}
        ],
        "mongodb": [
            {"name": "other", "label": "mongodb", "credentials": {}}
        ]
    }"#;

    #[test]
    fn test_lists_only_cloudant_services() {
        let bindings = ServiceBindings::from_json(SAMPLE).unwrap();
        let mut names: Vec<String> = bindings.cloudant_services().into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, vec!["dedicated", "my-db"]);
        assert_eq!(bindings.len(), 3);
    }

    #[test]
    fn test_get_by_instance_name() {
        let bindings = ServiceBindings::from_json(SAMPLE).unwrap();
        let service = bindings.get("my-db").unwrap();
        assert_eq!(service.credential("host"), Some("acme.cloudant.com"));
        assert!(bindings.get("nope").is_none());
    }

    #[test]
    fn test_empty_and_malformed() {
        assert!(ServiceBindings::from_json("").unwrap().is_empty());
        assert!(matches!(
            ServiceBindings::from_json("{not json"),
            Err(ServicesError::Parse(_))
        ));
    }

    #[test]
    fn test_fixed_source() {
        let bindings = ServiceBindings::from_json(SAMPLE).unwrap();
        let source = ServiceSource::Fixed(bindings.clone());
        assert_eq!(source.load().unwrap(), bindings);
    }
}
