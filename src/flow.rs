use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    connection::{CloudantConfigNode, ServiceSelector},
    node::Node,
};

/// A deployable flow: `cloudant` configuration entities plus the nodes that use them.
///
/// ```yaml
/// id: orders
/// config:
///   acme:
///     host: acme.cloudant.com
/// nodes:
///   save:
///     type: cloudant out
///     service: _ext_
///     cloudant: acme
///     database: orders
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// config entity id → configuration
    #[serde(default)]
    pub config: HashMap<String, CloudantConfigNode>,
    /// node id → node
    #[serde(default)]
    pub nodes: HashMap<String, Node>,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unsupported flow file extension: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("node `{node}` refers to unknown cloudant config `{config}`")]
    UnknownConfig { node: String, config: String },
    #[error("node `{0}` has no service configured")]
    MissingService(String),
    #[error("node `{0}` has no database configured")]
    MissingDatabase(String),
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            config: HashMap::new(),
            nodes: HashMap::new(),
        }
    }

    pub fn with_config(mut self, id: &str, config: CloudantConfigNode) -> Self {
        self.config.insert(id.to_string(), config);
        self
    }

    pub fn with_node(mut self, id: &str, node: Node) -> Self {
        self.nodes.insert(id.to_string(), node);
        self
    }

    /// Loads a `.json`, `.yaml` or `.yml` flow file.
    pub fn from_path(path: &Path) -> Result<Self, FlowError> {
        let text = fs::read_to_string(path).map_err(|e| FlowError::Io(path.to_path_buf(), e.to_string()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            _ => Err(FlowError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, FlowError> {
        serde_json::from_str(text).map_err(|e| FlowError::Parse(e.to_string()))
    }

    pub fn from_yaml(text: &str) -> Result<Self, FlowError> {
        serde_yaml_bw::from_str(text).map_err(|e| FlowError::Parse(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), FlowError> {
        let text = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(self).map_err(|e| FlowError::Parse(e.to_string()))?,
            Some("yaml") | Some("yml") => {
                serde_yaml_bw::to_string(self).map_err(|e| FlowError::Parse(e.to_string()))?
            }
            _ => return Err(FlowError::UnsupportedFormat(path.to_path_buf())),
        };
        fs::write(path, text).map_err(|e| FlowError::Io(path.to_path_buf(), e.to_string()))
    }

    /// Static checks that do not need a connection: every node names a
    /// service and a database, and `_ext_` nodes point at a config entity
    /// of this flow. Bound service names are only known at deploy time.
    pub fn validate(&self) -> Result<(), Vec<FlowError>> {
        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort();

        let errors: Vec<FlowError> = ids
            .into_iter()
            .filter_map(|id| {
                let node = &self.nodes[id];
                if node.database().trim().is_empty() {
                    return Some(FlowError::MissingDatabase(id.clone()));
                }
                match node.selector() {
                    ServiceSelector::External(config) if !self.config.contains_key(&config) => {
                        Some(FlowError::UnknownConfig {
                            node: id.clone(),
                            config,
                        })
                    }
                    ServiceSelector::Unset => Some(FlowError::MissingService(id.clone())),
                    _ => None,
                }
            })
            .collect();

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{
        attachments::AttachmentNode,
        modify::{ModifyNode, Operation},
        query::{QueryNode, SearchMode},
    };
    use std::io::Write;
    use tempfile::Builder;

    const YAML: &str = r#"
id: orders
title: Orders
config:
  acme:
    host: https://acme.cloudant.com
nodes:
  save:
    type: cloudant out
    service: _ext_
    cloudant: acme
    database: Orders
    payonly: true
  find:
    type: cloudant in
    service: _ext_
    cloudant: acme
    database: orders
    search: _idx_
    design: app
    index: by_kind
  files:
    type: cloudant attachment in
    service: my-cloudant
    database: files
    encoding: base64
"#;

    #[test]
    fn test_yaml_flow_parses() {
        let flow = Flow::from_yaml(YAML).unwrap();
        assert_eq!(flow.id, "orders");
        assert_eq!(flow.config["acme"].host, "https://acme.cloudant.com");
        assert_eq!(flow.nodes.len(), 3);
        assert_eq!(flow.nodes["save"].type_name(), ModifyNode::TYPE);
        assert_eq!(flow.nodes["find"].type_name(), QueryNode::TYPE);
        assert_eq!(flow.nodes["files"].type_name(), AttachmentNode::TYPE);
        assert_eq!(flow.nodes["files"].selector(), ServiceSelector::Bound("my-cloudant".into()));
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let flow = Flow::new("broken")
            .with_node("a", Node(Box::new(ModifyNode::new("_ext_", Some("nope"), "db", Operation::Insert))))
            .with_node("b", Node(Box::new(QueryNode::new("", None, "db", SearchMode::ById))))
            .with_node("c", Node(Box::new(AttachmentNode::new("svc", None, " "))));

        let errors = flow.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(matches!(&errors[0], FlowError::UnknownConfig { node, config } if node == "a" && config == "nope"));
        assert!(matches!(&errors[1], FlowError::MissingService(node) if node == "b"));
        assert!(matches!(&errors[2], FlowError::MissingDatabase(node) if node == "c"));
    }

    #[test]
    fn test_from_path_by_extension() {
        let mut yaml = Builder::new().suffix(".yaml").tempfile().unwrap();
        yaml.write_all(YAML.as_bytes()).unwrap();
        assert_eq!(Flow::from_path(yaml.path()).unwrap().id, "orders");

        let flow = Flow::from_yaml(YAML).unwrap();
        let json = Builder::new().suffix(".json").tempfile().unwrap();
        flow.save(json.path()).unwrap();
        let reloaded = Flow::from_path(json.path()).unwrap();
        assert_eq!(reloaded.nodes.len(), 3);

        let txt = Builder::new().suffix(".txt").tempfile().unwrap();
        assert!(matches!(Flow::from_path(txt.path()), Err(FlowError::UnsupportedFormat(_))));
    }
}
