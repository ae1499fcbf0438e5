use std::borrow::Cow;
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Serialize};

use crate::{
    connection::{CloudantConfigNode, ServiceSelector},
    error::CloudantError,
    logger::{LogLevel, log},
    message::Message,
    nodes::{attachments::AttachmentNode, modify::ModifyNode, query::QueryNode},
    services::ServiceBindings,
    store::Connector,
};

/// A node type that can appear in a flow.
///
/// `init` runs once when the flow is deployed and is where a node resolves
/// its connection. `process` runs for every message and may run
/// concurrently for several messages on the same node.
#[async_trait]
#[typetag::serde(tag = "type")]
pub trait NodeType: Send + Sync + fmt::Debug {
    fn type_name(&self) -> String;
    /// Return this concrete type's schema.
    fn schema(&self) -> Schema;
    fn selector(&self) -> ServiceSelector;
    /// The database name as configured, before cleaning.
    fn database(&self) -> &str;
    async fn init(&mut self, ctx: &mut NodeContext) -> Result<(), NodeError>;
    async fn process(&self, msg: Message, ctx: &mut NodeContext) -> Result<NodeOut, NodeErr>;
    fn clone_box(&self) -> Box<dyn NodeType>;
}

#[derive(Serialize, Deserialize)]
pub struct Node(pub Box<dyn NodeType>);

impl std::ops::Deref for Node {
    type Target = dyn NodeType;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl std::ops::DerefMut for Node {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node(self.0.clone_box())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Node").field(&self.0).finish()
    }
}

fn tagged(type_name: &str, schema: Schema) -> Schema {
    json_schema!({
        "allOf": [
            {
                "type": "object",
                "properties": { "type": { "const": type_name } },
                "required": ["type"]
            },
            schema
        ]
    })
}

impl JsonSchema for Node {
    fn schema_name() -> Cow<'static, str> {
        "Node".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        let modify = generator.subschema_for::<ModifyNode>();
        let query = generator.subschema_for::<QueryNode>();
        let attachments = generator.subschema_for::<AttachmentNode>();

        json_schema!({
            "anyOf": [
                tagged(ModifyNode::TYPE, modify),
                tagged(QueryNode::TYPE, query),
                tagged(AttachmentNode::TYPE, attachments),
            ]
        })
    }
}

/// A warning or error a node reported while handling a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: LogLevel,
    pub text: String,
}

/// What a node sees of the runtime.
#[derive(Clone)]
pub struct NodeContext {
    node_id: String,
    bindings: Arc<ServiceBindings>,
    config_nodes: Arc<DashMap<String, CloudantConfigNode>>,
    connector: Arc<dyn Connector>,
    diagnostics: Vec<Diagnostic>,
}

impl NodeContext {
    pub fn new(bindings: Arc<ServiceBindings>, connector: Arc<dyn Connector>) -> Self {
        Self {
            node_id: String::new(),
            bindings,
            config_nodes: Arc::new(DashMap::new()),
            connector,
            diagnostics: Vec::new(),
        }
    }

    /// A copy scoped to one node with no diagnostics recorded yet.
    pub fn for_node(&self, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            diagnostics: Vec::new(),
            ..self.clone()
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn bindings(&self) -> &ServiceBindings {
        &self.bindings
    }

    pub fn config_nodes(&self) -> &DashMap<String, CloudantConfigNode> {
        &self.config_nodes
    }

    pub fn connector(&self) -> &dyn Connector {
        self.connector.as_ref()
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        self.report(LogLevel::Warn, text.into());
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.report(LogLevel::Error, text.into());
    }

    fn report(&mut self, level: LogLevel, text: String) {
        log(level, &self.node_id, &text);
        self.diagnostics.push(Diagnostic { level, text });
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("config_nodes", &self.config_nodes.len())
            .field("bindings", &self.bindings.len())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

/// The message a node sends downstream, if any.
#[derive(Debug, Clone)]
pub struct NodeOut {
    pub message: Option<Message>,
}

impl NodeOut {
    pub fn emit(message: Message) -> Self {
        Self { message: Some(message) }
    }
}

/// A failed message.
///
/// `origin` is the message the error belongs to and goes to error handlers
/// only. `forward` is still sent downstream so later nodes can see the
/// failure in the payload.
#[derive(Debug, Clone)]
pub struct NodeErr {
    pub error: NodeError,
    pub origin: Option<Message>,
    pub forward: Option<Message>,
}

impl NodeErr {
    /// Reports `error` against `message` without sending anything downstream.
    pub fn attached(error: NodeError, message: Message) -> Self {
        Self {
            error,
            origin: Some(message),
            forward: None,
        }
    }

    /// Reports `error` and sends `message` on.
    pub fn with_message(error: NodeError, message: Message) -> Self {
        Self {
            error,
            origin: Some(message.clone()),
            forward: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeError {
    Configuration(String),
    InvalidInput(String),
    NotFound(String),
    MissingReference,
    Database(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            NodeError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            NodeError::NotFound(msg) => write!(f, "Not found: {}", msg),
            NodeError::MissingReference => {
                write!(f, "_id and _rev are required to delete a document")
            }
            NodeError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<CloudantError> for NodeError {
    fn from(err: CloudantError) -> Self {
        match err {
            CloudantError::Configuration(msg) => NodeError::Configuration(msg),
            CloudantError::MissingReference => NodeError::MissingReference,
            CloudantError::Store(err) => NodeError::Database(err.to_string()),
        }
    }
}
