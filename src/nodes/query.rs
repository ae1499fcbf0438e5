use async_trait::async_trait;
use schemars::{JsonSchema, Schema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Binding, bind, document_id, unbound};
use crate::{
    connection::ServiceSelector,
    document::is_design_document,
    message::Message,
    node::{NodeContext, NodeErr, NodeError, NodeOut, NodeType},
    store::{DocumentStore, ErrorKind, ListOptions, SearchOptions, StoreError},
};

/// How a `cloudant in` node reads. Fixed per node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SearchMode {
    #[serde(rename = "_id_")]
    #[default]
    ById,
    #[serde(rename = "_idx_")]
    ByIndex,
    #[serde(rename = "_all_")]
    All,
}

/// One read, built from the node's mode and the incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySpec {
    ById(String),
    ByIndex {
        design: String,
        index: String,
        options: SearchOptions,
    },
    All(ListOptions),
}

impl QuerySpec {
    pub fn for_message(
        mode: SearchMode,
        design: Option<&str>,
        index: Option<&str>,
        msg: &Message,
    ) -> Result<Self, NodeError> {
        match mode {
            SearchMode::ById => document_id(msg)
                .map(QuerySpec::ById)
                .ok_or_else(|| NodeError::InvalidInput("message carries no document id".to_string())),
            SearchMode::ByIndex => match (design, index) {
                (Some(design), Some(index)) => Ok(QuerySpec::ByIndex {
                    design: design.to_string(),
                    index: index.to_string(),
                    options: SearchOptions::from_payload(msg.payload()),
                }),
                _ => Err(NodeError::Configuration(
                    "search by index needs a design document and an index".to_string(),
                )),
            },
            SearchMode::All => Ok(QuerySpec::All(ListOptions::from_payload(msg.payload()))),
        }
    }

    pub async fn run(&self, store: &dyn DocumentStore, database: &str) -> Result<Value, StoreError> {
        match self {
            QuerySpec::ById(id) => store.get(database, id).await,
            QuerySpec::ByIndex {
                design,
                index,
                options,
            } => store.search(database, design, index, options).await,
            QuerySpec::All(options) => store.list(database, options).await,
        }
    }
}

/// Projects `rows` onto their documents, minus design documents.
/// Bodies without `rows` pass through unchanged.
pub fn reshape(body: &Value) -> Value {
    let Some(rows) = body.get("rows").and_then(Value::as_array) else {
        return body.clone();
    };

    Value::Array(
        rows.iter()
            .filter_map(|row| row.get("doc"))
            .filter(|doc| !doc.is_null())
            .filter(|doc| {
                !doc.get("_id")
                    .and_then(Value::as_str)
                    .map(is_design_document)
                    .unwrap_or(false)
            })
            .cloned()
            .collect(),
    )
}

/// `cloudant in`: reads documents by id, through a search index or by listing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub cloudant: Option<String>,
    pub database: String,
    #[serde(default)]
    pub search: SearchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip)]
    binding: Option<Binding>,
}

impl QueryNode {
    pub const TYPE: &'static str = "cloudant in";

    pub fn new(service: &str, cloudant: Option<&str>, database: &str, search: SearchMode) -> Self {
        Self {
            name: None,
            service: Some(service.to_string()),
            cloudant: cloudant.map(str::to_string),
            database: database.to_string(),
            search,
            design: None,
            index: None,
            binding: None,
        }
    }

    pub fn with_index(mut self, design: &str, index: &str) -> Self {
        self.design = Some(design.to_string());
        self.index = Some(index.to_string());
        self
    }
}

#[typetag::serde(name = "cloudant in")]
#[async_trait]
impl NodeType for QueryNode {
    fn type_name(&self) -> String {
        Self::TYPE.to_string()
    }

    fn schema(&self) -> Schema {
        schema_for!(QueryNode)
    }

    fn selector(&self) -> ServiceSelector {
        ServiceSelector::from_config(self.service.as_deref(), self.cloudant.as_deref())
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn init(&mut self, ctx: &mut NodeContext) -> Result<(), NodeError> {
        if self.search == SearchMode::ByIndex && (self.design.is_none() || self.index.is_none()) {
            return Err(NodeError::Configuration(
                "search by index needs a design document and an index".to_string(),
            ));
        }
        self.binding = Some(bind(ctx, &self.selector(), &self.database)?);
        Ok(())
    }

    #[tracing::instrument(name = "cloudant_in_process", skip(self, msg, ctx))]
    async fn process(&self, mut msg: Message, ctx: &mut NodeContext) -> Result<NodeOut, NodeErr> {
        let Some(binding) = self.binding.as_ref() else {
            return Err(unbound(msg));
        };

        let spec = match QuerySpec::for_message(self.search, self.design.as_deref(), self.index.as_deref(), &msg) {
            Ok(spec) => spec,
            Err(e) => {
                msg.set_payload(Value::Null);
                return Err(NodeErr::with_message(e, msg));
            }
        };

        match spec.run(binding.store.as_ref(), binding.database.as_str()).await {
            Ok(body) => {
                msg.set_payload(reshape(&body));
                msg.set("cloudant", body);
                Ok(NodeOut::emit(msg))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let warning = match &spec {
                    QuerySpec::ById(id) => {
                        format!("Document \"{id}\" not found in database \"{}\".", binding.database)
                    }
                    _ => format!("Database \"{}\" not found.", binding.database),
                };
                ctx.warn(warning);
                msg.set_payload(Value::Null);
                Ok(NodeOut::emit(msg))
            }
            Err(err) => {
                msg.set_payload(Value::Null);
                Err(NodeErr::with_message(
                    NodeError::Database(format!("Failed to retrieve documents: {err}")),
                    msg,
                ))
            }
        }
    }

    fn clone_box(&self) -> Box<dyn NodeType> {
        Box::new(self.clone())
    }
}
