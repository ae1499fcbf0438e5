use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::future::try_join_all;
use schemars::{JsonSchema, Schema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{Binding, bind, document_id, unbound};
use crate::{
    connection::ServiceSelector,
    message::Message,
    node::{NodeContext, NodeErr, NodeError, NodeOut, NodeType},
    store::{DocumentStore, ErrorKind, StoreError},
};

/// How attachment bytes are turned into a payload value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentEncoding {
    /// Raw bytes, as an array of numbers.
    None,
    #[default]
    #[serde(alias = "utf-8")]
    Utf8,
    Ascii,
    Base64,
    Hex,
    #[serde(alias = "binary")]
    Latin1,
    #[serde(alias = "ucs2", alias = "ucs-2", alias = "utf-16le")]
    Utf16le,
}

impl AttachmentEncoding {
    pub fn encode(self, bytes: &[u8]) -> Value {
        match self {
            AttachmentEncoding::None => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            AttachmentEncoding::Utf8 => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            AttachmentEncoding::Ascii => {
                Value::String(bytes.iter().map(|b| char::from(b & 0x7f)).collect())
            }
            AttachmentEncoding::Base64 => Value::String(STANDARD.encode(bytes)),
            AttachmentEncoding::Hex => Value::String(hex::encode(bytes)),
            AttachmentEncoding::Latin1 => Value::String(bytes.iter().map(|b| char::from(*b)).collect()),
            AttachmentEncoding::Utf16le => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Value::String(String::from_utf16_lossy(&units))
            }
        }
    }
}

/// Result of reading one or all attachments of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// One attachment: its encoded data and manifest entry.
    Single { data: Value, metadata: Value },
    /// Every attachment, keyed by name, with `data` added to each entry.
    All(Map<String, Value>),
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Failed to retrieve document \"{id}\": {source}")]
    Document { id: String, source: StoreError },
    #[error("Failed to retrieve attachment \"{name}\" from \"{id}\": {source}")]
    Attachment {
        id: String,
        name: String,
        source: StoreError,
    },
    #[error("Failed to retrieve attachments from \"{id}\": {source}")]
    All { id: String, source: StoreError },
}

impl AttachmentError {
    pub fn is_not_found(&self) -> bool {
        let source = match self {
            AttachmentError::Document { source, .. }
            | AttachmentError::Attachment { source, .. }
            | AttachmentError::All { source, .. } => source,
        };
        source.kind() == ErrorKind::NotFound
    }
}

impl From<AttachmentError> for NodeError {
    fn from(err: AttachmentError) -> Self {
        let text = err.to_string();
        if matches!(err, AttachmentError::Document { .. }) && err.is_not_found() {
            NodeError::NotFound(text)
        } else {
            NodeError::Database(text)
        }
    }
}

/// Reads the document, then one named attachment or all of them.
///
/// All attachments are fetched concurrently and the first failure wins.
pub async fn fetch_attachments(
    store: &dyn DocumentStore,
    database: &str,
    id: &str,
    name: Option<&str>,
    encoding: AttachmentEncoding,
) -> Result<Fetched, AttachmentError> {
    let doc = store
        .get(database, id)
        .await
        .map_err(|source| AttachmentError::Document {
            id: id.to_string(),
            source,
        })?;
    let manifest = doc
        .get("_attachments")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(name) = name {
        let bytes = store
            .get_attachment(database, id, name)
            .await
            .map_err(|source| AttachmentError::Attachment {
                id: id.to_string(),
                name: name.to_string(),
                source,
            })?;
        return Ok(Fetched::Single {
            data: encoding.encode(&bytes),
            metadata: manifest.get(name).cloned().unwrap_or(Value::Null),
        });
    }

    let names: Vec<&String> = manifest.keys().collect();
    let bodies = try_join_all(names.iter().map(|name| store.get_attachment(database, id, name)))
        .await
        .map_err(|source| AttachmentError::All {
            id: id.to_string(),
            source,
        })?;

    let mut all = Map::new();
    for (name, bytes) in names.into_iter().zip(bodies) {
        let mut entry = match manifest.get(name) {
            Some(Value::Object(meta)) => meta.clone(),
            _ => Map::new(),
        };
        entry.insert("data".to_string(), encoding.encode(&bytes));
        all.insert(name.clone(), Value::Object(entry));
    }
    Ok(Fetched::All(all))
}

/// `cloudant attachment in`: reads attachments of one document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub cloudant: Option<String>,
    pub database: String,
    /// Fixed document id. The message decides when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docid: Option<String>,
    /// Fixed attachment name. `msg.attachmentName` decides when absent, and
    /// every attachment is read when neither is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachmentname: Option<String>,
    #[serde(default)]
    pub encoding: AttachmentEncoding,
    #[serde(skip)]
    binding: Option<Binding>,
}

impl AttachmentNode {
    pub const TYPE: &'static str = "cloudant attachment in";

    pub fn new(service: &str, cloudant: Option<&str>, database: &str) -> Self {
        Self {
            name: None,
            service: Some(service.to_string()),
            cloudant: cloudant.map(str::to_string),
            database: database.to_string(),
            docid: None,
            attachmentname: None,
            encoding: AttachmentEncoding::default(),
            binding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: AttachmentEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    fn attachment_name(&self, msg: &Message) -> Option<String> {
        non_empty(self.attachmentname.as_deref()).map(str::to_string).or_else(|| {
            msg.property("attachmentName")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[typetag::serde(name = "cloudant attachment in")]
#[async_trait]
impl NodeType for AttachmentNode {
    fn type_name(&self) -> String {
        Self::TYPE.to_string()
    }

    fn schema(&self) -> Schema {
        schema_for!(AttachmentNode)
    }

    fn selector(&self) -> ServiceSelector {
        ServiceSelector::from_config(self.service.as_deref(), self.cloudant.as_deref())
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn init(&mut self, ctx: &mut NodeContext) -> Result<(), NodeError> {
        self.binding = Some(bind(ctx, &self.selector(), &self.database)?);
        Ok(())
    }

    #[tracing::instrument(name = "cloudant_attachment_in_process", skip(self, msg, _ctx))]
    async fn process(&self, mut msg: Message, _ctx: &mut NodeContext) -> Result<NodeOut, NodeErr> {
        let Some(binding) = self.binding.as_ref() else {
            return Err(unbound(msg));
        };

        let id = non_empty(self.docid.as_deref())
            .map(str::to_string)
            .or_else(|| document_id(&msg));
        let Some(id) = id else {
            return Err(NodeErr::with_message(
                NodeError::InvalidInput("message carries no document id".to_string()),
                msg,
            ));
        };
        let name = self.attachment_name(&msg);

        match fetch_attachments(
            binding.store.as_ref(),
            binding.database.as_str(),
            &id,
            name.as_deref(),
            self.encoding,
        )
        .await
        {
            Ok(Fetched::Single { data, metadata }) => {
                msg.set_payload(data);
                msg.set("attachment", metadata);
                Ok(NodeOut::emit(msg))
            }
            Ok(Fetched::All(all)) => {
                msg.set_payload(Value::Object(all));
                Ok(NodeOut::emit(msg))
            }
            Err(err) => Err(NodeErr::with_message(err.into(), msg)),
        }
    }

    fn clone_box(&self) -> Box<dyn NodeType> {
        Box::new(self.clone())
    }
}
