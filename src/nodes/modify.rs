use async_trait::async_trait;
use schemars::{JsonSchema, Schema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Binding, bind, unbound};
use crate::{
    connection::ServiceSelector,
    document::{Document, normalize},
    error::CloudantError,
    message::{Message, is_truthy},
    node::{NodeContext, NodeErr, NodeError, NodeOut, NodeType},
    store::{DocumentStore, ErrorKind, StoreError, WriteReceipt},
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Insert,
    Delete,
}

/// Which failed inserts are tried again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Every failure, whatever its cause.
    #[default]
    All,
    /// Only failures without a response, `429` and `5xx`.
    Transient,
}

impl RetryPolicy {
    pub fn allows(&self, err: &StoreError) -> bool {
        match self {
            RetryPolicy::All => true,
            RetryPolicy::Transient => err.is_transient(),
        }
    }
}

/// Creates `database`; treats "already exists" and "forbidden" as success.
pub async fn ensure_database(store: &dyn DocumentStore, database: &str) -> Result<(), StoreError> {
    match store.create_database(database).await {
        Ok(_) => Ok(()),
        Err(err) if matches!(err.kind(), ErrorKind::FileExists | ErrorKind::Forbidden) => {
            debug!(database, error = %err, "database already usable");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Inserts `doc`, creating the database when the insert reports it missing.
///
/// `max_attempts` bounds the number of inserts, so at most
/// `max_attempts - 1` database creations are issued. Attempts follow each
/// other without delay.
pub async fn insert_with_provisioning(
    store: &dyn DocumentStore,
    doc: &Document,
    database: &str,
    max_attempts: u32,
    retry: RetryPolicy,
) -> Result<WriteReceipt, CloudantError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match store.insert(database, doc).await {
            Ok(receipt) => return Ok(receipt),
            Err(err) => err,
        };

        if attempt >= max_attempts {
            return Err(err.into());
        }

        if err.kind() == ErrorKind::NotFound {
            debug!(database, attempt, "database missing, creating it");
            if let Err(create_err) = ensure_database(store, database).await {
                warn!(database, error = %create_err, "could not create database");
            }
        } else if retry.allows(&err) {
            debug!(database, attempt, error = %err, "insert failed, retrying");
        } else {
            return Err(err.into());
        }

        attempt += 1;
    }
}

/// Deletes the document `doc` refers to. Both `_id` and `_rev` must be
/// present; otherwise nothing is sent to the database.
pub async fn delete_document(
    store: &dyn DocumentStore,
    doc: &Document,
    database: &str,
) -> Result<WriteReceipt, CloudantError> {
    let (Some(id), Some(rev)) = (doc.id(), doc.rev()) else {
        return Err(CloudantError::MissingReference);
    };
    Ok(store.destroy(database, id, rev).await?)
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_true() -> bool {
    true
}

/// `cloudant out`: writes or deletes the document carried by a message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModifyNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `_ext_` for a configuration entity, otherwise a bound service name.
    #[serde(default)]
    pub service: Option<String>,
    /// Id of the `cloudant` configuration entity when `service` is `_ext_`.
    #[serde(default)]
    pub cloudant: Option<String>,
    pub database: String,
    #[serde(default)]
    pub operation: Operation,
    /// Store only `msg.payload` instead of the whole message.
    #[serde(default)]
    pub payonly: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_true")]
    pub provision_on_start: bool,
    #[serde(skip)]
    binding: Option<Binding>,
}

impl ModifyNode {
    pub const TYPE: &'static str = "cloudant out";

    pub fn new(service: &str, cloudant: Option<&str>, database: &str, operation: Operation) -> Self {
        Self {
            name: None,
            service: Some(service.to_string()),
            cloudant: cloudant.map(str::to_string),
            database: database.to_string(),
            operation,
            payonly: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryPolicy::All,
            provision_on_start: true,
            binding: None,
        }
    }

    pub fn payload_only(mut self, payonly: bool) -> Self {
        self.payonly = payonly;
        self
    }

    async fn insert(&self, binding: &Binding, mut msg: Message, ctx: &mut NodeContext) -> Result<NodeOut, NodeErr> {
        let (raw, fallback) = if self.payonly {
            (msg.payload().clone(), "payload")
        } else {
            (msg.to_value_without_id(), "msg")
        };

        let normalized = normalize(&raw, fallback);
        for renamed in &normalized.renamed {
            ctx.warn(renamed.to_string());
        }

        let receipt = match insert_with_provisioning(
            binding.store.as_ref(),
            &normalized.document,
            binding.database.as_str(),
            self.max_attempts,
            self.retry,
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                let error = NodeError::Database(format!("Failed to insert document: {e}"));
                return Err(NodeErr::attached(error, msg));
            }
        };

        msg.set_payload(json!(receipt));
        Ok(NodeOut::emit(msg))
    }

    async fn delete(&self, binding: &Binding, msg: Message, ctx: &mut NodeContext) -> Result<NodeOut, NodeErr> {
        let raw = if is_truthy(msg.payload()) {
            msg.payload().clone()
        } else {
            msg.to_value_without_id()
        };

        let normalized = normalize(&raw, "");
        for renamed in &normalized.renamed {
            ctx.warn(renamed.to_string());
        }

        match delete_document(binding.store.as_ref(), &normalized.document, binding.database.as_str()).await {
            Ok(receipt) => {
                debug!(id = %receipt.id, rev = %receipt.rev, "document deleted");
                Ok(NodeOut::emit(msg))
            }
            Err(CloudantError::MissingReference) => Err(NodeErr::attached(NodeError::MissingReference, msg)),
            Err(e) => Err(NodeErr::attached(
                NodeError::Database(format!("Failed to delete document: {e}")),
                msg,
            )),
        }
    }
}

#[typetag::serde(name = "cloudant out")]
#[async_trait]
impl NodeType for ModifyNode {
    fn type_name(&self) -> String {
        Self::TYPE.to_string()
    }

    fn schema(&self) -> Schema {
        schema_for!(ModifyNode)
    }

    fn selector(&self) -> ServiceSelector {
        ServiceSelector::from_config(self.service.as_deref(), self.cloudant.as_deref())
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn init(&mut self, ctx: &mut NodeContext) -> Result<(), NodeError> {
        let binding = bind(ctx, &self.selector(), &self.database)?;

        if self.provision_on_start {
            if let Err(e) = ensure_database(binding.store.as_ref(), binding.database.as_str()).await {
                ctx.error(format!("Failed to create database: {e}"));
            }
        }

        self.binding = Some(binding);
        Ok(())
    }

    #[tracing::instrument(name = "cloudant_out_process", skip(self, msg, ctx))]
    async fn process(&self, msg: Message, ctx: &mut NodeContext) -> Result<NodeOut, NodeErr> {
        let Some(binding) = self.binding.as_ref() else {
            return Err(unbound(msg));
        };
        match self.operation {
            Operation::Insert => self.insert(binding, msg, ctx).await,
            Operation::Delete => self.delete(binding, msg, ctx).await,
        }
    }

    fn clone_box(&self) -> Box<dyn NodeType> {
        Box::new(self.clone())
    }
}
