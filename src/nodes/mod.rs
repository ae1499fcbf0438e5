//! The Cloudant node types.

pub mod attachments;
pub mod modify;
pub mod query;

use std::{fmt, sync::Arc};

use serde_json::Value;
use tracing::info;

use crate::{
    connection::{ServiceSelector, resolve},
    document::DatabaseName,
    message::{Message, is_truthy},
    node::{NodeContext, NodeErr, NodeError},
    store::DocumentStore,
};

/// A connected client plus the cleaned name of the database a node works on.
#[derive(Clone)]
pub struct Binding {
    pub store: Arc<dyn DocumentStore>,
    pub database: DatabaseName,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("database", &self.database).finish()
    }
}

/// Resolves the selector, connects and cleans the database name.
///
/// A renamed database is reported as a warning on the node.
pub(crate) fn bind(
    ctx: &mut NodeContext,
    selector: &ServiceSelector,
    database: &str,
) -> Result<Binding, NodeError> {
    if database.trim().is_empty() {
        return Err(NodeError::Configuration("no database configured".to_string()));
    }

    let cleaned = DatabaseName::new(database);
    if cleaned.as_str() != database {
        ctx.warn(format!("Database renamed as '{}'.", cleaned));
    }

    let descriptor = resolve(selector, ctx.config_nodes(), ctx.bindings())?;
    let store = ctx
        .connector()
        .connect(&descriptor)
        .map_err(|e| NodeError::Configuration(format!("could not connect to {selector}: {e}")))?;

    info!(node = ctx.node_id(), database = %cleaned, "connected via {}", selector);
    Ok(Binding {
        store,
        database: cleaned,
    })
}

pub(crate) fn unbound(msg: Message) -> NodeErr {
    NodeErr::attached(
        NodeError::Configuration("node has no database connection".to_string()),
        msg,
    )
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The document id a message refers to: `_id`, then `id`, then the payload itself.
pub fn document_id(msg: &Message) -> Option<String> {
    msg.property("_id")
        .filter(|v| is_truthy(v))
        .or_else(|| msg.property("id").filter(|v| is_truthy(v)))
        .and_then(id_text)
        .or_else(|| id_text(msg.payload()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_lookup_order() {
        let mut msg = Message::new("m", json!({"_id": "from-payload", "id": "other"}));
        assert_eq!(document_id(&msg).as_deref(), Some("from-payload"));

        msg.set("_id", json!("top-level"));
        assert_eq!(document_id(&msg).as_deref(), Some("top-level"));

        let msg = Message::new("m", json!({"id": "plain-id"}));
        assert_eq!(document_id(&msg).as_deref(), Some("plain-id"));

        let msg = Message::new("m", json!("raw-id"));
        assert_eq!(document_id(&msg).as_deref(), Some("raw-id"));

        let msg = Message::new("m", json!({"name": "no id"}));
        assert_eq!(document_id(&msg), None);
    }
}
