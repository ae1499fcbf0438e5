//! Deploys a flow and delivers messages to its nodes.
//!
//! Each dispatched message runs on its own task, so one node may have many
//! messages in flight. Results arrive on the emission channel in completion
//! order, not in dispatch order.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::CredentialStore,
    flow::Flow,
    logger::SERVICE_NAME,
    message::Message,
    node::{Diagnostic, Node, NodeContext, NodeError},
};

/// The outcome of one message on one node.
#[derive(Debug, Clone, Serialize)]
pub struct Emission {
    pub node_id: String,
    /// Sent downstream; present on success and for errors that still forward the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The message an error was reported against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    pub finished: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DeployReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, NodeError)>,
    pub diagnostics: Vec<(String, Diagnostic)>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("node `{node}` was not started: {reason}")]
    NotStarted { node: String, reason: NodeError },
}

#[derive(Clone)]
struct Metrics {
    started: Counter<u64>,
    succeeded: Counter<u64>,
    failed: Counter<u64>,
    latency_ms: Histogram<f64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            started: meter
                .u64_counter("messages_started")
                .with_description("Messages delivered to a node")
                .build(),
            succeeded: meter.u64_counter("messages_succeeded").build(),
            failed: meter.u64_counter("messages_failed").build(),
            latency_ms: meter
                .f64_histogram("message_latency_ms")
                .with_description("Time a node spent on one message")
                .with_unit("ms")
                .build(),
        }
    }
}

pub struct FlowRuntime {
    base: NodeContext,
    nodes: DashMap<String, Arc<Node>>,
    failed: DashMap<String, NodeError>,
    emissions: UnboundedSender<Emission>,
    metrics: Metrics,
}

impl FlowRuntime {
    pub fn new(base: NodeContext) -> (Self, UnboundedReceiver<Emission>) {
        let (tx, rx) = unbounded_channel();
        let runtime = Self {
            base,
            nodes: DashMap::new(),
            failed: DashMap::new(),
            emissions: tx,
            metrics: Metrics::new(),
        };
        (runtime, rx)
    }

    pub fn context(&self) -> &NodeContext {
        &self.base
    }

    /// Replaces whatever was deployed before.
    ///
    /// Config entities are registered first, with credentials from the
    /// credential store, so that nodes can resolve them during `init`. A node
    /// whose `init` fails stays out of the runtime and rejects every message.
    pub async fn deploy(&self, flow: &Flow, credentials: &CredentialStore) -> DeployReport {
        self.nodes.clear();
        self.failed.clear();

        let config_nodes = self.base.config_nodes();
        config_nodes.clear();
        for (id, config) in &flow.config {
            let loaded = match credentials.load(id).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(config = %id, "could not load credentials: {e}");
                    Default::default()
                }
            };
            config_nodes.insert(
                id.clone(),
                config.clone().with_credentials(loaded.username, loaded.password),
            );
        }

        let mut ids: Vec<&String> = flow.nodes.keys().collect();
        ids.sort();

        let mut report = DeployReport::default();
        for id in ids {
            let mut node = flow.nodes[id].clone();
            let mut ctx = self.base.for_node(id);
            match node.init(&mut ctx).await {
                Ok(()) => {
                    info!(node = %id, kind = %node.type_name(), "node started");
                    self.nodes.insert(id.clone(), Arc::new(node));
                    report.started.push(id.clone());
                }
                Err(e) => {
                    error!(node = %id, kind = %node.type_name(), "ConfigurationError: {e}");
                    self.failed.insert(id.clone(), e.clone());
                    report.failed.push((id.clone(), e));
                }
            }
            report
                .diagnostics
                .extend(ctx.take_diagnostics().into_iter().map(|d| (id.clone(), d)));
        }

        info!(
            flow = %flow.id,
            started = report.started.len(),
            failed = report.failed.len(),
            "flow deployed"
        );
        report
    }

    pub fn is_running(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Hands `msg` to a node on a new task. The outcome arrives as an [`Emission`].
    pub fn dispatch(&self, node_id: &str, msg: Message) -> Result<JoinHandle<()>, RuntimeError> {
        let node = match self.nodes.get(node_id) {
            Some(node) => node.value().clone(),
            None => {
                return Err(match self.failed.get(node_id) {
                    Some(reason) => RuntimeError::NotStarted {
                        node: node_id.to_string(),
                        reason: reason.value().clone(),
                    },
                    None => RuntimeError::UnknownNode(node_id.to_string()),
                });
            }
        };

        let mut ctx = self.base.for_node(node_id);
        let tx = self.emissions.clone();
        let metrics = self.metrics.clone();
        let node_id = node_id.to_string();

        Ok(tokio::spawn(async move {
            let attrs = [KeyValue::new("node_type", node.type_name())];
            metrics.started.add(1, &attrs);
            let started = Instant::now();

            let emission = match node.process(msg, &mut ctx).await {
                Ok(out) => {
                    metrics.succeeded.add(1, &attrs);
                    Emission {
                        node_id,
                        message: out.message,
                        error: None,
                        origin: None,
                        diagnostics: ctx.take_diagnostics(),
                        finished: Utc::now(),
                    }
                }
                Err(err) => {
                    metrics.failed.add(1, &attrs);
                    error!(node = %node_id, "{}", err.error);
                    Emission {
                        node_id,
                        message: err.forward,
                        error: Some(err.error.to_string()),
                        origin: err.origin,
                        diagnostics: ctx.take_diagnostics(),
                        finished: Utc::now(),
                    }
                }
            };

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics.latency_ms.record(elapsed_ms, &attrs);
            info!(
                target: "request",
                node = %emission.node_id,
                kind = %node.type_name(),
                elapsed_ms,
                failed = emission.error.is_some(),
                "message processed"
            );
            if tx.send(emission).is_err() {
                debug!("emission receiver dropped");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::CloudantConfigNode,
        credentials::CredentialUpdate,
        nodes::query::{QueryNode, SearchMode},
        secret::{MemorySecretsManager, SecretsManager},
        services::ServiceBindings,
        store::{SharedConnector, memory::MemoryStore},
    };
    use serde_json::json;

    fn runtime(store: Arc<MemoryStore>) -> (FlowRuntime, UnboundedReceiver<Emission>) {
        FlowRuntime::new(NodeContext::new(
            Arc::new(ServiceBindings::empty()),
            Arc::new(SharedConnector(store)),
        ))
    }

    #[tokio::test]
    async fn test_deploy_loads_credentials_into_config_nodes() {
        let secrets = SecretsManager(MemorySecretsManager::new());
        let credentials = CredentialStore::new(secrets.clone());
        credentials
            .update("acme", CredentialUpdate { username: Some("admin".into()), password: Some("pw".into()) })
            .await
            .unwrap();

        let (rt, _rx) = runtime(Arc::new(MemoryStore::new()));
        let flow = Flow::new("f").with_config("acme", CloudantConfigNode::new("acme.cloudant.com"));
        rt.deploy(&flow, &credentials).await;

        let config = rt.context().config_nodes().get("acme").unwrap().clone();
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.password.as_deref(), Some("pw"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_and_failed_nodes() {
        let secrets = SecretsManager(MemorySecretsManager::new());
        let credentials = CredentialStore::new(secrets.clone());
        let (rt, _rx) = runtime(Arc::new(MemoryStore::new()));

        let flow = Flow::new("f").with_node(
            "orphan",
            Node(Box::new(QueryNode::new("_ext_", Some("missing"), "db", SearchMode::ById))),
        );
        let report = rt.deploy(&flow, &credentials).await;
        assert!(report.started.is_empty());
        assert!(matches!(report.failed[0].1, NodeError::Configuration(_)));

        assert!(matches!(
            rt.dispatch("orphan", Message::from_payload(json!("x"))),
            Err(RuntimeError::NotStarted { .. })
        ));
        assert!(matches!(
            rt.dispatch("ghost", Message::from_payload(json!("x"))),
            Err(RuntimeError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_redeploy_replaces_nodes() {
        let secrets = SecretsManager(MemorySecretsManager::new());
        let credentials = CredentialStore::new(secrets.clone());
        let (rt, mut rx) = runtime(Arc::new(MemoryStore::new().with_database("db")));

        let node = || Node(Box::new(QueryNode::new("_ext_", Some("acme"), "db", SearchMode::ById)));
        let first = Flow::new("one")
            .with_config("acme", CloudantConfigNode::new("acme.cloudant.com"))
            .with_node("read", node());
        rt.deploy(&first, &credentials).await;
        assert!(rt.is_running("read"));

        let second = Flow::new("two")
            .with_config("acme", CloudantConfigNode::new("acme.cloudant.com"))
            .with_node("read-again", node());
        rt.deploy(&second, &credentials).await;
        assert!(!rt.is_running("read"));
        assert!(rt.is_running("read-again"));

        rt.dispatch("read-again", Message::new("m1", json!("absent")))
            .unwrap()
            .await
            .unwrap();
        let emission = rx.recv().await.unwrap();
        assert_eq!(emission.node_id, "read-again");
        assert_eq!(emission.message.unwrap().payload(), &json!(null));
    }
}
