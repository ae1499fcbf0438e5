//! Resolving a node's service selector into connection details.

use std::fmt;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::CloudantError, services::ServiceBindings};

/// Selector value meaning "use a `cloudant` configuration entity".
pub const EXTERNAL_SERVICE: &str = "_ext_";

static CLOUDANT_ACCOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([a-z][a-z0-9]*)\.cloudant\.com").expect("valid account pattern")
});

/// Everything needed to open a client. Built once when a node starts.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub account: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub url: Option<String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("account", &self.account)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("url", &self.url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSelector {
    /// A `cloudant` configuration entity, by id.
    External(String),
    /// A platform service binding, by instance name.
    Bound(String),
    Unset,
}

impl ServiceSelector {
    /// Builds the selector from a node's `service` and `cloudant` fields.
    pub fn from_config(service: Option<&str>, cloudant: Option<&str>) -> Self {
        match service.map(str::trim) {
            Some(EXTERNAL_SERVICE) => match cloudant.map(str::trim) {
                Some(id) if !id.is_empty() => ServiceSelector::External(id.to_string()),
                _ => ServiceSelector::Unset,
            },
            Some(name) if !name.is_empty() => ServiceSelector::Bound(name.to_string()),
            _ => ServiceSelector::Unset,
        }
    }
}

impl fmt::Display for ServiceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSelector::External(id) => write!(f, "config node '{id}'"),
            ServiceSelector::Bound(name) => write!(f, "service '{name}'"),
            ServiceSelector::Unset => f.write_str("no service"),
        }
    }
}

/// The `cloudant` configuration entity: a host plus credentials that live in
/// the secret store rather than in the flow file.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CloudantConfigNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// An account hostname (`acme.cloudant.com`) or the URL of any CouchDB server.
    pub host: String,
    #[serde(skip)]
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

impl fmt::Debug for CloudantConfigNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudantConfigNode")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

impl CloudantConfigNode {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// `host:port` when the host was given as a URL, the raw value otherwise.
    pub fn authority(&self) -> String {
        let host = self.host.trim();
        match Url::parse(host) {
            Ok(url) if url.has_host() => match (url.host_str(), url.port()) {
                (Some(name), Some(port)) => format!("{name}:{port}"),
                (Some(name), None) => name.to_string(),
                _ => host.to_string(),
            },
            _ => host.to_string(),
        }
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        let authority = self.authority();
        let (account, url) = match CLOUDANT_ACCOUNT.captures(&authority) {
            Some(captures) => (Some(captures[1].to_string()), None),
            None => (None, Some(self.host.trim().to_string())),
        };
        ConnectionDescriptor {
            account,
            username: self.username.clone(),
            password: self.password.clone(),
            url,
        }
    }
}

/// The account part of a bound service's hostname.
fn account_from_host(host: &str) -> &str {
    match host.find('.') {
        Some(dot) => &host[..dot],
        None => host,
    }
}

pub fn resolve(
    selector: &ServiceSelector,
    config_nodes: &DashMap<String, CloudantConfigNode>,
    bindings: &ServiceBindings,
) -> Result<ConnectionDescriptor, CloudantError> {
    match selector {
        ServiceSelector::External(id) => config_nodes
            .get(id)
            .map(|node| node.descriptor())
            .ok_or_else(|| CloudantError::Configuration(format!("config node '{id}' is not deployed"))),
        ServiceSelector::Bound(name) => {
            let service = bindings
                .get(name)
                .ok_or_else(|| CloudantError::Configuration(format!("service '{name}' is not bound")))?;
            let host = service
                .credential("host")
                .ok_or_else(|| CloudantError::Configuration(format!("service '{name}' has no host")))?;
            Ok(ConnectionDescriptor {
                account: Some(account_from_host(host).to_string()),
                username: service.credential("username").map(str::to_string),
                password: service.credential("password").map(str::to_string),
                url: None,
            })
        }
        ServiceSelector::Unset => Err(CloudantError::Configuration(
            "no service selected".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_from_config() {
        assert_eq!(
            ServiceSelector::from_config(Some("_ext_"), Some("cfg1")),
            ServiceSelector::External("cfg1".into())
        );
        assert_eq!(ServiceSelector::from_config(Some("_ext_"), None), ServiceSelector::Unset);
        assert_eq!(
            ServiceSelector::from_config(Some("my-db"), None),
            ServiceSelector::Bound("my-db".into())
        );
        assert_eq!(ServiceSelector::from_config(Some(""), Some("cfg1")), ServiceSelector::Unset);
        assert_eq!(ServiceSelector::from_config(None, None), ServiceSelector::Unset);
    }

    #[test]
    fn test_cloudant_host_yields_account() {
        for host in ["acme.cloudant.com", "https://ACME.cloudant.com/", "https://acme.cloudant.com:443"] {
            let descriptor = CloudantConfigNode::new(host).descriptor();
            assert_eq!(descriptor.account.as_deref().map(str::to_lowercase), Some("acme".into()), "{host}");
            assert_eq!(descriptor.url, None);
        }
    }

    #[test]
    fn test_other_host_is_kept_as_url() {
        let node = CloudantConfigNode::new("http://couch.local:5984/")
            .with_credentials(Some("admin".into()), Some("secret".into()));
        assert_eq!(node.authority(), "couch.local:5984");

        let descriptor = node.descriptor();
        assert_eq!(descriptor.account, None);
        assert_eq!(descriptor.url.as_deref(), Some("http://couch.local:5984/"));
        assert_eq!(descriptor.username.as_deref(), Some("admin"));
        assert!(!format!("{descriptor:?}").contains("secret"));
    }

    #[test]
    fn test_resolve_external() {
        let nodes = DashMap::new();
        nodes.insert("cfg".to_string(), CloudantConfigNode::new("acme.cloudant.com"));
        let bindings = ServiceBindings::empty();

        let descriptor = resolve(&ServiceSelector::External("cfg".into()), &nodes, &bindings).unwrap();
        assert_eq!(descriptor.account.as_deref(), Some("acme"));

        let err = resolve(&ServiceSelector::External("gone".into()), &nodes, &bindings).unwrap_err();
        assert!(matches!(err, CloudantError::Configuration(_)));
    }

    #[test]
    fn test_resolve_bound_service() {
        let bindings = ServiceBindings::from_json(
            r#"{"cloudantNoSQLDB": [{"name": "db1", "label": "cloudantNoSQLDB",
                "credentials": {"host": "acct-1234.cloudant.com", "username": "u", "password": "p"}}]}"#,
        )
        .unwrap();
        let nodes = DashMap::new();

        let descriptor = resolve(&ServiceSelector::Bound("db1".into()), &nodes, &bindings).unwrap();
        assert_eq!(descriptor.account.as_deref(), Some("acct-1234"));
        assert_eq!(descriptor.username.as_deref(), Some("u"));
        assert_eq!(descriptor.password.as_deref(), Some("p"));

        assert!(resolve(&ServiceSelector::Bound("missing".into()), &nodes, &bindings).is_err());
        assert!(resolve(&ServiceSelector::Unset, &nodes, &bindings).is_err());
    }

    #[test]
    fn test_account_without_dot() {
        assert_eq!(account_from_host("localhost"), "localhost");
    }
}
