use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{DocumentStore, ListOptions, SearchOptions, StoreError, WriteReceipt};
use crate::{connection::ConnectionDescriptor, document::Document};

/// CouchDB / Cloudant over HTTP with basic authentication.
#[derive(Clone)]
pub struct CouchClient {
    base: Url,
    client: Client,
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchClient")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .finish()
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    reason: Option<String>,
}

impl CouchClient {
    pub fn new(descriptor: &ConnectionDescriptor) -> Result<Self, StoreError> {
        let base = base_url(descriptor)?;
        let client = Client::builder()
            .user_agent(concat!("greentic-cloudant/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::transport(&e.to_string()))?;

        Ok(Self {
            base,
            client,
            username: descriptor.username.clone(),
            password: descriptor.password.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::new(None, "invalid_url", "base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.username {
            Some(username) => builder.basic_auth(username, self.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::transport(&e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let (error, reason) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error, body.reason.unwrap_or_default()),
            Err(_) => (
                status
                    .canonical_reason()
                    .unwrap_or("unknown_error")
                    .to_lowercase()
                    .replace(' ', "_"),
                text,
            ),
        };
        debug!(status = status.as_u16(), %error, "database request failed");
        Err(StoreError {
            status: Some(status.as_u16()),
            error,
            reason,
        })
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value, StoreError> {
        self.send(builder)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| StoreError::new(None, "bad_response", &e.to_string()))
    }
}

fn base_url(descriptor: &ConnectionDescriptor) -> Result<Url, StoreError> {
    let raw = match (&descriptor.url, &descriptor.account) {
        (Some(url), _) if url.contains("://") => url.clone(),
        (Some(url), _) => format!("https://{url}"),
        (None, Some(account)) => format!("https://{account}.cloudant.com"),
        (None, None) => {
            return Err(StoreError::new(
                None,
                "invalid_url",
                "neither an account nor a url was configured",
            ));
        }
    };
    Url::parse(&raw).map_err(|e| StoreError::new(None, "invalid_url", &format!("{raw}: {e}")))
}

fn json_param(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[async_trait]
impl DocumentStore for CouchClient {
    async fn create_database(&self, database: &str) -> Result<Value, StoreError> {
        let url = self.url(&[database])?;
        self.send_json(self.request(Method::PUT, url)).await
    }

    async fn list(&self, database: &str, options: &ListOptions) -> Result<Value, StoreError> {
        let url = self.url(&[database, "_all_docs"])?;

        let mut query: Vec<(&str, String)> = vec![("include_docs", options.include_docs.to_string())];
        if let Some(limit) = options.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(skip) = options.skip {
            query.push(("skip", skip.to_string()));
        }
        if let Some(descending) = options.descending {
            query.push(("descending", descending.to_string()));
        }
        if let Some(startkey) = &options.startkey {
            query.push(("startkey", json_param(startkey)));
        }
        if let Some(endkey) = &options.endkey {
            query.push(("endkey", json_param(endkey)));
        }

        let builder = match &options.keys {
            Some(keys) => self
                .request(Method::POST, url)
                .query(&query)
                .json(&json!({ "keys": keys })),
            None => self.request(Method::GET, url).query(&query),
        };
        self.send_json(builder).await
    }

    async fn get(&self, database: &str, id: &str) -> Result<Value, StoreError> {
        let url = self.url(&[database, id])?;
        self.send_json(self.request(Method::GET, url)).await
    }

    async fn insert(&self, database: &str, doc: &Document) -> Result<WriteReceipt, StoreError> {
        let url = self.url(&[database])?;
        let body = self.send_json(self.request(Method::POST, url).json(doc)).await?;
        serde_json::from_value(body).map_err(|e| StoreError::new(None, "bad_response", &e.to_string()))
    }

    async fn destroy(&self, database: &str, id: &str, rev: &str) -> Result<WriteReceipt, StoreError> {
        let url = self.url(&[database, id])?;
        let body = self
            .send_json(self.request(Method::DELETE, url).query(&[("rev", rev)]))
            .await?;
        serde_json::from_value(body).map_err(|e| StoreError::new(None, "bad_response", &e.to_string()))
    }

    async fn search(
        &self,
        database: &str,
        design: &str,
        index: &str,
        options: &SearchOptions,
    ) -> Result<Value, StoreError> {
        let url = self.url(&[database, "_design", design, "_search", index])?;

        let mut query: Vec<(&str, String)> = vec![
            ("q", options.query.clone()),
            ("include_docs", options.include_docs.to_string()),
            ("limit", options.limit.to_string()),
        ];
        if let Some(sort) = &options.sort {
            query.push(("sort", json_param(sort)));
        }
        if let Some(bookmark) = &options.bookmark {
            query.push(("bookmark", bookmark.clone()));
        }

        self.send_json(self.request(Method::GET, url).query(&query)).await
    }

    async fn get_attachment(&self, database: &str, id: &str, name: &str) -> Result<Vec<u8>, StoreError> {
        let url = self.url(&[database, id, name])?;
        let response = self.send(self.request(Method::GET, url)).await?;
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| StoreError::transport(&e.to_string()))
    }
}
