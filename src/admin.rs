//! The HTTP endpoints an editor uses to list bound services and manage the
//! credentials of `cloudant` configuration entities.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    credentials::{CredentialStore, CredentialUpdate},
    services::ServiceSource,
};

#[derive(Debug, Clone)]
pub struct AdminState {
    pub credentials: CredentialStore,
    pub services: ServiceSource,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn failure(status: StatusCode, error: impl ToString) -> Response {
    (status, Json(ErrorBody { error: error.to_string() })).into_response()
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/cloudant/vcap", get(list_services))
        .route(
            "/cloudant/:id",
            get(get_credentials).post(update_credentials).delete(delete_credentials),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the admin router until the process stops.
pub async fn serve(addr: &str, state: AdminState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("admin endpoints listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn list_services(State(state): State<AdminState>) -> Response {
    match state.services.load() {
        Ok(bindings) => Json(bindings.cloudant_services()).into_response(),
        Err(e) => {
            error!("could not read service bindings: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn get_credentials(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.credentials.summary(&id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn update_credentials(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let update = match parse_update(&headers, &body) {
        Ok(update) => update,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e),
    };
    match state.credentials.update(&id, update).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn delete_credentials(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.credentials.delete(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// JSON when the request says so, form-encoded otherwise.
fn parse_update(headers: &HeaderMap, body: &[u8]) -> Result<CredentialUpdate, serde_json::Error> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if is_json {
        return serde_json::from_slice(body);
    }

    let mut update = CredentialUpdate::default();
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            "username" => update.username = Some(value.into_owned()),
            "password" => update.password = Some(value.into_owned()),
            _ => {}
        }
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        secret::{MemorySecretsManager, SecretsManager},
        services::ServiceBindings,
    };
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn state() -> AdminState {
        let bindings = ServiceBindings::from_json(
            r#"{"cloudantNoSQLDB": [{"name": "my-db", "label": "cloudantNoSQLDB", "credentials": {}}],
                "redis": [{"name": "cache", "label": "redis", "credentials": {}}]}"#,
        )
        .unwrap();
        AdminState {
            credentials: CredentialStore::new(SecretsManager(MemorySecretsManager::new())),
            services: ServiceSource::Fixed(bindings),
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_vcap_lists_cloudant_services() {
        let app = router(state());
        let (status, body) = call(&app, get("/cloudant/vcap")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"name": "my-db", "label": "cloudantNoSQLDB"}]));
    }

    #[tokio::test]
    async fn test_credentials_lifecycle() {
        let app = router(state());

        let (status, body) = call(&app, get("/cloudant/cfg1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));

        let form = Request::post("/cloudant/cfg1")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("username=admin&password=s%3Dcret"))
            .unwrap();
        assert_eq!(call(&app, form).await.0, StatusCode::OK);

        let (_, body) = call(&app, get("/cloudant/cfg1")).await;
        assert_eq!(body, json!({"username": "admin", "hasPassword": true}));

        let json_update = Request::post("/cloudant/cfg1")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username": "other"}"#))
            .unwrap();
        assert_eq!(call(&app, json_update).await.0, StatusCode::OK);
        let (_, body) = call(&app, get("/cloudant/cfg1")).await;
        assert_eq!(body, json!({"username": "other", "hasPassword": true}));

        let delete = Request::delete("/cloudant/cfg1").body(Body::empty()).unwrap();
        assert_eq!(call(&app, delete).await.0, StatusCode::OK);
        let (_, body) = call(&app, get("/cloudant/cfg1")).await;
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let app = router(state());
        let request = Request::post("/cloudant/cfg1")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        assert_eq!(call(&app, request).await.0, StatusCode::BAD_REQUEST);
    }
}
