//! Tablesync Reference Server
//!
//! Serves in-memory tables over the HTTP contract the `tablesync` client
//! speaks, so the CLI can be exercised end to end. State is lost on restart.
//!
//! # Configuration
//!
//! Environment variables:
//! - `TABLESYNC_PORT`: Port to listen on (default: 8080)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint
//! - `POST /tables/{name}`: Insert a row (201, or 409 with the existing row)
//! - `GET /tables/{name}?updatedSince=&limit=`: Rows changed after a mark
//! - `PATCH /tables/{name}/{id}`: Update a row (`If-Match`; 412 on mismatch)
//! - `DELETE /tables/{name}/{id}`: Soft-delete a row (`If-Match`; 204)

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tablesync_core::remote::{DEFAULT_REPLY_CAPACITY, IDEMPOTENCY_KEY, IF_MATCH};
use tablesync_core::{MemoryRemote, RemoteError, RemoteRow, RemoteTable, Version};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Configuration
// ============================================================================

const DEFAULT_PAGE_SIZE: usize = 50;

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Idempotency keys remembered for retried requests
    reply_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("TABLESYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let reply_capacity = std::env::var("TABLESYNC_REPLY_CACHE")
            .ok()
            .and_then(|n| n.parse().ok())
            .unwrap_or(DEFAULT_REPLY_CAPACITY);

        Self {
            port,
            reply_capacity,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    tables: Arc<MemoryRemote>,
}

// ============================================================================
// Request helpers
// ============================================================================

/// Error response body
#[derive(Serialize)]
struct ApiError {
    error: &'static str,
    message: String,
}

fn api_error(status: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error,
            message: message.into(),
        }),
    )
        .into_response()
}

/// Maps a table error to a response. `conflict` is the status used when the
/// current server row is returned.
fn error_response(e: RemoteError, conflict: StatusCode) -> Response {
    match e {
        RemoteError::Conflict(current) => (conflict, Json(current.to_wire())).into_response(),
        RemoteError::NotFound => api_error(StatusCode::NOT_FOUND, "not_found", "Row not found"),
        other => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            other.to_string(),
        ),
    }
}

fn idempotency_key(headers: &HeaderMap) -> String {
    headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// `If-Match: "token"` (quotes optional, `*` means unconditional)
fn expected_version(headers: &HeaderMap) -> Option<Version> {
    let raw = headers.get(IF_MATCH)?.to_str().ok()?.trim();
    let token = raw.trim_start_matches("W/").trim_matches('"');
    (!token.is_empty() && token != "*").then(|| Version::new(token))
}

/// Decodes a request body into a row, taking the id from `id` when given.
fn decode_row(body: Value, id: Option<String>) -> Result<RemoteRow, Response> {
    let Value::Object(mut object) = body else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_body",
            "Row must be a JSON object",
        ));
    };
    let id = id.or_else(|| match object.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        _ => None,
    });
    object.insert(
        "id".to_string(),
        Value::String(id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())),
    );
    // Clients never choose versions or timestamps
    object.remove("version");
    object.remove("updatedAt");
    object.remove("deleted");

    RemoteRow::from_wire(Value::Object(object))
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn insert_row(
    State(state): State<AppState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let incoming = match decode_row(body, None) {
        Ok(incoming) => incoming,
        Err(response) => return response,
    };

    match state
        .tables
        .insert(&table, &incoming.row, &idempotency_key(&headers))
        .await
    {
        Ok(stored) => {
            tracing::info!("Inserted {}/{}", table, stored.row.id);
            (StatusCode::CREATED, Json(stored.to_wire())).into_response()
        }
        Err(e) => error_response(e, StatusCode::CONFLICT),
    }
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    #[serde(rename = "updatedSince")]
    updated_since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn list_changes(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    match state.tables.changes(&table, query.updated_since, limit).await {
        Ok(rows) => {
            let rows: Vec<Value> = rows.iter().map(RemoteRow::to_wire).collect();
            Json(rows).into_response()
        }
        Err(e) => error_response(e, StatusCode::CONFLICT),
    }
}

async fn update_row(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut incoming = match decode_row(body, Some(id)) {
        Ok(incoming) => incoming,
        Err(response) => return response,
    };
    incoming.row.version = expected_version(&headers);

    match state
        .tables
        .update(&table, &incoming.row, &idempotency_key(&headers))
        .await
    {
        Ok(stored) => {
            tracing::info!("Updated {}/{}", table, stored.row.id);
            Json(stored.to_wire()).into_response()
        }
        Err(e) => error_response(e, StatusCode::PRECONDITION_FAILED),
    }
}

async fn delete_row(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let expected = expected_version(&headers);
    match state
        .tables
        .delete(&table, &id, expected.as_ref(), &idempotency_key(&headers))
        .await
    {
        Ok(()) => {
            tracing::info!("Deleted {}/{}", table, id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e, StatusCode::PRECONDITION_FAILED),
    }
}

fn app(tables: Arc<MemoryRemote>) -> Router {
    let state = AppState { tables };

    Router::new()
        .route("/health", get(health))
        .route("/tables/{table}", post(insert_row).get(list_changes))
        .route("/tables/{table}/{id}", patch(update_row).delete(delete_row))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablesync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    let app = app(Arc::new(
        MemoryRemote::new().with_reply_capacity(config.reply_capacity),
    ));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
    }

    async fn insert(app: &Router, body: Value) -> (StatusCode, Value) {
        let request = json_request("POST", "/tables/items")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, request).await
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(Arc::new(MemoryRemote::new()));
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_insert_then_duplicate_conflicts() {
        let app = app(Arc::new(MemoryRemote::new()));

        let (status, body) = insert(&app, json!({"id": "a", "name": "24"})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "a");
        assert_eq!(body["name"], "24");
        assert!(body["version"].is_string());
        assert!(body["updatedAt"].is_string());

        let (status, body) = insert(&app, json!({"id": "a", "name": "other"})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["name"], "24");
    }

    #[tokio::test]
    async fn test_insert_without_id_generates_one() {
        let app = app(Arc::new(MemoryRemote::new()));

        let (status, body) = insert(&app, json!({"name": "x"})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(uuid::Uuid::parse_str(body["id"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_update_checks_if_match() {
        let app = app(Arc::new(MemoryRemote::new()));
        let (_, created) = insert(&app, json!({"id": "a", "name": "24"})).await;
        let version = created["version"].as_str().unwrap().to_string();

        let stale = json_request("PATCH", "/tables/items/a")
            .header(IF_MATCH, "\"stale\"")
            .body(Body::from(json!({"name": "42"}).to_string()))
            .unwrap();
        let (status, body) = send(&app, stale).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["version"], version.as_str());

        let fresh = json_request("PATCH", "/tables/items/a")
            .header(IF_MATCH, format!("\"{}\"", version))
            .body(Body::from(json!({"name": "42"}).to_string()))
            .unwrap();
        let (status, body) = send(&app, fresh).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "42");
        assert_ne!(body["version"], version.as_str());

        let missing = json_request("PATCH", "/tables/items/nope")
            .body(Body::from(json!({"name": "42"}).to_string()))
            .unwrap();
        let (status, _) = send(&app, missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_is_visible_in_changes() {
        let app = app(Arc::new(MemoryRemote::new()));
        insert(&app, json!({"id": "a"})).await;
        insert(&app, json!({"id": "b"})).await;

        let delete = Request::builder()
            .method("DELETE")
            .uri("/tables/items/a")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, delete).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let again = Request::builder()
            .method("DELETE")
            .uri("/tables/items/a")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, again).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let list = Request::builder()
            .uri("/tables/items?limit=10")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, list).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        // Oldest change first: b was inserted before a was deleted
        assert_eq!(rows[0]["id"], "b");
        assert_eq!(rows[1]["id"], "a");
        assert_eq!(rows[1]["deleted"], true);
    }

    #[tokio::test]
    async fn test_idempotency_key_replays_insert() {
        let app = app(Arc::new(MemoryRemote::new()));

        let request = || {
            json_request("POST", "/tables/items")
                .header(IDEMPOTENCY_KEY, "client:1:0")
                .body(Body::from(json!({"id": "a"}).to_string()))
                .unwrap()
        };
        let (first_status, first) = send(&app, request()).await;
        let (second_status, second) = send(&app, request()).await;
        assert_eq!(first_status, StatusCode::CREATED);
        assert_eq!(second_status, StatusCode::CREATED);
        assert_eq!(first, second);
    }

    #[test]
    fn test_expected_version_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(expected_version(&headers), None);

        headers.insert(IF_MATCH, "\"v1\"".parse().unwrap());
        assert_eq!(expected_version(&headers), Some(Version::new("v1")));

        headers.insert(IF_MATCH, "*".parse().unwrap());
        assert_eq!(expected_version(&headers), None);
    }
}
