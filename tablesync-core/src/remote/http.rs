//! HTTP client for the remote table service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::hook::{HttpHook, RequestRecord, ResponseRecord};
use super::{RemoteError, RemoteTable, IDEMPOTENCY_KEY, IF_MATCH};
use crate::models::{RemoteRow, Row, Version};

/// [`RemoteTable`] over HTTP, with an explicit hook pipeline.
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
    hooks: Vec<Arc<dyn HttpHook>>,
}

struct Exchange {
    status: StatusCode,
    body: String,
}

impl HttpRemote {
    /// Creates a client for `base_url`; every request is bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            hooks: Vec::new(),
        })
    }

    /// Appends a stage to the hook pipeline.
    pub fn with_hook(mut self, hook: impl HttpHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/tables/{}", self.base_url, urlencoding::encode(table))
    }

    fn row_url(&self, table: &str, id: &str) -> String {
        format!("{}/{}", self.table_url(table), urlencoding::encode(id))
    }

    fn changes_url(&self, table: &str, since: Option<DateTime<Utc>>, limit: usize) -> String {
        let mut url = format!("{}?limit={}", self.table_url(table), limit);
        if let Some(mark) = since {
            url.push_str("&updatedSince=");
            url.push_str(&urlencoding::encode(&mark.to_rfc3339()));
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<String>,
        headers: &[(&str, String)],
    ) -> Result<Exchange, RemoteError> {
        let record = RequestRecord {
            method: method.to_string(),
            url: url.clone(),
            body: body.clone(),
        };
        for hook in &self.hooks {
            hook.before(&record);
        }

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        if let Some(body) = body {
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        let response_record = ResponseRecord {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            body: body.clone(),
        };
        for hook in self.hooks.iter().rev() {
            hook.after(&record, &response_record);
        }

        Ok(Exchange { status, body })
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(e.to_string())
    }
}

fn if_match(version: &Version) -> String {
    format!("\"{}\"", version)
}

fn parse_row(body: &str) -> Result<RemoteRow, RemoteError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    RemoteRow::from_wire(value).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

/// Maps the statuses every route shares; `Ok` means 2xx.
fn check_status(exchange: &Exchange) -> Result<(), RemoteError> {
    match exchange.status {
        status if status.is_success() => Ok(()),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            Err(RemoteError::Conflict(Box::new(parse_row(&exchange.body)?)))
        }
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
        status => Err(RemoteError::Rejected {
            status: status.as_u16(),
            message: exchange.body.clone(),
        }),
    }
}

#[async_trait]
impl RemoteTable for HttpRemote {
    async fn insert(&self, table: &str, row: &Row, key: &str) -> Result<RemoteRow, RemoteError> {
        let exchange = self
            .send(
                Method::POST,
                self.table_url(table),
                Some(row.to_wire().to_string()),
                &[(IDEMPOTENCY_KEY, key.to_string())],
            )
            .await?;
        check_status(&exchange)?;
        parse_row(&exchange.body)
    }

    async fn update(&self, table: &str, row: &Row, key: &str) -> Result<RemoteRow, RemoteError> {
        let mut headers = vec![(IDEMPOTENCY_KEY, key.to_string())];
        if let Some(version) = &row.version {
            headers.push((IF_MATCH, if_match(version)));
        }

        let exchange = self
            .send(
                Method::PATCH,
                self.row_url(table, &row.id),
                Some(row.to_wire().to_string()),
                &headers,
            )
            .await?;
        check_status(&exchange)?;
        parse_row(&exchange.body)
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        version: Option<&Version>,
        key: &str,
    ) -> Result<(), RemoteError> {
        let mut headers = vec![(IDEMPOTENCY_KEY, key.to_string())];
        if let Some(version) = version {
            headers.push((IF_MATCH, if_match(version)));
        }

        let exchange = self
            .send(Method::DELETE, self.row_url(table, id), None, &headers)
            .await?;
        check_status(&exchange)
    }

    async fn changes(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let exchange = self
            .send(Method::GET, self.changes_url(table, since, limit), None, &[])
            .await?;
        check_status(&exchange)?;

        let values: Vec<Value> = serde_json::from_str(&exchange.body)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        values
            .into_iter()
            .map(|value| {
                RemoteRow::from_wire(value).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{patch, post},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::Mutex;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn test_router() -> Router {
        Router::new()
            .route(
                "/tables/{table}",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    assert!(headers.contains_key(IDEMPOTENCY_KEY));
                    let mut row = body.as_object().cloned().unwrap();
                    row.insert("version".into(), json!("v1"));
                    row.insert("updatedAt".into(), json!("2024-05-01T10:00:00Z"));
                    (AxumStatus::CREATED, Json(Value::Object(row)))
                })
                .get(|| async {
                    Json(json!([
                        {"id": "1", "version": "v1", "updatedAt": "2024-05-01T10:00:00Z", "name": "a"},
                        {"id": "2", "version": "v4", "updatedAt": "2024-05-01T11:00:00Z", "deleted": true}
                    ]))
                }),
            )
            .route(
                "/tables/{table}/{id}",
                patch(|Path((_table, id)): Path<(String, String)>, headers: HeaderMap| async move {
                    let expected = headers
                        .get(IF_MATCH)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    if expected != "\"v2\"" {
                        return (
                            AxumStatus::PRECONDITION_FAILED,
                            Json(json!({"id": id, "version": "v2", "name": "server"})),
                        );
                    }
                    (AxumStatus::OK, Json(json!({"id": id, "version": "v3", "name": "ok"})))
                })
                .delete(|| async { AxumStatus::NOT_FOUND }),
            )
    }

    fn row(id: &str, name: &str) -> Row {
        Row::new(id, Payload::new()).with_field("name", name)
    }

    #[derive(Default)]
    struct RecordingHook {
        seen: Mutex<Vec<String>>,
    }

    impl HttpHook for Arc<RecordingHook> {
        fn before(&self, request: &RequestRecord) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("before {} {}", request.method, request.url));
        }

        fn after(&self, _request: &RequestRecord, response: &ResponseRecord) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("after {}", response.status));
        }
    }

    #[test]
    fn test_urls_are_encoded() {
        let remote = HttpRemote::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(remote.base_url(), "http://localhost:8080");
        assert_eq!(
            remote.row_url("Offline Ready", "a/b"),
            "http://localhost:8080/tables/Offline%20Ready/a%2Fb"
        );

        let mark = DateTime::parse_from_rfc3339("2024-05-01T10:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            remote.changes_url("items", Some(mark), 50),
            "http://localhost:8080/tables/items?limit=50&updatedSince=2024-05-01T10%3A00%3A00%2B00%3A00"
        );
    }

    #[tokio::test]
    async fn test_insert_returns_server_row() {
        let base = serve(test_router()).await;
        let remote = HttpRemote::new(base, Duration::from_secs(5)).unwrap();

        let stored = remote.insert("items", &row("1", "24"), "k").await.unwrap();
        assert_eq!(stored.row.id, "1");
        assert_eq!(stored.row.version, Some(Version::new("v1")));
        assert_eq!(stored.row.field("name").unwrap(), "24");
    }

    #[tokio::test]
    async fn test_precondition_failed_is_conflict() {
        let base = serve(test_router()).await;
        let remote = HttpRemote::new(base, Duration::from_secs(5)).unwrap();

        let stale = row("1", "42").with_version(Version::new("v1"));
        match remote.update("items", &stale, "k").await {
            Err(RemoteError::Conflict(server)) => {
                assert_eq!(server.row.version, Some(Version::new("v2")));
                assert_eq!(server.row.field("name").unwrap(), "server");
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let current = row("1", "42").with_version(Version::new("v2"));
        let stored = remote.update("items", &current, "k2").await.unwrap();
        assert_eq!(stored.row.version, Some(Version::new("v3")));
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let base = serve(test_router()).await;
        let remote = HttpRemote::new(base, Duration::from_secs(5)).unwrap();

        let err = remote.delete("items", "1", None, "k").await.unwrap_err();
        assert_eq!(err, RemoteError::NotFound);
    }

    #[tokio::test]
    async fn test_changes_parses_soft_deletes() {
        let base = serve(test_router()).await;
        let remote = HttpRemote::new(base, Duration::from_secs(5)).unwrap();

        let changes = remote.changes("items", None, 10).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(!changes[0].deleted);
        assert!(changes[1].deleted);
    }

    #[tokio::test]
    async fn test_hooks_wrap_each_exchange() {
        let base = serve(test_router()).await;
        let hook = Arc::new(RecordingHook::default());
        let remote = HttpRemote::new(base.clone(), Duration::from_secs(5))
            .unwrap()
            .with_hook(hook.clone());

        remote.insert("items", &row("1", "24"), "k").await.unwrap();

        let seen = hook.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                format!("before POST {}/tables/items", base),
                "after 201".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote = HttpRemote::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let err = remote.changes("items", None, 10).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
