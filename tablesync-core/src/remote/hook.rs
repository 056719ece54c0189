//! Request/response hooks wrapped around every HTTP call.

/// What was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
}

/// What came back.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    pub status: u16,
    pub reason: String,
    pub body: String,
}

/// A stage in the [`HttpRemote`](super::HttpRemote) pipeline.
///
/// `before` runs in registration order before the request is sent, `after`
/// in reverse order once the response body has been read. Transport errors
/// skip `after`.
pub trait HttpHook: Send + Sync {
    fn before(&self, _request: &RequestRecord) {}

    fn after(&self, _request: &RequestRecord, _response: &ResponseRecord) {}
}

/// Logs every request and response with its body.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHook;

impl HttpHook for LoggingHook {
    fn before(&self, request: &RequestRecord) {
        tracing::info!(
            "  >>> {} {}\n{}",
            request.method,
            request.url,
            request.body.as_deref().unwrap_or("")
        );
    }

    fn after(&self, _request: &RequestRecord, response: &ResponseRecord) {
        tracing::info!(
            "  <<< {} {}\n{}",
            response.status,
            response.reason,
            response.body
        );
    }
}
