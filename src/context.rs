//! Per-request context and response sink.
//!
//! A [`Context`] is created when dispatch starts and dropped once the
//! response has been handed back to the server. Every clone refers to the
//! same request; it is never shared between requests. It carries:
//!
//! - the trace and span ids of the request span,
//! - a cancellation token (client gone, deadline hit),
//! - the [`Sink`] the response is committed to,
//! - key/value pairs handlers attach to the request's log record,
//! - the [`Logger`], so nested code can log with the right trace id.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::error::RespondError;
use crate::server::{Body, full};
use crate::telemetry::{Logger, TracingLogger};

/// Handle to the state of one in-flight request. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    trace_id: String,
    span_id: String,
    route: Option<String>,
    cancel: CancellationToken,
    sink: Sink,
    fields: Mutex<Vec<(String, String)>>,
    logger: Arc<dyn Logger>,
}

impl Context {
    pub(crate) fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        route: Option<String>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                trace_id: trace_id.into(),
                span_id: span_id.into(),
                route,
                cancel: CancellationToken::new(),
                sink: Sink::new(),
                fields: Mutex::new(Vec::new()),
                logger,
            }),
        }
    }

    /// A context not tied to any server, for driving handlers and encoders
    /// directly (tests, batch jobs). Logs through [`TracingLogger`].
    pub fn detached() -> Self {
        Self::new(
            uuid::Uuid::new_v4().simple().to_string(),
            "",
            None,
            Arc::new(TracingLogger),
        )
    }

    pub fn trace_id(&self) -> &str { &self.inner.trace_id }
    pub fn span_id(&self) -> &str { &self.inner.span_id }

    /// The matched route pattern, e.g. `/users/{id}`. `None` when unmatched.
    pub fn route(&self) -> Option<&str> { self.inner.route.as_deref() }

    pub fn sink(&self) -> &Sink { &self.inner.sink }

    /// Status written for this request, if any yet.
    pub fn status(&self) -> Option<StatusCode> { self.inner.sink.status() }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// The token to hand to downstream work that should stop with the request.
    pub fn cancellation_token(&self) -> &CancellationToken { &self.inner.cancel }

    pub fn is_cancelled(&self) -> bool { self.inner.cancel.is_cancelled() }

    /// Resolves once the request is canceled.
    pub async fn cancelled(&self) { self.inner.cancel.cancelled().await }

    /// Cancel the request. Nothing is written afterwards unless a response
    /// was already committed.
    pub fn cancel(&self) { self.inner.cancel.cancel() }

    // ── Logging ───────────────────────────────────────────────────────────────

    /// Attach a key/value pair to this request's log record.
    pub fn log_field(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.fields.lock().push((key.into(), value.into()));
    }

    pub fn fields(&self) -> Vec<(String, String)> {
        self.inner.fields.lock().clone()
    }

    /// Log through the app's logger, tagged with this request's trace id.
    pub fn log(&self, level: Level, message: &str, fields: &[(&str, String)]) {
        self.inner.logger.log(self, level, message, fields);
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Per-request response slot.
///
/// Accepts exactly one commit. The status of that commit is kept in a
/// `OnceLock`, so it is observable afterwards and can never change.
pub struct Sink {
    status: OnceLock<StatusCode>,
    pending: Mutex<HeaderMap>,
    response: Mutex<Option<http::Response<Body>>>,
}

impl Sink {
    fn new() -> Self {
        Self {
            status: OnceLock::new(),
            pending: Mutex::new(HeaderMap::new()),
            response: Mutex::new(None),
        }
    }

    /// Queue a header for the eventual response. Ignored after commit.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        if !self.is_committed() {
            self.pending.lock().insert(name, value);
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status.get().is_some()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status.get().copied()
    }

    /// Commit a buffered response. Headers queued with
    /// [`insert_header`](Self::insert_header) are merged in; `headers` wins
    /// on conflicts.
    pub fn write(&self, status: StatusCode, headers: HeaderMap, body: Bytes) -> Result<(), RespondError> {
        let mut resp = http::Response::new(full(body));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        self.send(resp)
    }

    /// Commit a response in the server's native shape. Used by raw handlers,
    /// which may stream.
    pub fn send(&self, mut resp: http::Response<Body>) -> Result<(), RespondError> {
        self.status
            .set(resp.status())
            .map_err(|_| RespondError::AlreadyWritten)?;

        let pending = std::mem::take(&mut *self.pending.lock());
        let headers = resp.headers_mut();
        for (name, value) in &pending {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        *self.response.lock() = Some(resp);
        Ok(())
    }

    /// Hand the committed response to the server.
    pub(crate) fn take(&self) -> Option<http::Response<Body>> {
        self.response.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::header;

    #[test]
    fn sink_accepts_one_write() {
        let ctx = Context::detached();
        assert!(ctx.status().is_none());

        ctx.sink()
            .write(StatusCode::CREATED, HeaderMap::new(), Bytes::from_static(b"a"))
            .unwrap();
        let second = ctx.sink().write(StatusCode::OK, HeaderMap::new(), Bytes::new());

        assert_eq!(second, Err(RespondError::AlreadyWritten));
        assert_eq!(ctx.status(), Some(StatusCode::CREATED));
        assert_eq!(ctx.sink().take().unwrap().status(), StatusCode::CREATED);
    }

    #[test]
    fn pending_headers_are_merged_without_overriding() {
        let ctx = Context::detached();
        ctx.sink().insert_header(header::VARY, HeaderValue::from_static("Origin"));
        ctx.sink().insert_header(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

        let mut own = HeaderMap::new();
        own.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ctx.sink().write(StatusCode::OK, own, Bytes::new()).unwrap();

        let resp = ctx.sink().take().unwrap();
        assert_eq!(resp.headers()[header::VARY], "Origin");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn fields_accumulate_in_order() {
        let ctx = Context::detached();
        ctx.log_field("user", "42");
        ctx.clone().log_field("plan", "pro");
        assert_eq!(
            ctx.fields(),
            vec![("user".to_owned(), "42".to_owned()), ("plan".to_owned(), "pro".to_owned())],
        );
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let ctx = Context::detached();
        let other = ctx.clone();
        other.cancel();
        assert!(ctx.is_cancelled());
    }
}
