//! Tracing and logging collaborators.
//!
//! The dispatcher talks to two small traits:
//!
//! - [`Tracer`] opens one span per request and closes it with the captured
//!   status and latency.
//! - [`Logger`] receives one structured record per request (plus any
//!   warnings/errors raised along the way), correlated by the trace id
//!   carried in the [`Context`].
//!
//! The defaults, [`TracingTracer`] and [`TracingLogger`], sit on top of the
//! `tracing` facade, so whatever subscriber the process installs (see
//! [`init_logging`]) sees the spans and events. Swap either one out to ship
//! to a different backend or to record calls in tests.

use std::fmt;
use std::time::Duration;

use http::StatusCode;
use tracing::Level;
use tracing::field::Empty;
use tracing_subscriber::{EnvFilter, fmt as sfmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::{Config, LogFormat};
use crate::context::Context;
use crate::error::Error;
use crate::request::Request;

// ── Tracer ────────────────────────────────────────────────────────────────────

/// An open request span.
pub struct Span {
    trace_id: String,
    span_id: String,
    span: tracing::Span,
}

impl Span {
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>, span: tracing::Span) -> Self {
        Self { trace_id: trace_id.into(), span_id: span_id.into(), span }
    }

    pub fn trace_id(&self) -> &str { &self.trace_id }
    pub fn span_id(&self) -> &str { &self.span_id }

    /// The `tracing` span the handler chain is instrumented with.
    pub fn tracing_span(&self) -> &tracing::Span { &self.span }
}

/// Starts and ends the per-request span.
pub trait Tracer: Send + Sync + 'static {
    /// Open a span called `name` (`"<METHOD> <route pattern>"`).
    fn start(&self, req: &Request, name: &str) -> Span;

    /// Close the span. `status` is `None` when the request was canceled
    /// before a response was written.
    fn end(&self, span: Span, status: Option<StatusCode>, elapsed: Duration);
}

/// Default tracer: a `tracing` span with OpenTelemetry-style field names.
///
/// Continues the trace from an incoming W3C `traceparent` header when it is
/// well-formed, otherwise starts a fresh one.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start(&self, req: &Request, name: &str) -> Span {
        let trace_id = req
            .header("traceparent")
            .and_then(parse_traceparent)
            .unwrap_or_else(new_trace_id);
        let span_id = new_span_id();

        let span = tracing::info_span!(
            "request",
            otel.name = %name,
            trace_id = %trace_id,
            span_id = %span_id,
            http.method = %req.method(),
            http.status_code = Empty,
            elapsed_ms = Empty,
            outcome = Empty,
        );
        Span::new(trace_id, span_id, span)
    }

    fn end(&self, span: Span, status: Option<StatusCode>, elapsed: Duration) {
        let inner = span.span;
        inner.record("elapsed_ms", elapsed.as_millis() as u64);
        match status {
            Some(code) => {
                inner.record("http.status_code", code.as_u16());
                inner.record("outcome", if code.is_server_error() { "error" } else { "ok" });
            }
            None => {
                inner.record("outcome", "canceled");
            }
        }
    }
}

/// Extracts the trace id from `version-traceid-parentid-flags`.
fn parse_traceparent(header: &str) -> Option<String> {
    let mut parts = header.trim().split('-');
    let (version, trace_id, parent_id, flags) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    let hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
    if !hex(version, 2) || version == "ff" || !hex(trace_id, 32) || !hex(parent_id, 16) || !hex(flags, 2) {
        return None;
    }
    if trace_id.bytes().all(|b| b == b'0') {
        return None;
    }
    Some(trace_id.to_ascii_lowercase())
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

// ── Logger ────────────────────────────────────────────────────────────────────

/// Structured log sink, correlated by the trace id in the [`Context`].
pub trait Logger: Send + Sync + 'static {
    fn log(&self, ctx: &Context, level: Level, message: &str, fields: &[(&str, String)]);
}

/// Default logger: one `tracing` event per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, ctx: &Context, level: Level, message: &str, fields: &[(&str, String)]) {
        let trace_id = ctx.trace_id();
        let fields = Fields(fields);
        // `tracing` needs the level at compile time.
        match level {
            Level::ERROR => tracing::error!(trace_id, fields = %fields, "{message}"),
            Level::WARN  => tracing::warn!(trace_id, fields = %fields, "{message}"),
            Level::INFO  => tracing::info!(trace_id, fields = %fields, "{message}"),
            Level::DEBUG => tracing::debug!(trace_id, fields = %fields, "{message}"),
            _            => tracing::trace!(trace_id, fields = %fields, "{message}"),
        }
    }
}

/// `key=value` pairs separated by spaces.
struct Fields<'a>(&'a [(&'a str, String)]);

impl fmt::Display for Fields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

// ── Subscriber setup ──────────────────────────────────────────────────────────

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set. Call once, early in
/// `main`; a second call returns [`Error::Config`].
pub fn init_logging(config: &Config) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let layer = match config.log_format {
        LogFormat::Json => sfmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => sfmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging init: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceparent_is_continued() {
        let header = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        assert_eq!(
            parse_traceparent(header).as_deref(),
            Some("4bf92f3577b34da6a3ce929d0e0e4736"),
        );
    }

    #[test]
    fn malformed_traceparent_is_ignored() {
        assert_eq!(parse_traceparent("garbage"), None);
        assert_eq!(parse_traceparent("00-abc-00f067aa0ba902b7-01"), None);
        assert_eq!(
            parse_traceparent("00-00000000000000000000000000000000-00f067aa0ba902b7-01"),
            None,
        );
        assert_eq!(
            parse_traceparent("ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            None,
        );
    }

    #[test]
    fn generated_ids_have_w3c_lengths() {
        assert_eq!(new_trace_id().len(), 32);
        assert_eq!(new_span_id().len(), 16);
    }

    #[test]
    fn fields_render_as_key_value_pairs() {
        let pairs = [("method", "GET".to_owned()), ("status", "200".to_owned())];
        assert_eq!(Fields(&pairs).to_string(), "method=GET status=200");
    }
}
