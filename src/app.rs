//! The application: route table, global middleware, telemetry, CORS, and
//! the per-request dispatch loop.
//!
//! # Lifecycle
//!
//! Build an [`App`] at startup with `&mut self` registration calls, then
//! hand it to [`Server::serve`](crate::Server::serve), which takes it by
//! value and shares it read-only across connections. There is no way to
//! mutate it once serving starts, so the route table needs no locks.
//!
//! # Middleware order
//!
//! Each route's chain is folded once, at registration:
//!
//! ```text
//! global[0]( global[1]( … per_route[0]( … handler ) ) )
//! ```
//!
//! Global middleware sees the request first and the encoder last. Because
//! the fold happens at registration, global middleware must be added before
//! the first route; adding it later is a configuration error.
//!
//! # Dispatch
//!
//! 1. `OPTIONS` with CORS enabled → preflight answer, done.
//! 2. Route lookup; open a span named `"<METHOD> <pattern>"`.
//! 3. Build the [`Context`]; queue the allow-origin header if applicable.
//! 4. Run the chain (panics caught, deadline and cancellation honoured).
//! 5. Write the returned encoder through [`respond`](crate::respond).
//! 6. Close the span with status and latency.
//! 7. Emit one log record.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use http::Method;
use tracing::{Instrument, Level};

use crate::config::Config;
use crate::context::Context;
use crate::cors::{self, Cors};
use crate::encoder::{BoxEncoder, HttpError};
use crate::error::{Error, RespondError};
use crate::handler::{BoxedHandler, Handler, RawHandler};
use crate::middleware::{self, Middleware};
use crate::request::Request;
use crate::respond::{panic_message, respond};
use crate::router::{self, Routes};
use crate::server::Body;
use crate::static_files::{self, Vfs};
use crate::telemetry::{Logger, Tracer, TracingLogger, TracingTracer};

/// The application router and dispatcher.
pub struct App {
    routes: Routes,
    middleware: Vec<Middleware>,
    tracer: Arc<dyn Tracer>,
    logger: Arc<dyn Logger>,
    cors: Option<Cors>,
    request_timeout: Option<Duration>,
}

impl App {
    pub fn new() -> Self {
        Self {
            routes: Routes::default(),
            middleware: Vec::new(),
            tracer: Arc::new(TracingTracer),
            logger: Arc::new(TracingLogger),
            cors: None,
            request_timeout: None,
        }
    }

    /// An app with the timeout and CORS settings from `config` applied.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let mut app = Self::new();
        if let Some(limit) = config.request_timeout {
            app.request_timeout(limit);
        }
        app.enable_cors(config.cors_origins.iter().cloned())?;
        Ok(app)
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    pub fn tracer(&mut self, tracer: impl Tracer) -> &mut Self {
        self.tracer = Arc::new(tracer);
        self
    }

    pub fn logger(&mut self, logger: impl Logger) -> &mut Self {
        self.logger = Arc::new(logger);
        self
    }

    /// Cancel any request whose chain runs longer than `limit`.
    pub fn request_timeout(&mut self, limit: Duration) -> &mut Self {
        self.request_timeout = Some(limit);
        self
    }

    /// Append global middleware. Must precede every route registration.
    pub fn use_middleware(&mut self, layer: Middleware) -> Result<&mut Self, Error> {
        if !self.routes.is_empty() {
            return Err(Error::Config(
                "global middleware must be added before any route is registered".to_owned(),
            ));
        }
        self.middleware.push(layer);
        Ok(self)
    }

    /// Allow cross-origin requests from `origins` (`*` for any).
    /// An empty list turns CORS off.
    pub fn enable_cors<I, S>(&mut self, origins: I) -> Result<&mut Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cors = Cors::new(origins)?;
        Ok(self)
    }

    /// Install a fully-configured [`Cors`] (custom methods, headers, max age).
    pub fn cors(&mut self, cors: Cors) -> &mut Self {
        self.cors = Some(cors);
        self
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Register `handler` for `method` at `group` + `path`, wrapped in
    /// `middleware` (innermost) and the global middleware (outermost).
    ///
    /// ```rust
    /// use gantry::{App, Context, Request};
    /// use http::Method;
    ///
    /// async fn hello(_ctx: Context, _req: Request) -> &'static str {
    ///     "Hello, World!"
    /// }
    ///
    /// let mut app = App::new();
    /// app.register(Method::GET, "/api/v1", "/hello", hello, &[]).unwrap();
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateRoute`] if the method + pattern pair exists (the
    /// existing route is kept); [`Error::InvalidRoute`] for a bad pattern.
    pub fn register(
        &mut self,
        method: Method,
        group: &str,
        path: &str,
        handler: impl Handler,
        middleware: &[Middleware],
    ) -> Result<&mut Self, Error> {
        self.add(method, group, path, Handler::into_boxed_handler(handler), middleware)
    }

    /// Like [`register`](Self::register), for a handler that builds the
    /// native response itself.
    pub fn register_raw(
        &mut self,
        method: Method,
        group: &str,
        path: &str,
        handler: impl RawHandler,
        middleware: &[Middleware],
    ) -> Result<&mut Self, Error> {
        self.add(method, group, path, RawHandler::into_boxed_handler(handler), middleware)
    }

    /// Shorthand for `register(method, "", path, handler, &[])`.
    pub fn on(&mut self, method: Method, path: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.register(method, "", path, handler, &[])
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.on(Method::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.on(Method::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.on(Method::PUT, path, handler)
    }

    pub fn patch(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.on(Method::PATCH, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, Error> {
        self.on(Method::DELETE, path, handler)
    }

    /// Serve files from `vfs` under `dir` at `prefix`. Misses are 404.
    pub fn file_server(&mut self, vfs: impl Vfs, dir: &str, prefix: &str) -> Result<&mut Self, Error> {
        static_files::mount(self, Arc::new(vfs), dir, prefix, false)?;
        Ok(self)
    }

    /// Like [`file_server`](Self::file_server), but route-shaped misses get
    /// `<dir>/index.html`. See [`static_files`](crate::static_files) for the rule.
    pub fn file_server_spa(&mut self, vfs: impl Vfs, dir: &str, prefix: &str) -> Result<&mut Self, Error> {
        static_files::mount(self, Arc::new(vfs), dir, prefix, true)?;
        Ok(self)
    }

    fn add(
        &mut self,
        method: Method,
        group: &str,
        path: &str,
        handler: BoxedHandler,
        per_route: &[Middleware],
    ) -> Result<&mut Self, Error> {
        let pattern = router::join(group, path);
        let layers: Vec<Middleware> = self.middleware.iter().chain(per_route).cloned().collect();
        let chain = middleware::compose(handler, &layers);
        self.routes.insert(method, pattern, chain)?;
        Ok(self)
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Serve one request.
    ///
    /// Returns `None` when the request was canceled before anything was
    /// written; otherwise the committed response.
    pub async fn dispatch(&self, req: http::Request<Bytes>) -> Option<http::Response<Body>> {
        let mut req = Request::from_http(req);

        if let Some(cors) = &self.cors {
            if cors::is_preflight(req.method()) {
                return Some(cors.preflight(&req));
            }
        }

        let matched = self.routes.lookup(req.method(), req.path());
        let route = matched.as_ref().map(|(route, _)| route.pattern.clone());
        let name = format!("{} {}", req.method(), route.as_deref().unwrap_or("unmatched"));

        let span = self.tracer.start(&req, &name);
        let ctx = Context::new(span.trace_id(), span.span_id(), route, Arc::clone(&self.logger));
        if let Some(cors) = &self.cors {
            cors.inject(&ctx, &req);
        }

        let method = req.method().clone();
        let path = req.path().to_owned();
        let mut guard = AbortGuard { ctx: &ctx, method: &method, path: &path, armed: true };
        let started = Instant::now();

        let outcome = match matched {
            Some((route, params)) => {
                req.set_params(params);
                run(&route.handler, &ctx, req, self.request_timeout)
                    .instrument(span.tracing_span().clone())
                    .await
            }
            None => Outcome::Done(Box::new(HttpError::not_found())),
        };

        let message = match outcome {
            Outcome::Done(encoder) => {
                if ctx.sink().is_committed() {
                    "request completed"
                } else {
                    match respond(&ctx, encoder) {
                        Ok(_) | Err(RespondError::AlreadyWritten) => "request completed",
                        Err(RespondError::Cancelled) => "request canceled",
                    }
                }
            }
            Outcome::Cancelled => "request canceled",
            Outcome::TimedOut => "request timed out",
            Outcome::Panicked(cause) => {
                ctx.log(Level::ERROR, "handler panicked", &[
                    ("method", method.to_string()),
                    ("path", path.clone()),
                    ("panic", cause),
                ]);
                let _ = respond(&ctx, Box::new(HttpError::internal()));
                "request failed"
            }
        };
        guard.armed = false;

        let elapsed = started.elapsed();
        let status = ctx.status();
        self.tracer.end(span, status, elapsed);
        self.log_request(&ctx, message, &method, &path, elapsed);

        ctx.sink().take()
    }

    fn log_request(&self, ctx: &Context, message: &str, method: &Method, path: &str, elapsed: Duration) {
        let status = ctx.status();
        let level = match status {
            None => Level::WARN,
            Some(code) if code.is_server_error() => Level::ERROR,
            Some(_) => Level::INFO,
        };

        let extra = ctx.fields();
        let mut fields: Vec<(&str, String)> = vec![
            ("method", method.to_string()),
            ("path", path.to_owned()),
            ("status", status.map_or_else(|| "-".to_owned(), |s| s.as_u16().to_string())),
            ("duration_ms", format!("{:.3}", elapsed.as_secs_f64() * 1000.0)),
        ];
        if let Some(route) = ctx.route() {
            fields.push(("route", route.to_owned()));
        }
        fields.extend(extra.iter().map(|(k, v)| (k.as_str(), v.clone())));

        self.logger.log(ctx, level, message, &fields);
    }
}

impl Default for App {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("middleware", &self.middleware.len())
            .field("cors", &self.cors)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

// ── Chain execution ───────────────────────────────────────────────────────────

enum Outcome {
    Done(BoxEncoder),
    Cancelled,
    TimedOut,
    Panicked(String),
}

/// Run the chain until it returns, panics, is canceled, or hits the deadline.
async fn run(handler: &BoxedHandler, ctx: &Context, req: Request, limit: Option<Duration>) -> Outcome {
    let work = AssertUnwindSafe(handler.call(ctx.clone(), req)).catch_unwind();

    tokio::select! {
        biased;

        () = ctx.cancelled() => Outcome::Cancelled,

        () = deadline(limit) => {
            ctx.cancel();
            Outcome::TimedOut
        }

        result = work => match result {
            Ok(encoder) => Outcome::Done(encoder),
            Err(panic) => Outcome::Panicked(panic_message(&*panic)),
        },
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Cancels the request and logs it if dispatch is dropped mid-flight
/// (the server drops the future when the client disconnects).
struct AbortGuard<'a> {
    ctx: &'a Context,
    method: &'a Method,
    path: &'a str,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ctx.cancel();
            self.ctx.log(Level::WARN, "request aborted", &[
                ("method", self.method.to_string()),
                ("path", self.path.to_owned()),
            ]);
        }
    }
}
