//! # gantry
//!
//! Request dispatch and middleware composition for HTTP services.
//!
//! Handlers return values; the framework writes them. Every request gets a
//! trace span, a cancellation token, and exactly one structured log record,
//! whatever path it takes through the system.
//!
//! ## What it does
//!
//! - Routing: radix-tree lookup via [`matchit`], route groups, duplicate
//!   detection at startup
//! - Middleware: global and per-route, composed once at registration
//! - Responses: the [`Encoder`] contract, written exactly once
//! - CORS: preflight answers and allow-origin injection
//! - Static files: with an SPA fallback to `index.html`
//! - Fault containment: panics become 500s, client disconnects cancel the
//!   request context
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gantry::{App, Config, Context, HttpError, Json, Request, Server};
//! use http::Method;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gantry::Error> {
//!     let config = Config::from_env()?;
//!     gantry::init_logging(&config)?;
//!
//!     let mut app = App::from_config(&config)?;
//!     app.use_middleware(gantry::middleware::trace_header())?;
//!     app.register(Method::GET, "/api/v1", "/users/{id}", get_user, &[])?;
//!
//!     Server::from_config(&config).serve(app).await
//! }
//!
//! async fn get_user(ctx: Context, req: Request) -> Result<Json<serde_json::Value>, HttpError> {
//!     let id = req.param("id").ok_or_else(HttpError::not_found)?;
//!     ctx.log_field("user_id", id);
//!     Ok(Json(serde_json::json!({ "id": id })))
//! }
//! ```

mod app;
mod config;
mod context;
mod cors;
mod encoder;
mod error;
mod handler;
mod request;
mod respond;
mod router;
mod server;
mod telemetry;

pub mod health;
pub mod middleware;
pub mod static_files;

pub use app::App;
pub use config::{Config, LogFormat};
pub use context::{Context, Sink};
pub use cors::Cors;
pub use encoder::{
    BoxEncoder, ContentType, Encoded, Encoder, Html, HttpError, Json, Response, ResponseBuilder, Text,
};
pub use error::{BoxError, EncodeError, Error, RespondError};
pub use handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler, RawHandler};
pub use middleware::Middleware;
pub use request::{RemoteAddr, Request};
pub use respond::respond;
pub use server::{Body, Server};
pub use static_files::{DirFs, MemoryFs, Vfs, VfsFile};
pub use telemetry::{Logger, Span, Tracer, TracingLogger, TracingTracer, init_logging};
