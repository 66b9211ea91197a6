//! Handler traits and type erasure.
//!
//! # How handlers are stored
//!
//! The route table holds handlers of *different* concrete types, so each one
//! is erased behind `dyn ErasedHandler` once, at registration time:
//!
//! ```text
//! async fn hello(ctx: Context, req: Request) -> &'static str { … }  ← user writes this
//!        ↓ app.get("/", hello)
//! hello.into_boxed_handler()                  ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                  ← stored as BoxedHandler
//!        ↓ middleware::compose(…)             ← wrapped once, not per request
//! chain.call(ctx, req) at request time        ← one vtable call per layer
//!        ↓
//! Box::pin(async { Box::new(hello(ctx, req).await) as BoxEncoder })
//! ```
//!
//! Per request the cost is one `Arc` clone plus one virtual call per
//! middleware layer.
//!
//! Raw handlers ([`RawHandler`]) follow the same path; their adapter commits
//! the native response to the sink and hands an empty placeholder encoder up
//! the chain, so middleware composes over both kinds identically.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::encoder::{BoxEncoder, Committed, Encoder};
use crate::request::Request;
use crate::server::Body;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to an encoder.
pub type BoxFuture = Pin<Box<dyn Future<Output = BoxEncoder> + Send + 'static>>;

/// Object-safe handler interface; what middleware wraps and the router stores.
pub trait ErasedHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context, req: Request) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn ErasedHandler>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is satisfied by any async function
/// or closure shaped like:
///
/// ```text
/// async fn name(ctx: Context, req: Request) -> impl Encoder
/// ```
///
/// Handlers return values; they never write to the connection.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

/// Escape hatch for handlers that must build the native response themselves
/// (streaming bodies, headers the encoder contract does not model):
///
/// ```text
/// async fn name(ctx: Context, req: Request) -> http::Response<gantry::Body>
/// ```
pub trait RawHandler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Encoder,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

impl<F, Fut> RawHandler for F
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Body>> + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(RawFnHandler(self))
    }
}

// ── Concrete wrappers ─────────────────────────────────────────────────────────

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Encoder,
{
    fn call(&self, ctx: Context, req: Request) -> BoxFuture {
        let fut = (self.0)(ctx, req);
        Box::pin(async move { Box::new(fut.await) as BoxEncoder })
    }
}

struct RawFnHandler<F>(F);

impl<F, Fut> ErasedHandler for RawFnHandler<F>
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Body>> + Send + 'static,
{
    fn call(&self, ctx: Context, req: Request) -> BoxFuture {
        let fut = (self.0)(ctx.clone(), req);
        Box::pin(async move {
            let resp = fut.await;
            // Canceled or already answered: the sink refuses and the
            // response is dropped, same as an encoder would be.
            if !ctx.is_cancelled() {
                let _ = ctx.sink().send(resp);
            }
            Box::new(Committed) as BoxEncoder
        })
    }
}
