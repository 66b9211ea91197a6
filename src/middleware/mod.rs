//! Middleware: functions from handler to handler.
//!
//! A [`Middleware`] takes the handler it wraps and returns a new one. That
//! is the whole contract, which makes composition a plain fold:
//!
//! ```text
//! compose(h, [A, B, C])  ==  A(B(C(h)))
//! ```
//!
//! `A` sees the request first and the encoder last. Composing with an empty
//! slice returns `h` itself, and because it is function composition it is
//! associative: `compose(compose(h, [C]), [A, B]) == compose(h, [A, B, C])`.
//!
//! The app folds each route's chain once, at registration. Nothing is
//! allocated per request beyond the futures themselves.
//!
//! Most middleware is easiest to write with [`from_fn`]:
//!
//! ```rust
//! use gantry::middleware::{self, Next};
//! use gantry::{BoxEncoder, Context, HttpError, Request};
//!
//! let require_key = middleware::from_fn(|ctx: Context, req: Request, next: Next| async move {
//!     if req.header("x-api-key").is_none() {
//!         return Box::new(HttpError::forbidden()) as BoxEncoder;
//!     }
//!     next.run(ctx, req).await
//! });
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue, StatusCode};
use tracing::Level;

use crate::context::Context;
use crate::encoder::BoxEncoder;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::request::Request;

/// A handler transformer.
pub type Middleware = Arc<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync>;

/// Wrap `handler` in `layers`, outermost first.
pub fn compose(handler: BoxedHandler, layers: &[Middleware]) -> BoxedHandler {
    let mut chain = handler;
    for layer in layers.iter().rev() {
        chain = layer(chain);
    }
    chain
}

// ── from_fn ───────────────────────────────────────────────────────────────────

/// The rest of the chain, as seen from inside a [`from_fn`] middleware.
pub struct Next {
    inner: BoxedHandler,
}

impl Next {
    /// Invoke the wrapped handler. Skip the call to short-circuit.
    pub fn run(self, ctx: Context, req: Request) -> BoxFuture {
        self.inner.call(ctx, req)
    }
}

/// Build middleware from an async closure `(ctx, req, next) -> BoxEncoder`.
pub fn from_fn<F, Fut>(f: F) -> Middleware
where
    F: Fn(Context, Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BoxEncoder> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: BoxedHandler| -> BoxedHandler {
        Arc::new(FromFn { f: Arc::clone(&f), next })
    })
}

struct FromFn<F> {
    f: Arc<F>,
    next: BoxedHandler,
}

impl<F, Fut> ErasedHandler for FromFn<F>
where
    F: Fn(Context, Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BoxEncoder> + Send + 'static,
{
    fn call(&self, ctx: Context, req: Request) -> BoxFuture {
        let next = Next { inner: Arc::clone(&self.next) };
        Box::pin((self.f)(ctx, req, next))
    }
}

// ── Built-ins ─────────────────────────────────────────────────────────────────

/// Header carrying the request's trace id back to the client.
pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Echo the trace id in an `x-trace-id` response header.
pub fn trace_header() -> Middleware {
    from_fn(|ctx: Context, req: Request, next: Next| async move {
        if let Ok(value) = HeaderValue::from_str(ctx.trace_id()) {
            ctx.sink().insert_header(TRACE_ID_HEADER, value);
        }
        next.run(ctx, req).await
    })
}

/// Cancel the request if the rest of the chain takes longer than `limit`.
///
/// Once canceled nothing is written; the request is logged as canceled.
pub fn timeout(limit: Duration) -> Middleware {
    from_fn(move |ctx: Context, req: Request, next: Next| async move {
        tokio::select! {
            encoder = next.run(ctx.clone(), req) => encoder,
            () = tokio::time::sleep(limit) => {
                ctx.log(Level::WARN, "handler deadline exceeded", &[
                    ("limit_ms", limit.as_millis().to_string()),
                ]);
                ctx.cancel();
                Box::new(StatusCode::GATEWAY_TIMEOUT) as BoxEncoder
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::handler::Handler;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn marker(name: &'static str, trace: Trace) -> Middleware {
        from_fn(move |ctx: Context, req: Request, next: Next| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().push(format!("{name}>"));
                let out = next.run(ctx, req).await;
                trace.lock().push(format!("<{name}"));
                out
            }
        })
    }

    fn recording_handler(trace: Trace) -> BoxedHandler {
        let handler = move |_ctx: Context, _req: Request| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().push("handler".to_owned());
                "ok"
            }
        };
        handler.into_boxed_handler()
    }

    fn request() -> Request {
        Request::from_http(http::Request::new(Bytes::new()))
    }

    #[test]
    fn empty_chain_is_identity() {
        let handler = recording_handler(Trace::default());
        let composed = compose(Arc::clone(&handler), &[]);
        assert!(Arc::ptr_eq(&handler, &composed));
    }

    #[tokio::test]
    async fn first_layer_is_outermost() {
        let trace = Trace::default();
        let chain = compose(
            recording_handler(Arc::clone(&trace)),
            &[marker("a", Arc::clone(&trace)), marker("b", Arc::clone(&trace))],
        );

        chain.call(Context::detached(), request()).await;

        assert_eq!(*trace.lock(), ["a>", "b>", "handler", "<b", "<a"]);
    }

    #[tokio::test]
    async fn composition_is_associative() {
        let flat = Trace::default();
        let nested = Trace::default();

        let layers = |t: &Trace| [marker("a", t.clone()), marker("b", t.clone()), marker("c", t.clone())];

        let [a, b, c] = layers(&flat);
        compose(recording_handler(flat.clone()), &[a, b, c])
            .call(Context::detached(), request())
            .await;

        let [a, b, c] = layers(&nested);
        let inner = compose(recording_handler(nested.clone()), &[c]);
        compose(inner, &[a, b]).call(Context::detached(), request()).await;

        assert_eq!(*flat.lock(), *nested.lock());
    }

    #[tokio::test]
    async fn short_circuit_skips_the_handler() {
        let trace = Trace::default();
        let deny = from_fn(|_ctx: Context, _req: Request, _next: Next| async move {
            Box::new(StatusCode::FORBIDDEN) as BoxEncoder
        });
        let chain = compose(recording_handler(Arc::clone(&trace)), &[deny]);

        let encoder = chain.call(Context::detached(), request()).await;

        assert_eq!(encoder.status(), StatusCode::FORBIDDEN);
        assert!(trace.lock().is_empty());
    }

    #[tokio::test]
    async fn trace_header_is_queued_on_the_sink() {
        let ctx = Context::detached();
        let chain = compose(recording_handler(Trace::default()), &[trace_header()]);

        let encoder = chain.call(ctx.clone(), request()).await;
        crate::respond::respond(&ctx, encoder).unwrap();

        let resp = ctx.sink().take().unwrap();
        assert_eq!(resp.headers()[&TRACE_ID_HEADER], ctx.trace_id());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_slow_handlers() {
        let slow = |_ctx: Context, _req: Request| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "late"
        };
        let ctx = Context::detached();
        let chain = compose(slow.into_boxed_handler(), &[timeout(Duration::from_millis(50))]);

        chain.call(ctx.clone(), request()).await;

        assert!(ctx.is_cancelled());
    }
}
