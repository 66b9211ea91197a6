//! HTTP transport and graceful shutdown.
//!
//! The server is a thin adapter: it accepts connections, buffers each
//! request body, and hands the request to [`App::dispatch`]. Everything
//! else (routing, middleware, telemetry) lives in the app.
//!
//! # Graceful shutdown
//!
//! On **SIGTERM** or Ctrl-C the server:
//! 1. stops calling `listener.accept()`;
//! 2. tells every open connection to shut down: idle keep-alive connections
//!    close at once, busy ones after their in-flight response;
//! 3. returns from [`Server::serve`] once all connections are gone.
//!
//! Under Kubernetes, set `terminationGracePeriodSeconds` longer than your
//! slowest request.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app::App;
use crate::config::Config;
use crate::error::{BoxError, Error};
use crate::request::RemoteAddr;

/// Response body type used throughout the crate.
pub type Body = BoxBody<Bytes, BoxError>;

/// A complete, in-memory body.
pub(crate) fn full(bytes: Bytes) -> Body {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configure the listen address. Nothing is bound until [`serve`](Self::serve).
    ///
    /// ```rust
    /// let server = gantry::Server::bind("127.0.0.1:3000").unwrap();
    /// assert!(gantry::Server::bind("nowhere").is_err());
    /// # drop(server);
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `addr` is not a `host:port` socket address.
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr = addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address `{addr}`: {e}")))?;
        Ok(Self { addr })
    }

    pub fn from_config(config: &Config) -> Self {
        Self { addr: config.addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections and dispatch them through `app`.
    ///
    /// Returns after a full graceful shutdown on SIGTERM or Ctrl-C.
    pub async fn serve(self, app: App) -> Result<(), Error> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Like [`serve`](Self::serve), but shuts down when `signal` resolves.
    pub async fn serve_with_shutdown(
        self,
        app: App,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "gantry listening");
        run(listener, Arc::new(app), signal).await;
        info!("gantry stopped");
        Ok(())
    }
}

/// Accept loop. On `signal` it stops accepting, asks every open connection
/// to finish its in-flight request and close, and waits for all of them.
async fn run(listener: TcpListener, app: Arc<App>, signal: impl Future<Output = ()>) {
    let mut tasks = tokio::task::JoinSet::new();
    let draining = CancellationToken::new();

    tokio::pin!(signal);

    loop {
        tokio::select! {
            // Shutdown first, so a signal stops accepting even under load.
            biased;

            () = &mut signal => {
                info!(open = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let app = Arc::clone(&app);
                let draining = draining.clone();
                tasks.spawn(connection(stream, remote_addr, app, draining));
            }

            // Reap finished tasks so the set stays bounded.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    draining.cancel();
    while tasks.join_next().await.is_some() {}
}

/// Serve one connection until the peer closes it or shutdown drains it.
async fn connection(stream: TcpStream, remote_addr: SocketAddr, app: Arc<App>, draining: CancellationToken) {
    let svc = service_fn(move |req| {
        let app = Arc::clone(&app);
        async move { handle(&app, req, remote_addr).await }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        () = draining.cancelled() => {
            // Idle keep-alive connections close now; busy ones after
            // their current response.
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(peer = %remote_addr, "connection error: {e}");
    }
}

/// Buffer the body, run the app, and map "nothing written" to an empty 503.
async fn handle(
    app: &App,
    req: http::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Body>, Infallible> {
    let (mut parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(empty(StatusCode::BAD_REQUEST));
        }
    };
    parts.extensions.insert(RemoteAddr(remote_addr));

    let resp = app
        .dispatch(http::Request::from_parts(parts, body))
        .await
        .unwrap_or_else(|| empty(StatusCode::SERVICE_UNAVAILABLE));
    Ok(resp)
}

fn empty(status: StatusCode) -> http::Response<Body> {
    let mut resp = http::Response::new(full(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or SIGINT (Ctrl-C). Windows only has Ctrl-C.
///
/// If a handler cannot be installed its arm never resolves, leaving the
/// other one in charge.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use crate::health;

    /// Send one request on `stream` and read until `expected` ends the reply.
    async fn exchange(stream: &mut TcpStream, path: &str, expected: &[u8]) -> Vec<u8> {
        let request = format!("GET {path} HTTP/1.1\r\nhost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut reply = Vec::new();
        let mut chunk = [0u8; 1024];
        while !reply.ends_with(expected) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early: {}", String::from_utf8_lossy(&reply));
            reply.extend_from_slice(&chunk[..n]);
        }
        reply
    }

    #[tokio::test]
    async fn shutdown_closes_idle_keep_alive_connections() {
        let mut app = App::new();
        app.get("/healthz", health::liveness).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(run(listener, Arc::new(app), async {
            let _ = stopped.await;
        }));

        // One request, then the socket stays open and idle.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = exchange(&mut client, "/healthz", b"ok").await;
        assert!(reply.starts_with(b"HTTP/1.1 200"));

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server must not wait on idle connections")
            .unwrap();

        // The server closed its end.
        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn canceled_dispatch_is_answered_with_empty_503() {
        let mut app = App::new();
        app.get("/gone", |ctx: crate::Context, _req: crate::Request| async move {
            ctx.cancel();
            "unused"
        })
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(run(listener, Arc::new(app), async {
            let _ = stopped.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = exchange(&mut client, "/gone", b"\r\n\r\n").await;
        assert!(reply.starts_with(b"HTTP/1.1 503"));

        stop.send(()).unwrap();
        server.await.unwrap();
    }
}
