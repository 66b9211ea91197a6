//! A small service: a JSON API, health probes, and a single-page app.
//!
//! Run with:
//!   GANTRY_CORS_ORIGINS=http://localhost:5173 cargo run --example hello
//!
//! Try:
//!   curl http://localhost:3000/api/v1/hello
//!   curl http://localhost:3000/api/v1/users/42
//!   curl -X OPTIONS -H 'origin: http://localhost:5173' -i http://localhost:3000/api/v1/hello
//!   curl http://localhost:3000/app/dashboard      # → index.html
//!   curl -i http://localhost:3000/app/missing.js  # → 404
//!   curl http://localhost:3000/healthz

use std::time::Duration;

use gantry::{App, Config, Context, HttpError, Json, MemoryFs, Request, Server, health, middleware};
use http::Method;
use serde::Serialize;
use tracing::Level;

#[derive(Serialize)]
struct User {
    id: u64,
    name: &'static str,
}

#[tokio::main]
async fn main() -> Result<(), gantry::Error> {
    let config = Config::from_env()?;
    gantry::init_logging(&config)?;

    let assets = MemoryFs::new()
        .with_file("dist/index.html", "<!doctype html><div id=\"root\"></div><script src=\"/app/app.js\"></script>")
        .with_file("dist/app.js", "document.getElementById('root').textContent = 'hello';");

    let mut app = App::from_config(&config)?;
    app.use_middleware(middleware::trace_header())?;

    app.get("/healthz", health::liveness)?
        .get("/readyz", health::readiness)?;

    app.register(Method::GET, "/api/v1", "/hello", hello, &[])?
        .register(Method::GET, "/api/v1", "/users/{id}", get_user, &[middleware::timeout(Duration::from_secs(2))])?;

    app.file_server_spa(assets, "dist", "/app")?;

    Server::from_config(&config).serve(app).await
}

async fn hello(_ctx: Context, _req: Request) -> &'static str {
    "Hello, World!"
}

async fn get_user(ctx: Context, req: Request) -> Result<Json<User>, HttpError> {
    let id: u64 = req
        .param("id")
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| HttpError::bad_request("id must be a number"))?;

    ctx.log_field("user_id", id.to_string());
    if id == 0 {
        ctx.log(Level::WARN, "lookup of reserved user id", &[]);
        return Err(HttpError::not_found());
    }
    Ok(Json(User { id, name: "alice" }))
}
