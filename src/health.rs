//! Health-check handlers for orchestrator probes.
//!
//! | Probe | Typical path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can it take traffic? Failure → pulled from the load balancer. |
//!
//! ```rust
//! use gantry::{App, health};
//!
//! let mut app = App::new();
//! app.get("/healthz", health::liveness).unwrap();
//! app.get("/readyz", health::readiness).unwrap();
//! ```
//!
//! Replace `readiness` with your own handler to gate on dependencies:
//!
//! ```rust
//! use gantry::{Context, HttpError, Request};
//!
//! async fn readiness(_ctx: Context, _req: Request) -> Result<&'static str, HttpError> {
//!     if database_is_reachable().await {
//!         Ok("ready")
//!     } else {
//!         Err(HttpError::new(http::StatusCode::SERVICE_UNAVAILABLE, "database unreachable"))
//!     }
//! }
//!
//! async fn database_is_reachable() -> bool { true }
//! ```

use crate::context::Context;
use crate::request::Request;

/// Always `200 ok`. Deliberately has no dependencies.
pub async fn liveness(_ctx: Context, _req: Request) -> &'static str {
    "ok"
}

/// Default readiness probe: `200 ready`.
pub async fn readiness(_ctx: Context, _req: Request) -> &'static str {
    "ready"
}
