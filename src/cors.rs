//! CORS: preflight answers and allow-origin injection.
//!
//! Disabled unless at least one origin is configured. When enabled:
//!
//! - every `OPTIONS` request is a preflight and is answered here, before
//!   routing, tracing or middleware;
//! - every other request whose `Origin` is allowed gets
//!   `Access-Control-Allow-Origin` queued on its sink before the handler
//!   runs, so it goes out with the rest of the headers.

use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tracing::debug;

use crate::context::Context;
use crate::error::Error;
use crate::request::Request;
use crate::server::{Body, full};

const DEFAULT_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const DEFAULT_HEADERS: &str = "Content-Type, Authorization";

/// Validated CORS configuration.
#[derive(Clone, Debug)]
pub struct Cors {
    any_origin: bool,
    origins: Vec<String>,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    max_age: Option<u64>,
}

impl Cors {
    /// Build from an origin list. `*` allows any origin.
    ///
    /// Returns `Ok(None)` for an empty list: CORS stays off entirely.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOrigin`] for anything that is not `*` or
    /// `http(s)://host[:port]`.
    pub fn new<I, S>(origins: I) -> Result<Option<Self>, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let origins: Vec<String> = origins.into_iter().map(Into::into).collect();
        if origins.is_empty() {
            return Ok(None);
        }
        for origin in &origins {
            validate_origin(origin)?;
        }

        Ok(Some(Self {
            any_origin: origins.iter().any(|o| o == "*"),
            origins: origins.into_iter().filter(|o| o != "*").collect(),
            allow_methods: HeaderValue::from_static(DEFAULT_METHODS),
            allow_headers: HeaderValue::from_static(DEFAULT_HEADERS),
            max_age: None,
        }))
    }

    pub fn allow_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        let list = methods.into_iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ");
        if let Ok(value) = HeaderValue::from_str(&list) {
            self.allow_methods = value;
        }
        self
    }

    /// # Errors
    ///
    /// [`Error::Config`] if a header name is not a valid header value.
    pub fn allow_headers<I, S>(mut self, headers: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = headers.into_iter()
            .map(|h| h.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join(", ");
        self.allow_headers = HeaderValue::from_str(&list)
            .map_err(|_| Error::Config(format!("invalid CORS header list `{list}`")))?;
        Ok(self)
    }

    /// Let browsers cache the preflight answer for `seconds`.
    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.any_origin || self.origins.iter().any(|o| o == origin)
    }

    /// `Access-Control-Allow-Origin` value for `origin`, if allowed.
    fn allow_origin(&self, origin: &str) -> Option<HeaderValue> {
        if self.any_origin {
            return Some(HeaderValue::from_static("*"));
        }
        if self.allows(origin) {
            return HeaderValue::from_str(origin).ok();
        }
        None
    }

    /// Answer a preflight: `204` with the allow headers, or `403`.
    pub(crate) fn preflight(&self, req: &Request) -> http::Response<Body> {
        let origin = req.header("origin").unwrap_or_default();
        let Some(allow_origin) = self.allow_origin(origin) else {
            debug!(origin, path = req.path(), "CORS preflight rejected");
            return response(StatusCode::FORBIDDEN, HeaderMap::new());
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        if let Some(age) = self.max_age {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(age));
        }
        if !self.any_origin {
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        response(StatusCode::NO_CONTENT, headers)
    }

    /// Queue the allow-origin header for a normal request from an allowed origin.
    pub(crate) fn inject(&self, ctx: &Context, req: &Request) {
        let Some(origin) = req.header("origin") else { return };
        if let Some(value) = self.allow_origin(origin) {
            ctx.sink().insert_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            if !self.any_origin {
                ctx.sink().insert_header(header::VARY, HeaderValue::from_static("Origin"));
            }
        }
    }
}

pub(crate) fn is_preflight(method: &Method) -> bool {
    method == Method::OPTIONS
}

fn response(status: StatusCode, headers: HeaderMap) -> http::Response<Body> {
    let mut resp = http::Response::new(full(bytes::Bytes::new()));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

/// `*`, or `scheme://host[:port]` with scheme http/https and nothing after.
fn validate_origin(origin: &str) -> Result<(), Error> {
    if origin == "*" {
        return Ok(());
    }
    let invalid = || Error::InvalidOrigin(origin.to_owned());

    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .ok_or_else(invalid)?;
    if rest.is_empty() || rest.contains(['/', '?', '#', '*', ' ']) {
        return Err(invalid());
    }
    origin.parse::<http::Uri>().map_err(|_| invalid())?;
    Ok(())
}
