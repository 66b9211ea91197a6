//! The [`Encoder`] contract and the built-in encoders.
//!
//! A handler never writes to the connection. It returns a value, and that
//! value knows how to become bytes plus a content type. The dispatch layer
//! does the actual write exactly once, which is what lets it capture the
//! status for tracing and logging.
//!
//! ```rust
//! use gantry::{Context, Encoder, HttpError, Json, Request};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct User { id: u64, name: &'static str }
//!
//! async fn get_user(_ctx: Context, req: Request) -> Result<Json<User>, HttpError> {
//!     match req.param("id") {
//!         Some("1") => Ok(Json(User { id: 1, name: "alice" })),
//!         _ => Err(HttpError::not_found()),
//!     }
//! }
//! ```

use std::borrow::Cow;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;

use crate::error::EncodeError;

// ── Contract ─────────────────────────────────────────────────────────────────

/// The bytes and content type an [`Encoder`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub body: Bytes,
    /// `None` only for bodiless responses (204, 304, status-only replies).
    pub content_type: Option<Cow<'static, str>>,
}

impl Encoded {
    pub fn new(content_type: impl Into<Cow<'static, str>>, body: impl Into<Bytes>) -> Self {
        Self { body: body.into(), content_type: Some(content_type.into()) }
    }

    pub fn empty() -> Self {
        Self { body: Bytes::new(), content_type: None }
    }
}

/// A value that knows how to become an HTTP response body.
///
/// `status` and `headers` are read before `encode` consumes the value.
pub trait Encoder: Send + 'static {
    /// Status to write. `200 OK` unless the encoder says otherwise.
    fn status(&self) -> StatusCode {
        StatusCode::OK
    }

    /// Extra headers beyond `content-type`, e.g. `location` or `last-modified`.
    fn headers(&self, _headers: &mut HeaderMap) {}

    /// Produce the body. A failure here becomes a generic 500.
    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError>;
}

/// A type-erased encoder, as returned by every handler in a chain.
pub type BoxEncoder = Box<dyn Encoder>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`ResponseBuilder::bytes`].
#[derive(Clone, Copy, Debug)]
pub enum ContentType {
    Css,
    Csv,
    EventStream,
    Html,
    JavaScript,
    Json,
    OctetStream,
    Text,
    Xml,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Css         => "text/css; charset=utf-8",
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::Html        => "text/html; charset=utf-8",
            Self::JavaScript  => "text/javascript; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// A fully-specified response value: status, headers and a typed body.
///
/// ```rust
/// use gantry::{ContentType, Response};
/// use http::{header, HeaderValue, StatusCode};
///
/// Response::json(br#"{"id":1}"#.to_vec());
/// Response::text("hello");
/// Response::status(StatusCode::NO_CONTENT);
///
/// Response::builder()
///     .status(StatusCode::CREATED)
///     .header(header::LOCATION, HeaderValue::from_static("/users/42"))
///     .bytes(ContentType::Xml, b"<ok/>".to_vec());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    encoded: Encoded,
}

impl Response {
    /// `200 OK`, `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::builder().bytes(ContentType::Json, body)
    }

    /// `200 OK`, `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// `200 OK`, `text/html; charset=utf-8`.
    pub fn html(body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::builder().bytes(ContentType::Html, body)
    }

    /// Response with no body.
    pub fn status(code: StatusCode) -> Self {
        Self::builder().status(code).no_body()
    }

    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: HeaderMap::new(), status: StatusCode::OK }
    }
}

impl Encoder for Response {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }
    }

    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        Ok(self.encoded)
    }
}

/// Fluent builder for [`Response`]. Defaults to `200 OK`.
///
/// Terminated by a typed body method, so you always know what you're sending.
pub struct ResponseBuilder {
    headers: HeaderMap,
    status: StatusCode,
}

impl ResponseBuilder {
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.bytes(ContentType::Json, body)
    }

    pub fn text(self, body: impl Into<String>) -> Response {
        let body: String = body.into();
        self.bytes(ContentType::Text, body)
    }

    pub fn bytes(self, content_type: ContentType, body: impl Into<Bytes>) -> Response {
        self.finish(Encoded::new(content_type.as_str(), body))
    }

    /// Terminate with an arbitrary content type, e.g. one guessed from a file name.
    pub fn typed(self, content_type: impl Into<Cow<'static, str>>, body: impl Into<Bytes>) -> Response {
        self.finish(Encoded::new(content_type, body))
    }

    /// Terminate with no body (`204`, `304`, redirects).
    pub fn no_body(self) -> Response {
        self.finish(Encoded::empty())
    }

    fn finish(self, encoded: Encoded) -> Response {
        Response { status: self.status, headers: self.headers, encoded }
    }
}

// ── Typed body encoders ───────────────────────────────────────────────────────

/// `text/plain` body with status 200.
pub struct Text(pub String);

impl Encoder for Text {
    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        Ok(Encoded::new(ContentType::Text.as_str(), self.0))
    }
}

/// `text/html` body with status 200.
pub struct Html(pub String);

impl Encoder for Html {
    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        Ok(Encoded::new(ContentType::Html.as_str(), self.0))
    }
}

/// Serializes `T` with serde_json. Serialization failure becomes a 500.
pub struct Json<T>(pub T);

impl<T: Serialize + Send + 'static> Encoder for Json<T> {
    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        let body = serde_json::to_vec(&self.0)?;
        Ok(Encoded::new(ContentType::Json.as_str(), body))
    }
}

// ── HttpError ─────────────────────────────────────────────────────────────────

/// An error status with a short plain-text message.
///
/// This is how handlers report "not found", "bad request" and friends: it is
/// just another encoder, so the response writer treats it like any other.
#[derive(Debug, Clone)]
pub struct HttpError {
    status: StatusCode,
    message: Cow<'static, str>,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn not_found() -> Self {
        Self::canonical(StatusCode::NOT_FOUND)
    }

    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden() -> Self {
        Self::canonical(StatusCode::FORBIDDEN)
    }

    /// Generic 500. Never carries the underlying cause.
    pub fn internal() -> Self {
        Self::canonical(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn canonical(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason().unwrap_or(""))
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl Encoder for HttpError {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        Ok(Encoded::new(ContentType::Text.as_str(), self.message.into_owned()))
    }
}

// ── Blanket-ish conversions ───────────────────────────────────────────────────

impl Encoder for &'static str {
    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        let text: &'static str = *self;
        Ok(Encoded::new(ContentType::Text.as_str(), Bytes::from_static(text.as_bytes())))
    }
}

impl Encoder for String {
    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        Ok(Encoded::new(ContentType::Text.as_str(), *self))
    }
}

/// Return a bare status from a handler: `return StatusCode::NO_CONTENT`.
impl Encoder for StatusCode {
    fn status(&self) -> StatusCode {
        *self
    }

    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        Ok(Encoded::empty())
    }
}

impl<T: Encoder, E: Encoder> Encoder for Result<T, E> {
    fn status(&self) -> StatusCode {
        match self {
            Ok(t) => t.status(),
            Err(e) => e.status(),
        }
    }

    fn headers(&self, headers: &mut HeaderMap) {
        match self {
            Ok(t) => t.headers(headers),
            Err(e) => e.headers(headers),
        }
    }

    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        match *self {
            Ok(t) => Box::new(t).encode(),
            Err(e) => Box::new(e).encode(),
        }
    }
}

/// Lets handlers and middleware pass an already-erased encoder through.
impl Encoder for BoxEncoder {
    fn status(&self) -> StatusCode {
        (**self).status()
    }

    fn headers(&self, headers: &mut HeaderMap) {
        (**self).headers(headers)
    }

    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        (*self).encode()
    }
}

/// Placeholder returned by raw handlers, whose response is already in the sink.
pub(crate) struct Committed;

impl Encoder for Committed {
    fn encode(self: Box<Self>) -> Result<Encoded, EncodeError> {
        Ok(Encoded::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use http::header;

    fn encode<E: Encoder>(e: E) -> (StatusCode, Encoded) {
        let status = e.status();
        (status, Box::new(e).encode().unwrap())
    }

    #[test]
    fn str_encodes_as_plain_text_200() {
        let (status, out) = encode("Hello, World!");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out.body.as_ref(), b"Hello, World!");
        assert_eq!(out.content_type.as_deref(), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn json_serializes_value() {
        let mut map = BTreeMap::new();
        map.insert("id", 7);
        let (status, out) = encode(Json(map));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out.body.as_ref(), br#"{"id":7}"#);
        assert_eq!(out.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn http_error_carries_status_and_reason() {
        let (status, out) = encode(HttpError::not_found());
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(out.body.as_ref(), b"Not Found");
    }

    #[test]
    fn result_delegates_to_active_variant() {
        let ok: Result<&'static str, HttpError> = Ok("fine");
        let err: Result<&'static str, HttpError> = Err(HttpError::bad_request("no name"));
        assert_eq!(encode(ok).0, StatusCode::OK);
        let (status, out) = encode(err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(out.body.as_ref(), b"no name");
    }

    #[test]
    fn builder_keeps_status_and_extra_headers() {
        let resp = Response::builder()
            .status(StatusCode::CREATED)
            .header(header::LOCATION, HeaderValue::from_static("/users/42"))
            .json(r#"{"id":42}"#);

        let mut headers = HeaderMap::new();
        resp.headers(&mut headers);
        assert_eq!(headers[header::LOCATION], "/users/42");

        let (status, out) = encode(resp);
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(out.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn bare_status_has_no_body_or_content_type() {
        let (status, out) = encode(StatusCode::NO_CONTENT);
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(out, Encoded::empty());
    }
}
