//! The response writer: encoder in, one committed response out.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tracing::Level;

use crate::context::Context;
use crate::encoder::{BoxEncoder, Encoded};
use crate::error::RespondError;

/// Encode `encoder` and commit it to the request's sink.
///
/// Returns the status that was written. On an encoding failure (an `Err`
/// from the encoder, a panic inside it, or an unusable content type) a
/// generic `500` is written instead and the cause is logged; the client
/// never sees it.
///
/// # Errors
///
/// - [`RespondError::Cancelled`] if the request was canceled first.
///   Nothing is written.
/// - [`RespondError::AlreadyWritten`] on any call after the first.
pub fn respond(ctx: &Context, encoder: BoxEncoder) -> Result<StatusCode, RespondError> {
    if ctx.is_cancelled() {
        return Err(RespondError::Cancelled);
    }
    if ctx.sink().is_committed() {
        return Err(RespondError::AlreadyWritten);
    }

    let (status, headers, body) = match encode(encoder).and_then(finish) {
        Ok(parts) => parts,
        Err(cause) => {
            ctx.log(Level::ERROR, "response encoding failed", &[("error", cause)]);
            internal_error()
        }
    };

    ctx.sink().write(status, headers, body)?;
    Ok(status)
}

/// Run every encoder hook under one unwind guard: a panic in `status`,
/// `headers` or `encode` is an encoding failure like an `Err` is.
fn encode(encoder: BoxEncoder) -> Result<(StatusCode, HeaderMap, Encoded), String> {
    let run = AssertUnwindSafe(move || {
        let status = encoder.status();
        let mut headers = HeaderMap::new();
        encoder.headers(&mut headers);
        encoder.encode().map(|out| (status, headers, out))
    });
    match catch_unwind(run) {
        Ok(Ok(parts)) => Ok(parts),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("encoder panicked: {}", panic_message(&*panic))),
    }
}

fn finish(
    (status, mut headers, out): (StatusCode, HeaderMap, Encoded),
) -> Result<(StatusCode, HeaderMap, Bytes), String> {
    if let Some(content_type) = out.content_type {
        let value = HeaderValue::from_str(&content_type)
            .map_err(|e| format!("content type `{content_type}`: {e}"))?;
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok((status, headers, out.body))
}

fn internal_error() -> (StatusCode, HeaderMap, Bytes) {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        headers,
        Bytes::from_static(b"Internal Server Error"),
    )
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
