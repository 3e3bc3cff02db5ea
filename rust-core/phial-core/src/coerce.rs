//! # Response Coercion
//!
//! Views may return many shapes: a finished `Response`, text, bytes, a JSON
//! mapping, a WSGI application, or a tuple adding a status and headers.
//! `make_response` turns any of them into a `Response`.

use crate::config::Config;
use crate::environ::Environ;
use crate::error::{Error, Result};
use crate::json::jsonify;
use crate::response::Response;
use crate::wsgi::WsgiApp;
use hyper::body::Bytes;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Header list as `(name, value)` pairs
pub type Headers = Vec<(String, String)>;

/// Anything a view, a before-request hook or an error handler may return
#[derive(Clone)]
pub enum ViewReturn {
    /// A finished response, used as-is
    Response(Response),
    /// Text body, sent as `text/html`
    Text(String),
    /// Raw body
    Bytes(Bytes),
    /// JSON document; objects and arrays become JSON responses
    Json(Value),
    /// Status code (only meaningful inside a tuple)
    Status(u16),
    /// Header list (only meaningful inside a tuple)
    Headers(Headers),
    /// `(body, status)`, `(body, headers)` or `(body, status, headers)`
    Tuple(Vec<ViewReturn>),
    /// Application called with the request environment
    Wsgi(Arc<dyn WsgiApp>),
    /// Nothing was returned
    None,
}

impl std::fmt::Debug for ViewReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(r) => f.debug_tuple("Response").field(r).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Status(s) => f.debug_tuple("Status").field(s).finish(),
            Self::Headers(h) => f.debug_tuple("Headers").field(h).finish(),
            Self::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Self::Wsgi(app) => f.debug_tuple("Wsgi").field(&app.type_name()).finish(),
            Self::None => f.write_str("None"),
        }
    }
}

impl ViewReturn {
    fn kind(&self) -> &'static str {
        match self {
            Self::Response(_) => "Response",
            Self::Text(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Json(Value::Object(_)) => "dict",
            Self::Json(Value::Array(_)) => "list",
            Self::Json(_) => "JSON scalar",
            Self::Status(_) => "int",
            Self::Headers(_) => "headers",
            Self::Tuple(_) => "tuple",
            Self::Wsgi(app) => app.type_name(),
            Self::None => "None",
        }
    }

    fn is_header_collection(&self) -> bool {
        matches!(self, Self::Headers(_) | Self::Json(Value::Object(_)))
    }
}

impl From<Response> for ViewReturn {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<&str> for ViewReturn {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ViewReturn {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for ViewReturn {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for ViewReturn {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<Value> for ViewReturn {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => Self::None,
            Value::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }
}

impl From<Map<String, Value>> for ViewReturn {
    fn from(m: Map<String, Value>) -> Self {
        Self::Json(Value::Object(m))
    }
}

impl From<u16> for ViewReturn {
    fn from(code: u16) -> Self {
        Self::Status(code)
    }
}

impl From<Headers> for ViewReturn {
    fn from(h: Headers) -> Self {
        Self::Headers(h)
    }
}

impl<T: Into<Self>> From<Option<T>> for ViewReturn {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::None, Into::into)
    }
}

impl<B: Into<Self>> From<(B, u16)> for ViewReturn {
    fn from((body, status): (B, u16)) -> Self {
        Self::Tuple(vec![body.into(), Self::Status(status)])
    }
}

impl<B: Into<Self>> From<(B, Headers)> for ViewReturn {
    fn from((body, headers): (B, Headers)) -> Self {
        Self::Tuple(vec![body.into(), Self::Headers(headers)])
    }
}

impl<B: Into<Self>> From<(B, u16, Headers)> for ViewReturn {
    fn from((body, status, headers): (B, u16, Headers)) -> Self {
        Self::Tuple(vec![body.into(), Self::Status(status), Self::Headers(headers)])
    }
}

fn invalid_type(kind: &str) -> Error {
    Error::InvalidResponse(format!(
        "The view function did not return a valid response. The return type \
         must be a string, dict, list, tuple with headers or status, Response \
         instance, or WSGI callable, but it was a {kind}."
    ))
}

fn to_status(value: ViewReturn) -> Result<u16> {
    match value {
        ViewReturn::Status(code) => Ok(code),
        ViewReturn::Text(s) => s
            .split_whitespace()
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| Error::InvalidResponse(format!("Invalid status '{s}'"))),
        other => Err(Error::InvalidResponse(format!(
            "The status must be an integer or a status line, but it was a {}.",
            other.kind()
        ))),
    }
}

fn to_headers(value: ViewReturn) -> Result<Headers> {
    match value {
        ViewReturn::Headers(h) => Ok(h),
        ViewReturn::Json(Value::Object(map)) => Ok(map
            .into_iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, text)
            })
            .collect()),
        other => Err(Error::InvalidResponse(format!(
            "Headers must be a header list or a mapping, but it was a {}.",
            other.kind()
        ))),
    }
}

/// Convert a view's return value into a `Response`
///
/// # Errors
///
/// Returns `Error::InvalidResponse` for `None`, a tuple of the wrong arity,
/// a bare status or header list, or a WSGI application that fails.
pub fn make_response(config: &Config, environ: &Environ, rv: ViewReturn) -> Result<Response> {
    let (body, status, headers) = match rv {
        ViewReturn::Tuple(items) => {
            let mut items = items.into_iter();
            match (items.next(), items.next(), items.next(), items.next()) {
                (Some(body), Some(status), Some(headers), None) => {
                    (body, Some(to_status(status)?), Some(to_headers(headers)?))
                }
                (Some(body), Some(second), None, None) if second.is_header_collection() => {
                    (body, None, Some(to_headers(second)?))
                }
                (Some(body), Some(second), None, None) => (body, Some(to_status(second)?), None),
                _ => {
                    return Err(Error::InvalidResponse(
                        "The view function did not return a valid response tuple. \
                         The tuple must have the form (body, status, headers), \
                         (body, status), or (body, headers)."
                            .to_string(),
                    ))
                }
            }
        }
        other => (other, None, None),
    };

    let (mut response, status, headers) = match body {
        ViewReturn::None => {
            return Err(Error::InvalidResponse(
                "The view function did not return a valid response. The \
                 function either returned None or ended without a return \
                 statement."
                    .to_string(),
            ))
        }
        ViewReturn::Response(r) => (r, status, headers),
        ViewReturn::Text(s) => (
            Response::with_parts(s, status.unwrap_or(200), headers.as_deref().unwrap_or(&[])),
            None,
            None,
        ),
        ViewReturn::Bytes(b) => (
            Response::with_parts(b, status.unwrap_or(200), headers.as_deref().unwrap_or(&[])),
            None,
            None,
        ),
        ViewReturn::Json(v @ (Value::Object(_) | Value::Array(_))) => {
            (jsonify(&v, config)?, status, headers)
        }
        ViewReturn::Wsgi(app) => {
            let r = Response::force_type(app.as_ref(), environ).map_err(|e| {
                Error::InvalidResponse(format!(
                    "{e}\nThe view function did not return a valid response. The \
                     return type must be a string, dict, list, tuple with headers \
                     or status, Response instance, or WSGI callable, but it was a {}.",
                    app.type_name()
                ))
            })?;
            (r, status, headers)
        }
        other => return Err(invalid_type(other.kind())),
    };

    if let Some(status) = status {
        response.set_status(status);
    }
    if let Some(headers) = headers {
        response.extend_headers(&headers);
    }
    Ok(response)
}
