//! # HTTP Response
//!
//! The canonical response type every view return value is coerced into.

use crate::environ::Environ;
use crate::error::{Error, Result};
use crate::exceptions::reason_phrase;
use crate::wsgi::{StartResponse, WsgiApp};
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;

/// Default mimetype of text responses
pub const DEFAULT_MIMETYPE: &str = "text/html; charset=utf-8";

/// Cookie date format (RFC 7231 IMF-fixdate)
const COOKIE_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(Bytes::new())
    }
}

impl Response {
    /// Create a 200 response with the default mimetype
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_MIMETYPE));
        Self {
            status: 200,
            headers,
            body: body.into(),
        }
    }

    /// Create a response with a status and initial headers
    ///
    /// A `Content-Type` among `headers` replaces the default mimetype.
    #[must_use]
    pub fn with_parts(body: impl Into<Bytes>, status: u16, headers: &[(String, String)]) -> Self {
        let mut response = Self::new(body).with_status(status);
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("content-type") {
                response.set_header(name, value);
            } else {
                response.add_header(name, value);
            }
        }
        response
    }

    /// Create a plain text response
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(body.into()).with_content_type("text/plain; charset=utf-8")
    }

    /// Set status code
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set or override a header
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    /// Set the Content-Type header
    #[must_use]
    pub fn with_content_type(self, content_type: &str) -> Self {
        self.with_header("Content-Type", content_type)
    }

    /// Status code
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Change the status code
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Status line, e.g. "404 NOT FOUND"
    #[must_use]
    pub fn status_line(&self) -> String {
        format!("{} {}", self.status, reason_phrase(self.status).to_uppercase())
    }

    /// All headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to all headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// First value of a header
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header
    #[must_use]
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Set or override a header; invalid names or values are skipped
    pub fn set_header(&mut self, key: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
    }

    /// Append a header value, keeping existing ones
    pub fn add_header(&mut self, key: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(n, v);
        }
    }

    /// Extend headers from name/value pairs
    pub fn extend_headers(&mut self, headers: &[(String, String)]) {
        for (name, value) in headers {
            self.add_header(name, value);
        }
    }

    /// Content type without parameters
    #[must_use]
    pub fn mimetype(&self) -> String {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_string())
            .unwrap_or_default()
    }

    /// Body bytes
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replace the body
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Body as UTF-8 text
    #[must_use]
    pub fn text_body(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Body parsed as JSON
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the body is not valid JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Add a `Set-Cookie` header
    pub fn set_cookie(&mut self, cookie: &SetCookie) {
        self.add_header("Set-Cookie", &cookie.to_header());
    }

    /// Expire a cookie on the client
    pub fn delete_cookie(&mut self, cookie: SetCookie) {
        let expired = SetCookie {
            value: String::new(),
            max_age: Some(0),
            expires: DateTime::from_timestamp(0, 0),
            ..cookie
        };
        self.set_cookie(&expired);
    }

    /// Add a value to the `Vary` header unless present
    pub fn add_vary(&mut self, value: &str) {
        let present = self
            .header_all("vary")
            .iter()
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(value));
        if !present {
            self.add_header("Vary", value);
        }
    }

    /// Set the `Allow` header
    pub fn set_allow(&mut self, methods: &[String]) {
        self.set_header("Allow", &methods.join(", "));
    }

    /// Headers as owned pairs, in gateway order
    #[must_use]
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect()
    }

    /// Adapt any gateway application into a response by calling it
    ///
    /// # Errors
    ///
    /// Propagates the application's failure; a status line without a numeric
    /// code is `Error::InvalidResponse`.
    pub fn force_type(app: &dyn WsgiApp, environ: &Environ) -> Result<Self> {
        let mut status_line = String::new();
        let mut headers = Vec::new();
        let chunks = app.call(environ, &mut |status, hdrs| {
            status_line = status.to_string();
            headers = hdrs.to_vec();
        })?;

        let status = status_line
            .split_whitespace()
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                Error::InvalidResponse(format!("invalid status line '{status_line}'"))
            })?;

        let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        let mut response = Self::new(body).with_status(status);
        response.headers.clear();
        response.extend_headers(&headers);
        Ok(response)
    }

    /// Whether the body is suppressed on the wire
    fn bodyless(&self, method: &str) -> bool {
        method == "HEAD" || self.status == 204 || self.status == 304 || self.status < 200
    }

    /// Convert to a hyper response for the development server
    pub(crate) fn into_hyper(self, method: &str) -> hyper::Response<Full<Bytes>> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = if self.bodyless(method) {
            Bytes::new()
        } else {
            self.body
        };
        let mut response = hyper::Response::new(Full::new(body));
        *response.status_mut() = status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl WsgiApp for Response {
    fn call(
        &self,
        environ: &Environ,
        start_response: &mut StartResponse<'_>,
    ) -> Result<Vec<Bytes>> {
        let mut headers = self.header_pairs();
        let bodyless = self.bodyless(&environ.method);
        if !bodyless && !self.headers.contains_key("content-length") {
            headers.push(("Content-Length".to_string(), self.body.len().to_string()));
        }
        start_response(&self.status_line(), &headers);
        if bodyless {
            Ok(Vec::new())
        } else {
            Ok(vec![self.body.clone()])
        }
    }
}

/// Attributes of a `Set-Cookie` header
#[derive(Debug, Clone, Default)]
pub struct SetCookie {
    /// Cookie name
    pub key: String,
    /// Cookie value
    pub value: String,
    /// Lifetime in seconds
    pub max_age: Option<i64>,
    /// Absolute expiry
    pub expires: Option<DateTime<Utc>>,
    /// Path scope
    pub path: Option<String>,
    /// Domain scope
    pub domain: Option<String>,
    /// Only sent over HTTPS
    pub secure: bool,
    /// Hidden from scripts
    pub httponly: bool,
    /// `SameSite` policy
    pub samesite: Option<String>,
}

impl SetCookie {
    /// Cookie with path `/`
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            path: Some("/".to_string()),
            ..Self::default()
        }
    }

    /// Render the header value
    #[must_use]
    pub fn to_header(&self) -> String {
        let value = if self
            .value
            .chars()
            .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | ',' | ';' | '\\'))
        {
            self.value.clone()
        } else {
            format!("\"{}\"", self.value.replace('\\', "\\\\").replace('"', "\\\""))
        };
        let mut parts = vec![format!("{}={}", self.key, value)];
        if let Some(domain) = &self.domain {
            parts.push(format!("Domain={domain}"));
        }
        if let Some(expires) = &self.expires {
            parts.push(format!("Expires={}", expires.format(COOKIE_DATE_FORMAT)));
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("Max-Age={max_age}"));
        }
        if self.secure {
            parts.push("Secure".to_string());
        }
        if self.httponly {
            parts.push("HttpOnly".to_string());
        }
        if let Some(path) = &self.path {
            parts.push(format!("Path={path}"));
        }
        if let Some(samesite) = &self.samesite {
            parts.push(format!("SameSite={samesite}"));
        }
        parts.join("; ")
    }
}

/// Redirect response
#[must_use]
pub fn redirect(location: &str, code: u16) -> Response {
    let escaped = crate::exceptions::escape_html(location);
    let body = format!(
        "<!doctype html>\n<html lang=en>\n<title>Redirecting...</title>\n\
         <h1>Redirecting...</h1>\n<p>You should be redirected automatically to the target \
         URL: <a href=\"{escaped}\">{escaped}</a>. If not, click the link.\n"
    );
    Response::new(body)
        .with_status(code)
        .with_header("Location", location)
}
