//! # HTTP Request
//!
//! Request wrapper over the gateway environment. Query string and cookies are
//! parsed up front; routing results are written by the request context and
//! read by the dispatcher.

use crate::environ::Environ;
use crate::error::{Error, Result};
use crate::exceptions::HttpException;
use crate::json::parse_json_bytes;
use crate::route::Rule;
use crate::types::ViewArgs;
use hyper::body::Bytes;
use hyper::HeaderMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct RouteState {
    url_rule: Option<Arc<Rule>>,
    view_args: Option<ViewArgs>,
    routing_exception: Option<Error>,
}

/// Incoming request
#[derive(Debug)]
pub struct Request {
    environ: Environ,
    args: IndexMap<String, Vec<String>>,
    cookies: HashMap<String, String>,
    route: RwLock<RouteState>,
    closed: AtomicBool,
}

impl Request {
    /// Wrap a gateway environment
    #[must_use]
    pub fn new(environ: Environ) -> Self {
        let args = parse_query_string(&environ.query_string);
        let cookies = parse_cookies(&environ.headers);
        Self {
            environ,
            args,
            cookies,
            route: RwLock::new(RouteState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// The gateway environment
    #[must_use]
    pub const fn environ(&self) -> &Environ {
        &self.environ
    }

    /// Upper-case HTTP method
    #[must_use]
    pub fn method(&self) -> &str {
        &self.environ.method
    }

    /// Path below the mount point
    #[must_use]
    pub fn path(&self) -> &str {
        &self.environ.path_info
    }

    /// Path plus query string
    #[must_use]
    pub fn full_path(&self) -> String {
        format!("{}?{}", self.path(), self.environ.query_string)
    }

    /// Mount point of the application
    #[must_use]
    pub fn script_root(&self) -> &str {
        &self.environ.script_name
    }

    /// `scheme://host/`
    #[must_use]
    pub fn host_url(&self) -> String {
        format!("{}://{}/", self.environ.url_scheme, self.environ.host())
    }

    /// Full URL without the query string
    #[must_use]
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}{}{}",
            self.environ.url_scheme,
            self.environ.host(),
            self.environ.script_name,
            self.path()
        )
    }

    /// Full URL including the query string
    #[must_use]
    pub fn url(&self) -> String {
        if self.environ.query_string.is_empty() {
            self.base_url()
        } else {
            format!("{}?{}", self.base_url(), self.environ.query_string)
        }
    }

    /// Decoded query arguments; repeated keys keep every value
    #[must_use]
    pub const fn args(&self) -> &IndexMap<String, Vec<String>> {
        &self.args
    }

    /// First value of a query argument
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Request headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.environ.headers
    }

    /// Header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.environ.header(name)
    }

    /// Request cookies
    #[must_use]
    pub const fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// Cookie value by name
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Raw body
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.environ.body
    }

    /// Body as UTF-8 text
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.environ.body).ok()
    }

    /// Client address
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.environ.remote_addr.as_deref()
    }

    /// Content type without parameters
    #[must_use]
    pub fn mimetype(&self) -> String {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_lowercase())
            .unwrap_or_default()
    }

    /// Whether the body is declared as JSON
    #[must_use]
    pub fn is_json(&self) -> bool {
        let mt = self.mimetype();
        mt == "application/json" || (mt.starts_with("application/") && mt.ends_with("+json"))
    }

    /// Parse the body as JSON
    ///
    /// # Errors
    ///
    /// Returns a 415 error if the content type is not JSON, a 400 error if the
    /// body does not parse.
    pub fn get_json<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_json() {
            return Err(HttpException::new(415)
                .with_description(
                    "Did not attempt to load JSON data because the request \
                     Content-Type was not 'application/json'.",
                )
                .into());
        }
        let mut bytes = self.environ.body.to_vec();
        parse_json_bytes(&mut bytes)
    }

    /// Enforce the configured body size limit
    ///
    /// # Errors
    ///
    /// Returns a 413 error when the body is larger than `limit`.
    pub fn check_content_length(&self, limit: Option<usize>) -> Result<()> {
        match limit {
            Some(limit) if self.environ.body.len() > limit => {
                Err(HttpException::payload_too_large().into())
            }
            _ => Ok(()),
        }
    }

    /// Matched rule
    #[must_use]
    pub fn url_rule(&self) -> Option<Arc<Rule>> {
        self.route.read().url_rule.clone()
    }

    /// Matched view arguments
    #[must_use]
    pub fn view_args(&self) -> Option<ViewArgs> {
        self.route.read().view_args.clone()
    }

    /// Routing failure captured during matching
    #[must_use]
    pub fn routing_exception(&self) -> Option<Error> {
        self.route.read().routing_exception.clone()
    }

    /// Endpoint of the matched rule
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.route.read().url_rule.as_ref().map(|r| r.endpoint.clone())
    }

    /// Blueprint owning the matched endpoint
    #[must_use]
    pub fn blueprint(&self) -> Option<String> {
        self.endpoint()
            .and_then(|ep| ep.rsplit_once('.').map(|(bp, _)| bp.to_string()))
    }

    pub(crate) fn set_match(&self, rule: Arc<Rule>, view_args: ViewArgs) {
        let mut route = self.route.write();
        route.url_rule = Some(rule);
        route.view_args = Some(view_args);
    }

    pub(crate) fn set_routing_exception(&self, error: Error) {
        self.route.write().routing_exception = Some(error);
    }

    /// Release request resources; idempotent
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether `close` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Parse a query string into ordered multi-valued arguments
fn parse_query_string(query: &str) -> IndexMap<String, Vec<String>> {
    let mut args: IndexMap<String, Vec<String>> = IndexMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        args.entry(url_decode(key)).or_default().push(url_decode(value));
    }
    args
}

/// Decode `+` and percent escapes
fn url_decode(s: &str) -> String {
    let s = s.replace('+', " ");
    urlencoding::decode(&s).map_or(s.clone(), std::borrow::Cow::into_owned)
}

/// Parse every `Cookie` header into a map
fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(hyper::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            let v = v.trim().trim_matches('"');
            Some((k.trim().to_string(), url_decode(v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamValue;

    #[test]
    fn test_parse_query_string_simple() {
        let result = parse_query_string("page=1&limit=10&tag=a&tag=b");
        assert_eq!(result.get("page"), Some(&vec!["1".to_string()]));
        assert_eq!(result.get("tag").map(Vec::len), Some(2));
    }

    #[test]
    fn test_parse_query_string_url_encoded() {
        let result = parse_query_string("name=John+Doe&city=New%20York");
        assert_eq!(result.get("name"), Some(&vec!["John Doe".to_string()]));
        assert_eq!(result.get("city"), Some(&vec!["New York".to_string()]));
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("100%25"), "100%");
    }

    #[test]
    fn test_cookies() {
        let environ = Environ::builder("/")
            .header("Cookie", "session=abc; theme=dark")
            .build();
        let request = Request::new(environ);
        assert_eq!(request.cookie("session"), Some("abc"));
        assert_eq!(request.cookie("theme"), Some("dark"));
    }

    #[test]
    fn test_get_json() {
        let environ = Environ::builder("/")
            .json(&serde_json::json!({"a": 1}))
            .build();
        let request = Request::new(environ);
        let value: serde_json::Value = request.get_json().unwrap();
        assert_eq!(value["a"], 1);

        let request = Request::new(Environ::builder("/").body("{}").build());
        let err = request.get_json::<serde_json::Value>().unwrap_err();
        assert_eq!(err.code(), Some(415));
    }

    #[test]
    fn test_content_length_limit() {
        let request = Request::new(Environ::builder("/").body("0123456789").build());
        assert!(request.check_content_length(Some(100)).is_ok());
        assert_eq!(request.check_content_length(Some(4)).unwrap_err().code(), Some(413));
    }

    #[test]
    fn test_blueprint_from_endpoint() {
        let request = Request::new(Environ::builder("/admin/users").build());
        let rule = Rule::new("/admin/users", "admin.users", None).unwrap();
        let mut args = ViewArgs::new();
        args.insert("x".into(), ParamValue::Int(1));
        request.set_match(Arc::new(rule), args);
        assert_eq!(request.endpoint().as_deref(), Some("admin.users"));
        assert_eq!(request.blueprint().as_deref(), Some("admin"));
    }

    #[test]
    fn test_urls() {
        let request = Request::new(
            Environ::builder("/a/b?x=1")
                .script_name("/app")
                .server("example.com", 80)
                .build(),
        );
        assert_eq!(request.url(), "http://example.com/app/a/b?x=1");
        assert_eq!(request.host_url(), "http://example.com/");
        assert_eq!(request.full_path(), "/a/b?x=1");
    }
}
