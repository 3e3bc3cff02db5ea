//! # Request Environment
//!
//! The gateway-level description of one request: what the server saw on the
//! wire, before any framework interpretation.

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};

/// Gateway environment for one request
#[derive(Debug, Clone)]
pub struct Environ {
    /// Upper-case request method
    pub method: String,
    /// Mount point of the application (no trailing slash)
    pub script_name: String,
    /// Path below the mount point
    pub path_info: String,
    /// Raw query string without the leading `?`
    pub query_string: String,
    /// "http" or "https"
    pub url_scheme: String,
    /// Server host name
    pub server_name: String,
    /// Server port
    pub server_port: u16,
    /// Client address
    pub remote_addr: Option<String>,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
    /// Keep the request context alive after the response for inspection
    pub preserve_context: bool,
}

impl Default for Environ {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            script_name: String::new(),
            path_info: "/".to_string(),
            query_string: String::new(),
            url_scheme: "http".to_string(),
            server_name: "localhost".to_string(),
            server_port: 80,
            remote_addr: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            preserve_context: false,
        }
    }
}

impl Environ {
    /// Start building an environment for a path (a query string may be included)
    #[must_use]
    pub fn builder(path: &str) -> EnvironBuilder {
        EnvironBuilder::new(path)
    }

    /// Host as sent by the client, else `server_name[:port]`
    #[must_use]
    pub fn host(&self) -> String {
        if let Some(host) = self
            .headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
        {
            return host.to_string();
        }
        let default_port = matches!(
            (self.url_scheme.as_str(), self.server_port),
            ("http", 80) | ("https", 443)
        );
        if default_port {
            self.server_name.clone()
        } else {
            format!("{}:{}", self.server_name, self.server_port)
        }
    }

    /// Header value by name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Builder for `Environ`, used by the test client and in tests
#[derive(Debug, Clone)]
pub struct EnvironBuilder {
    environ: Environ,
}

impl EnvironBuilder {
    /// Create a builder for a path (a query string may be included)
    #[must_use]
    pub fn new(path: &str) -> Self {
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            environ: Environ {
                path_info: path,
                query_string: query.to_string(),
                ..Environ::default()
            },
        }
    }

    /// Set the request method
    #[must_use]
    pub fn method(mut self, method: &str) -> Self {
        self.environ.method = method.to_uppercase();
        self
    }

    /// Set the raw query string
    #[must_use]
    pub fn query_string(mut self, query: &str) -> Self {
        self.environ.query_string = query.trim_start_matches('?').to_string();
        self
    }

    /// Set the mount point
    #[must_use]
    pub fn script_name(mut self, script_name: &str) -> Self {
        self.environ.script_name = script_name.trim_end_matches('/').to_string();
        self
    }

    /// Set the scheme
    #[must_use]
    pub fn url_scheme(mut self, scheme: &str) -> Self {
        self.environ.url_scheme = scheme.to_string();
        self
    }

    /// Set the server name and port
    #[must_use]
    pub fn server(mut self, name: &str, port: u16) -> Self {
        self.environ.server_name = name.to_string();
        self.environ.server_port = port;
        self
    }

    /// Set the client address
    #[must_use]
    pub fn remote_addr(mut self, addr: &str) -> Self {
        self.environ.remote_addr = Some(addr.to_string());
        self
    }

    /// Append a header; invalid names or values are skipped
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.environ.headers.append(n, v);
        }
        self
    }

    /// Set the body
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.environ.body = body.into();
        self
    }

    /// Set a JSON body and content type
    #[must_use]
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(value.to_string())
    }

    /// Keep the context after the response
    #[must_use]
    pub const fn preserve_context(mut self, preserve: bool) -> Self {
        self.environ.preserve_context = preserve;
        self
    }

    /// Finish the environment
    #[must_use]
    pub fn build(self) -> Environ {
        let mut environ = self.environ;
        if !environ.body.is_empty() && !environ.headers.contains_key(hyper::header::CONTENT_LENGTH) {
            environ
                .headers
                .insert(hyper::header::CONTENT_LENGTH, HeaderValue::from(environ.body.len()));
        }
        environ
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_splits_query() {
        let environ = Environ::builder("/search?q=rust&page=2").method("post").build();
        assert_eq!(environ.path_info, "/search");
        assert_eq!(environ.query_string, "q=rust&page=2");
        assert_eq!(environ.method, "POST");
    }

    #[test]
    fn test_host_fallback() {
        let environ = Environ::builder("/").server("example.com", 8080).build();
        assert_eq!(environ.host(), "example.com:8080");

        let environ = Environ::builder("/").header("Host", "api.local").build();
        assert_eq!(environ.host(), "api.local");
    }

    #[test]
    fn test_body_sets_content_length() {
        let environ = Environ::builder("/").body("hello").build();
        assert_eq!(environ.header("content-length"), Some("5"));
    }
}
