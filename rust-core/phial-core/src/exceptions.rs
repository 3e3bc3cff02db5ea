//! # HTTP Exceptions
//!
//! Structured HTTP failures. An `HttpException` is both an error (it flows
//! through `Error::Http`) and a gateway application: when no handler claims
//! it, it renders itself as a small HTML response.

use crate::environ::Environ;
use crate::error::{Error, Result};
use crate::response::Response;
use crate::wsgi::{StartResponse, WsgiApp};
use hyper::body::Bytes;
use hyper::StatusCode;
use std::fmt;

/// Status codes with a registered exception class.
const KNOWN_CODES: &[u16] = &[
    400, 401, 403, 404, 405, 406, 408, 409, 410, 411, 412, 413, 414, 415, 416, 417, 418, 422,
    423, 424, 428, 429, 431, 451, 500, 501, 502, 503, 504, 505,
];

/// Routing-internal redirect code
pub const REDIRECT_CODE: u16 = 308;

/// An HTTP error (or routing redirect) carrying its status code
#[derive(Debug, Clone)]
pub struct HttpException {
    code: u16,
    description: Option<String>,
    response: Option<Box<Response>>,
    original: Option<Box<Error>>,
    valid_methods: Vec<String>,
    new_url: Option<String>,
}

impl HttpException {
    /// Create an exception for a status code
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self {
            code,
            description: None,
            response: None,
            original: None,
            valid_methods: Vec::new(),
            new_url: None,
        }
    }

    /// 400 Bad Request
    #[must_use]
    pub const fn bad_request() -> Self {
        Self::new(400)
    }

    /// 404 Not Found
    #[must_use]
    pub const fn not_found() -> Self {
        Self::new(404)
    }

    /// 405 Method Not Allowed with the methods that would have matched
    #[must_use]
    pub fn method_not_allowed(valid_methods: Vec<String>) -> Self {
        Self {
            valid_methods,
            ..Self::new(405)
        }
    }

    /// 413 Request Entity Too Large
    #[must_use]
    pub const fn payload_too_large() -> Self {
        Self::new(413)
    }

    /// 500 Internal Server Error, remembering the failure that caused it
    #[must_use]
    pub fn internal_server_error(original: Option<Error>) -> Self {
        Self {
            original: original.map(Box::new),
            ..Self::new(500)
        }
    }

    /// Routing redirect to the canonical URL (308)
    #[must_use]
    pub fn request_redirect(new_url: impl Into<String>) -> Self {
        Self {
            new_url: Some(new_url.into()),
            ..Self::new(REDIRECT_CODE)
        }
    }

    /// Override the description shown in the default body
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a ready-made response returned instead of the default body
    #[must_use]
    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(Box::new(response));
        self
    }

    /// Whether a code belongs to the HTTP error taxonomy
    #[must_use]
    pub fn is_known_code(code: u16) -> bool {
        KNOWN_CODES.contains(&code)
    }

    /// Status code
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Reason phrase, e.g. "Not Found"
    #[must_use]
    pub fn name(&self) -> &'static str {
        reason_phrase(self.code)
    }

    /// Human readable description
    #[must_use]
    pub fn description(&self) -> &str {
        self.description
            .as_deref()
            .unwrap_or_else(|| default_description(self.code))
    }

    /// The failure wrapped by an internal server error
    #[must_use]
    pub fn original(&self) -> Option<&Error> {
        self.original.as_deref()
    }

    /// Methods valid for the URL (405 only)
    #[must_use]
    pub fn valid_methods(&self) -> &[String] {
        &self.valid_methods
    }

    /// Redirect target (routing redirects only)
    #[must_use]
    pub fn new_url(&self) -> Option<&str> {
        self.new_url.as_deref()
    }

    /// Routing redirect signal rather than an error
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        self.new_url.is_some()
    }

    /// Render the exception as a response
    #[must_use]
    pub fn get_response(&self) -> Response {
        if let Some(response) = &self.response {
            return (**response).clone();
        }

        let body = format!(
            "<!doctype html>\n<html lang=en>\n<title>{code} {name}</title>\n\
             <h1>{name}</h1>\n<p>{description}</p>\n",
            code = self.code,
            name = self.name(),
            description = escape_html(self.description()),
        );
        let mut response = Response::new(body).with_status(self.code);
        if !self.valid_methods.is_empty() {
            response.set_header("Allow", &self.valid_methods.join(", "));
        }
        if let Some(url) = &self.new_url {
            response.set_header("Location", url);
        }
        response
    }
}

impl fmt::Display for HttpException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.name(), self.description())
    }
}

impl WsgiApp for HttpException {
    fn call(
        &self,
        environ: &Environ,
        start_response: &mut StartResponse<'_>,
    ) -> Result<Vec<Bytes>> {
        self.get_response().call(environ, start_response)
    }
}

/// Build the error for a status code, ready to be returned with `?`
///
/// Codes outside the HTTP error taxonomy are a setup error.
#[must_use]
pub fn abort(code: u16) -> Error {
    if HttpException::is_known_code(code) {
        Error::Http(HttpException::new(code))
    } else {
        Error::Setup(format!("no exception for {code}"))
    }
}

/// Abort with a ready-made response
#[must_use]
pub fn abort_with(response: Response) -> Error {
    let code = response.status();
    Error::Http(HttpException::new(code).with_response(response))
}

/// Reason phrase for a status code
#[must_use]
pub fn reason_phrase(code: u16) -> &'static str {
    if code == 418 {
        return "I'm a teapot";
    }
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Error")
}

fn default_description(code: u16) -> &'static str {
    match code {
        308 => "The URL has moved permanently; follow the redirect.",
        400 => "The browser (or proxy) sent a request that this server could not understand.",
        401 => {
            "The server could not verify that you are authorized to access the URL \
             requested. You either supplied the wrong credentials (e.g. a bad password), \
             or your browser doesn't understand how to supply the credentials required."
        }
        403 => {
            "You don't have the permission to access the requested resource. It is \
             either read-protected or not readable by the server."
        }
        404 => {
            "The requested URL was not found on the server. If you entered the URL \
             manually please check your spelling and try again."
        }
        405 => "The method is not allowed for the requested URL.",
        406 => {
            "The resource identified by the request is only capable of generating \
             response entities which have content characteristics not acceptable \
             according to the accept headers sent in the request."
        }
        408 => {
            "The server closed the network connection because the browser didn't \
             finish the request within the specified time."
        }
        409 => {
            "A conflict happened while processing the request. The resource might \
             have been modified while the request was being processed."
        }
        410 => {
            "The requested URL is no longer available on this server and there is no \
             forwarding address. If you followed a link from a foreign page, please \
             contact the author of this page."
        }
        411 => "A request with this method requires a valid <code>Content-Length</code> header.",
        412 => "The precondition on the request for the URL failed positive evaluation.",
        413 => "The data value transmitted exceeds the capacity limit.",
        414 => {
            "The length of the requested URL exceeds the capacity limit for this \
             server. The request cannot be processed."
        }
        415 => "The server does not support the media type transmitted in the request.",
        416 => "The server cannot provide the requested range.",
        417 => "The server could not meet the requirements of the Expect header",
        418 => "This server is a teapot, not a coffee machine",
        422 => "The request was well-formed but was unable to be followed due to semantic errors.",
        423 => "The resource that is being accessed is locked.",
        424 => {
            "The method could not be performed on the resource because the requested \
             action depended on another action and that action failed."
        }
        428 => {
            "This request is required to be conditional; try using \"If-Match\" or \
             \"If-Unmodified-Since\"."
        }
        429 => {
            "This user has exceeded an allotted request count. Try again later."
        }
        431 => "One or more header fields exceeds the maximum size.",
        451 => "Unavailable for legal reasons.",
        500 => {
            "The server encountered an internal error and was unable to complete your \
             request. Either the server is overloaded or there is an error in the \
             application."
        }
        501 => "The server does not support the action requested by the browser.",
        502 => "The proxy server received an invalid response from an upstream server.",
        503 => {
            "The server is temporarily unable to service your request due to \
             maintenance downtime or capacity problems. Please try again later."
        }
        504 => "The connection to an upstream server timed out.",
        505 => "The server does not support the HTTP protocol version used in the request.",
        _ => "",
    }
}

pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_response() {
        let response = HttpException::not_found().get_response();
        assert_eq!(response.status(), 404);
        assert_eq!(response.mimetype(), "text/html");
        assert!(response.text_body().unwrap_or_default().contains("<h1>Not Found</h1>"));
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let exc = HttpException::method_not_allowed(vec!["GET".into(), "HEAD".into()]);
        let response = exc.get_response();
        assert_eq!(response.header("Allow"), Some("GET, HEAD"));
    }

    #[test]
    fn test_redirect_sets_location() {
        let exc = HttpException::request_redirect("http://localhost/users/");
        assert!(exc.is_redirect());
        let response = exc.get_response();
        assert_eq!(response.status(), 308);
        assert_eq!(response.header("Location"), Some("http://localhost/users/"));
    }

    #[test]
    fn test_abort_known_and_unknown() {
        assert_eq!(abort(403).code(), Some(403));
        assert!(matches!(abort(299), Error::Setup(_)));
    }

    #[test]
    fn test_custom_response_wins() {
        let exc = HttpException::new(401).with_response(Response::new("nope").with_status(401));
        assert_eq!(exc.get_response().text_body(), Some("nope"));
    }

    #[test]
    fn test_display() {
        assert!(HttpException::new(418).to_string().starts_with("418 I'm a teapot"));
    }
}
