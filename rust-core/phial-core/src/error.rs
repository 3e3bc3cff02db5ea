//! # Error Handling
//!
//! Centralized error types for Phial.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! `Error` is cheap to clone: heavy payloads sit behind `Arc`, so the same
//! failure can be handed to error handlers, teardown hooks and a preserved
//! request context while keeping its identity.

use crate::exceptions::HttpException;
use crate::types::ViewArgs;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for Phial operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Phial runtime
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Structured HTTP failure (404, 405, 500, routing redirects, ...)
    #[error("{0}")]
    Http(HttpException),

    /// Failure raised by application code
    #[error("{0}")]
    User(UserError),

    /// Pop on an empty context stack
    #[error("Cannot pop from an empty {stack} context stack")]
    EmptyStack {
        /// Which stack was empty ("application" or "request")
        stack: &'static str,
    },

    /// The popped stack entry was not the context asking to be popped
    #[error("Popped wrong {kind} context")]
    WrongContextPopped {
        /// Which context kind was mismatched
        kind: &'static str,
    },

    /// Misuse of the setup API (late registration, endpoint clash, ...)
    #[error("Setup error: {0}")]
    Setup(String),

    /// An application context was required but none is active
    #[error(
        "Working outside of application context. Push an application context \
         with App::app_context() first."
    )]
    NoAppContext,

    /// A request context was required but none is active
    #[error("Working outside of request context")]
    NoRequestContext,

    /// Mutation of the placeholder session used when sessions are unavailable
    #[error(
        "The session is unavailable because no secret key was set. Set the \
         secret_key on the application to something unique and secret."
    )]
    NullSession,

    /// A view returned something that cannot become a response
    #[error("{0}")]
    InvalidResponse(String),

    /// URL building failed
    #[error("{0}")]
    Build(BuildError),

    /// Invalid route pattern provided
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Debug-mode replacement for a slash redirect that would drop a request body
    #[error(
        "A request was sent to {url} but routing issued a redirect to the \
         canonical URL {new_url}. Make sure to directly send your {method} \
         request to this URL since the browser cannot redirect with form data \
         reliably."
    )]
    FormDataRoutingRedirect {
        /// The requested URL
        url: String,
        /// Where routing wanted to redirect
        new_url: String,
        /// The request method
        method: String,
    },

    /// Signed payload could not be verified
    #[error("Bad signature: {0}")]
    Signature(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Template loading or rendering failed
    #[error("Template error: {0}")]
    Template(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// HTTP protocol error from the development server
    #[error("HTTP error: {0}")]
    Hyper(Arc<hyper::Error>),

    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    BindError {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Request payload too large
    #[error("Payload too large: limit={limit} bytes, received={actual} bytes")]
    PayloadTooLarge {
        /// Max allowed size
        limit: usize,
        /// Actual size
        actual: usize,
    },
}

impl From<HttpException> for Error {
    fn from(e: HttpException) -> Self {
        Self::Http(e)
    }
}

impl From<BuildError> for Error {
    fn from(e: BuildError) -> Self {
        Self::Build(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Self::Hyper(Arc::new(e))
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Self::Template(e.to_string())
    }
}

impl Error {
    /// Wrap an application error so it can flow through the dispatcher
    pub fn user<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::User(UserError::new(error))
    }

    /// The HTTP exception carried by this error, if any
    #[must_use]
    pub fn as_http(&self) -> Option<&HttpException> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }

    /// Downcast a wrapped application error to its concrete type
    #[must_use]
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::User(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// HTTP status code, only for the structured HTTP taxonomy
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        self.as_http().map(HttpException::code)
    }

    /// Most specific error class
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Http(e) => ErrorClass::Http(e.code()),
            Self::User(e) => ErrorClass::Type(e.type_id()),
            other => ErrorClass::Kind(other.kind_name()),
        }
    }

    /// Error classes from most to least specific, used by handler lookup
    #[must_use]
    pub fn class_chain(&self) -> Vec<ErrorClass> {
        match self {
            Self::Http(e) => vec![
                ErrorClass::Http(e.code()),
                ErrorClass::HttpException,
                ErrorClass::Any,
            ],
            _ => vec![self.class(), ErrorClass::Any],
        }
    }

    /// Whether two errors are the same failure (not merely equal-looking)
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::User(a), Self::User(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (Self::Io(a), Self::Io(b)) => Arc::ptr_eq(a, b),
            (Self::Json(a), Self::Json(b)) => Arc::ptr_eq(a, b),
            (a, b) => a.class() == b.class() && a.to_string() == b.to_string(),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Http(_) => "Http",
            Self::User(_) => "User",
            Self::EmptyStack { .. } => "EmptyStack",
            Self::WrongContextPopped { .. } => "WrongContextPopped",
            Self::Setup(_) => "Setup",
            Self::NoAppContext => "NoAppContext",
            Self::NoRequestContext => "NoRequestContext",
            Self::NullSession => "NullSession",
            Self::InvalidResponse(_) => "InvalidResponse",
            Self::Build(_) => "Build",
            Self::InvalidRoutePattern { .. } => "InvalidRoutePattern",
            Self::FormDataRoutingRedirect { .. } => "FormDataRoutingRedirect",
            Self::Signature(_) => "Signature",
            Self::Config(_) => "Config",
            Self::Template(_) => "Template",
            Self::Json(_) => "Json",
            Self::Io(_) => "Io",
            Self::Hyper(_) => "Hyper",
            Self::BindError { .. } => "BindError",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
        }
    }
}

/// Application error with its concrete type remembered for handler lookup
#[derive(Clone)]
pub struct UserError {
    type_id: TypeId,
    type_name: &'static str,
    inner: Arc<dyn std::error::Error + Send + Sync>,
}

impl UserError {
    /// Wrap a concrete error
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            inner: Arc::new(error),
        }
    }

    /// `TypeId` of the wrapped error
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name of the wrapped error
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Downcast to the concrete error type
    #[must_use]
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserError")
            .field("type", &self.type_name)
            .field("error", &self.inner)
            .finish()
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

/// Class of an error for handler registration and lookup
///
/// HTTP errors walk `Http(code)` → `HttpException` → `Any`; everything else
/// walks its own class → `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Catch-all matching every error
    Any,
    /// Base class of the HTTP taxonomy
    HttpException,
    /// A specific HTTP error class, identified by its status code
    Http(u16),
    /// A concrete application error type
    Type(TypeId),
    /// A framework error variant, by name
    Kind(&'static str),
}

impl ErrorClass {
    /// Class of a concrete application error type
    #[must_use]
    pub fn of<E: std::error::Error + 'static>() -> Self {
        Self::Type(TypeId::of::<E>())
    }
}

/// Key an error handler is registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKey {
    /// An HTTP status code
    Code(u16),
    /// An error class
    Class(ErrorClass),
}

impl From<u16> for ErrorKey {
    fn from(code: u16) -> Self {
        Self::Code(code)
    }
}

impl From<ErrorClass> for ErrorKey {
    fn from(class: ErrorClass) -> Self {
        Self::Class(class)
    }
}

impl ErrorKey {
    /// Key for a concrete application error type
    #[must_use]
    pub fn of<E: std::error::Error + 'static>() -> Self {
        Self::Class(ErrorClass::of::<E>())
    }

    /// Resolve to `(class, code)`; unknown HTTP codes are rejected
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` for a status code outside the HTTP taxonomy.
    pub fn class_and_code(self) -> Result<(ErrorClass, Option<u16>)> {
        match self {
            Self::Code(code) | Self::Class(ErrorClass::Http(code)) => {
                if HttpException::is_known_code(code) {
                    Ok((ErrorClass::Http(code), Some(code)))
                } else {
                    Err(Error::Setup(format!(
                        "'{code}' is not a recognized HTTP error code. Use a \
                         custom error type with a handler instead."
                    )))
                }
            }
            Self::Class(class) => Ok((class, None)),
        }
    }
}

/// URL building failure
#[derive(Debug, Clone)]
pub struct BuildError {
    /// Endpoint that could not be built
    pub endpoint: String,
    /// Values supplied for building
    pub values: ViewArgs,
    /// Method constraint, if any
    pub method: Option<String>,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Could not build url for endpoint '{}'", self.endpoint)?;
        if let Some(method) = &self.method {
            write!(f, " ({method})")?;
        }
        if !self.values.is_empty() {
            let keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
            write!(f, " with values {keys:?}")?;
        }
        write!(f, ". Did you forget to specify values?")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_user_error_downcast() {
        let err = Error::user(Boom);
        assert!(err.downcast_ref::<Boom>().is_some());
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.class(), ErrorClass::of::<Boom>());
    }

    #[test]
    fn test_class_chain_for_http() {
        let err = Error::Http(HttpException::new(404));
        assert_eq!(
            err.class_chain(),
            vec![ErrorClass::Http(404), ErrorClass::HttpException, ErrorClass::Any]
        );
        assert_eq!(err.code(), Some(404));
    }

    #[test]
    fn test_clone_keeps_identity() {
        let err = Error::user(Boom);
        let copy = err.clone();
        assert!(err.same_as(&copy));
        assert!(!err.same_as(&Error::user(Boom)));
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(ErrorKey::Code(404).class_and_code().is_ok());
        assert!(matches!(
            ErrorKey::Code(999).class_and_code(),
            Err(Error::Setup(_))
        ));
        assert_eq!(
            ErrorKey::Class(ErrorClass::HttpException)
                .class_and_code()
                .unwrap(),
            (ErrorClass::HttpException, None)
        );
    }

    #[test]
    fn test_bind_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = Error::BindError {
            address: "0.0.0.0:5000".to_string(),
            source: Arc::new(io_err),
        };
        assert!(err.to_string().contains("0.0.0.0:5000"));
    }
}
