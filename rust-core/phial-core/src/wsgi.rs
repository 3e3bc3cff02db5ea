//! # Gateway Contract
//!
//! The synchronous "environment in, body chunks out" calling convention every
//! server adapter speaks. Responses, HTTP exceptions and the application
//! itself all implement it.

use crate::environ::Environ;
use crate::error::Result;
use hyper::body::Bytes;
use std::sync::Arc;

/// Callback receiving the status line and headers before the body
pub type StartResponse<'a> = dyn FnMut(&str, &[(String, String)]) + 'a;

/// A gateway application
pub trait WsgiApp: Send + Sync {
    /// Handle one request: report status and headers via `start_response`,
    /// then return the body chunks
    ///
    /// # Errors
    ///
    /// Returns the failure that prevented a response from being produced.
    fn call(&self, environ: &Environ, start_response: &mut StartResponse<'_>)
        -> Result<Vec<Bytes>>;

    /// Runtime type name, used in coercion error messages
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<T: WsgiApp + ?Sized> WsgiApp for Arc<T> {
    fn call(
        &self,
        environ: &Environ,
        start_response: &mut StartResponse<'_>,
    ) -> Result<Vec<Bytes>> {
        (**self).call(environ, start_response)
    }

    fn type_name(&self) -> &'static str {
        (**self).type_name()
    }
}

/// Adapter turning a closure into a gateway application
pub struct WsgiFn<F>(F);

impl<F> WsgiFn<F>
where
    F: Fn(&Environ, &mut StartResponse<'_>) -> Result<Vec<Bytes>> + Send + Sync,
{
    /// Wrap a closure
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> WsgiApp for WsgiFn<F>
where
    F: Fn(&Environ, &mut StartResponse<'_>) -> Result<Vec<Bytes>> + Send + Sync,
{
    fn call(
        &self,
        environ: &Environ,
        start_response: &mut StartResponse<'_>,
    ) -> Result<Vec<Bytes>> {
        (self.0)(environ, start_response)
    }
}
