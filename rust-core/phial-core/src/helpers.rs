//! # Helpers
//!
//! URL building, flashing and per-request shortcuts. The free functions
//! resolve the active contexts of the current thread; the `RequestContext`
//! methods take the context explicitly.

use crate::app::App;
use crate::coerce::ViewReturn;
use crate::ctx::RequestContext;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::router::UrlAdapter;
use crate::stack;
use crate::types::{ParamValue, ViewArgs};
use std::sync::Arc;

pub use crate::exceptions::abort;
pub use crate::response::redirect;

/// Options for building a URL to an endpoint
///
/// ```ignore
/// let url = UrlFor::new("user.profile")
///     .value("id", 7)
///     .anchor("posts")
///     .build_for(ctx)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct UrlFor {
    endpoint: String,
    values: ViewArgs,
    anchor: Option<String>,
    method: Option<String>,
    scheme: Option<String>,
    external: Option<bool>,
}

impl UrlFor {
    /// Build a URL to `endpoint`; a leading `.` is relative to the current blueprint
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    /// Add one value; unknown keys end up in the query string
    #[must_use]
    pub fn value(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Add several values
    #[must_use]
    pub fn values(mut self, values: ViewArgs) -> Self {
        self.values.extend(values);
        self
    }

    /// Append `#anchor`
    #[must_use]
    pub fn anchor(mut self, anchor: &str) -> Self {
        self.anchor = Some(anchor.to_string());
        self
    }

    /// Only consider rules accepting `method`
    #[must_use]
    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    /// URL scheme of an external URL
    #[must_use]
    pub fn scheme(mut self, scheme: &str) -> Self {
        self.scheme = Some(scheme.to_string());
        self
    }

    /// Force an absolute (or relative) URL
    ///
    /// Defaults to relative inside a request and absolute otherwise.
    #[must_use]
    pub const fn external(mut self, external: bool) -> Self {
        self.external = Some(external);
        self
    }

    /// Build against the contexts active on this thread
    ///
    /// # Errors
    ///
    /// Returns `Error::NoAppContext` without an application context, plus
    /// everything `build_for` returns.
    pub fn build(&self) -> Result<String> {
        if let Some(ctx) = stack::top_request_context() {
            return self.build_for(&ctx);
        }
        let app_ctx = stack::top_app_context().ok_or(Error::NoAppContext)?;
        self.resolve(app_ctx.app(), app_ctx.url_adapter(), None)
    }

    /// Build inside a request
    ///
    /// # Errors
    ///
    /// Returns `Error::Build` when no rule fits and no url-build-error
    /// handler produced a URL.
    pub fn build_for(&self, ctx: &RequestContext) -> Result<String> {
        self.resolve(ctx.app(), ctx.url_adapter(), Some(ctx.request()))
    }

    fn resolve(
        &self,
        app: &App,
        adapter: Option<&Arc<dyn UrlAdapter>>,
        request: Option<&Request>,
    ) -> Result<String> {
        let mut endpoint = self.endpoint.clone();
        if let (Some(rest), Some(request)) = (self.endpoint.strip_prefix('.'), request) {
            endpoint = match request.blueprint() {
                Some(blueprint) => format!("{blueprint}.{rest}"),
                None => rest.to_string(),
            };
        }

        let adapter = adapter.ok_or_else(|| {
            Error::Config(
                "Application was not able to create a URL adapter for request \
                 independent URL generation. You might be able to fix this by \
                 setting the SERVER_NAME config variable."
                    .to_string(),
            )
        })?;

        let external = self.external.unwrap_or(request.is_none());
        if self.scheme.is_some() && !external {
            return Err(Error::Config(
                "When specifying a scheme, the URL must be external".to_string(),
            ));
        }

        let mut values = self.values.clone();
        app.inject_url_defaults(&endpoint, &mut values);

        let built = adapter.build(
            &endpoint,
            &values,
            self.method.as_deref(),
            external,
            self.scheme.as_deref(),
        );
        let mut url = match built {
            Ok(url) => url,
            Err(e @ Error::Build(_)) => app.handle_url_build_error(e, &endpoint, &values)?,
            Err(e) => return Err(e),
        };

        if let Some(anchor) = &self.anchor {
            url.push('#');
            url.push_str(&urlencoding::encode(anchor));
        }
        Ok(url)
    }
}

/// URL for `endpoint` with `values`, using the contexts active on this thread
///
/// # Errors
///
/// See `UrlFor::build`.
pub fn url_for(endpoint: &str, values: &ViewArgs) -> Result<String> {
    UrlFor::new(endpoint).values(values.clone()).build()
}

impl RequestContext {
    /// URL for `endpoint` with `values`, relative to this request
    ///
    /// # Errors
    ///
    /// See `UrlFor::build_for`.
    pub fn url_for(&self, endpoint: &str, values: &ViewArgs) -> Result<String> {
        UrlFor::new(endpoint).values(values.clone()).build_for(self)
    }
}

fn current_request() -> Result<Arc<RequestContext>> {
    stack::top_request_context().ok_or(Error::NoRequestContext)
}

/// Flash a message into the session of the current request
///
/// # Errors
///
/// Returns `Error::NoRequestContext` outside a request and
/// `Error::NullSession` when sessions are unavailable.
pub fn flash(message: &str, category: &str) -> Result<()> {
    current_request()?.flash(message, category)
}

/// Flashed messages of the current request as `(category, message)` pairs
///
/// # Errors
///
/// Returns `Error::NoRequestContext` outside a request.
pub fn get_flashed_messages(categories: &[&str]) -> Result<Vec<(String, String)>> {
    current_request()?.get_flashed_messages(categories)
}

/// Register a callback for the response of the current request only
///
/// # Errors
///
/// Returns `Error::NoRequestContext` outside a request.
pub fn after_this_request<F>(f: F) -> Result<()>
where
    F: Fn(&RequestContext, &mut Response) -> Result<()> + Send + Sync + 'static,
{
    current_request()?.after_this_request(f);
    Ok(())
}

/// Coerce a view return value against the current request
///
/// # Errors
///
/// Returns `Error::NoRequestContext` outside a request and coercion failures.
pub fn make_response(rv: impl Into<ViewReturn>) -> Result<Response> {
    let ctx = current_request()?;
    ctx.app().make_response(ctx.request().environ(), rv.into())
}

/// Wrap `f` so it runs inside a copy of the current request context
///
/// The copy shares the request and session, so the closure can be moved to
/// another thread and still see them.
///
/// # Errors
///
/// Returns `Error::NoRequestContext` outside a request. The returned closure
/// fails with the push or pop failure of the copied context.
pub fn copy_current_request_context<F, R>(f: F) -> Result<impl FnOnce() -> Result<R> + Send>
where
    F: FnOnce(&RequestContext) -> R + Send,
{
    let ctx = current_request()?.copy();
    Ok(move || {
        let guard = ctx.enter()?;
        let rv = f(&guard);
        guard.close()?;
        Ok(rv)
    })
}
