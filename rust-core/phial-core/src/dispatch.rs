//! # Dispatch
//!
//! The request lifecycle: push a request context, run the first-request
//! hooks once, preprocess, call the view, route failures through the error
//! handlers, finalize the response and tear the context down.

use crate::app::App;
use crate::coerce::ViewReturn;
use crate::ctx::{AppContext, RequestContext};
use crate::environ::Environ;
use crate::error::{Error, Result};
use crate::exceptions::HttpException;
use crate::response::Response;
use crate::wsgi::{StartResponse, WsgiApp};
use hyper::body::Bytes;
use std::sync::atomic::Ordering;
use tracing::{debug, error};

/// Run every hook, keep the first failure
fn run_all<T>(hooks: Vec<T>, mut call: impl FnMut(&T) -> Result<()>) -> Result<()> {
    let mut first = None;
    for hook in &hooks {
        if let Err(e) = call(hook) {
            error!(error = %e, "Teardown hook failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

impl App {
    /// Handle one request end to end
    ///
    /// # Errors
    ///
    /// In propagate mode unhandled errors are returned unchanged; teardown
    /// failures are returned as well.
    pub fn dispatch(&self, environ: Environ) -> Result<Response> {
        let app = self.handle()?;
        let ctx = app.request_context(environ);

        let mut error = None;
        let result = match ctx.push().and_then(|()| self.full_dispatch_request(&ctx)) {
            Ok(response) => Ok(response),
            Err(e) => {
                error = Some(e.clone());
                self.handle_exception(&ctx, e)
            }
        };

        let popped = ctx.auto_pop(error);
        popped.and(result)
    }

    /// Run first-request hooks, preprocessing, the view and finalization
    ///
    /// # Errors
    ///
    /// Returns failures the error handlers did not turn into a response.
    pub fn full_dispatch_request(&self, ctx: &RequestContext) -> Result<Response> {
        self.try_trigger_before_first_request_functions()?;

        self.signals().request_started.send(self, &());
        let rv = match self.preprocess_and_dispatch(ctx) {
            Ok(rv) => rv,
            Err(e) => self.handle_user_exception(ctx, e)?,
        };
        self.finalize_request(ctx, rv, false)
    }

    fn preprocess_and_dispatch(&self, ctx: &RequestContext) -> Result<ViewReturn> {
        let max_content_length = self.config().max_content_length;
        ctx.request().check_content_length(max_content_length)?;
        if let Some(rv) = self.preprocess_request(ctx)? {
            return Ok(rv);
        }
        self.dispatch_request(ctx)
    }

    /// Run the first-request hooks exactly once
    ///
    /// # Errors
    ///
    /// Returns the first hook failure; the hooks run again on the next
    /// request in that case.
    pub fn try_trigger_before_first_request_functions(&self) -> Result<()> {
        let (flag, lock) = self.first_request_gate();
        if flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = lock.lock();
        if flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        let funcs = self.hooks.before_first_request.read().clone();
        for func in funcs {
            func(self)?;
        }
        flag.store(true, Ordering::SeqCst);
        debug!(app = %self.name(), "Handled first-request setup");
        Ok(())
    }

    /// Run url-value preprocessors and before-request hooks
    ///
    /// # Errors
    ///
    /// Returns the first hook failure.
    pub fn preprocess_request(&self, ctx: &RequestContext) -> Result<Option<ViewReturn>> {
        let request = ctx.request();
        let blueprint = request.blueprint();
        let endpoint = request.endpoint();

        let preprocessors = self
            .hooks
            .url_value_preprocessors
            .read()
            .forward(blueprint.as_deref());
        if !preprocessors.is_empty() {
            let mut view_args = request.view_args().unwrap_or_default();
            for func in preprocessors {
                func(endpoint.as_deref(), &mut view_args)?;
            }
            if let Some(rule) = request.url_rule() {
                request.set_match(rule, view_args);
            }
        }

        let before = self.hooks.before_request.read().forward(blueprint.as_deref());
        for func in before {
            if let Some(rv) = func(ctx)? {
                return Ok(Some(rv));
            }
        }
        Ok(None)
    }

    /// Call the view function of the matched rule
    ///
    /// # Errors
    ///
    /// Returns the stored routing failure or the view's failure.
    pub fn dispatch_request(&self, ctx: &RequestContext) -> Result<ViewReturn> {
        let request = ctx.request();
        if let Some(e) = request.routing_exception() {
            return Err(self.raise_routing_exception(ctx, e));
        }
        let Some(rule) = request.url_rule() else {
            return Err(HttpException::not_found().into());
        };

        if rule.provide_automatic_options && request.method() == "OPTIONS" {
            return Ok(ViewReturn::Response(self.make_default_options_response(ctx)));
        }

        let view = self.view_function(&rule.endpoint).ok_or_else(|| {
            Error::Setup(format!(
                "no view function is registered for endpoint '{}'",
                rule.endpoint
            ))
        })?;
        let view_args = request.view_args().unwrap_or_default();
        view(ctx, &view_args)
    }

    fn raise_routing_exception(&self, ctx: &RequestContext, e: Error) -> Error {
        let request = ctx.request();
        let redirect = e.as_http().filter(|h| h.is_redirect()).and_then(HttpException::new_url);
        match redirect {
            Some(new_url)
                if self.debug() && !matches!(request.method(), "GET" | "HEAD" | "OPTIONS") =>
            {
                Error::FormDataRoutingRedirect {
                    url: request.url(),
                    new_url: new_url.to_string(),
                    method: request.method().to_string(),
                }
            }
            _ => e,
        }
    }

    /// Empty response advertising the methods allowed at the request path
    #[must_use]
    pub fn make_default_options_response(&self, ctx: &RequestContext) -> Response {
        let methods = ctx
            .url_adapter()
            .map(|adapter| adapter.allowed_methods(ctx.request().path()))
            .unwrap_or_default();
        let mut response = Response::new(Bytes::new());
        response.set_allow(&methods);
        response
    }

    fn trap_http_exception(&self, e: &HttpException) -> bool {
        let config = self.config();
        if config.trap_http_exceptions {
            return true;
        }
        config.trap_bad_request_enabled() && e.code() == 400
    }

    /// Route a failure of preprocessing or the view to its handler
    ///
    /// # Errors
    ///
    /// Returns `e` when no handler exists, or the handler's own failure.
    pub fn handle_user_exception(&self, ctx: &RequestContext, e: Error) -> Result<ViewReturn> {
        if let Error::Http(http) = &e {
            if !self.trap_http_exception(http) {
                return self.handle_http_exception(ctx, e);
            }
        }
        let blueprint = ctx.request().blueprint();
        match self.hooks.find_error_handler(&e, blueprint.as_deref()) {
            Some(handler) => handler(ctx, &e),
            None => Err(e),
        }
    }

    /// Turn an HTTP error into a return value
    ///
    /// Routing redirects are returned as responses directly; other errors
    /// go to a matching handler or render themselves.
    ///
    /// # Errors
    ///
    /// Returns the handler's failure.
    pub fn handle_http_exception(&self, ctx: &RequestContext, e: Error) -> Result<ViewReturn> {
        let Error::Http(http) = &e else {
            return Err(e);
        };
        if http.is_redirect() {
            return Ok(ViewReturn::Response(http.get_response()));
        }
        let blueprint = ctx.request().blueprint();
        match self.hooks.find_error_handler(&e, blueprint.as_deref()) {
            Some(handler) => handler(ctx, &e),
            None => Ok(ViewReturn::Response(http.get_response())),
        }
    }

    /// Last resort for failures no handler dealt with
    ///
    /// In propagate mode `e` is returned unchanged. Otherwise it is logged,
    /// wrapped in a 500 error, offered to a 500 handler and finalized.
    ///
    /// # Errors
    ///
    /// Returns `e` in propagate mode, or a failure of the 500 handler.
    pub fn handle_exception(&self, ctx: &RequestContext, e: Error) -> Result<Response> {
        self.signals().got_request_exception.send(self, &e);

        if self.config().propagate_exceptions_enabled() {
            return Err(e);
        }

        self.log_exception(ctx, &e);
        let http = HttpException::internal_server_error(Some(e));
        let fallback = http.get_response();
        let server_error = Error::from(http);
        let blueprint = ctx.request().blueprint();
        let rv = match self.hooks.find_error_handler(&server_error, blueprint.as_deref()) {
            Some(handler) => handler(ctx, &server_error)?,
            None => ViewReturn::Response(fallback),
        };
        self.finalize_request(ctx, rv, true)
    }

    /// Log an unhandled failure with the request it belongs to
    pub fn log_exception(&self, ctx: &RequestContext, e: &Error) {
        let request = ctx.request();
        error!(
            path = %request.path(),
            method = %request.method(),
            error = %e,
            "Exception on {} [{}]",
            request.path(),
            request.method()
        );
    }

    /// Coerce `rv`, run after-request processing and announce the response
    ///
    /// Failures after coercion are logged and ignored when finalizing the
    /// response of an error handler.
    ///
    /// # Errors
    ///
    /// Returns coercion failures, and processing failures outside error handling.
    pub fn finalize_request(
        &self,
        ctx: &RequestContext,
        rv: ViewReturn,
        from_error_handler: bool,
    ) -> Result<Response> {
        let mut response = self.make_response(ctx.request().environ(), rv)?;
        match self.process_response(ctx, &mut response) {
            Ok(()) => self.signals().request_finished.send(self, &response),
            Err(e) if from_error_handler => {
                error!(
                    error = %e,
                    path = %ctx.request().path(),
                    "Request finalizing failed with an error while handling an error"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(response)
    }

    /// Run per-request callbacks and after-request hooks, then save the session
    ///
    /// # Errors
    ///
    /// Returns the first callback failure or a session backend failure.
    pub fn process_response(&self, ctx: &RequestContext, response: &mut Response) -> Result<()> {
        let blueprint = ctx.request().blueprint();
        for func in ctx.after_request_functions() {
            func(ctx, response)?;
        }
        let funcs = self.hooks.after_request.read().backward(blueprint.as_deref());
        for func in funcs {
            func(ctx, response)?;
        }

        let session = ctx.session();
        let interface = self.session_interface();
        if !interface.is_null_session(&session) {
            interface.save_session(self, &session, response)?;
        }
        Ok(())
    }

    /// Run the teardown-request hooks: global reversed, then the blueprint's reversed
    ///
    /// # Errors
    ///
    /// Every hook runs; the first failure is returned.
    pub fn do_teardown_request(&self, ctx: &RequestContext, error: Option<&Error>) -> Result<()> {
        let blueprint = ctx.request().blueprint();
        let funcs = self
            .hooks
            .teardown_request
            .read()
            .teardown_order(blueprint.as_deref());
        let result = run_all(funcs, |func| func(ctx, error));
        self.signals()
            .request_tearing_down
            .send(self, &error.cloned());
        result
    }

    /// Run the teardown-appcontext hooks in reverse registration order
    ///
    /// # Errors
    ///
    /// Every hook runs; the first failure is returned.
    pub fn do_teardown_appcontext(&self, ctx: &AppContext, error: Option<&Error>) -> Result<()> {
        let funcs: Vec<_> = self
            .hooks
            .teardown_appcontext
            .read()
            .iter()
            .rev()
            .cloned()
            .collect();
        let result = run_all(funcs, |func| func(ctx, error));
        self.signals()
            .appcontext_tearing_down
            .send(self, &error.cloned());
        result
    }
}

impl WsgiApp for App {
    fn call(&self, environ: &Environ, start_response: &mut StartResponse<'_>) -> Result<Vec<Bytes>> {
        let response = self.dispatch(environ.clone())?;
        response.call(environ, start_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{Blueprint, BlueprintOptions};
    use crate::config::Config;
    use crate::stack::{app_stack_depth, request_stack_depth};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    fn get(app: &App, path: &str) -> Result<Response> {
        app.dispatch(Environ::builder(path).build())
    }

    fn failing_app(propagate: bool) -> Arc<App> {
        let config = Config {
            propagate_exceptions: Some(propagate),
            ..Config::default()
        };
        let app = App::with_config("failing", config);
        app.route("/boom", "boom", |_, _| -> Result<&'static str> { Err(Error::user(Boom)) })
            .unwrap();
        app
    }

    #[test]
    fn test_first_request_hooks_retry_until_success() {
        let app = App::new("first");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        app.before_first_request(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Config("not ready".to_string()))
            } else {
                Ok(())
            }
        })
        .unwrap();
        app.route("/", "index", |_, _| Ok("ready")).unwrap();

        assert_eq!(get(&app, "/").unwrap().status(), 500);
        assert!(!app.got_first_request());
        assert_eq!(get(&app, "/").unwrap().text_body(), Some("ready"));
        assert_eq!(get(&app, "/").unwrap().status(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(app.got_first_request());
    }

    #[test]
    fn test_every_teardown_runs_and_first_failure_wins() {
        let app = App::new("teardown");
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["registered-first", "registered-second"] {
            let order = Arc::clone(&order);
            app.teardown_request(move |_, _| {
                order.lock().push(name);
                Err(Error::Config(name.to_string()))
            })
            .unwrap();
        }
        app.route("/", "index", |_, _| Ok("index")).unwrap();

        let err = get(&app, "/").unwrap_err();
        assert!(matches!(err, Error::Config(ref name) if name == "registered-second"));
        assert_eq!(*order.lock(), ["registered-second", "registered-first"]);
        assert_eq!(request_stack_depth(), 0);
        assert_eq!(app_stack_depth(), 0);
    }

    #[test]
    fn test_automatic_options() {
        let app = App::new("options");
        app.route("/items", "items", |_, _| Ok("items")).unwrap();

        let response = app
            .dispatch(Environ::builder("/items").method("OPTIONS").build())
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.body().is_empty());
        assert_eq!(response.header("allow"), Some("GET, HEAD, OPTIONS"));
    }

    #[test]
    fn test_strict_slash_redirect() {
        let app = App::new("slashes");
        app.route("/p/", "p", |_, _| Ok("p")).unwrap();

        let response = get(&app, "/p").unwrap();
        assert_eq!(response.status(), 308);
        assert_eq!(response.header("location"), Some("http://localhost/p/"));
    }

    #[test]
    fn test_post_redirect_in_debug_is_an_error() {
        let config = Config {
            debug: true,
            ..Config::default()
        };
        let app = App::with_config("debug", config);
        let options = crate::app::RouteOptions::new().methods(&["POST"]);
        app.route_with("/p/", "p", options, |_, _| Ok("p")).unwrap();

        let err = app
            .dispatch(Environ::builder("/p").method("POST").build())
            .unwrap_err();
        match err {
            Error::FormDataRoutingRedirect { new_url, method, .. } => {
                assert_eq!(new_url, "http://localhost/p/");
                assert_eq!(method, "POST");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_server_error_handler_sees_original() {
        let app = failing_app(false);
        app.register_error_handler(500u16, |_, e| {
            let original = e
                .as_http()
                .and_then(HttpException::original)
                .map(ToString::to_string)
                .unwrap_or_default();
            Ok((format!("handled {original}"), 500u16))
        })
        .unwrap();

        let response = get(&app, "/boom").unwrap();
        assert_eq!(response.status(), 500);
        assert_eq!(response.text_body(), Some("handled boom"));
    }

    #[test]
    fn test_propagate_returns_original_error() {
        let app = failing_app(true);
        let err = get(&app, "/boom").unwrap_err();
        assert!(matches!(err, Error::User(_)));
        assert!(err.downcast_ref::<Boom>().is_some());
        assert_eq!(request_stack_depth(), 0);
    }

    #[test]
    fn test_after_request_failure_swallowed_while_handling_error() {
        let app = failing_app(false);
        app.route("/fine", "fine", |_, _| Ok("fine")).unwrap();
        app.after_request(|_, _| Err(Error::Config("after hook failed".to_string())))
            .unwrap();

        let response = get(&app, "/boom").unwrap();
        assert_eq!(response.status(), 500);

        let response = get(&app, "/fine").unwrap();
        assert_eq!(response.status(), 500);
    }

    #[test]
    fn test_after_this_request_runs_before_hooks() {
        let app = App::new("after");
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut bp = Blueprint::new("shop");
        let view_order = Arc::clone(&order);
        bp.route("/cart", "cart", move |ctx, _| {
            let order = Arc::clone(&view_order);
            ctx.after_this_request(move |_, _| {
                order.lock().push("this-request");
                Ok(())
            });
            Ok("cart")
        })
        .unwrap();
        let bp_order = Arc::clone(&order);
        bp.after_request(move |_, _| {
            bp_order.lock().push("blueprint");
            Ok(())
        });
        app.register_blueprint(Arc::new(bp), BlueprintOptions::new())
            .unwrap();
        let app_order = Arc::clone(&order);
        app.after_request(move |_, _| {
            app_order.lock().push("app");
            Ok(())
        })
        .unwrap();

        get(&app, "/cart").unwrap();
        assert_eq!(*order.lock(), ["this-request", "blueprint", "app"]);
    }
}
