//! # Class-Based Views
//!
//! A `View` is a shared object answering requests through
//! `dispatch_request`. `MethodView` dispatches on the request method through
//! an explicit table of handlers.

use crate::app::{wrap_view, App, RouteOptions};
use crate::blueprint::Blueprint;
use crate::coerce::ViewReturn;
use crate::ctx::RequestContext;
use crate::error::Result;
use crate::exceptions::HttpException;
use crate::hooks::ViewFn;
use crate::types::ViewArgs;
use indexmap::IndexMap;
use std::sync::Arc;

/// Wraps a view function, e.g. to require a login
pub type Decorator = Arc<dyn Fn(ViewFn) -> ViewFn + Send + Sync>;

/// A view function together with its registration defaults
#[derive(Clone)]
pub struct ViewDefinition {
    /// Endpoint name
    pub name: String,
    /// The callable registered for the endpoint
    pub view: ViewFn,
    /// Methods the view answers; `None` means the rule decides
    pub methods: Option<Vec<String>>,
    /// Whether OPTIONS is answered automatically
    pub provide_automatic_options: Option<bool>,
}

impl std::fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewDefinition")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl ViewDefinition {
    /// Route options carrying the view's methods
    #[must_use]
    pub fn route_options(&self) -> RouteOptions {
        RouteOptions {
            methods: self.methods.clone(),
            provide_automatic_options: self.provide_automatic_options,
            ..RouteOptions::default()
        }
    }
}

/// A class-based view
pub trait View: Send + Sync + 'static {
    /// Handle a request
    ///
    /// # Errors
    ///
    /// Any failure is routed through the error handlers.
    fn dispatch_request(&self, ctx: &RequestContext, args: &ViewArgs) -> Result<ViewReturn>;

    /// Methods this view answers
    fn methods(&self) -> Option<Vec<String>> {
        None
    }

    /// Whether OPTIONS is answered automatically
    fn provide_automatic_options(&self) -> Option<bool> {
        None
    }

    /// Applied to the view function in order, the last one outermost
    fn decorators(&self) -> Vec<Decorator> {
        Vec::new()
    }

    /// Turn the view into a registrable function named `name`
    fn as_view(self, name: &str) -> ViewDefinition
    where
        Self: Sized,
    {
        let methods = self.methods();
        let provide_automatic_options = self.provide_automatic_options();
        let decorators = self.decorators();
        let this = Arc::new(self);
        let mut view: ViewFn =
            Arc::new(move |ctx: &RequestContext, args: &ViewArgs| this.dispatch_request(ctx, args));
        for decorator in decorators {
            view = decorator(view);
        }
        ViewDefinition {
            name: name.to_string(),
            view,
            methods,
            provide_automatic_options,
        }
    }
}

/// A view dispatching on the request method
///
/// ```ignore
/// let items = MethodView::new()
///     .get(|ctx, _| Ok("list"))
///     .post(|ctx, _| Ok(("created", 201u16)));
/// app.add_view("/items", items.as_view("items"))?;
/// ```
#[derive(Clone, Default)]
pub struct MethodView {
    handlers: IndexMap<String, ViewFn>,
}

impl std::fmt::Debug for MethodView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodView")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MethodView {
    /// A view without handlers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `method` with `handler`
    #[must_use]
    pub fn on<F, R>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.handlers.insert(method.to_uppercase(), wrap_view(handler));
        self
    }

    /// Handle GET (and HEAD, unless a HEAD handler exists)
    #[must_use]
    pub fn get<F, R>(self, handler: F) -> Self
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.on("GET", handler)
    }

    /// Handle POST
    #[must_use]
    pub fn post<F, R>(self, handler: F) -> Self
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.on("POST", handler)
    }

    /// Handle PUT
    #[must_use]
    pub fn put<F, R>(self, handler: F) -> Self
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.on("PUT", handler)
    }

    /// Handle PATCH
    #[must_use]
    pub fn patch<F, R>(self, handler: F) -> Self
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.on("PATCH", handler)
    }

    /// Handle DELETE
    #[must_use]
    pub fn delete<F, R>(self, handler: F) -> Self
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.on("DELETE", handler)
    }
}

impl View for MethodView {
    fn dispatch_request(&self, ctx: &RequestContext, args: &ViewArgs) -> Result<ViewReturn> {
        let method = ctx.request().method();
        let handler = self
            .handlers
            .get(method)
            .or_else(|| (method == "HEAD").then(|| self.handlers.get("GET")).flatten());
        match handler {
            Some(handler) => handler(ctx, args),
            None => Err(HttpException::method_not_allowed(self.handlers.keys().cloned().collect()).into()),
        }
    }

    fn methods(&self) -> Option<Vec<String>> {
        if self.handlers.is_empty() {
            return None;
        }
        let mut methods: Vec<String> = self.handlers.keys().cloned().collect();
        methods.sort();
        Some(methods)
    }
}

impl App {
    /// Register a class-based view for a rule under its own name
    ///
    /// # Errors
    ///
    /// See `App::add_url_rule`.
    pub fn add_view(&self, rule: &str, definition: ViewDefinition) -> Result<()> {
        let options = definition.route_options();
        self.add_url_rule(rule, &definition.name, Some(definition.view), options)
    }
}

impl Blueprint {
    /// Record a class-based view for a rule under its own name
    ///
    /// # Errors
    ///
    /// See `Blueprint::add_url_rule`.
    pub fn add_view(&mut self, rule: &str, definition: ViewDefinition) -> Result<()> {
        let options = definition.route_options();
        self.add_url_rule(rule, &definition.name, Some(definition.view), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environ::Environ;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: AtomicUsize,
    }

    impl View for Counter {
        fn dispatch_request(&self, _: &RequestContext, _: &ViewArgs) -> Result<ViewReturn> {
            let n = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ViewReturn::Text(n.to_string()))
        }

        fn decorators(&self) -> Vec<Decorator> {
            let bracket: Decorator = Arc::new(|inner: ViewFn| -> ViewFn {
                Arc::new(move |ctx: &RequestContext, args: &ViewArgs| {
                    match inner(ctx, args)? {
                        ViewReturn::Text(s) => Ok(ViewReturn::Text(format!("[{s}]"))),
                        other => Ok(other),
                    }
                })
            });
            vec![bracket]
        }
    }

    fn items() -> MethodView {
        MethodView::new()
            .get(|_, _| Ok("list"))
            .post(|_, _| Ok(("created", 201u16)))
    }

    #[test]
    fn test_view_instance_is_shared_and_decorated() {
        let app = App::new("views");
        app.add_view("/count", Counter { hits: AtomicUsize::new(0) }.as_view("count"))
            .unwrap();

        for expected in ["[1]", "[2]"] {
            let response = app.dispatch(Environ::builder("/count").build()).unwrap();
            assert_eq!(response.text_body(), Some(expected));
        }
    }

    #[test]
    fn test_method_view_dispatch() {
        let app = App::new("views");
        app.add_view("/items", items().as_view("items")).unwrap();

        let get = app.dispatch(Environ::builder("/items").build()).unwrap();
        assert_eq!(get.text_body(), Some("list"));

        let post = app
            .dispatch(Environ::builder("/items").method("POST").build())
            .unwrap();
        assert_eq!(post.status(), 201);

        let head = app
            .dispatch(Environ::builder("/items").method("HEAD").build())
            .unwrap();
        assert_eq!(head.status(), 200);

        let put = app
            .dispatch(Environ::builder("/items").method("PUT").build())
            .unwrap();
        assert_eq!(put.status(), 405);
    }

    #[test]
    fn test_unhandled_verb_in_table_is_405() {
        let app = App::new("views");
        let ctx = app.test_request_context("/");
        let view = MethodView::new().post(|_, _| Ok("x"));
        let err = view.dispatch_request(&ctx, &ViewArgs::new()).unwrap_err();
        assert_eq!(err.code(), Some(405));
        assert!(matches!(err, Error::Http(_)));
        assert_eq!(view.methods(), Some(vec!["POST".to_string()]));
        assert_eq!(MethodView::new().methods(), None);
    }

    #[test]
    fn test_blueprint_view() {
        let app = App::new("views");
        let mut bp = Blueprint::new("api").with_url_prefix("/api");
        bp.add_view("/items", items().as_view("items")).unwrap();
        app.register_blueprint(Arc::new(bp), crate::blueprint::BlueprintOptions::new())
            .unwrap();
        assert!(app.view_function("api.items").is_some());
        let response = app.dispatch(Environ::builder("/api/items").build()).unwrap();
        assert_eq!(response.text_body(), Some("list"));
    }
}
