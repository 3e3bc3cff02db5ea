//! # Hook Registry
//!
//! Ordered collections of lifecycle callbacks, keyed by scope: `None` is the
//! whole application, `Some(name)` a blueprint.
//!
//! Pre-hooks run in registration order, global before blueprint. Post and
//! teardown hooks run in reverse. Callers clone a list out of its lock before
//! running it, so hooks may register further hooks without deadlocking.

use crate::app::App;
use crate::coerce::ViewReturn;
use crate::ctx::{AppContext, RequestContext};
use crate::error::{Error, ErrorClass, ErrorKey, Result};
use crate::response::Response;
use crate::types::ViewArgs;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// View function: `(ctx, view_args) -> return value`
pub type ViewFn = Arc<dyn Fn(&RequestContext, &ViewArgs) -> Result<ViewReturn> + Send + Sync>;
/// Runs before the view; `Some` short-circuits dispatch
pub type BeforeRequestFn =
    Arc<dyn Fn(&RequestContext) -> Result<Option<ViewReturn>> + Send + Sync>;
/// Runs after the view and may modify the response
pub type AfterRequestFn = Arc<dyn Fn(&RequestContext, &mut Response) -> Result<()> + Send + Sync>;
/// Runs when the request context is torn down
pub type TeardownRequestFn =
    Arc<dyn Fn(&RequestContext, Option<&Error>) -> Result<()> + Send + Sync>;
/// Runs when the last reference to an application context goes away
pub type TeardownAppFn = Arc<dyn Fn(&AppContext, Option<&Error>) -> Result<()> + Send + Sync>;
/// Runs once, before the first request
pub type FirstRequestFn = Arc<dyn Fn(&App) -> Result<()> + Send + Sync>;
/// Rewrites matched view arguments: `(endpoint, view_args)`
pub type UrlValuePreprocessorFn =
    Arc<dyn Fn(Option<&str>, &mut ViewArgs) -> Result<()> + Send + Sync>;
/// Injects values before a URL is built: `(endpoint, values)`
pub type UrlDefaultsFn = Arc<dyn Fn(&str, &mut ViewArgs) + Send + Sync>;
/// Supplies extra template variables
pub type ContextProcessorFn = Arc<dyn Fn(&AppContext) -> Result<Map<String, Value>> + Send + Sync>;
/// Turns an error into a return value
pub type ErrorHandlerFn = Arc<dyn Fn(&RequestContext, &Error) -> Result<ViewReturn> + Send + Sync>;
/// Last chance to produce a URL after building failed: `(error, endpoint, values)`
pub type UrlBuildErrorFn = Arc<dyn Fn(&Error, &str, &ViewArgs) -> Option<String> + Send + Sync>;

/// Callback lists per scope
#[derive(Clone)]
pub struct Scoped<F> {
    entries: IndexMap<Option<String>, Vec<F>>,
}

impl<F> Default for Scoped<F> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<F: Clone> Scoped<F> {
    /// Append a callback to a scope
    pub fn push(&mut self, scope: Option<&str>, f: F) {
        self.entries
            .entry(scope.map(str::to_string))
            .or_default()
            .push(f);
    }

    /// Callbacks of one scope, in registration order
    #[must_use]
    pub fn get(&self, scope: Option<&str>) -> Vec<F> {
        self.entries
            .get(&scope.map(str::to_string))
            .cloned()
            .unwrap_or_default()
    }

    /// Global callbacks, then the blueprint's, each in registration order
    #[must_use]
    pub fn forward(&self, blueprint: Option<&str>) -> Vec<F> {
        let mut funcs = self.get(None);
        if blueprint.is_some() {
            funcs.extend(self.get(blueprint));
        }
        funcs
    }

    /// Blueprint callbacks reversed, then global ones reversed
    #[must_use]
    pub fn backward(&self, blueprint: Option<&str>) -> Vec<F> {
        let mut funcs = Vec::new();
        if blueprint.is_some() {
            funcs.extend(self.get(blueprint).into_iter().rev());
        }
        funcs.extend(self.get(None).into_iter().rev());
        funcs
    }

    /// Global callbacks reversed, then the blueprint's reversed
    #[must_use]
    pub fn teardown_order(&self, blueprint: Option<&str>) -> Vec<F> {
        let mut funcs: Vec<F> = self.get(None).into_iter().rev().collect();
        if blueprint.is_some() {
            funcs.extend(self.get(blueprint).into_iter().rev());
        }
        funcs
    }

    /// Number of callbacks across all scopes
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether no callback is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type HandlerMap = IndexMap<ErrorClass, ErrorHandlerFn>;

/// Error handlers by scope, then status code, then class
#[derive(Clone, Default)]
pub struct ErrorHandlers {
    by_scope: HashMap<Option<String>, HashMap<Option<u16>, HandlerMap>>,
}

impl ErrorHandlers {
    /// Register a handler under a status code or an error class
    ///
    /// Registering an HTTP class is the same as registering its code.
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` for an unknown status code.
    pub fn register(&mut self, scope: Option<&str>, key: ErrorKey, f: ErrorHandlerFn) -> Result<()> {
        let (class, code) = key.class_and_code()?;
        self.by_scope
            .entry(scope.map(str::to_string))
            .or_default()
            .entry(code)
            .or_default()
            .insert(class, f);
        Ok(())
    }

    /// Most specific handler for `error`
    ///
    /// Lookup order: blueprint by code, app by code, blueprint by class,
    /// app by class; each step walks the class chain from specific to
    /// catch-all.
    #[must_use]
    pub fn find(&self, error: &Error, blueprint: Option<&str>) -> Option<ErrorHandlerFn> {
        let chain = error.class_chain();
        let codes = match error.code() {
            Some(code) => vec![Some(code), None],
            None => vec![None],
        };
        let mut scopes = Vec::with_capacity(2);
        if let Some(bp) = blueprint {
            scopes.push(Some(bp.to_string()));
        }
        scopes.push(None);

        for code in &codes {
            for scope in &scopes {
                let Some(map) = self.by_scope.get(scope).and_then(|by_code| by_code.get(code)) else {
                    continue;
                };
                if let Some(handler) = chain.iter().find_map(|class| map.get(class)) {
                    return Some(Arc::clone(handler));
                }
            }
        }
        None
    }
}

/// Every hook collection of an application
#[derive(Default)]
pub struct Registry {
    pub(crate) before_request: RwLock<Scoped<BeforeRequestFn>>,
    pub(crate) after_request: RwLock<Scoped<AfterRequestFn>>,
    pub(crate) teardown_request: RwLock<Scoped<TeardownRequestFn>>,
    pub(crate) url_value_preprocessors: RwLock<Scoped<UrlValuePreprocessorFn>>,
    pub(crate) url_default_functions: RwLock<Scoped<UrlDefaultsFn>>,
    pub(crate) template_context_processors: RwLock<Scoped<ContextProcessorFn>>,
    pub(crate) error_handlers: RwLock<ErrorHandlers>,
    pub(crate) before_first_request: RwLock<Vec<FirstRequestFn>>,
    pub(crate) teardown_appcontext: RwLock<Vec<TeardownAppFn>>,
    pub(crate) url_build_error_handlers: RwLock<Vec<UrlBuildErrorFn>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("before_request", &self.before_request.read().len())
            .field("after_request", &self.after_request.read().len())
            .field("teardown_request", &self.teardown_request.read().len())
            .field("teardown_appcontext", &self.teardown_appcontext.read().len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Find the error handler for `error` raised under `blueprint`
    #[must_use]
    pub fn find_error_handler(&self, error: &Error, blueprint: Option<&str>) -> Option<ErrorHandlerFn> {
        self.error_handlers.read().find(error, blueprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::{abort, HttpException};

    #[derive(Debug, thiserror::Error)]
    #[error("custom")]
    struct Custom;

    fn handler(tag: &'static str) -> ErrorHandlerFn {
        Arc::new(move |_, _| Ok(ViewReturn::from(tag)))
    }

    fn tag_of(h: &ErrorHandlerFn, ctx: &RequestContext, e: &Error) -> String {
        match h(ctx, e).unwrap() {
            ViewReturn::Text(s) => s,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_scoped_ordering() {
        let mut scoped: Scoped<&str> = Scoped::default();
        scoped.push(None, "A");
        scoped.push(Some("bp"), "B");
        scoped.push(None, "A2");
        scoped.push(Some("bp"), "B2");

        assert_eq!(scoped.forward(Some("bp")), vec!["A", "A2", "B", "B2"]);
        assert_eq!(scoped.forward(None), vec!["A", "A2"]);
        assert_eq!(scoped.backward(Some("bp")), vec!["B2", "B", "A2", "A"]);
        assert_eq!(scoped.teardown_order(Some("bp")), vec!["A2", "A", "B2", "B"]);
        assert_eq!(scoped.len(), 4);
    }

    #[test]
    fn test_blueprint_code_beats_global_class() {
        let app = App::new("hooks");
        let ctx = app.test_request_context("/");
        let mut handlers = ErrorHandlers::default();
        handlers
            .register(None, ErrorClass::Http(404).into(), handler("global-class"))
            .unwrap();
        handlers.register(Some("bp"), ErrorKey::Code(404), handler("bp-code")).unwrap();

        let err = abort(404);
        let found = handlers.find(&err, Some("bp")).unwrap();
        assert_eq!(tag_of(&found, &ctx, &err), "bp-code");
        let found = handlers.find(&err, None).unwrap();
        assert_eq!(tag_of(&found, &ctx, &err), "global-class");
    }

    #[test]
    fn test_class_walk() {
        let app = App::new("hooks");
        let ctx = app.test_request_context("/");
        let mut handlers = ErrorHandlers::default();
        handlers
            .register(None, ErrorClass::HttpException.into(), handler("http"))
            .unwrap();
        handlers.register(None, ErrorClass::Any.into(), handler("any")).unwrap();

        let err = Error::from(HttpException::method_not_allowed(vec!["GET".into()]));
        assert_eq!(tag_of(&handlers.find(&err, None).unwrap(), &ctx, &err), "http");

        let err = Error::user(Custom);
        assert_eq!(tag_of(&handlers.find(&err, None).unwrap(), &ctx, &err), "any");

        handlers.register(Some("bp"), ErrorKey::of::<Custom>(), handler("custom")).unwrap();
        assert_eq!(tag_of(&handlers.find(&err, Some("bp")).unwrap(), &ctx, &err), "custom");
        assert_eq!(tag_of(&handlers.find(&err, None).unwrap(), &ctx, &err), "any");
    }

    #[test]
    fn test_unknown_code_rejected() {
        let mut handlers = ErrorHandlers::default();
        assert!(matches!(
            handlers.register(None, ErrorKey::Code(999), handler("x")),
            Err(Error::Setup(_))
        ));
        assert!(handlers.find(&abort(500), None).is_none());
    }
}
