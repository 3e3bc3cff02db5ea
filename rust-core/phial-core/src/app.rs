//! # Application
//!
//! The central object: configuration, URL map, view functions, hooks,
//! blueprints, session interface and template environment. Setup happens
//! through `&self` methods so an `Arc<App>` can be shared with contexts and
//! server threads; every setup method fails once the first request has been
//! handled.

use crate::blueprint::{Blueprint, BlueprintOptions, BlueprintSetupState};
use crate::coerce::{make_response, ViewReturn};
use crate::config::Config;
use crate::ctx::{AppContext, RequestContext};
use crate::environ::Environ;
use crate::error::{Error, ErrorKey, Result};
use crate::hooks::{
    AfterRequestFn, BeforeRequestFn, ContextProcessorFn, ErrorHandlerFn, FirstRequestFn,
    Registry, TeardownAppFn, TeardownRequestFn, UrlBuildErrorFn, UrlDefaultsFn,
    UrlValuePreprocessorFn, ViewFn,
};
use crate::request::Request;
use crate::response::Response;
use crate::route::Rule;
use crate::router::{MapAdapter, UrlAdapter, UrlMap};
use crate::sessions::{SecureCookieSessionInterface, SessionInterface};
use crate::signals::Signals;
use crate::templating::Templates;
use crate::types::ViewArgs;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Options for `App::add_url_rule`
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Accepted methods; defaults to GET
    pub methods: Option<Vec<String>>,
    /// Default view arguments
    pub defaults: ViewArgs,
    /// Redirect slash-less URLs of rules ending in `/`; defaults to true
    pub strict_slashes: Option<bool>,
    /// Answer OPTIONS automatically; defaults to true unless OPTIONS is listed
    pub provide_automatic_options: Option<bool>,
}

impl RouteOptions {
    /// Default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set accepted methods
    #[must_use]
    pub fn methods(mut self, methods: &[&str]) -> Self {
        self.methods = Some(methods.iter().map(|m| m.to_uppercase()).collect());
        self
    }

    /// Add a default view argument
    #[must_use]
    pub fn default_value(mut self, key: &str, value: impl Into<crate::types::ParamValue>) -> Self {
        self.defaults.insert(key.to_string(), value.into());
        self
    }

    /// Set slash strictness
    #[must_use]
    pub const fn strict_slashes(mut self, strict: bool) -> Self {
        self.strict_slashes = Some(strict);
        self
    }

    /// Enable or disable the automatic OPTIONS response
    #[must_use]
    pub const fn automatic_options(mut self, enabled: bool) -> Self {
        self.provide_automatic_options = Some(enabled);
        self
    }
}

/// A web application
pub struct App {
    name: String,
    this: Weak<App>,
    config: RwLock<Config>,
    url_map: RwLock<Arc<UrlMap>>,
    view_functions: RwLock<HashMap<String, ViewFn>>,
    pub(crate) hooks: Registry,
    signals: Signals,
    blueprints: RwLock<IndexMap<String, Arc<Blueprint>>>,
    session_interface: RwLock<Arc<dyn SessionInterface>>,
    pub(crate) templates: Templates,
    got_first_request: AtomicBool,
    before_first_request_lock: Mutex<()>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("rules", &self.url_map.read().rules().len())
            .field("blueprints", &self.blueprints.read().keys().collect::<Vec<_>>())
            .field("got_first_request", &self.got_first_request())
            .finish_non_exhaustive()
    }
}

impl App {
    /// Create an application with default configuration
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_config(name, Config::default())
    }

    /// Create an application with the given configuration
    #[must_use]
    pub fn with_config(name: &str, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            this: this.clone(),
            config: RwLock::new(config),
            url_map: RwLock::new(Arc::new(UrlMap::new())),
            view_functions: RwLock::new(HashMap::new()),
            hooks: Registry::default(),
            signals: Signals::default(),
            blueprints: RwLock::new(IndexMap::new()),
            session_interface: RwLock::new(Arc::new(SecureCookieSessionInterface::new())),
            templates: Templates::new(Some(PathBuf::from("templates"))),
            got_first_request: AtomicBool::new(false),
            before_first_request_lock: Mutex::new(()),
        })
    }

    /// Application name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning handle of this application
    pub(crate) fn handle(&self) -> Result<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| Error::Setup(format!("application '{}' is shutting down", self.name)))
    }

    /// Read access to the configuration
    pub fn config(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read()
    }

    /// Write access to the configuration
    pub fn config_mut(&self) -> RwLockWriteGuard<'_, Config> {
        self.config.write()
    }

    /// Debug mode
    #[must_use]
    pub fn debug(&self) -> bool {
        self.config().debug
    }

    /// Testing mode
    #[must_use]
    pub fn testing(&self) -> bool {
        self.config().testing
    }

    /// Lifecycle signals
    #[must_use]
    pub const fn signals(&self) -> &Signals {
        &self.signals
    }

    /// Snapshot of the URL map
    #[must_use]
    pub fn url_map(&self) -> Arc<UrlMap> {
        Arc::clone(&self.url_map.read())
    }

    /// View function registered for an endpoint
    #[must_use]
    pub fn view_function(&self, endpoint: &str) -> Option<ViewFn> {
        self.view_functions.read().get(endpoint).cloned()
    }

    /// Registered blueprints, in registration order
    #[must_use]
    pub fn blueprints(&self) -> Vec<Arc<Blueprint>> {
        self.blueprints.read().values().cloned().collect()
    }

    /// Active session interface
    #[must_use]
    pub fn session_interface(&self) -> Arc<dyn SessionInterface> {
        Arc::clone(&self.session_interface.read())
    }

    /// Replace the session interface
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn set_session_interface(&self, interface: Arc<dyn SessionInterface>) -> Result<()> {
        self.check_setup("set_session_interface")?;
        *self.session_interface.write() = interface;
        Ok(())
    }

    /// Whether a request has been dispatched
    #[must_use]
    pub fn got_first_request(&self) -> bool {
        self.got_first_request.load(Ordering::SeqCst)
    }

    pub(crate) fn check_setup(&self, what: &str) -> Result<()> {
        if self.got_first_request() {
            return Err(Error::Setup(format!(
                "The setup method '{what}' can no longer be called on the \
                 application. It has already handled its first request, any \
                 changes will not be applied consistently. Make sure all \
                 imports, decorators, functions, etc. needed to set up the \
                 application are done before running it."
            )));
        }
        Ok(())
    }

    pub(crate) fn first_request_gate(&self) -> (&AtomicBool, &Mutex<()>) {
        (&self.got_first_request, &self.before_first_request_lock)
    }

    /// New application context (not pushed)
    #[must_use]
    pub fn app_context(self: &Arc<Self>) -> Arc<AppContext> {
        AppContext::new(Arc::clone(self))
    }

    /// New request context for an environment (not pushed)
    #[must_use]
    pub fn request_context(self: &Arc<Self>, environ: Environ) -> Arc<RequestContext> {
        RequestContext::new(Arc::clone(self), Request::new(environ))
    }

    /// Request context for a GET of `path` on `localhost`
    #[must_use]
    pub fn test_request_context(self: &Arc<Self>, path: &str) -> Arc<RequestContext> {
        self.request_context(Environ::builder(path).build())
    }

    /// URL adapter bound to a request, or to `server_name` without one
    #[must_use]
    pub fn create_url_adapter(&self, request: Option<&Request>) -> Option<Arc<dyn UrlAdapter>> {
        let config = self.config();
        let map = self.url_map();
        match request {
            Some(request) => {
                let environ = request.environ();
                let server_name = config
                    .server_name
                    .clone()
                    .unwrap_or_else(|| environ.host());
                Some(Arc::new(
                    MapAdapter::new(map, &server_name, &environ.script_name, &environ.url_scheme)
                        .with_query_string(&environ.query_string),
                ))
            }
            None => {
                let server_name = config.server_name.as_deref()?;
                Some(Arc::new(MapAdapter::new(
                    map,
                    server_name,
                    &config.application_root,
                    &config.preferred_url_scheme,
                )))
            }
        }
    }

    /// Register a URL rule and optionally its view function
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request, for an unknown method,
    /// or when the endpoint already maps to a different view function;
    /// `Error::InvalidRoutePattern` for a malformed rule.
    pub fn add_url_rule(
        &self,
        rule: &str,
        endpoint: &str,
        view: Option<ViewFn>,
        options: RouteOptions,
    ) -> Result<()> {
        self.check_setup("add_url_rule")?;
        if endpoint.is_empty() {
            return Err(Error::Setup(format!("rule '{rule}' needs an endpoint name")));
        }

        let methods: Vec<String> = options
            .methods
            .unwrap_or_else(|| vec!["GET".to_string()])
            .into_iter()
            .map(|m| m.to_uppercase())
            .collect();
        let provide_automatic_options = options
            .provide_automatic_options
            .unwrap_or_else(|| !methods.iter().any(|m| m == "OPTIONS"));
        let method_refs: Vec<&str> = methods.iter().map(String::as_str).collect();

        let mut url_rule = Rule::new(rule, endpoint, Some(&method_refs))?
            .with_defaults(options.defaults)
            .with_automatic_options(provide_automatic_options);
        if let Some(strict) = options.strict_slashes {
            url_rule = url_rule.with_strict_slashes(strict);
        }

        let mut view_functions = self.view_functions.write();
        if let Some(view) = &view {
            if let Some(existing) = view_functions.get(endpoint) {
                if !Arc::ptr_eq(existing, view) {
                    return Err(Error::Setup(format!(
                        "View function mapping is overwriting an existing \
                         endpoint function: {endpoint}"
                    )));
                }
            }
        }

        {
            let mut map = self.url_map.write();
            Arc::make_mut(&mut map).add(url_rule)?;
        }
        if let Some(view) = view {
            view_functions.insert(endpoint.to_string(), view);
        }
        debug!(rule, endpoint, methods = ?methods, "Registered URL rule");
        Ok(())
    }

    /// Register a view function for a rule
    ///
    /// # Errors
    ///
    /// See `add_url_rule`.
    pub fn route<F, R>(&self, rule: &str, endpoint: &str, view: F) -> Result<()>
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.route_with(rule, endpoint, RouteOptions::default(), view)
    }

    /// Register a view function for a rule with options
    ///
    /// # Errors
    ///
    /// See `add_url_rule`.
    pub fn route_with<F, R>(
        &self,
        rule: &str,
        endpoint: &str,
        options: RouteOptions,
        view: F,
    ) -> Result<()>
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.add_url_rule(rule, endpoint, Some(wrap_view(view)), options)
    }

    /// Register a view function for an endpoint without adding a rule
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn endpoint<F, R>(&self, endpoint: &str, view: F) -> Result<()>
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.check_setup("endpoint")?;
        self.view_functions
            .write()
            .insert(endpoint.to_string(), wrap_view(view));
        Ok(())
    }

    /// Register a blueprint
    ///
    /// Registering the same blueprint twice replays its setup with
    /// `first_registration` unset.
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request or when a different
    /// blueprint already uses the name; failures of the replayed setup.
    pub fn register_blueprint(&self, blueprint: Arc<Blueprint>, options: BlueprintOptions) -> Result<()> {
        self.check_setup("register_blueprint")?;
        if blueprint.name().contains('.') {
            return Err(Error::Setup(format!(
                "Blueprint names should not contain dots: '{}'",
                blueprint.name()
            )));
        }
        let first_registration = {
            let mut blueprints = self.blueprints.write();
            match blueprints.get(blueprint.name()) {
                Some(existing) if !Arc::ptr_eq(existing, &blueprint) => {
                    return Err(Error::Setup(format!(
                        "A name collision occurred between blueprints. Both \
                         share the same name '{}'. Blueprints that are \
                         created on the fly need unique names.",
                        blueprint.name()
                    )));
                }
                Some(_) => false,
                None => {
                    blueprints.insert(blueprint.name().to_string(), Arc::clone(&blueprint));
                    true
                }
            }
        };
        let state = BlueprintSetupState::new(self, &blueprint, options, first_registration);
        blueprint.register(&state)?;
        self.templates.invalidate();
        debug!(blueprint = %blueprint.name(), first_registration, "Registered blueprint");
        Ok(())
    }

    /// Run before each request; returning `Some` skips the view
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn before_request<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&RequestContext) -> Result<Option<ViewReturn>> + Send + Sync + 'static,
    {
        self.add_before_request(None, Arc::new(f))
    }

    /// Run after each request to modify the response
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn after_request<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&RequestContext, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        self.add_after_request(None, Arc::new(f))
    }

    /// Run when a request context is torn down, even after failures
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn teardown_request<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&RequestContext, Option<&Error>) -> Result<()> + Send + Sync + 'static,
    {
        self.add_teardown_request(None, Arc::new(f))
    }

    /// Run when an application context is torn down
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn teardown_appcontext<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&AppContext, Option<&Error>) -> Result<()> + Send + Sync + 'static,
    {
        self.check_setup("teardown_appcontext")?;
        let f: TeardownAppFn = Arc::new(f);
        self.hooks.teardown_appcontext.write().push(f);
        Ok(())
    }

    /// Run once before the first request
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn before_first_request<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Self) -> Result<()> + Send + Sync + 'static,
    {
        self.add_before_first_request(Arc::new(f))
    }

    /// Rewrite view arguments after matching
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn url_value_preprocessor<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Option<&str>, &mut ViewArgs) -> Result<()> + Send + Sync + 'static,
    {
        self.add_url_value_preprocessor(None, Arc::new(f))
    }

    /// Inject values before URLs are built
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn url_defaults<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&str, &mut ViewArgs) + Send + Sync + 'static,
    {
        self.add_url_defaults(None, Arc::new(f))
    }

    /// Supply extra template variables
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn context_processor<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&AppContext) -> Result<Map<String, Value>> + Send + Sync + 'static,
    {
        self.add_context_processor(None, Arc::new(f))
    }

    /// Handle errors matching a status code or error class
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request or for an unknown
    /// status code.
    pub fn register_error_handler<K, F, R>(&self, key: K, f: F) -> Result<()>
    where
        K: Into<ErrorKey>,
        F: Fn(&RequestContext, &Error) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.add_error_handler(None, key.into(), wrap_error_handler(f))
    }

    /// Produce a URL when building fails; `None` passes to the next handler
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn url_build_error_handler<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Error, &str, &ViewArgs) -> Option<String> + Send + Sync + 'static,
    {
        self.check_setup("url_build_error_handler")?;
        let f: UrlBuildErrorFn = Arc::new(f);
        self.hooks.url_build_error_handlers.write().push(f);
        Ok(())
    }

    /// Set a global template variable
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn template_global(&self, name: &str, value: Value) -> Result<()> {
        self.check_setup("template_global")?;
        self.templates.add_global(name, value);
        Ok(())
    }

    /// Register a template function
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn template_function<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.check_setup("template_function")?;
        self.templates.add_function(name, Arc::new(f));
        Ok(())
    }

    /// Replace the application template folder
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` after the first request.
    pub fn set_template_folder(&self, folder: Option<PathBuf>) -> Result<()> {
        self.check_setup("set_template_folder")?;
        self.templates.set_folder(folder);
        Ok(())
    }

    pub(crate) fn add_before_request(&self, scope: Option<&str>, f: BeforeRequestFn) -> Result<()> {
        self.check_setup("before_request")?;
        self.hooks.before_request.write().push(scope, f);
        Ok(())
    }

    pub(crate) fn add_after_request(&self, scope: Option<&str>, f: AfterRequestFn) -> Result<()> {
        self.check_setup("after_request")?;
        self.hooks.after_request.write().push(scope, f);
        Ok(())
    }

    pub(crate) fn add_teardown_request(
        &self,
        scope: Option<&str>,
        f: TeardownRequestFn,
    ) -> Result<()> {
        self.check_setup("teardown_request")?;
        self.hooks.teardown_request.write().push(scope, f);
        Ok(())
    }

    pub(crate) fn add_before_first_request(&self, f: FirstRequestFn) -> Result<()> {
        self.check_setup("before_first_request")?;
        self.hooks.before_first_request.write().push(f);
        Ok(())
    }

    pub(crate) fn add_url_value_preprocessor(
        &self,
        scope: Option<&str>,
        f: UrlValuePreprocessorFn,
    ) -> Result<()> {
        self.check_setup("url_value_preprocessor")?;
        self.hooks.url_value_preprocessors.write().push(scope, f);
        Ok(())
    }

    pub(crate) fn add_url_defaults(&self, scope: Option<&str>, f: UrlDefaultsFn) -> Result<()> {
        self.check_setup("url_defaults")?;
        self.hooks.url_default_functions.write().push(scope, f);
        Ok(())
    }

    pub(crate) fn add_context_processor(
        &self,
        scope: Option<&str>,
        f: ContextProcessorFn,
    ) -> Result<()> {
        self.check_setup("context_processor")?;
        self.hooks.template_context_processors.write().push(scope, f);
        Ok(())
    }

    pub(crate) fn add_error_handler(
        &self,
        scope: Option<&str>,
        key: ErrorKey,
        f: ErrorHandlerFn,
    ) -> Result<()> {
        self.check_setup("register_error_handler")?;
        self.hooks.error_handlers.write().register(scope, key, f)
    }

    /// Run the url-default functions for `endpoint` (global, then its blueprint)
    pub fn inject_url_defaults(&self, endpoint: &str, values: &mut ViewArgs) {
        let blueprint = endpoint.rsplit_once('.').map(|(bp, _)| bp);
        let funcs = self.hooks.url_default_functions.read().forward(blueprint);
        for func in funcs {
            func(endpoint, values);
        }
    }

    /// Give the url-build-error handlers a chance to produce a URL
    ///
    /// # Errors
    ///
    /// Returns the last build error when no handler produced a URL.
    pub fn handle_url_build_error(&self, error: Error, endpoint: &str, values: &ViewArgs) -> Result<String> {
        let handlers = self.hooks.url_build_error_handlers.read().clone();
        for handler in handlers {
            if let Some(url) = handler(&error, endpoint, values) {
                return Ok(url);
            }
        }
        Err(error)
    }

    /// Convert a view return value into a response for `environ`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidResponse` for values that cannot become a response.
    pub fn make_response(&self, environ: &Environ, rv: ViewReturn) -> Result<Response> {
        let config = self.config().clone();
        make_response(&config, environ, rv)
    }
}

/// Box a typed view closure as a `ViewFn`
pub fn wrap_view<F, R>(view: F) -> ViewFn
where
    F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
    R: Into<ViewReturn>,
{
    Arc::new(move |ctx, args| view(ctx, args).map(Into::into))
}

/// Box a typed error handler closure as an `ErrorHandlerFn`
pub fn wrap_error_handler<F, R>(handler: F) -> ErrorHandlerFn
where
    F: Fn(&RequestContext, &Error) -> Result<R> + Send + Sync + 'static,
    R: Into<ViewReturn>,
{
    Arc::new(move |ctx, error| handler(ctx, error).map(Into::into))
}
