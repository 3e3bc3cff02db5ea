//! # Blueprints
//!
//! A blueprint records routes, hooks and error handlers without an
//! application. Registering it replays the recordings against the
//! application, prefixing rules and endpoints with the blueprint's mount
//! point and name.

use crate::app::{wrap_error_handler, wrap_view, App, RouteOptions};
use crate::coerce::ViewReturn;
use crate::ctx::{AppContext, RequestContext};
use crate::error::{Error, ErrorKey, Result};
use crate::hooks::{
    AfterRequestFn, BeforeRequestFn, ContextProcessorFn, FirstRequestFn, TeardownRequestFn,
    UrlDefaultsFn, UrlValuePreprocessorFn, ViewFn,
};
use crate::response::Response;
use crate::types::{ParamValue, ViewArgs};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type DeferredFn = Box<dyn Fn(&BlueprintSetupState<'_>) -> Result<()> + Send + Sync>;

/// Per-registration overrides
#[derive(Debug, Clone, Default)]
pub struct BlueprintOptions {
    /// Mount point replacing the blueprint's own prefix
    pub url_prefix: Option<String>,
    /// Extra default view arguments for every rule
    pub url_defaults: ViewArgs,
}

impl BlueprintOptions {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount under `prefix`
    #[must_use]
    pub fn url_prefix(mut self, prefix: &str) -> Self {
        self.url_prefix = Some(prefix.to_string());
        self
    }

    /// Add a default view argument
    #[must_use]
    pub fn url_default(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.url_defaults.insert(key.to_string(), value.into());
        self
    }
}

/// State handed to every recorded setup function during registration
pub struct BlueprintSetupState<'a> {
    /// The application being set up
    pub app: &'a App,
    /// The blueprint being registered
    pub blueprint: &'a Blueprint,
    /// Effective mount point
    pub url_prefix: Option<String>,
    /// Effective default view arguments
    pub url_defaults: ViewArgs,
    /// Whether this is the blueprint's first registration on the app
    pub first_registration: bool,
}

impl<'a> BlueprintSetupState<'a> {
    pub(crate) fn new(
        app: &'a App,
        blueprint: &'a Blueprint,
        options: BlueprintOptions,
        first_registration: bool,
    ) -> Self {
        let mut url_defaults = blueprint.url_defaults.clone();
        url_defaults.extend(options.url_defaults);
        Self {
            app,
            blueprint,
            url_prefix: options.url_prefix.or_else(|| blueprint.url_prefix.clone()),
            url_defaults,
            first_registration,
        }
    }

    /// Register a rule under the blueprint's prefix and endpoint namespace
    ///
    /// # Errors
    ///
    /// See `App::add_url_rule`.
    pub fn add_url_rule(
        &self,
        rule: &str,
        endpoint: &str,
        view: Option<ViewFn>,
        mut options: RouteOptions,
    ) -> Result<()> {
        let rule = match &self.url_prefix {
            Some(prefix) if rule.is_empty() => prefix.clone(),
            Some(prefix) => format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                rule.trim_start_matches('/')
            ),
            None => rule.to_string(),
        };
        let mut defaults = self.url_defaults.clone();
        defaults.extend(options.defaults);
        options.defaults = defaults;

        let endpoint = format!("{}.{endpoint}", self.blueprint.name);
        self.app.add_url_rule(&rule, &endpoint, view, options)
    }
}

/// A recorded group of routes and hooks
pub struct Blueprint {
    name: String,
    url_prefix: Option<String>,
    url_defaults: ViewArgs,
    template_folder: Option<PathBuf>,
    deferred: Vec<DeferredFn>,
}

impl std::fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blueprint")
            .field("name", &self.name)
            .field("url_prefix", &self.url_prefix)
            .field("template_folder", &self.template_folder)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl Blueprint {
    /// Create an empty blueprint
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            url_prefix: None,
            url_defaults: ViewArgs::new(),
            template_folder: None,
            deferred: Vec::new(),
        }
    }

    /// Mount every rule under `prefix`
    #[must_use]
    pub fn with_url_prefix(mut self, prefix: &str) -> Self {
        self.url_prefix = Some(prefix.to_string());
        self
    }

    /// Default view argument for every rule
    #[must_use]
    pub fn with_url_default(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.url_defaults.insert(key.to_string(), value.into());
        self
    }

    /// Folder searched for templates after the application's
    #[must_use]
    pub fn with_template_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.template_folder = Some(folder.into());
        self
    }

    /// Blueprint name; also the endpoint prefix
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Template folder, if any
    #[must_use]
    pub fn template_folder(&self) -> Option<&Path> {
        self.template_folder.as_deref()
    }

    /// Record a function to run on every registration
    pub fn record<F>(&mut self, f: F)
    where
        F: Fn(&BlueprintSetupState<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.deferred.push(Box::new(f));
    }

    /// Record a function to run on the first registration only
    pub fn record_once<F>(&mut self, f: F)
    where
        F: Fn(&BlueprintSetupState<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.record(move |state| {
            if state.first_registration {
                f(state)
            } else {
                Ok(())
            }
        });
    }

    pub(crate) fn register(&self, state: &BlueprintSetupState<'_>) -> Result<()> {
        for deferred in &self.deferred {
            deferred(state)?;
        }
        Ok(())
    }

    /// Record a rule; the endpoint is prefixed with the blueprint name
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` when `endpoint` contains a dot.
    pub fn add_url_rule(
        &mut self,
        rule: &str,
        endpoint: &str,
        view: Option<ViewFn>,
        options: RouteOptions,
    ) -> Result<()> {
        if endpoint.contains('.') {
            return Err(Error::Setup(format!(
                "Blueprint endpoints should not contain dots: '{endpoint}'"
            )));
        }
        let rule = rule.to_string();
        let endpoint = endpoint.to_string();
        self.record(move |state| {
            state.add_url_rule(&rule, &endpoint, view.clone(), options.clone())
        });
        Ok(())
    }

    /// Record a view function for a rule
    ///
    /// # Errors
    ///
    /// See `add_url_rule`.
    pub fn route<F, R>(&mut self, rule: &str, endpoint: &str, view: F) -> Result<()>
    where
        F: Fn(&RequestContext, &ViewArgs) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        self.add_url_rule(rule, endpoint, Some(wrap_view(view)), RouteOptions::default())
    }

    /// Record a view function for a rule with options
    ///
    /// # Errors
    ///
    /// See `add_url_rule`.
    pub fn route_with<F, R>(
        &mut self,
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

    fn scope(&self) -> String {
        self.name.clone()
    }

    /// Run before requests handled by this blueprint
    pub fn before_request<F>(&mut self, f: F)
    where
        F: Fn(&RequestContext) -> Result<Option<ViewReturn>> + Send + Sync + 'static,
    {
        let f: BeforeRequestFn = Arc::new(f);
        let scope = self.scope();
        self.record_once(move |s| s.app.add_before_request(Some(&scope), Arc::clone(&f)));
    }

    /// Run before every request of the application
    pub fn before_app_request<F>(&mut self, f: F)
    where
        F: Fn(&RequestContext) -> Result<Option<ViewReturn>> + Send + Sync + 'static,
    {
        let f: BeforeRequestFn = Arc::new(f);
        self.record_once(move |s| s.app.add_before_request(None, Arc::clone(&f)));
    }

    /// Run once before the application's first request
    pub fn before_app_first_request<F>(&mut self, f: F)
    where
        F: Fn(&App) -> Result<()> + Send + Sync + 'static,
    {
        let f: FirstRequestFn = Arc::new(f);
        self.record_once(move |s| s.app.add_before_first_request(Arc::clone(&f)));
    }

    /// Run after requests handled by this blueprint
    pub fn after_request<F>(&mut self, f: F)
    where
        F: Fn(&RequestContext, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        let f: AfterRequestFn = Arc::new(f);
        let scope = self.scope();
        self.record_once(move |s| s.app.add_after_request(Some(&scope), Arc::clone(&f)));
    }

    /// Run after every request of the application
    pub fn after_app_request<F>(&mut self, f: F)
    where
        F: Fn(&RequestContext, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        let f: AfterRequestFn = Arc::new(f);
        self.record_once(move |s| s.app.add_after_request(None, Arc::clone(&f)));
    }

    /// Run when tearing down requests handled by this blueprint
    pub fn teardown_request<F>(&mut self, f: F)
    where
        F: Fn(&RequestContext, Option<&Error>) -> Result<()> + Send + Sync + 'static,
    {
        let f: TeardownRequestFn = Arc::new(f);
        let scope = self.scope();
        self.record_once(move |s| s.app.add_teardown_request(Some(&scope), Arc::clone(&f)));
    }

    /// Run when tearing down every request of the application
    pub fn teardown_app_request<F>(&mut self, f: F)
    where
        F: Fn(&RequestContext, Option<&Error>) -> Result<()> + Send + Sync + 'static,
    {
        let f: TeardownRequestFn = Arc::new(f);
        self.record_once(move |s| s.app.add_teardown_request(None, Arc::clone(&f)));
    }

    /// Rewrite view arguments of this blueprint's endpoints
    pub fn url_value_preprocessor<F>(&mut self, f: F)
    where
        F: Fn(Option<&str>, &mut ViewArgs) -> Result<()> + Send + Sync + 'static,
    {
        let f: UrlValuePreprocessorFn = Arc::new(f);
        let scope = self.scope();
        self.record_once(move |s| s.app.add_url_value_preprocessor(Some(&scope), Arc::clone(&f)));
    }

    /// Rewrite view arguments of every endpoint
    pub fn app_url_value_preprocessor<F>(&mut self, f: F)
    where
        F: Fn(Option<&str>, &mut ViewArgs) -> Result<()> + Send + Sync + 'static,
    {
        let f: UrlValuePreprocessorFn = Arc::new(f);
        self.record_once(move |s| s.app.add_url_value_preprocessor(None, Arc::clone(&f)));
    }

    /// Inject values when building URLs for this blueprint's endpoints
    pub fn url_defaults<F>(&mut self, f: F)
    where
        F: Fn(&str, &mut ViewArgs) + Send + Sync + 'static,
    {
        let f: UrlDefaultsFn = Arc::new(f);
        let scope = self.scope();
        self.record_once(move |s| s.app.add_url_defaults(Some(&scope), Arc::clone(&f)));
    }

    /// Inject values when building any URL
    pub fn app_url_defaults<F>(&mut self, f: F)
    where
        F: Fn(&str, &mut ViewArgs) + Send + Sync + 'static,
    {
        let f: UrlDefaultsFn = Arc::new(f);
        self.record_once(move |s| s.app.add_url_defaults(None, Arc::clone(&f)));
    }

    /// Template variables for requests handled by this blueprint
    pub fn context_processor<F>(&mut self, f: F)
    where
        F: Fn(&AppContext) -> Result<Map<String, Value>> + Send + Sync + 'static,
    {
        let f: ContextProcessorFn = Arc::new(f);
        let scope = self.scope();
        self.record_once(move |s| s.app.add_context_processor(Some(&scope), Arc::clone(&f)));
    }

    /// Template variables for every template
    pub fn app_context_processor<F>(&mut self, f: F)
    where
        F: Fn(&AppContext) -> Result<Map<String, Value>> + Send + Sync + 'static,
    {
        let f: ContextProcessorFn = Arc::new(f);
        self.record_once(move |s| s.app.add_context_processor(None, Arc::clone(&f)));
    }

    /// Handle errors raised by this blueprint's views
    ///
    /// Unknown status codes fail at registration.
    pub fn register_error_handler<K, F, R>(&mut self, key: K, f: F)
    where
        K: Into<ErrorKey>,
        F: Fn(&RequestContext, &Error) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        let key = key.into();
        let f = wrap_error_handler(f);
        let scope = self.scope();
        self.record_once(move |s| s.app.add_error_handler(Some(&scope), key, Arc::clone(&f)));
    }

    /// Handle errors raised anywhere in the application
    pub fn app_error_handler<K, F, R>(&mut self, key: K, f: F)
    where
        K: Into<ErrorKey>,
        F: Fn(&RequestContext, &Error) -> Result<R> + Send + Sync + 'static,
        R: Into<ViewReturn>,
    {
        let key = key.into();
        let f = wrap_error_handler(f);
        self.record_once(move |s| s.app.add_error_handler(None, key, Arc::clone(&f)));
    }

    /// Set a global template variable on the application
    pub fn app_template_global(&mut self, name: &str, value: Value) {
        let name = name.to_string();
        self.record_once(move |s| s.app.template_global(&name, value.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_endpoint_namespace() {
        let app = App::new("bp");
        let mut bp = Blueprint::new("admin").with_url_prefix("/admin/");
        bp.route("/users", "users", |_, _| Ok("users")).unwrap();
        bp.route("", "index", |_, _| Ok("index")).unwrap();
        app.register_blueprint(Arc::new(bp), BlueprintOptions::new())
            .unwrap();

        let map = app.url_map();
        let rules: Vec<(&str, &str)> = map
            .rules()
            .iter()
            .map(|r| (r.rule.as_str(), r.endpoint.as_str()))
            .collect();
        assert_eq!(
            rules,
            vec![("/admin/users", "admin.users"), ("/admin/", "admin.index")]
        );
    }

    #[test]
    fn test_registration_options_override() {
        let app = App::new("bp");
        let mut bp = Blueprint::new("api")
            .with_url_prefix("/v1")
            .with_url_default("version", 1);
        bp.route("/items", "items", |_, _| Ok("items")).unwrap();
        app.register_blueprint(
            Arc::new(bp),
            BlueprintOptions::new()
                .url_prefix("/v2")
                .url_default("version", 2),
        )
        .unwrap();

        let map = app.url_map();
        let rule = &map.rules()[0];
        assert_eq!(rule.rule, "/v2/items");
        assert_eq!(rule.defaults.get("version"), Some(&ParamValue::Int(2)));
    }

    #[test]
    fn test_dotted_endpoint_rejected() {
        let mut bp = Blueprint::new("bp");
        assert!(bp.route("/", "a.b", |_, _| Ok("x")).is_err());
    }

    #[test]
    fn test_name_collision() {
        let app = App::new("bp");
        app.register_blueprint(Arc::new(Blueprint::new("same")), BlueprintOptions::new())
            .unwrap();
        let err = app
            .register_blueprint(Arc::new(Blueprint::new("same")), BlueprintOptions::new())
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }

    #[test]
    fn test_second_registration_skips_record_once() {
        let app = App::new("bp");
        let mut bp = Blueprint::new("twice");
        bp.route("/a", "a", |_, _| Ok("a")).unwrap();
        bp.before_request(|_| Ok(None));
        let bp = Arc::new(bp);

        app.register_blueprint(Arc::clone(&bp), BlueprintOptions::new().url_prefix("/one"))
            .unwrap();
        app.register_blueprint(Arc::clone(&bp), BlueprintOptions::new().url_prefix("/two"))
            .unwrap();

        assert_eq!(app.url_map().rules_for("twice.a").len(), 2);
        assert_eq!(app.hooks.before_request.read().get(Some("twice")).len(), 1);
    }
}
