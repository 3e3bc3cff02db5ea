//! # Templating
//!
//! Jinja-style rendering over `minijinja`. Templates are looked up in the
//! application folder first, then in each blueprint folder in registration
//! order. Every render sees `config`, `g` and, inside a request, `request`
//! and `session`, followed by the context processors (global, then the
//! current blueprint's). Values passed by the caller win over all of them.
//!
//! The environment is built once and cached; with `templates_auto_reload`
//! it is rebuilt for every render so edited files are picked up.

use crate::app::App;
use crate::ctx::AppContext;
use crate::error::{Error, Result};
use crate::helpers::UrlFor;
use crate::signals::TemplateEvent;
use crate::stack;
use crate::types::{ParamValue, ViewArgs};
use indexmap::IndexMap;
use minijinja::value::{Kwargs, Rest};
use minijinja::{AutoEscape, Environment, ErrorKind};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

const INLINE_NAME: &str = "<string>";

/// A function callable from templates
pub type TemplateFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Template folder, globals, functions and the cached environment of an app
pub struct Templates {
    folder: RwLock<Option<PathBuf>>,
    globals: RwLock<Map<String, Value>>,
    functions: RwLock<IndexMap<String, TemplateFn>>,
    cached: RwLock<Option<Arc<Environment<'static>>>>,
}

impl std::fmt::Debug for Templates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Templates")
            .field("folder", &*self.folder.read())
            .field("globals", &self.globals.read().keys().collect::<Vec<_>>())
            .field("functions", &self.functions.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn jinja_error(e: &Error) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string())
}

fn to_json(value: &minijinja::Value) -> std::result::Result<Value, minijinja::Error> {
    serde_json::to_value(value)
        .map_err(|e| minijinja::Error::new(ErrorKind::BadSerialization, e.to_string()))
}

fn to_param(value: &minijinja::Value) -> std::result::Result<ParamValue, minijinja::Error> {
    Ok(match to_json(value)? {
        Value::String(s) => ParamValue::String(s),
        Value::Bool(b) => ParamValue::Bool(b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => ParamValue::Int(i),
            (None, Some(f)) => ParamValue::Float(f),
            _ => ParamValue::String(n.to_string()),
        },
        other => ParamValue::String(other.to_string()),
    })
}

/// Template names are relative paths without parent or root components
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\\')
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// `url_for(endpoint, **values)` with `_anchor`, `_method`, `_scheme` and
/// `_external` options
fn url_for_function(
    endpoint: String,
    kwargs: Kwargs,
) -> std::result::Result<minijinja::Value, minijinja::Error> {
    let mut builder = UrlFor::new(&endpoint);
    let mut values = ViewArgs::new();
    for key in kwargs.args() {
        let value: minijinja::Value = kwargs.get(key)?;
        match key {
            "_anchor" => builder = builder.anchor(&value.to_string()),
            "_method" => builder = builder.method(&value.to_string()),
            "_scheme" => builder = builder.scheme(&value.to_string()),
            "_external" => builder = builder.external(value.is_true()),
            _ => {
                values.insert(key.to_string(), to_param(&value)?);
            }
        }
    }
    let url = builder.values(values).build().map_err(|e| jinja_error(&e))?;
    Ok(minijinja::Value::from_safe_string(url))
}

/// `get_flashed_messages(with_categories=false, category_filter=[])`
fn flashed_messages_function(
    kwargs: Kwargs,
) -> std::result::Result<minijinja::Value, minijinja::Error> {
    let with_categories: Option<bool> = kwargs.get("with_categories")?;
    let filter: Option<Vec<String>> = kwargs.get("category_filter")?;
    let filter = filter.unwrap_or_default();
    let filter: Vec<&str> = filter.iter().map(String::as_str).collect();

    let Some(ctx) = stack::top_request_context() else {
        return Ok(minijinja::Value::from(Vec::<minijinja::Value>::new()));
    };
    let flashes = ctx.get_flashed_messages(&filter).map_err(|e| jinja_error(&e))?;
    let items = flashes
        .into_iter()
        .map(|(category, message)| {
            if with_categories.unwrap_or(false) {
                Value::Array(vec![Value::String(category), Value::String(message)])
            } else {
                Value::String(message)
            }
        })
        .collect::<Vec<_>>();
    Ok(minijinja::Value::from_serialize(&items))
}

impl Templates {
    /// Templates loaded from `folder` (relative to the working directory)
    #[must_use]
    pub fn new(folder: Option<PathBuf>) -> Self {
        Self {
            folder: RwLock::new(folder),
            globals: RwLock::new(Map::new()),
            functions: RwLock::new(IndexMap::new()),
            cached: RwLock::new(None),
        }
    }

    /// Application template folder
    #[must_use]
    pub fn folder(&self) -> Option<PathBuf> {
        self.folder.read().clone()
    }

    /// Replace the application template folder
    pub fn set_folder(&self, folder: Option<PathBuf>) {
        *self.folder.write() = folder;
        self.invalidate();
    }

    /// Add a variable visible in every template
    pub fn add_global(&self, name: &str, value: Value) {
        self.globals.write().insert(name.to_string(), value);
        self.invalidate();
    }

    /// Add a function callable from every template
    pub fn add_function(&self, name: &str, f: TemplateFn) {
        self.functions.write().insert(name.to_string(), f);
        self.invalidate();
    }

    /// Drop the cached environment
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    /// Folders searched for templates, in lookup order
    #[must_use]
    pub fn search_path(&self, app: &App) -> Vec<PathBuf> {
        let mut path: Vec<PathBuf> = self.folder().into_iter().collect();
        path.extend(
            app.blueprints()
                .iter()
                .filter_map(|bp| bp.template_folder().map(Path::to_path_buf)),
        );
        path
    }

    fn environment(&self, app: &App) -> Arc<Environment<'static>> {
        if app.config().templates_auto_reload_enabled() {
            return Arc::new(self.build_environment(app));
        }
        if let Some(env) = self.cached.read().as_ref() {
            return Arc::clone(env);
        }
        let env = Arc::new(self.build_environment(app));
        *self.cached.write() = Some(Arc::clone(&env));
        env
    }

    fn build_environment(&self, app: &App) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|name| {
            if name == INLINE_NAME {
                AutoEscape::Html
            } else {
                minijinja::default_auto_escape_callback(name)
            }
        });

        let search_path = self.search_path(app);
        debug!(app = %app.name(), folders = ?search_path, "Building template environment");
        env.set_loader(move |name| {
            if !is_safe_name(name) {
                return Ok(None);
            }
            for folder in &search_path {
                let candidate = folder.join(name);
                match std::fs::read_to_string(&candidate) {
                    Ok(source) => return Ok(Some(source)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(minijinja::Error::new(
                            ErrorKind::InvalidOperation,
                            format!("could not read template {}: {e}", candidate.display()),
                        ))
                    }
                }
            }
            Ok(None)
        });

        env.add_function("url_for", url_for_function);
        env.add_function("get_flashed_messages", flashed_messages_function);

        for (name, value) in self.globals.read().iter() {
            env.add_global(name.clone(), minijinja::Value::from_serialize(value));
        }
        for (name, f) in self.functions.read().iter() {
            let f = Arc::clone(f);
            env.add_function(
                name.clone(),
                move |args: Rest<minijinja::Value>| -> std::result::Result<minijinja::Value, minijinja::Error> {
                    let args = args
                        .iter()
                        .map(to_json)
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    let rv = f(&args).map_err(|e| jinja_error(&e))?;
                    Ok(minijinja::Value::from_serialize(&rv))
                },
            );
        }
        env
    }
}

/// Default variables plus context processor output, overridden by `context`
///
/// # Errors
///
/// Returns the first context processor failure.
pub fn update_template_context(
    app_ctx: &AppContext,
    context: Map<String, Value>,
) -> Result<Map<String, Value>> {
    let app = app_ctx.app();
    let request_ctx = stack::top_request_context().filter(|ctx| Arc::ptr_eq(ctx.app(), app));
    let blueprint = request_ctx.as_ref().and_then(|ctx| ctx.request().blueprint());

    let mut merged = Map::new();
    merged.insert("config".to_string(), Value::Object(app.config().to_map()));
    merged.insert("g".to_string(), Value::Object(app_ctx.g().to_json()));
    if let Some(ctx) = &request_ctx {
        merged.insert("request".to_string(), ctx.request_value());
        merged.insert("session".to_string(), Value::Object(ctx.session().to_map()));
    }

    let processors = app
        .hooks
        .template_context_processors
        .read()
        .forward(blueprint.as_deref());
    for processor in processors {
        merged.extend(processor(app_ctx)?);
    }
    merged.extend(context);
    Ok(merged)
}

enum Source<'a> {
    Named(&'a str),
    Inline(&'a str),
}

fn render(app_ctx: &AppContext, source: &Source<'_>, context: Map<String, Value>) -> Result<String> {
    let app = app_ctx.app();
    let context = Value::Object(update_template_context(app_ctx, context)?);
    let event = TemplateEvent {
        name: match source {
            Source::Named(name) => Some((*name).to_string()),
            Source::Inline(_) => None,
        },
        context,
    };
    app.signals().before_render_template.send(app, &event);

    let env = app.templates.environment(app);
    let rendered = match source {
        Source::Named(name) => env
            .get_template(name)
            .and_then(|tmpl| tmpl.render(&event.context)),
        Source::Inline(text) => env.render_named_str(INLINE_NAME, text, &event.context),
    }?;

    trace!(template = ?event.name, "Rendered template");
    app.signals().template_rendered.send(app, &event);
    Ok(rendered)
}

impl AppContext {
    /// Render a template from the search path
    ///
    /// # Errors
    ///
    /// Returns `Error::Template` for missing or broken templates and context
    /// processor failures.
    pub fn render_template(&self, name: &str, context: Map<String, Value>) -> Result<String> {
        render(self, &Source::Named(name), context)
    }

    /// Render template source text
    ///
    /// # Errors
    ///
    /// See `render_template`.
    pub fn render_template_string(&self, source: &str, context: Map<String, Value>) -> Result<String> {
        render(self, &Source::Inline(source), context)
    }
}

/// Render a template with the application context active on this thread
///
/// # Errors
///
/// Returns `Error::NoAppContext` without an application context.
pub fn render_template(name: &str, context: Map<String, Value>) -> Result<String> {
    stack::top_app_context()
        .ok_or(Error::NoAppContext)?
        .render_template(name, context)
}

/// Render template source with the application context active on this thread
///
/// # Errors
///
/// Returns `Error::NoAppContext` without an application context.
pub fn render_template_string(source: &str, context: Map<String, Value>) -> Result<String> {
    stack::top_app_context()
        .ok_or(Error::NoAppContext)?
        .render_template_string(source, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{Blueprint, BlueprintOptions};
    use parking_lot::Mutex;
    use serde_json::json;

    fn temp_folder(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("phial-templates-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn context(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_render_string_sees_request_and_url_for() {
        let app = App::new("tpl");
        app.route("/user/<int:id>", "user", |_, _| Ok("user")).unwrap();
        let ctx = app.test_request_context("/user/3");
        let _guard = ctx.enter().unwrap();

        let out = render_template_string(
            "{{ request.method }} {{ url_for('user', id=4, tab='a') }} {{ name }}",
            context(json!({"name": "<b>"})),
        )
        .unwrap();
        assert_eq!(out, "GET /user/4?tab=a &lt;b&gt;");
    }

    #[test]
    fn test_context_processors_and_caller_precedence() {
        let app = App::new("tpl");
        app.context_processor(|_| Ok(context(json!({"site": "phial", "who": "processor"}))))
            .unwrap();
        app.template_global("version", json!("1.0")).unwrap();
        app.template_function("double", |args| {
            Ok(json!(args.first().and_then(Value::as_i64).unwrap_or(0) * 2))
        })
        .unwrap();

        let ctx = app.app_context();
        let _guard = ctx.enter();
        ctx.g().set("user", "ann".to_string());
        let out = ctx
            .render_template_string(
                "{{ site }} {{ who }} {{ version }} {{ double(21) }} {{ g.user }}",
                context(json!({"who": "caller"})),
            )
            .unwrap();
        assert_eq!(out, "phial caller 1.0 42 ann");
    }

    #[test]
    fn test_loader_search_path() {
        let app_dir = temp_folder("app");
        let bp_dir = temp_folder("bp");
        std::fs::write(app_dir.join("page.html"), "app {{ value }}").unwrap();
        std::fs::write(bp_dir.join("page.html"), "blueprint").unwrap();
        std::fs::write(bp_dir.join("only_bp.txt"), "from blueprint {{ value }}").unwrap();

        let app = App::new("tpl");
        app.set_template_folder(Some(app_dir)).unwrap();
        let bp = Blueprint::new("bp").with_template_folder(bp_dir);
        app.register_blueprint(Arc::new(bp), BlueprintOptions::new()).unwrap();

        let ctx = app.app_context();
        let _guard = ctx.enter();
        let vars = context(json!({"value": "<i>"}));
        assert_eq!(render_template("page.html", vars.clone()).unwrap(), "app &lt;i&gt;");
        assert_eq!(render_template("only_bp.txt", vars.clone()).unwrap(), "from blueprint <i>");
        assert!(matches!(
            render_template("../escape.html", vars.clone()),
            Err(Error::Template(_))
        ));
        assert!(matches!(render_template("missing.html", vars), Err(Error::Template(_))));
    }

    #[test]
    fn test_render_signals() {
        let app = App::new("tpl");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let before = Arc::clone(&seen);
        app.signals()
            .before_render_template
            .connect(move |_, event: &TemplateEvent| before.lock().push(format!("before {:?}", event.name)));
        let after = Arc::clone(&seen);
        app.signals()
            .template_rendered
            .connect(move |_, event: &TemplateEvent| after.lock().push(format!("after {:?}", event.name)));

        let ctx = app.app_context();
        let _guard = ctx.enter();
        render_template_string("hi", Map::new()).unwrap();
        assert_eq!(*seen.lock(), vec!["before None", "after None"]);
    }

    #[test]
    fn test_requires_app_context() {
        assert!(matches!(render_template_string("x", Map::new()), Err(Error::NoAppContext)));
        assert!(is_safe_name("a/b.html"));
        assert!(!is_safe_name("/etc/passwd"));
        assert!(!is_safe_name("a/../../b"));
    }
}
