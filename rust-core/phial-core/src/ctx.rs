//! # Contexts
//!
//! An `AppContext` binds an application to the current thread together with
//! its `g` namespace. A `RequestContext` binds one request, its session and
//! its matched route; pushing it makes sure an application context for the
//! same application is active, creating one if needed.
//!
//! Both are reference counted so a context can be pushed more than once.
//! Teardown runs only when the outermost push is popped.

use crate::app::App;
use crate::error::{Error, Result};
use crate::globals::Globals;
use crate::hooks::AfterRequestFn;
use crate::request::Request;
use crate::response::Response;
use crate::router::UrlAdapter;
use crate::sessions::Session;
use crate::signals::FlashEvent;
use crate::stack;
use crate::types::ViewArgs;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const FLASHES_KEY: &str = "_flashes";

/// Application context
pub struct AppContext {
    app: Arc<App>,
    g: Globals,
    url_adapter: Option<Arc<dyn UrlAdapter>>,
    refcnt: AtomicUsize,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("app", &self.app.name())
            .field("refcnt", &self.refcnt.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub(crate) fn new(app: Arc<App>) -> Arc<Self> {
        let url_adapter = app.create_url_adapter(None);
        Arc::new(Self {
            app,
            g: Globals::new(),
            url_adapter,
            refcnt: AtomicUsize::new(0),
        })
    }

    /// The bound application
    #[must_use]
    pub const fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// Namespace for data shared during the context's lifetime
    #[must_use]
    pub const fn g(&self) -> &Globals {
        &self.g
    }

    /// Request-independent URL adapter; only present with a configured `server_name`
    #[must_use]
    pub fn url_adapter(&self) -> Option<&Arc<dyn UrlAdapter>> {
        self.url_adapter.as_ref()
    }

    /// Number of outstanding pushes
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Bind the context to the current thread
    pub fn push(self: &Arc<Self>) {
        self.refcnt.fetch_add(1, Ordering::SeqCst);
        stack::push_app(Arc::clone(self));
        self.app.signals().appcontext_pushed.send(&self.app, &());
    }

    /// Undo one push
    ///
    /// The last pop runs the `teardown_appcontext` hooks with `error`.
    ///
    /// # Errors
    ///
    /// Returns `Error::WrongContextPopped` if this context was not on top, or
    /// the first teardown hook failure.
    pub fn pop(self: &Arc<Self>, error: Option<Error>) -> Result<()> {
        let remaining = self
            .refcnt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map_or(0, |prev| prev.saturating_sub(1));

        let teardown = if remaining == 0 {
            self.app.do_teardown_appcontext(self, error.as_ref())
        } else {
            Ok(())
        };

        let popped = stack::pop_app()?;
        if !Arc::ptr_eq(&popped, self) {
            return Err(Error::WrongContextPopped {
                kind: "application",
            });
        }
        self.app.signals().appcontext_popped.send(&self.app, &());
        teardown
    }

    /// Push the context and pop it when the guard is dropped
    #[must_use = "the context is popped as soon as the guard is dropped"]
    pub fn enter(self: &Arc<Self>) -> AppContextGuard {
        self.push();
        AppContextGuard {
            ctx: Arc::clone(self),
            active: true,
        }
    }
}

/// Keeps an application context pushed while in scope
#[derive(Debug)]
pub struct AppContextGuard {
    ctx: Arc<AppContext>,
    active: bool,
}

impl AppContextGuard {
    /// Pop now and report teardown failures
    ///
    /// # Errors
    ///
    /// Returns what `AppContext::pop` returns.
    pub fn close(mut self) -> Result<()> {
        self.active = false;
        self.ctx.pop(None)
    }
}

impl std::ops::Deref for AppContextGuard {
    type Target = Arc<AppContext>;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl Drop for AppContextGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.ctx.pop(None) {
                warn!(error = %e, "Application context teardown failed");
            }
        }
    }
}

/// Request context
pub struct RequestContext {
    app: Arc<App>,
    request: Arc<Request>,
    session: RwLock<Option<Session>>,
    url_adapter: Option<Arc<dyn UrlAdapter>>,
    implicit_app_ctx_stack: Mutex<Vec<Option<Arc<AppContext>>>>,
    preserved: AtomicBool,
    preserved_error: Mutex<Option<Error>>,
    after_request_functions: Mutex<Vec<AfterRequestFn>>,
    flashes: Mutex<Option<Vec<(String, String)>>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("app", &self.app.name())
            .field("method", &self.request.method())
            .field("url", &self.request.url())
            .field("preserved", &self.is_preserved())
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub(crate) fn new(app: Arc<App>, request: Request) -> Arc<Self> {
        let url_adapter = app.create_url_adapter(Some(&request));
        Arc::new(Self {
            app,
            request: Arc::new(request),
            session: RwLock::new(None),
            url_adapter,
            implicit_app_ctx_stack: Mutex::new(Vec::new()),
            preserved: AtomicBool::new(false),
            preserved_error: Mutex::new(None),
            after_request_functions: Mutex::new(Vec::new()),
            flashes: Mutex::new(None),
        })
    }

    /// The bound application
    #[must_use]
    pub const fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// The request being handled
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The session
    ///
    /// Before the first push this is a null session.
    #[must_use]
    pub fn session(&self) -> Session {
        self.session.read().clone().unwrap_or_else(Session::null)
    }

    /// Replace the session
    pub fn set_session(&self, session: Session) {
        *self.session.write() = Some(session);
    }

    /// Request-bound URL adapter
    #[must_use]
    pub fn url_adapter(&self) -> Option<&Arc<dyn UrlAdapter>> {
        self.url_adapter.as_ref()
    }

    /// Matched view arguments, empty when routing failed
    #[must_use]
    pub fn view_args(&self) -> ViewArgs {
        self.request.view_args().unwrap_or_default()
    }

    /// `g` of the active application context
    ///
    /// # Errors
    ///
    /// Returns `Error::NoAppContext` when no application context is pushed.
    pub fn g(&self) -> Result<Globals> {
        stack::top_app_context()
            .map(|ctx| ctx.g().clone())
            .ok_or(Error::NoAppContext)
    }

    /// Whether the context was kept alive instead of popped
    #[must_use]
    pub fn is_preserved(&self) -> bool {
        self.preserved.load(Ordering::SeqCst)
    }

    /// Register a callback for this request's response only
    ///
    /// Callbacks run before the after-request hooks, in registration order.
    pub fn after_this_request<F>(&self, f: F)
    where
        F: Fn(&Self, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        self.after_request_functions.lock().push(Arc::new(f));
    }

    pub(crate) fn after_request_functions(&self) -> Vec<AfterRequestFn> {
        self.after_request_functions.lock().clone()
    }

    /// New context sharing this request and session
    ///
    /// Push the copy on another thread to keep working with the request
    /// there. The session is not opened again.
    #[must_use]
    pub fn copy(&self) -> Arc<Self> {
        Arc::new(Self {
            app: Arc::clone(&self.app),
            request: Arc::clone(&self.request),
            session: RwLock::new(self.session.read().clone()),
            url_adapter: self.url_adapter.clone(),
            implicit_app_ctx_stack: Mutex::new(Vec::new()),
            preserved: AtomicBool::new(false),
            preserved_error: Mutex::new(None),
            after_request_functions: Mutex::new(Vec::new()),
            flashes: Mutex::new(None),
        })
    }

    /// Store the route match (or the routing error) on the request
    pub fn match_request(&self) {
        let Some(adapter) = &self.url_adapter else {
            return;
        };
        match adapter.match_request(self.request.path(), self.request.method()) {
            Ok((rule, view_args)) => self.request.set_match(rule, view_args),
            Err(e) => {
                debug!(path = %self.request.path(), error = %e, "Routing failed");
                self.request.set_routing_exception(e);
            }
        }
    }

    /// Bind the context to the current thread
    ///
    /// A preserved context left on top is popped first. An application
    /// context for this application is reused if active, otherwise one is
    /// pushed and popped again with this context.
    ///
    /// # Errors
    ///
    /// Returns teardown failures of a reclaimed preserved context and
    /// session backend failures.
    pub fn push(self: &Arc<Self>) -> Result<()> {
        if let Some(top) = stack::top_request_context() {
            top.release_preserved()?;
        }

        let implicit = match stack::top_app_context() {
            Some(ctx) if Arc::ptr_eq(ctx.app(), &self.app) => None,
            _ => {
                let ctx = self.app.app_context();
                ctx.push();
                Some(ctx)
            }
        };
        self.implicit_app_ctx_stack.lock().push(implicit);

        stack::push_request(Arc::clone(self));

        if self.session.read().is_none() {
            let interface = self.app.session_interface();
            let session = match interface.open_session(&self.app, &self.request)? {
                Some(session) => session,
                None => interface.make_null_session(&self.app),
            };
            *self.session.write() = Some(session);
        }

        if self.url_adapter.is_some() {
            self.match_request();
        }
        Ok(())
    }

    /// Undo one push
    ///
    /// The outermost pop runs the teardown-request hooks with `error` and
    /// closes the request. An application context created by the matching
    /// push is popped with the same error.
    ///
    /// # Errors
    ///
    /// Returns `Error::WrongContextPopped` if this context was not on top,
    /// otherwise the first teardown failure.
    pub fn pop(self: &Arc<Self>, error: Option<Error>) -> Result<()> {
        let (app_ctx, clear_request) = {
            let mut implicit = self.implicit_app_ctx_stack.lock();
            let app_ctx = implicit.pop().flatten();
            (app_ctx, implicit.is_empty())
        };

        let mut result = Ok(());
        if clear_request {
            self.preserved.store(false, Ordering::SeqCst);
            *self.preserved_error.lock() = None;
            result = self.app.do_teardown_request(self, error.as_ref());
            self.request.close();
        }

        let popped = stack::pop_request()?;

        if let Some(app_ctx) = app_ctx {
            let app_result = app_ctx.pop(error);
            result = result.and(app_result);
        }

        if !Arc::ptr_eq(&popped, self) {
            return Err(Error::WrongContextPopped { kind: "request" });
        }
        result
    }

    /// Pop, or keep the context alive for inspection
    ///
    /// The context is preserved when the environment asks for it, or when
    /// `error` is set and the application preserves context on exceptions.
    /// The next push of a request context reclaims it.
    ///
    /// # Errors
    ///
    /// Returns what `pop` returns.
    pub fn auto_pop(self: &Arc<Self>, error: Option<Error>) -> Result<()> {
        let preserve = self.request.environ().preserve_context
            || (error.is_some() && self.app.config().preserve_context_on_exception_enabled());
        if preserve {
            self.preserved.store(true, Ordering::SeqCst);
            *self.preserved_error.lock() = error;
            return Ok(());
        }
        self.pop(error)
    }

    /// Pop a preserved context with the error it was preserved with
    ///
    /// # Errors
    ///
    /// Returns what `pop` returns.
    pub fn release_preserved(self: &Arc<Self>) -> Result<()> {
        if !self.is_preserved() {
            return Ok(());
        }
        let error = self.preserved_error.lock().take();
        self.pop(error)
    }

    /// Push the context and auto-pop it when the guard is dropped
    ///
    /// # Errors
    ///
    /// Returns what `push` returns.
    pub fn enter(self: &Arc<Self>) -> Result<RequestContextGuard> {
        self.push()?;
        Ok(RequestContextGuard {
            ctx: Arc::clone(self),
            active: true,
        })
    }

    /// Store a message for the next request
    ///
    /// # Errors
    ///
    /// Returns `Error::NullSession` when sessions are unavailable.
    pub fn flash(&self, message: &str, category: &str) -> Result<()> {
        let session = self.session();
        let mut flashes: Vec<(String, String)> = session.get_as(FLASHES_KEY).unwrap_or_default();
        flashes.push((category.to_string(), message.to_string()));
        session.insert(FLASHES_KEY, flashes)?;
        self.app.signals().message_flashed.send(
            &self.app,
            &FlashEvent {
                message: message.to_string(),
                category: category.to_string(),
            },
        );
        Ok(())
    }

    /// Flashed messages as `(category, message)` pairs
    ///
    /// The first call of a request moves the messages out of the session;
    /// later calls return the same list. An empty `categories` keeps all.
    ///
    /// # Errors
    ///
    /// Returns `Error::NullSession` when sessions are unavailable and
    /// messages are pending.
    pub fn get_flashed_messages(&self, categories: &[&str]) -> Result<Vec<(String, String)>> {
        let mut cache = self.flashes.lock();
        if cache.is_none() {
            let session = self.session();
            let loaded = if session.contains(FLASHES_KEY) {
                session
                    .remove(FLASHES_KEY)?
                    .and_then(|v| serde_json::from_value::<Vec<(String, String)>>(v).ok())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            *cache = Some(loaded);
        }
        let flashes = cache.clone().unwrap_or_default();
        if categories.is_empty() {
            return Ok(flashes);
        }
        Ok(flashes
            .into_iter()
            .filter(|(category, _)| categories.contains(&category.as_str()))
            .collect())
    }

    /// JSON view of the request for templates
    pub(crate) fn request_value(&self) -> Value {
        let request = &self.request;
        serde_json::json!({
            "method": request.method(),
            "path": request.path(),
            "full_path": request.full_path(),
            "url": request.url(),
            "base_url": request.base_url(),
            "args": request.args(),
            "endpoint": request.endpoint(),
            "blueprint": request.blueprint(),
            "view_args": request.view_args(),
        })
    }
}

/// Keeps a request context pushed while in scope
#[derive(Debug)]
pub struct RequestContextGuard {
    ctx: Arc<RequestContext>,
    active: bool,
}

impl RequestContextGuard {
    /// Pop now and report teardown failures
    ///
    /// # Errors
    ///
    /// Returns what `RequestContext::auto_pop` returns.
    pub fn close(mut self) -> Result<()> {
        self.active = false;
        self.ctx.auto_pop(None)
    }
}

impl std::ops::Deref for RequestContextGuard {
    type Target = Arc<RequestContext>;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl Drop for RequestContextGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.ctx.auto_pop(None) {
                warn!(error = %e, "Request context teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{app_stack_depth, has_app_context, has_request_context, request_stack_depth};

    #[test]
    fn test_app_context_refcount() {
        let app = App::new("ctx");
        let ctx = app.app_context();
        ctx.push();
        ctx.push();
        assert_eq!(ctx.reference_count(), 2);
        ctx.pop(None).unwrap();
        assert!(has_app_context());
        ctx.pop(None).unwrap();
        assert_eq!(ctx.reference_count(), 0);
        assert!(!has_app_context());
    }

    #[test]
    fn test_wrong_app_context_popped() {
        let app = App::new("ctx");
        let first = app.app_context();
        let second = app.app_context();
        first.push();
        second.push();
        assert!(matches!(
            first.pop(None),
            Err(Error::WrongContextPopped { kind: "application" })
        ));
        assert_eq!(app_stack_depth(), 1);
        first.pop(None).unwrap();
    }

    #[test]
    fn test_request_context_creates_app_context() {
        let app = App::new("ctx");
        let ctx = app.test_request_context("/");
        ctx.push().unwrap();
        assert!(has_request_context());
        assert_eq!(app_stack_depth(), 1);
        ctx.pop(None).unwrap();
        assert!(!has_app_context());
        assert!(ctx.request().is_closed());
    }

    #[test]
    fn test_request_context_reuses_app_context() {
        let app = App::new("ctx");
        let app_ctx = app.app_context();
        app_ctx.push();
        let ctx = app.test_request_context("/");
        ctx.push().unwrap();
        assert_eq!(app_stack_depth(), 1);
        assert!(ctx.g().unwrap().ptr_eq(app_ctx.g()));
        ctx.pop(None).unwrap();
        assert_eq!(app_stack_depth(), 1);
        app_ctx.pop(None).unwrap();
    }

    #[test]
    fn test_other_app_gets_its_own_app_context() {
        let first = App::new("first");
        let second = App::new("second");
        let outer = first.app_context();
        outer.push();
        let ctx = second.test_request_context("/");
        ctx.push().unwrap();
        assert_eq!(app_stack_depth(), 2);
        assert_eq!(crate::stack::current_app().unwrap().name(), "second");
        ctx.pop(None).unwrap();
        assert_eq!(app_stack_depth(), 1);
        outer.pop(None).unwrap();
    }

    #[test]
    fn test_guard_pops_on_drop() {
        let app = App::new("ctx");
        {
            let _guard = app.test_request_context("/").enter().unwrap();
            assert_eq!(request_stack_depth(), 1);
        }
        assert_eq!(request_stack_depth(), 0);
        assert!(!has_app_context());
    }

    #[test]
    fn test_copy_shares_request_and_session() {
        let app = App::new("ctx");
        app.config_mut().secret_key = Some("s3cret".to_string());
        let ctx = app.test_request_context("/");
        let guard = ctx.enter().unwrap();
        guard.session().insert("k", 1).unwrap();
        let copy = ctx.copy();
        guard.close().unwrap();

        let handle = std::thread::spawn(move || {
            copy.push().unwrap();
            let value: Option<i64> = copy.session().get_as("k");
            let path = copy.request().path().to_string();
            copy.pop(None).unwrap();
            (value, path)
        });
        assert_eq!(handle.join().unwrap(), (Some(1), "/".to_string()));
    }

    #[test]
    fn test_flash_round_trip() {
        let app = App::new("ctx");
        app.config_mut().secret_key = Some("s3cret".to_string());
        let ctx = app.test_request_context("/");
        let _guard = ctx.enter().unwrap();
        ctx.flash("saved", "message").unwrap();
        ctx.flash("oops", "error").unwrap();

        let errors = ctx.get_flashed_messages(&["error"]).unwrap();
        assert_eq!(errors, vec![("error".to_string(), "oops".to_string())]);
        assert_eq!(ctx.get_flashed_messages(&[]).unwrap().len(), 2);
        assert!(!ctx.session().contains(FLASHES_KEY));
    }

    #[test]
    fn test_flash_without_secret_key_fails() {
        let app = App::new("ctx");
        let ctx = app.test_request_context("/");
        let _guard = ctx.enter().unwrap();
        assert!(matches!(ctx.flash("x", "message"), Err(Error::NullSession)));
        assert!(ctx.get_flashed_messages(&[]).unwrap().is_empty());
    }
}
