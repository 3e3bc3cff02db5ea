//! # Test Client
//!
//! Drives an application in-process: builds environments, dispatches them
//! and keeps cookies between requests. In preserving mode the request
//! context of each response stays pushed for inspection until the next
//! request or until the mode is released.

use crate::app::App;
use crate::environ::{Environ, EnvironBuilder};
use crate::error::Result;
use crate::response::Response;
use crate::stack;
use hyper::body::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// In-process client with a cookie jar
#[derive(Debug)]
pub struct TestClient {
    app: Arc<App>,
    cookies: Mutex<IndexMap<String, String>>,
    preserve_context: AtomicBool,
}

impl TestClient {
    /// Client for `app`
    #[must_use]
    pub fn new(app: Arc<App>) -> Self {
        Self {
            app,
            cookies: Mutex::new(IndexMap::new()),
            preserve_context: AtomicBool::new(false),
        }
    }

    /// The application under test
    #[must_use]
    pub const fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// Send a GET request
    ///
    /// # Errors
    ///
    /// Returns what `App::dispatch` returns.
    pub fn get(&self, path: &str) -> Result<Response> {
        self.open(Environ::builder(path))
    }

    /// Send a POST request with a body
    ///
    /// # Errors
    ///
    /// Returns what `App::dispatch` returns.
    pub fn post(&self, path: &str, body: impl Into<Bytes>) -> Result<Response> {
        self.open(Environ::builder(path).method("POST").body(body))
    }

    /// Send a POST request with a JSON body
    ///
    /// # Errors
    ///
    /// Returns what `App::dispatch` returns.
    pub fn post_json(&self, path: &str, value: &serde_json::Value) -> Result<Response> {
        self.open(Environ::builder(path).method("POST").json(value))
    }

    /// Send an arbitrary request; stored cookies are added
    ///
    /// The response goes through the gateway call, so it looks as a server
    /// would send it (no body for HEAD, `Content-Length` set).
    ///
    /// # Errors
    ///
    /// Returns what `App::dispatch` returns.
    pub fn open(&self, builder: EnvironBuilder) -> Result<Response> {
        let mut environ = builder.build();
        if let Some(cookie) = self.cookie_header() {
            if let Ok(value) = cookie.parse() {
                environ.headers.insert(hyper::header::COOKIE, value);
            }
        }
        environ.preserve_context = self.preserve_context.load(Ordering::SeqCst);
        trace!(method = %environ.method, path = %environ.path_info, "Test request");

        let dispatched = self.app.dispatch(environ.clone())?;
        let response = Response::force_type(&dispatched, &environ)?;
        self.store_cookies(&response);
        Ok(response)
    }

    /// Keep request contexts pushed after each response until the guard is released
    #[must_use]
    pub fn preserving(&self) -> PreservingGuard<'_> {
        self.preserve_context.store(true, Ordering::SeqCst);
        PreservingGuard {
            client: self,
            active: true,
        }
    }

    /// Stored cookie value
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.lock().get(name).cloned()
    }

    /// Store a cookie to send with the following requests
    pub fn set_cookie(&self, name: &str, value: &str) {
        self.cookies.lock().insert(name.to_string(), value.to_string());
    }

    /// Forget a cookie
    pub fn delete_cookie(&self, name: &str) {
        self.cookies.lock().shift_remove(name);
    }

    fn cookie_header(&self) -> Option<String> {
        let cookies = self.cookies.lock();
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn store_cookies(&self, response: &Response) {
        let mut cookies = self.cookies.lock();
        for header in response.header_all("set-cookie") {
            let mut attrs = header.split(';').map(str::trim);
            let Some((name, value)) = attrs.next().and_then(|kv| kv.split_once('=')) else {
                continue;
            };
            let expired = attrs.any(|attr| {
                attr.eq_ignore_ascii_case("max-age=0")
                    || attr.to_ascii_lowercase().starts_with("expires=thu, 01 jan 1970")
            });
            if expired {
                cookies.shift_remove(name);
            } else {
                cookies.insert(name.to_string(), value.to_string());
            }
        }
    }

    fn release(&self) -> Result<()> {
        self.preserve_context.store(false, Ordering::SeqCst);
        match stack::top_request_context() {
            Some(top) if Arc::ptr_eq(top.app(), &self.app) => top.release_preserved(),
            _ => Ok(()),
        }
    }
}

impl App {
    /// In-process client for this application
    #[must_use]
    pub fn test_client(self: &Arc<Self>) -> TestClient {
        TestClient::new(Arc::clone(self))
    }
}

/// Preserving mode of a `TestClient`; dropping it releases the last context
#[derive(Debug)]
pub struct PreservingGuard<'a> {
    client: &'a TestClient,
    active: bool,
}

impl PreservingGuard<'_> {
    /// Leave preserving mode and pop the preserved context
    ///
    /// # Errors
    ///
    /// Returns the teardown failure of the preserved context.
    pub fn release(mut self) -> Result<()> {
        self.active = false;
        self.client.release()
    }
}

impl std::ops::Deref for PreservingGuard<'_> {
    type Target = TestClient;

    fn deref(&self) -> &Self::Target {
        self.client
    }
}

impl Drop for PreservingGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.client.release() {
                tracing::warn!(error = %e, "Releasing the preserved request context failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::stack::{has_request_context, request_stack_depth};

    fn app() -> Arc<App> {
        let mut config = Config::default();
        config.secret_key = Some("test secret".to_string());
        let app = App::with_config("client", config);
        app.route("/set/<value>", "set", |ctx, args| {
            ctx.session().insert("value", args["value"].as_string())?;
            Ok("stored")
        })
        .unwrap();
        app.route("/get", "get", |ctx, _| {
            Ok(ctx.session().get_as::<String>("value").unwrap_or_default())
        })
        .unwrap();
        app.route("/clear", "clear", |ctx, _| {
            ctx.session().clear()?;
            Ok("cleared")
        })
        .unwrap();
        app
    }

    #[test]
    fn test_cookie_jar_carries_session() {
        let client = app().test_client();
        assert_eq!(client.get("/set/42").unwrap().text_body(), Some("stored"));
        assert!(client.cookie("session").is_some());
        assert_eq!(client.get("/get").unwrap().text_body(), Some("42"));

        client.get("/clear").unwrap();
        assert!(client.cookie("session").is_none());
        assert_eq!(client.get("/get").unwrap().text_body(), Some(""));
    }

    #[test]
    fn test_preserving_keeps_context_until_next_request() {
        let app = app();
        let client = app.test_client();
        {
            let preserving = client.preserving();
            preserving.get("/set/1").unwrap();
            assert!(has_request_context());
            let top = stack::top_request_context().unwrap();
            assert_eq!(top.request().path(), "/set/1");
            assert!(top.is_preserved());

            preserving.get("/get").unwrap();
            assert_eq!(request_stack_depth(), 1);
            let top = stack::top_request_context().unwrap();
            assert_eq!(top.request().path(), "/get");
        }
        assert!(!has_request_context());

        client.get("/get").unwrap();
        assert!(!has_request_context());
    }

    #[test]
    fn test_head_has_no_body() {
        let app = App::new("head");
        app.route("/page", "page", |_, _| Ok("body")).unwrap();
        let client = app.test_client();

        let head = client.open(Environ::builder("/page").method("HEAD")).unwrap();
        assert_eq!(head.status(), 200);
        assert!(head.body().is_empty());

        let get = client.get("/page").unwrap();
        assert_eq!(get.text_body(), Some("body"));
        assert_eq!(get.header("content-length"), Some("4"));
    }

    #[test]
    fn test_explicit_release() {
        let app = app();
        let client = app.test_client();
        let preserving = client.preserving();
        preserving.get("/get").unwrap();
        assert!(has_request_context());
        preserving.release().unwrap();
        assert!(!has_request_context());
    }
}
