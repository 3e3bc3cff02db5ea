//! # Phial Core
//!
//! Core of the Phial micro web framework: application and request
//! contexts, the request dispatch pipeline, URL routing and building,
//! blueprints, sessions and response coercion.
//!
//! ## Architecture
//!
//! A request enters as an `Environ`, gets bound to a `RequestContext` that
//! is pushed onto a per-thread context stack, and is dispatched through the
//! before-request hooks, the matched view and the after-request hooks. The
//! view's return value is coerced into a `Response`. Contexts are popped in
//! reverse order and run their teardown callbacks.
//!
//! ## Modules
//!
//! - `stack` - Per-thread context stacks and the current-object accessors
//! - `ctx` - Application and request contexts
//! - `app` - The application object, its registries and setup methods
//! - `dispatch` - The request pipeline and error handling
//! - `router` - URL map and adapters, built on matchit
//! - `route` - URL rules
//! - `blueprint` - Deferred registration of routes and hooks
//! - `views` - Class-based and method-dispatching views
//! - `coerce` - Conversion of view return values into responses
//! - `sessions` - Signed cookie sessions
//! - `templating` - minijinja environment and template rendering
//! - `testing` - In-process test client
//! - `server` - Development HTTP server built on Hyper
//! - `error` - Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod app;
pub mod blueprint;
pub mod coerce;
pub mod config;
pub mod ctx;
pub mod dispatch;
pub mod environ;
pub mod error;
pub mod exceptions;
pub mod globals;
pub mod helpers;
pub mod hooks;
pub mod json;
pub mod logging;
pub mod request;
pub mod response;
pub mod route;
pub mod router;
pub mod server;
pub mod sessions;
pub mod signals;
pub mod signing;
pub mod stack;
pub mod templating;
pub mod testing;
pub mod types;
pub mod views;
pub mod wsgi;

pub use app::{App, RouteOptions};
pub use blueprint::{Blueprint, BlueprintOptions, BlueprintSetupState};
pub use coerce::ViewReturn;
pub use config::Config;
pub use ctx::{AppContext, AppContextGuard, RequestContext, RequestContextGuard};
pub use environ::{Environ, EnvironBuilder};
pub use error::{Error, Result};
pub use exceptions::{abort, HttpException};
pub use globals::Globals;
pub use helpers::{
    after_this_request, copy_current_request_context, flash, get_flashed_messages, make_response,
    url_for, UrlFor,
};
pub use json::{jsonify, parse_json, to_json};
pub use logging::init_tracing;
pub use request::Request;
pub use response::{redirect, Response, SetCookie};
pub use route::Rule;
pub use router::{MapAdapter, Method, UrlAdapter, UrlMap};
pub use server::{Server, ServerConfig};
pub use sessions::{SecureCookieSessionInterface, Session, SessionInterface};
pub use signals::{Signal, Signals};
pub use stack::{current_app, has_app_context, has_request_context};
pub use templating::{render_template, render_template_string};
pub use testing::TestClient;
pub use types::{ParamType, ParamValue, ViewArgs};
pub use views::{MethodView, View};
pub use wsgi::WsgiApp;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.1");
    }
}
