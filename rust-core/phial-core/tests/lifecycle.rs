//! End-to-end checks of the context lifecycle and the dispatch pipeline

use parking_lot::Mutex;
use phial::blueprint::{Blueprint, BlueprintOptions};
use phial::error::{ErrorClass, ErrorKey};
use phial::stack::{self, ContextStack};
use phial::{abort, App, Config, Environ, Error, ViewReturn};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
#[error("view exploded")]
struct Exploded;

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
fn test_hello_name() {
    let app = App::new("hello");
    app.route("/hello/<name>", "hello", |_, args| {
        Ok(format!("Hi {}", args["name"].as_string()))
    })
    .unwrap();

    let response = app.test_client().get("/hello/Ann").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text_body(), Some("Hi Ann"));
    assert_eq!(response.mimetype(), "text/html");
}

#[test]
fn test_not_found_handler() {
    let app = App::new("missing");
    app.register_error_handler(404u16, |_, _| Ok(("nothing here", 404u16)))
        .unwrap();

    let response = app.test_client().get("/nope").unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text_body(), Some("nothing here"));
}

#[test]
fn test_stack_pops_in_reverse() {
    let mut stack = ContextStack::new("numbers");
    for n in 1..=3 {
        stack.push(n);
    }
    assert_eq!(stack.pop().unwrap(), 3);
    assert_eq!(stack.pop().unwrap(), 2);
    assert_eq!(stack.pop().unwrap(), 1);
    assert!(matches!(stack.pop(), Err(Error::EmptyStack { .. })));
    assert!(stack.top().is_none());
}

#[test]
fn test_nested_request_push_tears_down_once() {
    let app = App::new("nested");
    let teardowns = counter();
    let seen = Arc::clone(&teardowns);
    app.teardown_request(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    let ctx = app.test_request_context("/");
    for _ in 0..3 {
        ctx.push().unwrap();
    }
    ctx.pop(None).unwrap();
    ctx.pop(None).unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);
    assert!(stack::has_request_context());

    ctx.pop(None).unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert!(!stack::has_request_context());
    assert!(!stack::has_app_context());
}

#[test]
fn test_app_context_refcount() {
    let app = App::new("refcount");
    let teardowns = counter();
    let seen = Arc::clone(&teardowns);
    app.teardown_appcontext(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    let ctx = app.app_context();
    for _ in 0..3 {
        ctx.push();
    }
    assert_eq!(ctx.reference_count(), 3);
    ctx.pop(None).unwrap();
    ctx.pop(None).unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);
    ctx.pop(None).unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert!(!stack::has_app_context());
}

#[test]
fn test_hook_order() {
    let app = App::new("hooks");
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["A", "B"] {
        let order = Arc::clone(&order);
        app.before_request(move |_| {
            order.lock().push(name);
            Ok(None)
        })
        .unwrap();
    }
    for name in ["C", "D"] {
        let order = Arc::clone(&order);
        app.after_request(move |_, _| {
            order.lock().push(name);
            Ok(())
        })
        .unwrap();
    }
    let view_order = Arc::clone(&order);
    app.route("/", "index", move |_, _| {
        view_order.lock().push("view");
        Ok("done")
    })
    .unwrap();

    app.test_client().get("/").unwrap();
    assert_eq!(*order.lock(), ["A", "B", "view", "D", "C"]);
}

#[test]
fn test_before_request_short_circuits() {
    let app = App::new("short");
    let views = counter();
    let seen = Arc::clone(&views);
    app.before_request(|_| Ok(Some(ViewReturn::from(("stop", 403u16)))))
        .unwrap();
    app.route("/", "index", move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok("view")
    })
    .unwrap();

    let response = app.test_client().get("/").unwrap();
    assert_eq!(response.status(), 403);
    assert_eq!(views.load(Ordering::SeqCst), 0);
}

#[test]
fn test_response_coercion() {
    let app = App::new("coerce");
    let environ = Environ::builder("/").build();

    let canonical = app
        .make_response(&environ, ViewReturn::from(("body", 404u16)))
        .unwrap();
    assert_eq!(canonical.status(), 404);
    assert_eq!(canonical.text_body(), Some("body"));

    let again = app
        .make_response(&environ, ViewReturn::Response(canonical.clone()))
        .unwrap();
    assert_eq!(again.status(), canonical.status());
    assert_eq!(again.body(), canonical.body());
    assert_eq!(again.header_pairs(), canonical.header_pairs());

    let document = app
        .make_response(&environ, ViewReturn::from(json!({"a": 1})))
        .unwrap();
    assert_eq!(document.mimetype(), "application/json");
    assert_eq!(document.json().unwrap(), json!({"a": 1}));

    assert!(matches!(
        app.make_response(&environ, ViewReturn::None),
        Err(Error::InvalidResponse(_))
    ));
    let four = ViewReturn::Tuple(vec![
        "a".into(),
        200u16.into(),
        ViewReturn::Headers(Vec::new()),
        "b".into(),
    ]);
    assert!(matches!(
        app.make_response(&environ, four),
        Err(Error::InvalidResponse(_))
    ));
}

#[test]
fn test_blueprint_code_handler_beats_app_class_handler() {
    let app = App::new("precedence");
    app.register_error_handler(ErrorKey::Class(ErrorClass::Http(404)), |_, _| {
        Ok(("app", 404u16))
    })
    .unwrap();

    let mut bp = Blueprint::new("shop").with_url_prefix("/shop");
    bp.route("/item/<int:id>", "item", |_, _| -> phial::Result<&'static str> {
        Err(abort(404))
    })
    .unwrap();
    bp.register_error_handler(404u16, |_, _| Ok(("shop", 404u16)));
    app.register_blueprint(Arc::new(bp), BlueprintOptions::new())
        .unwrap();

    let client = app.test_client();
    let inside = client.get("/shop/item/7").unwrap();
    assert_eq!(inside.text_body(), Some("shop"));

    let outside = client.get("/elsewhere").unwrap();
    assert_eq!(outside.text_body(), Some("app"));
}

#[test]
fn test_preserved_context_is_reclaimed_with_its_error() {
    let mut config = Config::default();
    config.propagate_exceptions = Some(false);
    config.preserve_context_on_exception = Some(true);
    let app = App::with_config("reclaim", config);

    let teardowns = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&teardowns);
    app.teardown_request(move |ctx, error| {
        seen.lock()
            .push((ctx.request().path().to_string(), error.is_some()));
        Ok(())
    })
    .unwrap();
    app.route("/fail", "fail", |_, _| -> phial::Result<&'static str> {
        Err(Error::user(Exploded))
    })
    .unwrap();

    let response = app.dispatch(Environ::builder("/fail").build()).unwrap();
    assert_eq!(response.status(), 500);
    let preserved = stack::top_request_context().unwrap();
    assert!(preserved.is_preserved());
    assert!(teardowns.lock().is_empty());

    let next = app.test_request_context("/next");
    next.push().unwrap();
    assert_eq!(*teardowns.lock(), [("/fail".to_string(), true)]);
    assert!(!preserved.is_preserved());
    assert_eq!(stack::request_stack_depth(), 1);

    next.pop(None).unwrap();
    assert_eq!(teardowns.lock().len(), 2);
    assert!(!stack::has_request_context());
}

#[test]
fn test_setup_locked_after_first_request() {
    let app = App::new("locked");
    app.route("/", "index", |_, _| Ok("index")).unwrap();
    app.test_client().get("/").unwrap();

    assert!(app.got_first_request());
    assert!(matches!(
        app.route("/late", "late", |_, _| Ok("late")),
        Err(Error::Setup(_))
    ));
    assert!(matches!(app.before_request(|_| Ok(None)), Err(Error::Setup(_))));
}

#[test]
fn test_contexts_are_gone_after_dispatch() {
    let app = App::new("clean");
    app.route("/", "index", |ctx, _| {
        assert!(stack::has_app_context());
        ctx.g()?.set("user", "ann".to_string());
        Ok(ctx.g()?.get::<String>("user").unwrap_or_default())
    })
    .unwrap();

    let response = app.test_client().get("/").unwrap();
    assert_eq!(response.text_body(), Some("ann"));
    assert!(!stack::has_request_context());
    assert!(!stack::has_app_context());
}

#[test]
fn test_same_position_routes_with_different_converters() {
    let app = App::new("users");
    app.route("/u/<int:id>", "by_id", |_, args| {
        Ok(format!("id {}", args["id"].as_string()))
    })
    .unwrap();
    app.route("/u/<name>", "by_name", |_, args| {
        Ok(format!("name {}", args["name"].as_string()))
    })
    .unwrap();

    let client = app.test_client();
    assert_eq!(client.get("/u/7").unwrap().text_body(), Some("id 7"));
    assert_eq!(client.get("/u/ann").unwrap().text_body(), Some("name ann"));
}
