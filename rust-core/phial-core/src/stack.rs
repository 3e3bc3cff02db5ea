//! # Context Stacks
//!
//! LIFO stacks of active contexts, one pair per thread. The contexts push and
//! pop themselves here; the rest of the crate only probes the top.

use crate::app::App;
use crate::ctx::{AppContext, RequestContext};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::sync::Arc;

/// LIFO stack of contexts
#[derive(Debug)]
pub struct ContextStack<T> {
    name: &'static str,
    items: Vec<T>,
}

impl<T: Clone> ContextStack<T> {
    /// Create an empty stack; `name` appears in `EmptyStack` errors
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Vec::new(),
        }
    }

    /// Push an item on top
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Remove and return the top item
    ///
    /// # Errors
    ///
    /// Returns `Error::EmptyStack` when nothing is pushed.
    pub fn pop(&mut self) -> Result<T> {
        self.items
            .pop()
            .ok_or(Error::EmptyStack { stack: self.name })
    }

    /// The top item, if any
    #[must_use]
    pub fn top(&self) -> Option<T> {
        self.items.last().cloned()
    }

    /// Number of pushed items
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if stack is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

thread_local! {
    static APP_STACK: RefCell<ContextStack<Arc<AppContext>>> =
        const { RefCell::new(ContextStack::new("application")) };
    static REQUEST_STACK: RefCell<ContextStack<Arc<RequestContext>>> =
        const { RefCell::new(ContextStack::new("request")) };
}

pub(crate) fn push_app(ctx: Arc<AppContext>) {
    APP_STACK.with(|s| s.borrow_mut().push(ctx));
}

pub(crate) fn pop_app() -> Result<Arc<AppContext>> {
    APP_STACK.with(|s| s.borrow_mut().pop())
}

pub(crate) fn push_request(ctx: Arc<RequestContext>) {
    REQUEST_STACK.with(|s| s.borrow_mut().push(ctx));
}

pub(crate) fn pop_request() -> Result<Arc<RequestContext>> {
    REQUEST_STACK.with(|s| s.borrow_mut().pop())
}

/// Top application context of this thread
#[must_use]
pub fn top_app_context() -> Option<Arc<AppContext>> {
    APP_STACK.with(|s| s.borrow().top())
}

/// Top request context of this thread
#[must_use]
pub fn top_request_context() -> Option<Arc<RequestContext>> {
    REQUEST_STACK.with(|s| s.borrow().top())
}

/// Whether an application context is active on this thread
#[must_use]
pub fn has_app_context() -> bool {
    APP_STACK.with(|s| !s.borrow().is_empty())
}

/// Whether a request context is active on this thread
#[must_use]
pub fn has_request_context() -> bool {
    REQUEST_STACK.with(|s| !s.borrow().is_empty())
}

/// Application bound to the active application context
#[must_use]
pub fn current_app() -> Option<Arc<App>> {
    top_app_context().map(|ctx| Arc::clone(ctx.app()))
}

/// Depth of the request stack on this thread
#[must_use]
pub fn request_stack_depth() -> usize {
    REQUEST_STACK.with(|s| s.borrow().len())
}

/// Depth of the application stack on this thread
#[must_use]
pub fn app_stack_depth() -> usize {
    APP_STACK.with(|s| s.borrow().len())
}
