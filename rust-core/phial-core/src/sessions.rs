//! # Sessions
//!
//! Client-side sessions stored in a signed cookie. The interface is a trait so
//! applications can swap in server-side storage; the default signs the JSON
//! payload with the application's secret key.

use crate::app::App;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::{Response, SetCookie};
use crate::signing::Signer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

const PERMANENT_KEY: &str = "_permanent";

#[derive(Debug, Default)]
struct SessionState {
    data: Map<String, Value>,
    modified: bool,
    accessed: bool,
    new: bool,
    null: bool,
}

/// Shared session handle
///
/// Clones share state, so a copied request context sees the same session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    /// Fresh, empty session
    #[must_use]
    pub fn new() -> Self {
        Self::from_state(SessionState {
            new: true,
            ..SessionState::default()
        })
    }

    /// Session loaded from a cookie
    #[must_use]
    pub fn from_map(data: Map<String, Value>) -> Self {
        Self::from_state(SessionState {
            data,
            ..SessionState::default()
        })
    }

    /// Placeholder used when sessions are unavailable; every mutation fails
    #[must_use]
    pub fn null() -> Self {
        Self::from_state(SessionState {
            null: true,
            ..SessionState::default()
        })
    }

    fn from_state(state: SessionState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Result<R> {
        let mut state = self.state.lock();
        if state.null {
            return Err(Error::NullSession);
        }
        state.accessed = true;
        state.modified = true;
        Ok(f(&mut state))
    }

    /// Value by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock();
        state.accessed = true;
        state.data.get(key).cloned()
    }

    /// Value by key, deserialized
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Store a value
    ///
    /// # Errors
    ///
    /// Returns `Error::NullSession` on a null session, `Error::Json` if the
    /// value does not serialize.
    pub fn insert<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.mutate(|s| {
            s.data.insert(key.to_string(), value);
        })
    }

    /// Remove a value
    ///
    /// # Errors
    ///
    /// Returns `Error::NullSession` on a null session.
    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.mutate(|s| s.data.remove(key))
    }

    /// Remove everything
    ///
    /// # Errors
    ///
    /// Returns `Error::NullSession` on a null session.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|s| s.data.clear())
    }

    /// Check if a key exists
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.accessed = true;
        state.data.contains_key(key)
    }

    /// Stored keys
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().data.keys().cloned().collect()
    }

    /// Check if the session holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }

    /// Snapshot of the payload
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        self.state.lock().data.clone()
    }

    /// Whether the session outlives the browser session
    #[must_use]
    pub fn permanent(&self) -> bool {
        self.state
            .lock()
            .data
            .get(PERMANENT_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Mark the session permanent or not
    ///
    /// # Errors
    ///
    /// Returns `Error::NullSession` on a null session.
    pub fn set_permanent(&self, permanent: bool) -> Result<()> {
        self.mutate(|s| {
            s.data.insert(PERMANENT_KEY.to_string(), Value::Bool(permanent));
        })
    }

    /// Mark modified after mutating a stored value in place
    pub fn mark_modified(&self) {
        self.state.lock().modified = true;
    }

    /// Whether the session changed during the request
    #[must_use]
    pub fn modified(&self) -> bool {
        self.state.lock().modified
    }

    /// Whether the session was read or written during the request
    #[must_use]
    pub fn accessed(&self) -> bool {
        self.state.lock().accessed
    }

    /// Whether the session was created rather than loaded
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.lock().new
    }

    /// Whether this is the null placeholder
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.state.lock().null
    }

    /// Whether two handles point at the same session
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// One entry of the tagged JSON registry
///
/// A tag claims values it `check`s, stores them as `{key: to_json(value)}` and
/// restores them with `to_value`.
pub trait JsonTag: Send + Sync {
    /// Marker key, e.g. `" t"`
    fn key(&self) -> &'static str;
    /// Whether this tag claims the value
    fn check(&self, value: &Value) -> bool;
    /// Encode the claimed value
    fn to_json(&self, value: &Value) -> Value;
    /// Decode a tagged value
    fn to_value(&self, json: Value) -> Value;
}

/// Escapes single-key objects whose key collides with a registered tag
struct TagDict {
    keys: Vec<&'static str>,
}

impl JsonTag for TagDict {
    fn key(&self) -> &'static str {
        " di"
    }

    fn check(&self, value: &Value) -> bool {
        value.as_object().is_some_and(|map| {
            map.len() == 1 && map.keys().all(|k| self.keys.contains(&k.as_str()))
        })
    }

    fn to_json(&self, value: &Value) -> Value {
        let mut out = Map::new();
        if let Some(map) = value.as_object() {
            for (k, v) in map {
                out.insert(format!("{k}__"), v.clone());
            }
        }
        Value::Object(out)
    }

    fn to_value(&self, json: Value) -> Value {
        match json {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.strip_suffix("__").unwrap_or(&k).to_string(), v))
                    .collect(),
            ),
            other => other,
        }
    }
}

/// Ordered registry of JSON tags; the first tag whose `check` passes wins
pub struct TaggedJson {
    tags: Vec<Arc<dyn JsonTag>>,
}

impl Default for TaggedJson {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaggedJson {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tags.iter().map(|t| t.key()))
            .finish()
    }
}

impl TaggedJson {
    /// Registry with the object-escaping tag
    #[must_use]
    pub fn new() -> Self {
        let mut serializer = Self { tags: Vec::new() };
        serializer.rebuild_escape();
        serializer
    }

    fn rebuild_escape(&mut self) {
        self.tags.retain(|t| t.key() != " di");
        let mut keys: Vec<&'static str> = self.tags.iter().map(|t| t.key()).collect();
        keys.push(" di");
        self.tags.insert(0, Arc::new(TagDict { keys }));
    }

    /// Register a tag at `index` (or last)
    ///
    /// # Errors
    ///
    /// Returns `Error::Setup` if the key is taken.
    pub fn register(&mut self, tag: Arc<dyn JsonTag>, index: Option<usize>) -> Result<()> {
        if self.tags.iter().any(|t| t.key() == tag.key()) {
            return Err(Error::Setup(format!("Tag '{}' is already registered.", tag.key())));
        }
        match index {
            Some(i) => self.tags.insert(i.min(self.tags.len()), tag),
            None => self.tags.push(tag),
        }
        self.rebuild_escape();
        Ok(())
    }

    /// Encode a value, tagging what the registry claims
    #[must_use]
    pub fn tag(&self, value: &Value) -> Value {
        for tag in &self.tags {
            if tag.check(value) {
                let mut map = Map::new();
                map.insert(tag.key().to_string(), self.tag(&tag.to_json(value)));
                return Value::Object(map);
            }
        }
        match value {
            Value::Object(map) => {
                Value::Object(map.iter().map(|(k, v)| (k.clone(), self.tag(v))).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.tag(v)).collect()),
            other => other.clone(),
        }
    }

    /// Decode a tagged value
    #[must_use]
    pub fn untag(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some((key, inner)) = map.iter().next() {
                        if let Some(tag) = self.tags.iter().find(|t| t.key() == key.as_str()) {
                            return tag.to_value(self.untag(inner.clone()));
                        }
                    }
                }
                Value::Object(map.into_iter().map(|(k, v)| (k, self.untag(v))).collect())
            }
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.untag(v)).collect()),
            other => other,
        }
    }
}

/// Storage backend for sessions
pub trait SessionInterface: Send + Sync {
    /// Load the session for a request; `None` means sessions are unavailable
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    fn open_session(&self, app: &App, request: &Request) -> Result<Option<Session>>;

    /// Persist the session onto the response
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    fn save_session(&self, app: &App, session: &Session, response: &mut Response) -> Result<()>;

    /// Placeholder used when `open_session` returns `None`
    fn make_null_session(&self, _app: &App) -> Session {
        Session::null()
    }

    /// Whether a session is the null placeholder
    fn is_null_session(&self, session: &Session) -> bool {
        session.is_null()
    }

    /// Cookie name
    fn get_cookie_name(&self, app: &App) -> String {
        app.config().session_cookie_name.clone()
    }

    /// Cookie domain
    fn get_cookie_domain(&self, app: &App) -> Option<String> {
        app.config().session_cookie_domain.clone()
    }

    /// Cookie path
    fn get_cookie_path(&self, app: &App) -> String {
        app.config().session_cookie_path_or_root()
    }

    /// Cookie `HttpOnly` flag
    fn get_cookie_httponly(&self, app: &App) -> bool {
        app.config().session_cookie_httponly
    }

    /// Cookie `Secure` flag
    fn get_cookie_secure(&self, app: &App) -> bool {
        app.config().session_cookie_secure
    }

    /// Cookie `SameSite` attribute
    fn get_cookie_samesite(&self, app: &App) -> Option<String> {
        app.config().session_cookie_samesite.clone()
    }

    /// Expiry of the cookie; `None` for a browser-session cookie
    fn get_expiration_time(&self, app: &App, session: &Session) -> Option<DateTime<Utc>> {
        if !session.permanent() {
            return None;
        }
        let lifetime = app.config().permanent_session_lifetime;
        chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
    }

    /// Whether the cookie must be (re)sent
    fn should_set_cookie(&self, app: &App, session: &Session) -> bool {
        session.modified() || (session.permanent() && app.config().session_refresh_each_request)
    }
}

/// Default interface: the whole session in one signed cookie
#[derive(Debug)]
pub struct SecureCookieSessionInterface {
    salt: String,
    serializer: TaggedJson,
}

impl Default for SecureCookieSessionInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureCookieSessionInterface {
    /// Interface salted with `cookie-session`
    #[must_use]
    pub fn new() -> Self {
        Self {
            salt: "cookie-session".to_string(),
            serializer: TaggedJson::new(),
        }
    }

    /// Interface with a custom tag registry
    #[must_use]
    pub fn with_serializer(serializer: TaggedJson) -> Self {
        Self {
            serializer,
            ..Self::new()
        }
    }

    fn signer(&self, app: &App) -> Option<Signer> {
        let secret = app.config().secret_key.clone()?;
        if secret.is_empty() {
            return None;
        }
        Some(Signer::new(&secret, &self.salt))
    }
}

impl SessionInterface for SecureCookieSessionInterface {
    fn open_session(&self, app: &App, request: &Request) -> Result<Option<Session>> {
        let Some(signer) = self.signer(app) else {
            return Ok(None);
        };
        let Some(token) = request.cookie(&self.get_cookie_name(app)) else {
            return Ok(Some(Session::new()));
        };

        let max_age = app.config().permanent_session_lifetime;
        match signer.verify(token, Some(max_age)) {
            Ok(payload) => match self.serializer.untag(payload) {
                Value::Object(map) => Ok(Some(Session::from_map(map))),
                _ => Ok(Some(Session::new())),
            },
            Err(_) => Ok(Some(Session::new())),
        }
    }

    fn save_session(&self, app: &App, session: &Session, response: &mut Response) -> Result<()> {
        let name = self.get_cookie_name(app);
        let domain = self.get_cookie_domain(app);
        let path = self.get_cookie_path(app);
        let secure = self.get_cookie_secure(app);
        let samesite = self.get_cookie_samesite(app);
        let httponly = self.get_cookie_httponly(app);

        if session.accessed() {
            response.add_vary("Cookie");
        }

        if session.is_empty() {
            if session.modified() {
                response.delete_cookie(SetCookie {
                    key: name,
                    value: String::new(),
                    path: Some(path),
                    domain,
                    secure,
                    httponly,
                    samesite,
                    ..SetCookie::default()
                });
                response.add_vary("Cookie");
            }
            return Ok(());
        }

        if !self.should_set_cookie(app, session) {
            return Ok(());
        }

        let Some(signer) = self.signer(app) else {
            return Ok(());
        };
        let payload = self.serializer.tag(&Value::Object(session.to_map()));
        let value = signer.sign(&payload)?;

        let cookie = SetCookie {
            key: name,
            value,
            expires: self.get_expiration_time(app, session),
            path: Some(path),
            domain,
            secure,
            httponly,
            samesite,
            max_age: None,
        };
        let header = cookie.to_header();
        let limit = app.config().max_cookie_size;
        if limit > 0 && header.len() > limit {
            warn!(
                cookie = %cookie.key,
                size = header.len(),
                limit,
                "Session cookie is too large; browsers may silently ignore it"
            );
        }
        response.set_cookie(&cookie);
        response.add_vary("Cookie");
        Ok(())
    }
}
