//! # Application Configuration
//!
//! Typed settings with the usual framework defaults, plus an `extra` map for
//! application-defined keys. Keys are matched case-insensitively, so both
//! `"DEBUG"` and `"debug"` set `Config::debug`.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Debug mode
    pub debug: bool,
    /// Testing mode
    pub testing: bool,
    /// Re-raise unhandled errors instead of rendering a 500; defaults to `testing || debug`
    pub propagate_exceptions: Option<bool>,
    /// Keep the request context after an unhandled error; defaults to `debug`
    pub preserve_context_on_exception: Option<bool>,
    /// Key for signing session cookies
    pub secret_key: Option<String>,
    /// Lifetime of a permanent session
    pub permanent_session_lifetime: Duration,
    /// Host (and port) the application is served on
    pub server_name: Option<String>,
    /// Path the application is mounted under
    pub application_root: String,
    /// Name of the session cookie
    pub session_cookie_name: String,
    /// Domain of the session cookie
    pub session_cookie_domain: Option<String>,
    /// Path of the session cookie; defaults to `application_root`
    pub session_cookie_path: Option<String>,
    /// `HttpOnly` flag of the session cookie
    pub session_cookie_httponly: bool,
    /// `Secure` flag of the session cookie
    pub session_cookie_secure: bool,
    /// `SameSite` attribute of the session cookie
    pub session_cookie_samesite: Option<String>,
    /// Re-send permanent session cookies on every request
    pub session_refresh_each_request: bool,
    /// Largest accepted request body
    pub max_content_length: Option<usize>,
    /// Route HTTP errors through the user error handlers
    pub trap_http_exceptions: bool,
    /// Route 400 errors through the user error handlers
    pub trap_bad_request_errors: Option<bool>,
    /// Scheme for external URLs built outside a request
    pub preferred_url_scheme: String,
    /// Sort object keys when serializing JSON responses
    pub json_sort_keys: bool,
    /// Pretty-print JSON responses
    pub jsonify_prettyprint_regular: bool,
    /// Mimetype of JSON responses
    pub jsonify_mimetype: String,
    /// Reload templates when their source changes; defaults to `debug`
    pub templates_auto_reload: Option<bool>,
    /// Cookie size above which a warning is logged
    pub max_cookie_size: usize,
    /// Application-defined keys (stored upper-cased)
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            testing: false,
            propagate_exceptions: None,
            preserve_context_on_exception: None,
            secret_key: None,
            permanent_session_lifetime: Duration::from_secs(31 * 24 * 60 * 60),
            server_name: None,
            application_root: "/".to_string(),
            session_cookie_name: "session".to_string(),
            session_cookie_domain: None,
            session_cookie_path: None,
            session_cookie_httponly: true,
            session_cookie_secure: false,
            session_cookie_samesite: None,
            session_refresh_each_request: true,
            max_content_length: None,
            trap_http_exceptions: false,
            trap_bad_request_errors: None,
            preferred_url_scheme: "http".to_string(),
            json_sort_keys: true,
            jsonify_prettyprint_regular: false,
            jsonify_mimetype: "application/json".to_string(),
            templates_auto_reload: None,
            max_cookie_size: 4093,
            extra: Map::new(),
        }
    }
}

fn expect_bool(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(Error::Config(format!("{key}: expected a boolean, got '{s}'"))),
        },
        other => Err(Error::Config(format!("{key}: expected a boolean, got {other}"))),
    }
}

fn expect_opt_string(key: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(Error::Config(format!("{key}: expected a string, got {other}"))),
    }
}

fn expect_string(key: &str, value: &Value) -> Result<String> {
    expect_opt_string(key, value)?
        .ok_or_else(|| Error::Config(format!("{key}: may not be null")))
}

fn expect_u64(key: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| Error::Config(format!("{key}: expected a positive integer"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| Error::Config(format!("{key}: expected a positive integer, got '{s}'"))),
        other => Err(Error::Config(format!("{key}: expected an integer, got {other}"))),
    }
}

fn opt<T>(value: &Value, f: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
    if value.is_null() {
        Ok(None)
    } else {
        f().map(Some)
    }
}

impl Config {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single key
    ///
    /// Known keys are validated and stored in their typed field; unknown keys
    /// land in `extra`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a known key has a value of the wrong shape.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let upper = key.to_uppercase();
        let k = upper.as_str();
        match k {
            "DEBUG" => self.debug = expect_bool(k, &value)?,
            "TESTING" => self.testing = expect_bool(k, &value)?,
            "PROPAGATE_EXCEPTIONS" => {
                self.propagate_exceptions = opt(&value, || expect_bool(k, &value))?;
            }
            "PRESERVE_CONTEXT_ON_EXCEPTION" => {
                self.preserve_context_on_exception = opt(&value, || expect_bool(k, &value))?;
            }
            "SECRET_KEY" => self.secret_key = expect_opt_string(k, &value)?,
            "PERMANENT_SESSION_LIFETIME" => {
                self.permanent_session_lifetime = Duration::from_secs(expect_u64(k, &value)?);
            }
            "SERVER_NAME" => self.server_name = expect_opt_string(k, &value)?,
            "APPLICATION_ROOT" => self.application_root = expect_string(k, &value)?,
            "SESSION_COOKIE_NAME" => self.session_cookie_name = expect_string(k, &value)?,
            "SESSION_COOKIE_DOMAIN" => self.session_cookie_domain = expect_opt_string(k, &value)?,
            "SESSION_COOKIE_PATH" => self.session_cookie_path = expect_opt_string(k, &value)?,
            "SESSION_COOKIE_HTTPONLY" => self.session_cookie_httponly = expect_bool(k, &value)?,
            "SESSION_COOKIE_SECURE" => self.session_cookie_secure = expect_bool(k, &value)?,
            "SESSION_COOKIE_SAMESITE" => {
                self.session_cookie_samesite = expect_opt_string(k, &value)?;
            }
            "SESSION_REFRESH_EACH_REQUEST" => {
                self.session_refresh_each_request = expect_bool(k, &value)?;
            }
            "MAX_CONTENT_LENGTH" => {
                self.max_content_length = opt(&value, || {
                    usize::try_from(expect_u64(k, &value)?)
                        .map_err(|_| Error::Config(format!("{k}: value too large")))
                })?;
            }
            "TRAP_HTTP_EXCEPTIONS" => self.trap_http_exceptions = expect_bool(k, &value)?,
            "TRAP_BAD_REQUEST_ERRORS" => {
                self.trap_bad_request_errors = opt(&value, || expect_bool(k, &value))?;
            }
            "PREFERRED_URL_SCHEME" => self.preferred_url_scheme = expect_string(k, &value)?,
            "JSON_SORT_KEYS" => self.json_sort_keys = expect_bool(k, &value)?,
            "JSONIFY_PRETTYPRINT_REGULAR" => {
                self.jsonify_prettyprint_regular = expect_bool(k, &value)?;
            }
            "JSONIFY_MIMETYPE" => self.jsonify_mimetype = expect_string(k, &value)?,
            "TEMPLATES_AUTO_RELOAD" => {
                self.templates_auto_reload = opt(&value, || expect_bool(k, &value))?;
            }
            "MAX_COOKIE_SIZE" => {
                self.max_cookie_size = usize::try_from(expect_u64(k, &value)?)
                    .map_err(|_| Error::Config(format!("{k}: value too large")))?;
            }
            _ => {
                self.extra.insert(k.to_string(), value);
            }
        }
        Ok(())
    }

    /// Look up an application-defined key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(&key.to_uppercase())
    }

    /// Merge every key of a JSON object
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the text is not a JSON object or a key is invalid.
    pub fn from_json_str(&mut self, json: &str) -> Result<()> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Object(map) = value else {
            return Err(Error::Config("configuration must be a JSON object".to_string()));
        };
        self.update(map)
    }

    /// Merge every key of a JSON file
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, `Error::Config` if it is invalid.
    pub fn from_json_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Unable to load configuration file {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loading configuration file");
        self.from_json_str(&text)
    }

    /// Load the JSON file named by an environment variable
    ///
    /// Returns `Ok(false)` if the variable is unset and `silent` is true.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the variable is unset (and not silent) or the file is invalid.
    pub fn from_envvar(&mut self, variable: &str, silent: bool) -> Result<bool> {
        match std::env::var(variable) {
            Ok(path) if !path.is_empty() => {
                self.from_json_file(path)?;
                Ok(true)
            }
            _ if silent => Ok(false),
            _ => Err(Error::Config(format!(
                "The environment variable '{variable}' is not set and as such \
                 configuration could not be loaded."
            ))),
        }
    }

    /// Load every `PREFIX_KEY` environment variable as `KEY`
    ///
    /// Values are parsed as JSON when possible, else taken as strings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a known key receives an invalid value.
    pub fn from_env_prefixed(&mut self, prefix: &str) -> Result<usize> {
        self.from_vars(prefix, std::env::vars())
    }

    fn from_vars(
        &mut self,
        prefix: &str,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<usize> {
        let prefix = format!("{}_", prefix.trim_end_matches('_'));
        let mut loaded = 0;
        let mut pairs: Vec<(String, String)> =
            vars.filter(|(k, _)| k.starts_with(&prefix)).collect();
        pairs.sort();
        for (key, raw) in pairs {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            self.set(&key[prefix.len()..], value)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Merge a map of keys
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a known key receives an invalid value.
    pub fn update(&mut self, map: Map<String, Value>) -> Result<()> {
        for (key, value) in map {
            self.set(&key, value)?;
        }
        Ok(())
    }

    /// Application-defined keys starting with `namespace`, prefix stripped and lower-cased
    #[must_use]
    pub fn get_namespace(&self, namespace: &str) -> Map<String, Value> {
        let namespace = namespace.to_uppercase();
        self.extra
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&namespace)
                    .map(|rest| (rest.to_lowercase(), v.clone()))
            })
            .collect()
    }

    /// Effective propagate-exceptions setting
    #[must_use]
    pub fn propagate_exceptions_enabled(&self) -> bool {
        self.propagate_exceptions
            .unwrap_or(self.testing || self.debug)
    }

    /// Effective preserve-context-on-exception setting
    #[must_use]
    pub fn preserve_context_on_exception_enabled(&self) -> bool {
        self.preserve_context_on_exception.unwrap_or(self.debug)
    }

    /// Effective trap-bad-request setting
    #[must_use]
    pub fn trap_bad_request_enabled(&self) -> bool {
        self.trap_bad_request_errors.unwrap_or(false)
    }

    /// Every setting as an upper-cased JSON object, for templates
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |key: &str, value: Value| {
            map.insert(key.to_string(), value);
        };
        put("DEBUG", Value::from(self.debug));
        put("TESTING", Value::from(self.testing));
        put("PROPAGATE_EXCEPTIONS", Value::from(self.propagate_exceptions));
        put(
            "PRESERVE_CONTEXT_ON_EXCEPTION",
            Value::from(self.preserve_context_on_exception),
        );
        put(
            "PERMANENT_SESSION_LIFETIME",
            Value::from(self.permanent_session_lifetime.as_secs()),
        );
        put("SERVER_NAME", Value::from(self.server_name.clone()));
        put("APPLICATION_ROOT", Value::from(self.application_root.clone()));
        put("SESSION_COOKIE_NAME", Value::from(self.session_cookie_name.clone()));
        put("SESSION_COOKIE_DOMAIN", Value::from(self.session_cookie_domain.clone()));
        put("SESSION_COOKIE_PATH", Value::from(self.session_cookie_path.clone()));
        put("SESSION_COOKIE_HTTPONLY", Value::from(self.session_cookie_httponly));
        put("SESSION_COOKIE_SECURE", Value::from(self.session_cookie_secure));
        put("SESSION_COOKIE_SAMESITE", Value::from(self.session_cookie_samesite.clone()));
        put("SESSION_REFRESH_EACH_REQUEST", Value::from(self.session_refresh_each_request));
        put("MAX_CONTENT_LENGTH", Value::from(self.max_content_length));
        put("TRAP_HTTP_EXCEPTIONS", Value::from(self.trap_http_exceptions));
        put("TRAP_BAD_REQUEST_ERRORS", Value::from(self.trap_bad_request_errors));
        put("PREFERRED_URL_SCHEME", Value::from(self.preferred_url_scheme.clone()));
        put("JSON_SORT_KEYS", Value::from(self.json_sort_keys));
        put("JSONIFY_PRETTYPRINT_REGULAR", Value::from(self.jsonify_prettyprint_regular));
        put("JSONIFY_MIMETYPE", Value::from(self.jsonify_mimetype.clone()));
        put("TEMPLATES_AUTO_RELOAD", Value::from(self.templates_auto_reload));
        put("MAX_COOKIE_SIZE", Value::from(self.max_cookie_size));
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        map
    }

    /// Effective template auto-reload setting
    #[must_use]
    pub fn templates_auto_reload_enabled(&self) -> bool {
        self.templates_auto_reload.unwrap_or(self.debug)
    }

    /// Cookie path for the session cookie
    #[must_use]
    pub fn session_cookie_path_or_root(&self) -> String {
        self.session_cookie_path
            .clone()
            .unwrap_or_else(|| self.application_root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.session_cookie_name, "session");
        assert_eq!(config.application_root, "/");
        assert_eq!(config.permanent_session_lifetime.as_secs(), 2_678_400);
        assert!(!config.propagate_exceptions_enabled());
        assert!(config.session_cookie_httponly);
    }

    #[test]
    fn test_from_json_str() {
        let mut config = Config::new();
        config
            .from_json_str(r#"{"DEBUG": true, "secret_key": "dev", "MAIL_SERVER": "smtp"}"#)
            .unwrap();
        assert!(config.debug);
        assert_eq!(config.secret_key.as_deref(), Some("dev"));
        assert_eq!(config.get("mail_server"), Some(&Value::String("smtp".into())));
        assert!(config.propagate_exceptions_enabled());
        assert!(config.preserve_context_on_exception_enabled());
    }

    #[test]
    fn test_invalid_value() {
        let mut config = Config::new();
        assert!(matches!(
            config.set("DEBUG", Value::String("perhaps".into())),
            Err(Error::Config(_))
        ));
        assert!(config.from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn test_explicit_override() {
        let mut config = Config::new();
        config.debug = true;
        config.propagate_exceptions = Some(false);
        assert!(!config.propagate_exceptions_enabled());
    }

    #[test]
    fn test_env_prefixed() {
        let mut config = Config::new();
        let vars = vec![
            ("PHIAL_TESTING".to_string(), "true".to_string()),
            ("PHIAL_SERVER_NAME".to_string(), "example.com".to_string()),
            ("OTHER".to_string(), "1".to_string()),
        ];
        assert_eq!(config.from_vars("PHIAL", vars.into_iter()).unwrap(), 2);
        assert!(config.testing);
        assert_eq!(config.server_name.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_envvar_silent() {
        let mut config = Config::new();
        assert!(!config.from_envvar("PHIAL_SURELY_UNSET_VAR", true).unwrap());
        assert!(config.from_envvar("PHIAL_SURELY_UNSET_VAR", false).is_err());
    }

    #[test]
    fn test_json_file() {
        let path = std::env::temp_dir().join(format!("phial-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"TESTING": true}"#).unwrap();
        let mut config = Config::new();
        config.from_json_file(&path).unwrap();
        assert!(config.testing);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_get_namespace() {
        let mut config = Config::new();
        config.set("IMAGE_STORE_TYPE", "fs".into()).unwrap();
        config.set("IMAGE_STORE_PATH", "/var/app/images".into()).unwrap();
        config.set("OTHER", 1.into()).unwrap();
        let ns = config.get_namespace("IMAGE_STORE_");
        assert_eq!(ns.len(), 2);
        assert_eq!(ns.get("type"), Some(&Value::String("fs".into())));
    }
}
