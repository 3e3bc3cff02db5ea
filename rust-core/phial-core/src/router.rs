//! # URL Map and Adapter
//!
//! Radix-trie based matching using `matchit`. Rules of the same shape share
//! a trie slot whatever their variable names. Within a slot they are tried
//! most specific converter first; a rejected conversion falls through to the
//! next rule, and methods tell the rest apart.
//!
//! The dispatcher only sees the `UrlAdapter` trait: match a path, build a
//! URL, list the methods a path accepts.

use crate::error::{BuildError, Error, Result};
use crate::exceptions::HttpException;
use crate::route::Rule;
use crate::types::ViewArgs;
use matchit::Router as MatchitRouter;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// HTTP methods accepted in rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
    /// HTTP PATCH
    Patch,
    /// HTTP HEAD
    Head,
    /// HTTP OPTIONS
    Options,
    /// HTTP CONNECT
    Connect,
    /// HTTP TRACE
    Trace,
}

impl Method {
    /// Parse a method name, case-insensitively
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "PATCH" => Some(Self::Patch),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            "CONNECT" => Some(Self::Connect),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }

    /// Upper-case method name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matching contract between the request context and the routing backend
pub trait UrlAdapter: Send + Sync {
    /// Match a path and method
    ///
    /// # Errors
    ///
    /// Returns an HTTP error: 404, 405 (with valid methods) or a 308 routing redirect.
    fn match_request(&self, path_info: &str, method: &str) -> Result<(Arc<Rule>, ViewArgs)>;

    /// Build a URL for an endpoint
    ///
    /// # Errors
    ///
    /// Returns `Error::Build` if no rule of the endpoint accepts the values.
    fn build(
        &self,
        endpoint: &str,
        values: &ViewArgs,
        method: Option<&str>,
        force_external: bool,
        scheme: Option<&str>,
    ) -> Result<String>;

    /// Methods accepted at a path, sorted
    fn allowed_methods(&self, path_info: &str) -> Vec<String>;
}

enum Lookup {
    Found(Arc<Rule>, ViewArgs),
    MethodMismatch(BTreeSet<String>),
    NoMatch,
}

/// Every registered rule, indexed for matching and building
#[derive(Clone)]
pub struct UrlMap {
    rules: Vec<Arc<Rule>>,
    matcher: MatchitRouter<usize>,
    /// Rule indexes per trie slot
    slots: Vec<Vec<usize>>,
    patterns: HashMap<String, usize>,
    by_endpoint: HashMap<String, Vec<usize>>,
}

impl Default for UrlMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UrlMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| (&r.rule, &r.endpoint, &r.methods)))
            .finish()
    }
}

impl UrlMap {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            matcher: MatchitRouter::new(),
            slots: Vec::new(),
            patterns: HashMap::new(),
            by_endpoint: HashMap::new(),
        }
    }

    /// Register a rule
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if matchit rejects the pattern
    /// (for example a conflicting wildcard).
    pub fn add(&mut self, rule: Rule) -> Result<Arc<Rule>> {
        let index = self.rules.len();
        let slot = match self.patterns.get(&rule.match_pattern) {
            Some(&slot) => slot,
            None => {
                let slot = self.slots.len();
                self.matcher
                    .insert(rule.match_pattern.clone(), slot)
                    .map_err(|e| Error::InvalidRoutePattern {
                        pattern: rule.rule.clone(),
                        reason: e.to_string(),
                    })?;
                self.patterns.insert(rule.match_pattern.clone(), slot);
                self.slots.push(Vec::new());
                slot
            }
        };

        let rule = Arc::new(rule);
        let weights = rule.weights();
        let rules = &self.rules;
        let slot = &mut self.slots[slot];
        let position = slot
            .iter()
            .position(|&other| rules[other].weights() > weights)
            .unwrap_or(slot.len());
        slot.insert(position, index);
        self.by_endpoint
            .entry(rule.endpoint.clone())
            .or_default()
            .push(index);
        self.rules.push(Arc::clone(&rule));
        Ok(rule)
    }

    /// All rules in registration order
    #[must_use]
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Rules for an endpoint in registration order
    #[must_use]
    pub fn rules_for(&self, endpoint: &str) -> Vec<Arc<Rule>> {
        self.by_endpoint
            .get(endpoint)
            .map(|ids| ids.iter().map(|&i| Arc::clone(&self.rules[i])).collect())
            .unwrap_or_default()
    }

    fn lookup(&self, path: &str, method: &str) -> Lookup {
        let Ok(matched) = self.matcher.at(path) else {
            return Lookup::NoMatch;
        };

        let mut valid = BTreeSet::new();
        for &index in &self.slots[*matched.value] {
            let rule = &self.rules[index];
            let Some(args) = rule.convert(matched.params.iter()) else {
                continue;
            };
            if rule.methods.contains(method) {
                return Lookup::Found(Arc::clone(rule), args);
            }
            valid.extend(rule.methods.iter().cloned());
        }

        if valid.is_empty() {
            Lookup::NoMatch
        } else {
            Lookup::MethodMismatch(valid)
        }
    }
}

/// Bound view of a `UrlMap` for one host/mount point
#[derive(Debug, Clone)]
pub struct MapAdapter {
    map: Arc<UrlMap>,
    server_name: String,
    script_name: String,
    url_scheme: String,
    query_string: String,
}

impl MapAdapter {
    /// Bind a map to a host, mount point and scheme
    #[must_use]
    pub fn new(map: Arc<UrlMap>, server_name: &str, script_name: &str, url_scheme: &str) -> Self {
        Self {
            map,
            server_name: server_name.to_string(),
            script_name: script_name.trim_end_matches('/').to_string(),
            url_scheme: url_scheme.to_string(),
            query_string: String::new(),
        }
    }

    /// Query string carried over into routing redirects
    #[must_use]
    pub fn with_query_string(mut self, query: &str) -> Self {
        self.query_string = query.to_string();
        self
    }

    fn external(&self, scheme: Option<&str>, path: &str) -> String {
        format!(
            "{}://{}{}",
            scheme.unwrap_or(&self.url_scheme),
            self.server_name,
            path
        )
    }
}

impl UrlAdapter for MapAdapter {
    fn match_request(&self, path_info: &str, method: &str) -> Result<(Arc<Rule>, ViewArgs)> {
        match self.map.lookup(path_info, method) {
            Lookup::Found(rule, args) => return Ok((rule, args)),
            Lookup::MethodMismatch(valid) => {
                return Err(HttpException::method_not_allowed(valid.into_iter().collect()).into());
            }
            Lookup::NoMatch => {}
        }

        if !path_info.ends_with('/') {
            let slashed = format!("{path_info}/");
            if let Lookup::Found(rule, _) = self.map.lookup(&slashed, method) {
                if rule.strict_slashes {
                    let mut url = self.external(None, &format!("{}{slashed}", self.script_name));
                    if !self.query_string.is_empty() {
                        url.push('?');
                        url.push_str(&self.query_string);
                    }
                    return Err(HttpException::request_redirect(url).into());
                }
            }
        }

        Err(HttpException::not_found().into())
    }

    fn build(
        &self,
        endpoint: &str,
        values: &ViewArgs,
        method: Option<&str>,
        force_external: bool,
        scheme: Option<&str>,
    ) -> Result<String> {
        for rule in self.map.rules_for(endpoint) {
            if method.is_some_and(|m| !rule.methods.contains(&m.to_uppercase())) {
                continue;
            }
            let Some((path, leftover)) = rule.build(values) else {
                continue;
            };

            let mut url = format!("{}{path}", self.script_name);
            if !leftover.is_empty() {
                let query: Vec<String> = leftover
                    .iter()
                    .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                    .collect();
                url.push('?');
                url.push_str(&query.join("&"));
            }
            return Ok(if force_external || scheme.is_some() {
                self.external(scheme, &url)
            } else {
                url
            });
        }

        Err(BuildError {
            endpoint: endpoint.to_string(),
            values: values.clone(),
            method: method.map(str::to_string),
        }
        .into())
    }

    fn allowed_methods(&self, path_info: &str) -> Vec<String> {
        let Ok(matched) = self.map.matcher.at(path_info) else {
            return Vec::new();
        };
        let mut methods = BTreeSet::new();
        for &index in &self.map.slots[*matched.value] {
            let rule = &self.map.rules[index];
            if rule.convert(matched.params.iter()).is_some() {
                methods.extend(rule.methods.iter().cloned());
            }
        }
        methods.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamValue;

    fn adapter(rules: Vec<Rule>) -> MapAdapter {
        let mut map = UrlMap::new();
        for rule in rules {
            map.add(rule).unwrap();
        }
        MapAdapter::new(Arc::new(map), "localhost", "", "http")
    }

    #[test]
    fn test_basic_routing() {
        let adapter = adapter(vec![
            Rule::new("/", "index", None).unwrap(),
            Rule::new("/users", "list_users", None).unwrap(),
            Rule::new("/users", "create_user", Some(&["POST"])).unwrap(),
        ]);

        let (rule, _) = adapter.match_request("/", "GET").unwrap();
        assert_eq!(rule.endpoint, "index");

        let (rule, _) = adapter.match_request("/users", "GET").unwrap();
        assert_eq!(rule.endpoint, "list_users");

        let (rule, _) = adapter.match_request("/users", "POST").unwrap();
        assert_eq!(rule.endpoint, "create_user");
    }

    #[test]
    fn test_typed_parameters() {
        let adapter = adapter(vec![
            Rule::new("/orders/<int:id>/status/<bool:active>", "order", None).unwrap(),
            Rule::new("/products/<float:price>", "product", None).unwrap(),
        ]);

        let (_, args) = adapter.match_request("/orders/42/status/true", "GET").unwrap();
        assert_eq!(args.get("id").and_then(ParamValue::as_int), Some(42));
        assert_eq!(args.get("active").and_then(ParamValue::as_bool), Some(true));

        let (_, args) = adapter.match_request("/products/19.5", "GET").unwrap();
        assert_eq!(args.get("price").and_then(ParamValue::as_float), Some(19.5));
    }

    #[test]
    fn test_conversion_failure_is_not_found() {
        let adapter = adapter(vec![Rule::new("/users/<int:id>", "user", None).unwrap()]);
        let err = adapter.match_request("/users/abc", "GET").unwrap_err();
        assert_eq!(err.code(), Some(404));
    }

    #[test]
    fn test_converter_decides_between_same_shape_rules() {
        let adapter = adapter(vec![
            Rule::new("/u/<name>", "by_name", None).unwrap(),
            Rule::new("/u/<int:id>", "by_id", None).unwrap(),
        ]);

        let (rule, args) = adapter.match_request("/u/7", "GET").unwrap();
        assert_eq!(rule.endpoint, "by_id");
        assert_eq!(args.get("id").and_then(ParamValue::as_int), Some(7));

        let (rule, args) = adapter.match_request("/u/ann", "GET").unwrap();
        assert_eq!(rule.endpoint, "by_name");
        assert_eq!(args.get("name").and_then(ParamValue::as_str), Some("ann"));
    }

    #[test]
    fn test_route_not_found() {
        let adapter = adapter(vec![]);
        let err = adapter.match_request("/nonexistent", "GET").unwrap_err();
        assert_eq!(err.code(), Some(404));
    }

    #[test]
    fn test_method_not_allowed() {
        let adapter = adapter(vec![Rule::new("/users", "users", None).unwrap()]);

        let err = adapter.match_request("/users", "POST").unwrap_err();
        assert_eq!(err.code(), Some(405));
        let valid = err.as_http().map(|e| e.valid_methods().to_vec()).unwrap();
        assert_eq!(valid, vec!["GET".to_string(), "HEAD".to_string()]);
    }

    #[test]
    fn test_head_implied_by_get() {
        let adapter = adapter(vec![Rule::new("/ping", "ping", None).unwrap()]);
        assert!(adapter.match_request("/ping", "HEAD").is_ok());
    }

    #[test]
    fn test_strict_slashes_redirect() {
        let adapter = adapter(vec![Rule::new("/projects/", "projects", None).unwrap()])
            .with_query_string("page=2");
        let err = adapter.match_request("/projects", "GET").unwrap_err();
        let exc = err.as_http().unwrap();
        assert!(exc.is_redirect());
        assert_eq!(exc.new_url(), Some("http://localhost/projects/?page=2"));
    }

    #[test]
    fn test_build_urls() {
        let adapter = adapter(vec![
            Rule::new("/users/<int:id>", "user", None).unwrap(),
            Rule::new("/files/<path:name>", "file", None).unwrap(),
        ]);

        let mut values = ViewArgs::new();
        values.insert("id".into(), ParamValue::Int(3));
        values.insert("q".into(), "a b".into());
        assert_eq!(
            adapter.build("user", &values, None, false, None).unwrap(),
            "/users/3?q=a%20b"
        );
        assert_eq!(
            adapter.build("user", &values, None, false, Some("https")).unwrap(),
            "https://localhost/users/3?q=a%20b"
        );

        let mut values = ViewArgs::new();
        values.insert("name".into(), "docs/read me.txt".into());
        assert_eq!(
            adapter.build("file", &values, None, false, None).unwrap(),
            "/files/docs/read%20me.txt"
        );

        assert!(matches!(
            adapter.build("user", &ViewArgs::new(), None, false, None),
            Err(Error::Build(_))
        ));
        assert!(adapter.build("user", &values, Some("POST"), false, None).is_err());
    }

    #[test]
    fn test_allowed_methods() {
        let adapter = adapter(vec![
            Rule::new("/items", "items", None).unwrap().with_automatic_options(true),
            Rule::new("/items", "add_item", Some(&["POST"])).unwrap(),
        ]);
        assert_eq!(
            adapter.allowed_methods("/items"),
            vec!["GET", "HEAD", "OPTIONS", "POST"]
        );
        assert!(adapter.allowed_methods("/none").is_empty());
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("get"), Some(Method::Get));
        assert_eq!(Method::parse("TRACE"), Some(Method::Trace));
        assert_eq!(Method::parse("FETCH"), None);
        assert_eq!(Method::Patch.to_string(), "PATCH");
    }
}
