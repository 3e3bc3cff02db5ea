//! # URL Rules
//!
//! A `Rule` binds a URL pattern such as `/users/<int:id>` to an endpoint and a
//! set of methods. It knows how to turn matched text into typed view
//! arguments and how to turn view arguments back into a path.

use crate::error::{Error, Result};
use crate::router::Method;
use crate::types::{convert_param, parse_param_pattern, ParamType, ViewArgs};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Static(String),
    Param(String, ParamType),
}

/// One URL rule
#[derive(Debug, Clone)]
pub struct Rule {
    /// Original pattern, e.g. `/users/<int:id>`
    pub rule: String,
    /// Endpoint name the rule resolves to
    pub endpoint: String,
    /// Upper-case methods accepted by the rule
    pub methods: BTreeSet<String>,
    /// Values merged into the view arguments and used to disambiguate building
    pub defaults: ViewArgs,
    /// Redirect the slash-less URL of a rule ending in `/`
    pub strict_slashes: bool,
    /// Whether OPTIONS is answered automatically
    pub provide_automatic_options: bool,
    /// Normalized pattern for matchit with positional names, e.g. `/users/{p0}`
    pub(crate) match_pattern: String,
    segments: Vec<Segment>,
}

impl Rule {
    /// Parse a rule
    ///
    /// `methods` defaults to GET; a rule accepting GET also accepts HEAD.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` for a malformed pattern and
    /// `Error::Setup` for an unknown method.
    pub fn new(rule: &str, endpoint: &str, methods: Option<&[&str]>) -> Result<Self> {
        if !rule.starts_with('/') {
            return Err(Error::InvalidRoutePattern {
                pattern: rule.to_string(),
                reason: "urls must start with a leading slash".to_string(),
            });
        }

        let mut method_set = BTreeSet::new();
        for m in methods.unwrap_or(&["GET"]) {
            let method = Method::parse(m)
                .ok_or_else(|| Error::Setup(format!("unknown HTTP method '{m}' for {rule}")))?;
            method_set.insert(method.to_string());
        }
        if method_set.contains("GET") {
            method_set.insert("HEAD".to_string());
        }

        let (match_pattern, segments) = Self::parse_rule(rule)?;

        Ok(Self {
            rule: rule.to_string(),
            endpoint: endpoint.to_string(),
            methods: method_set,
            defaults: ViewArgs::new(),
            strict_slashes: true,
            provide_automatic_options: false,
            match_pattern,
            segments,
        })
    }

    /// Set default values
    #[must_use]
    pub fn with_defaults(mut self, defaults: ViewArgs) -> Self {
        self.defaults = defaults;
        self
    }

    /// Set slash strictness
    #[must_use]
    pub const fn with_strict_slashes(mut self, strict: bool) -> Self {
        self.strict_slashes = strict;
        self
    }

    /// Answer OPTIONS automatically
    #[must_use]
    pub fn with_automatic_options(mut self, enabled: bool) -> Self {
        self.provide_automatic_options = enabled;
        if enabled {
            self.methods.insert("OPTIONS".to_string());
        }
        self
    }

    /// Convert `<conv:name>` placeholders to matchit syntax
    ///
    /// Placeholders become `{p0}`, `{p1}`, ... by position so that rules of
    /// the same shape land in one trie slot whatever their variable names.
    /// Returns `(normalized_pattern, segments)`.
    fn parse_rule(rule: &str) -> Result<(String, Vec<Segment>)> {
        let raw: Vec<&str> = rule.split('/').skip(1).collect();
        let mut segments = Vec::with_capacity(raw.len());
        let mut normalized = Vec::with_capacity(raw.len());

        for (i, piece) in raw.iter().enumerate() {
            match parse_param_pattern(piece)? {
                Some((name, ParamType::Path)) => {
                    if i + 1 != raw.len() {
                        return Err(Error::InvalidRoutePattern {
                            pattern: rule.to_string(),
                            reason: "a path converter must be the last segment".to_string(),
                        });
                    }
                    normalized.push(format!("{{*p{}}}", Self::param_count(&segments)));
                    segments.push(Segment::Param(name, ParamType::Path));
                }
                Some((name, param_type)) => {
                    if segments
                        .iter()
                        .any(|s| matches!(s, Segment::Param(n, _) if *n == name))
                    {
                        return Err(Error::InvalidRoutePattern {
                            pattern: rule.to_string(),
                            reason: format!("variable name '{name}' used twice"),
                        });
                    }
                    normalized.push(format!("{{p{}}}", Self::param_count(&segments)));
                    segments.push(Segment::Param(name, param_type));
                }
                None => {
                    normalized.push(piece.replace('{', "{{").replace('}', "}}"));
                    segments.push(Segment::Static((*piece).to_string()));
                }
            }
        }

        Ok((format!("/{}", normalized.join("/")), segments))
    }

    fn param_count(segments: &[Segment]) -> usize {
        segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(..)))
            .count()
    }

    /// Converter weights in pattern order; within a trie slot rules with
    /// lower weights are tried first
    pub(crate) fn weights(&self) -> Vec<u8> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(_, ParamType::Int | ParamType::Float | ParamType::Bool) => Some(50),
                Segment::Param(_, ParamType::String) => Some(100),
                Segment::Param(_, ParamType::Path) => Some(200),
                Segment::Static(_) => None,
            })
            .collect()
    }

    /// Names of the URL variables, in pattern order
    #[must_use]
    pub fn arguments(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(name, _) => Some(name.as_str()),
                Segment::Static(_) => None,
            })
            .collect()
    }

    /// Convert matched text to view arguments, defaults merged in
    ///
    /// `params` carries the positional names of the match pattern; they are
    /// mapped back to the rule's own variable names. Returns `None` if a
    /// converter rejects its text.
    pub(crate) fn convert<'k, 'v>(
        &self,
        params: impl Iterator<Item = (&'k str, &'v str)>,
    ) -> Option<ViewArgs> {
        let raw: Vec<(&str, &str)> = params.collect();
        let mut args = ViewArgs::new();
        let variables = self.segments.iter().filter_map(|s| match s {
            Segment::Param(name, param_type) => Some((name, *param_type)),
            Segment::Static(_) => None,
        });
        for (position, (name, param_type)) in variables.enumerate() {
            let key = format!("p{position}");
            let text = raw.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)?;
            args.insert(name.clone(), convert_param(text, param_type).ok()?);
        }
        for (key, value) in &self.defaults {
            args.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Some(args)
    }

    /// Build the path for `values`
    ///
    /// Returns the path and the values that belong in the query string, or
    /// `None` if the rule cannot be built from these values.
    #[must_use]
    pub fn build(&self, values: &ViewArgs) -> Option<(String, Vec<(String, String)>)> {
        for (key, default) in &self.defaults {
            if values.get(key).is_some_and(|v| v != default) {
                return None;
            }
        }

        let mut pieces = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Static(s) => pieces.push(s.clone()),
                Segment::Param(name, param_type) => {
                    let value = values.get(name).or_else(|| self.defaults.get(name))?;
                    let text = value.as_string();
                    let encoded = if *param_type == ParamType::Path {
                        text.split('/')
                            .map(|p| urlencoding::encode(p).into_owned())
                            .collect::<Vec<_>>()
                            .join("/")
                    } else {
                        urlencoding::encode(&text).into_owned()
                    };
                    pieces.push(encoded);
                }
            }
        }

        let arguments = self.arguments();
        let leftover = values
            .iter()
            .filter(|(k, _)| !arguments.contains(&k.as_str()) && !self.defaults.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.as_string()))
            .collect();

        Some((format!("/{}", pieces.join("/")), leftover))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamValue;

    #[test]
    fn test_rule_simple() {
        let rule = Rule::new("/users", "users", None).unwrap();
        assert_eq!(rule.match_pattern, "/users");
        assert!(rule.arguments().is_empty());
        assert!(rule.methods.contains("HEAD"));
    }

    #[test]
    fn test_rule_with_typed_param() {
        let rule = Rule::new("/users/<int:id>", "user", None).unwrap();
        assert_eq!(rule.match_pattern, "/users/{p0}");
        assert_eq!(rule.arguments(), vec!["id"]);
    }

    #[test]
    fn test_rule_path_converter() {
        let rule = Rule::new("/static/<path:filename>", "static", None).unwrap();
        assert_eq!(rule.match_pattern, "/static/{*p0}");
        assert!(Rule::new("/a/<path:p>/b", "x", None).is_err());
    }

    #[test]
    fn test_rule_root_and_trailing_slash() {
        assert_eq!(Rule::new("/", "index", None).unwrap().match_pattern, "/");
        assert_eq!(
            Rule::new("/projects/", "projects", None).unwrap().match_pattern,
            "/projects/"
        );
    }

    #[test]
    fn test_rule_rejects_bad_input() {
        assert!(Rule::new("users", "u", None).is_err());
        assert!(matches!(
            Rule::new("/u", "u", Some(&["FETCH"])),
            Err(Error::Setup(_))
        ));
        assert!(Rule::new("/<a>/<a>", "u", None).is_err());
    }

    #[test]
    fn test_build_with_leftover() {
        let rule = Rule::new("/users/<int:id>", "user", None).unwrap();
        let mut values = ViewArgs::new();
        values.insert("id".into(), ParamValue::Int(7));
        values.insert("tab".into(), "posts".into());
        let (path, leftover) = rule.build(&values).unwrap();
        assert_eq!(path, "/users/7");
        assert_eq!(leftover, vec![("tab".to_string(), "posts".to_string())]);

        assert!(rule.build(&ViewArgs::new()).is_none());
    }

    #[test]
    fn test_build_respects_defaults() {
        let mut defaults = ViewArgs::new();
        defaults.insert("page".into(), ParamValue::Int(1));
        let rule = Rule::new("/list", "list", None).unwrap().with_defaults(defaults);

        let (path, leftover) = rule.build(&ViewArgs::new()).unwrap();
        assert_eq!(path, "/list");
        assert!(leftover.is_empty());

        let mut other = ViewArgs::new();
        other.insert("page".into(), ParamValue::Int(2));
        assert!(rule.build(&other).is_none());
    }

    #[test]
    fn test_convert_rejects_bad_int() {
        let rule = Rule::new("/users/<int:id>", "user", None).unwrap();
        assert!(rule.convert([("p0", "abc")].into_iter()).is_none());
        let args = rule.convert([("p0", "42")].into_iter()).unwrap();
        assert_eq!(args.get("id"), Some(&ParamValue::Int(42)));
    }

    #[test]
    fn test_same_shape_shares_pattern() {
        let by_id = Rule::new("/u/<int:id>/posts/<slug>", "a", None).unwrap();
        let by_name = Rule::new("/u/<name>/posts/<title>", "b", None).unwrap();
        assert_eq!(by_id.match_pattern, "/u/{p0}/posts/{p1}");
        assert_eq!(by_id.match_pattern, by_name.match_pattern);
        assert_eq!(by_id.weights(), vec![50, 100]);

        let args = by_name
            .convert([("p0", "ann"), ("p1", "hello")].into_iter())
            .unwrap();
        assert_eq!(args.keys().collect::<Vec<_>>(), ["name", "title"]);
    }
}
