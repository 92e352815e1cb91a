//! Rule model, request matching, and counter key derivation.
//!
//! A [`Rule`] pairs a match predicate over request attributes with one
//! rate-limit algorithm. A [`Config`] is the immutable set of rules and
//! whitelist predicates the engine evaluates against; it is replaced
//! atomically by the [`ConfigLoader`](crate::loader::ConfigLoader) and
//! never mutated in place.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use regex::Regex;

use crate::limit::RateLimitMethod;

/// The attributes of one HTTP request the rule predicates see.
///
/// Purely read-only for the duration of the request. Built by the ingress
/// and egress adapters from their respective request types.
#[derive(Debug, Clone)]
pub struct RequestAttributes {
    /// Path plus query string, e.g. `/api/items?page=2`.
    pub uri: String,
    /// HTTP method, any case.
    pub method: String,
    /// Header name/value pairs; names compared case-insensitively.
    pub headers: Vec<(String, String)>,
}

impl RequestAttributes {
    pub fn new(uri: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: method.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of the named header, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Derives a caller identity from request attributes.
///
/// Must be pure: no suspension, no failure. An empty string means "no
/// identity".
pub type IdentityExtractor = Arc<dyn Fn(&RequestAttributes) -> String + Send + Sync>;

/// A match predicate plus one rate-limit algorithm plus options.
///
/// Immutable after load.
#[derive(Clone)]
pub struct Rule {
    /// Matches anywhere in the request URI; `None` matches every URI.
    pub uri_pattern: Option<Regex>,
    /// Uppercased method names; empty matches every method.
    pub methods: Vec<String>,
    /// Required header name, if any.
    pub header_name: Option<String>,
    /// Required header value; `None` or empty accepts any value.
    pub header_value: Option<String>,
    /// Restrict the rule to one extracted identity.
    pub identity_id: Option<String>,
    /// Identity derivation; required when `identity_id` is set.
    pub identity_extractor: Option<IdentityExtractor>,
    /// The enforcement algorithm.
    pub method: RateLimitMethod,
    /// Wait up to this long instead of rejecting immediately; 0 disables.
    pub max_delay_secs: u64,
}

impl Rule {
    pub fn new(method: RateLimitMethod) -> Self {
        Self {
            uri_pattern: None,
            methods: Vec::new(),
            header_name: None,
            header_value: None,
            identity_id: None,
            identity_extractor: None,
            method,
            max_delay_secs: 0,
        }
    }

    pub fn with_uri_pattern(mut self, pattern: Regex) -> Self {
        self.uri_pattern = Some(pattern);
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.methods = methods
            .into_iter()
            .map(|m| m.as_ref().trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.header_name = Some(name.into());
        self.header_value = value;
        self
    }

    pub fn with_identity_extractor(mut self, extractor: IdentityExtractor) -> Self {
        self.identity_extractor = Some(extractor);
        self
    }

    pub fn with_identity_id(mut self, id: impl Into<String>) -> Self {
        self.identity_id = Some(id.into());
        self
    }

    pub fn with_max_delay_secs(mut self, secs: u64) -> Self {
        self.max_delay_secs = secs;
        self
    }

    /// Whether this rule applies to the request.
    pub fn matches(&self, request: &RequestAttributes) -> bool {
        if let Some(ref pattern) = self.uri_pattern {
            if !pattern.is_match(&request.uri) {
                return false;
            }
        }

        if !self.methods.is_empty() {
            let method = request.method.to_ascii_uppercase();
            if !self.methods.iter().any(|m| *m == method) {
                return false;
            }
        }

        if let Some(ref name) = self.header_name {
            match request.header(name) {
                None => return false,
                Some(value) => {
                    if let Some(ref expected) = self.header_value {
                        if !expected.is_empty() && expected != value {
                            return false;
                        }
                    }
                }
            }
        }

        if let Some(ref identity_id) = self.identity_id {
            if self.extract_identity(request) != *identity_id {
                return false;
            }
        }

        true
    }

    /// The extracted identity, empty when no extractor is configured.
    pub fn extract_identity(&self, request: &RequestAttributes) -> String {
        match self.identity_extractor {
            Some(ref extractor) => extractor(request),
            None => String::new(),
        }
    }

    /// Deterministic hash over the predicate and algorithm parameters.
    ///
    /// Stable across processes so instances sharing a counter store derive
    /// identical keys, and insensitive to the rule's position so editing
    /// unrelated rules does not reset live counters.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.uri_pattern
            .as_ref()
            .map(Regex::as_str)
            .unwrap_or("")
            .hash(&mut hasher);
        self.methods.hash(&mut hasher);
        self.header_name.hash(&mut hasher);
        self.header_value.hash(&mut hasher);
        self.identity_id.hash(&mut hasher);
        self.method.hash(&mut hasher);
        hasher.finish()
    }

    /// Base counter key for this rule and identity. Algorithms append
    /// their own window or bucket suffix.
    pub fn counter_key(&self, unique_name: &str, identity: &str) -> String {
        format!("{}|{:016x}|{}", unique_name, self.stable_hash(), identity)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("uri_pattern", &self.uri_pattern.as_ref().map(Regex::as_str))
            .field("methods", &self.methods)
            .field("header_name", &self.header_name)
            .field("header_value", &self.header_value)
            .field("identity_id", &self.identity_id)
            .field(
                "identity_extractor",
                &self.identity_extractor.as_ref().map(|_| "<fn>"),
            )
            .field("method", &self.method)
            .field("max_delay_secs", &self.max_delay_secs)
            .finish()
    }
}

/// The immutable rule set one engine evaluates against.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Enforced rules, in declaration order.
    pub rules: Vec<Rule>,
    /// Skip predicates; only the predicate part of each entry is used.
    pub whitelist: Vec<Rule>,
    /// Prefix isolating this config's counters in a shared store.
    pub unique_name: String,
}

impl Config {
    /// A request matching any whitelist entry bypasses every rule.
    pub fn is_whitelisted(&self, request: &RequestAttributes) -> bool {
        self.whitelist.iter().any(|entry| entry.matches(request))
    }
}
