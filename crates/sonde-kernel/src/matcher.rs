//! Type matchers
//!
//! A matcher selects which loaded types (and which of their functions) a
//! watch registration applies to.

/// Predicate over loaded type and function names.
pub trait TypeMatcher: Send + Sync {
    /// Whether the type as a whole is a candidate.
    fn matches_type(&self, type_name: &str) -> bool;

    /// Whether a specific function of a matched type is a candidate.
    /// Defaults to every function of a matched type.
    fn matches_function(&self, type_name: &str, function: &str) -> bool {
        let _ = (type_name, function);
        true
    }
}

/// Matches every type.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyMatcher;

impl TypeMatcher for AnyMatcher {
    fn matches_type(&self, _type_name: &str) -> bool {
        true
    }
}

/// Matches one type by exact name.
#[derive(Debug, Clone)]
pub struct NameMatcher {
    name: String,
}

impl NameMatcher {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl TypeMatcher for NameMatcher {
    fn matches_type(&self, type_name: &str) -> bool {
        type_name == self.name
    }
}

/// Matches types by name prefix (e.g. a whole namespace).
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    prefix: String,
}

impl PrefixMatcher {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl TypeMatcher for PrefixMatcher {
    fn matches_type(&self, type_name: &str) -> bool {
        type_name.starts_with(&self.prefix)
    }
}

/// Matches types (and optionally functions) against `*` glob patterns.
#[derive(Debug, Clone)]
pub struct WildcardMatcher {
    type_pattern: String,
    function_pattern: Option<String>,
}

impl WildcardMatcher {
    pub fn new(type_pattern: &str) -> Self {
        Self {
            type_pattern: type_pattern.to_string(),
            function_pattern: None,
        }
    }

    /// Restrict matched functions to the given pattern.
    pub fn with_function_pattern(mut self, pattern: &str) -> Self {
        self.function_pattern = Some(pattern.to_string());
        self
    }
}

impl TypeMatcher for WildcardMatcher {
    fn matches_type(&self, type_name: &str) -> bool {
        wildcard_match(&self.type_pattern, type_name)
    }

    fn matches_function(&self, _type_name: &str, function: &str) -> bool {
        match &self.function_pattern {
            Some(pattern) => wildcard_match(pattern, function),
            None => true,
        }
    }
}

/// Match `value` against `pattern`, where `*` matches any run of characters.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], value) || (!value.is_empty() && inner(pattern, &value[1..]))
            }
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("svc::*", "svc::Server"));
        assert!(wildcard_match("*::Server", "svc::Server"));
        assert!(wildcard_match("svc::*::handle", "svc::http::handle"));
        assert!(wildcard_match("exact", "exact"));

        assert!(!wildcard_match("svc::*", "other::Server"));
        assert!(!wildcard_match("exact", "exactly"));
        assert!(!wildcard_match("", "nonempty"));
    }

    #[test]
    fn test_name_and_prefix_matchers() {
        let name = NameMatcher::new("svc::Server");
        assert!(name.matches_type("svc::Server"));
        assert!(!name.matches_type("svc::Client"));
        assert!(name.matches_function("svc::Server", "handle"));

        let prefix = PrefixMatcher::new("svc::");
        assert!(prefix.matches_type("svc::Server"));
        assert!(prefix.matches_type("svc::Client"));
        assert!(!prefix.matches_type("other::Server"));
    }

    #[test]
    fn test_wildcard_matcher_with_function_pattern() {
        let matcher = WildcardMatcher::new("svc::*").with_function_pattern("handle_*");
        assert!(matcher.matches_type("svc::Server"));
        assert!(matcher.matches_function("svc::Server", "handle_request"));
        assert!(!matcher.matches_function("svc::Server", "shutdown"));
    }

    #[test]
    fn test_any_matcher() {
        let matcher = AnyMatcher;
        assert!(matcher.matches_type("whatever"));
        assert!(matcher.matches_function("whatever", "anything"));
    }
}
