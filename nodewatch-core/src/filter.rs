//! Subscription filters for log records
//!
//! A [`FilterSpec`] is the wire form a client sends; [`LogFilter`] is the
//! validated, compiled form the fan-out engine evaluates for every record.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_FILTER_PATTERNS, MAX_PATTERN_LEN};
use crate::error::FilterError;
use crate::log::{LogLevel, LogRecord};

/// Filter as requested by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Source name patterns. Empty matches every source.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Severity floor, e.g. `"WARN"`. Missing means DEBUG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<String>,
}

impl FilterSpec {
    pub fn new<I, S>(patterns: I, min_level: Option<LogLevel>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            min_level: min_level.map(|level| level.as_str().to_string()),
        }
    }

    /// Filter that accepts every record.
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn compile(&self) -> Result<LogFilter, FilterError> {
        LogFilter::from_spec(self)
    }
}

/// A single source-name pattern.
///
/// `=/talker` matches `/talker` only, `/talker/*` its sub-namespaces and a bare
/// `/talker` any source starting with it.
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// Matches any source that starts with the pattern.
    Prefix(String),
    /// Matches exactly one source name. Written with a leading `=`.
    Exact(String),
    /// `*`/`?` wildcard pattern that must match the whole source name.
    Glob { raw: String, regex: Regex },
}

impl NamePattern {
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FilterError::invalid("patterns", "pattern must not be empty"));
        }
        if trimmed.len() > MAX_PATTERN_LEN {
            return Err(FilterError::invalid(
                "patterns",
                format!("pattern longer than {} characters", MAX_PATTERN_LEN),
            ));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(FilterError::invalid(
                "patterns",
                format!("pattern '{}' contains whitespace", trimmed),
            ));
        }

        if let Some(name) = trimmed.strip_prefix('=') {
            if name.is_empty() || name.contains(['*', '?']) {
                return Err(FilterError::invalid(
                    "patterns",
                    format!("exact pattern '{}' needs a plain source name", trimmed),
                ));
            }
            return Ok(NamePattern::Exact(name.to_string()));
        }

        if !trimmed.contains(['*', '?']) {
            return Ok(NamePattern::Prefix(trimmed.to_string()));
        }

        let mut expr = String::with_capacity(trimmed.len() + 8);
        expr.push('^');
        for c in trimmed.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| {
            FilterError::invalid("patterns", format!("pattern '{}': {}", trimmed, e))
        })?;
        Ok(NamePattern::Glob {
            raw: trimmed.to_string(),
            regex,
        })
    }

    pub fn matches(&self, source: &str) -> bool {
        match self {
            NamePattern::Prefix(prefix) => source.starts_with(prefix.as_str()),
            NamePattern::Exact(name) => source == name,
            NamePattern::Glob { regex, .. } => regex.is_match(source),
        }
    }

    /// Wire form, as accepted by [`NamePattern::parse`].
    pub fn to_wire(&self) -> String {
        match self {
            NamePattern::Prefix(prefix) => prefix.clone(),
            NamePattern::Exact(name) => format!("={}", name),
            NamePattern::Glob { raw, .. } => raw.clone(),
        }
    }

    /// Patterns selecting one node and its sub-namespaces, but not siblings
    /// sharing its name as a prefix.
    pub fn node_scope(node: &str) -> Vec<String> {
        let node = node.trim_end_matches('/');
        vec![format!("={}", node), format!("{}/*", node)]
    }
}

impl PartialEq for NamePattern {
    fn eq(&self, other: &Self) -> bool {
        self.to_wire() == other.to_wire()
    }
}

/// Validated subscription filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogFilter {
    patterns: Vec<NamePattern>,
    min_level: LogLevel,
}

impl LogFilter {
    /// Validate and compile a client filter.
    pub fn from_spec(spec: &FilterSpec) -> Result<Self, FilterError> {
        if spec.patterns.len() > MAX_FILTER_PATTERNS {
            return Err(FilterError::invalid(
                "patterns",
                format!("at most {} patterns allowed", MAX_FILTER_PATTERNS),
            ));
        }

        let patterns = spec
            .patterns
            .iter()
            .map(|raw| NamePattern::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let min_level = match spec.min_level.as_deref() {
            Some(level) => level.parse::<LogLevel>()?,
            None => LogLevel::Debug,
        };

        Ok(Self {
            patterns,
            min_level,
        })
    }

    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn name_matches(&self, source: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(source))
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        record.level >= self.min_level && self.name_matches(&record.source)
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn patterns(&self) -> &[NamePattern] {
        &self.patterns
    }

    /// Convert back into the wire form.
    pub fn to_spec(&self) -> FilterSpec {
        FilterSpec {
            patterns: self.patterns.iter().map(NamePattern::to_wire).collect(),
            min_level: Some(self.min_level.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn record(source: &str, level: LogLevel) -> LogRecord {
        LogRecord::new(Utc::now(), level, source, "msg")
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = LogFilter::match_all();
        assert!(filter.matches(&record("/any/node", LogLevel::Debug)));
        assert!(filter.matches(&record("", LogLevel::Fatal)));
    }

    #[test]
    fn test_prefix_and_level() {
        let filter = FilterSpec::new(["/sensing"], Some(LogLevel::Warn))
            .compile()
            .unwrap();

        assert!(filter.matches(&record("/sensing/lidar", LogLevel::Warn)));
        assert!(filter.matches(&record("/sensing", LogLevel::Error)));
        assert!(!filter.matches(&record("/sensing/lidar", LogLevel::Info)));
        assert!(!filter.matches(&record("/planning", LogLevel::Fatal)));
    }

    #[test]
    fn test_wildcard_patterns() {
        let filter = FilterSpec::new(["/sensing/*/driver", "/ctrl?"], None)
            .compile()
            .unwrap();

        assert!(filter.name_matches("/sensing/lidar/driver"));
        assert!(filter.name_matches("/sensing/a/b/driver"));
        assert!(!filter.name_matches("/sensing/lidar/driver_extra"));
        assert!(filter.name_matches("/ctrl1"));
        assert!(!filter.name_matches("/ctrl12"));
    }

    #[test]
    fn test_node_scope_excludes_siblings() {
        let filter = FilterSpec::new(NamePattern::node_scope("/talker"), None)
            .compile()
            .unwrap();

        assert!(filter.name_matches("/talker"));
        assert!(filter.name_matches("/talker/child"));
        assert!(!filter.name_matches("/talker2"));
        assert!(!filter.name_matches("/talkers/child"));
        assert_eq!(filter.to_spec().patterns, vec!["=/talker", "/talker/*"]);
    }

    #[test]
    fn test_exact_pattern_validation() {
        assert!(FilterSpec::new(["="], None).compile().is_err());
        assert!(FilterSpec::new(["=/a*"], None).compile().is_err());
        assert!(FilterSpec::new(["=/a"], None).compile().unwrap().name_matches("/a"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let filter = FilterSpec::new(["/a.b*"], None).compile().unwrap();
        assert!(filter.name_matches("/a.b/c"));
        assert!(!filter.name_matches("/aXb/c"));
    }

    #[test]
    fn test_invalid_filters_rejected() {
        assert!(FilterSpec::new([""], None).compile().is_err());
        assert!(FilterSpec::new(["/has space"], None).compile().is_err());

        let spec = FilterSpec {
            patterns: vec![],
            min_level: Some("LOUD".to_string()),
        };
        let err = spec.compile().unwrap_err();
        assert!(matches!(err, FilterError::InvalidFilter { ref field, .. } if field == "min_level"));

        let too_many: Vec<String> = (0..=MAX_FILTER_PATTERNS).map(|i| format!("/n{}", i)).collect();
        assert!(FilterSpec::new(too_many, None).compile().is_err());
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: FilterSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec, FilterSpec::match_all());

        let spec: FilterSpec =
            serde_json::from_str(r#"{"patterns":["/a"],"min_level":"error"}"#).unwrap();
        let filter = spec.compile().unwrap();
        assert_eq!(filter.min_level(), LogLevel::Error);
    }

    proptest! {
        #[test]
        fn prop_level_floor_is_respected(level_idx in 0usize..5, floor_idx in 0usize..5) {
            let level = LogLevel::ALL[level_idx];
            let floor = LogLevel::ALL[floor_idx];
            let filter = FilterSpec::new(Vec::<String>::new(), Some(floor)).compile().unwrap();
            prop_assert_eq!(filter.matches(&record("/n", level)), level >= floor);
        }

        #[test]
        fn prop_prefix_pattern_matches_its_extensions(
            prefix in "/[a-z]{1,8}",
            suffix in "[a-z/]{0,8}",
        ) {
            let filter = FilterSpec::new([prefix.clone()], None).compile().unwrap();
            let source = format!("{}{}", prefix, suffix);
            prop_assert!(filter.name_matches(&source));
        }
    }
}
