//! Which tests a run or a listing covers.
//!
//! [`accepts`] is the single decision both [`list`] and the runner use, so a
//! listing always names exactly the tests a run would report.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::error::UsageError;
use crate::registry::Registry;
use crate::tags;

/// Custom predicate over `(suite path, test name)`.
pub type Predicate = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// A name pattern: plain substring or regular expression.
#[derive(Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    pub fn regex(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source).map(Pattern::Regex)
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::Literal(text) => haystack.contains(text.as_str()),
            Pattern::Regex(re) => re.is_match(haystack),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(text) => write!(f, "{text:?}"),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Focus on suites and/or tests by name.
///
/// A suite selector matches a suite by its own name or its full path, plus
/// everything nested below that path. A test selector matches the test name
/// exactly. Embedded `@tag` tokens are
/// ignored, so tagged display names can be pasted verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlySelector {
    pub suites: Vec<String>,
    pub tests: Vec<String>,
}

impl OnlySelector {
    pub fn suite(path: impl Into<String>) -> Self {
        OnlySelector {
            suites: vec![path.into()],
            tests: Vec::new(),
        }
    }

    pub fn test(name: impl Into<String>) -> Self {
        OnlySelector {
            suites: Vec::new(),
            tests: vec![name.into()],
        }
    }

    fn matches(&self, suite_path: &str, test_name: &str) -> bool {
        let suite_ok = self.suites.is_empty()
            || self.suites.iter().any(|s| {
                let raw = s.trim();
                suite_selected(suite_path, raw) || suite_selected(suite_path, &tags::strip_path(raw))
            });
        let test_ok = self.tests.is_empty() || self.tests.iter().any(|t| tags::strip(t) == test_name);
        suite_ok && test_ok
    }
}

/// The suite's own name, its full path, or any ancestor path.
fn suite_selected(suite_path: &str, selector: &str) -> bool {
    let own_name = suite_path.rsplit(" > ").next().unwrap_or(suite_path);
    own_name == selector || suite_path == selector || suite_path.starts_with(&format!("{selector} > "))
}

/// Selectors narrowing a run or a listing. All fields are optional.
#[derive(Clone, Default)]
pub struct FilterCriteria {
    pub filter: Option<Predicate>,
    pub only: Option<OnlySelector>,
    pub grep: Option<Pattern>,
    pub grep_invert: Option<Pattern>,
    /// Accept tests carrying at least one of these tags.
    pub tags: Vec<String>,
    /// Reject tests carrying any of these tags.
    pub exclude_tags: Vec<String>,
}

impl fmt::Debug for FilterCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCriteria")
            .field("filter", &self.filter.is_some())
            .field("only", &self.only)
            .field("grep", &self.grep)
            .field("grep_invert", &self.grep_invert)
            .field("tags", &self.tags)
            .field("exclude_tags", &self.exclude_tags)
            .finish()
    }
}

impl FilterCriteria {
    /// Reject malformed selectors before anything runs.
    pub fn validate(&self) -> Result<(), UsageError> {
        for (key, list) in [("tags", &self.tags), ("excludeTags", &self.exclude_tags)] {
            if list.iter().any(|t| bare_tag(t).is_empty()) {
                return Err(UsageError::InvalidValue {
                    key: key.to_string(),
                    reason: "tag names must not be empty".to_string(),
                });
            }
        }
        if let Some(only) = &self.only {
            if only.suites.iter().chain(&only.tests).any(|s| tags::strip(s).trim().is_empty()) {
                return Err(UsageError::InvalidValue {
                    key: "only".to_string(),
                    reason: "selectors must name a suite or test".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn bare_tag(tag: &str) -> &str {
    tag.trim().trim_start_matches('@')
}

/// `"<suitePath> > <testName>"`, or just the test name at the root.
pub fn full_name(suite_path: &str, test_name: &str) -> String {
    if suite_path.is_empty() {
        test_name.to_string()
    } else {
        format!("{suite_path} > {test_name}")
    }
}

/// Whether a test is covered by `criteria`.
///
/// Checks run in order and stop at the first rejection: custom predicate,
/// only-selector, include pattern, exclude pattern, tag include, tag exclude.
pub fn accepts(suite_path: &str, test_name: &str, test_tags: &[String], criteria: &FilterCriteria) -> bool {
    if let Some(predicate) = &criteria.filter {
        if !predicate(suite_path, test_name) {
            return false;
        }
    }
    if let Some(only) = &criteria.only {
        if !only.matches(suite_path, test_name) {
            return false;
        }
    }

    let full = full_name(suite_path, test_name);
    if let Some(grep) = &criteria.grep {
        if !grep.is_match(&full) {
            return false;
        }
    }
    if let Some(invert) = &criteria.grep_invert {
        if invert.is_match(&full) {
            return false;
        }
    }

    let has = |wanted: &String| test_tags.iter().any(|t| t == bare_tag(wanted));
    if !criteria.tags.is_empty() && !criteria.tags.iter().any(has) {
        return false;
    }
    !criteria.exclude_tags.iter().any(has)
}

/// One line of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedTest {
    pub suite: String,
    pub test: String,
    pub tags: Vec<String>,
}

/// Every test `criteria` covers, in execution order.
pub fn list(registry: &Registry, criteria: &FilterCriteria) -> Result<Vec<ListedTest>, UsageError> {
    criteria.validate()?;
    let listed = registry
        .tests_in_order()
        .into_iter()
        .filter_map(|id| {
            let test = registry.unit(id);
            let suite = registry.suite_path(test.suite);
            let tags = registry.test_tags(id);
            accepts(&suite, &test.name, &tags, criteria).then(|| ListedTest {
                suite,
                test: test.name.clone(),
                tags,
            })
        })
        .collect();
    Ok(listed)
}

impl Registry {
    /// See [`list`].
    pub fn list(&self, criteria: &FilterCriteria) -> Result<Vec<ListedTest>, UsageError> {
        list(self, criteria)
    }
}
