//! Run configuration.
//!
//! [`RunOptions`] enumerates every recognized option with its default.
//! [`RunOptions::from_json`] validates a dynamic options object eagerly, and
//! [`RunConfig::from_args`] reads the command line and `SUITEKIT_*` variables
//! for harness-less test binaries.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::descriptor::Normalizer;
use crate::error::UsageError;
use crate::filter::{FilterCriteria, OnlySelector, Pattern};
use crate::runner::RunEvent;

/// Default per-test budget in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Receives lifecycle events synchronously, in traversal order.
pub type EventHandler = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// What to attach to failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedErrors {
    /// Capture ambient, framework and domain logs per test.
    pub log_capture: bool,
    /// Most recent entries kept per bucket.
    pub max_logs: usize,
    /// Record the start/end window of the failing test.
    pub timing: bool,
}

impl Default for EnhancedErrors {
    fn default() -> Self {
        EnhancedErrors {
            log_capture: true,
            max_logs: 50,
            timing: true,
        }
    }
}

/// Options for [`crate::runner::run`] / [`crate::Registry::run`].
#[derive(Clone)]
pub struct RunOptions {
    pub criteria: FilterCriteria,
    /// Stop scheduling after the first failure.
    pub bail: bool,
    pub on_event: Option<EventHandler>,
    pub enhanced_errors: Option<EnhancedErrors>,
    pub include_passed: bool,
    pub include_skipped: bool,
    /// Keep stacks and execution context in failure descriptors.
    pub verbose_errors: bool,
    /// Process-wide default budget; `None` runs everything unguarded.
    pub timeout_ms: Option<u64>,
    /// Refuse to run when anything is focused.
    pub fail_on_focus: bool,
    pub normalizer: Normalizer,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            criteria: FilterCriteria::default(),
            bail: false,
            on_event: None,
            enhanced_errors: None,
            include_passed: false,
            include_skipped: false,
            verbose_errors: false,
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            fail_on_focus: false,
            normalizer: Normalizer::default(),
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("criteria", &self.criteria)
            .field("bail", &self.bail)
            .field("on_event", &self.on_event.is_some())
            .field("enhanced_errors", &self.enhanced_errors)
            .field("include_passed", &self.include_passed)
            .field("include_skipped", &self.include_skipped)
            .field("verbose_errors", &self.verbose_errors)
            .field("timeout_ms", &self.timeout_ms)
            .field("fail_on_focus", &self.fail_on_focus)
            .finish()
    }
}

const RUN_EXAMPLE: &str = r#"{"grep": "login", "bail": true}"#;
const LIST_EXAMPLE: &str = r#"{"tags": ["smoke"]}"#;

impl RunOptions {
    pub fn with_criteria(mut self, criteria: FilterCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn on_event(mut self, handler: impl Fn(&RunEvent) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(handler));
        self
    }

    /// Eager checks run before anything executes.
    pub fn validate(&self) -> Result<(), UsageError> {
        self.criteria.validate()?;
        if let Some(enhanced) = &self.enhanced_errors {
            if enhanced.max_logs == 0 {
                return Err(UsageError::InvalidValue {
                    key: "enhancedErrors.maxLogs".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Build options from a JSON options object.
    ///
    /// Function-valued options (`filter`, `onEvent`) cannot be expressed in
    /// JSON; set them on the returned struct instead.
    pub fn from_json(value: &Value) -> Result<Self, UsageError> {
        let object = expect_object("run", RUN_EXAMPLE, value)?;
        let mut options = RunOptions::default();

        for (key, value) in object {
            if parse_criteria_key(key, value, &mut options.criteria)? {
                continue;
            }
            match key.as_str() {
                "bail" => options.bail = expect_bool(key, value)?,
                "includePassed" => options.include_passed = expect_bool(key, value)?,
                "includeSkipped" => options.include_skipped = expect_bool(key, value)?,
                "verboseErrors" => options.verbose_errors = expect_bool(key, value)?,
                "failOnFocus" => options.fail_on_focus = expect_bool(key, value)?,
                "timeout" => {
                    options.timeout_ms = match value {
                        Value::Null => None,
                        other => Some(expect_u64(key, other)?),
                    }
                }
                "enhancedErrors" => options.enhanced_errors = parse_enhanced(value)?,
                "filter" | "onEvent" => {
                    return Err(UsageError::InvalidValue {
                        key: key.clone(),
                        reason: "callbacks can only be set on RunOptions directly".to_string(),
                    })
                }
                _ => {
                    return Err(UsageError::UnknownOption {
                        entry: "run",
                        key: key.clone(),
                    })
                }
            }
        }

        options.validate()?;
        Ok(options)
    }
}

impl FilterCriteria {
    /// Build listing criteria from a JSON options object.
    pub fn from_json(value: &Value) -> Result<Self, UsageError> {
        let object = expect_object("list", LIST_EXAMPLE, value)?;
        let mut criteria = FilterCriteria::default();
        for (key, value) in object {
            if !parse_criteria_key(key, value, &mut criteria)? {
                return Err(UsageError::UnknownOption {
                    entry: "list",
                    key: key.clone(),
                });
            }
        }
        criteria.validate()?;
        Ok(criteria)
    }
}

/// Handle a key shared by run and list options; `false` if not recognized.
fn parse_criteria_key(
    key: &str,
    value: &Value,
    criteria: &mut FilterCriteria,
) -> Result<bool, UsageError> {
    match key {
        "only" => criteria.only = Some(parse_only(value)?),
        "grep" => criteria.grep = Some(parse_pattern(key, value)?),
        "grepInvert" => criteria.grep_invert = Some(parse_pattern(key, value)?),
        "tags" => criteria.tags = expect_strings(key, value)?,
        "excludeTags" => criteria.exclude_tags = expect_strings(key, value)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn parse_only(value: &Value) -> Result<OnlySelector, UsageError> {
    let object = match value {
        Value::Object(map) => map,
        other => return Err(invalid_type("only", "an object", other)),
    };
    let mut only = OnlySelector::default();
    for (key, value) in object {
        let path = format!("only.{key}");
        match key.as_str() {
            "suite" | "suites" => only.suites.extend(expect_strings(&path, value)?),
            "test" | "tests" => only.tests.extend(expect_strings(&path, value)?),
            _ => {
                return Err(UsageError::UnknownOption {
                    entry: "only",
                    key: key.clone(),
                })
            }
        }
    }
    Ok(only)
}

/// `"/re/"` is a regular expression; any other string a literal substring.
fn parse_pattern(key: &str, value: &Value) -> Result<Pattern, UsageError> {
    let text = match value {
        Value::String(s) => s,
        other => return Err(invalid_type(key, "a string", other)),
    };
    match text.strip_prefix('/').and_then(|t| t.strip_suffix('/')) {
        Some(source) if text.len() > 1 => {
            Pattern::regex(source).map_err(|source| UsageError::InvalidPattern {
                key: key.to_string(),
                source,
            })
        }
        _ => Ok(Pattern::literal(text.clone())),
    }
}

fn parse_enhanced(value: &Value) -> Result<Option<EnhancedErrors>, UsageError> {
    let object = match value {
        Value::Null => return Ok(None),
        Value::Bool(false) => return Ok(None),
        Value::Bool(true) => return Ok(Some(EnhancedErrors::default())),
        Value::Object(map) => map,
        other => return Err(invalid_type("enhancedErrors", "an object or boolean", other)),
    };
    let mut enhanced = EnhancedErrors::default();
    for (key, value) in object {
        let path = format!("enhancedErrors.{key}");
        match key.as_str() {
            "logCapture" => enhanced.log_capture = expect_bool(&path, value)?,
            "timing" => enhanced.timing = expect_bool(&path, value)?,
            "maxLogs" => {
                enhanced.max_logs = usize::try_from(expect_u64(&path, value)?).map_err(|_| {
                    UsageError::InvalidValue {
                        key: path.clone(),
                        reason: "too large".to_string(),
                    }
                })?
            }
            _ => {
                return Err(UsageError::UnknownOption {
                    entry: "enhancedErrors",
                    key: key.clone(),
                })
            }
        }
    }
    Ok(Some(enhanced))
}

fn expect_object<'a>(
    entry: &'static str,
    example: &'static str,
    value: &'a Value,
) -> Result<&'a Map<String, Value>, UsageError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(UsageError::NotAnObject {
            entry,
            received: json_type(other),
            example,
        }),
    }
}

fn expect_bool(key: &str, value: &Value) -> Result<bool, UsageError> {
    value.as_bool().ok_or_else(|| invalid_type(key, "a boolean", value))
}

fn expect_u64(key: &str, value: &Value) -> Result<u64, UsageError> {
    value
        .as_u64()
        .ok_or_else(|| invalid_type(key, "a non-negative integer", value))
}

/// A string or a list of strings.
fn expect_strings(key: &str, value: &Value) -> Result<Vec<String>, UsageError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid_type(key, "a string or list of strings", item))
            })
            .collect(),
        other => Err(invalid_type(key, "a string or list of strings", other)),
    }
}

fn invalid_type(key: &str, expected: &'static str, received: &Value) -> UsageError {
    UsageError::InvalidType {
        key: key.to_string(),
        expected,
        received: json_type(received),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// RunConfig: command line and environment
// ============================================================================

/// Configuration for a harness-less test binary.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub options: RunOptions,
    /// Only list tests, don't run them.
    pub list: bool,
}

impl RunConfig {
    /// Parse the process args (compatible with `cargo test -- <args>`) and
    /// `SUITEKIT_*` environment variables.
    pub fn from_args() -> Result<Self, UsageError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self::parse(&args, env)
    }

    fn parse(
        args: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, UsageError> {
        let mut config = RunConfig::default();
        let options = &mut config.options;

        if let Some(tags) = env("SUITEKIT_TAGS") {
            options.criteria.tags = split_list(&tags);
        }
        if let Some(tags) = env("SUITEKIT_EXCLUDE_TAGS") {
            options.criteria.exclude_tags = split_list(&tags);
        }
        if let Some(ms) = env("SUITEKIT_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| UsageError::InvalidValue {
                key: "SUITEKIT_TIMEOUT_MS".to_string(),
                reason: format!("`{ms}` is not a number of milliseconds"),
            })?;
            options.timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(val) = env("SUITEKIT_FAIL_ON_FOCUS") {
            options.fail_on_focus = val == "1" || val.eq_ignore_ascii_case("true");
        }

        let mut args = args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--list" => config.list = true,
                "--bail" => options.bail = true,
                "--verbose-errors" => options.verbose_errors = true,
                "--enhanced-errors" => options.enhanced_errors = Some(EnhancedErrors::default()),
                "--tags" | "--exclude-tags" => {
                    let value = args.next().ok_or_else(|| UsageError::InvalidValue {
                        key: arg.clone(),
                        reason: "expects a comma-separated list".to_string(),
                    })?;
                    if arg == "--tags" {
                        options.criteria.tags = split_list(value);
                    } else {
                        options.criteria.exclude_tags = split_list(value);
                    }
                }
                other if !other.starts_with('-') => {
                    options.criteria.grep = Some(Pattern::literal(other));
                }
                _ => {} // ignore unknown flags
            }
        }

        config.options.validate()?;
        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_objects_with_received_type() {
        for (value, name) in [
            (json!(null), "null"),
            (json!([1]), "array"),
            (json!("grep"), "string"),
            (json!(3), "number"),
            (json!(true), "boolean"),
        ] {
            match RunOptions::from_json(&value) {
                Err(UsageError::NotAnObject { received, entry, .. }) => {
                    assert_eq!(received, name);
                    assert_eq!(entry, "run");
                }
                other => panic!("expected NotAnObject, got {other:?}"),
            }
        }
        let err = FilterCriteria::from_json(&json!(null)).unwrap_err();
        assert!(err.to_string().contains("list({\"tags\": [\"smoke\"]})"));
    }

    #[test]
    fn parses_every_option() {
        let options = RunOptions::from_json(&json!({
            "only": { "suite": "A > B", "tests": ["t1", "t2"] },
            "grep": "/^A/",
            "grepInvert": "slow",
            "tags": "smoke",
            "excludeTags": ["flaky"],
            "bail": true,
            "enhancedErrors": { "logCapture": false, "maxLogs": 5 },
            "includePassed": true,
            "includeSkipped": true,
            "verboseErrors": true,
            "timeout": 250,
            "failOnFocus": true
        }))
        .unwrap();

        let only = options.criteria.only.as_ref().unwrap();
        assert_eq!(only.suites, vec!["A > B"]);
        assert_eq!(only.tests, vec!["t1", "t2"]);
        assert!(matches!(options.criteria.grep, Some(Pattern::Regex(_))));
        assert!(matches!(options.criteria.grep_invert, Some(Pattern::Literal(_))));
        assert_eq!(options.criteria.tags, vec!["smoke"]);
        assert_eq!(options.criteria.exclude_tags, vec!["flaky"]);
        assert!(options.bail && options.include_passed && options.include_skipped);
        assert!(options.verbose_errors && options.fail_on_focus);
        assert_eq!(
            options.enhanced_errors,
            Some(EnhancedErrors {
                log_capture: false,
                max_logs: 5,
                timing: true
            })
        );
        assert_eq!(options.timeout_ms, Some(250));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_types() {
        assert!(matches!(
            RunOptions::from_json(&json!({ "bial": true })),
            Err(UsageError::UnknownOption { .. })
        ));
        assert!(matches!(
            RunOptions::from_json(&json!({ "bail": "yes" })),
            Err(UsageError::InvalidType { received: "string", .. })
        ));
        assert!(matches!(
            RunOptions::from_json(&json!({ "grep": "/(/" })),
            Err(UsageError::InvalidPattern { .. })
        ));
        assert!(matches!(
            RunOptions::from_json(&json!({ "filter": "x" })),
            Err(UsageError::InvalidValue { .. })
        ));
        assert!(matches!(
            RunOptions::from_json(&json!({ "enhancedErrors": { "maxLogs": 0 } })),
            Err(UsageError::InvalidValue { .. })
        ));
        assert!(matches!(
            FilterCriteria::from_json(&json!({ "bail": true })),
            Err(UsageError::UnknownOption { entry: "list", .. })
        ));
    }

    #[test]
    fn empty_object_gives_defaults() {
        let options = RunOptions::from_json(&json!({})).unwrap();
        assert_eq!(options.timeout_ms, Some(DEFAULT_TIMEOUT_MS));
        assert!(!options.bail);
        assert!(options.enhanced_errors.is_none());
    }

    #[test]
    fn parses_args_and_env() {
        let args: Vec<String> = ["--list", "--bail", "login", "--tags", "smoke, api", "--unknown"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let env = |name: &str| match name {
            "SUITEKIT_EXCLUDE_TAGS" => Some("flaky".to_string()),
            "SUITEKIT_TIMEOUT_MS" => Some("0".to_string()),
            "SUITEKIT_FAIL_ON_FOCUS" => Some("TRUE".to_string()),
            _ => None,
        };
        let config = RunConfig::parse(&args, env).unwrap();
        assert!(config.list);
        assert!(config.options.bail);
        assert!(matches!(&config.options.criteria.grep, Some(Pattern::Literal(s)) if s == "login"));
        assert_eq!(config.options.criteria.tags, vec!["smoke", "api"]);
        assert_eq!(config.options.criteria.exclude_tags, vec!["flaky"]);
        assert_eq!(config.options.timeout_ms, None);
        assert!(config.options.fail_on_focus);
    }

    #[test]
    fn bad_timeout_env_is_a_usage_error() {
        let env = |name: &str| (name == "SUITEKIT_TIMEOUT_MS").then(|| "soon".to_string());
        assert!(RunConfig::parse(&[], env).is_err());
        assert!(RunConfig::parse(&["--tags".to_string()], |_| None).is_err());
    }
}
