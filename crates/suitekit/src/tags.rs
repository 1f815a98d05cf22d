//! `@tag` tokens embedded in suite and test names.
//!
//! A tag is `@` followed by one or more word, hyphen, dot or colon characters.
//! Tags are removed from the display name, so `"login @smoke @auth:basic"`
//! displays as `"login"` and carries the tags `smoke` and `auth:basic`.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static TAG_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([\w\-.:]+)").expect("tag pattern compiles"));

static LEADING_SPACE_AND_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*@[\w\-.:]+").expect("tag pattern compiles"));

/// Split a declared name into its display name and its tags.
///
/// Tags keep first-seen order and are de-duplicated (case-sensitive).
pub fn extract(name: &str) -> (String, Vec<String>) {
    let mut tags = Vec::new();
    for cap in TAG_TOKEN.captures_iter(name) {
        push_unique(&mut tags, &cap[1]);
    }
    (strip(name), tags)
}

/// Remove every tag token from `name` along with the whitespace before it.
///
/// Names without tags come back unchanged.
pub fn strip(name: &str) -> String {
    match LEADING_SPACE_AND_TAG.replace_all(name, "") {
        Cow::Borrowed(untagged) => untagged.to_string(),
        Cow::Owned(stripped) => stripped.trim().to_string(),
    }
}

/// Strip tags from each ` > `-separated segment of a suite path selector.
pub fn strip_path(path: &str) -> String {
    path.split(" > ")
        .map(|segment| strip(segment.trim()))
        .collect::<Vec<_>>()
        .join(" > ")
}

/// Append every tag of `extra` not already present in `into`.
pub fn merge(into: &mut Vec<String>, extra: &[String]) {
    for tag in extra {
        push_unique(into, tag);
    }
}

fn push_unique(tags: &mut Vec<String>, tag: &str) {
    if !tags.iter().any(|t| t == tag) {
        tags.push(tag.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tags_and_strips_name() {
        let (name, tags) = extract("logs in @smoke @auth:basic");
        assert_eq!(name, "logs in");
        assert_eq!(tags, vec!["smoke", "auth:basic"]);
    }

    #[test]
    fn tags_in_the_middle_leave_single_spaces() {
        let (name, tags) = extract("handles @slow.db timeouts");
        assert_eq!(name, "handles timeouts");
        assert_eq!(tags, vec!["slow.db"]);
    }

    #[test]
    fn duplicate_tags_are_dropped_case_sensitively() {
        let (_, tags) = extract("x @a @A @a @b-c");
        assert_eq!(tags, vec!["a", "A", "b-c"]);
    }

    #[test]
    fn untagged_name_is_unchanged() {
        assert_eq!(extract("plain name"), ("plain name".to_string(), vec![]));
    }

    #[test]
    fn untagged_whitespace_is_preserved() {
        assert_eq!(strip("a  b"), "a  b");
        assert_eq!(strip(" padded "), " padded ");
        assert_eq!(strip("@lead  two  spaces"), "two  spaces");
    }

    #[test]
    fn strip_path_handles_each_segment() {
        assert_eq!(strip_path("Auth @api > Login @smoke"), "Auth > Login");
        assert_eq!(strip_path("a->b > x>y @fast"), "a->b > x>y");
        assert_eq!(strip_path("Auth"), "Auth");
    }

    #[test]
    fn merge_preserves_first_seen_order() {
        let mut tags = vec!["a".to_string(), "b".to_string()];
        merge(&mut tags, &["b".to_string(), "c".to_string()]);
        assert_eq!(tags, vec!["a", "b", "c"]);
    }
}
