use std::collections::HashSet;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    pub(crate) static ref PLACEHOLDER_MATCH_RE: Regex = Regex::new(r"\{\[.*?\]\}").unwrap();
}

#[inline]
pub(crate) fn strip_format(key: &str) -> &str {
    //! Strips "{\[" and "\]}" for a string, which is algorithmically unsafe.
    //! Ensure the string is properly formatted like "{\[a\]}".
    &key[2..key.len() - 2]
}

/// A template cut at its placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitTemplate {
    /// Literal spans, one more than there are placeholders.
    pub literals: Vec<String>,
    /// Placeholder names in order of appearance.
    pub placeholders: Vec<String>,
}

/// Cut a template like `"name: {[name]}, age: {[age]}"` into literal spans and placeholder names.
pub fn split_template(template: &str) -> SplitTemplate {
    let mut literals = Vec::new();
    let mut placeholders = Vec::new();
    let mut last = 0;
    for placeholder in PLACEHOLDER_MATCH_RE.find_iter(template) {
        literals.push(template[last..placeholder.start()].to_string());
        placeholders.push(strip_format(placeholder.as_str()).to_string());
        last = placeholder.end();
    }
    literals.push(template[last..].to_string());
    SplitTemplate {
        literals,
        placeholders,
    }
}

pub fn get_placeholders(string: &str) -> HashSet<String> {
    PLACEHOLDER_MATCH_RE.find_iter(string)
        .map(|placeholder| strip_format(placeholder.as_str()).to_string())
        .collect()
}

#[cfg(test)]
mod string_tests {
    use std::collections::HashSet;
    use super::{get_placeholders, split_template};

    #[test]
    fn test_get_keys() {
        let string = "{[a]}";
        let keys = get_placeholders(string);
        let expect_keys = HashSet::from(["a".to_string()]);
        assert_eq!(expect_keys, keys);

        let string = "{[a\n]}";
        let keys = get_placeholders(string);
        assert_eq!(0, keys.len());

        let string = "{[a]}    {[b]}";
        let keys = get_placeholders(string);
        let expect_keys = HashSet::from(["a".to_string(), "b".to_string()]);
        assert_eq!(expect_keys, keys);
    }

    #[test]
    fn test_split() {
        let split = split_template("The quick {[color]} {[animal]} jumped.");
        assert_eq!(vec!["The quick ", " ", " jumped."], split.literals);
        assert_eq!(vec!["color", "animal"], split.placeholders);

        let split = split_template("{[a]}{[a]}");
        assert_eq!(vec!["", "", ""], split.literals);
        assert_eq!(vec!["a", "a"], split.placeholders);

        let split = split_template("no placeholder");
        assert_eq!(vec!["no placeholder"], split.literals);
        assert!(split.placeholders.is_empty());
    }
}
