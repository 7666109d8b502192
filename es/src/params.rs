//! Task parameters and schedule matching

use std::collections::BTreeMap;

/// Template parameters of a task: string keys, nullable string values
pub type Parameters = BTreeMap<String, Option<String>>;

/// Whether `parameters` contains every pair in `predicate`
///
/// Containment semantics: each predicate key must be present with an equal
/// value, and a null value only matches a null value. An empty predicate
/// matches every task.
pub fn matches(predicate: &Parameters, parameters: &Parameters) -> bool {
    predicate
        .iter()
        .all(|(key, value)| parameters.get(key).is_some_and(|candidate| candidate == value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Option<&str>)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_empty_predicate_matches_everything() {
        let task = params(&[("taskType", Some("img"))]);
        assert!(matches(&Parameters::new(), &task));
        assert!(matches(&Parameters::new(), &Parameters::new()));
    }

    #[test]
    fn test_subset_matches() {
        let task = params(&[("taskType", Some("img")), ("url", Some("http://a.example/x.png"))]);
        assert!(matches(&params(&[("taskType", Some("img"))]), &task));
        assert!(!matches(&params(&[("taskType", Some("css"))]), &task));
    }

    #[test]
    fn test_missing_key_does_not_match() {
        let task = params(&[("taskType", Some("img"))]);
        assert!(!matches(&params(&[("url", Some("http://a.example/"))]), &task));
    }

    #[test]
    fn test_null_matches_only_null() {
        let task = params(&[("taskType", Some("img")), ("group", None)]);
        assert!(matches(&params(&[("group", None)]), &task));
        assert!(!matches(&params(&[("taskType", None)]), &task));
        assert!(!matches(&params(&[("absent", None)]), &task));
    }
}
