//! Equality-based label selectors.

use crate::{Result, StoreError};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
///
/// The string form is `key=value,key,!key`, which is also what [`parse`]
/// accepts.
///
/// [`parse`]: LabelSelector::parse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    pub fn does_not_exist(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::DoesNotExist(key.into()));
        self
    }

    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        labels
            .iter()
            .fold(Self::everything(), |selector, (k, v)| selector.eq(k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut selector = Self::everything();
        for term in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            selector = if let Some(key) = term.strip_prefix('!') {
                selector.does_not_exist(valid_key(key, input)?)
            } else if let Some((key, value)) = term.split_once('=') {
                let value = value.strip_prefix('=').unwrap_or(value);
                selector.eq(valid_key(key, input)?, value.trim())
            } else {
                selector.exists(valid_key(term, input)?)
            };
        }
        Ok(selector)
    }
}

fn valid_key<'a>(key: &'a str, input: &str) -> Result<&'a str> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(StoreError::InvalidObject(format!(
            "invalid label selector {input:?}"
        )));
    }
    Ok(key)
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, requirement) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match requirement {
                Requirement::Equals(k, v) => write!(f, "{k}={v}")?,
                Requirement::Exists(k) => write!(f, "{k}")?,
                Requirement::DoesNotExist(k) => write!(f, "!{k}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_matches_everything() {
        assert!(LabelSelector::everything().matches(&BTreeMap::new()));
        assert!(LabelSelector::everything().matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn test_requirements() {
        let selector = LabelSelector::everything()
            .eq("app", "agent")
            .exists("pool")
            .does_not_exist("claimed");

        assert!(selector.matches(&labels(&[("app", "agent"), ("pool", "p")])));
        assert!(!selector.matches(&labels(&[("app", "other"), ("pool", "p")])));
        assert!(!selector.matches(&labels(&[("app", "agent")])));
        assert!(!selector.matches(&labels(&[
            ("app", "agent"),
            ("pool", "p"),
            ("claimed", "yes")
        ])));
    }

    #[test]
    fn test_parse_and_display() {
        let selector = LabelSelector::parse("app=agent, pool,!claimed").unwrap();
        assert_eq!(selector.to_string(), "app=agent,pool,!claimed");
        assert_eq!(
            LabelSelector::parse("a==b").unwrap(),
            LabelSelector::everything().eq("a", "b")
        );
        assert!(LabelSelector::parse("").unwrap().is_empty());
        assert!(LabelSelector::parse("=b").is_err());
    }
}
