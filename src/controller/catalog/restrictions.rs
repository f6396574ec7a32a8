//! # Catalog Restrictions
//!
//! Label-selector style predicates that decide which catalog entries are materialized.
//!
//! A predicate is a comma-separated list of requirements, all of which must hold:
//!
//! - `key=value`, `key==value`, `key!=value`
//! - `key in (a,b)`, `key notin (a,b)`
//!
//! Every predicate in a list must match. A key missing from an entry's properties
//! fails `=` and `in` and satisfies `!=` and `notin`.

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;
use thiserror::Error;

/// Class property keys
pub const KEY_NAME: &str = "name";
pub const KEY_EXTERNAL_NAME: &str = "spec.externalName";
pub const KEY_EXTERNAL_ID: &str = "spec.externalID";
/// Plan-only property keys
pub const KEY_FREE: &str = "spec.free";
pub const KEY_SERVICE_CLASS_NAME: &str = "spec.serviceClass.name";

const CLASS_KEYS: &[&str] = &[KEY_NAME, KEY_EXTERNAL_NAME, KEY_EXTERNAL_ID];
const PLAN_KEYS: &[&str] = &[
    KEY_NAME,
    KEY_EXTERNAL_NAME,
    KEY_EXTERNAL_ID,
    KEY_FREE,
    KEY_SERVICE_CLASS_NAME,
];

static EQUALITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<key>[A-Za-z0-9_./-]+)\s*(?P<op>==|!=|=)\s*(?P<value>[A-Za-z0-9_./-]*)\s*$")
        .expect("static regex is valid")
});

static SET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<key>[A-Za-z0-9_./-]+)\s+(?P<op>in|notin)\s*\((?P<values>[^()]*)\)\s*$")
        .expect("static regex is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RestrictionError {
    #[error("invalid catalog restriction {predicate:?}: cannot parse {requirement:?}")]
    Syntax {
        predicate: String,
        requirement: String,
    },
    #[error("invalid catalog restriction {predicate:?}: unsupported key {key:?}")]
    UnsupportedKey { predicate: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operator {
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    operator: Operator,
}

impl Requirement {
    fn matches(&self, properties: &HashMap<&str, String>) -> bool {
        let value = properties.get(self.key.as_str());
        match (&self.operator, value) {
            (Operator::Equals(expected), Some(actual)) => expected == actual,
            (Operator::NotEquals(expected), Some(actual)) => expected != actual,
            (Operator::In(set), Some(actual)) => set.contains(actual),
            (Operator::NotIn(set), Some(actual)) => !set.contains(actual),
            (Operator::Equals(_) | Operator::In(_), None) => false,
            (Operator::NotEquals(_) | Operator::NotIn(_), None) => true,
        }
    }
}

/// Parsed predicates for one entry kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Restriction {
    requirements: Vec<Requirement>,
}

impl Restriction {
    /// Parse class predicates
    ///
    /// # Errors
    ///
    /// Fails on unparsable requirements and keys classes do not expose.
    pub fn for_classes(predicates: &[String]) -> Result<Self, RestrictionError> {
        Self::parse(predicates, CLASS_KEYS)
    }

    /// Parse plan predicates
    ///
    /// # Errors
    ///
    /// Fails on unparsable requirements and keys plans do not expose.
    pub fn for_plans(predicates: &[String]) -> Result<Self, RestrictionError> {
        Self::parse(predicates, PLAN_KEYS)
    }

    fn parse(predicates: &[String], allowed_keys: &[&str]) -> Result<Self, RestrictionError> {
        let mut requirements = Vec::new();
        for predicate in predicates {
            for raw in split_requirements(predicate) {
                if raw.trim().is_empty() {
                    continue;
                }
                let requirement = parse_requirement(raw).ok_or_else(|| RestrictionError::Syntax {
                    predicate: predicate.clone(),
                    requirement: raw.trim().to_string(),
                })?;
                if !allowed_keys.contains(&requirement.key.as_str()) {
                    return Err(RestrictionError::UnsupportedKey {
                        predicate: predicate.clone(),
                        key: requirement.key,
                    });
                }
                requirements.push(requirement);
            }
        }
        Ok(Self { requirements })
    }

    /// Whether an entry with these properties passes every requirement
    #[must_use]
    pub fn matches(&self, properties: &HashMap<&str, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(properties))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// Split on commas outside parentheses
fn split_requirements(predicate: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut start = 0;
    for (index, c) in predicate.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&predicate[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&predicate[start..]);
    parts
}

fn parse_requirement(raw: &str) -> Option<Requirement> {
    if let Some(captures) = SET_REGEX.captures(raw) {
        let key = captures.name("key")?.as_str().to_string();
        let values: BTreeSet<String> = captures
            .name("values")?
            .as_str()
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        let operator = match captures.name("op")?.as_str() {
            "in" => Operator::In(values),
            _ => Operator::NotIn(values),
        };
        return Some(Requirement { key, operator });
    }

    let captures = EQUALITY_REGEX.captures(raw)?;
    let key = captures.name("key")?.as_str().to_string();
    let value = captures.name("value")?.as_str().to_string();
    let operator = match captures.name("op")?.as_str() {
        "!=" => Operator::NotEquals(value),
        _ => Operator::Equals(value),
    };
    Some(Requirement { key, operator })
}
