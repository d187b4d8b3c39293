//! Subscription filters over notification metadata.
//!
//! Filters are written as a [`FilterSpec`] (in the TOML configuration or in an
//! API request) and compiled once into a [`Filter`] whose regular expressions
//! are ready for matching.

use crate::core::Metadata;
use crate::error::EngineError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The serializable form of a filter.
///
/// - every condition in `all` must hold;
/// - when `any` is non-empty, at least one of its conditions must hold;
/// - no condition in `none` may hold.
///
/// An empty spec accepts every notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub none: Vec<Condition>,
}

impl FilterSpec {
    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.any.is_empty() && self.none.is_empty()
    }
}

/// A test against a single metadata key.
///
/// With no operator set the condition only requires the key to be present.
/// When several operators are set they must all hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Condition {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl Condition {
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            equals: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn one_of<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            one_of: Some(values.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn regex(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            regex: Some(pattern.into()),
            ..Default::default()
        }
    }
}

/// A compiled filter, ready to be evaluated against notification metadata.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    spec: FilterSpec,
    all: Vec<CompiledCondition>,
    any: Vec<CompiledCondition>,
    none: Vec<CompiledCondition>,
}

impl Filter {
    /// A filter that accepts every notification on the topic.
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Compiles a spec, validating every regular expression.
    pub fn compile(spec: FilterSpec) -> Result<Self, EngineError> {
        let compile_all = |conditions: &[Condition]| -> Result<Vec<CompiledCondition>, EngineError> {
            conditions.iter().map(CompiledCondition::compile).collect()
        };

        Ok(Self {
            all: compile_all(&spec.all)?,
            any: compile_all(&spec.any)?,
            none: compile_all(&spec.none)?,
            spec,
        })
    }

    /// The spec this filter was compiled from.
    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Evaluates the filter against a notification's metadata.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        if !self.all.iter().all(|c| c.matches(metadata)) {
            return false;
        }
        if !self.any.is_empty() && !self.any.iter().any(|c| c.matches(metadata)) {
            return false;
        }
        !self.none.iter().any(|c| c.matches(metadata))
    }
}

#[derive(Debug, Clone)]
struct CompiledCondition {
    key: String,
    equals: Option<String>,
    one_of: Option<Vec<String>>,
    regex: Option<Regex>,
}

impl CompiledCondition {
    fn compile(condition: &Condition) -> Result<Self, EngineError> {
        if condition.key.is_empty() {
            return Err(EngineError::InvalidFilter(
                "condition key must not be empty".to_string(),
            ));
        }
        let regex = condition
            .regex
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    EngineError::InvalidFilter(format!(
                        "bad regex for key '{}': {}",
                        condition.key, e
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            key: condition.key.clone(),
            equals: condition.equals.clone(),
            one_of: condition.one_of.clone(),
            regex,
        })
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        let Some(value) = metadata.get(&self.key) else {
            return false;
        };
        if let Some(expected) = &self.equals {
            if value != expected {
                return false;
            }
        }
        if let Some(candidates) = &self.one_of {
            if !candidates.iter().any(|c| c == value) {
                return false;
            }
        }
        if let Some(regex) = &self.regex {
            if !regex.is_match(value) {
                return false;
            }
        }
        true
    }
}
