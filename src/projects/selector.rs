//! Label and field selectors for list/watch filtering
//!
//! Label selectors are comma-separated requirements:
//! - `key=value` / `key==value`: label present with that value
//! - `key!=value`: label absent or with another value
//! - `key`: label present
//! - `!key`: label absent
//!
//! Field selectors accept `metadata.name` and `status.phase` with `=`, `==`
//! and `!=`.

use crate::projects::Project;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty requirement in selector")]
    EmptyRequirement,

    #[error("invalid label key '{0}'")]
    InvalidKey(String),

    #[error("unsupported field '{0}': expected metadata.name or status.phase")]
    UnsupportedField(String),

    #[error("field requirement '{0}' needs an operator")]
    MissingOperator(String),
}

/// One label requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn split_operator(req: &str) -> Option<(&str, bool, &str)> {
    if let Some((k, v)) = req.split_once("!=") {
        return Some((k.trim(), false, v.trim()));
    }
    if let Some((k, v)) = req.split_once("==") {
        return Some((k.trim(), true, v.trim()));
    }
    req.split_once('=').map(|(k, v)| (k.trim(), true, v.trim()))
}

/// A conjunction of label requirements; the empty selector matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Ok(Self::everything());
        }

        let mut requirements = Vec::new();
        for part in selector.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(SelectorError::EmptyRequirement);
            }

            let requirement = match split_operator(part) {
                Some((key, equals, value)) => {
                    if !is_valid_key(key) {
                        return Err(SelectorError::InvalidKey(key.to_string()));
                    }
                    if equals {
                        Requirement::Equals(key.to_string(), value.to_string())
                    } else {
                        Requirement::NotEquals(key.to_string(), value.to_string())
                    }
                }
                None => match part.strip_prefix('!') {
                    Some(key) if is_valid_key(key.trim()) => Requirement::NotExists(key.trim().to_string()),
                    Some(key) => return Err(SelectorError::InvalidKey(key.to_string())),
                    None if is_valid_key(part) => Requirement::Exists(part.to_string()),
                    None => return Err(SelectorError::InvalidKey(part.to_string())),
                },
            };
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, project: &Project) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => project.labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => project.labels.get(k) != Some(v),
            Requirement::Exists(k) => project.labels.contains_key(k),
            Requirement::NotExists(k) => !project.labels.contains_key(k),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Name,
    Phase,
}

/// A conjunction of field requirements over name and phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<(Field, bool, String)>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Ok(Self::everything());
        }

        let mut requirements = Vec::new();
        for part in selector.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(SelectorError::EmptyRequirement);
            }
            let (key, equals, value) =
                split_operator(part).ok_or_else(|| SelectorError::MissingOperator(part.to_string()))?;
            let field = match key {
                "metadata.name" | "name" => Field::Name,
                "status.phase" => Field::Phase,
                other => return Err(SelectorError::UnsupportedField(other.to_string())),
            };
            requirements.push((field, equals, value.to_string()));
        }

        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, project: &Project) -> bool {
        self.requirements.iter().all(|(field, equals, value)| {
            let actual = match field {
                Field::Name => project.name.clone(),
                Field::Phase => project.phase.to_string(),
            };
            (actual == *value) == *equals
        })
    }
}
