//! Project objects and naming
//!
//! Project names are DNS labels: 1-63 characters of `[a-z0-9-]`, starting and
//! ending with an alphanumeric character.

mod selector;

pub use selector::{FieldSelector, LabelSelector, Requirement, SelectorError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("project name cannot be empty")]
    Empty,

    #[error("project name '{0}' is longer than 63 characters")]
    TooLong(String),

    #[error("invalid project name '{0}': must match [a-z0-9]([-a-z0-9]*[a-z0-9])?")]
    InvalidCharacters(String),
}

/// Validate a project name
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(name.to_string()));
    }

    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    let edge = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());

    if !name.chars().all(valid_char) || !edge(name.chars().next()) || !edge(name.chars().last()) {
        return Err(NameError::InvalidCharacters(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectPhase {
    #[default]
    Active,
    Terminating,
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectPhase::Active => write!(f, "Active"),
            ProjectPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// A project as held by the project store
///
/// Only `name` and `revision` mean anything to the visibility cache; the rest
/// is carried through to callers untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    /// Assigned by the project store, increases on every write
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: ProjectPhase,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: 0,
            display_name: None,
            description: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            phase: ProjectPhase::Active,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn validate(&self) -> Result<(), NameError> {
        validate_name(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_valid() {
        assert!(validate_name("web").is_ok());
        assert!(validate_name("team-a-prod").is_ok());
        assert!(validate_name("a1").is_ok());
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_validate_name_invalid() {
        assert_eq!(validate_name(""), Err(NameError::Empty));
        assert!(matches!(validate_name(&"a".repeat(64)), Err(NameError::TooLong(_))));
        assert!(validate_name("-web").is_err());
        assert!(validate_name("web-").is_err());
        assert!(validate_name("Web").is_err());
        assert!(validate_name("web.prod").is_err());
        assert!(validate_name("web_prod").is_err());
    }

    #[test]
    fn test_project_json_shape() {
        let project = Project::new("web")
            .with_label("team", "a")
            .with_annotation("openshift.io/requester", "alice")
            .with_revision(7);
        let json = serde_json::to_value(&project).unwrap();
        assert_eq!(json["name"], "web");
        assert_eq!(json["revision"], 7);
        assert_eq!(json["labels"]["team"], "a");
        assert_eq!(json["phase"], "Active");
        assert!(json.get("displayName").is_none());
    }
}
