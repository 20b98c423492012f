//! Access grants

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrantError {
    #[error("invalid grant subject '{0}': expected 'user:<name>' or 'group:<name>'")]
    InvalidSubject(String),

    #[error("invalid grant target '{0}': expected 'project:<name>' or 'cluster'")]
    InvalidTarget(String),

    #[error("permission tag cannot be empty")]
    EmptyPermission,
}

/// Who a grant is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GrantSubject {
    User(String),
    Group(String),
}

impl GrantSubject {
    /// Parse from `user:<name>` or `group:<name>`
    pub fn parse(s: &str) -> Result<Self, GrantError> {
        match s.split_once(':') {
            Some(("user", name)) if !name.is_empty() => Ok(GrantSubject::User(name.to_string())),
            Some(("group", name)) if !name.is_empty() => Ok(GrantSubject::Group(name.to_string())),
            _ => Err(GrantError::InvalidSubject(s.to_string())),
        }
    }
}

impl fmt::Display for GrantSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantSubject::User(name) => write!(f, "user:{}", name),
            GrantSubject::Group(name) => write!(f, "group:{}", name),
        }
    }
}

/// What a grant makes visible
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GrantTarget {
    /// A single project, which may not exist yet
    Project(String),
    /// Every project, including ones created later
    Cluster,
}

impl GrantTarget {
    /// Parse from `project:<name>` or `cluster`
    pub fn parse(s: &str) -> Result<Self, GrantError> {
        if s == "cluster" {
            return Ok(GrantTarget::Cluster);
        }
        match s.split_once(':') {
            Some(("project", name)) if !name.is_empty() => Ok(GrantTarget::Project(name.to_string())),
            _ => Err(GrantError::InvalidTarget(s.to_string())),
        }
    }
}

impl fmt::Display for GrantTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantTarget::Project(name) => write!(f, "project:{}", name),
            GrantTarget::Cluster => write!(f, "cluster"),
        }
    }
}

/// A single grant: subject + target + permission tag
///
/// Two grants that differ only in permission are distinct, and each keeps the
/// target visible on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grant {
    #[serde(with = "subject_serde")]
    pub subject: GrantSubject,
    #[serde(with = "target_serde")]
    pub target: GrantTarget,
    pub permission: String,
}

impl Grant {
    pub fn new(subject: GrantSubject, target: GrantTarget, permission: impl Into<String>) -> Self {
        Self {
            subject,
            target,
            permission: permission.into(),
        }
    }

    pub fn user_project(user: &str, project: &str, permission: &str) -> Self {
        Self::new(
            GrantSubject::User(user.to_string()),
            GrantTarget::Project(project.to_string()),
            permission,
        )
    }

    pub fn group_project(group: &str, project: &str, permission: &str) -> Self {
        Self::new(
            GrantSubject::Group(group.to_string()),
            GrantTarget::Project(project.to_string()),
            permission,
        )
    }

    pub fn user_cluster(user: &str, permission: &str) -> Self {
        Self::new(GrantSubject::User(user.to_string()), GrantTarget::Cluster, permission)
    }

    pub fn group_cluster(group: &str, permission: &str) -> Self {
        Self::new(GrantSubject::Group(group.to_string()), GrantTarget::Cluster, permission)
    }

    /// Parse the three textual parts of a grant
    pub fn parse(subject: &str, target: &str, permission: &str) -> Result<Self, GrantError> {
        if permission.trim().is_empty() {
            return Err(GrantError::EmptyPermission);
        }
        Ok(Self::new(
            GrantSubject::parse(subject)?,
            GrantTarget::parse(target)?,
            permission.trim(),
        ))
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.target == GrantTarget::Cluster
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.subject, self.target, self.permission)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantChangeKind {
    Added,
    Removed,
}

/// One incremental change from the grant feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantChange {
    pub kind: GrantChangeKind,
    pub grant: Grant,
}

impl GrantChange {
    pub fn added(grant: Grant) -> Self {
        Self {
            kind: GrantChangeKind::Added,
            grant,
        }
    }

    pub fn removed(grant: Grant) -> Self {
        Self {
            kind: GrantChangeKind::Removed,
            grant,
        }
    }
}

mod subject_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(subject: &GrantSubject, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&subject.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<GrantSubject, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        GrantSubject::parse(&s).map_err(serde::de::Error::custom)
    }
}

mod target_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(target: &GrantTarget, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&target.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<GrantTarget, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        GrantTarget::parse(&s).map_err(serde::de::Error::custom)
    }
}
