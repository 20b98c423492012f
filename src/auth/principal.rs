//! Authenticated identities

use crate::auth::grants::GrantSubject;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A user plus its group memberships
///
/// Groups keep their first-seen order and are de-duplicated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    user: String,
    groups: Vec<String>,
}

impl Principal {
    pub fn new(user: impl Into<String>, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut seen = Vec::new();
        for group in groups {
            let group = group.into();
            if !seen.contains(&group) {
                seen.push(group);
            }
        }

        Self {
            user: user.into(),
            groups: seen,
        }
    }

    /// A principal with no group memberships
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.user
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Every grant subject this principal inherits from: its user key first,
    /// then one key per group
    pub fn subjects(&self) -> Vec<GrantSubject> {
        let mut keys = Vec::with_capacity(self.groups.len() + 1);
        keys.push(GrantSubject::User(self.user.clone()));
        keys.extend(self.groups.iter().cloned().map(GrantSubject::Group));
        keys
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.groups.is_empty() {
            write!(f, "{}", self.user)
        } else {
            write!(f, "{}[{}]", self.user, self.groups.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_deduplicated_in_order() {
        let p = Principal::new("alice", ["dev", "ops", "dev"]);
        assert_eq!(p.groups(), &["dev".to_string(), "ops".to_string()]);
    }

    #[test]
    fn test_subjects() {
        let p = Principal::new("alice", ["dev"]);
        let subjects = p.subjects();
        assert_eq!(subjects[0], GrantSubject::User("alice".into()));
        assert_eq!(subjects[1], GrantSubject::Group("dev".into()));
        assert_eq!(subjects.len(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(Principal::user("bob").to_string(), "bob");
        assert_eq!(Principal::new("alice", ["a", "b"]).to_string(), "alice[a,b]");
    }
}
