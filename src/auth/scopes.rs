//! Session scope restrictions
//!
//! A session may declare scopes that narrow what its principal can see:
//!
//! - `user:full`, `user:list-projects`: no narrowing
//! - `user:info`, `user:check-access`, `user:list-scoped-projects`: no project
//!   visibility of their own; the `role:` scopes beside them decide
//! - `role:<role>:<project>` (optionally `:!`): that project only
//! - `role:<role>:*` (optionally `:!`): no narrowing
//!
//! A session without scopes is unrestricted. Scopes union together. Any
//! scope that cannot be parsed turns the whole restriction into
//! [`ScopeRestriction::Nothing`].

use std::collections::BTreeSet;
use tracing::warn;

pub const SCOPE_FULL: &str = "user:full";
pub const SCOPE_LIST_PROJECTS: &str = "user:list-projects";
pub const SCOPE_LIST_SCOPED_PROJECTS: &str = "user:list-scoped-projects";
pub const SCOPE_INFO: &str = "user:info";
pub const SCOPE_CHECK_ACCESS: &str = "user:check-access";

const ROLE_PREFIX: &str = "role:";
const ESCALATING_SUFFIX: &str = "!";

/// The subset of a principal's visibility a request is allowed to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeRestriction {
    Unrestricted,
    Only(BTreeSet<String>),
    Nothing,
}

enum ParsedScope {
    All,
    Project(String),
    NoProjects,
}

impl ScopeRestriction {
    /// Derive the restriction for a session's scope list
    pub fn from_scopes<S: AsRef<str>>(scopes: &[S]) -> Self {
        if scopes.is_empty() {
            return ScopeRestriction::Unrestricted;
        }

        let mut projects = BTreeSet::new();
        let mut unrestricted = false;

        for scope in scopes {
            match parse_scope(scope.as_ref()) {
                Some(ParsedScope::All) => unrestricted = true,
                Some(ParsedScope::Project(name)) => {
                    projects.insert(name);
                }
                Some(ParsedScope::NoProjects) => {}
                None => {
                    warn!(scope = scope.as_ref(), "Unrecognized scope, denying project visibility");
                    return ScopeRestriction::Nothing;
                }
            }
        }

        if unrestricted {
            ScopeRestriction::Unrestricted
        } else if projects.is_empty() {
            ScopeRestriction::Nothing
        } else {
            ScopeRestriction::Only(projects)
        }
    }

    /// Whether a single project passes this restriction
    pub fn allows(&self, project: &str) -> bool {
        match self {
            ScopeRestriction::Unrestricted => true,
            ScopeRestriction::Only(names) => names.contains(project),
            ScopeRestriction::Nothing => false,
        }
    }

    /// Narrow a full visibility set down to what this restriction allows
    pub fn restrict(&self, full: &BTreeSet<String>) -> BTreeSet<String> {
        match self {
            ScopeRestriction::Unrestricted => full.clone(),
            ScopeRestriction::Only(names) => full.intersection(names).cloned().collect(),
            ScopeRestriction::Nothing => BTreeSet::new(),
        }
    }
}

fn parse_scope(scope: &str) -> Option<ParsedScope> {
    match scope {
        SCOPE_FULL | SCOPE_LIST_PROJECTS => return Some(ParsedScope::All),
        SCOPE_INFO | SCOPE_CHECK_ACCESS | SCOPE_LIST_SCOPED_PROJECTS => return Some(ParsedScope::NoProjects),
        _ => {}
    }

    let rest = scope.strip_prefix(ROLE_PREFIX)?;
    let mut parts = rest.split(':');
    let role = parts.next()?;
    let project = parts.next()?;
    match parts.next() {
        None => {}
        Some(ESCALATING_SUFFIX) => {}
        Some(_) => return None,
    }
    if parts.next().is_some() || role.is_empty() || project.is_empty() {
        return None;
    }

    if project == "*" {
        Some(ParsedScope::All)
    } else {
        Some(ParsedScope::Project(project.to_string()))
    }
}
