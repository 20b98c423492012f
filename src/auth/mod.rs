//! Identities, grants and scope restrictions
//!
//! Grant subjects:
//! - `user:<name>`: grant attached to a single user
//! - `group:<name>`: grant inherited by every member of the group
//!
//! Grant targets:
//! - `project:<name>`: visibility of one project
//! - `cluster`: visibility of every current and future project
//!
//! Session tokens (`sess-` prefix) carry the principal and its declared scopes.

mod grants;
mod principal;
mod scopes;
mod tokens;

pub use grants::{Grant, GrantChange, GrantChangeKind, GrantError, GrantSubject, GrantTarget};
pub use principal::Principal;
pub use scopes::{ScopeRestriction, SCOPE_CHECK_ACCESS, SCOPE_FULL, SCOPE_INFO, SCOPE_LIST_PROJECTS, SCOPE_LIST_SCOPED_PROJECTS};
pub use tokens::{SessionPayload, SessionToken, TokenError, SESSION_TOKEN_PREFIX};
