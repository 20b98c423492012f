//! projectauth - authorization-aware project visibility
//!
//! Keeps an in-memory index of who may see which projects, derived from
//! user, group and cluster-scope grants, and answers "which projects can this
//! user see" without touching storage. Watchers receive `Added`/`Modified`/
//! `Deleted` events as grants and projects change.

pub mod auth;
pub mod cache;
pub mod projects;
pub mod server;
pub mod storage;

pub use auth::{Grant, GrantSubject, GrantTarget, Principal, ScopeRestriction, SessionToken};
pub use cache::{AuthorizationCache, CacheConfig, CacheError, CacheHealth, CloseReason, EventKind, ProjectWatcher, WatchEvent};
pub use projects::Project;
pub use server::{ProjectRegistry, ProjectServer};
