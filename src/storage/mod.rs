//! Storage backends
//!
//! - Grants: durable store of access grants with a change feed (in-memory or
//!   Postgres LISTEN/NOTIFY)
//! - Projects: the project/namespace store with a change feed (in-memory)

mod memory;
mod postgres;

pub use memory::{MemoryGrantStore, MemoryProjectStore};
pub use postgres::{PostgresConfig, PostgresGrantStore};

use crate::auth::Grant;
use crate::projects::Project;
pub use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One item from a grant change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantFeedEvent {
    Added(Grant),
    Removed(Grant),
    /// The feed lost events or its connection; consumers must resync
    Disconnected,
}

/// Ordered grant changes. The stream ending is treated like `Disconnected`.
pub type GrantFeed = BoxStream<'static, GrantFeedEvent>;

/// A project mutation as reported by the project store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectChange {
    Created(Project),
    Updated(Project),
    Deleted(Project),
}

/// One item from a project change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectFeedEvent {
    Change(ProjectChange),
    /// Changes were dropped; consumers must relist
    Lagged,
}

pub type ProjectFeed = BoxStream<'static, ProjectFeedEvent>;

/// Source of access grants
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Every grant currently held
    async fn list_grants(&self) -> Result<Vec<Grant>, StorageError>;

    /// Subscribe to incremental changes from now on
    async fn watch_grants(&self) -> Result<GrantFeed, StorageError>;

    /// Record a grant (administrative tooling)
    async fn add_grant(&self, grant: &Grant) -> Result<(), StorageError>;

    /// Revoke a grant (administrative tooling)
    async fn remove_grant(&self, grant: &Grant) -> Result<(), StorageError>;
}

/// The project/namespace store
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Project, StorageError>;

    async fn list(&self) -> Result<Vec<Project>, StorageError>;

    /// Create a project; the store assigns its revision
    async fn create(&self, project: Project) -> Result<Project, StorageError>;

    /// Update a project. A non-zero `revision` must match the stored one.
    async fn update(&self, project: Project) -> Result<Project, StorageError>;

    async fn delete(&self, name: &str) -> Result<Project, StorageError>;

    /// Subscribe to project changes from now on
    async fn watch_projects(&self) -> Result<ProjectFeed, StorageError>;
}
