//! In-memory grant and project stores
//!
//! Change feeds are backed by a `tokio::sync::broadcast` channel. A receiver
//! that falls behind is told so explicitly (`Disconnected` / `Lagged`) and its
//! feed ends, so consumers always notice a gap.

use crate::auth::Grant;
use crate::projects::Project;
use crate::storage::{
    GrantFeed, GrantFeedEvent, GrantStore, ProjectChange, ProjectFeed, ProjectFeedEvent, ProjectStore,
    StorageError,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Grant store held in process memory
pub struct MemoryGrantStore {
    grants: Mutex<HashSet<Grant>>,
    feed: broadcast::Sender<GrantFeedEvent>,
    available: AtomicBool,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            grants: Mutex::new(HashSet::new()),
            feed,
            available: AtomicBool::new(true),
        }
    }

    /// Seed grants without emitting feed events
    pub fn with_grants(self, grants: impl IntoIterator<Item = Grant>) -> Self {
        self.grants.lock().extend(grants);
        self
    }

    /// Tell every open feed that it lost its connection
    pub fn disconnect_feeds(&self) {
        let _ = self.feed.send(GrantFeedEvent::Disconnected);
    }

    /// Push a raw event to open feeds without touching the stored set, e.g.
    /// to simulate duplicate delivery
    pub fn replay(&self, event: GrantFeedEvent) {
        let _ = self.feed.send(event);
    }

    /// While unavailable, listing and watching fail
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.grants.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.lock().is_empty()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("grant store offline".to_string()))
        }
    }
}

impl Default for MemoryGrantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn list_grants(&self) -> Result<Vec<Grant>, StorageError> {
        self.check_available()?;
        Ok(self.grants.lock().iter().cloned().collect())
    }

    async fn watch_grants(&self) -> Result<GrantFeed, StorageError> {
        self.check_available()?;
        let rx = self.feed.subscribe();

        let feed = futures::stream::unfold(Some(rx), |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Ok(GrantFeedEvent::Disconnected) => Some((GrantFeedEvent::Disconnected, None)),
                Ok(event) => Some((event, Some(rx))),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Grant feed receiver lagged");
                    Some((GrantFeedEvent::Disconnected, None))
                }
                Err(RecvError::Closed) => None,
            }
        });
        Ok(feed.boxed())
    }

    async fn add_grant(&self, grant: &Grant) -> Result<(), StorageError> {
        self.check_available()?;
        let mut grants = self.grants.lock();
        if grants.insert(grant.clone()) {
            let _ = self.feed.send(GrantFeedEvent::Added(grant.clone()));
        }
        Ok(())
    }

    async fn remove_grant(&self, grant: &Grant) -> Result<(), StorageError> {
        self.check_available()?;
        let mut grants = self.grants.lock();
        if grants.remove(grant) {
            let _ = self.feed.send(GrantFeedEvent::Removed(grant.clone()));
        }
        Ok(())
    }
}

/// Project store held in process memory
pub struct MemoryProjectStore {
    projects: DashMap<String, Project>,
    next_revision: AtomicU64,
    feed: broadcast::Sender<ProjectChange>,
    available: AtomicBool,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            projects: DashMap::new(),
            next_revision: AtomicU64::new(1),
            feed,
            available: AtomicBool::new(true),
        }
    }

    /// Seed projects without emitting feed events
    pub fn with_projects(self, projects: impl IntoIterator<Item = Project>) -> Self {
        for mut project in projects {
            project.revision = self.next_revision();
            self.projects.insert(project.name.clone(), project);
        }
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    fn next_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("project store offline".to_string()))
        }
    }
}

impl Default for MemoryProjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get(&self, name: &str) -> Result<Project, StorageError> {
        self.check_available()?;
        self.projects
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| StorageError::NotFound(format!("project {}", name)))
    }

    async fn list(&self) -> Result<Vec<Project>, StorageError> {
        self.check_available()?;
        let mut projects: Vec<Project> = self.projects.iter().map(|entry| entry.value().clone()).collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn create(&self, mut project: Project) -> Result<Project, StorageError> {
        self.check_available()?;
        match self.projects.entry(project.name.clone()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists(format!("project {}", project.name))),
            Entry::Vacant(slot) => {
                project.revision = self.next_revision();
                let stored = slot.insert(project);
                let _ = self.feed.send(ProjectChange::Created(stored.value().clone()));
                Ok(stored.value().clone())
            }
        }
    }

    async fn update(&self, mut project: Project) -> Result<Project, StorageError> {
        self.check_available()?;
        let mut existing = self
            .projects
            .get_mut(&project.name)
            .ok_or_else(|| StorageError::NotFound(format!("project {}", project.name)))?;

        if project.revision != 0 && project.revision != existing.revision {
            return Err(StorageError::Conflict(format!(
                "project {} is at revision {}, not {}",
                project.name, existing.revision, project.revision
            )));
        }

        project.revision = self.next_revision();
        *existing = project.clone();
        let _ = self.feed.send(ProjectChange::Updated(project.clone()));
        Ok(project)
    }

    async fn delete(&self, name: &str) -> Result<Project, StorageError> {
        self.check_available()?;
        self.projects
            .remove_if(name, |_, project| {
                let _ = self.feed.send(ProjectChange::Deleted(project.clone()));
                true
            })
            .map(|(_, project)| project)
            .ok_or_else(|| StorageError::NotFound(format!("project {}", name)))
    }

    async fn watch_projects(&self) -> Result<ProjectFeed, StorageError> {
        self.check_available()?;
        let rx = self.feed.subscribe();

        let feed = futures::stream::unfold(Some(rx), |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Ok(change) => Some((ProjectFeedEvent::Change(change), Some(rx))),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Project feed receiver lagged");
                    Some((ProjectFeedEvent::Lagged, None))
                }
                Err(RecvError::Closed) => None,
            }
        });
        Ok(feed.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_store_feed_reports_changes_once() {
        let store = MemoryGrantStore::new();
        let mut feed = store.watch_grants().await.unwrap();
        let grant = Grant::user_project("alice", "a", "view");

        store.add_grant(&grant).await.unwrap();
        store.add_grant(&grant).await.unwrap();
        store.remove_grant(&grant).await.unwrap();

        assert_eq!(feed.next().await, Some(GrantFeedEvent::Added(grant.clone())));
        assert_eq!(feed.next().await, Some(GrantFeedEvent::Removed(grant)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_grant_feed_ends_after_disconnect() {
        let store = MemoryGrantStore::new();
        let mut feed = store.watch_grants().await.unwrap();
        store.disconnect_feeds();

        assert_eq!(feed.next().await, Some(GrantFeedEvent::Disconnected));
        assert_eq!(feed.next().await, None);
    }

    #[tokio::test]
    async fn test_grant_feed_lag_surfaces_as_disconnect() {
        let store = MemoryGrantStore::with_feed_capacity(1);
        let mut feed = store.watch_grants().await.unwrap();
        store.add_grant(&Grant::user_cluster("a", "view")).await.unwrap();
        store.add_grant(&Grant::user_cluster("b", "view")).await.unwrap();

        assert_eq!(feed.next().await, Some(GrantFeedEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_unavailable_grant_store() {
        let store = MemoryGrantStore::new();
        store.set_available(false);
        assert!(matches!(store.list_grants().await, Err(StorageError::Unavailable(_))));
        assert!(store.watch_grants().await.is_err());
    }

    #[tokio::test]
    async fn test_project_store_crud_assigns_revisions() {
        let store = MemoryProjectStore::new();
        let mut feed = store.watch_projects().await.unwrap();

        let created = store.create(Project::new("web")).await.unwrap();
        assert_eq!(created.revision, 1);
        assert!(matches!(
            store.create(Project::new("web")).await,
            Err(StorageError::AlreadyExists(_))
        ));

        let updated = store
            .update(created.clone().with_annotation("note", "x"))
            .await
            .unwrap();
        assert!(updated.revision > created.revision);

        let stale = created.clone().with_label("team", "a");
        assert!(matches!(store.update(stale).await, Err(StorageError::Conflict(_))));

        let deleted = store.delete("web").await.unwrap();
        assert_eq!(deleted.revision, updated.revision);
        assert!(matches!(store.get("web").await, Err(StorageError::NotFound(_))));

        assert!(matches!(feed.next().await, Some(ProjectFeedEvent::Change(ProjectChange::Created(_)))));
        assert!(matches!(feed.next().await, Some(ProjectFeedEvent::Change(ProjectChange::Updated(_)))));
        assert!(matches!(feed.next().await, Some(ProjectFeedEvent::Change(ProjectChange::Deleted(_)))));
    }

    #[tokio::test]
    async fn test_project_list_sorted() {
        let store = MemoryProjectStore::new().with_projects([Project::new("b"), Project::new("a")]);
        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
