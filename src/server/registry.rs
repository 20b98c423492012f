//! Project API adapter
//!
//! List and watch are answered from the authorization cache for the calling
//! user; single-object reads and writes go straight to the project store.

use crate::auth::{Principal, ScopeRestriction, SessionToken};
use crate::cache::{AuthorizationCache, CacheError, CloseReason, EventKind, ProjectWatcher, WatchEvent, WatcherId};
use crate::projects::{FieldSelector, LabelSelector, NameError, Project, SelectorError};
use crate::storage::{ProjectStore, StorageError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Resource version that asks a watch to start with the existing projects
pub const RESOURCE_VERSION_ALL: &str = "0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ApiError::NotFound(what),
            StorageError::AlreadyExists(what) => ApiError::AlreadyExists(what),
            StorageError::Conflict(what) => ApiError::Conflict(what),
            StorageError::Unavailable(what) => ApiError::Unavailable(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Storage(err) => err.into(),
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl From<SelectorError> for ApiError {
    fn from(err: SelectorError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<NameError> for ApiError {
    fn from(err: NameError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

/// Who is asking, and with which scopes
#[derive(Debug, Clone)]
pub struct RequestContext {
    principal: Option<Principal>,
    restriction: ScopeRestriction,
}

impl RequestContext {
    /// A request without an authenticated user
    pub fn anonymous() -> Self {
        Self {
            principal: None,
            restriction: ScopeRestriction::Nothing,
        }
    }

    pub fn new(principal: Principal, scopes: &[String]) -> Self {
        Self {
            principal: Some(principal),
            restriction: ScopeRestriction::from_scopes(scopes),
        }
    }

    pub fn from_token(token: &SessionToken) -> Self {
        Self {
            principal: Some(token.principal().clone()),
            restriction: token.restriction(),
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn restriction(&self) -> &ScopeRestriction {
        &self.restriction
    }

    pub fn require_user(&self) -> Result<&Principal, ApiError> {
        self.principal
            .as_ref()
            .ok_or_else(|| ApiError::Forbidden("no user on the request context".to_string()))
    }
}

/// Filters and starting point for list and watch
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub label_selector: LabelSelector,
    pub field_selector: FieldSelector,
    pub resource_version: Option<String>,
}

impl ListOptions {
    pub fn parse(
        label_selector: Option<&str>,
        field_selector: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            label_selector: label_selector.map(LabelSelector::parse).transpose()?.unwrap_or_default(),
            field_selector: field_selector.map(FieldSelector::parse).transpose()?.unwrap_or_default(),
            resource_version: resource_version.map(str::to_string),
        })
    }

    /// Whether a watch should begin with the currently visible projects
    pub fn include_existing(&self) -> bool {
        self.resource_version.as_deref() == Some(RESOURCE_VERSION_ALL)
    }

    fn matches(&self, project: &Project) -> bool {
        self.label_selector.matches(project) && self.field_selector.matches(project)
    }
}

/// A list answer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectList {
    pub kind: &'static str,
    /// Cache revision the list reflects
    pub resource_version: String,
    pub items: Vec<Project>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

impl ProjectList {
    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|p| p.name.as_str()).collect()
    }
}

/// A watch narrowed by label and field selectors
///
/// Tracks which projects currently match so that a project which stops
/// matching is reported as `Deleted`, and one that starts matching as `Added`.
#[derive(Debug)]
pub struct RegistryWatch {
    watcher: ProjectWatcher,
    options: ListOptions,
    matched: HashSet<String>,
}

impl RegistryWatch {
    fn new(watcher: ProjectWatcher, options: ListOptions, matched: HashSet<String>) -> Self {
        Self {
            watcher,
            options,
            matched,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.watcher.id()
    }

    /// Next event passing the selectors, or `None` once the watch has closed
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            let event = self.watcher.recv().await?;
            let matches = self.options.matches(&event.project);
            let was_matched = self.matched.contains(event.name());

            let kind = match (event.kind, matches, was_matched) {
                (EventKind::Deleted, _, true) => EventKind::Deleted,
                (EventKind::Deleted, _, false) => continue,
                (_, true, false) => EventKind::Added,
                (_, true, true) => EventKind::Modified,
                (_, false, true) => EventKind::Deleted,
                (_, false, false) => continue,
            };

            match kind {
                EventKind::Deleted => self.matched.remove(event.name()),
                _ => self.matched.insert(event.name().to_string()),
            };
            return Some(WatchEvent { kind, ..event });
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.watcher.close_reason()
    }

    pub fn stop(&self) {
        self.watcher.stop();
    }
}

/// Project API backed by the authorization cache and the project store
pub struct ProjectRegistry {
    cache: AuthorizationCache,
    store: Arc<dyn ProjectStore>,
}

impl ProjectRegistry {
    pub fn new(cache: AuthorizationCache, store: Arc<dyn ProjectStore>) -> Self {
        Self { cache, store }
    }

    pub fn cache(&self) -> &AuthorizationCache {
        &self.cache
    }

    /// Projects the calling user may see, filtered by the selectors
    pub fn list(&self, ctx: &RequestContext, options: &ListOptions) -> Result<ProjectList, ApiError> {
        let principal = ctx.require_user()?;
        let visible = self.cache.list_visible(principal, ctx.restriction())?;

        let items: Vec<Project> = visible
            .projects
            .iter()
            .filter(|p| options.matches(p))
            .map(|p| p.as_ref().clone())
            .collect();

        debug!(principal = %principal, count = items.len(), revision = visible.revision, "Listed projects");
        Ok(ProjectList {
            kind: "ProjectList",
            resource_version: visible.revision.to_string(),
            items,
            stale: visible.stale,
        })
    }

    /// Watch the calling user's visible projects
    pub async fn watch(&self, ctx: &RequestContext, options: ListOptions) -> Result<RegistryWatch, ApiError> {
        let principal = ctx.require_user()?;
        let mut watcher = self
            .cache
            .subscribe(principal.clone(), ctx.restriction().clone(), options.include_existing())
            .await?;

        // Without a baseline the caller already holds a list; start from what
        // matched at registration so later deletes and relabels are reported
        let initial = watcher.take_initial();
        let matched = if options.include_existing() {
            HashSet::new()
        } else {
            initial
                .iter()
                .filter(|p| options.matches(p))
                .map(|p| p.name.clone())
                .collect()
        };

        debug!(principal = %principal, watcher_id = %watcher.id(), "Watch opened");
        Ok(RegistryWatch::new(watcher, options, matched))
    }

    pub async fn get(&self, name: &str) -> Result<Project, ApiError> {
        Ok(self.store.get(name).await?)
    }

    pub async fn create(&self, project: Project) -> Result<Project, ApiError> {
        project.validate()?;
        Ok(self.store.create(project).await?)
    }

    pub async fn update(&self, project: Project) -> Result<Project, ApiError> {
        project.validate()?;
        Ok(self.store.update(project).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<Project, ApiError> {
        Ok(self.store.delete(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Grant;
    use crate::cache::CacheConfig;
    use crate::storage::{GrantStore, MemoryGrantStore, MemoryProjectStore};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn registry(grants: Vec<Grant>, projects: Vec<Project>) -> (ProjectRegistry, Arc<MemoryGrantStore>) {
        let grant_store = Arc::new(MemoryGrantStore::new().with_grants(grants));
        let project_store = Arc::new(MemoryProjectStore::new().with_projects(projects));
        let cache = AuthorizationCache::start(CacheConfig::new(), grant_store.clone(), project_store.clone())
            .await
            .unwrap();
        (ProjectRegistry::new(cache, project_store), grant_store)
    }

    fn alice() -> RequestContext {
        RequestContext::new(Principal::user("alice"), &[])
    }

    #[tokio::test]
    async fn test_list_requires_user() {
        let (registry, _) = registry(vec![], vec![]).await;
        let err = registry
            .list(&RequestContext::anonymous(), &ListOptions::default())
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let err = registry
            .watch(&RequestContext::anonymous(), ListOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_list_applies_selectors() {
        let (registry, _) = registry(
            vec![Grant::user_cluster("alice", "view")],
            vec![
                Project::new("web").with_label("tier", "front"),
                Project::new("db").with_label("tier", "back"),
                Project::new("cache"),
            ],
        )
        .await;

        let all = registry.list(&alice(), &ListOptions::default()).unwrap();
        assert_eq!(all.names(), vec!["cache", "db", "web"]);
        assert_eq!(all.kind, "ProjectList");

        let front = ListOptions::parse(Some("tier=front"), None, None).unwrap();
        assert_eq!(registry.list(&alice(), &front).unwrap().names(), vec!["web"]);

        let not_db = ListOptions::parse(None, Some("metadata.name!=db"), None).unwrap();
        assert_eq!(registry.list(&alice(), &not_db).unwrap().names(), vec!["cache", "web"]);
    }

    #[tokio::test]
    async fn test_scoped_context_narrows_list() {
        let (registry, _) = registry(
            vec![Grant::user_cluster("alice", "view")],
            vec![Project::new("a"), Project::new("b")],
        )
        .await;

        let ctx = RequestContext::new(Principal::user("alice"), &["role:view:b".to_string()]);
        assert_eq!(registry.list(&ctx, &ListOptions::default()).unwrap().names(), vec!["b"]);

        let ctx = RequestContext::new(Principal::user("alice"), &["bogus".to_string()]);
        assert!(registry.list(&ctx, &ListOptions::default()).unwrap().items.is_empty());
    }

    #[test]
    fn test_bad_selector_is_bad_request() {
        assert!(matches!(
            ListOptions::parse(None, Some("spec.owner=x"), None),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_resource_version_zero_includes_existing() {
        let (registry, _) = registry(
            vec![Grant::user_project("alice", "a", "view")],
            vec![Project::new("a"), Project::new("b")],
        )
        .await;

        let options = ListOptions::parse(None, None, Some("0")).unwrap();
        assert!(options.include_existing());
        let mut watch = registry.watch(&alice(), options).await.unwrap();

        let event = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.name(), "a");
    }

    #[tokio::test]
    async fn test_watch_selector_turns_relabel_into_delete() {
        let (registry, _) = registry(
            vec![Grant::user_cluster("alice", "view")],
            vec![Project::new("web").with_label("tier", "front")],
        )
        .await;

        let options = ListOptions::parse(Some("tier=front"), None, Some("0")).unwrap();
        let mut watch = registry.watch(&alice(), options).await.unwrap();
        let event = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Added);

        let current = registry.get("web").await.unwrap();
        registry
            .update(current.with_label("tier", "back"))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Deleted);
        assert_eq!(event.name(), "web");
    }

    #[tokio::test]
    async fn test_watch_sees_grant_from_store() {
        let (registry, grants) = registry(vec![], vec![Project::new("a")]).await;
        let mut watch = registry.watch(&alice(), ListOptions::default()).await.unwrap();

        grants.add_grant(&Grant::user_project("alice", "a", "view")).await.unwrap();

        let event = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.name(), "a");
    }

    #[tokio::test]
    async fn test_watch_without_baseline_reports_delete() {
        let (registry, _) = registry(vec![Grant::user_cluster("alice", "view")], vec![Project::new("old")]).await;
        let mut watch = registry.watch(&alice(), ListOptions::default()).await.unwrap();

        registry.delete("old").await.unwrap();

        let event = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Deleted);
        assert_eq!(event.name(), "old");
    }

    #[tokio::test]
    async fn test_delete_racing_watch_registration_is_reported() {
        let (registry, _) = registry(vec![Grant::user_cluster("alice", "view")], vec![Project::new("old")]).await;
        let ctx = alice();

        // Queue the registration, then the delete, before either is applied
        let watch = registry.watch(&ctx, ListOptions::default());
        tokio::pin!(watch);
        assert!(futures::poll!(&mut watch).is_pending());
        registry.delete("old").await.unwrap();

        let mut watch = watch.await.unwrap();
        let event = timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Deleted);
        assert_eq!(event.name(), "old");
    }

    #[tokio::test]
    async fn test_create_validates_name() {
        let (registry, _) = registry(vec![], vec![]).await;
        assert!(matches!(
            registry.create(Project::new("Not_Valid")).await,
            Err(ApiError::BadRequest(_))
        ));
        assert!(registry.create(Project::new("valid")).await.is_ok());
        assert!(matches!(
            registry.create(Project::new("valid")).await,
            Err(ApiError::AlreadyExists(_))
        ));
        assert!(matches!(registry.delete("missing").await, Err(ApiError::NotFound(_))));
    }
}
