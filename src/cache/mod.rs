//! Authorization cache
//!
//! All mutations (grant changes, project changes, resyncs, watcher
//! registration and removal) are commands on one queue, applied in arrival
//! order by a single processing task. Readers take a shared lock on the
//! current index and never wait on the queue.
//!
//! ```text
//! grant feed ─┐
//!             ├─► commands ─► processing loop ─► index (RwLock) ─► list_visible
//! proj. feed ─┘        ▲             │
//!                      │             └─► WatchMultiplexer ─► per-watcher mpsc
//!     subscribe / unsubscribe / shutdown
//! ```

mod config;
pub mod index;
pub mod multiplexer;
mod watcher;

pub use config::CacheConfig;
pub use index::{ProjectUpsert, VisibilityIndex};
pub use multiplexer::WatchMultiplexer;
pub use watcher::{CloseReason, EventKind, ProjectWatcher, WatchEvent, WatcherId, WatcherState};

use crate::auth::{Grant, GrantChange, Principal, ScopeRestriction};
use crate::projects::Project;
use crate::storage::{
    GrantFeed, GrantFeedEvent, GrantStore, ProjectChange, ProjectFeed, ProjectFeedEvent, ProjectStore,
    StorageError,
};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use watcher::Registered;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("authorization cache stopped")]
    Stopped,

    #[error("authorization cache degraded: {0}")]
    Degraded(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Freshness of the cache with respect to its sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHealth {
    /// Both feeds connected
    Fresh,
    /// A feed was lost and is being resynchronized; answers may lag
    Stale,
    /// Resynchronization kept failing; new watches are refused
    Degraded,
    Stopped,
}

/// Answer to a list query
#[derive(Debug, Clone)]
pub struct VisibleProjects {
    /// Sorted by name
    pub projects: Vec<Arc<Project>>,
    /// Cache revision the answer was computed at
    pub revision: u64,
    /// Set while a feed is being resynchronized
    pub stale: bool,
}

impl VisibleProjects {
    pub fn names(&self) -> Vec<&str> {
        self.projects.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Work items for the processing loop
pub(crate) enum Command {
    Grant(GrantChange),
    GrantSnapshot(Vec<Grant>),
    GrantFeedLost,
    GrantResyncFailed { attempts: u32, error: StorageError },
    Project(ProjectChange),
    ProjectSnapshot(Vec<Project>),
    ProjectFeedLost,
    ProjectResyncFailed { attempts: u32, error: StorageError },
    Subscribe {
        principal: Principal,
        restriction: ScopeRestriction,
        include_existing: bool,
        reply: oneshot::Sender<Result<Registered, CacheError>>,
    },
    Unsubscribe(WatcherId),
    /// Replies once every earlier command has been applied
    Flush(oneshot::Sender<u64>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Grants,
    Projects,
}

impl Feed {
    fn as_str(&self) -> &'static str {
        match self {
            Feed::Grants => "grants",
            Feed::Projects => "projects",
        }
    }
}

#[derive(Debug, Default)]
struct FeedHealth {
    lost: bool,
    failures: u32,
    last_error: Option<String>,
}

struct State {
    index: VisibilityIndex,
    revision: u64,
    grants: FeedHealth,
    projects: FeedHealth,
    max_failures: u32,
    stopped: bool,
}

impl State {
    fn feed(&mut self, feed: Feed) -> &mut FeedHealth {
        match feed {
            Feed::Grants => &mut self.grants,
            Feed::Projects => &mut self.projects,
        }
    }

    fn degraded_reason(&self) -> Option<String> {
        [&self.grants, &self.projects]
            .into_iter()
            .find(|f| f.failures >= self.max_failures)
            .map(|f| f.last_error.clone().unwrap_or_else(|| "resync failed".to_string()))
    }

    fn health(&self) -> CacheHealth {
        if self.stopped {
            CacheHealth::Stopped
        } else if self.degraded_reason().is_some() {
            CacheHealth::Degraded
        } else if self.grants.lost || self.projects.lost {
            CacheHealth::Stale
        } else {
            CacheHealth::Fresh
        }
    }
}

struct Shared {
    state: RwLock<State>,
    watchers: AtomicUsize,
}

struct Inner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    feeds: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for handle in self.feeds.lock().drain(..) {
            handle.abort();
        }
        let (done, _) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown(done));
    }
}

/// Authorization-aware view over the project store
///
/// Cheap to clone; all clones share one processing loop.
#[derive(Clone)]
pub struct AuthorizationCache {
    inner: Arc<Inner>,
}

impl AuthorizationCache {
    /// Load grants and projects, then keep them current from the store feeds
    ///
    /// Feeds are opened before the initial listing so that no change can fall
    /// between the snapshot and the first streamed event. Must be called from
    /// within a tokio runtime.
    pub async fn start(
        config: CacheConfig,
        grants: Arc<dyn GrantStore>,
        projects: Arc<dyn ProjectStore>,
    ) -> Result<Self, CacheError> {
        let grant_feed = grants.watch_grants().await?;
        let project_feed = projects.watch_projects().await?;
        let initial_grants = grants.list_grants().await?;
        let initial_projects = projects.list().await?;

        let mut index = VisibilityIndex::new();
        index.replace_grants(initial_grants);
        for project in initial_projects {
            index.upsert_project(Arc::new(project));
        }

        info!(
            grants = index.grant_count(),
            projects = index.project_count(),
            watch_buffer = config.watch_buffer,
            "Authorization cache loaded"
        );

        let shared = Arc::new(Shared {
            state: RwLock::new(State {
                index,
                revision: 0,
                grants: FeedHealth::default(),
                projects: FeedHealth::default(),
                max_failures: config.max_resync_failures,
                stopped: false,
            }),
            watchers: AtomicUsize::new(0),
        });

        let (commands, queue) = mpsc::unbounded_channel();

        let processor = Processor {
            shared: shared.clone(),
            mux: WatchMultiplexer::new(config.watch_buffer),
        };
        tokio::spawn(processor.run(queue));

        let feeds = vec![
            tokio::spawn(pump_grants(grants, commands.clone(), config.clone(), grant_feed)),
            tokio::spawn(pump_projects(projects, commands.clone(), config, project_feed)),
        ];

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                commands,
                feeds: Mutex::new(feeds),
            }),
        })
    }

    /// Projects the principal may see, narrowed by the scope restriction
    ///
    /// Answered from the current index without queueing. During a resync the
    /// answer reflects the last applied state and is marked `stale`; once
    /// resyncs keep failing the cache refuses with `Degraded`.
    pub fn list_visible(
        &self,
        principal: &Principal,
        restriction: &ScopeRestriction,
    ) -> Result<VisibleProjects, CacheError> {
        let state = self.inner.shared.state.read();
        if state.stopped {
            return Err(CacheError::Stopped);
        }
        if let Some(reason) = state.degraded_reason() {
            return Err(CacheError::Degraded(reason));
        }

        let names = restriction.restrict(&state.index.visible_projects(principal));
        let projects = names
            .iter()
            .filter_map(|name| state.index.project(name).cloned())
            .collect();

        Ok(VisibleProjects {
            projects,
            revision: state.revision,
            stale: state.health() != CacheHealth::Fresh,
        })
    }

    /// Open a watch on the principal's visible projects
    ///
    /// With `include_existing`, the watcher first receives one `Added` per
    /// currently visible project; every later change is ordered after them.
    pub async fn subscribe(
        &self,
        principal: Principal,
        restriction: ScopeRestriction,
        include_existing: bool,
    ) -> Result<ProjectWatcher, CacheError> {
        let (reply, registered) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Subscribe {
                principal,
                restriction,
                include_existing,
                reply,
            })
            .map_err(|_| CacheError::Stopped)?;

        let registered = registered.await.map_err(|_| CacheError::Stopped)??;
        Ok(ProjectWatcher::new(registered, self.inner.commands.clone()))
    }

    /// Stop a watcher by id. Unknown or already closed ids are ignored.
    pub fn unsubscribe(&self, id: WatcherId) {
        let _ = self.inner.commands.send(Command::Unsubscribe(id));
    }

    /// Wait until every command queued so far has been applied
    ///
    /// Returns the cache revision at that point.
    pub async fn flush(&self) -> Result<u64, CacheError> {
        let (tx, rx) = oneshot::channel();
        self.inner.commands.send(Command::Flush(tx)).map_err(|_| CacheError::Stopped)?;
        rx.await.map_err(|_| CacheError::Stopped)
    }

    pub fn health(&self) -> CacheHealth {
        self.inner.shared.state.read().health()
    }

    /// Monotonic counter of applied changes
    pub fn revision(&self) -> u64 {
        self.inner.shared.state.read().revision
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.shared.watchers.load(Ordering::Relaxed)
    }

    pub fn grant_count(&self) -> usize {
        self.inner.shared.state.read().index.grant_count()
    }

    pub fn project_count(&self) -> usize {
        self.inner.shared.state.read().index.project_count()
    }

    /// Stop the feeds and the processing loop, closing every watcher with
    /// `CacheStopped`
    pub async fn shutdown(&self) {
        for handle in self.inner.feeds.lock().drain(..) {
            handle.abort();
        }

        let (done, stopped) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown(done)).is_ok() {
            let _ = stopped.await;
        }
    }
}

/// The single writer
struct Processor {
    shared: Arc<Shared>,
    mux: WatchMultiplexer,
}

impl Processor {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        debug!("Authorization cache loop started");
        while let Some(command) = queue.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.stop();

        // Answer anything still queued
        queue.close();
        while let Ok(command) = queue.try_recv() {
            match command {
                Command::Subscribe { reply, .. } => {
                    let _ = reply.send(Err(CacheError::Stopped));
                }
                Command::Shutdown(done) => {
                    let _ = done.send(());
                }
                _ => {}
            }
        }
        debug!("Authorization cache loop exited");
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Grant(change) => self.apply_grant(change),
            Command::GrantSnapshot(grants) => self.apply_grant_snapshot(grants),
            Command::Project(change) => self.apply_project(change),
            Command::ProjectSnapshot(projects) => self.apply_project_snapshot(projects),
            Command::GrantFeedLost => self.feed_lost(Feed::Grants),
            Command::ProjectFeedLost => self.feed_lost(Feed::Projects),
            Command::GrantResyncFailed { attempts, error } => self.resync_failed(Feed::Grants, attempts, error),
            Command::ProjectResyncFailed { attempts, error } => {
                self.resync_failed(Feed::Projects, attempts, error)
            }
            Command::Subscribe {
                principal,
                restriction,
                include_existing,
                reply,
            } => self.subscribe(principal, restriction, include_existing, reply),
            Command::Unsubscribe(id) => {
                self.mux.unregister(id, CloseReason::Cancelled);
            }
            Command::Flush(reply) => {
                let _ = reply.send(self.shared.state.read().revision);
            }
            Command::Shutdown(done) => {
                self.stop();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }

        self.shared.watchers.store(self.mux.len(), Ordering::Relaxed);
        ControlFlow::Continue(())
    }

    fn apply_grant(&mut self, change: GrantChange) {
        let mut state = self.shared.state.write();
        if !state.index.apply_grant_change(&change) {
            debug!(grant = %change.grant, kind = ?change.kind, "Grant change had no effect");
            return;
        }
        state.revision += 1;
        let revision = state.revision;

        // Readers may proceed while events fan out
        let state = RwLockWriteGuard::downgrade(state);
        debug!(grant = %change.grant, kind = ?change.kind, revision, "Applied grant change");
        self.mux.grant_changed(&change, &state.index, revision);
    }

    fn apply_grant_snapshot(&mut self, grants: Vec<Grant>) {
        let mut state = self.shared.state.write();
        state.index.replace_grants(grants);
        *state.feed(Feed::Grants) = FeedHealth::default();
        state.revision += 1;
        let revision = state.revision;

        let state = RwLockWriteGuard::downgrade(state);
        info!(grants = state.index.grant_count(), revision, "Grants resynchronized");
        self.mux.resync_all(&state.index, revision);
    }

    fn apply_project(&mut self, change: ProjectChange) {
        let mut state = self.shared.state.write();

        match change {
            ProjectChange::Created(project) | ProjectChange::Updated(project) => {
                let project = Arc::new(project);
                let upsert = state.index.upsert_project(project.clone());
                if upsert == ProjectUpsert::Stale {
                    debug!(project = %project.name, revision = project.revision, "Ignoring stale project change");
                    return;
                }
                state.revision += 1;
                let revision = state.revision;

                let state = RwLockWriteGuard::downgrade(state);
                self.mux.project_upserted(&project, upsert, &state.index, revision);
            }
            ProjectChange::Deleted(project) => {
                let subjects = state.index.subjects_for(&project.name);
                if state.index.remove_project(&project.name).is_none() {
                    return;
                }
                state.revision += 1;
                let revision = state.revision;

                drop(state);
                self.mux.project_removed(&Arc::new(project), &subjects, revision);
            }
        }
    }

    fn apply_project_snapshot(&mut self, projects: Vec<Project>) {
        let mut state = self.shared.state.write();

        let listed: HashSet<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        let gone: Vec<String> = state
            .index
            .projects()
            .filter(|p| !listed.contains(p.name.as_str()))
            .map(|p| p.name.clone())
            .collect();
        for name in &gone {
            state.index.remove_project(name);
        }
        for project in projects {
            state.index.upsert_project(Arc::new(project));
        }

        *state.feed(Feed::Projects) = FeedHealth::default();
        state.revision += 1;
        let revision = state.revision;

        let state = RwLockWriteGuard::downgrade(state);
        info!(
            projects = state.index.project_count(),
            removed = gone.len(),
            revision,
            "Projects resynchronized"
        );
        self.mux.resync_all(&state.index, revision);
    }

    fn feed_lost(&mut self, feed: Feed) {
        let mut state = self.shared.state.write();
        state.feed(feed).lost = true;
        warn!(feed = feed.as_str(), "Change feed lost, serving stale answers until resync");
    }

    fn resync_failed(&mut self, feed: Feed, attempts: u32, error: StorageError) {
        let mut state = self.shared.state.write();
        let max_failures = state.max_failures;
        let health = state.feed(feed);
        health.lost = true;
        health.failures = attempts;
        health.last_error = Some(error.to_string());

        if attempts >= max_failures {
            error!(feed = feed.as_str(), attempts, error = %error, "Resync keeps failing, cache degraded");
        } else {
            warn!(feed = feed.as_str(), attempts, error = %error, "Resync failed");
        }
    }

    fn subscribe(
        &mut self,
        principal: Principal,
        restriction: ScopeRestriction,
        include_existing: bool,
        reply: oneshot::Sender<Result<Registered, CacheError>>,
    ) {
        let state = self.shared.state.read();
        if let Some(reason) = state.degraded_reason() {
            let _ = reply.send(Err(CacheError::Degraded(reason)));
            return;
        }

        let registered = self
            .mux
            .register(principal, restriction, include_existing, &state.index, state.revision);
        drop(state);

        let id = registered.id;
        if reply.send(Ok(registered)).is_err() {
            // caller went away before the handle was built
            self.mux.unregister(id, CloseReason::Cancelled);
        }
    }

    fn stop(&mut self) {
        let mut state = self.shared.state.write();
        if state.stopped {
            return;
        }
        state.stopped = true;
        drop(state);

        let watchers = self.mux.len();
        self.mux.close_all(CloseReason::CacheStopped);
        self.shared.watchers.store(0, Ordering::Relaxed);
        info!(watchers, "Authorization cache stopped");
    }
}

async fn resync_grants(store: &dyn GrantStore) -> Result<(GrantFeed, Vec<Grant>), StorageError> {
    let feed = store.watch_grants().await?;
    let grants = store.list_grants().await?;
    Ok((feed, grants))
}

async fn resync_projects(store: &dyn ProjectStore) -> Result<(ProjectFeed, Vec<Project>), StorageError> {
    let feed = store.watch_projects().await?;
    let projects = store.list().await?;
    Ok((feed, projects))
}

/// Forward grant feed events onto the command queue, resynchronizing
/// whenever the feed is lost
async fn pump_grants(
    store: Arc<dyn GrantStore>,
    commands: mpsc::UnboundedSender<Command>,
    config: CacheConfig,
    initial: GrantFeed,
) {
    let mut feed = Some(initial);
    let mut attempts: u32 = 0;

    loop {
        let mut current = match feed.take() {
            Some(current) => current,
            None => match resync_grants(store.as_ref()).await {
                Ok((current, grants)) => {
                    attempts = 0;
                    if commands.send(Command::GrantSnapshot(grants)).is_err() {
                        return;
                    }
                    current
                }
                Err(error) => {
                    attempts = attempts.saturating_add(1);
                    if commands.send(Command::GrantResyncFailed { attempts, error }).is_err() {
                        return;
                    }
                    tokio::time::sleep(config.backoff_for(attempts)).await;
                    continue;
                }
            },
        };

        while let Some(event) = current.next().await {
            let command = match event {
                GrantFeedEvent::Added(grant) => Command::Grant(GrantChange::added(grant)),
                GrantFeedEvent::Removed(grant) => Command::Grant(GrantChange::removed(grant)),
                GrantFeedEvent::Disconnected => break,
            };
            if commands.send(command).is_err() {
                return;
            }
        }
        drop(current);

        if commands.send(Command::GrantFeedLost).is_err() {
            return;
        }
        tokio::time::sleep(config.backoff_for(0)).await;
    }
}

/// Forward project feed events onto the command queue, relisting whenever
/// the feed lags or ends
async fn pump_projects(
    store: Arc<dyn ProjectStore>,
    commands: mpsc::UnboundedSender<Command>,
    config: CacheConfig,
    initial: ProjectFeed,
) {
    let mut feed = Some(initial);
    let mut attempts: u32 = 0;

    loop {
        let mut current = match feed.take() {
            Some(current) => current,
            None => match resync_projects(store.as_ref()).await {
                Ok((current, projects)) => {
                    attempts = 0;
                    if commands.send(Command::ProjectSnapshot(projects)).is_err() {
                        return;
                    }
                    current
                }
                Err(error) => {
                    attempts = attempts.saturating_add(1);
                    if commands.send(Command::ProjectResyncFailed { attempts, error }).is_err() {
                        return;
                    }
                    tokio::time::sleep(config.backoff_for(attempts)).await;
                    continue;
                }
            },
        };

        while let Some(event) = current.next().await {
            match event {
                ProjectFeedEvent::Change(change) => {
                    if commands.send(Command::Project(change)).is_err() {
                        return;
                    }
                }
                ProjectFeedEvent::Lagged => break,
            }
        }
        drop(current);

        if commands.send(Command::ProjectFeedLost).is_err() {
            return;
        }
        tokio::time::sleep(config.backoff_for(0)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryGrantStore, MemoryProjectStore};
    use std::time::Duration;

    fn alice() -> Principal {
        Principal::new("alice", ["dev"])
    }

    async fn start(grants: Arc<MemoryGrantStore>, projects: Arc<MemoryProjectStore>) -> AuthorizationCache {
        let config = CacheConfig::new().resync_backoff(Duration::from_millis(5), Duration::from_millis(20));
        AuthorizationCache::start(config, grants, projects).await.unwrap()
    }

    #[tokio::test]
    async fn test_initial_load_answers_queries() {
        let grants = Arc::new(MemoryGrantStore::new().with_grants([Grant::user_project("alice", "a", "view")]));
        let projects = Arc::new(MemoryProjectStore::new().with_projects([Project::new("a"), Project::new("b")]));
        let cache = start(grants, projects).await;

        let visible = cache.list_visible(&alice(), &ScopeRestriction::Unrestricted).unwrap();
        assert_eq!(visible.names(), vec!["a"]);
        assert!(!visible.stale);
        assert_eq!(cache.health(), CacheHealth::Fresh);
        assert_eq!(cache.grant_count(), 1);
        assert_eq!(cache.project_count(), 2);
    }

    #[tokio::test]
    async fn test_flush_orders_after_feed_events() {
        let grants = Arc::new(MemoryGrantStore::new());
        let projects = Arc::new(MemoryProjectStore::new().with_projects([Project::new("a")]));
        let cache = start(grants.clone(), projects).await;

        grants.add_grant(&Grant::group_project("dev", "a", "view")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while cache.list_visible(&alice(), &ScopeRestriction::Unrestricted).unwrap().projects.is_empty() {
                cache.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(cache.revision(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_queries_and_subscriptions() {
        let cache = start(Arc::new(MemoryGrantStore::new()), Arc::new(MemoryProjectStore::new())).await;
        cache.shutdown().await;

        assert_eq!(cache.health(), CacheHealth::Stopped);
        assert_eq!(
            cache.list_visible(&alice(), &ScopeRestriction::Unrestricted).unwrap_err(),
            CacheError::Stopped
        );
        assert_eq!(
            cache
                .subscribe(alice(), ScopeRestriction::Unrestricted, false)
                .await
                .unwrap_err(),
            CacheError::Stopped
        );
    }

    #[tokio::test]
    async fn test_start_fails_when_store_unavailable() {
        let grants = Arc::new(MemoryGrantStore::new());
        grants.set_available(false);
        let result = AuthorizationCache::start(CacheConfig::new(), grants, Arc::new(MemoryProjectStore::new())).await;
        assert!(matches!(result, Err(CacheError::Storage(StorageError::Unavailable(_)))));
    }
}
