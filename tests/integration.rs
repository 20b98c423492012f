//! Integration tests for the authorization cache
//!
//! These drive the cache through the in-memory stores, the same way the
//! server does, and observe results through queries and watchers.

use projectauth::auth::{Grant, Principal, ScopeRestriction};
use projectauth::cache::{AuthorizationCache, CacheConfig, CloseReason, EventKind, ProjectWatcher, WatcherState};
use projectauth::projects::Project;
use projectauth::storage::{GrantFeedEvent, GrantStore, MemoryGrantStore, MemoryProjectStore, ProjectStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct Harness {
    cache: AuthorizationCache,
    grants: Arc<MemoryGrantStore>,
    projects: Arc<MemoryProjectStore>,
}

async fn harness(config: CacheConfig, grants: Vec<Grant>, projects: &[&str]) -> Harness {
    let grants = Arc::new(MemoryGrantStore::new().with_grants(grants));
    let projects = Arc::new(MemoryProjectStore::new().with_projects(projects.iter().map(|p| Project::new(*p))));
    let cache = AuthorizationCache::start(config, grants.clone(), projects.clone())
        .await
        .unwrap();
    Harness { cache, grants, projects }
}

fn alice() -> Principal {
    Principal::new("alice", ["dev"])
}

fn visible(cache: &AuthorizationCache, principal: &Principal) -> Vec<String> {
    cache
        .list_visible(principal, &ScopeRestriction::Unrestricted)
        .unwrap()
        .projects
        .iter()
        .map(|p| p.name.clone())
        .collect()
}

async fn next_event(watcher: &mut ProjectWatcher) -> (EventKind, String) {
    let event = timeout(Duration::from_secs(2), watcher.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watcher closed unexpectedly");
    (event.kind, event.name().to_string())
}

async fn eventually<F: FnMut() -> bool>(mut check: F) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_alice_group_grant_and_revocation() {
    let h = harness(
        CacheConfig::new(),
        vec![Grant::user_project("alice", "a", "view")],
        &["a", "b"],
    )
    .await;
    assert_eq!(visible(&h.cache, &alice()), vec!["a"]);

    let mut watcher = h
        .cache
        .subscribe(alice(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();
    assert_eq!(watcher.state(), WatcherState::Streaming);

    h.grants.add_grant(&Grant::group_project("dev", "b", "view")).await.unwrap();
    assert_eq!(next_event(&mut watcher).await, (EventKind::Added, "b".to_string()));
    assert_eq!(visible(&h.cache, &alice()), vec!["a", "b"]);

    h.grants.remove_grant(&Grant::user_project("alice", "a", "view")).await.unwrap();
    assert_eq!(next_event(&mut watcher).await, (EventKind::Deleted, "a".to_string()));
    assert_eq!(visible(&h.cache, &alice()), vec!["b"]);

    // Other users are unaffected
    assert!(visible(&h.cache, &Principal::user("bob")).is_empty());
}

#[tokio::test]
async fn test_include_existing_replays_baseline_first() {
    let h = harness(
        CacheConfig::new(),
        vec![
            Grant::user_project("alice", "a", "view"),
            Grant::group_project("dev", "b", "view"),
            Grant::user_project("alice", "c", "edit"),
        ],
        &["a", "b", "c", "d"],
    )
    .await;

    let mut watcher = h
        .cache
        .subscribe(alice(), ScopeRestriction::Unrestricted, true)
        .await
        .unwrap();

    // Live change queued right after registration
    h.grants.add_grant(&Grant::user_project("alice", "d", "view")).await.unwrap();

    let mut baseline = BTreeSet::new();
    for _ in 0..3 {
        let (kind, name) = next_event(&mut watcher).await;
        assert_eq!(kind, EventKind::Added);
        assert!(baseline.insert(name), "baseline repeated a project");
    }
    let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(baseline, expected);

    assert_eq!(next_event(&mut watcher).await, (EventKind::Added, "d".to_string()));
}

#[tokio::test]
async fn test_cluster_grant_covers_new_projects() {
    let h = harness(CacheConfig::new(), vec![Grant::group_cluster("ops", "admin")], &["a"]).await;
    let carol = Principal::new("carol", ["ops"]);
    assert_eq!(visible(&h.cache, &carol), vec!["a"]);

    let mut watcher = h
        .cache
        .subscribe(carol.clone(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();

    h.projects.create(Project::new("fresh")).await.unwrap();
    assert_eq!(next_event(&mut watcher).await, (EventKind::Added, "fresh".to_string()));
    assert_eq!(visible(&h.cache, &carol), vec!["a", "fresh"]);
}

#[tokio::test]
async fn test_cluster_grant_revocation_deletes_every_project() {
    let h = harness(CacheConfig::new(), vec![], &["a", "b"]).await;
    let mut watcher = h
        .cache
        .subscribe(alice(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();

    h.grants.add_grant(&Grant::group_cluster("dev", "view")).await.unwrap();
    h.grants.remove_grant(&Grant::group_cluster("dev", "view")).await.unwrap();

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(next_event(&mut watcher).await);
    }
    assert_eq!(
        events,
        vec![
            (EventKind::Added, "a".to_string()),
            (EventKind::Added, "b".to_string()),
            (EventKind::Deleted, "a".to_string()),
            (EventKind::Deleted, "b".to_string()),
        ]
    );
    assert!(visible(&h.cache, &alice()).is_empty());
}

#[tokio::test]
async fn test_remaining_grant_keeps_project_visible() {
    let h = harness(
        CacheConfig::new(),
        vec![
            Grant::user_project("alice", "a", "view"),
            Grant::group_project("dev", "a", "view"),
        ],
        &["a", "b"],
    )
    .await;

    let mut watcher = h
        .cache
        .subscribe(alice(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();

    h.grants.remove_grant(&Grant::user_project("alice", "a", "view")).await.unwrap();
    h.grants.add_grant(&Grant::user_project("alice", "b", "view")).await.unwrap();

    // The revocation produced nothing; the next event is the new grant
    assert_eq!(next_event(&mut watcher).await, (EventKind::Added, "b".to_string()));
    assert_eq!(visible(&h.cache, &alice()), vec!["a", "b"]);
}

#[tokio::test]
async fn test_project_update_and_delete_reach_watchers() {
    let h = harness(CacheConfig::new(), vec![Grant::user_cluster("alice", "view")], &["a"]).await;
    let mut watcher = h
        .cache
        .subscribe(alice(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();

    let current = h.projects.get("a").await.unwrap();
    let updated = h
        .projects
        .update(current.with_label("tier", "front"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), watcher.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Modified);
    assert_eq!(event.project.revision, updated.revision);
    assert_eq!(event.project.labels.get("tier").map(String::as_str), Some("front"));

    h.projects.delete("a").await.unwrap();
    assert_eq!(next_event(&mut watcher).await, (EventKind::Deleted, "a".to_string()));
    assert!(visible(&h.cache, &alice()).is_empty());
}

#[tokio::test]
async fn test_grant_for_future_project() {
    let h = harness(
        CacheConfig::new(),
        vec![Grant::user_project("alice", "later", "view")],
        &[],
    )
    .await;
    assert!(visible(&h.cache, &alice()).is_empty());

    let mut watcher = h
        .cache
        .subscribe(alice(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();

    h.projects.create(Project::new("later")).await.unwrap();
    assert_eq!(next_event(&mut watcher).await, (EventKind::Added, "later".to_string()));
}

#[tokio::test]
async fn test_scope_restriction_narrows_watch() {
    let h = harness(CacheConfig::new(), vec![], &["a", "b"]).await;
    let only_b = ScopeRestriction::from_scopes(&["role:view:b"]);

    let mut watcher = h.cache.subscribe(alice(), only_b.clone(), false).await.unwrap();

    h.grants.add_grant(&Grant::user_project("alice", "a", "view")).await.unwrap();
    h.grants.add_grant(&Grant::user_project("alice", "b", "view")).await.unwrap();

    assert_eq!(next_event(&mut watcher).await, (EventKind::Added, "b".to_string()));
    let names: Vec<String> = h
        .cache
        .list_visible(&alice(), &only_b)
        .unwrap()
        .projects
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(names, vec!["b"]);
}

#[tokio::test]
async fn test_duplicate_grant_events_are_ignored() {
    let grant = Grant::user_project("alice", "a", "view");
    let h = harness(CacheConfig::new(), vec![grant.clone()], &["a", "b"]).await;
    let mut watcher = h
        .cache
        .subscribe(alice(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();

    let before = h.cache.revision();
    h.grants.replay(GrantFeedEvent::Added(grant.clone()));
    h.grants.replay(GrantFeedEvent::Added(grant));
    h.grants.add_grant(&Grant::user_project("alice", "b", "view")).await.unwrap();

    // Only the genuine change is delivered and counted
    assert_eq!(next_event(&mut watcher).await, (EventKind::Added, "b".to_string()));
    assert_eq!(h.cache.flush().await.unwrap(), before + 1);
    assert!(watcher.try_recv().is_none());
}

#[tokio::test]
async fn test_bob_overflow_requires_resync() {
    let h = harness(
        CacheConfig::new().watch_buffer(2),
        vec![],
        &["p1", "p2", "p3"],
    )
    .await;
    let bob = Principal::user("bob");
    let carol = Principal::user("carol");

    let mut slow = h
        .cache
        .subscribe(bob.clone(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();
    let mut healthy = h
        .cache
        .subscribe(carol.clone(), ScopeRestriction::Unrestricted, false)
        .await
        .unwrap();

    for project in ["p1", "p2", "p3"] {
        h.grants.add_grant(&Grant::user_project("bob", project, "view")).await.unwrap();
    }
    h.grants.add_grant(&Grant::user_project("carol", "p1", "view")).await.unwrap();

    eventually(|| slow.close_reason() == Some(CloseReason::ResyncRequired)).await;

    // Buffered events are still delivered, then the stream ends
    let mut drained = 0;
    while let Ok(Some(_)) = timeout(Duration::from_secs(1), slow.recv()).await {
        drained += 1;
    }
    assert_eq!(drained, 2);
    assert_eq!(slow.state(), WatcherState::Closed(CloseReason::ResyncRequired));

    // Other watchers keep streaming
    assert_eq!(next_event(&mut healthy).await, (EventKind::Added, "p1".to_string()));
    assert_eq!(healthy.state(), WatcherState::Streaming);

    // A fresh baseline matches the list answer
    let mut again = h
        .cache
        .subscribe(bob.clone(), ScopeRestriction::Unrestricted, true)
        .await
        .unwrap();
    let mut baseline = Vec::new();
    for _ in 0..3 {
        let (kind, name) = next_event(&mut again).await;
        assert_eq!(kind, EventKind::Added);
        baseline.push(name);
    }
    baseline.sort();
    assert_eq!(baseline, visible(&h.cache, &bob));
}

#[tokio::test]
async fn test_watcher_count_tracks_registrations() {
    let h = harness(CacheConfig::new(), vec![], &[]).await;

    let first = h.cache.subscribe(alice(), ScopeRestriction::Unrestricted, false).await.unwrap();
    let second = h.cache.subscribe(alice(), ScopeRestriction::Unrestricted, false).await.unwrap();
    h.cache.flush().await.unwrap();
    assert_eq!(h.cache.watcher_count(), 2);

    h.cache.unsubscribe(first.id());
    h.cache.flush().await.unwrap();
    assert_eq!(h.cache.watcher_count(), 1);
    assert_eq!(first.close_reason(), Some(CloseReason::Cancelled));

    drop(second);
    h.cache.flush().await.unwrap();
    assert_eq!(h.cache.watcher_count(), 0);
}
