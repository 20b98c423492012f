//! Watch fan-out
//!
//! Owns every watcher registration. Each registration tracks the set of
//! projects its watcher currently believes it can see (with the last
//! delivered project revision), and every raw change is turned into the
//! difference against that set. Only the processing loop calls into this
//! module, so it needs no locking of its own.

use crate::auth::{GrantChange, GrantSubject, GrantTarget, Principal, ScopeRestriction};
use crate::cache::index::{ProjectUpsert, VisibilityIndex};
use crate::cache::watcher::{CloseReason, EventKind, Registered, WatchEvent, WatcherId, WatcherStatus};
use crate::projects::Project;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};
use uuid::Uuid;

struct Registration {
    principal: Principal,
    restriction: ScopeRestriction,
    tx: mpsc::Sender<WatchEvent>,
    status: Arc<WatcherStatus>,
    /// project -> project revision last delivered
    visible: HashMap<String, u64>,
    /// cache revision of the last delivered event
    last_revision: u64,
}

enum Delivery {
    Delivered,
    Overflow,
    Gone,
}

impl Registration {
    fn allows(&self, index: &VisibilityIndex, project: &str) -> bool {
        self.restriction.allows(project) && index.is_visible(&self.principal, project)
    }

    fn send(&mut self, kind: EventKind, project: Arc<Project>, revision: u64) -> Delivery {
        match kind {
            EventKind::Deleted => {
                self.visible.remove(&project.name);
            }
            EventKind::Added | EventKind::Modified => {
                self.visible.insert(project.name.clone(), project.revision);
            }
        }
        self.last_revision = revision;

        match self.tx.try_send(WatchEvent { kind, project, revision }) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Overflow,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Bring this watcher's view of one project in line with the index
    fn reconcile_one(&mut self, index: &VisibilityIndex, name: &str, revision: u64) -> Delivery {
        let allowed = self.allows(index, name);
        match (allowed, self.visible.contains_key(name)) {
            (true, false) => match index.project(name) {
                Some(project) => self.send(EventKind::Added, project.clone(), revision),
                None => Delivery::Delivered,
            },
            (false, true) => {
                let project = index
                    .project(name)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(Project::new(name)));
                self.send(EventKind::Deleted, project, revision)
            }
            _ => Delivery::Delivered,
        }
    }

    /// Bring this watcher's whole view in line with the index
    fn reconcile_all(&mut self, index: &VisibilityIndex, revision: u64) -> Delivery {
        let now = self.restriction.restrict(&index.visible_projects(&self.principal));

        let mut gone: Vec<String> = self
            .visible
            .keys()
            .filter(|name| !now.contains(*name))
            .cloned()
            .collect();
        gone.sort();
        for name in gone {
            let project = index
                .project(&name)
                .cloned()
                .unwrap_or_else(|| Arc::new(Project::new(name.as_str())));
            if let outcome @ (Delivery::Overflow | Delivery::Gone) =
                self.send(EventKind::Deleted, project, revision)
            {
                return outcome;
            }
        }

        for name in &now {
            let Some(project) = index.project(name) else {
                continue;
            };
            let kind = match self.visible.get(name) {
                None => EventKind::Added,
                Some(seen) if *seen < project.revision => EventKind::Modified,
                Some(_) => continue,
            };
            if let outcome @ (Delivery::Overflow | Delivery::Gone) = self.send(kind, project.clone(), revision) {
                return outcome;
            }
        }
        Delivery::Delivered
    }
}

/// Fans raw grant and project changes out to per-watcher event streams
pub struct WatchMultiplexer {
    watchers: HashMap<WatcherId, Registration>,
    by_subject: HashMap<GrantSubject, HashSet<WatcherId>>,
    buffer: usize,
}

impl WatchMultiplexer {
    pub fn new(buffer: usize) -> Self {
        Self {
            watchers: HashMap::new(),
            by_subject: HashMap::new(),
            buffer: buffer.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Register a watcher against the current index
    ///
    /// With `include_existing`, one `Added` per visible project is queued before
    /// anything else; the buffer is sized so that baseline always fits.
    pub(crate) fn register(
        &mut self,
        principal: Principal,
        restriction: ScopeRestriction,
        include_existing: bool,
        index: &VisibilityIndex,
        revision: u64,
    ) -> Registered {
        let id = Uuid::new_v4();
        let names = restriction.restrict(&index.visible_projects(&principal));
        let baseline: Vec<Arc<Project>> = names.iter().filter_map(|n| index.project(n).cloned()).collect();

        let capacity = if include_existing {
            self.buffer + baseline.len()
        } else {
            self.buffer
        };
        let (tx, events) = mpsc::channel(capacity);
        let status = WatcherStatus::new();

        let mut registration = Registration {
            principal,
            restriction,
            tx,
            status: status.clone(),
            visible: baseline.iter().map(|p| (p.name.clone(), p.revision)).collect(),
            last_revision: revision,
        };

        if include_existing {
            for project in &baseline {
                // capacity reserved above
                let _ = registration.send(EventKind::Added, project.clone(), revision);
            }
        }

        for subject in registration.principal.subjects() {
            self.by_subject.entry(subject).or_default().insert(id);
        }

        debug!(
            watcher_id = %id,
            principal = %registration.principal,
            visible = registration.visible.len(),
            include_existing,
            "Watcher registered"
        );

        status.start_streaming();
        self.watchers.insert(id, registration);

        Registered {
            id,
            events,
            status,
            initial: baseline,
        }
    }

    /// Remove a registration; returns false if it was already gone
    pub fn unregister(&mut self, id: WatcherId, reason: CloseReason) -> bool {
        let Some(registration) = self.watchers.remove(&id) else {
            return false;
        };

        for subject in registration.principal.subjects() {
            if let Some(ids) = self.by_subject.get_mut(&subject) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_subject.remove(&subject);
                }
            }
        }

        registration.status.close(reason);
        match reason {
            CloseReason::ResyncRequired => info!(
                watcher_id = %id,
                principal = %registration.principal,
                last_revision = registration.last_revision,
                "Watcher buffer full, closing"
            ),
            _ => debug!(watcher_id = %id, reason = %reason, "Watcher closed"),
        }
        true
    }

    /// Close every watcher, e.g. on shutdown
    pub fn close_all(&mut self, reason: CloseReason) {
        let ids: Vec<WatcherId> = self.watchers.keys().copied().collect();
        for id in ids {
            self.unregister(id, reason);
        }
    }

    fn watchers_for<'a>(&self, subjects: impl IntoIterator<Item = &'a GrantSubject>) -> Vec<WatcherId> {
        let mut ids: HashSet<WatcherId> = HashSet::new();
        for subject in subjects {
            if let Some(found) = self.by_subject.get(subject) {
                ids.extend(found.iter().copied());
            }
        }
        ids.into_iter().collect()
    }

    fn settle(&mut self, outcomes: Vec<(WatcherId, Delivery)>) {
        for (id, outcome) in outcomes {
            match outcome {
                Delivery::Delivered => {}
                Delivery::Overflow => {
                    self.unregister(id, CloseReason::ResyncRequired);
                }
                Delivery::Gone => {
                    self.unregister(id, CloseReason::Cancelled);
                }
            }
        }
    }

    /// A grant change has already been applied to `index`
    pub fn grant_changed(&mut self, change: &GrantChange, index: &VisibilityIndex, revision: u64) {
        let ids = self.watchers_for([&change.grant.subject]);
        let mut outcomes = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(registration) = self.watchers.get_mut(&id) else {
                continue;
            };
            let outcome = match &change.grant.target {
                GrantTarget::Cluster => registration.reconcile_all(index, revision),
                GrantTarget::Project(name) => registration.reconcile_one(index, name, revision),
            };
            outcomes.push((id, outcome));
        }
        self.settle(outcomes);
    }

    /// A project was created or updated in `index`
    pub fn project_upserted(
        &mut self,
        project: &Arc<Project>,
        upsert: ProjectUpsert,
        index: &VisibilityIndex,
        revision: u64,
    ) {
        if upsert == ProjectUpsert::Stale {
            return;
        }

        let subjects = index.subjects_for(&project.name);
        let ids = self.watchers_for(subjects.iter());
        let mut outcomes = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(registration) = self.watchers.get_mut(&id) else {
                continue;
            };
            let allowed = registration.allows(index, &project.name);
            let outcome = match (allowed, registration.visible.get(&project.name).copied()) {
                (true, None) => registration.send(EventKind::Added, project.clone(), revision),
                (true, Some(seen)) if seen < project.revision => {
                    registration.send(EventKind::Modified, project.clone(), revision)
                }
                (false, Some(_)) => registration.send(EventKind::Deleted, project.clone(), revision),
                _ => Delivery::Delivered,
            };
            outcomes.push((id, outcome));
        }
        self.settle(outcomes);
    }

    /// A project was removed; `subjects` were its possible viewers before removal
    pub fn project_removed(&mut self, project: &Arc<Project>, subjects: &HashSet<GrantSubject>, revision: u64) {
        let ids = self.watchers_for(subjects.iter());
        let mut outcomes = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(registration) = self.watchers.get_mut(&id) else {
                continue;
            };
            if registration.visible.contains_key(&project.name) {
                outcomes.push((id, registration.send(EventKind::Deleted, project.clone(), revision)));
            }
        }
        self.settle(outcomes);
    }

    /// Re-derive every watcher's view after a full resynchronization
    pub fn resync_all(&mut self, index: &VisibilityIndex, revision: u64) {
        let mut outcomes = Vec::with_capacity(self.watchers.len());
        for (id, registration) in self.watchers.iter_mut() {
            outcomes.push((*id, registration.reconcile_all(index, revision)));
        }
        self.settle(outcomes);
    }
}
