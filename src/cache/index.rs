//! Visibility index
//!
//! Two-level lookup: grants are indexed per subject key (direct project grants
//! and cluster grants separately) and merged against the known project set at
//! query time. Nothing is materialized per principal, so a grant change only
//! touches the entries of its own subject and target.

use crate::auth::{Grant, GrantChange, GrantChangeKind, GrantSubject, GrantTarget, Principal};
use crate::projects::Project;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// What an upsert did to the project set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectUpsert {
    Created,
    Updated,
    /// Revision not newer than the one already held; ignored
    Stale,
}

#[derive(Debug, Default, Clone)]
pub struct VisibilityIndex {
    grants: HashSet<Grant>,
    /// subject -> project -> number of grants supporting it
    direct: HashMap<GrantSubject, HashMap<String, usize>>,
    /// subject -> number of cluster-scope grants
    cluster: HashMap<GrantSubject, usize>,
    /// project -> subjects holding at least one direct grant on it
    grantees: HashMap<String, HashSet<GrantSubject>>,
    projects: BTreeMap<String, Arc<Project>>,
}

impl VisibilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one grant change; returns false if it was already reflected
    pub fn apply_grant_change(&mut self, change: &GrantChange) -> bool {
        match change.kind {
            GrantChangeKind::Added => self.add_grant(&change.grant),
            GrantChangeKind::Removed => self.remove_grant(&change.grant),
        }
    }

    fn add_grant(&mut self, grant: &Grant) -> bool {
        if !self.grants.insert(grant.clone()) {
            return false;
        }

        match &grant.target {
            GrantTarget::Cluster => {
                *self.cluster.entry(grant.subject.clone()).or_default() += 1;
            }
            GrantTarget::Project(project) => {
                let count = self
                    .direct
                    .entry(grant.subject.clone())
                    .or_default()
                    .entry(project.clone())
                    .or_default();
                *count += 1;
                if *count == 1 {
                    self.grantees
                        .entry(project.clone())
                        .or_default()
                        .insert(grant.subject.clone());
                }
            }
        }
        true
    }

    fn remove_grant(&mut self, grant: &Grant) -> bool {
        if !self.grants.remove(grant) {
            return false;
        }

        match &grant.target {
            GrantTarget::Cluster => {
                if let Some(count) = self.cluster.get_mut(&grant.subject) {
                    *count -= 1;
                    if *count == 0 {
                        self.cluster.remove(&grant.subject);
                    }
                }
            }
            GrantTarget::Project(project) => {
                let Some(projects) = self.direct.get_mut(&grant.subject) else {
                    return true;
                };
                if let Some(count) = projects.get_mut(project) {
                    *count -= 1;
                    if *count == 0 {
                        projects.remove(project);
                        if let Some(subjects) = self.grantees.get_mut(project) {
                            subjects.remove(&grant.subject);
                            if subjects.is_empty() {
                                self.grantees.remove(project);
                            }
                        }
                    }
                }
                if projects.is_empty() {
                    self.direct.remove(&grant.subject);
                }
            }
        }
        true
    }

    /// Replace the whole grant set (full resynchronization)
    pub fn replace_grants(&mut self, grants: impl IntoIterator<Item = Grant>) {
        self.grants.clear();
        self.direct.clear();
        self.cluster.clear();
        self.grantees.clear();
        for grant in grants {
            self.add_grant(&grant);
        }
    }

    /// Insert or update a project; older or equal revisions are ignored
    pub fn upsert_project(&mut self, project: Arc<Project>) -> ProjectUpsert {
        match self.projects.get(&project.name) {
            Some(existing) if existing.revision >= project.revision => ProjectUpsert::Stale,
            Some(_) => {
                self.projects.insert(project.name.clone(), project);
                ProjectUpsert::Updated
            }
            None => {
                self.projects.insert(project.name.clone(), project);
                ProjectUpsert::Created
            }
        }
    }

    pub fn remove_project(&mut self, name: &str) -> Option<Arc<Project>> {
        self.projects.remove(name)
    }

    pub fn project(&self, name: &str) -> Option<&Arc<Project>> {
        self.projects.get(name)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Arc<Project>> {
        self.projects.values()
    }

    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    fn has_cluster_grant(&self, principal: &Principal) -> bool {
        principal
            .subjects()
            .iter()
            .any(|subject| self.cluster.contains_key(subject))
    }

    /// Every existing project the principal can see, by name
    pub fn visible_projects(&self, principal: &Principal) -> BTreeSet<String> {
        if self.has_cluster_grant(principal) {
            return self.projects.keys().cloned().collect();
        }

        let mut visible = BTreeSet::new();
        for subject in principal.subjects() {
            if let Some(projects) = self.direct.get(&subject) {
                visible.extend(
                    projects
                        .keys()
                        .filter(|name| self.projects.contains_key(*name))
                        .cloned(),
                );
            }
        }
        visible
    }

    pub fn is_visible(&self, principal: &Principal, project: &str) -> bool {
        if !self.projects.contains_key(project) {
            return false;
        }
        principal.subjects().iter().any(|subject| {
            self.cluster.contains_key(subject)
                || self
                    .direct
                    .get(subject)
                    .is_some_and(|projects| projects.contains_key(project))
        })
    }

    /// Subjects that could see `project`: its direct grantees plus every
    /// holder of a cluster-scope grant
    pub fn subjects_for(&self, project: &str) -> HashSet<GrantSubject> {
        let mut subjects: HashSet<GrantSubject> = self.cluster.keys().cloned().collect();
        if let Some(direct) = self.grantees.get(project) {
            subjects.extend(direct.iter().cloned());
        }
        subjects
    }
}
