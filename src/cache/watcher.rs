//! Caller-side watch handles

use crate::cache::Command;
use crate::projects::Project;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type WatcherId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => write!(f, "ADDED"),
            EventKind::Modified => write!(f, "MODIFIED"),
            EventKind::Deleted => write!(f, "DELETED"),
        }
    }
}

/// One event in a watcher's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub project: Arc<Project>,
    /// Cache revision of the change that produced this event
    pub revision: u64,
}

impl WatchEvent {
    pub fn name(&self) -> &str {
        &self.project.name
    }
}

/// Why a watcher stopped streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The caller stopped or dropped the watcher
    Cancelled,
    /// The delivery buffer overflowed; the caller must re-watch from a fresh baseline
    ResyncRequired,
    /// The cache shut down
    CacheStopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Cancelled => write!(f, "watch cancelled"),
            CloseReason::ResyncRequired => write!(f, "missed events, resync required"),
            CloseReason::CacheStopped => write!(f, "cache stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Registering,
    Streaming,
    Closed(CloseReason),
}

/// State shared between a registration and its handle
#[derive(Debug)]
pub(crate) struct WatcherStatus {
    state: Mutex<WatcherState>,
}

impl WatcherStatus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WatcherState::Registering),
        })
    }

    pub(crate) fn get(&self) -> WatcherState {
        *self.state.lock()
    }

    pub(crate) fn start_streaming(&self) {
        let mut state = self.state.lock();
        if *state == WatcherState::Registering {
            *state = WatcherState::Streaming;
        }
    }

    /// Move to `Closed`; the first reason wins
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, WatcherState::Closed(_)) {
            return false;
        }
        *state = WatcherState::Closed(reason);
        true
    }
}

/// What the processing loop hands back for a new registration
pub(crate) struct Registered {
    pub id: WatcherId,
    pub events: mpsc::Receiver<WatchEvent>,
    pub status: Arc<WatcherStatus>,
    /// Projects visible to the watcher at registration
    pub initial: Vec<Arc<Project>>,
}

/// A live watch on one principal's visible projects
///
/// Events are buffered up to the configured capacity. Once the watcher is
/// closed the remaining buffered events are still delivered, after which
/// [`ProjectWatcher::recv`] returns `None` and [`ProjectWatcher::close_reason`]
/// tells why. Dropping the handle unregisters it.
pub struct ProjectWatcher {
    id: WatcherId,
    events: mpsc::Receiver<WatchEvent>,
    status: Arc<WatcherStatus>,
    initial: Vec<Arc<Project>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ProjectWatcher {
    pub(crate) fn new(registered: Registered, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id: registered.id,
            events: registered.events,
            status: registered.status,
            initial: registered.initial,
            commands,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Projects the watcher could see when it was registered, in the same
    /// step as registration. Every later event is relative to this set.
    /// Returns an empty list after the first call.
    pub fn take_initial(&mut self) -> Vec<Arc<Project>> {
        std::mem::take(&mut self.initial)
    }

    /// Next event, or `None` once the watcher is closed and drained
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }

    pub fn state(&self) -> WatcherState {
        self.status.get()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.status.get() {
            WatcherState::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Ask the cache to unregister this watcher. Idempotent.
    pub fn stop(&self) {
        if matches!(self.status.get(), WatcherState::Closed(_)) {
            return;
        }
        let _ = self.commands.send(Command::Unsubscribe(self.id));
    }
}

impl Stream for ProjectWatcher {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ProjectWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectWatcher")
            .field("id", &self.id)
            .field("state", &self.status.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let status = WatcherStatus::new();
        assert_eq!(status.get(), WatcherState::Registering);

        status.start_streaming();
        assert_eq!(status.get(), WatcherState::Streaming);

        assert!(status.close(CloseReason::ResyncRequired));
        assert!(!status.close(CloseReason::CacheStopped));
        assert_eq!(status.get(), WatcherState::Closed(CloseReason::ResyncRequired));

        status.start_streaming();
        assert_eq!(status.get(), WatcherState::Closed(CloseReason::ResyncRequired));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::ResyncRequired.to_string(), "missed events, resync required");
        assert_eq!(EventKind::Deleted.to_string(), "DELETED");
    }
}
