//! Connection broadcaster.
//!
//! Every live viewer session owns a bounded outbound queue. Mutations are
//! appended to every queue in generation order; each session drains its own
//! queue independently. A queue that overflows is discarded and the session is
//! marked stale: its next drain is a full snapshot instead of diffs.
//!
//! Lock order: registry (held by the caller of [`Broadcaster::publish`]) ->
//! session table -> per-session queue.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{diff::DiffEvent, error::SceneError};

/// Identifies a connected viewer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

/// Result of taking a session's pending work.
#[derive(Debug, PartialEq)]
pub enum Pending {
    Empty,
    Events(Vec<DiffEvent>),
    /// The queue was discarded (new session or overflow); a snapshot is due.
    NeedsSnapshot,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<DiffEvent>,
    stale: bool,
    closed: bool,
    resyncs: u32,
    delivered: u64,
}

/// One viewer's outbound queue.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    capacity: usize,
    queue: Mutex<QueueState>,
    notify: Notify,
}

/// Point-in-time description of a session, for status output.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub queued: usize,
    pub stale: bool,
    pub resyncs: u32,
    pub delivered: u64,
}

impl Session {
    fn new(id: SessionId, peer: Option<SocketAddr>, capacity: usize) -> Self {
        Self {
            id,
            peer,
            connected_at: Utc::now(),
            capacity: capacity.max(1),
            // A fresh session has nothing to diff against yet.
            queue: Mutex::new(QueueState {
                stale: true,
                ..QueueState::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event; returns false if this overflowed the queue.
    fn push(&self, event: &DiffEvent) -> bool {
        let mut q = self.lock();
        if q.stale || q.closed {
            return true;
        }
        if q.events.len() >= self.capacity {
            q.events.clear();
            q.stale = true;
            q.resyncs += 1;
            drop(q);
            warn!(
                session = ?self.id,
                error = %SceneError::StaleSession { session: self.id },
                "Session queue overflowed, dropping backlog"
            );
            return false;
        }
        q.events.push_back(event.clone());
        true
    }

    /// Takes everything queued so far, in generation order.
    pub fn take_pending(&self) -> Pending {
        let mut q = self.lock();
        if q.closed {
            Pending::Closed
        } else if q.stale {
            Pending::NeedsSnapshot
        } else if q.events.is_empty() {
            Pending::Empty
        } else {
            q.delivered += q.events.len() as u64;
            Pending::Events(q.events.drain(..).collect())
        }
    }

    /// Clears the stale mark after a snapshot was taken. Must be called while
    /// the registry lock is held so no event slips between snapshot and reset.
    pub fn mark_resynced(&self) -> bool {
        let mut q = self.lock();
        if q.closed || !q.stale {
            return false;
        }
        q.events.clear();
        q.stale = false;
        true
    }

    /// Wakes the session's writer.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Waits until the session is woken by a flush, a resync or a close.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    fn close(&self) {
        let mut q = self.lock();
        q.closed = true;
        q.events.clear();
        drop(q);
        self.wake();
    }

    pub fn info(&self) -> SessionInfo {
        let q = self.lock();
        SessionInfo {
            id: self.id,
            peer: self.peer,
            connected_at: self.connected_at,
            queued: q.events.len(),
            stale: q.stale,
            resyncs: q.resyncs,
            delivered: q.delivered,
        }
    }
}

/// Set of live sessions.
#[derive(Debug)]
pub struct Broadcaster {
    next_id: AtomicU32,
    capacity: usize,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session. Its first drain yields a snapshot.
    pub fn open(&self, peer: Option<SocketAddr>) -> Arc<Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, peer, self.capacity));
        self.table().insert(id, Arc::clone(&session));
        session.wake();
        info!(session = ?id, ?peer, "Session opened");
        session
    }

    /// Removes a session and discards its queue.
    pub fn close(&self, id: SessionId) -> bool {
        let Some(session) = self.table().remove(&id) else {
            return false;
        };
        session.close();
        info!(session = ?id, "Session closed");
        true
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.table().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Appends `event` to every live queue. Overflowing sessions are woken so
    /// their writers resync promptly.
    pub fn publish(&self, event: &DiffEvent) {
        for session in self.table().values() {
            if !session.push(event) {
                session.wake();
            }
        }
    }

    /// Wakes every session writer.
    pub fn flush(&self) {
        let table = self.table();
        debug!(sessions = table.len(), "Flushing sessions");
        for session in table.values() {
            session.wake();
        }
    }

    /// Sessions sorted by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.table().values().map(|s| s.info()).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete(key: &str) -> DiffEvent {
        DiffEvent::DeleteObject { key: key.into() }
    }

    #[test]
    fn new_session_needs_snapshot_first() {
        let b = Broadcaster::new(8);
        let s = b.open(None);
        b.publish(&delete("a"));
        assert_eq!(s.take_pending(), Pending::NeedsSnapshot);
        assert!(s.mark_resynced());
        assert_eq!(s.take_pending(), Pending::Empty);
    }

    #[test]
    fn events_drain_in_order() {
        let b = Broadcaster::new(8);
        let s = b.open(None);
        s.mark_resynced();
        b.publish(&delete("a"));
        b.publish(&delete("b"));
        assert_eq!(s.take_pending(), Pending::Events(vec![delete("a"), delete("b")]));
        assert_eq!(s.info().delivered, 2);
    }

    #[test]
    fn overflow_marks_only_that_session_stale() {
        let b = Broadcaster::new(2);
        let slow = b.open(None);
        let fast = b.open(None);
        slow.mark_resynced();
        fast.mark_resynced();

        b.publish(&delete("a"));
        b.publish(&delete("b"));
        assert!(matches!(fast.take_pending(), Pending::Events(ref e) if e.len() == 2));
        b.publish(&delete("c"));

        assert_eq!(slow.take_pending(), Pending::NeedsSnapshot);
        assert_eq!(slow.info().resyncs, 1);
        assert_eq!(fast.take_pending(), Pending::Events(vec![delete("c")]));
    }

    #[test]
    fn close_discards_queue() {
        let b = Broadcaster::new(4);
        let s = b.open(None);
        let id = s.id();
        assert!(b.close(id));
        assert!(!b.close(id));
        assert!(b.get(id).is_none());
        assert_eq!(s.take_pending(), Pending::Closed);
        assert!(b.is_empty());
    }
}
