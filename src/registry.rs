//! Connection registry: the single owner of live sessions.
//!
//! Maps agent identity to its active session and enforces at most one live
//! session per agent.  All mutations run under one mutex (single-writer
//! discipline), so concurrent connects, disconnects, and sweeps for the same
//! agent cannot race.  The in-memory view here is the presence tracker's
//! notion of "currently online"; durable presence rows are written by the
//! callers that hold the store handle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use crate::protocol::Frame;

/// Session identifier derived from the agent identity.
pub fn session_id_for(agent_id: &str) -> String {
    format!("session-{agent_id}")
}

/// A live session: the runtime binding between an agent identity and its
/// open connection.  Never persisted.
#[derive(Debug, Clone)]
pub struct Session {
    pub agent_id: String,
    pub session_id: String,
    /// Monotonic connection sequence number.  Cleanup paths must present a
    /// matching sequence, so a superseded session cannot tear down its
    /// replacement.
    pub conn_seq: u64,
    /// Bounded outbound channel.  Fan-out uses `try_send`: a full channel is
    /// a liveness failure of the receiving session, never a reason to block.
    pub outbound: mpsc::Sender<Frame>,
    pub last_activity: Instant,
    pub connected_at: Instant,
}

struct Inner {
    sessions: HashMap<String, Session>,
    next_conn_seq: u64,
}

/// Registry of live sessions, keyed by agent identity.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                next_conn_seq: 0,
            }),
        }
    }

    /// Insert a session for `agent_id`, superseding any existing one.
    ///
    /// Returns the new session's sequence number and the displaced session,
    /// which the caller should notify and drop.
    pub async fn register(
        &self,
        agent_id: &str,
        outbound: mpsc::Sender<Frame>,
    ) -> (u64, Option<Session>) {
        let mut inner = self.inner.lock().await;
        let conn_seq = inner.next_conn_seq;
        inner.next_conn_seq += 1;

        let now = Instant::now();
        let session = Session {
            agent_id: agent_id.to_string(),
            session_id: session_id_for(agent_id),
            conn_seq,
            outbound,
            last_activity: now,
            connected_at: now,
        };
        let superseded = inner.sessions.insert(agent_id.to_string(), session);
        (conn_seq, superseded)
    }

    /// Remove the session for `agent_id` if it still carries `conn_seq`.
    ///
    /// Returns whether a session was removed.  A stale sequence (the agent
    /// reconnected in the meantime) leaves the registry untouched.
    pub async fn unregister(&self, agent_id: &str, conn_seq: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get(agent_id) {
            Some(session) if session.conn_seq == conn_seq => {
                inner.sessions.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// Update the session's last-activity time, used by the heartbeat sweep.
    pub async fn touch(&self, agent_id: &str, conn_seq: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(agent_id) {
            if session.conn_seq == conn_seq {
                session.last_activity = Instant::now();
            }
        }
    }

    /// Snapshot of the session for `agent_id`, if one is live.
    pub async fn lookup(&self, agent_id: &str) -> Option<Session> {
        let inner = self.inner.lock().await;
        inner.sessions.get(agent_id).cloned()
    }

    /// Snapshot of every live session.
    pub async fn all(&self) -> Vec<Session> {
        let inner = self.inner.lock().await;
        inner.sessions.values().cloned().collect()
    }

    /// Number of currently connected agents.
    pub async fn online_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.online_count().await == 0
    }

    /// Fan a frame out to every live session except `from`.
    ///
    /// Delivery is `try_send` per session so one slow receiver never blocks
    /// the others.  Sessions whose outbound channel is full or closed are
    /// returned as `(agent_id, conn_seq)` pairs for the caller to evict.
    pub async fn broadcast(&self, from: &str, frame: &Frame) -> Vec<(String, u64)> {
        let inner = self.inner.lock().await;
        let mut failed = Vec::new();
        for (agent_id, session) in &inner.sessions {
            if agent_id == from {
                continue;
            }
            if session.outbound.try_send(frame.clone()).is_err() {
                failed.push((agent_id.clone(), session.conn_seq));
            }
        }
        failed
    }

    /// Sessions whose last activity is older than `max_idle`.
    pub async fn idle_sessions(&self, max_idle: Duration) -> Vec<(String, u64)> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .sessions
            .values()
            .filter(|session| now.duration_since(session.last_activity) > max_idle)
            .map(|session| (session.agent_id.clone(), session.conn_seq))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
