//! Relay server state and HTTP/WebSocket surface.
//!
//! [`RelayState`] ties the components together: the durable [`MessageStore`],
//! the [`ConnectionRegistry`], and the shutdown broadcast.  The store sits
//! behind a single async mutex, so every append observes the one before it
//! and reads never see a partially written row.
//!
//! The HTTP surface is deliberately tiny: a WebSocket upgrade at `/ws` and a
//! plain-text liveness probe at `/healthz` for platform health checks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;

use crate::config::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_MAX_CONNECTIONS, HANDSHAKE_TIMEOUT_SECS,
    MAX_HISTORY_MESSAGES, MISSED_HEARTBEAT_THRESHOLD, OUTBOUND_CHANNEL_CAPACITY,
};
use crate::logging;
use crate::registry::ConnectionRegistry;
use crate::session;
use crate::store::{
    now_millis, AppendOutcome, MessageStore, PresenceStatus, StoreError, StoredMessage,
};

const SHUTDOWN_CHANNEL_CAPACITY: usize = 8;

/// Runtime tuning for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Liveness sweep period, also advertised to clients in WELCOME.
    pub heartbeat_interval: Duration,
    /// How many heartbeat intervals a session may stay silent before it is
    /// evicted.  At least 2, to tolerate one missed PING.
    pub missed_threshold: u32,
    /// How long a fresh connection may take to complete the HELLO handshake.
    pub handshake_timeout: Duration,
    /// Per-session outbound buffer; overflow evicts the session.
    pub outbound_capacity: usize,
    /// Simultaneous WebSocket connections accepted before returning 503.
    pub max_connections: usize,
    /// Cap on a single history query / offline replay.
    pub max_history: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            missed_threshold: MISSED_HEARTBEAT_THRESHOLD,
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            outbound_capacity: OUTBOUND_CHANNEL_CAPACITY,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_history: MAX_HISTORY_MESSAGES,
        }
    }
}

/// Shared server state, cloned into every handler and task.
#[derive(Clone)]
pub struct RelayState {
    pub config: RelayConfig,
    store: Arc<Mutex<MessageStore>>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    start_time: Instant,
    ws_connections: Arc<AtomicUsize>,
}

impl RelayState {
    pub fn new(config: RelayConfig, store: MessageStore) -> Self {
        Self {
            config,
            store: Arc::new(Mutex::new(store)),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx: broadcast::channel(SHUTDOWN_CHANNEL_CAPACITY).0,
            start_time: Instant::now(),
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// A session is evicted once it has been silent for this long.
    pub fn idle_cutoff(&self) -> Duration {
        self.config.heartbeat_interval * self.config.missed_threshold
    }

    // -- Store access -------------------------------------------------------

    /// Append a message to the durable log.
    pub async fn append_message(
        &self,
        message_id: &str,
        sender: &str,
        content: &str,
        client_timestamp: Option<u64>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut store = self.store.lock().await;
        store.append(message_id, sender, content, client_timestamp)
    }

    /// Stored messages strictly after `since`, capped at the configured
    /// maximum.  Truncation is logged; there is no pagination contract.
    pub async fn history_since(
        &self,
        since: Option<u64>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = {
            let store = self.store.lock().await;
            store.query_since(since, self.config.max_history)?
        };
        if messages.len() == self.config.max_history {
            crate::rlog!(
                "history: result truncated at {} message(s)",
                self.config.max_history
            );
        }
        Ok(messages)
    }

    /// Durable presence status for an agent.
    pub async fn presence_status(&self, agent_id: &str) -> Result<PresenceStatus, StoreError> {
        let store = self.store.lock().await;
        store.status(agent_id)
    }

    /// The replay cursor for a reconnecting agent: the last-seen timestamp
    /// from its previous session, if any.
    pub async fn presence_cursor(&self, agent_id: &str) -> Option<u64> {
        let store = self.store.lock().await;
        match store.presence(agent_id) {
            Ok(row) => row.map(|r| r.last_seen),
            Err(error) => {
                crate::rlog!(
                    "presence: lookup failed for {}: {error}",
                    logging::agent_id(agent_id)
                );
                None
            }
        }
    }

    /// Persist an online transition.  Presence failures are logged rather
    /// than propagated: the live session is authoritative while connected,
    /// and startup resets any stale rows.
    pub async fn persist_online(&self, agent_id: &str) {
        let mut store = self.store.lock().await;
        if let Err(error) = store.set_online(agent_id, now_millis()) {
            crate::rlog!(
                "presence: failed to record {} online: {error}",
                logging::agent_id(agent_id)
            );
        }
    }

    async fn persist_offline(&self, agent_id: &str) {
        let mut store = self.store.lock().await;
        if let Err(error) = store.set_offline(agent_id, now_millis()) {
            crate::rlog!(
                "presence: failed to record {} offline: {error}",
                logging::agent_id(agent_id)
            );
        }
    }

    // -- Session lifecycle --------------------------------------------------

    /// Number of agents currently online.
    pub async fn online_count(&self) -> usize {
        self.registry.online_count().await
    }

    /// Tear down the session for `agent_id` if it still carries `conn_seq`:
    /// remove it from the registry and flip its durable presence to offline.
    ///
    /// This is the single teardown path shared by client disconnect, GOODBYE,
    /// heartbeat eviction, and outbound-buffer overflow.  The sequence guard
    /// makes it a no-op when the agent has already reconnected.
    pub async fn drop_session(&self, agent_id: &str, conn_seq: u64, reason: &str) -> bool {
        if !self.registry.unregister(agent_id, conn_seq).await {
            return false;
        }
        self.persist_offline(agent_id).await;
        crate::rlog!(
            "session: {} closed ({reason}), {} agent(s) online",
            logging::agent_id(agent_id),
            self.registry.online_count().await
        );
        true
    }

    // -- Shutdown -----------------------------------------------------------

    /// Receiver for the shutdown notification, one per session loop.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every live session to notify its client and close.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait (bounded) for live sessions to drain, then acquire the store
    /// handle once to confirm no write is in flight.  Returns the number of
    /// messages on disk at rest.
    pub async fn drain(&self, timeout: Duration) -> Result<u64, StoreError> {
        let deadline = Instant::now() + timeout;
        while !self.registry.is_empty().await {
            if Instant::now() >= deadline {
                crate::rlog!(
                    "shutdown: giving up on {} lingering session(s)",
                    self.registry.online_count().await
                );
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let store = self.store.lock().await;
        store.message_count()
    }

    // -- Connection accounting ----------------------------------------------

    pub(crate) fn connection_opened(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.ws_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Relaxed)
    }
}

/// Build the router: WebSocket endpoint plus liveness probe.
pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/healthz", get(healthcheck))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    // Refuse before upgrading: an over-limit connection never gets a socket.
    if state.connection_count() >= state.config.max_connections {
        crate::rlog!(
            "relay: refusing connection from {addr}, limit of {} reached",
            state.config.max_connections
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    ws.on_upgrade(move |socket| session::run(socket, addr, state))
        .into_response()
}
