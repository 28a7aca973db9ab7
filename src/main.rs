//! relaypoint: WebSocket rendezvous relay for long-lived agent clients.
//!
//! Agents connect at `/ws`, complete a HELLO/WELCOME handshake, and exchange
//! JSON frames.  Messages persist in SQLite and are replayed to agents that
//! were offline when they were sent.  `/healthz` serves platform liveness
//! probes.  SIGTERM or Ctrl-C drains live sessions and exits cleanly.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::sync::oneshot;

use relaypoint::config::{Cli, Config, SHUTDOWN_DRAIN_TIMEOUT_SECS};
use relaypoint::monitor::start_heartbeat_monitor;
use relaypoint::rlog;
use relaypoint::server::{app, RelayState};
use relaypoint::store::{db_path, MessageStore};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    relaypoint::logging::init();
    rlog!("relaypoint starting");

    // A store that cannot open is process-fatal: refuse to start rather than
    // run a relay that drops messages.
    let mut store = if config.in_memory {
        rlog!("  store: in-memory (history will not survive a restart)");
        MessageStore::open_in_memory()
    } else {
        let db = db_path(&config.data_dir);
        rlog!("  store: {}", db.display());
        MessageStore::open(&db)
    }
    .unwrap_or_else(|error| {
        eprintln!("fatal: cannot open message store: {error}");
        std::process::exit(1);
    });

    // Presence rows left online by a crash do not mean the agent is
    // connected; everyone starts offline until they say HELLO.
    match store.mark_all_offline() {
        Ok(reset) if reset > 0 => rlog!("  presence: reset {reset} stale online record(s)"),
        Ok(_) => {}
        Err(error) => {
            eprintln!("fatal: cannot reset presence: {error}");
            std::process::exit(1);
        }
    }
    if let Ok(count) = store.message_count() {
        rlog!("  history: {count} message(s) stored");
    }

    let state = RelayState::new(config.relay_config(), store);
    rlog!(
        "  heartbeat: every {}s, eviction after {}s of silence",
        state.config.heartbeat_interval.as_secs(),
        state.idle_cutoff().as_secs()
    );

    let (sweep_tx, sweep_rx) = oneshot::channel();
    start_heartbeat_monitor(state.clone(), sweep_rx);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| {
            eprintln!("fatal: failed to bind {}: {error}", config.bind_addr);
            std::process::exit(1);
        });
    rlog!(
        "listening on {} (WebSocket at /ws, health at /healthz)",
        config.bind_addr
    );

    let shutdown_state = state.clone();
    let serve = axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_termination().await;
        rlog!("shutdown requested, draining sessions");
        let _ = sweep_tx.send(());
        shutdown_state.begin_shutdown();
    });

    if let Err(error) = serve.await {
        eprintln!("fatal: server error: {error}");
        std::process::exit(1);
    }

    let uptime = state.uptime().as_secs();
    match state.drain(Duration::from_secs(SHUTDOWN_DRAIN_TIMEOUT_SECS)).await {
        Ok(count) => rlog!("relay stopped after {uptime}s; {count} message(s) stored"),
        Err(error) => rlog!("relay stopped after {uptime}s; final store check failed: {error}"),
    }
}

/// Resolve on SIGTERM (how platforms stop us) or Ctrl-C (how people do).
async fn wait_for_termination() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
