//! Heartbeat monitor: periodic liveness sweep over all live sessions.
//!
//! Any inbound frame counts as activity.  A session that stays silent for
//! longer than `heartbeat_interval × missed_threshold` is force-closed: it is
//! removed from the registry, its presence flips to offline, and dropping its
//! outbound channel ends its socket loop.  The client is not notified, since
//! it is already unreachable.  This is the only eviction path not initiated
//! by the client itself or by shutdown.

use tokio::sync::oneshot;

use crate::logging;
use crate::server::RelayState;

/// Spawn the sweep task.  It ticks once per heartbeat interval until the
/// shutdown signal fires.
pub fn start_heartbeat_monitor(state: RelayState, mut shutdown_rx: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&state).await;
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }
    });
}

async fn sweep(state: &RelayState) {
    let cutoff = state.idle_cutoff();
    let idle = state.registry().idle_sessions(cutoff).await;
    for (agent_id, conn_seq) in idle {
        crate::rlog!(
            "heartbeat: {} silent for over {}s, evicting",
            logging::agent_id(&agent_id),
            cutoff.as_secs()
        );
        state
            .drop_session(&agent_id, conn_seq, "heartbeat timeout")
            .await;
    }
}
