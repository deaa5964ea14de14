use crate::app::AppState;
use chrono::Duration as Retention;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

/// Heartbeat and purge loops with a lifecycle: spawned at process start,
/// stopped through the shutdown watch rather than left to run forever.
pub struct MaintenanceTasks {
    heartbeat: JoinHandle<()>,
    purge: JoinHandle<()>,
}

impl MaintenanceTasks {
    pub fn spawn(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Self {
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&state), shutdown.clone()));
        let purge = tokio::spawn(purge_loop(state, shutdown));
        Self { heartbeat, purge }
    }

    pub async fn shutdown(self) {
        self.heartbeat.abort();
        self.purge.abort();
        let _ = self.heartbeat.await;
        let _ = self.purge.await;
    }
}

async fn heartbeat_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(state.heartbeat_interval_seconds));
    loop {
        tokio::select! {
            _ = ticker.tick() => heartbeat_tick(&state).await,
            _ = shutdown.changed() => return,
        }
    }
}

/// One refresh pass: every registry-resident peer gets a renewed online TTL.
/// This is the sole mechanism keeping long-lived connections marked online.
pub(crate) async fn heartbeat_tick(state: &AppState) {
    let resident = state.registry.snapshot().await;
    debug!(peers = resident.len(), "presence heartbeat");
    for (peer, _) in resident {
        if let Err(err) = state.presence.set_online(peer, state.presence_ttl_seconds).await {
            warn!(peer, error = %err, "presence refresh failed");
        }
    }
}

async fn purge_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(state.purge_interval_seconds));
    loop {
        tokio::select! {
            _ = ticker.tick() => purge_tick(&state).await,
            _ = shutdown.changed() => return,
        }
    }
}

/// One retention sweep over delivered rows. Never on the hot path.
pub(crate) async fn purge_tick(state: &AppState) {
    match state
        .mailbox
        .purge_delivered(Retention::days(state.retention_days))
        .await
    {
        Ok(0) => {}
        Ok(count) => debug!(count, "purged delivered rows"),
        Err(err) => warn!(error = %err, "mailbox purge failed"),
    }
}
