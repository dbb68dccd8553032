use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::state::AppState;
use crate::services::workspace::WorkspaceManager;

pub(crate) fn spawn(state: &AppState) -> JoinHandle<()> {
    tokio::spawn(sweep_sessions_loop(
        Arc::clone(state.workspace()),
        state.settings().workspace().sweep_interval(),
        state.shutdown_receiver(),
    ))
}

async fn sweep_sessions_loop(
    workspace: Arc<WorkspaceManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tick.tick() => {
                let released = workspace.sweep_expired();
                if released > 0 {
                    tracing::info!(released, active = workspace.active_sessions(), "Expired sessions swept");
                }
            }
        }
    }

    tracing::debug!("Session sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ArtifactKind, ExpiryPolicy};

    #[tokio::test]
    async fn sweeper_releases_expired_sessions_and_stops_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Arc::new(
            WorkspaceManager::new(tmp.path().join("ws"), Duration::ZERO, ExpiryPolicy::RetentionWindow)
                .unwrap(),
        );
        let mut guard = workspace.open_session(None).unwrap();
        guard.write_artifact(ArtifactKind::Csv, b"x").await.unwrap();
        guard.commit();
        assert_eq!(workspace.active_sessions(), 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            tokio::spawn(sweep_sessions_loop(Arc::clone(&workspace), Duration::from_millis(10), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(workspace.active_sessions(), 0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
