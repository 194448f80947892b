use crate::metrics::Metrics;
use crate::services::buddy::{arrival_snac, departure_snac};
use crate::session_manager::SessionManager;
use oscard_storage::{Storage, UserRecord};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

/// Presence fan-out: every status transition pushed onto the queue is
/// broadcast to the subject's watchers that are online right now.
///
/// A send failure on one watcher never stops the rest; closing the
/// queue is the shutdown signal.
pub async fn run(
    mut events: UnboundedReceiver<UserRecord>,
    sessions: Arc<SessionManager>,
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
) {
    while let Some(user) = events.recv().await {
        metrics.mark_presence_event();
        let watchers = match storage.watchers_of(&user.screen_name).await {
            Ok(watchers) => watchers,
            Err(err) => {
                error!(screen_name = %user.screen_name, "watcher query failed: {}", err);
                continue;
            }
        };
        for watcher in watchers {
            let Some(session) = sessions.get(&watcher) else {
                continue;
            };
            let snac = if user.status.is_present() {
                arrival_snac(&user)
            } else {
                departure_snac(&user)
            };
            if let Err(err) = session.send_snac(&snac).await {
                warn!(watcher = %watcher, "presence notification failed: {}", err);
            }
        }
    }
    info!("presence loop stopped");
}
