use crate::metrics::Metrics;
use crate::services::icbm::incoming_message_snac;
use crate::session_manager::SessionManager;
use oscard_storage::{MessageRecord, Storage};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

/// Message delivery: each queued message is routed to the recipient's
/// live session if one exists and marked delivered once the write is
/// acknowledged. With no session the row simply stays undelivered; the
/// recipient's next sign-on drains it.
///
/// Closing the queue is the shutdown signal.
pub async fn run(
    mut events: UnboundedReceiver<MessageRecord>,
    sessions: Arc<SessionManager>,
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
) {
    while let Some(message) = events.recv().await {
        let Some(session) = sessions.get(&message.recipient) else {
            metrics.mark_message_queued();
            continue;
        };
        let sender = match storage.load_user(&message.sender).await {
            Ok(sender) => sender,
            Err(err) => {
                error!(
                    message_id = message.message_id,
                    sender = %message.sender,
                    "originator lookup failed: {}",
                    err
                );
                continue;
            }
        };
        match session.send_snac(&incoming_message_snac(&sender, &message)).await {
            Ok(()) => {
                if let Err(err) = storage.mark_delivered(message.message_id).await {
                    error!(
                        message_id = message.message_id,
                        "delivered but not recorded: {}",
                        err
                    );
                } else {
                    metrics.mark_message_delivered();
                }
            }
            Err(err) => {
                // The recipient's connection died mid-delivery; the row
                // stays undelivered for the next sign-on.
                warn!(
                    message_id = message.message_id,
                    recipient = %message.recipient,
                    "live delivery failed: {}",
                    err
                );
                metrics.mark_message_queued();
            }
        }
    }
    info!("message delivery loop stopped");
}
