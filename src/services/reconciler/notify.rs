use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{RevokeSummary, TerminalFailure};

/// Delivery (email, webhook, chat) lives in the notification subsystem;
/// the engine only emits these events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn terminal_failure(&self, failure: &TerminalFailure);
    async fn emergency_revoke_completed(&self, summary: &RevokeSummary);
}

/// Default binding: structured log lines the notification relay tails.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn terminal_failure(&self, failure: &TerminalFailure) {
        tracing::warn!(
            user_id = %failure.user_id,
            host_id = %failure.host_id,
            retry_count = failure.retry_count,
            error = %failure.error,
            "reconciliation terminally failed"
        );
    }

    async fn emergency_revoke_completed(&self, summary: &RevokeSummary) {
        tracing::warn!(
            fingerprint = %summary.fingerprint,
            revoked_count = summary.revoked_count,
            affected_users = summary.affected_users.len(),
            "emergency revoke enqueued across fleet"
        );
    }
}

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    TerminalFailure(TerminalFailure),
    EmergencyRevoke(RevokeSummary),
}

/// Channel-backed notifier for callers that consume events in-process.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn terminal_failure(&self, failure: &TerminalFailure) {
        let _ = self
            .tx
            .send(NotificationEvent::TerminalFailure(failure.clone()));
    }

    async fn emergency_revoke_completed(&self, summary: &RevokeSummary) {
        let _ = self
            .tx
            .send(NotificationEvent::EmergencyRevoke(summary.clone()));
    }
}
