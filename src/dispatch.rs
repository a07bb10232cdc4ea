//! Action dispatcher — executes the terminal action a verdict implies and
//! records the outcome.
//!
//! State machine per message, starting from Classified(verdict):
//! - Important → notify → mark read → ledger (Important, succeeded)
//! - Normal    → ledger (Normal, succeeded), no backend mutation
//! - Junk      → move to junk folder → ledger (Junk, succeeded/failed)
//!
//! Exactly one ledger write per dispatch attempt. A failed attempt records
//! status=failed and the message re-enters the pipeline on the next poll
//! where it is still listed; a message is never silently dropped.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::classify::{Priority, Verdict};
use crate::connector::{MailConnector, MailMessage};
use crate::ledger::{DispatchStatus, Ledger};
use crate::notify::Notifier;

/// Executes verdict actions against the originating connector and the
/// notification transport, then writes the ledger.
pub struct Dispatcher {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    destination: String,
}

impl Dispatcher {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>, destination: String) -> Self {
        Self {
            ledger,
            notifier,
            destination,
        }
    }

    /// Execute the action for `verdict` and record the outcome.
    ///
    /// Returns the recorded status. The side effect happens-before the
    /// ledger write; if the write itself fails that is logged and contained
    /// — the idempotent `move_to`/`mark_read` contract makes the next-poll
    /// retry safe.
    pub async fn dispatch(
        &self,
        connector: &dyn MailConnector,
        junk_folder: &str,
        message: &MailMessage,
        verdict: &Verdict,
    ) -> DispatchStatus {
        let status = match verdict.priority {
            Priority::Important => self.dispatch_important(connector, message, verdict).await,
            // Nothing to do and nothing to retry.
            Priority::Normal => DispatchStatus::Succeeded,
            Priority::Junk => self.dispatch_junk(connector, junk_folder, message).await,
        };

        if let Err(e) = self
            .ledger
            .record_outcome(&message.account, &message.id, verdict.priority, status)
            .await
        {
            error!(
                account = %message.account,
                id = %message.id,
                error = %e,
                "Ledger write failed after dispatch — outcome will be re-derived next poll"
            );
        }

        info!(
            account = %message.account,
            id = %message.id,
            outcome = verdict.priority.as_str(),
            status = status.as_str(),
            confidence = verdict.confidence,
            "Message dispatched"
        );
        status
    }

    async fn dispatch_important(
        &self,
        connector: &dyn MailConnector,
        message: &MailMessage,
        verdict: &Verdict,
    ) -> DispatchStatus {
        let text = notification_text(message, verdict);
        if let Err(e) = self.notifier.send(&text, &self.destination).await {
            error!(
                account = %message.account,
                id = %message.id,
                error = %e,
                "Notification failed — message stays eligible for retry"
            );
            return DispatchStatus::Failed;
        }

        if !message.is_read {
            // Best effort, like the junk path's read flag: a stuck unread
            // flag is not worth re-notifying the operator for.
            if let Err(e) = connector.mark_read(message).await {
                warn!(
                    account = %message.account,
                    id = %message.id,
                    error = %e,
                    "Failed to mark message read"
                );
            }
        }
        DispatchStatus::Succeeded
    }

    async fn dispatch_junk(
        &self,
        connector: &dyn MailConnector,
        junk_folder: &str,
        message: &MailMessage,
    ) -> DispatchStatus {
        match connector.move_to(message, junk_folder).await {
            Ok(()) => DispatchStatus::Succeeded,
            Err(e) => {
                error!(
                    account = %message.account,
                    id = %message.id,
                    junk_folder,
                    error = %e,
                    "Junk move failed — message stays eligible for retry"
                );
                DispatchStatus::Failed
            }
        }
    }

    /// Send an operator-facing alert through the notification transport.
    ///
    /// Used by the scheduler for sustained per-account failures; distinct
    /// from per-message notifications.
    pub async fn notify_operator(&self, text: &str) {
        if let Err(e) = self.notifier.send(text, &self.destination).await {
            warn!(error = %e, "Operator alert could not be delivered");
        }
    }
}

/// Compose the terse notification for an Important message.
fn notification_text(message: &MailMessage, verdict: &Verdict) -> String {
    let summary = verdict.summary.as_deref().unwrap_or(&message.subject);
    format!(
        "Important email on {}\nFrom: {}\nSubject: {}\n{}",
        message.account, message.sender, message.subject, summary
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Priority;
    use crate::ledger::LibSqlLedger;
    use crate::testutil::{MockConnector, MockNotifier, message, verdict};

    async fn fixture() -> (Arc<LibSqlLedger>, Arc<MockNotifier>, Dispatcher) {
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
        let notifier = Arc::new(MockNotifier::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            "ops-chat".into(),
        );
        (ledger, notifier, dispatcher)
    }

    #[tokio::test]
    async fn junk_moves_once_and_records_success() {
        let (ledger, _notifier, dispatcher) = fixture().await;
        let msg = message("personal", "msg-1", "50% off sale", 1);
        let connector = MockConnector::new("personal", vec![msg.clone()]);

        let status = dispatcher
            .dispatch(&connector, "Junk", &msg, &verdict(Priority::Junk, None))
            .await;

        assert_eq!(status, DispatchStatus::Succeeded);
        let moves = connector.move_calls.lock().unwrap().clone();
        assert_eq!(moves, vec![("msg-1".to_string(), "Junk".to_string())]);

        let entry = ledger.get("personal", "msg-1").await.unwrap().unwrap();
        assert_eq!(entry.outcome, Priority::Junk);
        assert_eq!(entry.status, DispatchStatus::Succeeded);
    }

    #[tokio::test]
    async fn junk_move_failure_records_failed() {
        let (ledger, _notifier, dispatcher) = fixture().await;
        let msg = message("personal", "msg-1", "spam", 1);
        let connector = MockConnector::new("personal", vec![msg.clone()]);
        *connector.fail_moves.lock().unwrap() = true;

        let status = dispatcher
            .dispatch(&connector, "Junk", &msg, &verdict(Priority::Junk, None))
            .await;

        assert_eq!(status, DispatchStatus::Failed);
        let entry = ledger.get("personal", "msg-1").await.unwrap().unwrap();
        assert_eq!(entry.status, DispatchStatus::Failed);
        assert!(!ledger.has_succeeded("personal", "msg-1").await.unwrap());
    }

    #[tokio::test]
    async fn important_notifies_and_marks_read() {
        let (ledger, notifier, dispatcher) = fixture().await;
        let msg = message("work", "msg-7", "Offer letter", 1);
        let connector = MockConnector::new("work", vec![msg.clone()]);

        let status = dispatcher
            .dispatch(
                &connector,
                "Junk",
                &msg,
                &verdict(Priority::Important, Some("Offer letter from Acme")),
            )
            .await;

        assert_eq!(status, DispatchStatus::Succeeded);
        assert_eq!(notifier.send_count(), 1);
        let (text, destination) = notifier.sends.lock().unwrap()[0].clone();
        assert!(text.contains("Offer letter from Acme"));
        assert!(text.contains("sender@example.com"));
        assert_eq!(destination, "ops-chat");

        assert_eq!(
            connector.mark_read_calls.lock().unwrap().as_slice(),
            ["msg-7"]
        );
        assert!(ledger.has_succeeded("work", "msg-7").await.unwrap());
    }

    #[tokio::test]
    async fn important_already_read_skips_mark_read() {
        let (_ledger, notifier, dispatcher) = fixture().await;
        let mut msg = message("work", "msg-8", "FYI", 1);
        msg.is_read = true;
        let connector = MockConnector::new("work", vec![msg.clone()]);

        dispatcher
            .dispatch(&connector, "Junk", &msg, &verdict(Priority::Important, None))
            .await;

        assert_eq!(notifier.send_count(), 1);
        assert!(connector.mark_read_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notify_failure_records_failed_without_marking_read() {
        let (ledger, notifier, dispatcher) = fixture().await;
        let msg = message("work", "msg-9", "Urgent", 1);
        let connector = MockConnector::new("work", vec![msg.clone()]);
        *notifier.fail_next.lock().unwrap() = 1;

        let status = dispatcher
            .dispatch(&connector, "Junk", &msg, &verdict(Priority::Important, None))
            .await;

        assert_eq!(status, DispatchStatus::Failed);
        assert_eq!(notifier.send_count(), 0);
        assert!(connector.mark_read_calls.lock().unwrap().is_empty());

        let entry = ledger.get("work", "msg-9").await.unwrap().unwrap();
        assert_eq!(entry.outcome, Priority::Important);
        assert_eq!(entry.status, DispatchStatus::Failed);
    }

    #[tokio::test]
    async fn normal_records_success_with_no_backend_calls() {
        let (ledger, notifier, dispatcher) = fixture().await;
        let msg = message("personal", "msg-2", "newsletter digest", 1);
        let connector = MockConnector::new("personal", vec![msg.clone()]);

        let status = dispatcher
            .dispatch(&connector, "Junk", &msg, &verdict(Priority::Normal, None))
            .await;

        assert_eq!(status, DispatchStatus::Succeeded);
        assert_eq!(notifier.send_count(), 0);
        assert!(connector.move_calls.lock().unwrap().is_empty());
        assert!(connector.mark_read_calls.lock().unwrap().is_empty());
        assert!(ledger.has_succeeded("personal", "msg-2").await.unwrap());
    }

    #[tokio::test]
    async fn move_to_is_idempotent_across_retries() {
        let (_ledger, _notifier, dispatcher) = fixture().await;
        let msg = message("personal", "msg-3", "spam", 1);
        let connector = MockConnector::new("personal", vec![msg.clone()]);

        // Two dispatch attempts for the same message, e.g. after a ledger
        // write that never landed. Both must succeed, and the message ends
        // up in exactly one place.
        let first = dispatcher
            .dispatch(&connector, "Junk", &msg, &verdict(Priority::Junk, None))
            .await;
        let second = dispatcher
            .dispatch(&connector, "Junk", &msg, &verdict(Priority::Junk, None))
            .await;

        assert_eq!(first, DispatchStatus::Succeeded);
        assert_eq!(second, DispatchStatus::Succeeded);
        assert_eq!(connector.moved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notification_text_falls_back_to_subject() {
        let msg = message("personal", "m", "Quarterly report", 1);
        let text = notification_text(&msg, &verdict(Priority::Important, None));
        assert!(text.contains("Quarterly report"));
    }
}
