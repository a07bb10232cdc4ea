//! End-to-end scheduler tests over the public API: real file-backed ledger,
//! scripted connector/classifier/notifier doubles.
//!
//! The connector double lists its messages on every poll (ignoring the
//! window) so these tests prove the *ledger* is what prevents duplicate
//! dispatch — including across a simulated process restart.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use mail_sentinel::classify::{Classifier, Priority, Verdict};
use mail_sentinel::config::MonitorConfig;
use mail_sentinel::connector::{MailConnector, MailMessage};
use mail_sentinel::error::{BackendError, ClassifyError, NotifyError};
use mail_sentinel::ledger::{DispatchStatus, Ledger, LibSqlLedger};
use mail_sentinel::notify::Notifier;
use mail_sentinel::scheduler::PollScheduler;

// ── Test doubles ────────────────────────────────────────────────────

struct AlwaysListingConnector {
    account: String,
    messages: Vec<MailMessage>,
    moved: Mutex<HashSet<String>>,
    move_calls: Mutex<Vec<(String, String)>>,
}

impl AlwaysListingConnector {
    fn new(account: &str, messages: Vec<MailMessage>) -> Self {
        Self {
            account: account.to_string(),
            messages,
            moved: Mutex::new(HashSet::new()),
            move_calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MailConnector for AlwaysListingConnector {
    fn account(&self) -> &str {
        &self.account
    }

    async fn list_candidates(
        &self,
        folder: &str,
        _since: DateTime<Utc>,
        _unread_only: bool,
    ) -> Result<Vec<MailMessage>, BackendError> {
        let moved = self.moved.lock().unwrap();
        Ok(self
            .messages
            .iter()
            .filter(|m| m.folder == folder && !moved.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn fetch_body(&self, message: &MailMessage) -> Result<String, BackendError> {
        Ok(format!("body of {}", message.id))
    }

    async fn move_to(&self, message: &MailMessage, folder: &str) -> Result<(), BackendError> {
        self.move_calls
            .lock()
            .unwrap()
            .push((message.id.clone(), folder.to_string()));
        self.moved.lock().unwrap().insert(message.id.clone());
        Ok(())
    }

    async fn mark_read(&self, _message: &MailMessage) -> Result<(), BackendError> {
        Ok(())
    }
}

struct FixedClassifier {
    verdict: Verdict,
    calls: Mutex<u32>,
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(
        &self,
        _message: &MailMessage,
        _rule_text: &str,
    ) -> Result<Verdict, ClassifyError> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.verdict.clone())
    }
}

struct CountingNotifier {
    sends: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for CountingNotifier {
    fn name(&self) -> &str {
        "counting"
    }

    async fn send(&self, summary: &str, _destination: &str) -> Result<(), NotifyError> {
        self.sends.lock().unwrap().push(summary.to_string());
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> MonitorConfig {
    serde_json::from_str(
        r#"{
        "accounts": {
            "personal": {
                "connector": "imap",
                "imap": {
                    "server": "imap.example.com",
                    "username": "me@example.com",
                    "password_env": "UNUSED"
                },
                "settings": { "process_only_unread": false }
            }
        },
        "poll_interval_secs": 3600,
        "classifier": { "rule_text": "Important: addressed to me personally." },
        "notifier": { "kind": "push", "destination": "ops-chat" }
    }"#,
    )
    .unwrap()
}

fn unread_message(id: &str, subject: &str) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        uid: id.to_string(),
        account: "personal".into(),
        sender: "someone@example.com".into(),
        subject: subject.to_string(),
        body: Some("hello there".into()),
        received_at: Utc::now(),
        is_read: false,
        folder: "INBOX".into(),
    }
}

async fn run_until<F: Fn() -> bool>(
    scheduler: PollScheduler,
    condition: F,
) -> Result<(), &'static str> {
    let (tx, rx) = watch::channel(false);
    let handles = scheduler.start(rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            tx.send(true).ok();
            for handle in handles {
                handle.await.ok();
            }
            return Err("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tx.send(true).ok();
    for handle in handles {
        handle.await.ok();
    }
    Ok(())
}

fn build_scheduler(
    config: &MonitorConfig,
    connector: Arc<AlwaysListingConnector>,
    classifier: Arc<FixedClassifier>,
    notifier: Arc<CountingNotifier>,
    ledger: Arc<dyn Ledger>,
) -> PollScheduler {
    PollScheduler::with_connectors(
        config,
        vec![(
            "personal".to_string(),
            connector as Arc<dyn MailConnector>,
        )],
        ledger,
        classifier as Arc<dyn Classifier>,
        notifier as Arc<dyn Notifier>,
    )
    .unwrap()
}

async fn open_ledger(path: &Path) -> Arc<dyn Ledger> {
    Arc::new(LibSqlLedger::new_local(path).await.unwrap())
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn restart_does_not_duplicate_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sentinel.db");
    let config = test_config();

    let connector = Arc::new(AlwaysListingConnector::new(
        "personal",
        vec![unread_message("msg-1", "Contract signature needed")],
    ));
    let classifier = Arc::new(FixedClassifier {
        verdict: Verdict {
            priority: Priority::Important,
            confidence: 0.9,
            reasoning: "personal request".into(),
            summary: Some("Contract needs your signature".into()),
        },
        calls: Mutex::new(0),
    });
    let notifier = Arc::new(CountingNotifier {
        sends: Mutex::new(Vec::new()),
    });

    // First run: the message is classified and the notification goes out.
    {
        let scheduler = build_scheduler(
            &config,
            Arc::clone(&connector),
            Arc::clone(&classifier),
            Arc::clone(&notifier),
            open_ledger(&db_path).await,
        );
        let notifier = Arc::clone(&notifier);
        run_until(scheduler, move || notifier.sends.lock().unwrap().len() == 1)
            .await
            .unwrap();
    }
    assert_eq!(*classifier.calls.lock().unwrap(), 1);

    // Simulated restart: fresh ledger handle over the same file, fresh
    // scheduler, same backend still listing the message. The succeeded
    // ledger entry must prevent any re-classification or re-dispatch.
    {
        let scheduler = build_scheduler(
            &config,
            Arc::clone(&connector),
            Arc::clone(&classifier),
            Arc::clone(&notifier),
            open_ledger(&db_path).await,
        );
        let (tx, rx) = watch::channel(false);
        let handles = scheduler.start(rx);
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).ok();
        for handle in handles {
            handle.await.ok();
        }
    }

    assert_eq!(notifier.sends.lock().unwrap().len(), 1);
    assert_eq!(*classifier.calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn junk_outcome_survives_ledger_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sentinel.db");
    let config = test_config();

    let connector = Arc::new(AlwaysListingConnector::new(
        "personal",
        vec![unread_message("msg-sale", "50% off sale")],
    ));
    let classifier = Arc::new(FixedClassifier {
        verdict: Verdict {
            priority: Priority::Junk,
            confidence: 0.97,
            reasoning: "cold outreach".into(),
            summary: None,
        },
        calls: Mutex::new(0),
    });
    let notifier = Arc::new(CountingNotifier {
        sends: Mutex::new(Vec::new()),
    });

    {
        let scheduler = build_scheduler(
            &config,
            Arc::clone(&connector),
            Arc::clone(&classifier),
            Arc::clone(&notifier),
            open_ledger(&db_path).await,
        );
        let connector = Arc::clone(&connector);
        run_until(scheduler, move || {
            !connector.move_calls.lock().unwrap().is_empty()
        })
        .await
        .unwrap();
    }

    // Exactly one move, to the configured junk folder.
    assert_eq!(
        connector.move_calls.lock().unwrap().clone(),
        vec![("msg-sale".to_string(), "Junk".to_string())]
    );
    // Junk never notifies.
    assert!(notifier.sends.lock().unwrap().is_empty());

    // The durable entry is readable through a fresh handle.
    let reopened = LibSqlLedger::new_local(&db_path).await.unwrap();
    let entry = reopened
        .get("personal", "msg-sale")
        .await
        .unwrap()
        .expect("ledger entry must survive reopen");
    assert_eq!(entry.outcome, Priority::Junk);
    assert_eq!(entry.status, DispatchStatus::Succeeded);
}
