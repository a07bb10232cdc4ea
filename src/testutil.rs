//! Test doubles shared by the dispatcher and scheduler tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::classify::{Classifier, Priority, Verdict};
use crate::connector::{MailConnector, MailMessage};
use crate::error::{BackendError, ClassifyError, NotifyError};
use crate::notify::Notifier;

/// Scripted in-memory mailbox. Listing behaves like a real backend:
/// the same messages come back poll after poll until they are moved.
pub(crate) struct MockConnector {
    pub account: String,
    pub messages: Mutex<Vec<MailMessage>>,
    /// Message ids moved out of their source folder, with the target.
    pub moved: Mutex<HashSet<String>>,
    pub move_calls: Mutex<Vec<(String, String)>>,
    pub mark_read_calls: Mutex<Vec<String>>,
    pub fetch_body_calls: Mutex<Vec<String>>,
    /// Errors returned by upcoming `list_candidates` calls, in order.
    pub list_failures: Mutex<VecDeque<BackendError>>,
    /// When true, `move_to` fails with a transient error.
    pub fail_moves: Mutex<bool>,
}

impl MockConnector {
    pub fn new(account: &str, messages: Vec<MailMessage>) -> Self {
        Self {
            account: account.to_string(),
            messages: Mutex::new(messages),
            moved: Mutex::new(HashSet::new()),
            move_calls: Mutex::new(Vec::new()),
            mark_read_calls: Mutex::new(Vec::new()),
            fetch_body_calls: Mutex::new(Vec::new()),
            list_failures: Mutex::new(VecDeque::new()),
            fail_moves: Mutex::new(false),
        }
    }
}

#[async_trait]
impl MailConnector for MockConnector {
    fn account(&self) -> &str {
        &self.account
    }

    async fn list_candidates(
        &self,
        folder: &str,
        since: DateTime<Utc>,
        unread_only: bool,
    ) -> Result<Vec<MailMessage>, BackendError> {
        if let Some(err) = self.list_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let moved = self.moved.lock().unwrap();
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.folder == folder)
            .filter(|m| m.received_at >= since)
            .filter(|m| !unread_only || !m.is_read)
            .filter(|m| !moved.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn fetch_body(&self, message: &MailMessage) -> Result<String, BackendError> {
        self.fetch_body_calls
            .lock()
            .unwrap()
            .push(message.id.clone());
        Ok(format!("body of {}", message.id))
    }

    async fn move_to(&self, message: &MailMessage, folder: &str) -> Result<(), BackendError> {
        self.move_calls
            .lock()
            .unwrap()
            .push((message.id.clone(), folder.to_string()));
        if *self.fail_moves.lock().unwrap() {
            return Err(BackendError::transient(&self.account, "move failed"));
        }
        // Already-moved messages are a no-op success, like the real thing.
        self.moved.lock().unwrap().insert(message.id.clone());
        Ok(())
    }

    async fn mark_read(&self, message: &MailMessage) -> Result<(), BackendError> {
        self.mark_read_calls
            .lock()
            .unwrap()
            .push(message.id.clone());
        if let Some(stored) = self
            .messages
            .lock()
            .unwrap()
            .iter_mut()
            .find(|m| m.id == message.id)
        {
            stored.is_read = true;
        }
        Ok(())
    }
}

/// Classifier that replays a script, then repeats a default verdict.
pub(crate) struct ScriptedClassifier {
    pub script: Mutex<VecDeque<Result<Verdict, ClassifyError>>>,
    pub default_verdict: Verdict,
    pub calls: Mutex<u32>,
}

impl ScriptedClassifier {
    pub fn new(default_verdict: Verdict) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_verdict,
            calls: Mutex::new(0),
        }
    }

    pub fn push(&self, step: Result<Verdict, ClassifyError>) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _message: &MailMessage,
        _rule_text: &str,
    ) -> Result<Verdict, ClassifyError> {
        *self.calls.lock().unwrap() += 1;
        match self.script.lock().unwrap().pop_front() {
            Some(step) => step,
            None => Ok(self.default_verdict.clone()),
        }
    }
}

/// Notifier that records sends and can fail the next N of them.
pub(crate) struct MockNotifier {
    pub sends: Mutex<Vec<(String, String)>>,
    pub fail_next: Mutex<u32>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self {
            sends: Mutex::new(Vec::new()),
            fail_next: Mutex::new(0),
        }
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, summary: &str, destination: &str) -> Result<(), NotifyError> {
        let mut fail_next = self.fail_next.lock().unwrap();
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(NotifyError::SendFailed {
                transport: "mock".into(),
                reason: "scripted failure".into(),
            });
        }
        self.sends
            .lock()
            .unwrap()
            .push((summary.to_string(), destination.to_string()));
        Ok(())
    }
}

pub(crate) fn verdict(priority: Priority, summary: Option<&str>) -> Verdict {
    Verdict {
        priority,
        confidence: 0.9,
        reasoning: "test".into(),
        summary: summary.map(String::from),
    }
}

pub(crate) fn message(account: &str, id: &str, subject: &str, hours_ago: i64) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        uid: id.to_string(),
        account: account.to_string(),
        sender: "sender@example.com".into(),
        subject: subject.to_string(),
        body: Some("hello".into()),
        received_at: Utc::now() - Duration::hours(hours_ago),
        is_read: false,
        folder: "INBOX".into(),
    }
}
