//! Poll scheduler — one independent polling worker per enabled account.
//!
//! Each worker owns its account's timing: poll on the configured interval
//! while healthy, exponential backoff with jitter while failing. Workers
//! never overlap their own iterations (the loop awaits each poll before
//! sleeping), and one account's failure never touches another account's
//! loop — the ledger is the only shared state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classify::{Classifier, Verdict};
use crate::config::{MonitorConfig, PollingSettings, RetrySettings};
use crate::connector::{self, MailConnector, MailMessage};
use crate::dispatch::Dispatcher;
use crate::error::{BackendError, ConfigError, Error};
use crate::ledger::{DispatchStatus, Ledger};
use crate::notify::Notifier;

/// Owns the per-account polling workers.
pub struct PollScheduler {
    workers: Vec<AccountWorker>,
}

impl PollScheduler {
    /// Build workers from configuration, creating a connector per enabled
    /// account. Accounts whose connector cannot be built are logged and
    /// skipped; zero usable accounts is an error.
    pub fn from_config(
        config: &MonitorConfig,
        ledger: Arc<dyn Ledger>,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, Error> {
        let mut connectors = Vec::new();
        for (name, account) in config.enabled_accounts() {
            match connector::create_connector(name, account) {
                Ok(c) => connectors.push((name.clone(), c)),
                Err(e) => {
                    warn!(account = %name, error = %e, "Skipping account — connector init failed");
                }
            }
        }
        Self::with_connectors(config, connectors, ledger, classifier, notifier)
    }

    /// Build workers around explicit connectors (tests, custom wiring).
    pub fn with_connectors(
        config: &MonitorConfig,
        connectors: Vec<(String, Arc<dyn MailConnector>)>,
        ledger: Arc<dyn Ledger>,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, Error> {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&ledger),
            notifier,
            config.notifier.destination.clone(),
        ));

        let mut workers = Vec::new();
        for (name, conn) in connectors {
            let Some(account) = config.accounts.get(&name) else {
                warn!(account = %name, "Connector has no matching account config — skipping");
                continue;
            };
            workers.push(AccountWorker {
                account: name,
                settings: account.settings.clone(),
                connector: conn,
                ledger: Arc::clone(&ledger),
                classifier: Arc::clone(&classifier),
                dispatcher: Arc::clone(&dispatcher),
                rule_text: config.classifier.rule_text.clone(),
                poll_interval: Duration::from_secs(config.poll_interval_secs),
                classify_retries: config.classifier.retries,
                retry: config.retry.clone(),
            });
        }

        if workers.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "accounts".into(),
                hint: "no account connector could be initialized".into(),
            }
            .into());
        }
        Ok(Self { workers })
    }

    /// Number of accounts that will be polled.
    pub fn account_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawn one polling task per account.
    ///
    /// Workers exit after their in-flight poll completes once `shutdown`
    /// flips to true; await the handles to drain.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.workers
            .into_iter()
            .map(|worker| {
                let shutdown = shutdown.clone();
                tokio::spawn(worker.run(shutdown))
            })
            .collect()
    }
}

// ── Account worker ──────────────────────────────────────────────────

struct AccountWorker {
    account: String,
    settings: PollingSettings,
    connector: Arc<dyn MailConnector>,
    ledger: Arc<dyn Ledger>,
    classifier: Arc<dyn Classifier>,
    dispatcher: Arc<Dispatcher>,
    rule_text: String,
    poll_interval: Duration,
    classify_retries: u32,
    retry: RetrySettings,
}

impl AccountWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            account = %self.account,
            interval_secs = self.poll_interval.as_secs(),
            unread_only = self.settings.process_only_unread,
            lookback_hours = self.settings.max_lookback_hours,
            "Polling worker started"
        );

        let mut consecutive_failures: u32 = 0;
        let mut alerted = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(processed) => {
                    if consecutive_failures > 0 {
                        info!(account = %self.account, "Account recovered");
                    }
                    consecutive_failures = 0;
                    alerted = false;
                    if processed > 0 {
                        info!(account = %self.account, processed, "Poll complete");
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if e.is_transient() {
                        warn!(
                            account = %self.account,
                            failures = consecutive_failures,
                            error = %e,
                            "Poll failed"
                        );
                    } else {
                        error!(
                            account = %self.account,
                            failures = consecutive_failures,
                            error = %e,
                            "Poll failed — operator intervention likely required"
                        );
                    }
                    if consecutive_failures >= self.retry.alert_after_failures && !alerted {
                        let text = format!(
                            "mail-sentinel: account \"{}\" has failed {} polls in a row. \
                             Last error: {}. Polling continues with backoff.",
                            self.account, consecutive_failures, e
                        );
                        self.dispatcher.notify_operator(&text).await;
                        alerted = true;
                    }
                }
            }

            let delay = if consecutive_failures == 0 {
                self.poll_interval
            } else {
                backoff_delay(consecutive_failures, &self.retry)
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(account = %self.account, "Polling worker stopped");
    }

    /// Run one poll iteration: list → de-duplicate → classify → dispatch.
    ///
    /// Returns the number of messages that entered the pipeline. Backend
    /// errors from listing abort the iteration (and back the account off);
    /// per-message errors are contained inside `process_message`.
    async fn poll_once(&self) -> Result<usize, BackendError> {
        let now = Utc::now();
        let last = match self.ledger.last_poll_success(&self.account).await {
            Ok(last) => last,
            Err(e) => {
                warn!(
                    account = %self.account,
                    error = %e,
                    "Could not read poll state — using the full lookback window"
                );
                None
            }
        };
        let since = poll_window_start(now, last, self.settings.max_lookback_hours);
        debug!(account = %self.account, %since, "Checking for new messages");

        let mut candidates = Vec::new();
        for folder in &self.settings.watched_folders {
            candidates.extend(
                self.connector
                    .list_candidates(folder, since, self.settings.process_only_unread)
                    .await?,
            );
        }

        let mut fresh = Vec::new();
        let mut seen = HashSet::new();
        for message in candidates {
            // A message can be listed from two watched folders; one dispatch.
            if !seen.insert(message.id.clone()) {
                continue;
            }
            match self.ledger.has_succeeded(&self.account, &message.id).await {
                Ok(true) => {}
                Ok(false) => fresh.push(message),
                Err(e) => {
                    warn!(
                        account = %self.account,
                        id = %message.id,
                        error = %e,
                        "Ledger lookup failed — deferring message to next poll"
                    );
                }
            }
        }

        let processed = fresh.len();
        if processed > 0 {
            info!(account = %self.account, count = processed, "Found new messages");
        }

        let retry_pending = AtomicUsize::new(0);
        futures::stream::iter(fresh)
            .for_each_concurrent(self.retry.max_in_flight, |message| {
                let retry_pending = &retry_pending;
                async move {
                    if !self.process_message(message).await {
                        retry_pending.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        // Stamp the window start for the next poll with the time this poll
        // began, so messages arriving mid-poll are not skipped. When a
        // message stayed retry-eligible the stamp is held back: advancing
        // it would push the message out of the next poll's listing and the
        // retry would never happen. The lookback clamp bounds how long the
        // window can stay open.
        let pending = retry_pending.load(Ordering::Relaxed);
        if pending == 0 {
            if let Err(e) = self.ledger.record_poll_success(&self.account, now).await {
                warn!(account = %self.account, error = %e, "Could not record poll success");
            }
        } else {
            debug!(
                account = %self.account,
                pending,
                "Holding poll window open for retry-eligible messages"
            );
        }
        Ok(processed)
    }

    /// Process one candidate end to end. Returns true when the message is
    /// resolved (dispatch succeeded); false keeps it retry-eligible.
    async fn process_message(&self, mut message: MailMessage) -> bool {
        if message.body.is_none() {
            match self.connector.fetch_body(&message).await {
                Ok(body) => message.body = Some(body),
                Err(e) => {
                    warn!(
                        account = %self.account,
                        id = %message.id,
                        error = %e,
                        "Body fetch failed — retrying next poll"
                    );
                    return false;
                }
            }
        }

        let Some(verdict) = self.classify_with_retry(&message).await else {
            return false;
        };
        debug!(
            account = %self.account,
            id = %message.id,
            priority = verdict.priority.as_str(),
            reasoning = %verdict.reasoning,
            "Message classified"
        );

        let status = self
            .dispatcher
            .dispatch(
                self.connector.as_ref(),
                &self.settings.junk_folder,
                &message,
                &verdict,
            )
            .await;
        status == DispatchStatus::Succeeded
    }

    /// Classify with the within-iteration retry bound. `None` means the
    /// oracle kept failing; the message gets no ledger entry and re-enters
    /// the pipeline on the next poll where it is listed.
    async fn classify_with_retry(&self, message: &MailMessage) -> Option<Verdict> {
        let attempts = self.classify_retries.max(1);
        for attempt in 1..=attempts {
            match self.classifier.classify(message, &self.rule_text).await {
                Ok(verdict) => return Some(verdict),
                Err(e) => {
                    warn!(
                        account = %self.account,
                        id = %message.id,
                        attempt,
                        error = %e,
                        "Classification attempt failed"
                    );
                }
            }
        }
        error!(
            account = %self.account,
            id = %message.id,
            attempts,
            "Classification failed — message stays eligible for the next poll"
        );
        None
    }
}

// ── Timing helpers ──────────────────────────────────────────────────

/// Start of the candidate window for a poll beginning at `now`.
///
/// The window opens at the last successful poll so nothing is skipped
/// after a short gap, clamped to the lookback limit so a long outage
/// cannot trigger unbounded backlog reprocessing.
pub(crate) fn poll_window_start(
    now: DateTime<Utc>,
    last_success: Option<DateTime<Utc>>,
    max_lookback_hours: u32,
) -> DateTime<Utc> {
    let floor = now - chrono::Duration::hours(i64::from(max_lookback_hours));
    match last_success {
        Some(last) if last > floor => last,
        _ => floor,
    }
}

/// Exponential backoff with jitter for a failing account.
pub(crate) fn backoff_delay(consecutive_failures: u32, retry: &RetrySettings) -> Duration {
    let base = retry.backoff_base_secs.max(1);
    let cap = retry.backoff_cap_secs.max(base);
    let exp = consecutive_failures.saturating_sub(1).min(16);
    let capped = base.saturating_mul(1u64 << exp).min(cap);

    // Up to 20% jitter keeps accounts that failed together from re-polling
    // in lockstep.
    let jitter = if capped >= 5 {
        use rand::Rng;
        rand::thread_rng().gen_range(0..=capped / 5)
    } else {
        0
    };
    Duration::from_secs(capped + jitter)
}
