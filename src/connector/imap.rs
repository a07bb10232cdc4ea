//! IMAP connector — raw IMAP over rustls TLS, blocking I/O in
//! `spawn_blocking`.
//!
//! Speaks just enough IMAP4rev1 for the pipeline: LOGIN, SELECT,
//! UID SEARCH, UID FETCH, UID STORE, UID COPY, EXPUNGE. Messages are
//! parsed with `mail-parser`; listing uses BODY.PEEK[] so it never sets
//! `\Seen` as a side effect — read state only changes when the dispatcher
//! asks for it.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::config::{self, ImapParams};
use crate::connector::{MailConnector, MailMessage, strip_html};
use crate::error::{BackendError, ConfigError};

/// Socket read timeout — bounds how long a wedged server can stall a poll.
const IMAP_IO_TIMEOUT: Duration = Duration::from_secs(30);

type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// IMAP connector for one account.
pub struct ImapConnector {
    account: String,
    params: ImapParams,
    password: SecretString,
}

impl ImapConnector {
    pub fn new(account: &str, params: ImapParams) -> Result<Self, ConfigError> {
        let password = config::secret_from_env(&params.password_env)?;
        Ok(Self {
            account: account.to_string(),
            params,
            password,
        })
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    fn account(&self) -> &str {
        &self.account
    }

    async fn list_candidates(
        &self,
        folder: &str,
        since: DateTime<Utc>,
        unread_only: bool,
    ) -> Result<Vec<MailMessage>, BackendError> {
        let account = self.account.clone();
        let params = self.params.clone();
        let password = self.password.clone();
        let folder = folder.to_string();
        run_blocking(&self.account, move || {
            list_blocking(&account, &params, &password, &folder, since, unread_only)
        })
        .await
    }

    async fn fetch_body(&self, message: &MailMessage) -> Result<String, BackendError> {
        let account = self.account.clone();
        let params = self.params.clone();
        let password = self.password.clone();
        let folder = message.folder.clone();
        let uid = message.uid.clone();
        run_blocking(&self.account, move || {
            fetch_body_blocking(&account, &params, &password, &folder, &uid)
        })
        .await
    }

    async fn move_to(&self, message: &MailMessage, folder: &str) -> Result<(), BackendError> {
        let account = self.account.clone();
        let params = self.params.clone();
        let password = self.password.clone();
        let source = message.folder.clone();
        let uid = message.uid.clone();
        let target = folder.to_string();
        run_blocking(&self.account, move || {
            move_blocking(&account, &params, &password, &source, &uid, &target)
        })
        .await
    }

    async fn mark_read(&self, message: &MailMessage) -> Result<(), BackendError> {
        let account = self.account.clone();
        let params = self.params.clone();
        let password = self.password.clone();
        let folder = message.folder.clone();
        let uid = message.uid.clone();
        run_blocking(&self.account, move || {
            mark_read_blocking(&account, &params, &password, &folder, &uid)
        })
        .await
    }
}

/// Run a blocking IMAP operation on the blocking pool.
async fn run_blocking<T, F>(account: &str, op: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    let account = account.to_string();
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| BackendError::transient(account, format!("IMAP task panicked: {e}")))?
}

// ── IMAP session ────────────────────────────────────────────────────

/// One authenticated IMAP session over TLS. Opened per operation; the
/// connectors hold no live connections between polls.
struct ImapSession {
    stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    tag: u32,
}

impl ImapSession {
    fn connect(server: &str, port: u16) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((server, port))?;
        tcp.set_read_timeout(Some(IMAP_IO_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(server.to_string())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };
        // Server greeting
        session.read_line()?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.stream, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send one command and collect lines up to the tagged completion.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, ImapError> {
        self.tag += 1;
        let tag = format!("S{}", self.tag);
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.stream, full.as_bytes())?;
        IoWrite::flush(&mut self.stream)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Did the tagged completion line report OK?
fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .is_some_and(|l| l.split_whitespace().nth(1) == Some("OK"))
}

fn open_session(
    account: &str,
    params: &ImapParams,
    password: &SecretString,
) -> Result<ImapSession, BackendError> {
    let mut session = ImapSession::connect(&params.server, params.port).map_err(|e| {
        BackendError::transient(
            account,
            format!("connect {}:{}: {e}", params.server, params.port),
        )
    })?;

    let login = session
        .command(&format!(
            "LOGIN \"{}\" \"{}\"",
            params.username,
            password.expose_secret()
        ))
        .map_err(|e| BackendError::transient(account, format!("login: {e}")))?;
    if !tagged_ok(&login) {
        return Err(BackendError::permanent(
            account,
            "IMAP login rejected — check credentials",
        ));
    }
    Ok(session)
}

fn select_folder(
    session: &mut ImapSession,
    account: &str,
    folder: &str,
) -> Result<(), BackendError> {
    let select = session
        .command(&format!("SELECT \"{folder}\""))
        .map_err(|e| BackendError::transient(account, format!("select {folder}: {e}")))?;
    if !tagged_ok(&select) {
        return Err(BackendError::permanent(
            account,
            format!("folder {folder} cannot be selected"),
        ));
    }
    Ok(())
}

// ── Operations (blocking) ───────────────────────────────────────────

fn list_blocking(
    account: &str,
    params: &ImapParams,
    password: &SecretString,
    folder: &str,
    since: DateTime<Utc>,
    unread_only: bool,
) -> Result<Vec<MailMessage>, BackendError> {
    let mut session = open_session(account, params, password)?;
    select_folder(&mut session, account, folder)?;

    let criteria = if unread_only {
        format!("UNSEEN SINCE {}", imap_date(since))
    } else {
        format!("SINCE {}", imap_date(since))
    };
    let search = session
        .command(&format!("UID SEARCH {criteria}"))
        .map_err(|e| BackendError::transient(account, format!("search: {e}")))?;
    if !tagged_ok(&search) {
        return Err(BackendError::transient(account, "UID SEARCH failed"));
    }

    let uids = parse_search_uids(&search);
    let mut messages = Vec::new();

    for uid in &uids {
        let fetch = match session.command(&format!("UID FETCH {uid} (FLAGS BODY.PEEK[])")) {
            Ok(lines) => lines,
            Err(e) => {
                return Err(BackendError::transient(account, format!("fetch {uid}: {e}")));
            }
        };
        if !tagged_ok(&fetch) {
            warn!(account, uid = %uid, "UID FETCH rejected — skipping message");
            continue;
        }

        let is_read = fetch
            .iter()
            .find(|l| l.contains("FLAGS ("))
            .is_some_and(|l| l.contains("\\Seen"));

        // Literal payload sits between the untagged FETCH line and the
        // closing paren / tagged completion.
        let raw: String = fetch
            .iter()
            .skip(1)
            .take(fetch.len().saturating_sub(2))
            .cloned()
            .collect();

        let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) else {
            warn!(account, uid = %uid, "Unparseable message — skipping");
            continue;
        };

        let received_at = message_received_at(&parsed);
        if received_at < since {
            // SINCE is date-granular; refine to the exact window.
            continue;
        }

        // Message-ID is the stable identity; UIDs are only stable within
        // one folder's UIDVALIDITY epoch, so they are the fallback.
        let id = parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{folder}/{uid}"));

        messages.push(MailMessage {
            id,
            uid: uid.clone(),
            account: account.to_string(),
            sender: extract_sender(&parsed),
            subject: parsed.subject().unwrap_or("(no subject)").to_string(),
            body: Some(extract_text(&parsed)),
            received_at,
            is_read,
            folder: folder.to_string(),
        });
    }

    session.logout();
    debug!(account, folder, count = messages.len(), "IMAP listing complete");
    Ok(messages)
}

fn fetch_body_blocking(
    account: &str,
    params: &ImapParams,
    password: &SecretString,
    folder: &str,
    uid: &str,
) -> Result<String, BackendError> {
    let mut session = open_session(account, params, password)?;
    select_folder(&mut session, account, folder)?;

    let fetch = session
        .command(&format!("UID FETCH {uid} (BODY.PEEK[])"))
        .map_err(|e| BackendError::transient(account, format!("fetch body {uid}: {e}")))?;
    session.logout();

    if !tagged_ok(&fetch) {
        return Err(BackendError::transient(
            account,
            format!("UID FETCH {uid} rejected"),
        ));
    }

    let raw: String = fetch
        .iter()
        .skip(1)
        .take(fetch.len().saturating_sub(2))
        .cloned()
        .collect();

    match MessageParser::default().parse(raw.as_bytes()) {
        Some(parsed) => Ok(extract_text(&parsed)),
        None => Err(BackendError::transient(
            account,
            format!("message {uid} did not parse"),
        )),
    }
}

fn move_blocking(
    account: &str,
    params: &ImapParams,
    password: &SecretString,
    source: &str,
    uid: &str,
    target: &str,
) -> Result<(), BackendError> {
    let mut session = open_session(account, params, password)?;
    select_folder(&mut session, account, source)?;

    // Absent UID means a prior attempt already moved it: no-op success.
    let probe = session
        .command(&format!("UID SEARCH UID {uid}"))
        .map_err(|e| BackendError::transient(account, format!("move probe: {e}")))?;
    if parse_search_uids(&probe).is_empty() {
        debug!(account, uid, target, "Message already moved");
        session.logout();
        return Ok(());
    }

    let copy = session
        .command(&format!("UID COPY {uid} \"{target}\""))
        .map_err(|e| BackendError::transient(account, format!("copy: {e}")))?;
    if !tagged_ok(&copy) {
        session.logout();
        let detail = copy.last().cloned().unwrap_or_default();
        if detail.contains("TRYCREATE") {
            return Err(BackendError::permanent(
                account,
                format!("target folder {target} does not exist"),
            ));
        }
        return Err(BackendError::transient(
            account,
            format!("UID COPY to {target} failed: {}", detail.trim()),
        ));
    }

    let delete = session
        .command(&format!("UID STORE {uid} +FLAGS (\\Deleted)"))
        .map_err(|e| BackendError::transient(account, format!("store deleted: {e}")))?;
    if !tagged_ok(&delete) {
        session.logout();
        return Err(BackendError::transient(account, "UID STORE \\Deleted failed"));
    }
    let _ = session.command("EXPUNGE");
    session.logout();
    Ok(())
}

fn mark_read_blocking(
    account: &str,
    params: &ImapParams,
    password: &SecretString,
    folder: &str,
    uid: &str,
) -> Result<(), BackendError> {
    let mut session = open_session(account, params, password)?;
    select_folder(&mut session, account, folder)?;

    let store = session
        .command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))
        .map_err(|e| BackendError::transient(account, format!("store seen: {e}")))?;
    session.logout();

    if tagged_ok(&store) {
        Ok(())
    } else {
        Err(BackendError::transient(account, "UID STORE \\Seen failed"))
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Format a timestamp for IMAP SEARCH SINCE (e.g. `7-Aug-2026`).
pub(crate) fn imap_date(ts: DateTime<Utc>) -> String {
    ts.format("%-d-%b-%Y").to_string()
}

/// Collect UIDs from untagged `* SEARCH` response lines.
fn parse_search_uids(lines: &[String]) -> Vec<String> {
    let mut uids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            uids.extend(
                line.split_whitespace()
                    .skip(2)
                    .map(|s| s.trim().to_string()),
            );
        }
    }
    uids
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    "(no readable content)".to_string()
}

/// Received timestamp from the Date header, or now when absent.
fn message_received_at(parsed: &mail_parser::Message) -> DateTime<Utc> {
    parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(
                        u32::from(d.hour),
                        u32::from(d.minute),
                        u32::from(d.second),
                    )
                })
                .map(|n| n.and_utc())
        })
        .unwrap_or_else(Utc::now)
}
