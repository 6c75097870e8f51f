//! Mail account adapter used by the webmail stores
//!
//! [`MailTransport`] is the narrow set of mailbox operations a webmail store
//! needs: log in, send a message with one attachment, search by subject,
//! fetch, two-phase delete, archive and query the quota. How those map onto
//! a real provider (IMAP, an HTTP API, page scraping) is the adapter's
//! business.
//!
//! [`MemoryMailbox`] keeps messages in memory and enforces a message size
//! limit. Attachments travel base64-encoded, as they would in a real mail.

use crate::error::{Result, VaultError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// One message as returned by a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    /// Provider message id
    pub id: String,
    /// Subject line
    pub subject: String,
}

/// Mailbox usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quota {
    /// Bytes used
    pub used: u64,
    /// Bytes allowed
    pub limit: u64,
}

impl Quota {
    /// Bytes still free
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Operations a webmail store performs against a mail account
pub trait MailTransport: Send + Sync {
    /// Authenticated connection
    type Session: Send;

    /// Open a session
    ///
    /// # Errors
    ///
    /// - [`VaultError::AuthenticationFailed`] if the credentials are refused
    fn login(&self, account: &str, password: &str) -> Result<Self::Session>;

    /// Send a message to the account itself with one attachment
    fn send(&self, session: &mut Self::Session, subject: &str, attachment: &[u8]) -> Result<()>;

    /// Messages matching a provider search query
    fn search(&self, session: &mut Self::Session, query: &str) -> Result<Vec<MessageSummary>>;

    /// Decoded attachment of a message
    fn fetch_attachment(&self, session: &mut Self::Session, id: &str) -> Result<Vec<u8>>;

    /// Move messages to the trash
    fn trash(&self, session: &mut Self::Session, ids: &[String]) -> Result<()>;

    /// Permanently remove trashed messages
    fn purge(&self, session: &mut Self::Session, ids: &[String]) -> Result<()>;

    /// Messages in the primary inbox view
    fn inbox(&self, session: &mut Self::Session) -> Result<Vec<MessageSummary>>;

    /// Label messages and take them out of the inbox
    fn archive(&self, session: &mut Self::Session, ids: &[String], label: &str) -> Result<()>;

    /// Current usage
    fn quota(&self, session: &mut Self::Session) -> Result<Quota>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    body: String,
    attachment_len: u64,
    labels: Vec<String>,
    in_inbox: bool,
    trashed: bool,
}

/// Session handed out by [`MemoryMailbox`]
#[derive(Debug)]
pub struct MemorySession {
    serial: u64,
}

impl MemorySession {
    /// Login number of this session, starting at 1
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// In-memory mail account
#[derive(Debug)]
pub struct MemoryMailbox {
    account: String,
    password: String,
    message_limit: u64,
    quota_limit: u64,
    messages: DashMap<String, StoredMessage>,
    next_id: AtomicU64,
    logins: AtomicU64,
    sends: AtomicUsize,
    refuse_sends: AtomicBool,
}

impl MemoryMailbox {
    /// Mailbox for `account` accepting `password`, with a per-message size
    /// limit and a total quota
    pub fn new(
        account: impl Into<String>,
        password: impl Into<String>,
        message_limit: u64,
        quota_limit: u64,
    ) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
            message_limit,
            quota_limit,
            messages: DashMap::new(),
            next_id: AtomicU64::new(1),
            logins: AtomicU64::new(0),
            sends: AtomicUsize::new(0),
            refuse_sends: AtomicBool::new(false),
        }
    }

    /// Successful logins so far
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    /// Messages sent so far
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Messages not yet purged
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Subjects of messages still in the inbox
    pub fn inbox_subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.in_inbox && !m.trashed)
            .map(|m| m.subject.clone())
            .collect();
        subjects.sort();
        subjects
    }

    /// Make every following send fail with a transport error
    pub fn refuse_sends(&self, refuse: bool) {
        self.refuse_sends.store(refuse, Ordering::SeqCst);
    }

    /// Put a message in the inbox, bypassing size checks
    pub fn deliver(&self, subject: &str, attachment: &[u8]) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.messages.insert(
            id.clone(),
            StoredMessage {
                subject: subject.to_string(),
                body: STANDARD.encode(attachment),
                attachment_len: attachment.len() as u64,
                labels: Vec::new(),
                in_inbox: true,
                trashed: false,
            },
        );
        id
    }

    fn summaries(&self, filter: impl Fn(&StoredMessage) -> bool) -> Vec<MessageSummary> {
        let mut found: Vec<MessageSummary> = self
            .messages
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| MessageSummary {
                id: entry.key().clone(),
                subject: entry.subject.clone(),
            })
            .collect();
        found.sort_by_key(|m| m.id.parse::<u64>().unwrap_or(u64::MAX));
        found
    }
}

/// Text inside `subject:"..."`, or the whole query
fn subject_term(query: &str) -> &str {
    query
        .strip_prefix("subject:\"")
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(query)
}

impl MailTransport for MemoryMailbox {
    type Session = MemorySession;

    fn login(&self, account: &str, password: &str) -> Result<MemorySession> {
        if account != self.account || password != self.password {
            return Err(VaultError::authentication(account, "invalid username or password"));
        }
        let serial = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Mailbox login #{} for {}", serial, account);
        Ok(MemorySession { serial })
    }

    fn send(&self, _session: &mut MemorySession, subject: &str, attachment: &[u8]) -> Result<()> {
        if self.refuse_sends.load(Ordering::SeqCst) {
            return Err(VaultError::transport("connection reset while sending"));
        }
        let encoded_len = STANDARD.encode(attachment).len() as u64;
        if encoded_len > self.message_limit {
            return Err(VaultError::transport(format!(
                "message of {encoded_len} bytes exceeds the {} byte limit",
                self.message_limit
            )));
        }
        self.deliver(subject, attachment);
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn search(&self, _session: &mut MemorySession, query: &str) -> Result<Vec<MessageSummary>> {
        let term = subject_term(query);
        Ok(self.summaries(|m| !m.trashed && m.subject.contains(term)))
    }

    fn fetch_attachment(&self, _session: &mut MemorySession, id: &str) -> Result<Vec<u8>> {
        let message = self
            .messages
            .get(id)
            .ok_or_else(|| VaultError::ContentNotFound(format!("message {id}")))?;
        STANDARD
            .decode(&message.body)
            .map_err(|e| VaultError::transport(format!("bad attachment encoding: {e}")))
    }

    fn trash(&self, _session: &mut MemorySession, ids: &[String]) -> Result<()> {
        for id in ids {
            if let Some(mut message) = self.messages.get_mut(id) {
                message.trashed = true;
                message.in_inbox = false;
            }
        }
        Ok(())
    }

    fn purge(&self, _session: &mut MemorySession, ids: &[String]) -> Result<()> {
        for id in ids {
            self.messages.remove_if(id, |_, m| m.trashed);
        }
        Ok(())
    }

    fn inbox(&self, _session: &mut MemorySession) -> Result<Vec<MessageSummary>> {
        Ok(self.summaries(|m| m.in_inbox && !m.trashed))
    }

    fn archive(&self, _session: &mut MemorySession, ids: &[String], label: &str) -> Result<()> {
        for id in ids {
            if let Some(mut message) = self.messages.get_mut(id) {
                message.in_inbox = false;
                if !message.labels.iter().any(|l| l == label) {
                    message.labels.push(label.to_string());
                }
            }
        }
        Ok(())
    }

    fn quota(&self, _session: &mut MemorySession) -> Result<Quota> {
        let used = self.messages.iter().map(|m| m.attachment_len).sum();
        Ok(Quota {
            used,
            limit: self.quota_limit,
        })
    }
}
