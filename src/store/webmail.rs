//! Mail accounts as blob stores
//!
//! A [`WebMailFileStore`] sends each encoded blob to its own account, one
//! message per chunk. The subject names the revision guid, the chunk's part
//! number and the number of parts sent:
//!
//! ```text
//! vaultkeeper backup 1B2M2Y8AsgTpgAmY7PhCfg [0/2]
//! vaultkeeper backup 1B2M2Y8AsgTpgAmY7PhCfg [1/2]
//! ```
//!
//! Restoring searches for the guid, orders what comes back by part number
//! and reassembles the blob. A part that is missing, out of range or seen
//! twice means the search result is incomplete and is reported as
//! [`VaultError::Inconsistent`]. Subjects without a part count (`[0]`) are
//! still read; their set is taken to be as large as what the search found.
//!
//! The guid is a content digest, so the same blob may be offered again. A
//! complete set already in the mailbox is reused; an incomplete one is
//! purged before sending.
//!
//! Attachments are base64-encoded in transit, so a chunk is at most three
//! quarters of the message limit.
//!
//! Provider specifics (size limit, search syntax, archive label) come from a
//! [`WebMailProvider`] profile. Mailbox access goes through a
//! [`MailTransport`].

use super::{FileStore, Listeners, MailTransport, Quota, StoreEvent, StoreKind, StoreListener};
use crate::error::{Result, VaultError};
use crate::progress::TransferProgress;
use crate::revision::RevisionIdentifier;
use crate::transport::{Chunker, Pipeline};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Fixed leading words of every backup subject
pub const SUBJECT_PREFIX: &str = "vaultkeeper backup";

/// Most sessions kept for reuse
pub const MAX_POOLED_SESSIONS: usize = 3;

/// Pooled sessions idle longer than this are discarded
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

static SUBJECT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^vaultkeeper backup (\S+) \[(\d+)(?:/(\d+))?\]$").expect("valid subject pattern")
});

/// Subject of part `part` of `total` of the blob stored under `guid`
pub fn subject_for(guid: &str, part: usize, total: usize) -> String {
    format!("{SUBJECT_PREFIX} {guid} [{part}/{total}]")
}

/// A backup subject taken apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectParts<'a> {
    /// Revision guid
    pub guid: &'a str,
    /// Zero-based part number
    pub part: usize,
    /// Number of parts sent, absent in older subjects
    pub total: Option<usize>,
}

/// Guid, part number and part count of a backup subject
pub fn parse_subject(subject: &str) -> Option<SubjectParts<'_>> {
    let captures = SUBJECT_PATTERN.captures(subject)?;
    let guid = captures.get(1)?.as_str();
    let part = captures.get(2)?.as_str().parse().ok()?;
    let total = match captures.get(3) {
        Some(total) => Some(total.as_str().parse().ok()?),
        None => None,
    };
    Some(SubjectParts { guid, part, total })
}

/// Message of one part found by a search
#[derive(Debug, Clone)]
struct FoundPart {
    id: String,
    part: usize,
    total: Option<usize>,
}

/// Order the parts of `guid` into a complete set of message ids
fn order_parts(guid: &str, found: &[FoundPart]) -> Result<Vec<String>> {
    if found.is_empty() {
        return Ok(Vec::new());
    }
    let mut totals = found.iter().filter_map(|p| p.total);
    let expected = match totals.next() {
        Some(total) => {
            if totals.any(|t| t != total) {
                return Err(VaultError::Inconsistent(format!(
                    "parts of {guid} disagree on the number of parts"
                )));
            }
            total
        }
        None => found.len(),
    };
    if expected > found.len() {
        return Err(VaultError::Inconsistent(format!(
            "{} of {expected} parts of {guid} found",
            found.len()
        )));
    }

    let mut ordered: Vec<Option<&str>> = vec![None; expected];
    for part in found {
        let slot = ordered.get_mut(part.part).ok_or_else(|| {
            VaultError::Inconsistent(format!(
                "part {} of {guid} is out of range for {expected} parts",
                part.part
            ))
        })?;
        if slot.replace(part.id.as_str()).is_some() {
            return Err(VaultError::Inconsistent(format!(
                "part {} of {guid} found twice",
                part.part
            )));
        }
    }
    ordered
        .into_iter()
        .enumerate()
        .map(|(part, id)| {
            id.map(str::to_string).ok_or_else(|| {
                VaultError::Inconsistent(format!("part {part} of {guid} is missing"))
            })
        })
        .collect()
}

/// What differs between webmail providers
pub trait WebMailProvider: Send + Sync + 'static {
    /// Store kind reported for this provider
    const KIND: StoreKind;
    /// Largest message the provider accepts
    const MESSAGE_LIMIT: u64;
    /// Part of the limit reserved for headers and MIME framing
    const HEADER_ALLOWANCE: u64;
    /// Label given to archived backup messages
    const ARCHIVE_LABEL: &'static str;

    /// Provider search query for messages whose subject contains `text`
    fn search_query(text: &str) -> String;
}

/// Settings of a webmail store
///
/// The account password is not kept here: it is the secret parameter
/// `"<name>.password"` of the vault configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebMailSettings {
    /// Store name
    pub name: String,
    /// Account (address) to log in as
    pub account: String,
    /// Largest encoded attachment to send, below the provider limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing_limit: Option<u64>,
    /// Byte budget below the account quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
}

impl WebMailSettings {
    /// Secret parameter key holding the password of store `name`
    pub fn password_parameter(name: &str) -> String {
        format!("{name}.password")
    }
}

struct PooledSession<S> {
    session: S,
    returned: Instant,
}

/// Store keeping blobs as mail messages
pub struct WebMailFileStore<P: WebMailProvider, T: MailTransport> {
    settings: WebMailSettings,
    password: Option<String>,
    transport: Arc<T>,
    pipeline: Arc<Pipeline>,
    pool: Mutex<Vec<PooledSession<T::Session>>>,
    idle_timeout: Duration,
    quota: Mutex<Option<Quota>>,
    listeners: Listeners,
    _provider: PhantomData<P>,
}

impl<P: WebMailProvider, T: MailTransport> std::fmt::Debug for WebMailFileStore<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebMailFileStore")
            .field("kind", &P::KIND)
            .field("settings", &self.settings)
            .field("pooled_sessions", &self.pool.lock().len())
            .field("quota", &*self.quota.lock())
            .finish()
    }
}

impl<P: WebMailProvider, T: MailTransport> WebMailFileStore<P, T> {
    /// Create a store over `transport`
    ///
    /// No session is opened until the first operation.
    pub fn new(
        settings: WebMailSettings,
        password: Option<String>,
        transport: Arc<T>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            settings,
            password,
            transport,
            pipeline,
            pool: Mutex::new(Vec::new()),
            idle_timeout: SESSION_IDLE_TIMEOUT,
            quota: Mutex::new(None),
            listeners: Listeners::default(),
            _provider: PhantomData,
        }
    }

    /// Override the pooled session idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Settings of this store
    pub fn settings(&self) -> &WebMailSettings {
        &self.settings
    }

    /// Largest chunk, in bytes before base64 encoding
    pub fn chunk_size(&self) -> usize {
        let provider = P::MESSAGE_LIMIT.saturating_sub(P::HEADER_ALLOWANCE);
        let limit = self.settings.outgoing_limit.map_or(provider, |l| l.min(provider));
        ((limit / 4) * 3).max(3) as usize
    }

    /// Sessions currently pooled
    pub fn pooled_sessions(&self) -> usize {
        self.pool.lock().len()
    }

    fn checkout(&self) -> Result<T::Session> {
        {
            let mut pool = self.pool.lock();
            while let Some(pooled) = pool.pop() {
                if pooled.returned.elapsed() < self.idle_timeout {
                    trace!("Reusing pooled session for '{}'", self.settings.name);
                    return Ok(pooled.session);
                }
                debug!("Discarding idle session for '{}'", self.settings.name);
            }
        }
        let password = self.password.as_deref().ok_or_else(|| {
            VaultError::authentication(&self.settings.name, "no password configured")
        })?;
        info!("Logging in to '{}' as {}", self.settings.name, self.settings.account);
        self.transport.login(&self.settings.account, password)
    }

    fn checkin(&self, session: T::Session) {
        let mut pool = self.pool.lock();
        if pool.len() < MAX_POOLED_SESSIONS {
            pool.push(PooledSession {
                session,
                returned: Instant::now(),
            });
        }
    }

    /// Run `op` with a checked-out session
    ///
    /// The session goes back to the pool only if `op` succeeded.
    fn with_session<R>(&self, op: impl FnOnce(&mut T::Session) -> Result<R>) -> Result<R> {
        let mut session = self.checkout()?;
        let result = op(&mut session);
        if result.is_ok() {
            self.checkin(session);
        }
        result
    }

    /// Every message whose subject names `guid`
    fn find_parts(&self, session: &mut T::Session, guid: &str) -> Result<Vec<FoundPart>> {
        let query = P::search_query(&format!("{SUBJECT_PREFIX} {guid}"));
        let found = self.transport.search(session, &query)?;
        Ok(found
            .into_iter()
            .filter_map(|m| {
                let parsed = parse_subject(&m.subject)?;
                (parsed.guid == guid).then(|| FoundPart {
                    part: parsed.part,
                    total: parsed.total,
                    id: m.id,
                })
            })
            .collect())
    }

    /// Ids of every message stored for `guid`, ordered by part number
    ///
    /// Returns an empty list if nothing matches.
    fn locate_parts(&self, session: &mut T::Session, guid: &str) -> Result<Vec<String>> {
        order_parts(guid, &self.find_parts(session, guid)?)
    }

    /// Whether a complete set of parts for `guid` is already stored
    ///
    /// An incomplete or garbled set is trashed and purged so a fresh upload
    /// does not mix with it.
    fn reuse_or_clear(&self, session: &mut T::Session, guid: &str) -> Result<bool> {
        let found = self.find_parts(session, guid)?;
        if found.is_empty() {
            return Ok(false);
        }
        match order_parts(guid, &found) {
            Ok(_) => Ok(true),
            Err(VaultError::Inconsistent(reason)) => {
                warn!("Replacing stored parts of {}: {}", guid, reason);
                let ids: Vec<String> = found.into_iter().map(|p| p.id).collect();
                self.transport.trash(session, &ids)?;
                self.transport.purge(session, &ids)?;
                // Sizes of the purged parts are unknown; ask the provider again
                *self.quota.lock() = None;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn cached_quota(&self) -> Result<Quota> {
        if let Some(quota) = *self.quota.lock() {
            return Ok(quota);
        }
        let quota = self.with_session(|session| self.transport.quota(session))?;
        *self.quota.lock() = Some(quota);
        Ok(quota)
    }

    fn adjust_quota(&self, stored: i64) {
        if let Some(quota) = self.quota.lock().as_mut() {
            quota.used = quota.used.saturating_add_signed(stored);
        }
    }

    fn effective(&self, quota: Quota) -> u64 {
        let limit = self.settings.capacity.map_or(quota.limit, |c| c.min(quota.limit));
        limit.saturating_sub(quota.used)
    }
}

impl<P: WebMailProvider, T: MailTransport> FileStore for WebMailFileStore<P, T> {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> StoreKind {
        P::KIND
    }

    fn is_configured(&self) -> bool {
        !self.settings.account.is_empty() && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    fn can_backup_file(&self, _source: &Path, estimated_size: u64) -> bool {
        match self.available_bytes() {
            Ok(available) => estimated_size <= available,
            Err(e) => {
                warn!("Cannot query '{}': {}", self.settings.name, e);
                false
            }
        }
    }

    #[instrument(skip(self, identifier, progress), fields(store = %self.settings.name))]
    fn backup_file(
        &self,
        source: &Path,
        identifier: &mut RevisionIdentifier,
        progress: &mut dyn TransferProgress,
    ) -> Result<u64> {
        let blob = self.pipeline.encode_file(source, progress)?;
        let size = blob.len() as u64;
        let guid = identifier.guid.clone();

        if self.with_session(|session| self.reuse_or_clear(session, &guid))? {
            debug!("Blob {} already on '{}'", guid, self.settings.name);
            identifier.handler_name = self.settings.name.clone();
            return Ok(size);
        }

        let available = self.available_bytes()?;
        if size > available {
            return Err(VaultError::InsufficientSpace {
                needed: size,
                available,
            });
        }

        let chunker = Chunker::new(self.chunk_size())?;
        let parts = chunker.split(&blob);
        debug!("Sending {} as {} message(s)", guid, parts.len());

        let sent = self.with_session(|session| {
            for (index, part) in parts.iter().enumerate() {
                if !progress.transferred(0) {
                    return Err(VaultError::OperationCanceled);
                }
                self.transport.send(session, &subject_for(&guid, index, parts.len()), part)?;
                if !progress.transferred(0) {
                    return Err(VaultError::OperationCanceled);
                }
            }
            Ok(())
        });
        if let Err(e) = sent {
            // Do not leave a partial set of parts behind
            let cleanup = self.with_session(|session| {
                let ids: Vec<String> =
                    self.find_parts(session, &guid)?.into_iter().map(|p| p.id).collect();
                if !ids.is_empty() {
                    self.transport.trash(session, &ids)?;
                    self.transport.purge(session, &ids)?;
                }
                Ok(())
            });
            if let Err(cleanup) = cleanup {
                warn!("Could not remove partial upload of {}: {}", guid, cleanup);
            }
            return Err(e);
        }

        self.adjust_quota(size as i64);
        identifier.handler_name = self.settings.name.clone();
        self.listeners.emit(&StoreEvent::ContentStored {
            store: self.settings.name.clone(),
            guid,
            bytes: size,
        });
        Ok(size)
    }

    #[instrument(skip(self, identifier, progress), fields(store = %self.settings.name))]
    fn restore_file(
        &self,
        identifier: &RevisionIdentifier,
        as_of: DateTime<Utc>,
        progress: &mut dyn TransferProgress,
    ) -> Result<Option<Vec<u8>>> {
        let guid = &identifier.guid;
        let chunks = self.with_session(|session| {
            let ids = self.locate_parts(session, guid)?;
            if ids.is_empty() {
                return Ok(None);
            }
            let mut chunks = Vec::with_capacity(ids.len());
            for id in &ids {
                if !progress.transferred(0) {
                    return Err(VaultError::OperationCanceled);
                }
                let chunk = self.transport.fetch_attachment(session, id)?;
                if !progress.transferred(chunk.len() as u64) {
                    return Err(VaultError::OperationCanceled);
                }
                chunks.push(chunk);
            }
            Ok(Some(chunks))
        })?;

        match chunks {
            Some(chunks) => self.pipeline.decode(&Chunker::reassemble(chunks), as_of).map(Some),
            None => {
                warn!("No messages found for {}", guid);
                Ok(None)
            }
        }
    }

    fn delete_file(&self, identifier: &RevisionIdentifier, stored_size: u64) -> Result<()> {
        let guid = &identifier.guid;
        let removed = self.with_session(|session| {
            // Every part goes, complete set or not
            let ids: Vec<String> = self.find_parts(session, guid)?.into_iter().map(|p| p.id).collect();
            if ids.is_empty() {
                return Ok(false);
            }
            self.transport.trash(session, &ids)?;
            self.transport.purge(session, &ids)?;
            Ok(true)
        })?;
        if removed {
            self.adjust_quota(-(stored_size as i64));
            self.listeners.emit(&StoreEvent::ContentDeleted {
                store: self.settings.name.clone(),
                guid: guid.clone(),
            });
        } else {
            debug!("Nothing to delete for {}", guid);
        }
        Ok(())
    }

    fn available_bytes(&self) -> Result<u64> {
        Ok(self.effective(self.cached_quota()?))
    }

    fn perform_maintenance(&self) -> Result<()> {
        let quota = self.with_session(|session| {
            let backups: Vec<String> = self
                .transport
                .inbox(session)?
                .into_iter()
                .filter(|m| parse_subject(&m.subject).is_some())
                .map(|m| m.id)
                .collect();
            if !backups.is_empty() {
                info!("Archiving {} backup message(s) in '{}'", backups.len(), self.settings.name);
                self.transport.archive(session, &backups, P::ARCHIVE_LABEL)?;
            }
            self.transport.quota(session)
        })?;

        let changed = self.quota.lock().replace(quota) != Some(quota);
        if changed {
            self.listeners.emit(&StoreEvent::AvailabilityChanged {
                store: self.settings.name.clone(),
            });
        }
        Ok(())
    }

    fn prepare_for_shutdown(&self) -> Result<()> {
        let dropped = std::mem::take(&mut *self.pool.lock()).len();
        debug!("Released {} session(s) of '{}'", dropped, self.settings.name);
        Ok(())
    }

    fn subscribe(&self, listener: StoreListener) {
        self.listeners.push(listener);
    }
}
