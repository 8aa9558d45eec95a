//! Mailbox stream: lifecycle controller and per-message fetch surface.
//!
//! A [`MailboxStream`] is the open handle for one mailbox file. It owns the
//! file handle, the high-water mark of bytes already parsed, the UID
//! counters, a per-stream scratch buffer (never shared across streams), and
//! the in-memory cache of message metadata. Protocol drivers consume the
//! fetch/search surface here; all mutation goes through the flag updater,
//! compactor, append engine, and spool merger submodules.

pub mod append;
pub mod expunge;
pub mod flagops;
pub mod scan;
pub mod snarf;

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use lru::LruCache;
use mail_parser::MessageParser;
use tracing::{debug, error, info};

use crate::error::{FlatmailError, Result};
use crate::lock::LockManager;
use crate::model::entry::{CacheEntry, CacheStore};
use crate::model::flags::KeywordTable;
use crate::notify::{NopNotify, Notify, Severity};
use crate::record::{decode_internal_header, MAX_HEADER_LINE};

pub use scan::ScanReport;

/// Number of decoded envelopes kept per stream.
const ENVELOPE_CACHE_SIZE: usize = 50;

/// Options for [`MailboxStream::open`].
#[derive(Default)]
pub struct OpenOptions {
    read_only: bool,
    spool: Option<PathBuf>,
    notify: Option<Box<dyn Notify>>,
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    /// Open without write access: flag changes stay in memory, expunge
    /// and snarf are refused.
    pub fn read_only(mut self, yes: bool) -> OpenOptions {
        self.read_only = yes;
        self
    }

    /// Designate this stream as the inbox fed by a shared system spool.
    /// `ping` will merge spool mail before rescanning.
    pub fn spool(mut self, path: impl Into<PathBuf>) -> OpenOptions {
        self.spool = Some(path.into());
        self
    }

    /// Install the application's notification hooks.
    pub fn notify(mut self, notify: Box<dyn Notify>) -> OpenOptions {
        self.notify = Some(notify);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Closed,
}

/// Decoded envelope summary of one message, cached per stream.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub message_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// The open handle for one sequential mailbox file.
pub struct MailboxStream {
    path: PathBuf,
    file: File,
    locks: LockManager,
    notify: Box<dyn Notify>,
    read_only: bool,
    spool: Option<PathBuf>,
    state: StreamState,
    cache: CacheStore,
    keywords: KeywordTable,
    /// High-water mark: everything below this offset has been parsed.
    parsed_size: u64,
    last_mtime: Option<SystemTime>,
    uid_validity: u64,
    uid_last: u64,
    /// Per-stream scratch buffer, grown on demand, never shared.
    scratch: Vec<u8>,
    envelopes: LruCache<u64, Envelope>,
}

impl std::fmt::Debug for MailboxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxStream")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("spool", &self.spool)
            .field("state", &self.state)
            .field("parsed_size", &self.parsed_size)
            .field("uid_validity", &self.uid_validity)
            .field("uid_last", &self.uid_last)
            .finish_non_exhaustive()
    }
}

impl MailboxStream {
    /// Create a new, empty mailbox file. Fails if it already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        validate_name(path)?;
        File::options()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| FlatmailError::io(path, e))?;
        info!(path = %path.display(), "Created mailbox");
        Ok(())
    }

    /// Open a mailbox: validate name and format, resolve the lock
    /// capability, then scan the whole file into the cache.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<MailboxStream> {
        let path = path.as_ref().to_path_buf();
        validate_name(&path)?;

        let file = File::options()
            .read(true)
            .write(!options.read_only)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FlatmailError::TryCreate(path.clone())
                } else {
                    FlatmailError::io(&path, e)
                }
            })?;

        validate_format(&file, &path)?;
        let locks = LockManager::for_file(&file, &path);

        let mut stream = MailboxStream {
            path,
            file,
            locks,
            notify: options.notify.unwrap_or_else(|| Box::new(NopNotify)),
            read_only: options.read_only,
            spool: options.spool,
            state: StreamState::Open,
            cache: CacheStore::new(),
            keywords: KeywordTable::new(),
            parsed_size: 0,
            last_mtime: None,
            uid_validity: Utc::now().timestamp().max(1) as u64,
            uid_last: 0,
            scratch: Vec::new(),
            envelopes: LruCache::new(
                NonZeroUsize::new(ENVELOPE_CACHE_SIZE).expect("cache size is non-zero"),
            ),
        };

        let report = stream.scan()?;
        info!(
            path = %stream.path.display(),
            total = report.total,
            recent = report.recent,
            read_only = stream.read_only,
            "Opened mailbox stream"
        );
        Ok(stream)
    }

    /// Re-scan for externally appended mail; on an inbox stream, merge
    /// the system spool first so the new mail is seen in the same ping.
    pub fn ping(&mut self) -> Result<ScanReport> {
        self.ensure_open()?;
        if self.spool.is_some() && !self.read_only {
            self.snarf()?;
        }
        self.scan()
    }

    /// Ping plus a checkpoint log line.
    pub fn check(&mut self) -> Result<ScanReport> {
        let report = self.ping()?;
        info!(
            path = %self.path.display(),
            total = report.total,
            "Check completed"
        );
        self.notify.log(Severity::Info, "Check completed");
        Ok(report)
    }

    /// Tear the stream down: optional expunge, flag sync, release.
    pub fn close(mut self, expunge_on_close: bool) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        if !self.read_only {
            if expunge_on_close {
                self.expunge()?;
            }
            self.sync_old_markers()?;
        }
        self.state = StreamState::Closed;
        self.cache.clear();
        debug!(path = %self.path.display(), "Closed mailbox stream");
        Ok(())
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Total messages currently in the cache.
    pub fn total(&self) -> usize {
        self.cache.total()
    }

    /// Messages delivered since the last session's flag sync.
    pub fn recent(&self) -> usize {
        self.cache.recent()
    }

    /// Changes whenever the mailbox's UID numbering is reset; callers
    /// must discard cached UID state when it does.
    pub fn uid_validity(&self) -> u64 {
        self.uid_validity
    }

    /// Permanent UID of a message by sequence number.
    pub fn uid(&self, seqno: usize) -> Result<u64> {
        Ok(self.entry(seqno)?.uid)
    }

    /// Bytes of the file already parsed into the cache.
    pub fn parsed_size(&self) -> u64 {
        self.parsed_size
    }

    /// Defined user-flag names, in bit order.
    pub fn keywords(&self) -> &[String] {
        self.keywords.names()
    }

    /// Cache entry by 1-based sequence number.
    pub fn entry(&self, seqno: usize) -> Result<&CacheEntry> {
        self.cache
            .get(seqno)
            .ok_or(FlatmailError::NoSuchMessage(seqno))
    }

    // ─── Fetch surface ──────────────────────────────────────────────────

    /// Read a message's full text (RFC822 header + body), verbatim.
    pub fn fetch_message(&mut self, seqno: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let view = self.entry(seqno)?.view();
        self.read_range(view.body_offset().get(), view.body_len.get() as usize)
    }

    /// Read only the RFC822 header, including its terminating blank line.
    pub fn fetch_header(&mut self, seqno: usize) -> Result<Vec<u8>> {
        let mut text = self.fetch_message(seqno)?;
        let split = header_end(&text);
        text.truncate(split);
        Ok(text)
    }

    /// Read only the body, the bytes after the header's blank line.
    pub fn fetch_text(&mut self, seqno: usize) -> Result<Vec<u8>> {
        let text = self.fetch_message(seqno)?;
        let split = header_end(&text);
        Ok(text[split..].to_vec())
    }

    /// Parse and cache a message's envelope via the RFC822/MIME
    /// collaborator. Cached results are returned immediately.
    pub fn fetch_envelope(&mut self, seqno: usize) -> Result<Envelope> {
        self.ensure_open()?;
        let uid = self.entry(seqno)?.uid;
        if let Some(env) = self.envelopes.get(&uid) {
            return Ok(env.clone());
        }
        let raw = self.fetch_message(seqno)?;
        let env = parse_envelope(&raw);
        self.envelopes.put(uid, env.clone());
        Ok(env)
    }

    /// Evaluate a predicate over every cache entry, marking the transient
    /// searched bit and returning matching sequence numbers.
    pub fn search<F>(&mut self, predicate: F) -> Result<Vec<usize>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        self.ensure_open()?;
        let mut matches = Vec::new();
        for (i, entry) in self.cache.iter_mut().enumerate() {
            entry.searched = predicate(entry);
            if entry.searched {
                matches.push(i + 1);
            }
        }
        Ok(matches)
    }

    // ─── Internal helpers (shared with the submodules) ──────────────────

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            StreamState::Open => Ok(()),
            StreamState::Closed => Err(FlatmailError::StreamClosed),
        }
    }

    /// Force-close after a structural failure. The file is left
    /// untouched; only the in-memory stream dies.
    fn fatal_close(&mut self, reason: &str) {
        error!(
            path = %self.path.display(),
            reason,
            "Fatal mailbox condition, force-closing stream"
        );
        self.notify.log(Severity::Error, reason);
        self.state = StreamState::Closed;
        self.cache.clear();
        self.envelopes.clear();
    }

    /// Ensure the scratch buffer can hold `len` bytes.
    fn ensure_scratch(&mut self, len: usize) {
        if self.scratch.len() < len {
            self.scratch.resize(len, 0);
        }
    }

    /// Read an exact byte range into a fresh buffer.
    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|e| FlatmailError::io(&self.path, e))?;
        Ok(buf)
    }

    /// Stamp the `OLD` marker on every record that still lacks it.
    /// Called during close so the next session's scan stops counting
    /// these messages as recent.
    fn sync_old_markers(&mut self) -> Result<()> {
        use crate::model::flags::SystemFlags;
        let pending: Vec<usize> = self
            .cache
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.system.contains(SystemFlags::OLD))
            .map(|(i, _)| i + 1)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        self.write_flag_fields(&pending)
    }
}

/// A mailbox name must be a plausible file path: non-empty, a real file
/// name component, no NUL bytes.
fn validate_name(path: &Path) -> Result<()> {
    let text = path.to_string_lossy();
    if text.is_empty() || text.contains('\0') || path.file_name().is_none() {
        return Err(FlatmailError::InvalidName(text.into_owned()));
    }
    Ok(())
}

/// Structural validity check: an empty file is a valid (empty) mailbox;
/// otherwise the file must begin with a decodable internal header.
fn validate_format(file: &File, path: &Path) -> Result<()> {
    let size = file
        .metadata()
        .map_err(|e| FlatmailError::io(path, e))?
        .len();
    if size == 0 {
        return Ok(());
    }
    let want = (size as usize).min(MAX_HEADER_LINE);
    let mut buf = vec![0u8; want];
    file.read_exact_at(&mut buf, 0)
        .map_err(|e| FlatmailError::io(path, e))?;
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return Err(FlatmailError::InvalidFormat(path.to_path_buf()));
    };
    decode_internal_header(&buf[..=nl])
        .map_err(|_| FlatmailError::InvalidFormat(path.to_path_buf()))?;
    Ok(())
}

/// Offset one past the RFC822 header's terminating blank line (or the
/// whole text when no blank line exists).
fn header_end(text: &[u8]) -> usize {
    if let Some(pos) = text.windows(4).position(|w| w == b"\r\n\r\n") {
        return pos + 4;
    }
    if let Some(pos) = text.windows(2).position(|w| w == b"\n\n") {
        return pos + 2;
    }
    text.len()
}

/// Parse the envelope summary out of raw message bytes.
fn parse_envelope(raw: &[u8]) -> Envelope {
    let Some(msg) = MessageParser::default().parse(raw) else {
        return Envelope::default();
    };
    let (from_name, from_address) = match msg.from().and_then(|a| a.first()) {
        Some(addr) => (
            addr.name().map(|s| s.to_string()),
            addr.address().map(|s| s.to_string()),
        ),
        None => (None, None),
    };
    let date = msg
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
    Envelope {
        subject: msg.subject().map(|s| s.to_string()),
        from_name,
        from_address,
        message_id: msg.message_id().map(|s| s.to_string()),
        date,
    }
}
