//! Append, copy, and move.
//!
//! Appending targets a mailbox by path, not by open stream: the target is
//! validated first (missing entirely → the distinguished trycreate
//! signal; present but malformed → a format error), then written under an
//! exclusive lock inside a critical bracket. On any failure the
//! destination is truncated back to its pre-append size, so a failed
//! append never leaves a partially written trailing record.

use std::fs::File;
use std::io::{Cursor, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{info, warn};

use crate::error::{FlatmailError, Result};
use crate::lock::{LockManager, LockMode};
use crate::notify::Notify;
use crate::record::{encode_internal_header, Length};
use crate::model::flags::{SystemFlags, UserFlags};

use super::{validate_format, validate_name, MailboxStream};

/// One message to append: flags, an optional arrival date (now when
/// absent), and the source of its text bytes.
pub struct AppendRequest<'a> {
    pub system: SystemFlags,
    pub user: UserFlags,
    pub date: Option<DateTime<FixedOffset>>,
    pub source: &'a mut dyn Read,
}

/// Append messages to the mailbox at `target`.
///
/// All requests succeed or the file is restored to its pre-append size.
pub fn append(
    target: impl AsRef<Path>,
    notify: &dyn Notify,
    requests: &mut [AppendRequest<'_>],
) -> Result<()> {
    let path = target.as_ref();
    validate_name(path)?;

    let file = match File::options().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Deliberate two-step protocol: the caller creates the
            // mailbox explicitly and retries.
            return Err(FlatmailError::TryCreate(path.to_path_buf()));
        }
        Err(e) => return Err(FlatmailError::io(path, e)),
    };
    validate_format(&file, path)?;

    let locks = LockManager::for_file(&file, path);
    locks.acquire(&file, path, LockMode::Exclusive, true)?;
    notify.critical();

    let original_len = match file.metadata() {
        Ok(m) => m.len(),
        Err(e) => {
            notify.end_critical();
            locks.release(&file, path);
            return Err(FlatmailError::io(path, e));
        }
    };

    let result = write_requests(&file, path, original_len, &mut *requests);
    if let Err(ref err) = result {
        warn!(
            path = %path.display(),
            error = %err,
            "Append failed, truncating back to pre-append size"
        );
        if let Err(te) = file.set_len(original_len) {
            warn!(path = %path.display(), error = %te, "Rollback truncation failed");
        }
    } else {
        info!(path = %path.display(), count = requests.len(), "Appended messages");
    }

    notify.end_critical();
    locks.release(&file, path);
    result
}

fn write_requests(
    file: &File,
    path: &Path,
    start: u64,
    requests: &mut [AppendRequest<'_>],
) -> Result<()> {
    let mut cursor = start;
    for request in requests.iter_mut() {
        let mut raw = Vec::new();
        request
            .source
            .read_to_end(&mut raw)
            .map_err(|e| FlatmailError::io(path, e))?;
        let text = normalize_crlf(&raw);

        let date = request
            .date
            .unwrap_or_else(|| Utc::now().fixed_offset());
        let header = encode_internal_header(
            &date,
            Length(text.len() as u64),
            request.user,
            request.system,
        );

        file.write_all_at(header.as_bytes(), cursor)
            .map_err(|e| FlatmailError::io(path, e))?;
        cursor += header.len() as u64;
        file.write_all_at(&text, cursor)
            .map_err(|e| FlatmailError::io(path, e))?;
        cursor += text.len() as u64;
    }
    Ok(())
}

/// The declared line-ending normalization: message text is stored with
/// CRLF; bare LF becomes CRLF, existing CRLF is untouched.
pub fn normalize_crlf(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut prev: u8 = 0;
    for &b in input {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Flags, date, and text captured from a source message for copy.
struct CopyPayload {
    system: SystemFlags,
    user: UserFlags,
    date: DateTime<FixedOffset>,
    text: Vec<u8>,
}

impl MailboxStream {
    /// Copy the selected messages to another mailbox, flags and dates
    /// verbatim (not re-derived). With `move_messages`, the originals are
    /// marked deleted — but only after every message was appended, so a
    /// failure partway through leaves nothing deleted.
    pub fn copy(
        &mut self,
        seqnos: &[usize],
        target: impl AsRef<Path>,
        move_messages: bool,
    ) -> Result<()> {
        self.ensure_open()?;

        let mut payloads = Vec::with_capacity(seqnos.len());
        for &seqno in seqnos {
            let entry = self.entry(seqno)?;
            let (system, user, date) = (entry.system, entry.user, entry.date);
            let text = self.fetch_message(seqno)?;
            payloads.push(CopyPayload {
                system,
                user,
                date,
                text,
            });
        }

        let mut cursors: Vec<Cursor<&[u8]>> = payloads
            .iter()
            .map(|p| Cursor::new(p.text.as_slice()))
            .collect();
        let mut requests: Vec<AppendRequest<'_>> = cursors
            .iter_mut()
            .zip(payloads.iter())
            .map(|(cursor, p)| AppendRequest {
                system: p.system,
                user: p.user,
                date: Some(p.date),
                source: cursor,
            })
            .collect();

        append(target.as_ref(), self.notify.as_ref(), &mut requests)?;

        if move_messages {
            self.mark_deleted(seqnos)?;
        }
        Ok(())
    }
}
