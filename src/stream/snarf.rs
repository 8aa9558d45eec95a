//! Spool merging ("snarf"): move mail from a shared system spool into the
//! private inbox, atomically per message.
//!
//! Each spool message is appended to the inbox first and only then marked
//! deleted in the spool; the spool is expunged once at the end. A failure
//! partway leaves already-merged messages merged and marked, so a retry
//! never duplicates them (at-least-once, idempotent per message).

use std::io::Cursor;

use tracing::{debug, info};

use crate::error::{FlatmailError, Result};
use crate::lock::LockMode;

use super::append::{append, AppendRequest};
use super::{MailboxStream, OpenOptions};

impl MailboxStream {
    /// Merge the configured system spool into this mailbox. Returns the
    /// number of messages merged; quietly does nothing when the spool is
    /// absent, empty, or busy.
    pub(crate) fn snarf(&mut self) -> Result<usize> {
        let Some(spool_path) = self.spool.clone() else {
            return Ok(0);
        };

        match std::fs::metadata(&spool_path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(FlatmailError::io(&spool_path, e)),
            Ok(meta) if meta.len() == 0 => return Ok(0),
            Ok(_) => {}
        }

        let mut spool = MailboxStream::open(&spool_path, OpenOptions::new())?;

        // The spool must be exclusively obtainable; if another delivery
        // or another session holds it, try again on a later ping.
        match spool
            .locks
            .acquire(&spool.file, &spool.path, LockMode::Exclusive, false)
        {
            Ok(()) => {}
            Err(FlatmailError::LockBusy(_)) => {
                debug!(spool = %spool_path.display(), "Spool is busy, skipping snarf");
                return Ok(0);
            }
            Err(e) => return Err(e),
        }

        self.notify.critical();
        let result = self.merge_spool(&mut spool);
        self.notify.end_critical();
        spool.locks.release(&spool.file, &spool.path);
        let merged = result?;

        if merged > 0 {
            spool.expunge()?;
            info!(
                spool = %spool_path.display(),
                inbox = %self.path.display(),
                merged,
                "Snarfed spool into inbox"
            );
        }
        spool.close(false)?;
        Ok(merged)
    }

    fn merge_spool(&mut self, spool: &mut MailboxStream) -> Result<usize> {
        let mut merged = 0usize;
        for seqno in 1..=spool.total() {
            let entry = spool.entry(seqno)?;
            if entry.deleted() {
                // Left over from an interrupted earlier snarf: already
                // copied, just awaiting expunge.
                continue;
            }
            let (system, user, date) = (entry.system, entry.user, entry.date);
            let text = spool.fetch_message(seqno)?;
            let mut source = Cursor::new(text.as_slice());
            let mut requests = [AppendRequest {
                system,
                user,
                date: Some(date),
                source: &mut source,
            }];
            append(&self.path, self.notify.as_ref(), &mut requests)?;
            // We hold the spool lock already; write the deletion mark
            // without re-locking (an unlock here would drop our lock).
            spool.mark_deleted_unlocked(&[seqno])?;
            merged += 1;
        }
        Ok(merged)
    }
}
