//! Expunge: destructive compaction of deleted records.
//!
//! A single left-to-right pass accumulates the byte count of deleted
//! records seen so far and slides every survivor that many bytes down,
//! through the stream's scratch buffer in bounded chunks. The file is
//! truncated once at the end. A record is never partially moved ahead of
//! its new offset being recorded in the cache, so the offset invariant
//! holds for the surviving set afterwards with no gaps.

use std::os::unix::fs::FileExt;

use tracing::{debug, info, warn};

use crate::error::{FlatmailError, Result};
use crate::lock::LockMode;
use crate::notify::Severity;
use crate::record::{Length, RecordView};

use super::MailboxStream;

/// Chunk size for sliding survivor records through the scratch buffer.
const COPY_CHUNK: usize = 64 * 1024;

impl MailboxStream {
    /// Remove every record marked `\Deleted` and compact the file.
    ///
    /// Returns how many messages were removed. Refuses outright (with a
    /// warning, not an error) on a read-only stream.
    pub fn expunge(&mut self) -> Result<usize> {
        self.ensure_open()?;
        if self.read_only {
            warn!(path = %self.path.display(), "Expunge refused: stream is read-only");
            self.notify
                .log(Severity::Warn, "Expunge refused: mailbox is read-only");
            return Ok(0);
        }

        self.locks
            .acquire(&self.file, &self.path, LockMode::Exclusive, true)?;
        // Another process may have appended since the last scan. Pick
        // those records up under the lock so compaction slides them
        // instead of truncating them away with the deleted bytes.
        if let Err(err) = self.scan() {
            self.locks.release(&self.file, &self.path);
            return Err(err);
        }
        self.notify.critical();
        let mut mutated = false;
        let result = self.expunge_locked(&mut mutated);
        self.notify.end_critical();
        self.locks.release(&self.file, &self.path);

        match result {
            Ok(count) => Ok(count),
            Err(err) => {
                if mutated {
                    // Bytes already moved: cache and file no longer agree,
                    // and there is no safe way back.
                    self.fatal_close(&err.to_string());
                }
                Err(err)
            }
        }
    }

    fn expunge_locked(&mut self, mutated: &mut bool) -> Result<usize> {
        let plan: Vec<(usize, RecordView, bool)> = self
            .cache
            .iter()
            .enumerate()
            .map(|(i, e)| (i + 1, e.view(), e.deleted()))
            .collect();

        let mut delta: u64 = 0;
        let mut removed: Vec<usize> = Vec::new();

        for (seqno, view, deleted) in plan {
            if deleted {
                delta += view.total_len().get();
                debug!(
                    seqno,
                    offset = view.offset.get(),
                    bytes = view.total_len().get(),
                    "Expunging record"
                );
                removed.push(seqno);
            } else if delta > 0 {
                self.slide_record(view, delta, mutated)?;
                if let Some(entry) = self.cache.get_mut(seqno) {
                    entry.internal_offset = view.offset - Length(delta);
                }
            }
        }

        if removed.is_empty() {
            return Ok(0);
        }

        let new_size = self.parsed_size - delta;
        self.file
            .set_len(new_size)
            .map_err(|e| FlatmailError::io(&self.path, e))?;
        self.parsed_size = new_size;
        self.cache.remove_and_compact(&removed);
        info!(
            path = %self.path.display(),
            removed = removed.len(),
            reclaimed = delta,
            new_size,
            "Expunge complete"
        );
        Ok(removed.len())
    }

    /// Copy one record's full byte range `delta` bytes earlier, in
    /// bounded chunks through the scratch buffer.
    fn slide_record(&mut self, view: RecordView, delta: u64, mutated: &mut bool) -> Result<()> {
        let total = view.total_len().get();
        let mut done: u64 = 0;
        while done < total {
            let chunk = ((total - done) as usize).min(COPY_CHUNK);
            self.ensure_scratch(chunk);
            self.file
                .read_exact_at(&mut self.scratch[..chunk], view.offset.get() + done)
                .map_err(|e| FlatmailError::io(&self.path, e))?;
            *mutated = true;
            self.file
                .write_all_at(&self.scratch[..chunk], view.offset.get() + done - delta)
                .map_err(|e| FlatmailError::io(&self.path, e))?;
            done += chunk as u64;
        }
        Ok(())
    }
}
