//! Incremental mailbox scanner.
//!
//! Only bytes past the stream's parsed-size high-water mark are ever
//! examined; what was parsed once is never re-read. The scanner is the
//! strict counterpart of a tolerant mail reader: a record that does not
//! decode exactly, or that would overrun end-of-file, is a fatal
//! condition that force-closes the stream. Readers may race a concurrent
//! appender without a lock because a record's header (and thus its size)
//! is fully written before any later record's bytes exist; a mid-append
//! reader either sees a complete record or stops at the boundary.

use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::error::{FlatmailError, Result};
use crate::model::entry::CacheEntry;
use crate::model::flags::SystemFlags;
use crate::record::{decode_internal_header, Length, Offset, MAX_HEADER_LINE};

use super::MailboxStream;

/// Counters reported after each scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Total messages in the stream.
    pub total: usize,
    /// Messages without the `OLD` marker when first scanned.
    pub recent: usize,
}

impl MailboxStream {
    /// Parse all not-yet-parsed bytes into cache entries.
    ///
    /// Idempotent when nothing was written in between: zero new entries,
    /// parsed-size unchanged.
    pub(crate) fn scan(&mut self) -> Result<ScanReport> {
        self.ensure_open()?;
        let meta = self
            .file
            .metadata()
            .map_err(|e| FlatmailError::io(&self.path, e))?;
        let size = meta.len();

        if size < self.parsed_size {
            let err = FlatmailError::Truncated {
                path: self.path.clone(),
                parsed: self.parsed_size,
                actual: size,
            };
            self.fatal_close(&err.to_string());
            return Err(err);
        }

        let modified = meta.modified().ok();
        if size == self.parsed_size {
            if let (Some(prev), Some(now)) = (self.last_mtime, modified) {
                if prev != now {
                    // Flags rewritten in place by another process; already
                    // parsed bytes are never re-read, so just note it.
                    debug!(
                        path = %self.path.display(),
                        "Mailbox mtime changed without growth"
                    );
                }
            }
        }

        let mut cursor = self.parsed_size;
        let mut new_entries = 0usize;

        while cursor < size {
            let want = ((size - cursor) as usize).min(MAX_HEADER_LINE);
            self.ensure_scratch(want);
            self.file
                .read_exact_at(&mut self.scratch[..want], cursor)
                .map_err(|e| FlatmailError::io(&self.path, e))?;

            let Some(nl) = self.scratch[..want].iter().position(|&b| b == b'\n') else {
                let err = FlatmailError::Corrupt {
                    offset: cursor,
                    reason: "no header terminator within bounds".into(),
                };
                self.fatal_close(&err.to_string());
                return Err(err);
            };

            let header = match decode_internal_header(&self.scratch[..=nl]) {
                Ok(h) => h,
                Err(reason) => {
                    let err = FlatmailError::Corrupt {
                        offset: cursor,
                        reason,
                    };
                    self.fatal_close(&err.to_string());
                    return Err(err);
                }
            };

            let header_len = Length(nl as u64 + 1);
            let end = cursor + header_len.get() + header.body_len.get();
            if end > size {
                let err = FlatmailError::Corrupt {
                    offset: cursor,
                    reason: format!(
                        "record claims {} message bytes but the file ends {} bytes short",
                        header.body_len.get(),
                        end - size
                    ),
                };
                self.fatal_close(&err.to_string());
                return Err(err);
            }

            self.uid_last += 1;
            self.cache.append(CacheEntry {
                uid: self.uid_last,
                system: header.system,
                user: header.user,
                recent: !header.system.contains(SystemFlags::OLD),
                searched: false,
                date: header.date,
                internal_offset: Offset(cursor),
                header_len,
                rfc822_len: header.body_len,
            });
            new_entries += 1;
            cursor = end;
        }

        self.parsed_size = size;
        self.last_mtime = modified;

        let report = ScanReport {
            total: self.cache.total(),
            recent: self.cache.recent(),
        };
        debug!(
            path = %self.path.display(),
            new = new_entries,
            total = report.total,
            recent = report.recent,
            parsed_size = self.parsed_size,
            "Scan complete"
        );
        Ok(report)
    }
}
