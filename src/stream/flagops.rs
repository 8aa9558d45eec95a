//! In-place, size-preserving flag rewrite.
//!
//! A flag change touches exactly the 12-digit flag field of each selected
//! record — no other bytes, no length change, no offset recalculation
//! anywhere else. Deletion is a flag like any other here; removing bytes
//! is the compactor's job.

use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::error::{FlatmailError, Result};
use crate::lock::LockMode;
use crate::model::flags::{FlagField, SystemFlags, UserFlags};

use super::MailboxStream;

/// A caller's flag-change request: system flags plus user-flag keywords
/// by name.
#[derive(Debug, Clone)]
pub struct FlagRequest {
    system: SystemFlags,
    keywords: Vec<String>,
}

impl Default for FlagRequest {
    fn default() -> FlagRequest {
        FlagRequest::new()
    }
}

impl FlagRequest {
    pub fn new() -> FlagRequest {
        FlagRequest {
            system: SystemFlags::empty(),
            keywords: Vec::new(),
        }
    }

    pub fn system(mut self, flags: SystemFlags) -> FlagRequest {
        self.system |= flags;
        self
    }

    pub fn keyword(mut self, name: impl Into<String>) -> FlagRequest {
        self.keywords.push(name.into());
        self
    }
}

impl MailboxStream {
    /// Set the requested flags on the selected messages.
    pub fn set_flags(&mut self, seqnos: &[usize], request: &FlagRequest) -> Result<()> {
        self.update_flags(seqnos, request, true)
    }

    /// Clear the requested flags on the selected messages.
    pub fn clear_flags(&mut self, seqnos: &[usize], request: &FlagRequest) -> Result<()> {
        self.update_flags(seqnos, request, false)
    }

    fn update_flags(&mut self, seqnos: &[usize], request: &FlagRequest, set: bool) -> Result<()> {
        self.ensure_open()?;

        // Resolve the request to concrete bits. Keywords are defined on
        // demand when setting; unknown names on clear resolve to nothing.
        let system = request.system.intersection(SystemFlags::SETTABLE);
        let mut user = UserFlags::empty();
        for name in &request.keywords {
            match self.keywords.resolve(name, set) {
                Some(bit) => user.insert(bit),
                None => debug!(keyword = %name, "Unrecognized user flag ignored"),
            }
        }
        if system.is_empty() && user.is_empty() {
            debug!("Flag request resolved to nothing; no-op");
            return Ok(());
        }

        for &seqno in seqnos {
            if self.cache.get(seqno).is_none() {
                return Err(FlatmailError::NoSuchMessage(seqno));
            }
        }

        if !self.read_only {
            self.locks
                .acquire(&self.file, &self.path, LockMode::Exclusive, true)?;
            self.notify.critical();
        }
        let result = self.apply_flags(seqnos, system, user, set);
        if !self.read_only {
            self.notify.end_critical();
            self.locks.release(&self.file, &self.path);
        }
        result
    }

    fn apply_flags(
        &mut self,
        seqnos: &[usize],
        system: SystemFlags,
        user: UserFlags,
        set: bool,
    ) -> Result<()> {
        for &seqno in seqnos {
            if let Some(entry) = self.cache.get_mut(seqno) {
                if set {
                    entry.system.insert(system);
                    entry.user.insert(user);
                } else {
                    entry.system.remove(system);
                    entry.user.remove(user);
                }
            }
            if !self.read_only {
                self.write_one_flag_field(seqno)?;
            }
        }
        Ok(())
    }

    /// Mark messages deleted (move/snarf path). Callers already hold any
    /// lock they need.
    pub(crate) fn mark_deleted_unlocked(&mut self, seqnos: &[usize]) -> Result<()> {
        for &seqno in seqnos {
            if let Some(entry) = self.cache.get_mut(seqno) {
                entry.system.insert(SystemFlags::DELETED);
            }
            if !self.read_only {
                self.write_one_flag_field(seqno)?;
            }
        }
        Ok(())
    }

    /// Mark messages deleted under the stream's own lock.
    pub(crate) fn mark_deleted(&mut self, seqnos: &[usize]) -> Result<()> {
        if self.read_only {
            return self.mark_deleted_unlocked(seqnos);
        }
        self.locks
            .acquire(&self.file, &self.path, LockMode::Exclusive, true)?;
        self.notify.critical();
        let result = self.mark_deleted_unlocked(seqnos);
        self.notify.end_critical();
        self.locks.release(&self.file, &self.path);
        result
    }

    /// Rewrite the on-disk flag fields of the given messages under lock.
    pub(crate) fn write_flag_fields(&mut self, seqnos: &[usize]) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.locks
            .acquire(&self.file, &self.path, LockMode::Exclusive, true)?;
        self.notify.critical();
        let mut result = Ok(());
        for &seqno in seqnos {
            result = self.write_one_flag_field(seqno);
            if result.is_err() {
                break;
            }
        }
        self.notify.end_critical();
        self.locks.release(&self.file, &self.path);
        result
    }

    /// Overwrite exactly one record's 12-digit flag field.
    ///
    /// Every on-disk write stamps the `OLD` marker: once any session has
    /// written this record's status, no later session may see it as
    /// recent. The in-memory recent bit is untouched (it is
    /// session-transient).
    fn write_one_flag_field(&mut self, seqno: usize) -> Result<()> {
        let Some(entry) = self.cache.get_mut(seqno) else {
            return Ok(());
        };
        entry.system.insert(SystemFlags::OLD);
        let field = FlagField::encode(entry.user, entry.system);
        let range = entry.view().flag_field_range();
        self.file
            .write_all_at(field.as_bytes(), range.start)
            .map_err(|e| FlatmailError::io(&self.path, e))
    }
}
