//! Cross-process advisory locking.
//!
//! Serialization between processes is done with whole-file `fcntl` record
//! locks. On network-mounted filesystems locking degrades to a documented
//! no-op (a deliberate trade-off against historical lock-daemon cluster
//! hangs) — callers must not rely on cross-host exclusivity there. The
//! capability is resolved once when the stream opens, never re-sniffed per
//! call.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{FlatmailError, Result};

/// How long to wait before retrying a blocking acquire that failed with a
/// transient kernel condition (lock table full, deadlock detected).
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Lock mode for [`LockManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// What locking the underlying filesystem supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCapability {
    /// Local filesystem: `fcntl` locks work and are honored.
    Local,
    /// Network mount: locking is a no-op by design.
    None,
}

/// Advisory lock handle for one mailbox file.
///
/// Resolved once at stream open; `acquire`/`release` are cheap wrappers
/// around `fcntl` afterwards.
#[derive(Debug, Clone, Copy)]
pub struct LockManager {
    capability: LockCapability,
}

impl LockManager {
    /// Resolve the lock capability for a file, once.
    pub fn for_file(file: &File, path: &Path) -> LockManager {
        let capability = if is_network_mount(file) {
            warn!(
                path = %path.display(),
                "Network-mounted filesystem: advisory locking disabled"
            );
            LockCapability::None
        } else {
            LockCapability::Local
        };
        LockManager { capability }
    }

    pub fn capability(&self) -> LockCapability {
        self.capability
    }

    /// Acquire a whole-file advisory lock.
    ///
    /// Blocking acquires retry transparently on `EINTR` and with a fixed
    /// backoff on `ENOLCK`/`EDEADLK`. Non-blocking acquires surface
    /// contention as [`FlatmailError::LockBusy`]. Any other errno aborts
    /// the process: it indicates a programming error, not a recoverable
    /// runtime condition.
    pub fn acquire(&self, file: &File, path: &Path, mode: LockMode, blocking: bool) -> Result<()> {
        if self.capability == LockCapability::None {
            return Ok(());
        }
        let lock_type = match mode {
            LockMode::Shared => libc::F_RDLCK,
            LockMode::Exclusive => libc::F_WRLCK,
        };
        loop {
            match fcntl_lock(file, lock_type as libc::c_short, blocking) {
                Ok(()) => return Ok(()),
                Err(errno) if errno == libc::EINTR => continue,
                Err(errno) if errno == libc::ENOLCK || errno == libc::EDEADLK => {
                    if blocking {
                        warn!(
                            path = %path.display(),
                            errno,
                            "Transient lock failure, retrying with backoff"
                        );
                        std::thread::sleep(LOCK_RETRY_DELAY);
                        continue;
                    }
                    return Err(FlatmailError::LockBusy(path.to_path_buf()));
                }
                Err(errno) if errno == libc::EACCES || errno == libc::EAGAIN => {
                    debug!(path = %path.display(), "Mailbox lock is held elsewhere");
                    return Err(FlatmailError::LockBusy(path.to_path_buf()));
                }
                Err(errno) => {
                    // Not a runtime condition: a bad fd or bogus flock
                    // arguments mean the engine itself is broken.
                    panic!(
                        "unexpected fcntl lock failure on '{}': {}",
                        path.display(),
                        std::io::Error::from_raw_os_error(errno)
                    );
                }
            }
        }
    }

    /// Release a previously acquired lock. Errors are logged, not
    /// surfaced: the lock dies with the file descriptor anyway.
    pub fn release(&self, file: &File, path: &Path) {
        if self.capability == LockCapability::None {
            return;
        }
        if let Err(errno) = fcntl_lock(file, libc::F_UNLCK as libc::c_short, false) {
            debug!(
                path = %path.display(),
                errno,
                "Failed to release mailbox lock"
            );
        }
    }
}

/// One `fcntl` call over the whole file. Returns the raw errno on failure.
fn fcntl_lock(file: &File, lock_type: libc::c_short, blocking: bool) -> std::result::Result<(), i32> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    // l_start = l_len = 0: the whole file, however large it grows.
    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut fl) };
    if ret == -1 {
        Err(std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO))
    } else {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn is_network_mount(file: &File) -> bool {
    const NFS_SUPER_MAGIC: i64 = 0x6969;
    const SMB_SUPER_MAGIC: i64 = 0x517b;
    const CIFS_SUPER_MAGIC: i64 = 0xff53_4d42;

    let mut sfs: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstatfs(file.as_raw_fd(), &mut sfs) };
    if ret != 0 {
        // Can't tell; assume local and let fcntl speak for itself.
        return false;
    }
    matches!(
        sfs.f_type as i64,
        NFS_SUPER_MAGIC | SMB_SUPER_MAGIC | CIFS_SUPER_MAGIC
    )
}

#[cfg(not(target_os = "linux"))]
fn is_network_mount(_file: &File) -> bool {
    false
}
