//! Upper-layer notification hooks.
//!
//! The embedding application (a protocol driver, typically) receives log
//! lines and critical-section brackets through this trait. The
//! `critical`/`end_critical` pair is a cooperative signal-deferral window
//! for a single-threaded host — it is deliberately NOT a mutex and must
//! not be upgraded to one; cross-process exclusion is the lock manager's
//! job.

use tracing::{error, info, warn};

/// Severity of a [`Notify::log`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Callbacks from the engine to its embedding application.
///
/// Every method has a sensible default: logs go to `tracing`, and the
/// critical brackets do nothing.
pub trait Notify {
    /// A human-readable event line.
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(message),
            Severity::Warn => warn!(message),
            Severity::Error => error!(message),
        }
    }

    /// A destructive sequence is starting; the host should defer
    /// external termination signals until [`Notify::end_critical`].
    fn critical(&self) {}

    /// The destructive sequence ended.
    fn end_critical(&self) {}
}

/// Default notifier: `tracing` logs, no-op brackets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopNotify;

impl Notify for NopNotify {}
