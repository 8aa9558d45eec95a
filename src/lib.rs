//! `flatmail` — a sequential flat-file mailbox storage engine.
//!
//! A mailbox is a single flat file: an append-mostly log of messages,
//! each prefixed by a fixed-format internal header (arrival date, exact
//! byte length, fixed-width flag field). This crate provides incremental
//! scanning, in-place flag rewriting, expunge compaction, append/copy/
//! move, spool merging, and cross-process advisory locking — the storage
//! core that protocol drivers build on.

pub mod error;
pub mod lock;
pub mod model;
pub mod notify;
pub mod record;
pub mod stream;
