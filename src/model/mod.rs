//! In-memory data model: flag bitmasks and per-message cache entries.

pub mod entry;
pub mod flags;
