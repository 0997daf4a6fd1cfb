//! `mowguard-journal` – persistent safety audit trail.
//!
//! - [`audit`] – [`AuditJournal`]: SQLite store of every
//!   [`SafetyTransition`][mowguard_types::SafetyTransition], queryable by
//!   recency and by cause kind.

pub mod audit;

pub use audit::{AuditJournal, JournalError};
