//! Persistent audit journal of safety state transitions.
//!
//! Every [`SafetyTransition`] published on `safety/status` is written to a
//! local SQLite database so that operator stops, watchdog stops and blocked
//! clears can be told apart after the fact, across restarts.
//!
//! # Storage layout
//!
//! | column       | type    | description                                   |
//! |--------------|---------|-----------------------------------------------|
//! | id           | TEXT    | Transition UUID, primary key                  |
//! | at_wall      | TEXT    | RFC-3339 wall time (UTC)                      |
//! | at_mono_ns   | INTEGER | Monotonic nanoseconds within the process      |
//! | from_state   | TEXT    | e.g. `NORMAL`                                 |
//! | to_state     | TEXT    | e.g. `EMERGENCY_STOPPED`                      |
//! | cause_kind   | TEXT    | `command`, `interlock`, `watchdog`, ...       |
//! | cause_detail | TEXT    | Interlock name or machine reason              |
//! | blocked_by   | TEXT    | JSON array of blocking interlock names        |
//!
//! # Example
//!
//! ```rust
//! use mowguard_journal::AuditJournal;
//! use mowguard_types::{CauseKind, SafetyState, SafetyTransition, TransitionCause};
//!
//! let journal = AuditJournal::open_in_memory().unwrap();
//! let t = SafetyTransition::new(
//!     SafetyState::Normal,
//!     SafetyState::EmergencyStopped,
//!     TransitionCause::new(CauseKind::Command, "remote_stop"),
//! );
//! journal.record(&t).unwrap();
//! assert_eq!(journal.recent(10).unwrap()[0].id, t.id);
//! ```

use chrono::{DateTime, Utc};
use mowguard_types::{
    CauseKind, MowError, SafetyState, SafetyTransition, Timestamp, TransitionCause,
};
use rusqlite::{Connection, Row, params};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the audit journal.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocked_by column is not a JSON string array: {0}")]
    BlockedBy(#[from] serde_json::Error),
    #[error("corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },
}

impl From<JournalError> for MowError {
    fn from(e: JournalError) -> Self {
        MowError::Storage(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AuditJournal
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed store of [`SafetyTransition`]s.
pub struct AuditJournal {
    conn: Connection,
}

type RawRow = (String, String, i64, String, String, String, String, String);

const COLUMNS: &str =
    "id, at_wall, at_mono_ns, from_state, to_state, cause_kind, cause_detail, blocked_by";

impl AuditJournal {
    /// Open (or create) a persistent journal at `path`.
    pub fn open(path: &str) -> Result<Self, JournalError> {
        let conn = Connection::open(path)?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    /// Open a journal that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self, JournalError> {
        let conn = Connection::open_in_memory()?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> Result<(), JournalError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS safety_transitions (
                id           TEXT NOT NULL PRIMARY KEY,
                at_wall      TEXT NOT NULL,
                at_mono_ns   INTEGER NOT NULL,
                from_state   TEXT NOT NULL,
                to_state     TEXT NOT NULL,
                cause_kind   TEXT NOT NULL,
                cause_detail TEXT NOT NULL,
                blocked_by   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_safety_transitions_cause
                ON safety_transitions (cause_kind);",
        )?;
        Ok(())
    }

    /// Persist `transition`.
    ///
    /// Returns `false` when a transition with the same id was already
    /// recorded; the stored row is left as is.
    pub fn record(&self, transition: &SafetyTransition) -> Result<bool, JournalError> {
        let blocked_by = serde_json::to_string(&transition.blocked_by)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO safety_transitions
                 (id, at_wall, at_mono_ns, from_state, to_state, cause_kind, cause_detail, blocked_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                transition.id.to_string(),
                transition.at.wall.to_rfc3339(),
                transition.at.monotonic_ns as i64,
                transition.from.to_string(),
                transition.to.to_string(),
                transition.cause.kind.as_str(),
                transition.cause.detail,
                blocked_by,
            ],
        )?;
        debug!(id = %transition.id, to = %transition.to, inserted = inserted == 1, "journal record");
        Ok(inserted == 1)
    }

    /// The `limit` most recently recorded transitions, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<SafetyTransition>, JournalError> {
        let sql = format!("SELECT {COLUMNS} FROM safety_transitions ORDER BY rowid DESC LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], read_row)?;
        rows.map(|row| decode(row?)).collect()
    }

    /// Every transition with the given cause kind, oldest first.
    pub fn by_cause_kind(&self, kind: CauseKind) -> Result<Vec<SafetyTransition>, JournalError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM safety_transitions WHERE cause_kind = ?1 ORDER BY rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![kind.as_str()], read_row)?;
        rows.map(|row| decode(row?)).collect()
    }

    /// Number of recorded transitions.
    pub fn count(&self) -> Result<usize, JournalError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM safety_transitions", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn corrupt(column: &'static str, value: &str) -> JournalError {
    JournalError::Corrupt {
        column,
        value: value.to_string(),
    }
}

fn decode(raw: RawRow) -> Result<SafetyTransition, JournalError> {
    let (id, at_wall, at_mono_ns, from, to, kind, detail, blocked_by) = raw;
    let id = Uuid::parse_str(&id).map_err(|_| corrupt("id", &id))?;
    let wall = at_wall
        .parse::<DateTime<Utc>>()
        .map_err(|_| corrupt("at_wall", &at_wall))?;
    let from = SafetyState::parse(&from).ok_or_else(|| corrupt("from_state", &from))?;
    let to = SafetyState::parse(&to).ok_or_else(|| corrupt("to_state", &to))?;
    let kind = CauseKind::parse(&kind).ok_or_else(|| corrupt("cause_kind", &kind))?;
    let blocked_by: Vec<String> = serde_json::from_str(&blocked_by)?;
    Ok(SafetyTransition {
        id,
        from,
        to,
        cause: TransitionCause::new(kind, detail),
        blocked_by,
        at: Timestamp {
            monotonic_ns: at_mono_ns.max(0) as u64,
            wall,
        },
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
