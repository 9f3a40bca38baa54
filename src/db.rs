//! Session persistence
//!
//! Each session is one row holding the serialized dialogue state. Saving is
//! an upsert at the end of every turn.

mod schema;

pub use schema::*;

use crate::state_machine::DialogueState;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Stored state of session {session_id} is unreadable: {source}")]
    CorruptState {
        session_id: String,
        source: serde_json::Error,
    },
    #[error("State serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Session Operations ====================

    /// Insert or replace the state of a session
    pub fn save_state(&self, session_id: &str, state: &DialogueState) -> DbResult<()> {
        let state_json = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (session_id, state, phase, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                state = excluded.state,
                phase = excluded.phase,
                updated_at = excluded.updated_at",
            params![session_id, state_json, state.phase.as_str(), now],
        )?;
        Ok(())
    }

    /// State of a session, `None` if it was never saved
    pub fn load_state(&self, session_id: &str) -> DbResult<Option<DialogueState>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| parse_state(session_id, &json)).transpose()
    }

    pub fn get_session(&self, session_id: &str) -> DbResult<SessionRecord> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT session_id, state, phase, created_at, updated_at
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                read_row,
            )
            .optional()?;
        row.ok_or_else(|| DbError::SessionNotFound(session_id.to_string()))?
            .into_record()
    }

    /// All sessions, most recently updated first
    pub fn list_sessions(&self) -> DbResult<Vec<SessionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, state, phase, created_at, updated_at
             FROM sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_record).collect()
    }

    /// Forget a session. Returns whether it existed.
    pub fn delete_session(&self, session_id: &str) -> DbResult<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(deleted > 0)
    }
}

struct RawRow {
    session_id: String,
    state: String,
    phase: String,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn into_record(self) -> DbResult<SessionRecord> {
        Ok(SessionRecord {
            state: parse_state(&self.session_id, &self.state)?,
            session_id: self.session_id,
            phase: self.phase,
            created_at: parse_datetime(&self.created_at),
            updated_at: parse_datetime(&self.updated_at),
        })
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        session_id: row.get(0)?,
        state: row.get(1)?,
        phase: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn parse_state(session_id: &str, json: &str) -> DbResult<DialogueState> {
    serde_json::from_str(json).map_err(|source| DbError::CorruptState {
        session_id: session_id.to_string(),
        source,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
