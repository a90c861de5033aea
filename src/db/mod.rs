pub mod models;
pub mod queries;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Stored bracket is inconsistent: {0}")]
    Integrity(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// How long a writer waits for another connection's transaction to finish.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Start a write transaction that takes the database write lock up front.
    ///
    /// Every engine mutation runs inside one of these, so two mutations never
    /// interleave and reads made inside see a snapshot no other writer can
    /// change. Dropping the transaction without committing rolls it back.
    pub fn write_txn(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    fn init(&self) -> Result<()> {
        // WAL mode so readers don't block the single writer
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version == SCHEMA_VERSION {
            return Ok(());
        }
        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: tournaments, registrations, songs, rounds, matchups, votes
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tournaments (
                id                       INTEGER PRIMARY KEY AUTOINCREMENT,
                code                     TEXT NOT NULL UNIQUE,
                name                     TEXT NOT NULL,
                description              TEXT,

                -- 'registration' | 'voting_round_N' | 'completed'
                status                   TEXT NOT NULL DEFAULT 'registration',
                -- Bumped on every status change; writers compare-and-swap on it
                version                  INTEGER NOT NULL DEFAULT 0,

                registration_deadline    TEXT,
                max_submissions_per_user INTEGER NOT NULL DEFAULT 4,
                created_by               INTEGER NOT NULL,
                created_at               TEXT NOT NULL
            );

            -- One row per participant, created on first submission or explicit sign-up
            CREATE TABLE IF NOT EXISTS registrations (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id   INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                user_id         INTEGER NOT NULL,
                display_name    TEXT,
                registered_at   TEXT NOT NULL,
                UNIQUE(tournament_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS songs (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id   INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                title           TEXT NOT NULL,
                artist          TEXT NOT NULL,
                album           TEXT,
                popularity      INTEGER,
                duration_secs   INTEGER,
                url             TEXT,
                submitted_by    INTEGER NOT NULL,
                submitted_at    TEXT NOT NULL,

                -- Assigned by seeding, frozen once the bracket is built
                seed            INTEGER,

                UNIQUE(submitted_by, tournament_id, title, artist)
            );
            CREATE INDEX IF NOT EXISTS idx_songs_tournament ON songs(tournament_id);

            CREATE TABLE IF NOT EXISTS rounds (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id   INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                round_number    INTEGER NOT NULL,
                name            TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                starts_at       TEXT,
                ends_at         TEXT,
                UNIQUE(tournament_id, round_number)
            );

            CREATE TABLE IF NOT EXISTS matchups (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id   INTEGER NOT NULL REFERENCES tournaments(id) ON DELETE CASCADE,
                round_id        INTEGER NOT NULL REFERENCES rounds(id) ON DELETE CASCADE,
                position        INTEGER NOT NULL,
                song1_id        INTEGER REFERENCES songs(id),
                song2_id        INTEGER REFERENCES songs(id),
                winner_song_id  INTEGER REFERENCES songs(id),
                next_matchup_id INTEGER REFERENCES matchups(id),
                status          TEXT NOT NULL DEFAULT 'pending',
                UNIQUE(round_id, position)
            );
            CREATE INDEX IF NOT EXISTS idx_matchups_tournament ON matchups(tournament_id);

            CREATE TABLE IF NOT EXISTS votes (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL,
                matchup_id      INTEGER NOT NULL REFERENCES matchups(id) ON DELETE CASCADE,
                song_id         INTEGER NOT NULL REFERENCES songs(id),
                voted_at        TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                changed         INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, matchup_id)
            );
            CREATE INDEX IF NOT EXISTS idx_votes_matchup ON votes(matchup_id);
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_sets_user_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bracket.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        let tables: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('tournaments', 'registrations', 'songs', 'rounds', 'matchups', 'votes')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_uncommitted_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        {
            let tx = db.write_txn().unwrap();
            tx.execute(
                "INSERT INTO tournaments (code, name, created_by, created_at)
                 VALUES ('ABCD', 'Dropped', 1, '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM tournaments", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
