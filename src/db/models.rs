use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;

use crate::bracket::{
    Bracket, MatchupKey, MatchupStatus, RoundStatus, SongId, TournamentStatus, UserId,
};

/// Status enums are stored as their display text.
macro_rules! text_column {
    ($($ty:ty),+) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.to_string()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    )+};
}

text_column!(TournamentStatus, RoundStatus, MatchupStatus);

/// Data for creating a tournament.
pub struct NewTournament {
    pub name: String,
    pub description: Option<String>,
    pub registration_deadline: Option<DateTime<Utc>>,
    pub max_submissions_per_user: u32,
    pub created_by: UserId,
}

/// A tournament row read from the database.
#[derive(Debug, Clone, Serialize)]
pub struct Tournament {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub status: TournamentStatus,
    /// Bumped on every status change.
    pub version: i64,
    pub registration_deadline: Option<DateTime<Utc>>,
    pub max_submissions_per_user: u32,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Tournament {
    /// Submissions are accepted during registration until the deadline passes.
    pub fn is_registration_open(&self, now: DateTime<Utc>) -> bool {
        self.status == TournamentStatus::Registration
            && self.registration_deadline.is_none_or(|deadline| now <= deadline)
    }

    pub fn formatted_code(&self) -> String {
        format!("#{}", self.code)
    }
}

/// A user signed up for a tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub id: i64,
    pub tournament_id: i64,
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    /// Display name, or `user N` for users who never gave one.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("user {}", self.user_id))
    }
}

/// Data for submitting a song. Metadata arrives already resolved.
#[derive(Debug, Clone, Default)]
pub struct NewSong {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub popularity: Option<i64>,
    pub duration_secs: Option<i64>,
    pub url: Option<String>,
    pub submitted_by: UserId,
}

#[derive(Debug, Clone, Serialize)]
pub struct Song {
    pub id: SongId,
    pub tournament_id: i64,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub popularity: Option<i64>,
    pub duration_secs: Option<i64>,
    pub url: Option<String>,
    pub submitted_by: UserId,
    pub submitted_at: DateTime<Utc>,
    pub seed: Option<u32>,
}

/// A bracket loaded from storage, with the row ids behind each round and
/// matchup so changes can be written back.
#[derive(Debug, Clone)]
pub struct StoredBracket {
    pub tournament_id: i64,
    pub bracket: Bracket,
    /// Row id of round `n` at index `n - 1`.
    pub round_ids: Vec<i64>,
    pub matchup_ids: HashMap<MatchupKey, i64>,
    /// Reverse of `matchup_ids`.
    pub keys_by_id: HashMap<i64, MatchupKey>,
}

impl StoredBracket {
    pub fn round_id(&self, number: u32) -> Option<i64> {
        number
            .checked_sub(1)
            .and_then(|i| self.round_ids.get(i as usize))
            .copied()
    }

    pub fn matchup_id(&self, key: MatchupKey) -> Option<i64> {
        self.matchup_ids.get(&key).copied()
    }

    pub fn key_of(&self, matchup_id: i64) -> Option<MatchupKey> {
        self.keys_by_id.get(&matchup_id).copied()
    }
}

/// An active round whose deadline has been reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredRound {
    pub tournament_id: i64,
    pub round_number: u32,
}

// Views for display and JSON output

#[derive(Debug, Clone, Serialize)]
pub struct BracketView {
    pub code: String,
    pub name: String,
    pub status: TournamentStatus,
    pub rounds: Vec<RoundView>,
    pub champion: Option<SongSlotView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundView {
    pub number: u32,
    pub name: String,
    pub status: RoundStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub matchups: Vec<MatchupView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchupView {
    pub id: i64,
    pub position: u32,
    pub status: MatchupStatus,
    pub songs: [Option<SongSlotView>; 2],
    /// Stored winner once resolved, otherwise the current leader.
    pub leader: Option<SongId>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SongSlotView {
    pub song_id: SongId,
    pub title: String,
    pub artist: String,
    pub seed: Option<u32>,
    pub votes: u32,
}
