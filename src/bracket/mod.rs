//! The bracket engine: seeding, bracket construction, vote tallying and
//! round advancement.
//!
//! Everything in here is pure, in-memory logic over a [`Bracket`]. The
//! [`crate::engine`] module loads a tournament's bracket inside a database
//! transaction, hands it to these functions, and writes the result back.

pub mod advance;
pub mod builder;
pub mod seeding;
pub mod status;
pub mod tally;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use status::{MatchupStatus, RoundStatus, TournamentStatus};

pub type SongId = i64;
pub type UserId = i64;

/// Errors raised by the bracket engine. Callers branch on the variant; only
/// [`BracketError::BracketCorruption`] indicates a fault rather than a
/// rejected action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BracketError {
    #[error("at least 2 songs are needed to build a bracket, found {found}")]
    InsufficientEntrants { found: usize },
    #[error("the bracket for this tournament has already been built")]
    BracketAlreadyBuilt,
    #[error("matchup is not open for voting")]
    MatchupNotOpen,
    #[error("song {song} is not part of this matchup")]
    InvalidSongForMatchup { song: SongId },
    #[error("round {round} is not active")]
    RoundNotActive { round: u32 },
    #[error("round {round} cannot be extended: {reason}")]
    RoundNotExtendable { round: u32, reason: &'static str },
    #[error("round {round} would end outside the supported date range")]
    ScheduleOutOfRange { round: u32 },
    #[error("bracket corruption: {0}")]
    BracketCorruption(String),
}

impl BracketError {
    /// True for invariant violations that indicate a bug, not user error.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::BracketCorruption(_))
    }
}

pub type Result<T> = std::result::Result<T, BracketError>;

/// Arena index of a matchup: round number (1-based) and position in round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MatchupKey {
    pub round: u32,
    pub position: u32,
}

impl MatchupKey {
    pub fn new(round: u32, position: u32) -> Self {
        Self { round, position }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matchup {
    pub key: MatchupKey,
    pub slots: [Option<SongId>; 2],
    pub winner: Option<SongId>,
    pub status: MatchupStatus,
    /// The matchup in the next round this one feeds. `None` for the final.
    pub next: Option<MatchupKey>,
}

impl Matchup {
    fn placeholder(key: MatchupKey, next: Option<MatchupKey>) -> Self {
        Self {
            key,
            slots: [None, None],
            winner: None,
            status: MatchupStatus::Pending,
            next,
        }
    }

    pub fn contains(&self, song: SongId) -> bool {
        self.slots.contains(&Some(song))
    }

    pub fn filled_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub number: u32,
    pub name: String,
    pub status: RoundStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub matchups: Vec<Matchup>,
}

/// A tournament's full round/matchup tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bracket {
    pub rounds: Vec<Round>,
}

impl Bracket {
    pub fn total_rounds(&self) -> u32 {
        self.rounds.len() as u32
    }

    pub fn total_matchups(&self) -> usize {
        self.rounds.iter().map(|r| r.matchups.len()).sum()
    }

    pub fn round(&self, number: u32) -> Option<&Round> {
        number
            .checked_sub(1)
            .and_then(|i| self.rounds.get(i as usize))
    }

    pub fn round_mut(&mut self, number: u32) -> Option<&mut Round> {
        number
            .checked_sub(1)
            .and_then(|i| self.rounds.get_mut(i as usize))
    }

    pub fn matchup(&self, key: MatchupKey) -> Option<&Matchup> {
        self.round(key.round)
            .and_then(|r| r.matchups.get(key.position as usize))
    }

    pub fn matchup_mut(&mut self, key: MatchupKey) -> Option<&mut Matchup> {
        self.round_mut(key.round)
            .and_then(|r| r.matchups.get_mut(key.position as usize))
    }

    /// The final matchup (the only one without a forward link).
    pub fn final_matchup(&self) -> Option<&Matchup> {
        self.rounds.last().and_then(|r| r.matchups.first())
    }

    /// Structural check of the progression graph.
    ///
    /// Round numbers run 1..=n, positions match their index, every non-final
    /// matchup links into the next round, and every matchup receives at most
    /// two songs counting both filled slots and incoming links.
    pub fn validate(&self) -> Result<()> {
        if self.rounds.is_empty() {
            return Err(corruption("bracket has no rounds"));
        }

        for (i, round) in self.rounds.iter().enumerate() {
            let number = i as u32 + 1;
            if round.number != number {
                return Err(corruption(format!(
                    "round numbers are not contiguous: expected {number}, found {}",
                    round.number
                )));
            }
            if round.matchups.is_empty() {
                return Err(corruption(format!("round {number} has no matchups")));
            }
            for (p, m) in round.matchups.iter().enumerate() {
                if m.key != MatchupKey::new(number, p as u32) {
                    return Err(corruption(format!("matchup {:?} is out of place", m.key)));
                }
            }
        }

        let last = self.total_rounds();
        let mut incoming = std::collections::HashMap::new();
        for round in &self.rounds {
            for m in &round.matchups {
                match (m.next, round.number == last) {
                    (None, true) => {}
                    (Some(next), false) => {
                        if next.round != round.number + 1 || self.matchup(next).is_none() {
                            return Err(corruption(format!(
                                "matchup {:?} links to missing matchup {next:?}",
                                m.key
                            )));
                        }
                        *incoming.entry(next).or_insert(0usize) += 1;
                    }
                    (Some(_), true) => {
                        return Err(corruption("the final links past the last round"));
                    }
                    (None, false) => {
                        return Err(corruption(format!("matchup {:?} has no forward link", m.key)));
                    }
                }
            }
        }

        if self.rounds[last as usize - 1].matchups.len() != 1 {
            return Err(corruption("last round must hold exactly one matchup"));
        }

        for round in &self.rounds {
            for m in &round.matchups {
                let feeds = incoming.get(&m.key).copied().unwrap_or(0);
                if feeds + m.filled_slots() > 2 {
                    return Err(corruption(format!(
                        "matchup {:?} is fed by {feeds} matchups with {} slots filled",
                        m.key,
                        m.filled_slots()
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Human-readable name for a round, derived from its distance to the final.
pub fn round_name(round_number: u32, total_rounds: u32) -> String {
    match total_rounds.saturating_sub(round_number) {
        0 => "Finals".to_string(),
        1 => "Semifinals".to_string(),
        2 => "Quarterfinals".to_string(),
        from_end => format!("Round of {}", 1u64 << (from_end + 1)),
    }
}

pub(crate) fn corruption(detail: impl Into<String>) -> BracketError {
    BracketError::BracketCorruption(detail.into())
}
