//! Vote validation, live counts and winner resolution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use super::{BracketError, Matchup, Result, RoundStatus, SongId, corruption};

/// Live vote counts for one matchup, keyed by song.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteCounts(HashMap<SongId, u32>);

impl VoteCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, song: SongId) -> u32 {
        self.0.get(&song).copied().unwrap_or(0)
    }

    pub fn set(&mut self, song: SongId, votes: u32) {
        self.0.insert(song, votes);
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }
}

impl FromIterator<(SongId, u32)> for VoteCounts {
    fn from_iter<I: IntoIterator<Item = (SongId, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What storing a ballot should do given the user's prior vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteAction {
    /// No prior vote: insert one.
    Record,
    /// Prior vote for another song: overwrite it and flag the change.
    Change { from: SongId },
    /// Prior vote for the same song: nothing to write.
    Keep,
}

impl VoteAction {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Change { .. })
    }
}

/// Voting is open while the round is active, its start (if any) has passed
/// and its deadline (if any) is still ahead.
pub fn ensure_open(
    status: RoundStatus,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    let started = starts_at.is_none_or(|start| now >= start);
    let before_deadline = ends_at.is_none_or(|end| now < end);
    if status == RoundStatus::Active && started && before_deadline {
        Ok(())
    } else {
        Err(BracketError::MatchupNotOpen)
    }
}

pub fn ensure_contender(matchup: &Matchup, song: SongId) -> Result<()> {
    if matchup.contains(song) {
        Ok(())
    } else {
        Err(BracketError::InvalidSongForMatchup { song })
    }
}

pub fn decide(prior: Option<SongId>, song: SongId) -> VoteAction {
    match prior {
        None => VoteAction::Record,
        Some(previous) if previous == song => VoteAction::Keep,
        Some(previous) => VoteAction::Change { from: previous },
    }
}

/// The stored winner if resolved, else whichever slot has strictly more
/// votes. A tie, or a matchup still waiting on a song, has no winner yet.
pub fn winner(matchup: &Matchup, counts: &VoteCounts) -> Option<SongId> {
    if matchup.winner.is_some() {
        return matchup.winner;
    }
    let [Some(a), Some(b)] = matchup.slots else {
        return None;
    };
    match counts.get(a).cmp(&counts.get(b)) {
        std::cmp::Ordering::Greater => Some(a),
        std::cmp::Ordering::Less => Some(b),
        std::cmp::Ordering::Equal => None,
    }
}

/// How a matchup tied at round close is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The better seed (lower seed number) advances.
    #[default]
    HigherSeed,
    /// The song submitted first advances.
    EarlierSubmission,
}

/// Per-song facts needed to break ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SongFacts {
    pub seed: u32,
    pub submitted_at: DateTime<Utc>,
}

impl TieBreak {
    pub fn pick(&self, a: SongId, b: SongId, facts: &HashMap<SongId, SongFacts>) -> Result<SongId> {
        let fa = facts
            .get(&a)
            .ok_or_else(|| corruption(format!("no seed recorded for song {a}")))?;
        let fb = facts
            .get(&b)
            .ok_or_else(|| corruption(format!("no seed recorded for song {b}")))?;
        let a_first = match self {
            Self::HigherSeed => fa.seed < fb.seed,
            Self::EarlierSubmission => (fa.submitted_at, a) < (fb.submitted_at, b),
        };
        Ok(if a_first { a } else { b })
    }
}

/// Settle a matchup at round close.
///
/// Returns the winner and whether the tie-break decided it. A matchup with a
/// single song is a walkover; one with no songs at all is corruption.
pub fn resolve_at_close(
    matchup: &Matchup,
    counts: &VoteCounts,
    tie_break: TieBreak,
    facts: &HashMap<SongId, SongFacts>,
) -> Result<(SongId, bool)> {
    if let Some(w) = winner(matchup, counts) {
        return Ok((w, false));
    }
    match matchup.slots {
        [Some(a), Some(b)] => {
            let w = tie_break.pick(a, b, facts)?;
            warn!(
                "Matchup {:?} tied at {} votes each; {:?} advances song {w}",
                matchup.key,
                counts.get(a),
                tie_break
            );
            Ok((w, true))
        }
        [Some(only), None] | [None, Some(only)] => {
            warn!("Matchup {:?} closed with one song; song {only} walks over", matchup.key);
            Ok((only, false))
        }
        [None, None] => Err(corruption(format!(
            "matchup {:?} closed with no songs",
            matchup.key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::{MatchupKey, MatchupStatus};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, hour, 0, 0).unwrap()
    }

    fn matchup(a: Option<SongId>, b: Option<SongId>) -> Matchup {
        Matchup {
            key: MatchupKey::new(1, 0),
            slots: [a, b],
            winner: None,
            status: MatchupStatus::Active,
            next: None,
        }
    }

    fn facts() -> HashMap<SongId, SongFacts> {
        HashMap::from([
            (10, SongFacts { seed: 3, submitted_at: at(1) }),
            (20, SongFacts { seed: 6, submitted_at: at(0) }),
        ])
    }

    #[test]
    fn test_open_window() {
        assert!(ensure_open(RoundStatus::Active, Some(at(1)), Some(at(5)), at(3)).is_ok());
        assert!(ensure_open(RoundStatus::Active, None, None, at(3)).is_ok());
        assert!(ensure_open(RoundStatus::Active, Some(at(3)), None, at(3)).is_ok());
    }

    #[test]
    fn test_closed_window() {
        let closed = Err(BracketError::MatchupNotOpen);
        assert_eq!(ensure_open(RoundStatus::Pending, None, None, at(3)), closed);
        assert_eq!(ensure_open(RoundStatus::Completed, None, None, at(3)), closed);
        assert_eq!(ensure_open(RoundStatus::Active, Some(at(4)), None, at(3)), closed);
        // The deadline itself is already too late.
        assert_eq!(ensure_open(RoundStatus::Active, None, Some(at(3)), at(3)), closed);
    }

    #[test]
    fn test_contender_check() {
        let m = matchup(Some(10), Some(20));
        assert!(ensure_contender(&m, 10).is_ok());
        assert_eq!(
            ensure_contender(&m, 30),
            Err(BracketError::InvalidSongForMatchup { song: 30 })
        );
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(None, 10), VoteAction::Record);
        assert_eq!(decide(Some(10), 10), VoteAction::Keep);
        assert_eq!(decide(Some(20), 10), VoteAction::Change { from: 20 });
        assert!(decide(Some(20), 10).changed());
        assert!(!decide(Some(10), 10).changed());
    }

    #[test]
    fn test_live_winner() {
        let m = matchup(Some(10), Some(20));
        let counts: VoteCounts = [(10, 3), (20, 5)].into_iter().collect();
        assert_eq!(winner(&m, &counts), Some(20));

        let tied: VoteCounts = [(10, 4), (20, 4)].into_iter().collect();
        assert_eq!(winner(&m, &tied), None);
        assert_eq!(winner(&m, &VoteCounts::new()), None);
    }

    #[test]
    fn test_stored_winner_wins_over_counts() {
        let mut m = matchup(Some(10), Some(20));
        m.winner = Some(10);
        let counts: VoteCounts = [(20, 9)].into_iter().collect();
        assert_eq!(winner(&m, &counts), Some(10));
    }

    #[test]
    fn test_tie_breaks() {
        assert_eq!(TieBreak::HigherSeed.pick(10, 20, &facts()), Ok(10));
        assert_eq!(TieBreak::HigherSeed.pick(20, 10, &facts()), Ok(10));
        assert_eq!(TieBreak::EarlierSubmission.pick(10, 20, &facts()), Ok(20));
        assert!(TieBreak::HigherSeed.pick(10, 99, &facts()).is_err());
    }

    #[test]
    fn test_resolve_at_close() {
        let m = matchup(Some(10), Some(20));
        let tied: VoteCounts = [(10, 2), (20, 2)].into_iter().collect();
        assert_eq!(resolve_at_close(&m, &tied, TieBreak::HigherSeed, &facts()), Ok((10, true)));

        let clear: VoteCounts = [(20, 1)].into_iter().collect();
        assert_eq!(resolve_at_close(&m, &clear, TieBreak::HigherSeed, &facts()), Ok((20, false)));

        let walkover = matchup(None, Some(20));
        assert_eq!(
            resolve_at_close(&walkover, &VoteCounts::new(), TieBreak::HigherSeed, &facts()),
            Ok((20, false))
        );

        let empty = matchup(None, None);
        assert!(resolve_at_close(&empty, &VoteCounts::new(), TieBreak::HigherSeed, &facts()).is_err());
    }
}
