//! Closing rounds, moving winners forward and shifting deadlines.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use super::{
    Bracket, BracketError, MatchupKey, MatchupStatus, Result, RoundStatus, SongId, corruption,
    tally::{self, SongFacts, TieBreak, VoteCounts},
};

/// Outcome of closing one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advancement {
    pub round: u32,
    /// Matchups whose winner was resolved and moved on (or crowned).
    pub winners_advanced: usize,
    /// Matchups decided by the tie-break policy.
    pub tie_breaks: usize,
    pub next_round: Option<u32>,
    pub champion: Option<SongId>,
}

impl Bracket {
    /// Close `round`, resolve every matchup, fill next-round slots and open
    /// the following round.
    ///
    /// On error the bracket may be partially modified; callers work on a copy
    /// inside a transaction and discard it.
    pub fn advance(
        &mut self,
        round: u32,
        counts: &HashMap<MatchupKey, VoteCounts>,
        tie_break: TieBreak,
        facts: &HashMap<SongId, SongFacts>,
        now: DateTime<Utc>,
    ) -> Result<Advancement> {
        let closing = self
            .round_mut(round)
            .ok_or_else(|| corruption(format!("round {round} does not exist")))?;
        if closing.status != RoundStatus::Active {
            return Err(BracketError::RoundNotActive { round });
        }
        closing.status = RoundStatus::Completed;
        closing.ends_at = Some(now);

        let empty = VoteCounts::new();
        let mut outcomes: Vec<(Option<MatchupKey>, SongId)> = Vec::new();
        let mut tie_breaks = 0;
        for m in &mut closing.matchups {
            let votes = counts.get(&m.key).unwrap_or(&empty);
            let (winner, tied) = tally::resolve_at_close(m, votes, tie_break, facts)?;
            debug!(
                "Matchup {:?}: song {winner} wins ({} votes of {})",
                m.key,
                votes.get(winner),
                votes.total()
            );
            m.winner = Some(winner);
            m.status = MatchupStatus::Completed;
            tie_breaks += usize::from(tied);
            outcomes.push((m.next, winner));
        }

        let mut winners_advanced = 0;
        let mut champion = None;
        for (next, winner) in outcomes {
            match next {
                Some(key) => self.place(key, winner)?,
                None => champion = Some(winner),
            }
            winners_advanced += 1;
        }

        let next_round = if self.round(round + 1).is_some() {
            self.activate(round + 1, now)?;
            Some(round + 1)
        } else {
            None
        };

        match (next_round, champion) {
            (Some(_), None) | (None, Some(_)) => {}
            (Some(n), Some(_)) => {
                return Err(corruption(format!(
                    "round {round} crowned a champion but round {n} follows"
                )));
            }
            (None, None) => {
                return Err(corruption(format!("last round {round} produced no champion")));
            }
        }

        info!(
            "Round {round} closed: {winners_advanced} winners advanced, {tie_breaks} tie-breaks"
        );
        Ok(Advancement {
            round,
            winners_advanced,
            tie_breaks,
            next_round,
            champion,
        })
    }

    /// Put `song` into the first empty slot of `key`.
    fn place(&mut self, key: MatchupKey, song: SongId) -> Result<()> {
        let m = self
            .matchup_mut(key)
            .ok_or_else(|| corruption(format!("forward link to missing matchup {key:?}")))?;
        if m.contains(song) {
            return Ok(());
        }
        match m.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(song);
                Ok(())
            }
            None => Err(corruption(format!(
                "matchup {key:?} already holds songs {:?}, cannot place song {song}",
                m.slots
            ))),
        }
    }

    /// Open `number` for voting at `now`, keeping its planned length and
    /// pushing later rounds back if they would now overlap.
    fn activate(&mut self, number: u32, now: DateTime<Utc>) -> Result<()> {
        let round = self
            .round_mut(number)
            .ok_or_else(|| corruption(format!("round {number} does not exist")))?;
        if round.status != RoundStatus::Pending {
            return Err(corruption(format!(
                "round {number} is {} but should be pending",
                round.status
            )));
        }
        if let Some(m) = round.matchups.iter().find(|m| m.filled_slots() != 2) {
            return Err(corruption(format!(
                "matchup {:?} is missing a song as round {number} opens",
                m.key
            )));
        }

        let planned = round.starts_at.zip(round.ends_at).map(|(s, e)| e - s);
        let ends_at = match planned {
            Some(length) => Some(
                now.checked_add_signed(length)
                    .ok_or(BracketError::ScheduleOutOfRange { round: number })?,
            ),
            None => round.ends_at,
        };
        round.status = RoundStatus::Active;
        round.starts_at = Some(now);
        round.ends_at = ends_at;
        for m in &mut round.matchups {
            m.status = MatchupStatus::Active;
        }

        self.reflow_after(number)
    }

    /// Shift rounds after `number` so each starts no earlier than the one
    /// before it ends.
    fn reflow_after(&mut self, number: u32) -> Result<()> {
        let mut prev_end = self.round(number).and_then(|r| r.ends_at);
        for round in self.rounds.iter_mut().skip(number as usize) {
            if let (Some(end), Some(start)) = (prev_end, round.starts_at) {
                if start < end {
                    let shift = end - start;
                    round.starts_at = Some(end);
                    round.ends_at = shift_by(round.ends_at, shift)
                        .ok_or(BracketError::ScheduleOutOfRange {
                            round: round.number,
                        })?;
                }
            }
            prev_end = round.ends_at;
        }
        Ok(())
    }

    /// Push `number`'s deadline back by `hours` and shift every later round
    /// by the same amount, so round lengths stay fixed.
    pub fn extend(&mut self, number: u32, hours: i64) -> Result<()> {
        let not_extendable = |reason| BracketError::RoundNotExtendable {
            round: number,
            reason,
        };
        if hours <= 0 {
            return Err(not_extendable("extension must be a positive number of hours"));
        }
        let shift = Duration::try_hours(hours).ok_or(not_extendable("extension is too large"))?;

        let round = self
            .round_mut(number)
            .ok_or(not_extendable("round does not exist"))?;
        if round.status == RoundStatus::Completed {
            return Err(not_extendable("round is already completed"));
        }
        let end = round.ends_at.ok_or(not_extendable("round has no deadline"))?;
        let too_large = || not_extendable("extension is too large");
        let new_end = end.checked_add_signed(shift).ok_or_else(too_large)?;

        // Every later time is computed before anything moves.
        let later = self
            .rounds
            .iter()
            .skip(number as usize)
            .map(|r| Some((shift_by(r.starts_at, shift)?, shift_by(r.ends_at, shift)?)))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(too_large)?;

        if let Some(round) = self.round_mut(number) {
            round.ends_at = Some(new_end);
        }
        for (round, (starts_at, ends_at)) in
            self.rounds.iter_mut().skip(number as usize).zip(later)
        {
            round.starts_at = starts_at;
            round.ends_at = ends_at;
        }
        info!("Round {number} extended by {hours}h");
        Ok(())
    }
}

/// `at + shift`, with `None` meaning the sum left the representable range.
/// An unset time stays unset.
fn shift_by(at: Option<DateTime<Utc>>, shift: Duration) -> Option<Option<DateTime<Utc>>> {
    match at {
        Some(t) => t.checked_add_signed(shift).map(Some),
        None => Some(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::{builder, seeding::tests::seeds};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 9, 0, 0).unwrap()
    }

    fn facts(n: usize) -> HashMap<SongId, SongFacts> {
        (1..=n as i64)
            .map(|id| {
                (
                    id,
                    SongFacts {
                        seed: id as u32,
                        submitted_at: start() - Duration::minutes(id),
                    },
                )
            })
            .collect()
    }

    fn opened(n: usize, hours: Option<i64>) -> Bracket {
        let mut bracket = builder::build(&seeds(n)).unwrap();
        bracket.open(start(), hours.map(Duration::hours)).unwrap();
        bracket
    }

    /// Give the second slot of every matchup in `round` one vote.
    fn underdog_votes(bracket: &Bracket, round: u32) -> HashMap<MatchupKey, VoteCounts> {
        bracket
            .round(round)
            .unwrap()
            .matchups
            .iter()
            .map(|m| (m.key, [(m.slots[1].unwrap(), 1)].into_iter().collect()))
            .collect()
    }

    #[test]
    fn test_full_run_of_eight() {
        let mut bracket = opened(8, Some(24));
        let f = facts(8);

        let r1 = bracket
            .advance(1, &underdog_votes(&bracket, 1), TieBreak::HigherSeed, &f, start())
            .unwrap();
        assert_eq!(r1.winners_advanced, 4);
        assert_eq!(r1.next_round, Some(2));
        assert_eq!(r1.champion, None);
        assert_eq!(bracket.rounds[1].status, RoundStatus::Active);
        assert_eq!(bracket.rounds[1].matchups[0].slots, [Some(8), Some(5)]);
        assert_eq!(bracket.rounds[1].matchups[1].slots, [Some(7), Some(6)]);

        let r2 = bracket
            .advance(2, &HashMap::new(), TieBreak::HigherSeed, &f, start())
            .unwrap();
        assert_eq!(r2.tie_breaks, 2);
        assert_eq!(bracket.rounds[2].matchups[0].slots, [Some(5), Some(6)]);

        let r3 = bracket
            .advance(3, &HashMap::new(), TieBreak::HigherSeed, &f, start())
            .unwrap();
        assert_eq!(r3.champion, Some(5));
        assert_eq!(r3.next_round, None);
        assert_eq!(r3.winners_advanced, 1);
        assert!(bracket.rounds.iter().all(|r| r.status == RoundStatus::Completed));
    }

    #[test]
    fn test_byes_merge_into_round_two() {
        let mut bracket = opened(5, None);
        let counts = HashMap::from([(
            MatchupKey::new(1, 0),
            [(5, 3), (4, 1)].into_iter().collect::<VoteCounts>(),
        )]);
        bracket
            .advance(1, &counts, TieBreak::HigherSeed, &facts(5), start())
            .unwrap();
        assert_eq!(bracket.rounds[1].matchups[0].slots, [Some(1), Some(3)]);
        assert_eq!(bracket.rounds[1].matchups[1].slots, [Some(2), Some(5)]);
        assert_eq!(bracket.rounds[1].status, RoundStatus::Active);
    }

    #[test]
    fn test_advancing_twice_is_rejected_without_side_effects() {
        let mut bracket = opened(4, None);
        let f = facts(4);
        bracket
            .advance(1, &HashMap::new(), TieBreak::HigherSeed, &f, start())
            .unwrap();
        let snapshot = bracket.clone();
        assert_eq!(
            bracket.advance(1, &HashMap::new(), TieBreak::HigherSeed, &f, start()),
            Err(BracketError::RoundNotActive { round: 1 })
        );
        assert_eq!(bracket, snapshot);
    }

    #[test]
    fn test_pending_round_cannot_advance() {
        let mut bracket = opened(4, None);
        assert_eq!(
            bracket.advance(2, &HashMap::new(), TieBreak::HigherSeed, &facts(4), start()),
            Err(BracketError::RoundNotActive { round: 2 })
        );
    }

    #[test]
    fn test_full_target_slot_is_corruption() {
        let mut bracket = opened(4, None);
        bracket.rounds[1].matchups[0].slots = [Some(98), Some(99)];
        let err = bracket
            .advance(1, &HashMap::new(), TieBreak::HigherSeed, &facts(4), start())
            .unwrap_err();
        assert!(err.is_fault());
    }

    #[test]
    fn test_early_close_restamps_next_round() {
        let mut bracket = opened(8, Some(24));
        let early = start() + Duration::hours(6);
        bracket
            .advance(1, &HashMap::new(), TieBreak::HigherSeed, &facts(8), early)
            .unwrap();
        assert_eq!(bracket.rounds[0].ends_at, Some(early));
        assert_eq!(bracket.rounds[1].starts_at, Some(early));
        assert_eq!(bracket.rounds[1].ends_at, Some(early + Duration::hours(24)));
        // The final keeps its planned slot: it no longer overlaps.
        assert_eq!(bracket.rounds[2].starts_at, Some(start() + Duration::hours(48)));
    }

    #[test]
    fn test_late_close_pushes_later_rounds() {
        let mut bracket = opened(8, Some(24));
        let late = start() + Duration::hours(30);
        bracket
            .advance(1, &HashMap::new(), TieBreak::HigherSeed, &facts(8), late)
            .unwrap();
        let semis_end = late + Duration::hours(24);
        assert_eq!(bracket.rounds[1].ends_at, Some(semis_end));
        assert_eq!(bracket.rounds[2].starts_at, Some(semis_end));
        assert_eq!(bracket.rounds[2].ends_at, Some(semis_end + Duration::hours(24)));
    }

    #[test]
    fn test_extend_shifts_later_rounds() {
        let mut bracket = opened(16, Some(24));
        let before = bracket.clone();
        bracket.extend(2, 5).unwrap();

        let shift = Duration::hours(5);
        assert_eq!(bracket.rounds[0], before.rounds[0]);
        assert_eq!(bracket.rounds[1].starts_at, before.rounds[1].starts_at);
        assert_eq!(bracket.rounds[1].ends_at, before.rounds[1].ends_at.map(|e| e + shift));
        for i in 2..4 {
            let (now, then) = (&bracket.rounds[i], &before.rounds[i]);
            assert_eq!(now.starts_at, then.starts_at.map(|s| s + shift));
            assert_eq!(now.ends_at, then.ends_at.map(|e| e + shift));
            let length = |r: &crate::bracket::Round| r.ends_at.unwrap() - r.starts_at.unwrap();
            assert_eq!(length(now), length(then));
            assert!(now.starts_at >= bracket.rounds[i - 1].ends_at);
        }
    }

    #[test]
    fn test_extend_rejections() {
        let mut bracket = opened(4, Some(24));
        assert!(matches!(
            bracket.extend(1, 0),
            Err(BracketError::RoundNotExtendable { round: 1, .. })
        ));
        assert!(matches!(
            bracket.extend(9, 1),
            Err(BracketError::RoundNotExtendable { round: 9, .. })
        ));
        bracket
            .advance(1, &HashMap::new(), TieBreak::HigherSeed, &facts(4), start())
            .unwrap();
        assert!(matches!(
            bracket.extend(1, 2),
            Err(BracketError::RoundNotExtendable { round: 1, .. })
        ));

        let mut open_ended = opened(4, None);
        assert!(matches!(
            open_ended.extend(1, 2),
            Err(BracketError::RoundNotExtendable { round: 1, .. })
        ));
    }

    #[test]
    fn test_extend_past_date_range_changes_nothing() {
        let mut bracket = opened(8, Some(24));
        let before = bracket.clone();
        assert_eq!(
            bracket.extend(1, 1_000_000_000_000),
            Err(BracketError::RoundNotExtendable {
                round: 1,
                reason: "extension is too large",
            })
        );
        assert_eq!(bracket, before);

        // Round 1's deadline still fits but the later rounds would not.
        let end = bracket.rounds[0].ends_at.unwrap();
        let hours = (DateTime::<Utc>::MAX_UTC - end).num_hours();
        assert!(matches!(
            bracket.extend(1, hours),
            Err(BracketError::RoundNotExtendable { round: 1, .. })
        ));
        assert_eq!(bracket, before);
    }
}
