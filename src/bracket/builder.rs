//! Turns a seed list into the full round/matchup skeleton.
//!
//! Round 1 pairs the non-bye seeds best against worst. Round 2 is where the
//! bye seeds enter: byes are paired with each other (again best against
//! worst), any bye left over takes on one of the lowest-ranked Round-1
//! winners, and the remaining Round-1 winners are paired best against worst.
//! Round-2 matchups are then laid out in classic bracket order, which keeps
//! seeds 1 and 2 in opposite halves so they can only meet in the final.
//! From Round 3 on, matchups 2k and 2k+1 feed matchup k of the next round.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use log::debug;

use super::{
    Bracket, BracketError, Matchup, MatchupKey, MatchupStatus, Result, Round, RoundStatus,
    SongId, corruption, round_name, seeding::SeededSong,
};

/// Shape numbers for a bracket of `entrants` songs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketShape {
    pub entrants: usize,
    pub bracket_size: usize,
    pub num_byes: usize,
    pub total_rounds: u32,
}

impl BracketShape {
    pub fn for_entrants(entrants: usize) -> Result<Self> {
        if entrants < 2 {
            return Err(BracketError::InsufficientEntrants { found: entrants });
        }
        let bracket_size = entrants.next_power_of_two();
        Ok(Self {
            entrants,
            bracket_size,
            num_byes: bracket_size - entrants,
            total_rounds: bracket_size.trailing_zeros(),
        })
    }

    pub fn round1_matchups(&self) -> usize {
        self.entrants - self.bracket_size / 2
    }

    /// Matchups in `round` (1-based).
    pub fn matchups_in_round(&self, round: u32) -> usize {
        if round == 1 {
            self.round1_matchups()
        } else {
            self.bracket_size >> round.min(usize::BITS - 1)
        }
    }
}

/// Who fills a Round-2 slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    /// Index into the seed list of a song with a bye.
    Bye(usize),
    /// Winner of the Round-1 matchup at this position.
    Winner(usize),
}

impl Feed {
    /// Best seed number that can arrive through this feed.
    fn rank(self, num_byes: usize) -> usize {
        match self {
            Feed::Bye(i) => i + 1,
            Feed::Winner(pos) => num_byes + pos + 1,
        }
    }
}

/// Build the bracket for seeds ordered 1..=N. All rounds start pending.
pub fn build(seeds: &[SeededSong]) -> Result<Bracket> {
    let shape = BracketShape::for_entrants(seeds.len())?;
    let mut ordered: Vec<SeededSong> = seeds.to_vec();
    ordered.sort_by_key(|s| s.seed);
    if ordered.iter().zip(1u32..).any(|(s, expected)| s.seed != expected) {
        return Err(corruption("seed numbers must run 1..=N without gaps"));
    }
    let songs: Vec<SongId> = ordered.iter().map(|s| s.song_id).collect();

    debug!(
        "Building bracket: {} songs, size {}, {} byes, {} rounds",
        shape.entrants, shape.bracket_size, shape.num_byes, shape.total_rounds
    );

    let mut rounds: Vec<Round> = (1..=shape.total_rounds)
        .map(|number| Round {
            number,
            name: round_name(number, shape.total_rounds),
            status: RoundStatus::Pending,
            starts_at: None,
            ends_at: None,
            matchups: Vec::new(),
        })
        .collect();

    // Round 1: best remaining seed against worst seed.
    let contenders = &songs[shape.num_byes..];
    let round1 = shape.round1_matchups();
    for pos in 0..round1 {
        let key = MatchupKey::new(1, pos as u32);
        let mut m = Matchup::placeholder(key, None);
        m.slots = [Some(contenders[pos]), Some(contenders[contenders.len() - 1 - pos])];
        rounds[0].matchups.push(m);
    }

    if shape.total_rounds >= 2 {
        let layout = round_two_layout(&shape)?;
        let mut round2 = Vec::with_capacity(layout.len());
        for (pos, (a, b)) in layout.into_iter().enumerate() {
            let key = MatchupKey::new(2, pos as u32);
            let next = (shape.total_rounds > 2).then(|| MatchupKey::new(3, pos as u32 / 2));
            let mut m = Matchup::placeholder(key, next);
            for (slot, feed) in [a, b].into_iter().enumerate() {
                match feed {
                    Feed::Bye(i) => m.slots[slot] = Some(songs[i]),
                    Feed::Winner(r1) => rounds[0].matchups[r1].next = Some(key),
                }
            }
            round2.push(m);
        }
        rounds[1].matchups = round2;

        for number in 3..=shape.total_rounds {
            let count = shape.matchups_in_round(number);
            for pos in 0..count as u32 {
                let next = (number < shape.total_rounds)
                    .then(|| MatchupKey::new(number + 1, pos / 2));
                rounds[number as usize - 1]
                    .matchups
                    .push(Matchup::placeholder(MatchupKey::new(number, pos), next));
            }
        }
    }

    let bracket = Bracket { rounds };
    bracket.validate()?;
    check_entrants_placed(&bracket, &songs)?;
    Ok(bracket)
}

/// Pair the Round-2 feeds and order the pairs for bracket placement.
fn round_two_layout(shape: &BracketShape) -> Result<Vec<(Feed, Feed)>> {
    let byes = shape.num_byes;
    let mut pairs: Vec<(Feed, Feed)> = Vec::new();
    let mut singles: Vec<Feed> = Vec::new();

    if byes == 2 {
        // The only two byes are seeds 1 and 2; pairing them would make the
        // Round-2 matchup a premature final.
        singles.extend([Feed::Bye(0), Feed::Bye(1)]);
    } else {
        for i in 0..byes / 2 {
            pairs.push((Feed::Bye(i), Feed::Bye(byes - 1 - i)));
        }
        if byes % 2 == 1 {
            singles.push(Feed::Bye(byes / 2));
        }
    }

    let mut winners: VecDeque<Feed> = (0..shape.round1_matchups()).map(Feed::Winner).collect();
    for single in singles {
        let low = winners
            .pop_back()
            .ok_or_else(|| corruption("no Round-1 winner left for a bye seed"))?;
        pairs.push((single, low));
    }
    while let Some(high) = winners.pop_front() {
        let low = winners
            .pop_back()
            .ok_or_else(|| corruption("odd number of Round-1 winners"))?;
        pairs.push((high, low));
    }

    let expected = shape.matchups_in_round(2);
    if pairs.len() != expected {
        return Err(corruption(format!(
            "round 2 needs {expected} matchups, layout produced {}",
            pairs.len()
        )));
    }

    // pairs[rank - 1] is the matchup whose best possible seed has that rank.
    pairs.sort_by_key(|(high, _)| high.rank(byes));
    Ok(placement_order(expected)
        .into_iter()
        .map(|rank| pairs[rank - 1])
        .collect())
}

/// Classic bracket order of ranks 1..=n (n a power of two): for 8 this is
/// `[1, 8, 4, 5, 2, 7, 3, 6]`. Adjacent positions hold ranks summing to n + 1
/// at every level, so the two best ranks sit in opposite halves.
pub fn placement_order(n: usize) -> Vec<usize> {
    let mut order = vec![1];
    while order.len() < n {
        let size = order.len() * 2;
        order = order.iter().flat_map(|&r| [r, size + 1 - r]).collect();
    }
    order
}

/// Every seeded song must appear exactly once among Round-1 slots and
/// Round-2 bye slots.
fn check_entrants_placed(bracket: &Bracket, songs: &[SongId]) -> Result<()> {
    let mut placed: Vec<SongId> = bracket
        .rounds
        .iter()
        .take(2)
        .flat_map(|r| r.matchups.iter())
        .flat_map(|m| m.slots.iter().flatten().copied())
        .collect();
    placed.sort_unstable();
    let mut expected = songs.to_vec();
    expected.sort_unstable();
    if placed != expected {
        return Err(corruption("bracket does not place every entrant exactly once"));
    }
    Ok(())
}

impl Bracket {
    /// Open Round 1 for voting at `now` and lay out the planned schedule.
    ///
    /// With a round duration, round r runs from `now + (r-1)·d` to `now + r·d`.
    /// Without one, only Round 1 gets a start time and no round has a deadline.
    /// Fails without touching the bracket if a deadline would overflow.
    pub fn open(&mut self, now: DateTime<Utc>, round_duration: Option<Duration>) -> Result<()> {
        let schedule = self
            .rounds
            .iter()
            .enumerate()
            .map(|(i, round)| match round_duration {
                Some(d) => {
                    let at = |k: i32| d.checked_mul(k).and_then(|t| now.checked_add_signed(t));
                    let offset = i as i32;
                    match (at(offset), at(offset + 1)) {
                        (Some(start), Some(end)) => Ok((Some(start), Some(end))),
                        _ => Err(BracketError::ScheduleOutOfRange {
                            round: round.number,
                        }),
                    }
                }
                None => Ok(((i == 0).then_some(now), None)),
            })
            .collect::<Result<Vec<_>>>()?;
        for (round, (starts_at, ends_at)) in self.rounds.iter_mut().zip(schedule) {
            round.starts_at = starts_at;
            round.ends_at = ends_at;
        }
        if let Some(first) = self.rounds.first_mut() {
            first.status = RoundStatus::Active;
            for m in &mut first.matchups {
                m.status = MatchupStatus::Active;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::seeding::tests::seeds;
    use proptest::prelude::*;

    fn slot_pair(bracket: &Bracket, round: u32, pos: u32) -> [Option<SongId>; 2] {
        bracket.matchup(MatchupKey::new(round, pos)).unwrap().slots
    }

    /// Follow forward links from the matchup holding `song` in its entry round.
    fn path(bracket: &Bracket, song: SongId) -> Vec<MatchupKey> {
        let start = bracket
            .rounds
            .iter()
            .take(2)
            .flat_map(|r| r.matchups.iter())
            .find(|m| m.contains(song))
            .unwrap();
        let mut keys = vec![start.key];
        let mut next = start.next;
        while let Some(key) = next {
            keys.push(key);
            next = bracket.matchup(key).unwrap().next;
        }
        keys
    }

    #[test]
    fn test_shape_numbers() {
        let shape = BracketShape::for_entrants(5).unwrap();
        assert_eq!(shape.bracket_size, 8);
        assert_eq!(shape.num_byes, 3);
        assert_eq!(shape.total_rounds, 3);
        assert_eq!(shape.round1_matchups(), 1);
        assert_eq!(shape.matchups_in_round(2), 2);
        assert_eq!(shape.matchups_in_round(3), 1);

        let shape = BracketShape::for_entrants(2).unwrap();
        assert_eq!((shape.bracket_size, shape.num_byes, shape.total_rounds), (2, 0, 1));
    }

    #[test]
    fn test_placement_order() {
        assert_eq!(placement_order(1), vec![1]);
        assert_eq!(placement_order(2), vec![1, 2]);
        assert_eq!(placement_order(4), vec![1, 4, 2, 3]);
        assert_eq!(placement_order(8), vec![1, 8, 4, 5, 2, 7, 3, 6]);
    }

    #[test]
    fn test_eight_songs_no_byes() {
        let bracket = build(&seeds(8)).unwrap();
        let counts: Vec<usize> = bracket.rounds.iter().map(|r| r.matchups.len()).collect();
        assert_eq!(counts, vec![4, 2, 1]);
        assert_eq!(slot_pair(&bracket, 1, 0), [Some(1), Some(8)]);
        assert_eq!(slot_pair(&bracket, 1, 1), [Some(2), Some(7)]);
        assert_eq!(slot_pair(&bracket, 1, 2), [Some(3), Some(6)]);
        assert_eq!(slot_pair(&bracket, 1, 3), [Some(4), Some(5)]);
        assert_eq!(bracket.rounds[2].name, "Finals");
        assert_eq!(bracket.rounds[0].name, "Quarterfinals");

        // 1v8 and 4v5 feed one semifinal, 2v7 and 3v6 the other.
        let semi = |pos: u32| bracket.matchup(MatchupKey::new(1, pos)).unwrap().next;
        assert_eq!(semi(0), semi(3));
        assert_eq!(semi(1), semi(2));
        assert_ne!(semi(0), semi(1));
    }

    #[test]
    fn test_five_songs_three_byes() {
        let bracket = build(&seeds(5)).unwrap();
        assert_eq!(bracket.total_rounds(), 3);
        assert_eq!(bracket.rounds[0].matchups.len(), 1);
        assert_eq!(slot_pair(&bracket, 1, 0), [Some(4), Some(5)]);

        assert_eq!(bracket.rounds[1].matchups.len(), 2);
        assert_eq!(slot_pair(&bracket, 2, 0), [Some(1), Some(3)]);
        assert_eq!(slot_pair(&bracket, 2, 1), [Some(2), None]);
        assert_eq!(
            bracket.matchup(MatchupKey::new(1, 0)).unwrap().next,
            Some(MatchupKey::new(2, 1))
        );
    }

    #[test]
    fn test_six_songs_keeps_top_seeds_apart() {
        let bracket = build(&seeds(6)).unwrap();
        assert_eq!(slot_pair(&bracket, 1, 0), [Some(3), Some(6)]);
        assert_eq!(slot_pair(&bracket, 1, 1), [Some(4), Some(5)]);
        assert_eq!(slot_pair(&bracket, 2, 0), [Some(1), None]);
        assert_eq!(slot_pair(&bracket, 2, 1), [Some(2), None]);
        // Seed 1 meets the 4v5 winner, seed 2 the 3v6 winner.
        assert_eq!(
            bracket.matchup(MatchupKey::new(1, 1)).unwrap().next,
            Some(MatchupKey::new(2, 0))
        );
        assert_eq!(
            bracket.matchup(MatchupKey::new(1, 0)).unwrap().next,
            Some(MatchupKey::new(2, 1))
        );
    }

    #[test]
    fn test_twelve_songs_bye_pairs_in_opposite_halves() {
        let bracket = build(&seeds(12)).unwrap();
        assert_eq!(bracket.rounds[1].matchups.len(), 4);
        let round2: Vec<[Option<SongId>; 2]> =
            bracket.rounds[1].matchups.iter().map(|m| m.slots).collect();
        assert_eq!(round2[0], [Some(1), Some(4)]);
        assert_eq!(round2[2], [Some(2), Some(3)]);
        assert_eq!(round2[1], [None, None]);
        assert_eq!(round2[3], [None, None]);
    }

    #[test]
    fn test_two_songs_is_a_single_final() {
        let bracket = build(&seeds(2)).unwrap();
        assert_eq!(bracket.total_rounds(), 1);
        assert_eq!(slot_pair(&bracket, 1, 0), [Some(1), Some(2)]);
        assert_eq!(bracket.rounds[0].matchups[0].next, None);
    }

    #[test]
    fn test_three_songs() {
        let bracket = build(&seeds(3)).unwrap();
        assert_eq!(slot_pair(&bracket, 1, 0), [Some(2), Some(3)]);
        assert_eq!(slot_pair(&bracket, 2, 0), [Some(1), None]);
    }

    #[test]
    fn test_rejects_single_entrant() {
        assert_eq!(
            build(&seeds(1)),
            Err(BracketError::InsufficientEntrants { found: 1 })
        );
    }

    #[test]
    fn test_rejects_gapped_seeds() {
        let mut s = seeds(4);
        s[3].seed = 7;
        assert!(matches!(build(&s), Err(BracketError::BracketCorruption(_))));
    }

    #[test]
    fn test_open_schedules_rounds_back_to_back() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap();
        let mut bracket = build(&seeds(8)).unwrap();
        bracket.open(now, Some(Duration::hours(24))).unwrap();

        assert_eq!(bracket.rounds[0].status, RoundStatus::Active);
        assert!(bracket.rounds[0].matchups.iter().all(|m| m.status == MatchupStatus::Active));
        assert_eq!(bracket.rounds[1].status, RoundStatus::Pending);
        assert_eq!(bracket.rounds[0].starts_at, Some(now));
        assert_eq!(bracket.rounds[2].starts_at, Some(now + Duration::hours(48)));
        assert_eq!(bracket.rounds[2].ends_at, Some(now + Duration::hours(72)));

        let mut open_ended = build(&seeds(8)).unwrap();
        open_ended.open(now, None).unwrap();
        assert_eq!(open_ended.rounds[0].starts_at, Some(now));
        assert!(open_ended.rounds.iter().all(|r| r.ends_at.is_none()));
        assert_eq!(open_ended.rounds[1].starts_at, None);
    }

    #[test]
    fn test_open_rejects_schedule_past_date_range() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 18, 0, 0).unwrap();
        let mut bracket = build(&seeds(8)).unwrap();
        let huge = Duration::try_hours(1_000_000_000_000).unwrap();
        assert_eq!(
            bracket.open(now, Some(huge)),
            Err(BracketError::ScheduleOutOfRange { round: 1 })
        );
        assert!(bracket.rounds.iter().all(|r| r.starts_at.is_none() && r.ends_at.is_none()));
        assert_eq!(bracket.rounds[0].status, RoundStatus::Pending);
    }

    proptest! {
        #[test]
        fn bracket_shape_holds_for_any_size(n in 2usize..=130) {
            let bracket = build(&seeds(n)).unwrap();
            let shape = BracketShape::for_entrants(n).unwrap();

            let expected_rounds = (n as f64).log2().ceil() as u32;
            prop_assert_eq!(bracket.total_rounds(), expected_rounds);

            let round1_songs = bracket.rounds[0].matchups.len() * 2;
            prop_assert_eq!(round1_songs + shape.num_byes, n);

            for r in 1..bracket.rounds.len() {
                let byes_entering = if r == 1 { shape.num_byes } else { 0 };
                let expected = (bracket.rounds[r - 1].matchups.len() + byes_entering).div_ceil(2);
                prop_assert_eq!(bracket.rounds[r].matchups.len(), expected);
            }
        }

        #[test]
        fn top_two_seeds_only_meet_in_the_final(n in 2usize..=130) {
            let bracket = build(&seeds(n)).unwrap();
            let one = path(&bracket, 1);
            let two = path(&bracket, 2);
            let shared: Vec<&MatchupKey> = one.iter().filter(|k| two.contains(k)).collect();
            let final_key = bracket.final_matchup().unwrap().key;
            prop_assert_eq!(shared, vec![&final_key]);
        }
    }
}
