//! Transactional front end over the bracket engine.
//!
//! Each mutating operation opens one IMMEDIATE transaction, loads what it
//! needs, runs the pure logic from [`crate::bracket`], writes the result back
//! with compare-and-swap guards and commits. Any error drops the transaction,
//! which rolls back every write made so far.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use thiserror::Error;

use crate::bracket::{
    BracketError, MatchupKey, MatchupStatus, SongId, TournamentStatus, UserId,
    builder::{self, BracketShape},
    corruption,
    seeding::{self, SeedOrder, SeededSong},
    tally::{self, TieBreak, VoteAction, VoteCounts},
};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::models::{
    BracketView, MatchupView, RoundView, Song, SongSlotView, Tournament,
};
use crate::db::{Database, DbError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Bracket(#[from] BracketError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("registration is closed for this tournament")]
    RegistrationClosed,
    #[error("submission limit of {limit} songs reached")]
    SubmissionLimitReached { limit: u32 },
    #[error("\"{title}\" by {artist} was already submitted")]
    DuplicateSong { title: String, artist: String },
    #[error("could not find an unused tournament code")]
    CodeSpaceExhausted,
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(e))
    }
}

impl EngineError {
    /// True for failures that point at a bug or a broken store rather than a
    /// request the caller can fix.
    pub fn is_system_fault(&self) -> bool {
        match self {
            Self::Bracket(e) => e.is_fault(),
            Self::Db(_) | Self::CodeSpaceExhausted => true,
            Self::NotFound(_)
            | Self::RegistrationClosed
            | Self::SubmissionLimitReached { .. }
            | Self::DuplicateSong { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Policy knobs the engine reads on every operation.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub seed_order: SeedOrder,
    pub tie_break: TieBreak,
    pub round_duration: Option<Duration>,
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            seed_order: config.seed_order,
            tie_break: config.tie_break,
            round_duration: config.round_duration(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub round1_matchups: usize,
    pub total_matchups: usize,
    pub num_byes: usize,
    pub total_rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteReceipt {
    pub accepted: bool,
    /// The user had voted for the other song and this vote replaced it.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    pub tournament_id: i64,
    pub round: u32,
    pub winners_advanced: usize,
    pub tie_breaks: usize,
    pub next_round_name: Option<String>,
    pub tournament_completed: bool,
    pub champion: Option<SongId>,
}

/// A round that could not be closed on its deadline.
#[derive(Debug)]
pub struct TickFailure {
    pub tournament_id: i64,
    pub round: u32,
    pub error: EngineError,
}

/// Result of one sweep over expired rounds.
#[derive(Debug, Default)]
pub struct TickReport {
    pub closed: Vec<AdvanceReport>,
    pub failed: Vec<TickFailure>,
}

pub struct Engine<C: Clock = SystemClock> {
    db: Database,
    clock: C,
    settings: EngineSettings,
}

impl<C: Clock> Engine<C> {
    pub fn new(db: Database, clock: C, settings: EngineSettings) -> Self {
        Self {
            db,
            clock,
            settings,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run `f` in a write transaction and commit if it succeeds.
    ///
    /// The clock is read after the write lock is held, so the time an
    /// operation sees agrees with the order operations commit in.
    pub(crate) fn write<T>(
        &self,
        op: &str,
        f: impl FnOnce(&Transaction<'_>, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let result = self.db.write_txn().map_err(EngineError::from).and_then(|tx| {
            let value = f(&tx, self.clock.now())?;
            tx.commit()?;
            Ok(value)
        });
        if let Err(e) = &result {
            if e.is_system_fault() {
                error!("{op} failed: {e}");
            } else {
                debug!("{op} rejected: {e}");
            }
        }
        result
    }

    pub fn tournament(&self, id: i64) -> Result<Tournament> {
        load_tournament(&self.db.conn, id)
    }

    pub fn list_tournaments(&self) -> Result<Vec<Tournament>> {
        Ok(self.db.list_tournaments()?)
    }

    /// Rank the tournament's songs and store their seeds. Can be re-run
    /// while registration is open; seeds freeze once the bracket exists.
    pub fn seed_songs(&self, tournament_id: i64) -> Result<Vec<SeededSong>> {
        self.write("seed songs", |tx, _| {
            let t = load_tournament(tx, tournament_id)?;
            let seeds = self.seed_in(tx, &t)?;
            info!("Seeded {} songs for {}", seeds.len(), t.formatted_code());
            Ok(seeds)
        })
    }

    fn seed_in(&self, conn: &Connection, t: &Tournament) -> Result<Vec<SeededSong>> {
        if t.status != TournamentStatus::Registration {
            return Err(BracketError::BracketAlreadyBuilt.into());
        }
        let entrants = Database::get_entrants(conn, t.id)?;
        let seeds = seeding::seed_entrants(&entrants, self.settings.seed_order)?;
        Database::set_seeds(conn, &seeds)?;
        Ok(seeds)
    }

    /// Close registration, seed, build every round and open Round 1.
    pub fn build_bracket(&self, tournament_id: i64) -> Result<BuildReport> {
        self.write("build bracket", |tx, now| {
            let t = load_tournament(tx, tournament_id)?;
            let voting = t.status.open_voting()?;
            if Database::load_bracket(tx, t.id)?.is_some() {
                return Err(BracketError::BracketAlreadyBuilt.into());
            }

            let seeds = self.seed_in(tx, &t)?;
            let shape = BracketShape::for_entrants(seeds.len())?;
            let mut bracket = builder::build(&seeds)?;
            bracket.open(now, self.settings.round_duration)?;

            if !Database::set_tournament_status(tx, t.id, t.version, voting)? {
                return Err(BracketError::BracketAlreadyBuilt.into());
            }
            Database::insert_bracket(tx, t.id, &bracket)?;

            info!(
                "Built bracket for {}: {} songs, {} byes, {} rounds",
                t.formatted_code(),
                shape.entrants,
                shape.num_byes,
                shape.total_rounds
            );
            Ok(BuildReport {
                round1_matchups: shape.round1_matchups(),
                total_matchups: bracket.total_matchups(),
                num_byes: shape.num_byes,
                total_rounds: shape.total_rounds,
            })
        })
    }

    /// Record `user`'s vote for `song` in a matchup, replacing any earlier
    /// vote of theirs in the same matchup.
    pub fn cast_vote(&self, user: UserId, matchup_id: i64, song: SongId) -> Result<VoteReceipt> {
        self.write("cast vote", |tx, now| {
            let tournament_id = Database::matchup_tournament(tx, matchup_id)?
                .ok_or_else(|| EngineError::NotFound(format!("matchup {matchup_id}")))?;
            let stored = Database::load_bracket(tx, tournament_id)?
                .ok_or_else(|| corruption(format!("matchup {matchup_id} exists without rounds")))?;
            let key = stored
                .key_of(matchup_id)
                .ok_or_else(|| corruption(format!("matchup {matchup_id} missing from its bracket")))?;
            let (Some(round), Some(matchup)) =
                (stored.bracket.round(key.round), stored.bracket.matchup(key))
            else {
                return Err(corruption(format!("matchup {key:?} is out of range")).into());
            };

            tally::ensure_open(round.status, round.starts_at, round.ends_at, now)?;
            if matchup.status != MatchupStatus::Active {
                return Err(BracketError::MatchupNotOpen.into());
            }
            tally::ensure_contender(matchup, song)?;

            let action = tally::decide(Database::get_vote(tx, user, matchup_id)?, song);
            match action {
                VoteAction::Record => Database::upsert_vote(tx, user, matchup_id, song, false, now)?,
                VoteAction::Change { from } => {
                    debug!("User {user} switched matchup {matchup_id} from song {from} to {song}");
                    Database::upsert_vote(tx, user, matchup_id, song, true, now)?
                }
                VoteAction::Keep => {}
            }
            Ok(VoteReceipt {
                accepted: true,
                changed: action.changed(),
            })
        })
    }

    /// Close `round`, move its winners on and open the next round, or
    /// complete the tournament after the final.
    pub fn advance_round(&self, tournament_id: i64, round: u32) -> Result<AdvanceReport> {
        self.write("advance round", |tx, now| {
            let t = load_tournament(tx, tournament_id)?;
            let mut stored = Database::load_bracket(tx, t.id)?
                .ok_or(BracketError::RoundNotActive { round })?;

            let mut by_id = Database::vote_counts(tx, t.id)?;
            let counts: HashMap<MatchupKey, VoteCounts> = stored
                .matchup_ids
                .iter()
                .filter_map(|(key, id)| by_id.remove(id).map(|c| (*key, c)))
                .collect();
            let facts = Database::song_facts(tx, t.id)?;

            let adv = stored
                .bracket
                .advance(round, &counts, self.settings.tie_break, &facts, now)?;
            let status = t.status.close_round(round, adv.next_round)?;

            let round_id = stored
                .round_id(round)
                .ok_or_else(|| corruption(format!("round {round} has no stored row")))?;
            if !Database::complete_round(tx, round_id, now)? {
                return Err(BracketError::RoundNotActive { round }.into());
            }
            Database::save_bracket(tx, &stored)?;
            if !Database::set_tournament_status(tx, t.id, t.version, status)? {
                return Err(BracketError::RoundNotActive { round }.into());
            }

            let next_round_name = adv
                .next_round
                .and_then(|n| stored.bracket.round(n))
                .map(|r| r.name.clone());
            match adv.champion {
                Some(song) => info!("{} completed, champion is song {song}", t.formatted_code()),
                None => info!(
                    "{} moved on to {}",
                    t.formatted_code(),
                    next_round_name.as_deref().unwrap_or("the next round")
                ),
            }
            Ok(AdvanceReport {
                tournament_id: t.id,
                round,
                winners_advanced: adv.winners_advanced,
                tie_breaks: adv.tie_breaks,
                next_round_name,
                tournament_completed: status == TournamentStatus::Completed,
                champion: adv.champion,
            })
        })
    }

    /// Push a round's deadline back by `hours`, shifting every later round.
    pub fn extend_round(&self, tournament_id: i64, round: u32, hours: i64) -> Result<()> {
        self.write("extend round", |tx, _| {
            let t = load_tournament(tx, tournament_id)?;
            let mut stored =
                Database::load_bracket(tx, t.id)?.ok_or(BracketError::RoundNotExtendable {
                    round,
                    reason: "bracket has not been built",
                })?;
            stored.bracket.extend(round, hours)?;
            Database::save_bracket(tx, &stored)?;
            Ok(())
        })
    }

    /// Advance every active round whose deadline has passed.
    ///
    /// Each round closes in its own transaction. A round someone else closed
    /// first is skipped. A round that fails to close is rolled back and
    /// reported, and the sweep moves on to the next one.
    pub fn close_expired_rounds(&self) -> Result<TickReport> {
        let expired = Database::expired_rounds(&self.db.conn, self.clock.now())?;
        let mut report = TickReport::default();
        for r in expired {
            match self.advance_round(r.tournament_id, r.round_number) {
                Ok(closed) => report.closed.push(closed),
                Err(EngineError::Bracket(BracketError::RoundNotActive { round })) => {
                    debug!("Round {round} of tournament {} already closed", r.tournament_id);
                }
                Err(error) => {
                    warn!(
                        "Round {} of tournament {} stays open: {error}",
                        r.round_number, r.tournament_id
                    );
                    report.failed.push(TickFailure {
                        tournament_id: r.tournament_id,
                        round: r.round_number,
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Rounds, matchups, songs and live vote counts of a tournament.
    pub fn bracket_view(&self, tournament_id: i64) -> Result<BracketView> {
        // One read transaction so every query sees the same snapshot.
        let tx = self.db.conn.unchecked_transaction()?;
        let t = load_tournament(&tx, tournament_id)?;
        let songs: HashMap<SongId, Song> = Database::get_songs(&tx, t.id)?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        let counts = Database::vote_counts(&tx, t.id)?;
        let stored = Database::load_bracket(&tx, t.id)?;
        drop(tx);

        let slot = |song: Option<SongId>, votes: &VoteCounts| {
            song.and_then(|id| songs.get(&id)).map(|s| SongSlotView {
                song_id: s.id,
                title: s.title.clone(),
                artist: s.artist.clone(),
                seed: s.seed,
                votes: votes.get(s.id),
            })
        };

        let empty = VoteCounts::new();
        let mut rounds = Vec::new();
        let mut champion = None;
        if let Some(stored) = &stored {
            for r in &stored.bracket.rounds {
                let mut matchups = Vec::with_capacity(r.matchups.len());
                for m in &r.matchups {
                    let id = stored
                        .matchup_id(m.key)
                        .ok_or_else(|| corruption(format!("matchup {:?} has no row", m.key)))?;
                    let votes = counts.get(&id).unwrap_or(&empty);
                    matchups.push(MatchupView {
                        id,
                        position: m.key.position,
                        status: m.status,
                        songs: [slot(m.slots[0], votes), slot(m.slots[1], votes)],
                        leader: tally::winner(m, votes),
                        resolved: m.winner.is_some(),
                    });
                }
                rounds.push(RoundView {
                    number: r.number,
                    name: r.name.clone(),
                    status: r.status,
                    starts_at: r.starts_at,
                    ends_at: r.ends_at,
                    matchups,
                });
            }
            if t.status == TournamentStatus::Completed {
                champion = stored
                    .bracket
                    .final_matchup()
                    .and_then(|m| slot(m.winner, &empty));
            }
        }

        Ok(BracketView {
            code: t.code,
            name: t.name,
            status: t.status,
            rounds,
            champion,
        })
    }

    /// The round currently open for voting, if any.
    pub fn current_round(&self, tournament_id: i64) -> Result<Option<RoundView>> {
        let view = self.bracket_view(tournament_id)?;
        Ok(view
            .status
            .current_round()
            .and_then(|n| view.rounds.into_iter().find(|r| r.number == n)))
    }
}

pub(crate) fn load_tournament(conn: &Connection, id: i64) -> Result<Tournament> {
    Database::get_tournament(conn, id)?
        .ok_or_else(|| EngineError::NotFound(format!("tournament {id}")))
}
