use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::{
    ExpiredRound, NewSong, NewTournament, Registration, Song, StoredBracket, Tournament,
};
use super::{Database, DbError, Result};
use crate::bracket::{
    Bracket, Matchup, MatchupKey, Round, SongId, TournamentStatus, UserId,
    seeding::{Entrant, SeededSong},
    tally::{SongFacts, VoteCounts},
};

const TOURNAMENT_COLUMNS: &str = "id, code, name, description, status, version,
     registration_deadline, max_submissions_per_user, created_by, created_at";

const SONG_COLUMNS: &str = "id, tournament_id, title, artist, album, popularity,
     duration_secs, url, submitted_by, submitted_at, seed";

fn tournament_from_row(row: &Row<'_>) -> rusqlite::Result<Tournament> {
    Ok(Tournament {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        version: row.get(5)?,
        registration_deadline: row.get(6)?,
        max_submissions_per_user: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const REGISTRATION_COLUMNS: &str =
    "id, tournament_id, user_id, display_name, registered_at";

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<Registration> {
    Ok(Registration {
        id: row.get(0)?,
        tournament_id: row.get(1)?,
        user_id: row.get(2)?,
        display_name: row.get(3)?,
        registered_at: row.get(4)?,
    })
}

fn song_from_row(row: &Row<'_>) -> rusqlite::Result<Song> {
    Ok(Song {
        id: row.get(0)?,
        tournament_id: row.get(1)?,
        title: row.get(2)?,
        artist: row.get(3)?,
        album: row.get(4)?,
        popularity: row.get(5)?,
        duration_secs: row.get(6)?,
        url: row.get(7)?,
        submitted_by: row.get(8)?,
        submitted_at: row.get(9)?,
        seed: row.get(10)?,
    })
}

impl Database {
    // Tournaments

    pub fn insert_tournament(
        conn: &Connection,
        code: &str,
        t: &NewTournament,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO tournaments (
                code, name, description, status, version,
                registration_deadline, max_submissions_per_user, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8)",
            params![
                code,
                t.name,
                t.description,
                TournamentStatus::Registration,
                t.registration_deadline,
                t.max_submissions_per_user,
                t.created_by,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn tournament_code_exists(conn: &Connection, code: &str) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tournaments WHERE code = ?1)",
            params![code],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_tournament(conn: &Connection, id: i64) -> Result<Option<Tournament>> {
        let sql = format!("SELECT {TOURNAMENT_COLUMNS} FROM tournaments WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id], tournament_from_row)
            .optional()?)
    }

    pub fn get_tournament_by_code(conn: &Connection, code: &str) -> Result<Option<Tournament>> {
        let sql = format!("SELECT {TOURNAMENT_COLUMNS} FROM tournaments WHERE code = ?1");
        Ok(conn
            .query_row(&sql, params![code], tournament_from_row)
            .optional()?)
    }

    /// All tournaments, newest first.
    pub fn list_tournaments(&self) -> Result<Vec<Tournament>> {
        let sql = format!(
            "SELECT {TOURNAMENT_COLUMNS} FROM tournaments ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let tournaments = stmt
            .query_map([], tournament_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tournaments)
    }

    /// Compare-and-swap the tournament status. Returns false if another
    /// writer changed the tournament since `expected_version` was read.
    pub fn set_tournament_status(
        conn: &Connection,
        id: i64,
        expected_version: i64,
        status: TournamentStatus,
    ) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE tournaments SET status = ?3, version = version + 1
             WHERE id = ?1 AND version = ?2",
            params![id, expected_version, status],
        )?;
        Ok(updated == 1)
    }

    // Registrations

    /// Sign `user` up for a tournament. Signing up again keeps the original
    /// registration time and only fills in a display name if one is given.
    /// Returns true when the user was not registered before.
    pub fn register(
        conn: &Connection,
        tournament_id: i64,
        user: UserId,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT INTO registrations (tournament_id, user_id, display_name, registered_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tournament_id, user_id) DO NOTHING",
            params![tournament_id, user, display_name, now],
        )?;
        if inserted == 0 && display_name.is_some() {
            conn.execute(
                "UPDATE registrations SET display_name = ?3
                 WHERE tournament_id = ?1 AND user_id = ?2",
                params![tournament_id, user, display_name],
            )?;
        }
        Ok(inserted == 1)
    }

    pub fn get_registration(
        conn: &Connection,
        tournament_id: i64,
        user: UserId,
    ) -> Result<Option<Registration>> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations
             WHERE tournament_id = ?1 AND user_id = ?2"
        );
        Ok(conn
            .query_row(&sql, params![tournament_id, user], registration_from_row)
            .optional()?)
    }

    /// Participants of a tournament in sign-up order.
    pub fn get_registrations(conn: &Connection, tournament_id: i64) -> Result<Vec<Registration>> {
        let sql = format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE tournament_id = ?1
             ORDER BY registered_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let registrations = stmt
            .query_map(params![tournament_id], registration_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(registrations)
    }

    pub fn count_registrations(conn: &Connection, tournament_id: i64) -> Result<u32> {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM registrations WHERE tournament_id = ?1",
            params![tournament_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // Songs

    pub fn insert_song(
        conn: &Connection,
        tournament_id: i64,
        s: &NewSong,
        now: DateTime<Utc>,
    ) -> Result<SongId> {
        conn.execute(
            "INSERT INTO songs (
                tournament_id, title, artist, album, popularity,
                duration_secs, url, submitted_by, submitted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tournament_id,
                s.title,
                s.artist,
                s.album,
                s.popularity,
                s.duration_secs,
                s.url,
                s.submitted_by,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn song_exists(
        conn: &Connection,
        tournament_id: i64,
        submitted_by: UserId,
        title: &str,
        artist: &str,
    ) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM songs
                WHERE tournament_id = ?1 AND submitted_by = ?2 AND title = ?3 AND artist = ?4
            )",
            params![tournament_id, submitted_by, title, artist],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn count_user_songs(conn: &Connection, tournament_id: i64, user: UserId) -> Result<u32> {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM songs WHERE tournament_id = ?1 AND submitted_by = ?2",
            params![tournament_id, user],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Songs of a tournament, seeded ones first in seed order.
    pub fn get_songs(conn: &Connection, tournament_id: i64) -> Result<Vec<Song>> {
        let sql = format!(
            "SELECT {SONG_COLUMNS} FROM songs WHERE tournament_id = ?1
             ORDER BY seed IS NULL, seed, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let songs = stmt
            .query_map(params![tournament_id], song_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(songs)
    }

    /// One user's submissions to a tournament, oldest first.
    pub fn get_user_songs(
        conn: &Connection,
        tournament_id: i64,
        user: UserId,
    ) -> Result<Vec<Song>> {
        let sql = format!(
            "SELECT {SONG_COLUMNS} FROM songs WHERE tournament_id = ?1 AND submitted_by = ?2
             ORDER BY submitted_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let songs = stmt
            .query_map(params![tournament_id, user], song_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(songs)
    }

    pub fn get_entrants(conn: &Connection, tournament_id: i64) -> Result<Vec<Entrant>> {
        let mut stmt = conn.prepare(
            "SELECT id, popularity, submitted_at FROM songs WHERE tournament_id = ?1 ORDER BY id",
        )?;
        let entrants = stmt
            .query_map(params![tournament_id], |row| {
                Ok(Entrant {
                    song_id: row.get(0)?,
                    popularity: row.get(1)?,
                    submitted_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entrants)
    }

    pub fn set_seeds(conn: &Connection, seeds: &[SeededSong]) -> Result<()> {
        let mut stmt = conn.prepare_cached("UPDATE songs SET seed = ?2 WHERE id = ?1")?;
        for s in seeds {
            stmt.execute(params![s.song_id, s.seed])?;
        }
        Ok(())
    }

    /// Seed and submission time of every seeded song, for tie-breaks.
    pub fn song_facts(conn: &Connection, tournament_id: i64) -> Result<HashMap<SongId, SongFacts>> {
        let mut stmt = conn.prepare(
            "SELECT id, seed, submitted_at FROM songs
             WHERE tournament_id = ?1 AND seed IS NOT NULL",
        )?;
        let facts = stmt
            .query_map(params![tournament_id], |row| {
                Ok((
                    row.get::<_, SongId>(0)?,
                    SongFacts {
                        seed: row.get(1)?,
                        submitted_at: row.get(2)?,
                    },
                ))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(facts)
    }

    // Bracket

    /// Insert every round and matchup of a freshly built bracket.
    ///
    /// Matchups are written from the final backwards so each forward link
    /// can reference a row that already exists.
    pub fn insert_bracket(
        conn: &Connection,
        tournament_id: i64,
        bracket: &Bracket,
    ) -> Result<StoredBracket> {
        let mut round_ids = Vec::with_capacity(bracket.rounds.len());
        {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO rounds (tournament_id, round_number, name, status, starts_at, ends_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in &bracket.rounds {
                stmt.execute(params![
                    tournament_id,
                    r.number,
                    r.name,
                    r.status,
                    r.starts_at,
                    r.ends_at
                ])?;
                round_ids.push(conn.last_insert_rowid());
            }
        }

        let mut matchup_ids: HashMap<MatchupKey, i64> = HashMap::new();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO matchups (
                tournament_id, round_id, position, song1_id, song2_id,
                winner_song_id, next_matchup_id, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for (r, round_id) in bracket.rounds.iter().zip(&round_ids).rev() {
            for m in &r.matchups {
                let next_id = match m.next {
                    Some(key) => Some(*matchup_ids.get(&key).ok_or_else(|| {
                        DbError::Integrity(format!("matchup {:?} links to unsaved {key:?}", m.key))
                    })?),
                    None => None,
                };
                stmt.execute(params![
                    tournament_id,
                    round_id,
                    m.key.position,
                    m.slots[0],
                    m.slots[1],
                    m.winner,
                    next_id,
                    m.status,
                ])?;
                matchup_ids.insert(m.key, conn.last_insert_rowid());
            }
        }

        let keys_by_id = matchup_ids.iter().map(|(key, id)| (*id, *key)).collect();
        Ok(StoredBracket {
            tournament_id,
            bracket: bracket.clone(),
            round_ids,
            matchup_ids,
            keys_by_id,
        })
    }

    /// Load a tournament's bracket. `None` when it has not been built yet.
    pub fn load_bracket(conn: &Connection, tournament_id: i64) -> Result<Option<StoredBracket>> {
        let mut stmt = conn.prepare(
            "SELECT id, round_number, name, status, starts_at, ends_at
             FROM rounds WHERE tournament_id = ?1 ORDER BY round_number",
        )?;
        let rows = stmt
            .query_map(params![tournament_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Round {
                        number: row.get(1)?,
                        name: row.get(2)?,
                        status: row.get(3)?,
                        starts_at: row.get(4)?,
                        ends_at: row.get(5)?,
                        matchups: Vec::new(),
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Ok(None);
        }
        let (round_ids, mut rounds): (Vec<i64>, Vec<Round>) = rows.into_iter().unzip();

        struct Raw {
            id: i64,
            matchup: Matchup,
            next_id: Option<i64>,
        }

        let mut stmt = conn.prepare(
            "SELECT m.id, r.round_number, m.position, m.song1_id, m.song2_id,
                    m.winner_song_id, m.status, m.next_matchup_id
             FROM matchups m
             JOIN rounds r ON r.id = m.round_id
             WHERE m.tournament_id = ?1
             ORDER BY r.round_number, m.position",
        )?;
        let raw = stmt
            .query_map(params![tournament_id], |row| {
                Ok(Raw {
                    id: row.get(0)?,
                    matchup: Matchup {
                        key: MatchupKey::new(row.get(1)?, row.get(2)?),
                        slots: [row.get(3)?, row.get(4)?],
                        winner: row.get(5)?,
                        status: row.get(6)?,
                        next: None,
                    },
                    next_id: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let matchup_ids: HashMap<MatchupKey, i64> =
            raw.iter().map(|r| (r.matchup.key, r.id)).collect();
        let keys_by_id: HashMap<i64, MatchupKey> =
            raw.iter().map(|r| (r.id, r.matchup.key)).collect();

        for Raw {
            id,
            mut matchup,
            next_id,
        } in raw
        {
            if let Some(next_id) = next_id {
                let next = keys_by_id.get(&next_id).ok_or_else(|| {
                    DbError::Integrity(format!(
                        "matchup {id} links to matchup {next_id} of another tournament"
                    ))
                })?;
                matchup.next = Some(*next);
            }
            let round = rounds
                .iter_mut()
                .find(|r| r.number == matchup.key.round)
                .ok_or_else(|| DbError::Integrity(format!("matchup {id} has no round")))?;
            round.matchups.push(matchup);
        }

        Ok(Some(StoredBracket {
            tournament_id,
            bracket: Bracket { rounds },
            round_ids,
            matchup_ids,
            keys_by_id,
        }))
    }

    /// Write back round schedules and statuses, and matchup slots, winners
    /// and statuses.
    pub fn save_bracket(conn: &Connection, stored: &StoredBracket) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "UPDATE rounds SET status = ?2, starts_at = ?3, ends_at = ?4 WHERE id = ?1",
        )?;
        for (r, id) in stored.bracket.rounds.iter().zip(&stored.round_ids) {
            stmt.execute(params![id, r.status, r.starts_at, r.ends_at])?;
        }

        let mut stmt = conn.prepare_cached(
            "UPDATE matchups SET song1_id = ?2, song2_id = ?3, winner_song_id = ?4, status = ?5
             WHERE id = ?1",
        )?;
        for r in &stored.bracket.rounds {
            for m in &r.matchups {
                let id = stored.matchup_id(m.key).ok_or_else(|| {
                    DbError::Integrity(format!("matchup {:?} has no stored row", m.key))
                })?;
                stmt.execute(params![id, m.slots[0], m.slots[1], m.winner, m.status])?;
            }
        }
        Ok(())
    }

    /// Compare-and-swap a round from active to completed.
    pub fn complete_round(conn: &Connection, round_id: i64, ended_at: DateTime<Utc>) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE rounds SET status = 'completed', ends_at = ?2
             WHERE id = ?1 AND status = 'active'",
            params![round_id, ended_at],
        )?;
        Ok(updated == 1)
    }

    /// Active rounds whose deadline is at or before `now`, oldest deadline first.
    pub fn expired_rounds(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<ExpiredRound>> {
        let mut stmt = conn.prepare(
            "SELECT tournament_id, round_number, ends_at FROM rounds
             WHERE status = 'active' AND ends_at IS NOT NULL",
        )?;
        let mut rounds = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, DateTime<Utc>>(2)?,
                    ExpiredRound {
                        tournament_id: row.get(0)?,
                        round_number: row.get(1)?,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rounds.retain(|(ends_at, _)| *ends_at <= now);
        rounds.sort_by_key(|(ends_at, r)| (*ends_at, r.tournament_id));
        Ok(rounds.into_iter().map(|(_, r)| r).collect())
    }

    pub fn matchup_tournament(conn: &Connection, matchup_id: i64) -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT tournament_id FROM matchups WHERE id = ?1",
                params![matchup_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    // Votes

    pub fn get_vote(conn: &Connection, user: UserId, matchup_id: i64) -> Result<Option<SongId>> {
        Ok(conn
            .query_row(
                "SELECT song_id FROM votes WHERE user_id = ?1 AND matchup_id = ?2",
                params![user, matchup_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Insert a vote, or overwrite the user's existing vote on this matchup.
    pub fn upsert_vote(
        conn: &Connection,
        user: UserId,
        matchup_id: i64,
        song: SongId,
        changed: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO votes (user_id, matchup_id, song_id, voted_at, updated_at, changed)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5)
             ON CONFLICT(user_id, matchup_id) DO UPDATE SET
                song_id = excluded.song_id,
                updated_at = excluded.updated_at,
                changed = changed OR excluded.changed",
            params![user, matchup_id, song, now, changed],
        )?;
        Ok(())
    }

    /// Vote counts for every matchup of a tournament, keyed by matchup row id.
    pub fn vote_counts(conn: &Connection, tournament_id: i64) -> Result<HashMap<i64, VoteCounts>> {
        let mut stmt = conn.prepare(
            "SELECT v.matchup_id, v.song_id, COUNT(*)
             FROM votes v
             JOIN matchups m ON m.id = v.matchup_id
             WHERE m.tournament_id = ?1
             GROUP BY v.matchup_id, v.song_id",
        )?;
        let mut counts: HashMap<i64, VoteCounts> = HashMap::new();
        let rows = stmt.query_map(params![tournament_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, SongId>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;
        for row in rows {
            let (matchup_id, song, votes) = row?;
            counts.entry(matchup_id).or_default().set(song, votes);
        }
        Ok(counts)
    }
}
