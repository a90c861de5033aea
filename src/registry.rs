//! Tournament creation, participant sign-up and song submission.

use log::{debug, info};
use rand::Rng;
use rusqlite::Connection;

use crate::bracket::{SongId, UserId};
use crate::clock::Clock;
use crate::db::Database;
use crate::db::models::{NewSong, NewTournament, Registration, Song, Tournament};
use crate::engine::{Engine, EngineError, Result, load_tournament};

/// Characters used in tournament codes. No 0/O or 1/I.
pub const CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const CODE_LENGTH: usize = 4;
const MAX_CODE_ATTEMPTS: usize = 100;

pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Accepts codes as users type them: `#k7qx`, ` K7QX `.
pub fn normalize_code(input: &str) -> String {
    input.trim().trim_start_matches('#').to_ascii_uppercase()
}

fn unique_code<R: Rng + ?Sized>(conn: &Connection, rng: &mut R) -> Result<String> {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = generate_code(rng);
        if !Database::tournament_code_exists(conn, &code)? {
            return Ok(code);
        }
    }
    Err(EngineError::CodeSpaceExhausted)
}

impl<C: Clock> Engine<C> {
    pub fn create_tournament(&self, new: &NewTournament) -> Result<Tournament> {
        self.write("create tournament", |tx, now| {
            let code = unique_code(tx, &mut rand::rng())?;
            let id = Database::insert_tournament(tx, &code, new, now)?;
            info!("Created tournament #{code} \"{}\"", new.name);
            load_tournament(tx, id)
        })
    }

    pub fn find_tournament(&self, code: &str) -> Result<Tournament> {
        let code = normalize_code(code);
        Database::get_tournament_by_code(&self.db().conn, &code)?
            .ok_or_else(|| EngineError::NotFound(format!("tournament #{code}")))
    }

    /// Add a song to a tournament that is still taking submissions.
    pub fn submit_song(&self, tournament_id: i64, song: &NewSong) -> Result<SongId> {
        self.write("submit song", |tx, now| {
            let t = load_tournament(tx, tournament_id)?;
            if !t.is_registration_open(now) {
                return Err(EngineError::RegistrationClosed);
            }
            let submitted = Database::count_user_songs(tx, t.id, song.submitted_by)?;
            if submitted >= t.max_submissions_per_user {
                return Err(EngineError::SubmissionLimitReached {
                    limit: t.max_submissions_per_user,
                });
            }
            if Database::song_exists(tx, t.id, song.submitted_by, &song.title, &song.artist)? {
                return Err(EngineError::DuplicateSong {
                    title: song.title.clone(),
                    artist: song.artist.clone(),
                });
            }
            let id = Database::insert_song(tx, t.id, song, now)?;
            if Database::register(tx, t.id, song.submitted_by, None, now)? {
                debug!("User {} joined {}", song.submitted_by, t.formatted_code());
            }
            info!(
                "User {} submitted \"{}\" by {} to {}",
                song.submitted_by,
                song.title,
                song.artist,
                t.formatted_code()
            );
            Ok(id)
        })
    }

    /// Sign `user` up while registration is open. Signing up twice is
    /// harmless; a new display name replaces the old one.
    pub fn register_user(
        &self,
        tournament_id: i64,
        user: UserId,
        display_name: Option<&str>,
    ) -> Result<Registration> {
        self.write("register user", |tx, now| {
            let t = load_tournament(tx, tournament_id)?;
            if !t.is_registration_open(now) {
                return Err(EngineError::RegistrationClosed);
            }
            if Database::register(tx, t.id, user, display_name, now)? {
                info!("User {user} registered for {}", t.formatted_code());
            }
            Database::get_registration(tx, t.id, user)?
                .ok_or_else(|| EngineError::NotFound(format!("registration of user {user}")))
        })
    }

    /// Participants in sign-up order.
    pub fn registered_users(&self, tournament_id: i64) -> Result<Vec<Registration>> {
        let conn = &self.db().conn;
        let t = load_tournament(conn, tournament_id)?;
        Ok(Database::get_registrations(conn, t.id)?)
    }

    /// Comma-separated participant names.
    pub fn registered_user_names(&self, tournament_id: i64) -> Result<String> {
        let users = self.registered_users(tournament_id)?;
        if users.is_empty() {
            return Ok("No registrants yet".to_string());
        }
        Ok(users
            .iter()
            .map(Registration::label)
            .collect::<Vec<_>>()
            .join(", "))
    }

    pub fn registration_count(&self, tournament_id: i64) -> Result<u32> {
        let conn = &self.db().conn;
        let t = load_tournament(conn, tournament_id)?;
        Ok(Database::count_registrations(conn, t.id)?)
    }

    /// Songs `user` submitted to a tournament, oldest first.
    pub fn user_submissions(&self, tournament_id: i64, user: UserId) -> Result<Vec<Song>> {
        let conn = &self.db().conn;
        let t = load_tournament(conn, tournament_id)?;
        Ok(Database::get_user_songs(conn, t.id, user)?)
    }

    pub fn remaining_submissions(&self, tournament_id: i64, user: UserId) -> Result<u32> {
        let conn = &self.db().conn;
        let t = load_tournament(conn, tournament_id)?;
        let submitted = Database::count_user_songs(conn, t.id, user)?;
        Ok(t.max_submissions_per_user.saturating_sub(submitted))
    }
}
