//! Ranks a tournament's entries into seeds 1..=N.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BracketError, Result, SongId};

/// Which end of the popularity scale produces the best seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedOrder {
    /// Highest popularity is seed 1.
    #[default]
    PopularityDesc,
    /// Lowest popularity is seed 1.
    PopularityAsc,
}

/// A registered song as seen by the seeding engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrant {
    pub song_id: SongId,
    pub popularity: Option<i64>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeededSong {
    pub song_id: SongId,
    pub seed: u32,
}

/// Order entrants best-first and number them 1..=N.
///
/// Songs without a popularity score always rank after scored ones. Ties
/// fall back to earlier submission, then lower song id, so the result is a
/// strict total order and re-running over the same input gives the same seeds.
pub fn seed_entrants(entrants: &[Entrant], order: SeedOrder) -> Result<Vec<SeededSong>> {
    if entrants.len() < 2 {
        return Err(BracketError::InsufficientEntrants {
            found: entrants.len(),
        });
    }

    let mut ranked: Vec<&Entrant> = entrants.iter().collect();
    ranked.sort_by(|a, b| {
        compare_popularity(a.popularity, b.popularity, order)
            .then(a.submitted_at.cmp(&b.submitted_at))
            .then(a.song_id.cmp(&b.song_id))
    });

    Ok(ranked
        .into_iter()
        .zip(1u32..)
        .map(|(e, seed)| SeededSong {
            song_id: e.song_id,
            seed,
        })
        .collect())
}

fn compare_popularity(a: Option<i64>, b: Option<i64>, order: SeedOrder) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match order {
            SeedOrder::PopularityDesc => b.cmp(&a),
            SeedOrder::PopularityAsc => a.cmp(&b),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
