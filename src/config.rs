use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::bracket::seeding::SeedOrder;
use crate::bracket::tally::TieBreak;

/// Longest voting round the config accepts: one leap year.
pub const MAX_ROUND_DURATION_HOURS: i64 = 24 * 366;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults and the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Which end of the popularity scale gets seed 1.
    pub seed_order: SeedOrder,
    /// How a matchup tied at round close is decided.
    pub tie_break: TieBreak,
    /// Planned length of each voting round. Unset means rounds have no
    /// deadline and only close when advanced by hand.
    pub round_duration_hours: Option<i64>,
    /// Default per-user submission limit for new tournaments.
    pub max_submissions_per_user: u32,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            seed_order: SeedOrder::default(),
            tie_break: TieBreak::default(),
            round_duration_hours: None,
            max_submissions_per_user: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/songbracket/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from an explicit path, falling back to defaults on error.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config.sanitized()
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Drop values that parse but make no sense.
    fn sanitized(mut self) -> Self {
        if let Some(hours) = self.round_duration_hours {
            if !(1..=MAX_ROUND_DURATION_HOURS).contains(&hours) {
                log::warn!(
                    "Ignoring round_duration_hours = {hours}: must be between 1 and {MAX_ROUND_DURATION_HOURS}"
                );
                self.round_duration_hours = None;
            }
        }
        if self.max_submissions_per_user == 0 {
            log::warn!("Ignoring max_submissions_per_user = 0, using 4");
            self.max_submissions_per_user = 4;
        }
        self
    }

    pub fn round_duration(&self) -> Option<chrono::Duration> {
        self.round_duration_hours.and_then(chrono::Duration::try_hours)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("songbracket.db")
    } else {
        // Fallback: current directory
        PathBuf::from("songbracket.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.seed_order, SeedOrder::PopularityDesc);
        assert_eq!(config.tie_break, TieBreak::HigherSeed);
        assert_eq!(config.max_submissions_per_user, 4);
        assert!(config.round_duration().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            db_path = "/tmp/bracket.db"
            seed_order = "popularity_asc"
            tie_break = "earlier_submission"
            round_duration_hours = 48
            busy_timeout_ms = 250
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/bracket.db")));
        assert_eq!(config.seed_order, SeedOrder::PopularityAsc);
        assert_eq!(config.tie_break, TieBreak::EarlierSubmission);
        assert_eq!(config.round_duration(), Some(chrono::Duration::hours(48)));
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "round_duration_hours = -3\nmax_submissions_per_user = 0\n").unwrap();
        let config = AppConfig::load_from(&path);
        assert_eq!(config.round_duration_hours, None);
        assert_eq!(config.max_submissions_per_user, 4);

        std::fs::write(&path, "round_duration_hours = 1000000000000\n").unwrap();
        let config = AppConfig::load_from(&path);
        assert_eq!(config.round_duration_hours, None);
        assert!(config.round_duration().is_none());

        std::fs::write(&path, "tie_break = \"coin_flip\"\n").unwrap();
        assert_eq!(AppConfig::load_from(&path).tie_break, TieBreak::HigherSeed);
    }
}
