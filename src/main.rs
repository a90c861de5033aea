use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use songbracket::bracket::tally::TieBreak;
use songbracket::clock::SystemClock;
use songbracket::db::models::{BracketView, NewSong, NewTournament, SongSlotView};
use songbracket::engine::{Engine, EngineSettings};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "songbracket", version, about = "Single-elimination song tournaments")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TieBreakArg {
    HigherSeed,
    EarlierSubmission,
}

impl From<TieBreakArg> for TieBreak {
    fn from(arg: TieBreakArg) -> Self {
        match arg {
            TieBreakArg::HigherSeed => TieBreak::HigherSeed,
            TieBreakArg::EarlierSubmission => TieBreak::EarlierSubmission,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a tournament open for song submissions
    Create {
        name: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Registration deadline (RFC 3339, e.g. 2026-11-01T18:00:00Z)
        #[arg(long, value_parser = parse_timestamp)]
        deadline: Option<DateTime<Utc>>,

        /// Songs each user may submit (defaults to config)
        #[arg(long)]
        max_submissions: Option<u32>,

        /// Id of the creating user
        #[arg(long, default_value = "1")]
        user: i64,
    },

    /// List tournaments, newest first
    List,

    /// Submit a song to a tournament
    Submit {
        /// Tournament code
        code: String,
        title: String,
        artist: String,

        /// Popularity score used for seeding
        #[arg(short, long)]
        popularity: Option<i64>,

        #[arg(long)]
        album: Option<String>,

        #[arg(long)]
        url: Option<String>,

        /// Id of the submitting user
        #[arg(long)]
        user: i64,
    },

    /// Sign up for a tournament without submitting a song
    Register {
        code: String,

        /// Id of the registering user
        #[arg(long)]
        user: i64,

        /// Name shown in the participant list
        #[arg(long)]
        name: Option<String>,
    },

    /// List a tournament's participants
    Roster { code: String },

    /// List one user's submissions to a tournament
    Submissions {
        code: String,

        #[arg(long)]
        user: i64,
    },

    /// Compute seeds without building the bracket
    Seed { code: String },

    /// Close registration and build the bracket
    Build { code: String },

    /// Vote for a song in a matchup
    Vote {
        /// Matchup id (see `show`)
        matchup: i64,
        /// Song id
        song: i64,

        /// Id of the voting user
        #[arg(long)]
        user: i64,
    },

    /// Close a round and advance its winners
    Advance {
        code: String,

        /// Round number (defaults to the current round)
        #[arg(short, long)]
        round: Option<u32>,

        /// Override the configured tie-break policy
        #[arg(long, value_enum)]
        tie_break: Option<TieBreakArg>,
    },

    /// Close every round whose deadline has passed
    Tick,

    /// Push a round's deadline back
    Extend {
        code: String,
        round: u32,
        hours: i64,
    },

    /// Show a tournament's bracket
    Show {
        code: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {s:?}: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = songbracket::config::AppConfig::load();

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(songbracket::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = songbracket::db::Database::open_with_timeout(&db_path, config.busy_timeout())
        .context("Failed to open database")?;
    let mut settings = EngineSettings::from(&config);
    if let Commands::Advance {
        tie_break: Some(tb),
        ..
    } = &cli.command
    {
        settings.tie_break = (*tb).into();
    }
    let engine = Engine::new(db, SystemClock, settings);

    match cli.command {
        Commands::Create {
            name,
            description,
            deadline,
            max_submissions,
            user,
        } => {
            let t = engine
                .create_tournament(&NewTournament {
                    name,
                    description,
                    registration_deadline: deadline,
                    max_submissions_per_user: max_submissions
                        .unwrap_or(config.max_submissions_per_user),
                    created_by: user,
                })
                .context("Failed to create tournament")?;
            println!("Created {} \"{}\"", t.formatted_code(), t.name);
        }

        Commands::List => {
            let tournaments = engine.list_tournaments().context("Query failed")?;
            if tournaments.is_empty() {
                println!("No tournaments yet.");
                return Ok(());
            }
            println!("{:<6} {:<30} {:<18} {:>10}", "Code", "Name", "Status", "Created");
            println!("{}", "-".repeat(67));
            for t in tournaments {
                println!(
                    "{:<6} {:<30} {:<18} {:>10}",
                    t.formatted_code(),
                    truncate(&t.name, 30),
                    t.status.to_string(),
                    t.created_at.format("%Y-%m-%d")
                );
            }
        }

        Commands::Submit {
            code,
            title,
            artist,
            popularity,
            album,
            url,
            user,
        } => {
            let t = engine.find_tournament(&code)?;
            let song_id = engine
                .submit_song(
                    t.id,
                    &NewSong {
                        title,
                        artist,
                        album,
                        popularity,
                        duration_secs: None,
                        url,
                        submitted_by: user,
                    },
                )
                .context("Submission rejected")?;
            let left = engine.remaining_submissions(t.id, user)?;
            println!("Submitted song {song_id} to {} ({left} submissions left)", t.formatted_code());
        }

        Commands::Register { code, user, name } => {
            let t = engine.find_tournament(&code)?;
            let reg = engine
                .register_user(t.id, user, name.as_deref())
                .context("Registration rejected")?;
            println!("{} is registered for {}", reg.label(), t.formatted_code());
        }

        Commands::Roster { code } => {
            let t = engine.find_tournament(&code)?;
            let count = engine.registration_count(t.id)?;
            println!("{} \"{}\": {count} registered", t.formatted_code(), t.name);
            println!("{}", engine.registered_user_names(t.id)?);
        }

        Commands::Submissions { code, user } => {
            let t = engine.find_tournament(&code)?;
            let songs = engine.user_submissions(t.id, user)?;
            if songs.is_empty() {
                println!("No submissions from user {user} in {}.", t.formatted_code());
                return Ok(());
            }
            println!("{:>5}  {:<30} {:<25} {:>4}", "Id", "Title", "Artist", "Seed");
            println!("{}", "-".repeat(67));
            for s in &songs {
                println!(
                    "{:>5}  {:<30} {:<25} {:>4}",
                    s.id,
                    truncate(&s.title, 30),
                    truncate(&s.artist, 25),
                    s.seed.map(|n| n.to_string()).unwrap_or_default()
                );
            }
            let left = engine.remaining_submissions(t.id, user)?;
            println!("{left} submissions left");
        }

        Commands::Seed { code } => {
            let t = engine.find_tournament(&code)?;
            let seeds = engine.seed_songs(t.id).context("Seeding failed")?;
            let songs = songbracket::db::Database::get_songs(&engine.db().conn, t.id)?;
            println!("{:>4}  {:<30} {:<25}", "Seed", "Title", "Artist");
            println!("{}", "-".repeat(61));
            for s in &seeds {
                if let Some(song) = songs.iter().find(|song| song.id == s.song_id) {
                    println!(
                        "{:>4}  {:<30} {:<25}",
                        s.seed,
                        truncate(&song.title, 30),
                        truncate(&song.artist, 25)
                    );
                }
            }
        }

        Commands::Build { code } => {
            let t = engine.find_tournament(&code)?;
            let report = engine.build_bracket(t.id).context("Bracket build failed")?;
            println!(
                "Bracket built: {} rounds, {} matchups ({} in round 1), {} byes",
                report.total_rounds, report.total_matchups, report.round1_matchups, report.num_byes
            );
        }

        Commands::Vote {
            matchup,
            song,
            user,
        } => {
            let receipt = engine
                .cast_vote(user, matchup, song)
                .context("Vote rejected")?;
            if receipt.changed {
                println!("Vote changed to song {song}");
            } else {
                println!("Vote recorded for song {song}");
            }
        }

        Commands::Advance { code, round, .. } => {
            let t = engine.find_tournament(&code)?;
            let round = match round.or(t.status.current_round()) {
                Some(r) => r,
                None => anyhow::bail!("{} has no round open for voting", t.formatted_code()),
            };
            let report = engine
                .advance_round(t.id, round)
                .context("Advance failed")?;
            println!(
                "Round {round} closed: {} winners advanced ({} by tie-break)",
                report.winners_advanced, report.tie_breaks
            );
            match (report.champion, report.next_round_name) {
                (Some(song), _) => println!("Tournament complete. Champion: song {song}"),
                (None, Some(name)) => println!("{name} is now open for voting"),
                (None, None) => {}
            }
        }

        Commands::Tick => {
            let tick = engine
                .close_expired_rounds()
                .context("Closing expired rounds failed")?;
            if tick.closed.is_empty() && tick.failed.is_empty() {
                println!("No rounds past their deadline.");
            }
            for r in &tick.closed {
                println!(
                    "Tournament {}: round {} closed, {} winners advanced{}",
                    r.tournament_id,
                    r.round,
                    r.winners_advanced,
                    if r.tournament_completed { " (completed)" } else { "" }
                );
            }
            for f in &tick.failed {
                eprintln!(
                    "Tournament {}: round {} could not be closed: {}",
                    f.tournament_id, f.round, f.error
                );
            }
            if !tick.failed.is_empty() {
                anyhow::bail!("{} expired rounds could not be closed", tick.failed.len());
            }
        }

        Commands::Extend { code, round, hours } => {
            let t = engine.find_tournament(&code)?;
            engine
                .extend_round(t.id, round, hours)
                .context("Extension failed")?;
            println!("Round {round} of {} extended by {hours}h", t.formatted_code());
        }

        Commands::Show { code, json } => {
            let t = engine.find_tournament(&code)?;
            let view = engine.bracket_view(t.id).context("Query failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_bracket(&view);
            }
        }
    }

    Ok(())
}

/// Print every round with its matchups and live counts.
fn print_bracket(view: &BracketView) {
    println!("#{} {} [{}]", view.code, view.name, view.status);
    if view.rounds.is_empty() {
        println!("Bracket not built yet.");
        return;
    }

    for round in &view.rounds {
        println!();
        let deadline = round
            .ends_at
            .map(|e| format!(", ends {}", e.format("%Y-%m-%d %H:%M UTC")))
            .unwrap_or_default();
        println!("{} (round {}, {}{})", round.name, round.number, round.status, deadline);
        println!("{}", "-".repeat(72));
        for m in &round.matchups {
            let marker = |slot: &Option<SongSlotView>| match (slot, m.leader) {
                (Some(s), Some(leader)) if s.song_id == leader => {
                    if m.resolved { "W" } else { ">" }
                }
                _ => " ",
            };
            println!(
                "{:>5}  {} {:<28} vs  {} {:<28}",
                m.id,
                marker(&m.songs[0]),
                slot_label(&m.songs[0]),
                marker(&m.songs[1]),
                slot_label(&m.songs[1]),
            );
        }
    }

    if let Some(champion) = &view.champion {
        println!();
        println!("Champion: {} - {}", champion.title, champion.artist);
    }
}

fn slot_label(slot: &Option<SongSlotView>) -> String {
    match slot {
        Some(s) => {
            let seed = s.seed.map(|n| format!("({n}) ")).unwrap_or_default();
            format!("{seed}{} [{}]", truncate(&s.title, 16), s.votes)
        }
        None => "TBD".to_string(),
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}
