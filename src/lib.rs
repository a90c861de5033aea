pub mod bracket;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod registry;

/// Application name for XDG paths
pub const APP_NAME: &str = "songbracket";
