use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use super::{BracketError, Result};

/// Which phase a tournament is in. The current voting round lives inside the
/// `Voting` variant, so there is no separate field that could disagree with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TournamentStatus {
    Registration,
    Voting { round: u32 },
    Completed,
}

impl TournamentStatus {
    pub fn current_round(&self) -> Option<u32> {
        match self {
            Self::Voting { round } => Some(*round),
            Self::Registration | Self::Completed => None,
        }
    }

    pub fn is_voting(&self) -> bool {
        matches!(self, Self::Voting { .. })
    }

    /// Registration → voting in round 1. Only the bracket builder calls this.
    pub(crate) fn open_voting(self) -> Result<Self> {
        match self {
            Self::Registration => Ok(Self::Voting { round: 1 }),
            Self::Voting { .. } | Self::Completed => Err(BracketError::BracketAlreadyBuilt),
        }
    }

    /// Voting in `completed` → voting in `next`, or completed when there is
    /// no next round. Only the round advancer calls this.
    pub(crate) fn close_round(self, completed: u32, next: Option<u32>) -> Result<Self> {
        match self {
            Self::Voting { round } if round == completed => Ok(match next {
                Some(round) => Self::Voting { round },
                None => Self::Completed,
            }),
            _ => Err(BracketError::RoundNotActive { round: completed }),
        }
    }
}

impl fmt::Display for TournamentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration => f.write_str("registration"),
            Self::Voting { round } => write!(f, "voting_round_{round}"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for TournamentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "registration" => Ok(Self::Registration),
            "completed" => Ok(Self::Completed),
            _ => s
                .strip_prefix("voting_round_")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|&round| round > 0)
                .map(|round| Self::Voting { round })
                .ok_or_else(|| ParseStatusError(s.to_string())),
        }
    }
}

/// Lifecycle shared by rounds and matchups.
macro_rules! lifecycle_status {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            Pending,
            Active,
            Completed,
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    Self::Pending => "pending",
                    Self::Active => "active",
                    Self::Completed => "completed",
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    "pending" => Ok(Self::Pending),
                    "active" => Ok(Self::Active),
                    "completed" => Ok(Self::Completed),
                    _ => Err(ParseStatusError(s.to_string())),
                }
            }
        }
    };
}

lifecycle_status!(RoundStatus);
lifecycle_status!(MatchupStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_storage_encoding() {
        for status in [
            TournamentStatus::Registration,
            TournamentStatus::Voting { round: 1 },
            TournamentStatus::Voting { round: 12 },
            TournamentStatus::Completed,
        ] {
            assert_eq!(status.to_string().parse::<TournamentStatus>(), Ok(status));
        }
        assert_eq!(TournamentStatus::Voting { round: 3 }.to_string(), "voting_round_3");
    }

    #[test]
    fn test_malformed_status_is_rejected() {
        assert!("voting".parse::<TournamentStatus>().is_err());
        assert!("voting_round_".parse::<TournamentStatus>().is_err());
        assert!("voting_round_0".parse::<TournamentStatus>().is_err());
        assert!("voting_round_x".parse::<TournamentStatus>().is_err());
        assert!("Completed".parse::<RoundStatus>().is_err());
    }

    #[test]
    fn test_open_voting_only_from_registration() {
        assert_eq!(
            TournamentStatus::Registration.open_voting(),
            Ok(TournamentStatus::Voting { round: 1 })
        );
        assert_eq!(
            TournamentStatus::Voting { round: 2 }.open_voting(),
            Err(BracketError::BracketAlreadyBuilt)
        );
        assert_eq!(
            TournamentStatus::Completed.open_voting(),
            Err(BracketError::BracketAlreadyBuilt)
        );
    }

    #[test]
    fn test_close_round_transitions() {
        let voting = TournamentStatus::Voting { round: 2 };
        assert_eq!(voting.close_round(2, Some(3)), Ok(TournamentStatus::Voting { round: 3 }));
        assert_eq!(voting.close_round(2, None), Ok(TournamentStatus::Completed));
        assert_eq!(
            voting.close_round(1, Some(2)),
            Err(BracketError::RoundNotActive { round: 1 })
        );
        assert_eq!(
            TournamentStatus::Completed.close_round(3, None),
            Err(BracketError::RoundNotActive { round: 3 })
        );
        assert_eq!(voting.current_round(), Some(2));
        assert_eq!(TournamentStatus::Registration.current_round(), None);
    }
}
