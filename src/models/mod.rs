use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Points every winning pick earns before any margin bonus
pub const BASE_POINTS: u32 = 20;

/// Flat points for a pick on a game that pushed against the spread
pub const PUSH_POINTS: u32 = 10;

/// Lifecycle of a game as reported by the score feed or an admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::InProgress => "in_progress",
            GameStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(GameStatus::Scheduled),
            "in_progress" => Ok(GameStatus::InProgress),
            "completed" => Ok(GameStatus::Completed),
            other => Err(format!("unknown game status: {}", other)),
        }
    }
}

/// Which side covered the spread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoveringSide {
    Home,
    Away,
    Push,
}

impl CoveringSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoveringSide::Home => "home",
            CoveringSide::Away => "away",
            CoveringSide::Push => "push",
        }
    }
}

impl FromStr for CoveringSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home" => Ok(CoveringSide::Home),
            "away" => Ok(CoveringSide::Away),
            "push" => Ok(CoveringSide::Push),
            other => Err(format!("unknown covering side: {}", other)),
        }
    }
}

/// Against-the-spread outcome of a finished game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub covering_side: CoveringSide,
    pub margin_bonus: u32, // 0, 1, 3 or 5
    pub base_points: u32,
}

impl Settlement {
    pub fn push() -> Self {
        Self {
            covering_side: CoveringSide::Push,
            margin_bonus: 0,
            base_points: BASE_POINTS,
        }
    }
}

/// Both final scores of a completed game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalScore {
    pub home: u32,
    pub away: u32,
}

/// A game row as it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub season: i32,
    pub week: i32,
    pub home_team: String,
    pub away_team: String,
    pub home_score: Option<u32>,
    pub away_score: Option<u32>,
    pub spread: f64, // Home-relative, negative means home favored
    pub status: GameStatus,
    #[serde(default)]
    pub kickoff: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settlement: Option<Settlement>,
}

impl Game {
    /// Final score, only for a completed game with both scores recorded
    pub fn final_score(&self) -> Option<FinalScore> {
        match (self.status, self.home_score, self.away_score) {
            (GameStatus::Completed, Some(home), Some(away)) => Some(FinalScore { home, away }),
            _ => None,
        }
    }

    /// Team name of the covering side, None for a push
    pub fn covering_team(&self, side: CoveringSide) -> Option<&str> {
        match side {
            CoveringSide::Home => Some(&self.home_team),
            CoveringSide::Away => Some(&self.away_team),
            CoveringSide::Push => None,
        }
    }
}

/// A game that is completed with both scores, the only shape settlement accepts
#[derive(Debug, Clone, PartialEq)]
pub struct SettleableGame<'a> {
    pub game: &'a Game,
    pub score: FinalScore,
}

impl<'a> SettleableGame<'a> {
    pub fn new(game: &'a Game) -> Option<Self> {
        game.final_score().map(|score| Self { game, score })
    }
}

/// Score/status change supplied by the score feed or an admin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameUpdate {
    pub game_id: String,
    pub home_score: Option<u32>,
    pub away_score: Option<u32>,
    pub status: GameStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickResult {
    Win,
    Loss,
    Push,
}

impl PickResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickResult::Win => "win",
            PickResult::Loss => "loss",
            PickResult::Push => "push",
        }
    }
}

impl FromStr for PickResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win" => Ok(PickResult::Win),
            "loss" => Ok(PickResult::Loss),
            "push" => Ok(PickResult::Push),
            other => Err(format!("unknown pick result: {}", other)),
        }
    }
}

/// Result and points of a settled pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickOutcome {
    pub result: PickResult,
    pub points: u32,
}

/// Who owns a pick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PickOwner {
    User { user_id: String },
    Anonymous {
        submitter: String,
        user_id: Option<String>,
    },
}

impl PickOwner {
    /// User the pick counts for on the leaderboard, if any
    pub fn user_id(&self) -> Option<&str> {
        match self {
            PickOwner::User { user_id } => Some(user_id),
            PickOwner::Anonymous { user_id, .. } => user_id.as_deref(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, PickOwner::Anonymous { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    pub id: i64,
    pub game_id: String,
    pub owner: PickOwner,
    pub selected_team: String,
    pub is_lock: bool,
    #[serde(default = "default_submitted")]
    pub submitted: bool,
    #[serde(default)]
    pub outcome: Option<PickOutcome>,
}

fn default_submitted() -> bool {
    true
}

/// Identifies a pick row; user and anonymous picks live in separate tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickRef {
    User(i64),
    Anonymous(i64),
}

impl Pick {
    pub fn pick_ref(&self) -> PickRef {
        if self.owner.is_anonymous() {
            PickRef::Anonymous(self.id)
        } else {
            PickRef::User(self.id)
        }
    }
}

/// A pick as submitted, before the store assigns an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPick {
    pub game_id: String,
    pub owner: PickOwner,
    pub selected_team: String,
    #[serde(default)]
    pub is_lock: bool,
    #[serde(default = "default_submitted")]
    pub submitted: bool,
}

/// One row of the standings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: String,
    pub points: u32,
    pub wins: u32,
    pub losses: u32,
    pub pushes: u32,
}
