use crate::models::{Game, GameStatus, GameUpdate};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const BASE_URL: &str = "https://api.collegefootballdata.com";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GameResult {
    pub id: i32,
    pub season: i32,
    pub week: i32,
    pub start_date: DateTime<Utc>,
    pub completed: bool,
    pub neutral_site: bool,
    pub home_team: String,
    pub home_points: Option<i32>,
    pub away_team: String,
    pub away_points: Option<i32>,
}

impl GameResult {
    pub fn game_id(&self) -> String {
        self.id.to_string()
    }

    /// Status as far as the feed can tell. It has no live flag, so a
    /// started game with points on the board counts as in progress.
    pub fn status(&self) -> GameStatus {
        if self.completed {
            GameStatus::Completed
        } else if self.home_points.is_some() || self.away_points.is_some() {
            GameStatus::InProgress
        } else {
            GameStatus::Scheduled
        }
    }

    pub fn to_update(&self) -> GameUpdate {
        GameUpdate {
            game_id: self.game_id(),
            home_score: self.home_points.and_then(|p| u32::try_from(p).ok()),
            away_score: self.away_points.and_then(|p| u32::try_from(p).ok()),
            status: self.status(),
        }
    }

    /// Schedule row for this game with the given home-relative spread
    pub fn to_game(&self, spread: f64) -> Game {
        Game {
            id: self.game_id(),
            season: self.season,
            week: self.week,
            home_team: self.home_team.clone(),
            away_team: self.away_team.clone(),
            home_score: None,
            away_score: None,
            spread,
            status: GameStatus::Scheduled,
            kickoff: Some(self.start_date),
            settlement: None,
        }
    }
}

/// Betting lines published for one game
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GameLines {
    pub id: i32,
    pub home_team: String,
    pub away_team: String,
    pub lines: Vec<Line>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    pub provider: String,
    pub spread: Option<f64>, // Home-relative, negative means home favored
}

impl GameLines {
    /// Spread from the preferred provider, falling back to the first one quoted
    pub fn spread(&self, preferred_provider: &str) -> Option<f64> {
        self.lines
            .iter()
            .find(|l| l.provider.eq_ignore_ascii_case(preferred_provider) && l.spread.is_some())
            .or_else(|| self.lines.iter().find(|l| l.spread.is_some()))
            .and_then(|l| l.spread)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InfoResult {
    pub patron_level: u32,
    pub remaining_calls: u32,
}

pub struct GameResultsApiClient {
    client: Client,
    api_key: String,
}

impl GameResultsApiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    pub async fn fetch_cfb_game_results(&self, year: i32, week: i32) -> Result<Vec<GameResult>> {
        let url = format!("{}/games?year={}&week={}", BASE_URL, year, week);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .context("Failed to fetch game results")?;

        if !response.status().is_success() {
            anyhow::bail!("Game results API returned error: {}", response.status());
        }

        let results: Vec<GameResult> = response
            .json()
            .await
            .context("Failed to parse game results")?;
        debug!("Fetched {} game results for {} week {}", results.len(), year, week);
        Ok(results)
    }

    pub async fn fetch_lines(&self, year: i32, week: i32) -> Result<Vec<GameLines>> {
        let url = format!("{}/lines?year={}&week={}", BASE_URL, year, week);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .context("Failed to fetch betting lines")?;

        if !response.status().is_success() {
            anyhow::bail!("Lines API returned error: {}", response.status());
        }

        let lines: Vec<GameLines> = response
            .json()
            .await
            .context("Failed to parse betting lines")?;
        Ok(lines)
    }

    /// Check API usage/rate limits for College Football Data API
    pub async fn check_usage(&self) -> Result<u32> {
        let url = format!("{}/info", BASE_URL);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let result: InfoResult = response.json().await?;
        Ok(result.remaining_calls)
    }
}
