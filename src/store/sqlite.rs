//! SQLite-backed game and pick storage
//!
//! - WAL mode so the leaderboard can read while a game settles
//! - Settlement runs in `BEGIN IMMEDIATE` transactions, one per game
//! - User picks and anonymous picks live in separate tables

use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    CoveringSide, Game, GameStatus, GameUpdate, LeaderboardEntry, NewPick, Pick, PickOutcome,
    PickOwner, PickRef, Settlement,
};
use crate::store::{SettlementStore, SettlementTx};
use crate::utils::settlement_calculator::score_pick;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS games (
    id TEXT PRIMARY KEY,
    season INTEGER NOT NULL,
    week INTEGER NOT NULL,
    home_team TEXT NOT NULL,
    away_team TEXT NOT NULL,
    home_score INTEGER,
    away_score INTEGER,
    spread REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled',
    kickoff TEXT,
    covering_side TEXT,
    margin_bonus INTEGER,
    base_points INTEGER,
    settled_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_games_season_week ON games(season, week);

CREATE TABLE IF NOT EXISTS picks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    game_id TEXT NOT NULL REFERENCES games(id),
    selected_team TEXT NOT NULL,
    is_lock INTEGER NOT NULL DEFAULT 0,
    submitted INTEGER NOT NULL DEFAULT 1,
    result TEXT,
    points INTEGER
);

CREATE INDEX IF NOT EXISTS idx_picks_game ON picks(game_id);
CREATE INDEX IF NOT EXISTS idx_picks_user ON picks(user_id);

CREATE TABLE IF NOT EXISTS anonymous_picks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    submitter TEXT NOT NULL,
    user_id TEXT,
    game_id TEXT NOT NULL REFERENCES games(id),
    selected_team TEXT NOT NULL,
    is_lock INTEGER NOT NULL DEFAULT 0,
    submitted INTEGER NOT NULL DEFAULT 1,
    result TEXT,
    points INTEGER
);

CREATE INDEX IF NOT EXISTS idx_anonymous_picks_game ON anonymous_picks(game_id);
"#;

const GAME_COLUMNS: &str = "id, season, week, home_team, away_team, home_score, away_score, \
     spread, status, kickoff, covering_side, margin_bonus, base_points";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and apply the schema
    pub fn open(db_path: &str) -> SettlementResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("Pick'em database ready at {}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests
    pub fn in_memory() -> SettlementResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a game or refresh its schedule fields.
    /// Scores, status and settlement are left alone on an existing row, and
    /// once a game is completed its teams and spread are fixed.
    pub fn upsert_game(&self, game: &Game) -> SettlementResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = load_game(&tx, &game.id)? {
            let changes_settlement_input = existing.home_team != game.home_team
                || existing.away_team != game.away_team
                || existing.spread != game.spread;
            if existing.status == GameStatus::Completed && changes_settlement_input {
                return Err(SettlementError::InvalidInput(format!(
                    "game {} is completed, its teams and spread can no longer change",
                    game.id
                )));
            }
        }

        tx.execute(
            "INSERT INTO games (id, season, week, home_team, away_team, home_score, away_score,
                                spread, status, kickoff)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                season = excluded.season,
                week = excluded.week,
                home_team = excluded.home_team,
                away_team = excluded.away_team,
                spread = excluded.spread,
                kickoff = excluded.kickoff",
            params![
                game.id,
                game.season,
                game.week,
                game.home_team,
                game.away_team,
                game.home_score,
                game.away_score,
                game.spread,
                game.status.as_str(),
                game.kickoff.map(|k| k.to_rfc3339()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Store a submitted pick. The selected team must play in the game.
    /// A pick on an already settled game is scored as it goes in.
    pub fn insert_pick(&self, pick: &NewPick) -> SettlementResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let game = load_game(&tx, &pick.game_id)?
            .ok_or_else(|| SettlementError::GameNotFound(pick.game_id.clone()))?;

        if pick.selected_team != game.home_team && pick.selected_team != game.away_team {
            return Err(SettlementError::InvalidInput(format!(
                "{} does not play in game {} ({} vs {})",
                pick.selected_team, game.id, game.home_team, game.away_team
            )));
        }

        let outcome = game
            .settlement
            .map(|settlement| score_pick(&game, &settlement, &pick.selected_team, pick.is_lock));
        let result = outcome.map(|o| o.result.as_str());
        let points = outcome.map(|o| o.points);

        match &pick.owner {
            PickOwner::User { user_id } => {
                tx.execute(
                    "INSERT INTO picks (user_id, game_id, selected_team, is_lock, submitted, result, points)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        user_id,
                        pick.game_id,
                        pick.selected_team,
                        pick.is_lock,
                        pick.submitted,
                        result,
                        points
                    ],
                )?;
            }
            PickOwner::Anonymous { submitter, user_id } => {
                tx.execute(
                    "INSERT INTO anonymous_picks (submitter, user_id, game_id, selected_team, is_lock,
                                                  submitted, result, points)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        submitter,
                        user_id,
                        pick.game_id,
                        pick.selected_team,
                        pick.is_lock,
                        pick.submitted,
                        result,
                        points
                    ],
                )?;
            }
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;

        if let Some(outcome) = outcome {
            debug!(
                "Pick {} on settled game {} scored {:?}",
                id, pick.game_id, outcome
            );
        }
        Ok(id)
    }

    /// Record a score/status change from the score feed or an admin.
    ///
    /// Once completed, a game keeps its status and a missing score in the
    /// update leaves the recorded one in place. Settlement is not touched here.
    pub fn record_game_update(&self, update: &GameUpdate) -> SettlementResult<Game> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut game = load_game(&tx, &update.game_id)?
            .ok_or_else(|| SettlementError::GameNotFound(update.game_id.clone()))?;

        if game.status == GameStatus::Completed {
            if update.status != GameStatus::Completed {
                warn!(
                    "Ignoring status regression for completed game {}: {}",
                    game.id, update.status
                );
            }
            game.home_score = update.home_score.or(game.home_score);
            game.away_score = update.away_score.or(game.away_score);
        } else {
            game.status = update.status;
            game.home_score = update.home_score;
            game.away_score = update.away_score;
        }

        tx.execute(
            "UPDATE games SET home_score = ?1, away_score = ?2, status = ?3 WHERE id = ?4",
            params![game.home_score, game.away_score, game.status.as_str(), game.id],
        )?;
        tx.commit()?;

        debug!(
            "Recorded update for game {}: {:?}-{:?} ({})",
            game.id, game.home_score, game.away_score, game.status
        );
        Ok(game)
    }

    /// Credit an anonymous pick to a registered user
    pub fn attribute_anonymous_pick(&self, pick_id: i64, user_id: &str) -> SettlementResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE anonymous_picks SET user_id = ?1 WHERE id = ?2",
            params![user_id, pick_id],
        )?;
        if changed == 0 {
            return Err(SettlementError::InvalidInput(format!(
                "no anonymous pick with id {}",
                pick_id
            )));
        }
        info!("Attributed anonymous pick {} to user {}", pick_id, user_id);
        Ok(())
    }

    pub fn game(&self, game_id: &str) -> SettlementResult<Option<Game>> {
        let conn = self.conn.lock();
        load_game(&conn, game_id)
    }

    pub fn games_for_week(&self, season: i32, week: i32) -> SettlementResult<Vec<Game>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM games WHERE season = ?1 AND week = ?2 ORDER BY kickoff, id",
            GAME_COLUMNS
        ))?;
        let games = stmt
            .query_map(params![season, week], game_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(games)
    }

    pub fn picks_for_game(&self, game_id: &str) -> SettlementResult<Vec<Pick>> {
        let conn = self.conn.lock();
        load_picks(&conn, game_id)
    }

    /// Standings for a season, or a single week of it.
    /// Anonymous picks count once they are attributed to a user.
    pub fn leaderboard(&self, season: i32, week: Option<i32>) -> SettlementResult<Vec<LeaderboardEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id,
                    COALESCE(SUM(points), 0),
                    COALESCE(SUM(result = 'win'), 0),
                    COALESCE(SUM(result = 'loss'), 0),
                    COALESCE(SUM(result = 'push'), 0)
             FROM (
                SELECT p.user_id, p.points, p.result
                FROM picks p JOIN games g ON g.id = p.game_id
                WHERE g.season = ?1 AND (?2 IS NULL OR g.week = ?2) AND p.result IS NOT NULL
                UNION ALL
                SELECT a.user_id, a.points, a.result
                FROM anonymous_picks a JOIN games g ON g.id = a.game_id
                WHERE a.user_id IS NOT NULL AND g.season = ?1 AND (?2 IS NULL OR g.week = ?2)
                  AND a.result IS NOT NULL
             )
             GROUP BY user_id
             ORDER BY 2 DESC, user_id ASC",
        )?;
        let entries = stmt
            .query_map(params![season, week], |row| {
                Ok(LeaderboardEntry {
                    user_id: row.get(0)?,
                    points: row.get(1)?,
                    wins: row.get(2)?,
                    losses: row.get(3)?,
                    pushes: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> SettlementResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl SettlementStore for SqliteStore {
    fn in_transaction<T, F>(&self, f: F) -> SettlementResult<T>
    where
        F: FnOnce(&mut dyn SettlementTx) -> SettlementResult<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let value = {
            let mut handle = SqliteTx { conn: &tx };
            f(&mut handle)?
        };

        tx.commit()?;
        Ok(value)
    }
}

/// Transaction handle; dropping the owning transaction without commit rolls back
struct SqliteTx<'c> {
    conn: &'c Connection,
}

impl SettlementTx for SqliteTx<'_> {
    fn game(&mut self, game_id: &str) -> SettlementResult<Option<Game>> {
        load_game(self.conn, game_id)
    }

    fn picks_for_game(&mut self, game_id: &str) -> SettlementResult<Vec<Pick>> {
        load_picks(self.conn, game_id)
    }

    fn write_settlement(&mut self, game_id: &str, settlement: &Settlement) -> SettlementResult<()> {
        self.conn.execute(
            "UPDATE games SET covering_side = ?1, margin_bonus = ?2, base_points = ?3, settled_at = ?4
             WHERE id = ?5",
            params![
                settlement.covering_side.as_str(),
                settlement.margin_bonus,
                settlement.base_points,
                Utc::now().to_rfc3339(),
                game_id
            ],
        )?;
        Ok(())
    }

    fn write_pick_outcome(&mut self, pick: PickRef, outcome: &PickOutcome) -> SettlementResult<()> {
        let (sql, id) = match pick {
            PickRef::User(id) => ("UPDATE picks SET result = ?1, points = ?2 WHERE id = ?3", id),
            PickRef::Anonymous(id) => (
                "UPDATE anonymous_picks SET result = ?1, points = ?2 WHERE id = ?3",
                id,
            ),
        };
        self.conn
            .execute(sql, params![outcome.result.as_str(), outcome.points, id])?;
        Ok(())
    }
}

fn load_game(conn: &Connection, game_id: &str) -> SettlementResult<Option<Game>> {
    let game = conn
        .query_row(
            &format!("SELECT {} FROM games WHERE id = ?1", GAME_COLUMNS),
            params![game_id],
            game_from_row,
        )
        .optional()?;
    Ok(game)
}

fn load_picks(conn: &Connection, game_id: &str) -> SettlementResult<Vec<Pick>> {
    let mut picks = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT id, user_id, game_id, selected_team, is_lock, submitted, result, points
         FROM picks WHERE game_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![game_id], |row| {
        let owner = PickOwner::User {
            user_id: row.get(1)?,
        };
        pick_from_row(row, owner, 2)
    })?;
    for pick in rows {
        picks.push(pick?);
    }

    let mut stmt = conn.prepare(
        "SELECT id, submitter, user_id, game_id, selected_team, is_lock, submitted, result, points
         FROM anonymous_picks WHERE game_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![game_id], |row| {
        let owner = PickOwner::Anonymous {
            submitter: row.get(1)?,
            user_id: row.get(2)?,
        };
        pick_from_row(row, owner, 3)
    })?;
    for pick in rows {
        picks.push(pick?);
    }

    Ok(picks)
}

/// Columns from `first` on: game_id, selected_team, is_lock, submitted, result, points
fn pick_from_row(row: &Row<'_>, owner: PickOwner, first: usize) -> rusqlite::Result<Pick> {
    let result: Option<String> = row.get(first + 4)?;
    let points: Option<u32> = row.get(first + 5)?;
    let outcome = match (result, points) {
        (Some(result), Some(points)) => Some(PickOutcome {
            result: parse_column(first + 4, &result)?,
            points,
        }),
        _ => None,
    };

    Ok(Pick {
        id: row.get(0)?,
        game_id: row.get(first)?,
        owner,
        selected_team: row.get(first + 1)?,
        is_lock: row.get(first + 2)?,
        submitted: row.get(first + 3)?,
        outcome,
    })
}

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<Game> {
    let status: String = row.get(8)?;
    let kickoff: Option<String> = row.get(9)?;
    let covering_side: Option<String> = row.get(10)?;
    let margin_bonus: Option<u32> = row.get(11)?;
    let base_points: Option<u32> = row.get(12)?;

    let kickoff = kickoff
        .map(|k| {
            DateTime::parse_from_rfc3339(&k)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))
        })
        .transpose()?;

    let settlement = match (covering_side, margin_bonus, base_points) {
        (Some(side), Some(margin_bonus), Some(base_points)) => Some(Settlement {
            covering_side: parse_column::<CoveringSide>(10, &side)?,
            margin_bonus,
            base_points,
        }),
        _ => None,
    };

    Ok(Game {
        id: row.get(0)?,
        season: row.get(1)?,
        week: row.get(2)?,
        home_team: row.get(3)?,
        away_team: row.get(4)?,
        home_score: row.get(5)?,
        away_score: row.get(6)?,
        spread: row.get(7)?,
        status: parse_column::<GameStatus>(8, &status)?,
        kickoff,
        settlement,
    })
}

fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}
