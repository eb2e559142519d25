pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod utils;

pub use api::*;
pub use error::*;
pub use models::*;
pub use store::*;
pub use utils::*;

use anyhow::{Context, Result};
use api::game_results_api::{GameLines, GameResult, GameResultsApiClient};
use std::collections::HashMap;
use tracing::{info, warn};
use utils::settlement_applier::SettlementReport;
use utils::settlement_service::SettlementService;

/// Sportsbook whose spread is used when a new game is imported from the feed
pub const DEFAULT_LINE_PROVIDER: &str = "ESPN Bet";

/// What one score sync did
#[derive(Debug)]
pub struct SyncSummary {
    pub games_imported: usize,
    pub updates_recorded: usize,
    /// Games whose import or update could not be stored; the rest of the sync went on
    pub failures: Vec<(String, SettlementError)>,
    pub settlements: Vec<(String, SettlementResult<SettlementReport>)>,
}

/// Fetch one week of results and lines, record them, then settle every completed game.
/// All network calls finish before any game is settled.
pub async fn sync_week(
    client: &GameResultsApiClient,
    service: &SettlementService<SqliteStore>,
    season: i32,
    week: i32,
) -> Result<SyncSummary> {
    let results = client
        .fetch_cfb_game_results(season, week)
        .await
        .context("Failed to fetch CFB game results")?;
    let lines = client
        .fetch_lines(season, week)
        .await
        .context("Failed to fetch CFB lines")?;

    apply_week_results(service, &results, &lines, DEFAULT_LINE_PROVIDER).await
}

#[derive(Default)]
struct RecordedWeek {
    games_imported: usize,
    updates_recorded: usize,
    completed: Vec<String>,
    failures: Vec<(String, SettlementError)>,
}

/// Import a game if it is new, then record its latest score and status.
/// Returns whether the game was imported and its state after the update.
fn record_result(
    store: &SqliteStore,
    result: &GameResult,
    spreads: &HashMap<i32, f64>,
) -> SettlementResult<Option<(bool, Game)>> {
    let game_id = result.game_id();
    let mut imported = false;
    if store.game(&game_id)?.is_none() {
        // Spreads are fixed once a game is on the slate, so only new games take the feed's line
        let Some(spread) = spreads.get(&result.id) else {
            warn!(
                "No spread for {} @ {} ({}), not importing",
                result.away_team, result.home_team, game_id
            );
            return Ok(None);
        };
        store.upsert_game(&result.to_game(*spread))?;
        imported = true;
    }

    let game = store.record_game_update(&result.to_update())?;
    Ok(Some((imported, game)))
}

/// Record fetched results against the store and settle what is final.
/// A game that fails to store is logged and reported; the others are still recorded and settled.
pub async fn apply_week_results(
    service: &SettlementService<SqliteStore>,
    results: &[GameResult],
    lines: &[GameLines],
    line_provider: &str,
) -> Result<SyncSummary> {
    let spreads: HashMap<i32, f64> = lines
        .iter()
        .filter_map(|l| l.spread(line_provider).map(|s| (l.id, s)))
        .collect();
    let results = results.to_vec();

    let recorded = service
        .with_store(move |store| {
            let mut week = RecordedWeek::default();
            for result in &results {
                match record_result(store, result, &spreads) {
                    Ok(Some((imported, game))) => {
                        if imported {
                            week.games_imported += 1;
                        }
                        week.updates_recorded += 1;
                        if game.status == GameStatus::Completed {
                            week.completed.push(game.id);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Could not record result for game {}: {}", result.game_id(), e);
                        week.failures.push((result.game_id(), e));
                    }
                }
            }
            Ok(week)
        })
        .await
        .context("Score sync task failed")?;

    let settlements = service.settle_many(&recorded.completed).await;
    for (game_id, result) in &settlements {
        if let Err(e) = result {
            warn!("Game {} not settled this sync: {}", game_id, e);
        }
    }

    info!(
        "Sync recorded {} updates ({} failed), imported {} games, settled {} completed games",
        recorded.updates_recorded,
        recorded.failures.len(),
        recorded.games_imported,
        settlements.iter().filter(|(_, r)| r.is_ok()).count()
    );

    Ok(SyncSummary {
        games_imported: recorded.games_imported,
        updates_recorded: recorded.updates_recorded,
        failures: recorded.failures,
        settlements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::game_results_api::Line;
    use crate::utils::settlement_applier::{SettlementApplier, SettlementOutcome};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn result(id: i32, home: &str, away: &str, points: Option<(i32, i32)>, completed: bool) -> GameResult {
        GameResult {
            id,
            season: 2024,
            week: 1,
            start_date: Utc.with_ymd_and_hms(2024, 8, 31, 16, 0, 0).unwrap(),
            completed,
            neutral_site: false,
            home_team: home.to_string(),
            home_points: points.map(|p| p.0),
            away_team: away.to_string(),
            away_points: points.map(|p| p.1),
        }
    }

    fn lines(id: i32, spread: f64) -> GameLines {
        GameLines {
            id,
            home_team: String::new(),
            away_team: String::new(),
            lines: vec![Line {
                provider: DEFAULT_LINE_PROVIDER.to_string(),
                spread: Some(spread),
            }],
        }
    }

    #[tokio::test]
    async fn test_apply_week_results_imports_and_settles() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let service = SettlementService::new(SettlementApplier::new(store.clone()));

        let results = vec![
            result(1, "Georgia", "Clemson", Some((34, 3)), true),
            result(2, "Texas", "Michigan", Some((14, 7)), false),
            result(3, "Miami", "Florida", None, false),
        ];
        let week_lines = vec![lines(1, -13.5), lines(2, 3.0)];

        let summary = apply_week_results(&service, &results, &week_lines, DEFAULT_LINE_PROVIDER)
            .await
            .unwrap();
        assert_eq!(summary.games_imported, 2);
        assert_eq!(summary.updates_recorded, 2);
        assert_eq!(summary.settlements.len(), 1);
        assert_eq!(
            summary.settlements[0].1.as_ref().unwrap().outcome,
            SettlementOutcome::Applied
        );

        let game = store.game("1").unwrap().unwrap();
        assert_eq!(game.settlement.unwrap().covering_side, CoveringSide::Home);
        assert_eq!(store.game("2").unwrap().unwrap().status, GameStatus::InProgress);
        assert!(store.game("3").unwrap().is_none());

        // Same tick delivered again
        let summary = apply_week_results(&service, &results, &week_lines, DEFAULT_LINE_PROVIDER)
            .await
            .unwrap();
        assert_eq!(summary.games_imported, 0);
        assert_eq!(
            summary.settlements[0].1.as_ref().unwrap().outcome,
            SettlementOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_apply_week_results_continues_past_store_failure() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let service = SettlementService::new(SettlementApplier::new(store.clone()));
        let week_lines = vec![lines(1, -13.5), lines(2, 3.0), lines(3, -2.5)];

        let kickoff = vec![
            result(1, "Georgia", "Clemson", None, false),
            result(2, "Texas", "Michigan", None, false),
            result(3, "Miami", "Florida", None, false),
        ];
        apply_week_results(&service, &kickoff, &week_lines, DEFAULT_LINE_PROVIDER)
            .await
            .unwrap();

        // Score updates for game 2 start failing
        store
            .execute_batch(
                "CREATE TRIGGER fail_game_2 BEFORE UPDATE OF home_score ON games
                 WHEN NEW.id = '2'
                 BEGIN SELECT RAISE(ABORT, 'disk trouble'); END;",
            )
            .unwrap();

        let finals = vec![
            result(1, "Georgia", "Clemson", Some((34, 3)), true),
            result(2, "Texas", "Michigan", Some((31, 12)), true),
            result(3, "Miami", "Florida", Some((41, 17)), true),
        ];
        let summary = apply_week_results(&service, &finals, &week_lines, DEFAULT_LINE_PROVIDER)
            .await
            .unwrap();

        assert_eq!(summary.updates_recorded, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "2");
        let settled: Vec<&str> = summary.settlements.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(settled, vec!["1", "3"]);

        assert!(store.game("1").unwrap().unwrap().settlement.is_some());
        assert!(store.game("3").unwrap().unwrap().settlement.is_some());
        let game_2 = store.game("2").unwrap().unwrap();
        assert_eq!(game_2.status, GameStatus::Scheduled);
        assert!(game_2.settlement.is_none());
    }
}
