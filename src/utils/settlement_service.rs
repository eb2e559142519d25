use crate::error::{SettlementError, SettlementResult};
use crate::store::SettlementStore;
use crate::utils::settlement_applier::{SettlementApplier, SettlementReport};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::warn;

/// Async front for the applier.
/// Each settle runs on the blocking pool so SQLite work stays off the runtime threads.
pub struct SettlementService<S> {
    applier: Arc<SettlementApplier<S>>,
}

impl<S> Clone for SettlementService<S> {
    fn clone(&self) -> Self {
        Self {
            applier: self.applier.clone(),
        }
    }
}

impl<S: SettlementStore + 'static> SettlementService<S> {
    pub fn new(applier: SettlementApplier<S>) -> Self {
        Self {
            applier: Arc::new(applier),
        }
    }

    pub fn applier(&self) -> &SettlementApplier<S> {
        &self.applier
    }

    pub async fn settle(&self, game_id: &str) -> SettlementResult<SettlementReport> {
        let applier = self.applier.clone();
        let game_id = game_id.to_string();
        tokio::task::spawn_blocking(move || applier.settle_game_with_retry(&game_id))
            .await
            .map_err(|e| SettlementError::PersistenceFailure(format!("settlement task failed: {}", e)))?
    }

    /// Run other store work (reads, score updates) on the blocking pool
    pub async fn with_store<T, F>(&self, f: F) -> SettlementResult<T>
    where
        F: FnOnce(&S) -> SettlementResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let applier = self.applier.clone();
        tokio::task::spawn_blocking(move || f(applier.store()))
            .await
            .map_err(|e| SettlementError::PersistenceFailure(format!("store task failed: {}", e)))?
    }

    /// Settle several games in parallel.
    /// One game failing never stops the others; results come back in input order.
    pub async fn settle_many(
        &self,
        game_ids: &[String],
    ) -> Vec<(String, SettlementResult<SettlementReport>)> {
        let mut tasks = JoinSet::new();
        for (idx, game_id) in game_ids.iter().enumerate() {
            let applier = self.applier.clone();
            let game_id = game_id.clone();
            tasks.spawn_blocking(move || {
                let result = applier.settle_game_with_retry(&game_id);
                (idx, game_id, result)
            });
        }

        let mut results = Vec::with_capacity(game_ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!("Settlement task panicked: {}", e),
            }
        }

        results.sort_by_key(|(idx, _, _)| *idx);
        results
            .into_iter()
            .map(|(_, game_id, result)| (game_id, result))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Game, GameStatus, GameUpdate, NewPick, PickOwner};
    use crate::store::SqliteStore;
    use crate::utils::settlement_applier::SettlementOutcome;

    fn store_with_games(ids: &[&str]) -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        for id in ids {
            store
                .upsert_game(&Game {
                    id: id.to_string(),
                    season: 2024,
                    week: 3,
                    home_team: format!("{} Home", id),
                    away_team: format!("{} Away", id),
                    home_score: None,
                    away_score: None,
                    spread: -7.0,
                    status: GameStatus::Scheduled,
                    kickoff: None,
                    settlement: None,
                })
                .unwrap();
            store
                .insert_pick(&NewPick {
                    game_id: id.to_string(),
                    owner: PickOwner::User {
                        user_id: "u1".to_string(),
                    },
                    selected_team: format!("{} Home", id),
                    is_lock: false,
                    submitted: true,
                })
                .unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_settle_many_keeps_going_past_failures() {
        let store = store_with_games(&["a", "b", "c"]);
        for id in ["a", "c"] {
            store
                .record_game_update(&GameUpdate {
                    game_id: id.to_string(),
                    home_score: Some(30),
                    away_score: Some(10),
                    status: GameStatus::Completed,
                })
                .unwrap();
        }
        let service = SettlementService::new(SettlementApplier::new(store.clone()));

        let ids: Vec<String> = ["a", "b", "missing", "c"].iter().map(|s| s.to_string()).collect();
        let results = service.settle_many(&ids).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].0, "a");
        assert_eq!(
            results[0].1.as_ref().unwrap().outcome,
            SettlementOutcome::Applied
        );
        assert!(matches!(
            results[1].1.as_ref().unwrap().outcome,
            SettlementOutcome::Skipped { .. }
        ));
        assert!(matches!(
            results[2].1,
            Err(SettlementError::GameNotFound(_))
        ));
        assert_eq!(
            results[3].1.as_ref().unwrap().outcome,
            SettlementOutcome::Applied
        );

        // 30-10 at -7 covers by 13: tier 1
        let picks = store.picks_for_game("c").unwrap();
        assert_eq!(picks[0].outcome.unwrap().points, 21);
    }

    #[tokio::test]
    async fn test_settle_same_game_concurrently() {
        let store = store_with_games(&["a"]);
        store
            .record_game_update(&GameUpdate {
                game_id: "a".to_string(),
                home_score: Some(30),
                away_score: Some(10),
                status: GameStatus::Completed,
            })
            .unwrap();
        let service = SettlementService::new(SettlementApplier::new(store));

        let (first, second) = tokio::join!(service.settle("a"), service.settle("a"));
        let outcomes = [first.unwrap().outcome, second.unwrap().outcome];
        assert!(outcomes.contains(&SettlementOutcome::Applied));
        assert!(outcomes.contains(&SettlementOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_with_store_runs_store_calls() {
        let store = store_with_games(&["a"]);
        let service = SettlementService::new(SettlementApplier::new(store));

        let game = service
            .with_store(|store| store.game("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(game.home_team, "a Home");

        let err = service
            .with_store(|store| {
                store.record_game_update(&GameUpdate {
                    game_id: "missing".to_string(),
                    home_score: Some(1),
                    away_score: Some(0),
                    status: GameStatus::Completed,
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::GameNotFound(_)));
    }
}
