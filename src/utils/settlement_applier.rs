use crate::error::{SettlementError, SettlementResult};
use crate::models::{Game, GameStatus, SettleableGame, Settlement};
use crate::store::{SettlementStore, SettlementTx};
use crate::utils::settlement_calculator::{score_pick, settle_game_score};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// What a settle attempt did to storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Game or pick rows were rewritten
    Applied,
    /// Everything already matched the recomputed settlement
    Unchanged,
    /// Game is not completed with both scores
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub game_id: String,
    #[serde(flatten)]
    pub outcome: SettlementOutcome,
    pub settlement: Option<Settlement>,
    pub game_updated: bool,
    pub picks_updated: usize,
    pub picks_total: usize,
}

impl SettlementReport {
    fn skipped(game_id: String, reason: String) -> Self {
        Self {
            game_id,
            outcome: SettlementOutcome::Skipped { reason },
            settlement: None,
            game_updated: false,
            picks_updated: 0,
            picks_total: 0,
        }
    }
}

/// Per-game mutexes so two settle attempts for one game never interleave
#[derive(Default)]
pub struct GameLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GameLocks {
    fn lock_for(&self, game_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(game_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the entry once nobody else holds or waits on it
    fn release(&self, game_id: &str) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(game_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(game_id);
            }
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Applies a completed game's settlement to the game row and all of its picks
pub struct SettlementApplier<S> {
    store: Arc<S>,
    locks: GameLocks,
    max_attempts: u32,
}

impl<S: SettlementStore> SettlementApplier<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: GameLocks::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Settle one game.
    ///
    /// Safe to call any number of times: the settlement is recomputed from
    /// the current scores and only rows that differ are written, all inside
    /// one transaction. A game that is not completed with both scores is
    /// reported as skipped rather than failing.
    pub fn settle_game(&self, game_id: &str) -> SettlementResult<SettlementReport> {
        let lock = self.locks.lock_for(game_id);
        let result = {
            let _guard = lock.lock();
            self.store.in_transaction(|tx| apply_settlement(tx, game_id))
        };
        drop(lock);
        self.locks.release(game_id);

        match result {
            Ok(report) => {
                match report.outcome {
                    SettlementOutcome::Applied => info!(
                        "Settled game {}: {:?}, {} of {} picks updated",
                        game_id, report.settlement, report.picks_updated, report.picks_total
                    ),
                    _ => debug!("Game {} already settled, nothing to write", game_id),
                }
                Ok(report)
            }
            Err(SettlementError::PreconditionNotMet { game_id, reason }) => {
                debug!("Skipping game {}: {}", game_id, reason);
                Ok(SettlementReport::skipped(game_id, reason))
            }
            Err(e @ SettlementError::InvalidInput(_)) => {
                error!("Game {} has invalid settlement input: {}", game_id, e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Settle one game, rerunning the whole operation on retryable failures
    pub fn settle_game_with_retry(&self, game_id: &str) -> SettlementResult<SettlementReport> {
        let mut attempt = 1;
        loop {
            match self.settle_game(game_id) {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "Settlement of game {} failed (attempt {}/{}): {}",
                        game_id, attempt, self.max_attempts, e
                    );
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn apply_settlement(tx: &mut dyn SettlementTx, game_id: &str) -> SettlementResult<SettlementReport> {
    let game = tx
        .game(game_id)?
        .ok_or_else(|| SettlementError::GameNotFound(game_id.to_string()))?;

    let settleable = SettleableGame::new(&game).ok_or_else(|| SettlementError::PreconditionNotMet {
        game_id: game_id.to_string(),
        reason: unsettleable_reason(&game),
    })?;
    let settlement = settle_game_score(&settleable)?;

    let game_updated = game.settlement != Some(settlement);
    if game_updated {
        tx.write_settlement(game_id, &settlement)?;
    }

    let picks = tx.picks_for_game(game_id)?;
    let mut picks_updated = 0;
    for pick in &picks {
        if pick.selected_team != game.home_team && pick.selected_team != game.away_team {
            warn!(
                "Pick {} on game {} selected {}, which is not playing in it",
                pick.id, game_id, pick.selected_team
            );
        }

        let outcome = score_pick(&game, &settlement, &pick.selected_team, pick.is_lock);
        if pick.outcome != Some(outcome) {
            tx.write_pick_outcome(pick.pick_ref(), &outcome)?;
            picks_updated += 1;
        }
    }

    let outcome = if game_updated || picks_updated > 0 {
        SettlementOutcome::Applied
    } else {
        SettlementOutcome::Unchanged
    };

    Ok(SettlementReport {
        game_id: game_id.to_string(),
        outcome,
        settlement: Some(settlement),
        game_updated,
        picks_updated,
        picks_total: picks.len(),
    })
}

fn unsettleable_reason(game: &Game) -> String {
    match (game.home_score, game.away_score) {
        _ if game.status != GameStatus::Completed => {
            format!("status is {}", game.status)
        }
        (None, None) => "completed without scores".to_string(),
        (None, _) => "completed without a home score".to_string(),
        _ => "completed without an away score".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoveringSide, GameUpdate, NewPick, Pick, PickOutcome, PickOwner, PickResult};
    use crate::store::SqliteStore;
    use std::thread;

    fn setup(spread: f64) -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_game(&Game {
                id: "uga-clem".to_string(),
                season: 2024,
                week: 1,
                home_team: "Georgia".to_string(),
                away_team: "Clemson".to_string(),
                home_score: None,
                away_score: None,
                spread,
                status: GameStatus::Scheduled,
                kickoff: None,
                settlement: None,
            })
            .unwrap();

        let picks = [
            ("u1", "Georgia", false),
            ("u2", "Clemson", true),
            ("u3", "Georgia", true),
        ];
        for (user, team, is_lock) in picks {
            store
                .insert_pick(&NewPick {
                    game_id: "uga-clem".to_string(),
                    owner: PickOwner::User {
                        user_id: user.to_string(),
                    },
                    selected_team: team.to_string(),
                    is_lock,
                    submitted: true,
                })
                .unwrap();
        }
        store
            .insert_pick(&NewPick {
                game_id: "uga-clem".to_string(),
                owner: PickOwner::Anonymous {
                    submitter: "fan@example.com".to_string(),
                    user_id: None,
                },
                selected_team: "Georgia".to_string(),
                is_lock: false,
                submitted: true,
            })
            .unwrap();
        Arc::new(store)
    }

    fn finish(store: &SqliteStore, home: Option<u32>, away: Option<u32>) {
        store
            .record_game_update(&GameUpdate {
                game_id: "uga-clem".to_string(),
                home_score: home,
                away_score: away,
                status: GameStatus::Completed,
            })
            .unwrap();
    }

    fn outcomes(picks: &[Pick]) -> Vec<Option<PickOutcome>> {
        picks.iter().map(|p| p.outcome).collect()
    }

    #[test]
    fn test_settles_georgia_clemson() {
        let store = setup(-13.5);
        finish(&store, Some(34), Some(3));
        let applier = SettlementApplier::new(store.clone());

        let report = applier.settle_game("uga-clem").unwrap();
        assert_eq!(report.outcome, SettlementOutcome::Applied);
        assert!(report.game_updated);
        assert_eq!(report.picks_updated, 4);
        assert_eq!(report.picks_total, 4);

        let game = store.game("uga-clem").unwrap().unwrap();
        let settlement = game.settlement.unwrap();
        assert_eq!(settlement.covering_side, CoveringSide::Home);
        assert_eq!(settlement.margin_bonus, 1);

        let picks = store.picks_for_game("uga-clem").unwrap();
        let win = |points| {
            Some(PickOutcome {
                result: PickResult::Win,
                points,
            })
        };
        assert_eq!(
            outcomes(&picks),
            vec![
                win(21),
                Some(PickOutcome {
                    result: PickResult::Loss,
                    points: 0
                }),
                win(22),
                win(21),
            ]
        );
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let store = setup(-13.5);
        finish(&store, Some(34), Some(3));
        let applier = SettlementApplier::new(store.clone());

        applier.settle_game("uga-clem").unwrap();
        let game_before = store.game("uga-clem").unwrap();
        let picks_before = store.picks_for_game("uga-clem").unwrap();

        let report = applier.settle_game("uga-clem").unwrap();
        assert_eq!(report.outcome, SettlementOutcome::Unchanged);
        assert!(!report.game_updated);
        assert_eq!(report.picks_updated, 0);

        assert_eq!(store.game("uga-clem").unwrap(), game_before);
        assert_eq!(store.picks_for_game("uga-clem").unwrap(), picks_before);
    }

    #[test]
    fn test_completed_without_away_score_is_noop() {
        let store = setup(-13.5);
        finish(&store, Some(34), None);
        let applier = SettlementApplier::new(store.clone());
        let picks_before = store.picks_for_game("uga-clem").unwrap();

        let report = applier.settle_game("uga-clem").unwrap();
        assert!(matches!(report.outcome, SettlementOutcome::Skipped { .. }));
        assert!(report.settlement.is_none());

        assert!(store.game("uga-clem").unwrap().unwrap().settlement.is_none());
        assert_eq!(store.picks_for_game("uga-clem").unwrap(), picks_before);
    }

    #[test]
    fn test_in_progress_game_is_skipped() {
        let store = setup(-13.5);
        store
            .record_game_update(&GameUpdate {
                game_id: "uga-clem".to_string(),
                home_score: Some(21),
                away_score: Some(3),
                status: GameStatus::InProgress,
            })
            .unwrap();
        let applier = SettlementApplier::new(store.clone());

        let report = applier.settle_game("uga-clem").unwrap();
        assert_eq!(
            report.outcome,
            SettlementOutcome::Skipped {
                reason: "status is in_progress".to_string()
            }
        );
        assert!(store
            .picks_for_game("uga-clem")
            .unwrap()
            .iter()
            .all(|p| p.outcome.is_none()));
    }

    #[test]
    fn test_push_pays_ten_regardless_of_lock() {
        let store = setup(-3.0);
        finish(&store, Some(24), Some(21));
        let applier = SettlementApplier::new(store.clone());

        applier.settle_game("uga-clem").unwrap();
        let picks = store.picks_for_game("uga-clem").unwrap();
        for pick in picks {
            assert_eq!(
                pick.outcome,
                Some(PickOutcome {
                    result: PickResult::Push,
                    points: 10
                })
            );
        }
    }

    #[test]
    fn test_score_correction_resettles() {
        let store = setup(-13.5);
        finish(&store, Some(24), Some(3));
        let applier = SettlementApplier::new(store.clone());
        applier.settle_game("uga-clem").unwrap();

        // 24-3 at -13.5 covers by 7.5: no bonus
        let picks = store.picks_for_game("uga-clem").unwrap();
        assert_eq!(picks[0].outcome.unwrap().points, 20);

        finish(&store, Some(45), Some(3));
        let report = applier.settle_game("uga-clem").unwrap();
        assert_eq!(report.outcome, SettlementOutcome::Applied);
        assert!(report.game_updated);

        // 45-3 covers by 28.5: tier 3, Lock doubles it
        let picks = store.picks_for_game("uga-clem").unwrap();
        assert_eq!(picks[0].outcome.unwrap().points, 23);
        assert_eq!(picks[2].outcome.unwrap().points, 26);
        assert_eq!(picks[1].outcome.unwrap().points, 0);
    }

    #[test]
    fn test_failed_pick_write_leaves_nothing_settled() {
        let store = setup(-13.5);
        finish(&store, Some(34), Some(3));
        store
            .execute_batch(
                "CREATE TRIGGER fail_second_pick BEFORE UPDATE ON picks WHEN NEW.id = 2
                 BEGIN SELECT RAISE(ABORT, 'simulated write failure'); END;",
            )
            .unwrap();
        let applier = SettlementApplier::new(store.clone()).with_max_attempts(1);

        let err = applier.settle_game_with_retry("uga-clem").unwrap_err();
        assert!(matches!(err, SettlementError::PersistenceFailure(_)));
        assert!(store.game("uga-clem").unwrap().unwrap().settlement.is_none());
        assert!(store
            .picks_for_game("uga-clem")
            .unwrap()
            .iter()
            .all(|p| p.outcome.is_none()));

        // Whole operation retried once storage recovers
        store.execute_batch("DROP TRIGGER fail_second_pick;").unwrap();
        let report = applier.settle_game("uga-clem").unwrap();
        assert_eq!(report.picks_updated, 4);
        assert!(store
            .picks_for_game("uga-clem")
            .unwrap()
            .iter()
            .all(|p| p.outcome.is_some()));
    }

    #[test]
    fn test_concurrent_settles_apply_once() {
        let store = setup(-13.5);
        finish(&store, Some(34), Some(3));
        let applier = Arc::new(SettlementApplier::new(store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let applier = applier.clone();
                thread::spawn(move || applier.settle_game("uga-clem").unwrap())
            })
            .collect();
        let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let applied = reports
            .iter()
            .filter(|r| r.outcome == SettlementOutcome::Applied)
            .count();
        assert_eq!(applied, 1);
        assert_eq!(reports.iter().map(|r| r.picks_updated).sum::<usize>(), 4);
        assert!(applier.locks.is_empty());
    }

    #[test]
    fn test_unknown_game_is_an_error() {
        let store = setup(-13.5);
        let applier = SettlementApplier::new(store);
        let err = applier.settle_game_with_retry("nope").unwrap_err();
        assert!(matches!(err, SettlementError::GameNotFound(_)));
    }

    #[test]
    fn test_anonymous_pick_settles_before_attribution() {
        let store = setup(-13.5);
        finish(&store, Some(34), Some(3));
        let applier = SettlementApplier::new(store.clone());
        applier.settle_game("uga-clem").unwrap();

        let anon = store
            .picks_for_game("uga-clem")
            .unwrap()
            .into_iter()
            .find(|p| p.owner.is_anonymous())
            .unwrap();
        assert_eq!(anon.outcome.unwrap().points, 21);

        // Attribution does not disturb the settled outcome
        store.attribute_anonymous_pick(anon.id, "u4").unwrap();
        let report = applier.settle_game("uga-clem").unwrap();
        assert_eq!(report.outcome, SettlementOutcome::Unchanged);
    }
}
