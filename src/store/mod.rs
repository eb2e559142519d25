pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::SettlementResult;
use crate::models::{Game, Pick, PickOutcome, PickRef, Settlement};

/// Reads and writes available inside one settlement transaction
pub trait SettlementTx {
    fn game(&mut self, game_id: &str) -> SettlementResult<Option<Game>>;

    /// Every pick on the game, user and anonymous alike
    fn picks_for_game(&mut self, game_id: &str) -> SettlementResult<Vec<Pick>>;

    fn write_settlement(&mut self, game_id: &str, settlement: &Settlement) -> SettlementResult<()>;

    fn write_pick_outcome(&mut self, pick: PickRef, outcome: &PickOutcome) -> SettlementResult<()>;
}

/// Storage the settlement applier runs against
pub trait SettlementStore: Send + Sync {
    /// Run `f` in a single write transaction.
    /// Commits when `f` returns Ok, rolls everything back otherwise.
    fn in_transaction<T, F>(&self, f: F) -> SettlementResult<T>
    where
        F: FnOnce(&mut dyn SettlementTx) -> SettlementResult<T>;
}
