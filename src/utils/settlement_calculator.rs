use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    CoveringSide, Game, PickOutcome, PickResult, SettleableGame, Settlement, BASE_POINTS,
    PUSH_POINTS,
};

/// Adjusted margins closer to zero than this are a push.
/// Spreads move in half points, so covering by exactly the spread lands inside it.
pub const PUSH_TOLERANCE: f64 = 0.5;

/// Compute the against-the-spread settlement of a finished game
///
/// spread is home-relative: -13.5 means the home team is favored by 13.5
pub fn calculate_settlement(
    home_score: i64,
    away_score: i64,
    spread: f64,
    home_team: &str,
    away_team: &str,
) -> SettlementResult<Settlement> {
    if home_score < 0 || away_score < 0 {
        return Err(SettlementError::InvalidInput(format!(
            "scores must be non-negative, got {}-{}",
            home_score, away_score
        )));
    }
    if home_team.trim().is_empty() || away_team.trim().is_empty() {
        return Err(SettlementError::InvalidInput(
            "team names must not be empty".to_string(),
        ));
    }
    if home_team == away_team {
        return Err(SettlementError::InvalidInput(format!(
            "home and away team are both {}",
            home_team
        )));
    }
    if !spread.is_finite() {
        return Err(SettlementError::InvalidInput(format!(
            "spread must be finite, got {}",
            spread
        )));
    }

    let home_margin = (home_score - away_score) as f64;
    Ok(settle_adjusted_margin(home_margin + spread))
}

/// Settlement of a game that is completed with both scores
pub fn settle_game_score(game: &SettleableGame<'_>) -> SettlementResult<Settlement> {
    calculate_settlement(
        game.score.home as i64,
        game.score.away as i64,
        game.game.spread,
        &game.game.home_team,
        &game.game.away_team,
    )
}

/// Classify a spread-adjusted home margin
pub fn settle_adjusted_margin(adjusted_margin: f64) -> Settlement {
    if adjusted_margin.abs() < PUSH_TOLERANCE {
        return Settlement::push();
    }

    let (covering_side, magnitude) = if adjusted_margin > 0.0 {
        (CoveringSide::Home, adjusted_margin)
    } else {
        (CoveringSide::Away, adjusted_margin.abs())
    };

    Settlement {
        covering_side,
        margin_bonus: margin_bonus_tier(magnitude),
        base_points: BASE_POINTS,
    }
}

/// Bonus tier for covering by `magnitude` points. Lower edges are inclusive.
pub fn margin_bonus_tier(magnitude: f64) -> u32 {
    if magnitude >= 29.0 {
        5
    } else if magnitude >= 20.0 {
        3
    } else if magnitude >= 11.0 {
        1
    } else {
        0
    }
}

/// Result and points for a pick on a settled game
///
/// A Lock doubles the margin bonus only, never the base points,
/// and pushes pay a flat amount whether locked or not.
pub fn score_pick(
    game: &Game,
    settlement: &Settlement,
    selected_team: &str,
    is_lock: bool,
) -> PickOutcome {
    match game.covering_team(settlement.covering_side) {
        None => PickOutcome {
            result: PickResult::Push,
            points: PUSH_POINTS,
        },
        Some(team) if team == selected_team => {
            let lock_bonus = if is_lock { settlement.margin_bonus } else { 0 };
            PickOutcome {
                result: PickResult::Win,
                points: settlement.base_points + settlement.margin_bonus + lock_bonus,
            }
        }
        Some(_) => PickOutcome {
            result: PickResult::Loss,
            points: 0,
        },
    }
}
