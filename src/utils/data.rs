use crate::models::{Game, NewPick, Pick, PickOwner};
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

/// Load a game schedule from a JSON file
pub fn load_games_from_json(path: &str) -> Result<Vec<Game>> {
    let json = std::fs::read_to_string(path).context("Failed to read games file")?;
    let games: Vec<Game> = serde_json::from_str(&json).context("Failed to deserialize games")?;
    Ok(games)
}

/// Load submitted picks from a JSON file
pub fn load_picks_from_json(path: &str) -> Result<Vec<NewPick>> {
    let json = std::fs::read_to_string(path).context("Failed to read picks file")?;
    let picks: Vec<NewPick> = serde_json::from_str(&json).context("Failed to deserialize picks")?;
    Ok(picks)
}

/// Save games (with their settlement) to a JSON file
pub fn save_games_to_json(games: &[Game], path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(games).context("Failed to serialize games")?;
    std::fs::write(path, json).context("Failed to write games file")?;
    Ok(())
}

/// One CSV row per pick
#[derive(Debug, Serialize)]
struct PickRow<'a> {
    pick_id: i64,
    kind: &'static str,
    owner: &'a str,
    user_id: &'a str,
    week: i32,
    game_id: &'a str,
    matchup: String,
    selected_team: &'a str,
    is_lock: bool,
    result: &'static str,
    points: Option<u32>,
}

/// Write picks with their settled outcome as CSV. Unsettled picks have empty result/points.
pub fn write_picks_csv<W: Write>(games_with_picks: &[(Game, Vec<Pick>)], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    for (game, picks) in games_with_picks {
        let matchup = format!("{} @ {}", game.away_team, game.home_team);
        for pick in picks {
            let (kind, owner) = match &pick.owner {
                PickOwner::User { user_id } => ("user", user_id.as_str()),
                PickOwner::Anonymous { submitter, .. } => ("anonymous", submitter.as_str()),
            };
            wtr.serialize(PickRow {
                pick_id: pick.id,
                kind,
                owner,
                user_id: pick.owner.user_id().unwrap_or(""),
                week: game.week,
                game_id: &game.id,
                matchup: matchup.clone(),
                selected_team: &pick.selected_team,
                is_lock: pick.is_lock,
                result: pick.outcome.map(|o| o.result.as_str()).unwrap_or(""),
                points: pick.outcome.map(|o| o.points),
            })
            .context("Failed to write pick row")?;
        }
    }

    wtr.flush().context("Failed to flush CSV")?;
    Ok(())
}

/// Save picks to a CSV file
pub fn save_picks_to_csv(games_with_picks: &[(Game, Vec<Pick>)], filename: &str) -> Result<()> {
    let file = std::fs::File::create(filename).context("Failed to create CSV file")?;
    write_picks_csv(games_with_picks, file)
}
