use anyhow::{Context, Result};
use cfb_pickem::config::Config;
use cfb_pickem::data::{
    load_games_from_json, load_picks_from_json, save_games_to_json, save_picks_to_csv,
};
use cfb_pickem::game_results_api::GameResultsApiClient;
use cfb_pickem::settlement_applier::{SettlementApplier, SettlementOutcome, SettlementReport};
use cfb_pickem::settlement_service::SettlementService;
use cfb_pickem::{sync_week, GameStatus, GameUpdate, SqliteStore};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pickem", about = "College football pick'em settlement")]
struct Cli {
    /// SQLite database path (overrides PICKEM_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    InitDb,
    /// Import or refresh games from a JSON file
    ImportGames { path: String },
    /// Import submitted picks from a JSON file
    ImportPicks { path: String },
    /// Record a score/status change for a game, then settle it
    UpdateScore {
        game_id: String,
        #[arg(long)]
        home: Option<u32>,
        #[arg(long)]
        away: Option<u32>,
        #[arg(long, default_value = "completed")]
        status: String,
    },
    /// Recompute and apply the settlement for one game
    Settle { game_id: String },
    /// Settle every game of a week
    SettleWeek { season: i32, week: i32 },
    /// Fetch a week of results from CollegeFootballData and settle completed games
    Sync { season: i32, week: i32 },
    /// Credit an anonymous pick to a registered user
    Attribute { pick_id: i64, user_id: String },
    /// Print the standings
    Leaderboard {
        season: i32,
        #[arg(long)]
        week: Option<i32>,
    },
    /// Export a week's games with their settlement to JSON
    ExportGames {
        season: i32,
        week: i32,
        #[arg(long, default_value = "games.json")]
        out: String,
    },
    /// Export a week's picks with results to CSV
    ExportPicks {
        season: i32,
        week: i32,
        #[arg(long, default_value = "picks.csv")]
        out: String,
    },
}

fn print_report(report: &SettlementReport) {
    match &report.outcome {
        SettlementOutcome::Applied => println!(
            "{}: settled {:?}, {} of {} picks updated",
            report.game_id, report.settlement, report.picks_updated, report.picks_total
        ),
        SettlementOutcome::Unchanged => {
            println!("{}: already settled, no changes", report.game_id)
        }
        SettlementOutcome::Skipped { reason } => {
            println!("{}: not settled ({})", report.game_id, reason)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let store = Arc::new(SqliteStore::open(&config.db_path).context("Failed to open database")?);
    let service = SettlementService::new(
        SettlementApplier::new(store.clone()).with_max_attempts(config.settle_retries),
    );

    match cli.command {
        Command::InitDb => {
            println!("Database ready at {}", config.db_path);
        }
        Command::ImportGames { path } => {
            let games = load_games_from_json(&path)?;
            let mut imported = 0;
            for game in &games {
                match store.upsert_game(game) {
                    Ok(()) => imported += 1,
                    Err(e) => eprintln!("Skipping game {}: {}", game.id, e),
                }
            }
            println!("Imported {} of {} games", imported, games.len());
        }
        Command::ImportPicks { path } => {
            let picks = load_picks_from_json(&path)?;
            let mut imported = 0;
            for pick in &picks {
                match store.insert_pick(pick) {
                    Ok(_) => imported += 1,
                    Err(e) => eprintln!("Skipping pick on {}: {}", pick.game_id, e),
                }
            }
            println!("Imported {} of {} picks", imported, picks.len());
        }
        Command::UpdateScore {
            game_id,
            home,
            away,
            status,
        } => {
            let status: GameStatus = status.parse().map_err(anyhow::Error::msg)?;
            store.record_game_update(&GameUpdate {
                game_id: game_id.clone(),
                home_score: home,
                away_score: away,
                status,
            })?;
            print_report(&service.settle(&game_id).await?);
        }
        Command::Settle { game_id } => {
            print_report(&service.settle(&game_id).await?);
        }
        Command::SettleWeek { season, week } => {
            let ids: Vec<String> = store
                .games_for_week(season, week)?
                .into_iter()
                .map(|g| g.id)
                .collect();
            for (game_id, result) in service.settle_many(&ids).await {
                match result {
                    Ok(report) => print_report(&report),
                    Err(e) => eprintln!("{}: {}", game_id, e),
                }
            }
        }
        Command::Sync { season, week } => {
            let client = GameResultsApiClient::new(config.require_cfb_api_key()?.to_string());
            let summary = sync_week(&client, &service, season, week).await?;
            println!(
                "Imported {} games, recorded {} updates",
                summary.games_imported, summary.updates_recorded
            );
            for (game_id, e) in &summary.failures {
                eprintln!("{}: update not recorded: {}", game_id, e);
            }
            for (game_id, result) in &summary.settlements {
                match result {
                    Ok(report) => print_report(report),
                    Err(e) => eprintln!("{}: {}", game_id, e),
                }
            }
            match client.check_usage().await {
                Ok(remaining) => println!("CFB Data API requests remaining: {}", remaining),
                Err(e) => eprintln!("Could not check API usage: {}", e),
            }
        }
        Command::Attribute { pick_id, user_id } => {
            store.attribute_anonymous_pick(pick_id, &user_id)?;
            println!("Pick {} now counts for {}", pick_id, user_id);
        }
        Command::Leaderboard { season, week } => {
            let entries = store.leaderboard(season, week)?;
            if entries.is_empty() {
                println!("No settled picks yet.");
            }
            for (i, entry) in entries.iter().enumerate() {
                println!(
                    "{}. {} | {} pts | {}-{}-{}",
                    i + 1,
                    entry.user_id,
                    entry.points,
                    entry.wins,
                    entry.losses,
                    entry.pushes
                );
            }
        }
        Command::ExportGames { season, week, out } => {
            let games = store.games_for_week(season, week)?;
            save_games_to_json(&games, &out)?;
            println!("Saved {} games to {}", games.len(), out);
        }
        Command::ExportPicks { season, week, out } => {
            let mut rows = Vec::new();
            for game in store.games_for_week(season, week)? {
                let picks = store.picks_for_game(&game.id)?;
                rows.push((game, picks));
            }
            save_picks_to_csv(&rows, &out)?;
            println!("Saved picks to {}", out);
        }
    }

    Ok(())
}
