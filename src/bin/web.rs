use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cfb_pickem::config::Config;
use cfb_pickem::settlement_applier::{SettlementApplier, SettlementReport};
use cfb_pickem::settlement_service::SettlementService;
use cfb_pickem::{
    Game, GameStatus, GameUpdate, LeaderboardEntry, Pick, SettlementError, SqliteStore,
};
use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{error, info};

#[derive(Template)]
#[template(path = "leaderboard.html")]
struct LeaderboardTemplate {
    season: i32,
    week: Option<i32>,
    entries: Vec<LeaderboardEntry>,
}

struct HtmlTemplate<T>(T);

impl<T> IntoResponse for HtmlTemplate<T>
where
    T: Template,
{
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

/// Settlement errors as HTTP responses
struct ApiError(SettlementError);

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SettlementError::GameNotFound(_) => StatusCode::NOT_FOUND,
            SettlementError::InvalidInput(_) | SettlementError::PreconditionNotMet { .. } => {
                StatusCode::BAD_REQUEST
            }
            SettlementError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            SettlementError::PersistenceFailure(_) => {
                error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    service: SettlementService<SqliteStore>,
}

#[derive(Debug, Deserialize)]
struct StandingsQuery {
    season: Option<i32>,
    week: Option<i32>,
}

impl StandingsQuery {
    fn season(&self) -> i32 {
        self.season.unwrap_or_else(|| Local::now().year())
    }
}

#[derive(Debug, Serialize)]
struct GameView {
    game: Game,
    picks: Vec<Pick>,
}

/// Admin score correction; the game is resettled right after
#[derive(Debug, Deserialize)]
struct ScoreCorrection {
    home_score: Option<u32>,
    away_score: Option<u32>,
    #[serde(default = "completed")]
    status: GameStatus,
}

fn completed() -> GameStatus {
    GameStatus::Completed
}

async fn home(
    State(state): State<AppState>,
    Query(query): Query<StandingsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let season = query.season();
    let week = query.week;
    let entries = state
        .service
        .with_store(move |store| store.leaderboard(season, week))
        .await?;
    Ok(HtmlTemplate(LeaderboardTemplate {
        season,
        week,
        entries,
    }))
}

async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<StandingsQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let season = query.season();
    let week = query.week;
    let entries = state
        .service
        .with_store(move |store| store.leaderboard(season, week))
        .await?;
    Ok(Json(entries))
}

async fn game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameView>, ApiError> {
    let view = state
        .service
        .with_store(move |store| {
            let game = store
                .game(&game_id)?
                .ok_or_else(|| SettlementError::GameNotFound(game_id.clone()))?;
            let picks = store.picks_for_game(&game_id)?;
            Ok(GameView { game, picks })
        })
        .await?;
    Ok(Json(view))
}

async fn settle(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<SettlementReport>, ApiError> {
    info!("Admin settle requested for game {}", game_id);
    Ok(Json(state.service.settle(&game_id).await?))
}

async fn correct_score(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(correction): Json<ScoreCorrection>,
) -> Result<Json<SettlementReport>, ApiError> {
    info!(
        "Admin score correction for game {}: {:?}-{:?}",
        game_id, correction.home_score, correction.away_score
    );
    let update = GameUpdate {
        game_id: game_id.clone(),
        home_score: correction.home_score,
        away_score: correction.away_score,
        status: correction.status,
    };
    state
        .service
        .with_store(move |store| store.record_game_update(&update))
        .await?;
    Ok(Json(state.service.settle(&game_id).await?))
}

fn app(state: AppState) -> Router {
    Router::new()
        .nest_service("/static", ServeDir::new("static"))
        .route("/", get(home))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/games/:id", get(game))
        .route("/api/admin/games/:id/settle", post(settle))
        .route("/api/admin/games/:id/score", post(correct_score))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let service = SettlementService::new(
        SettlementApplier::new(store).with_max_attempts(config.settle_retries),
    );

    println!("\nStarting web server at http://{}", config.bind_addr);
    println!("Press Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app(AppState { service })).await?;

    Ok(())
}
