//! Research Autopilot: autonomous strategy-research sessions
//!
//! Usage:
//!   research-autopilot serve --port 3001                : Launch the HTTP API
//!   research-autopilot run --config session.json        : Run one session from CLI
//!   research-autopilot export --session <id> -o out.json: Export a stored session

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::{
    registry, AutopilotError, BinanceSource, FetchError, HistoryConfig, HistoryCoordinator,
    HistoryRequest, HistorySource, HttpOptimizer, Ledger, Mt5BridgeSource, ParamGrid,
    ResearchAutopilot, ResearchConfig, SqliteLedger, TrendVolatilityClassifier, DAY_MS,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "research-autopilot")]
#[command(about = "Autonomous strategy-research sessions", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the research API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run one research session from CLI (no web server)
    Run {
        /// Session configuration (JSON)
        #[arg(short, long)]
        config: String,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
    /// Export a stored session as JSON
    Export {
        /// Session id
        #[arg(long)]
        session: String,
        /// Output path
        #[arg(short, long)]
        output: String,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,research_autopilot=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,research_autopilot=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Run { config, export } => {
            cmd_run(&config, export).await?;
        }
        Commands::Export { session, output } => {
            cmd_export(&session, &output).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Settings: process configuration from the environment
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum HistoryBackend {
    Binance,
    Mt5Bridge(String),
}

#[derive(Debug, Clone)]
struct Settings {
    db_path: String,
    optimizer_url: String,
    history: HistoryBackend,
    history_ttl: Duration,
    history_min_interval: Duration,
}

impl Settings {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = HistoryConfig::default();

        let history = match get("AUTOPILOT_HISTORY_SOURCE")
            .unwrap_or_else(|| "binance".to_string())
            .to_lowercase()
            .as_str()
        {
            "binance" => HistoryBackend::Binance,
            "mt5" => {
                let url = get("AUTOPILOT_MT5_BRIDGE_URL").ok_or_else(|| {
                    anyhow::anyhow!("AUTOPILOT_MT5_BRIDGE_URL is required for the mt5 history source")
                })?;
                HistoryBackend::Mt5Bridge(url)
            }
            other => anyhow::bail!("Unknown AUTOPILOT_HISTORY_SOURCE: {}", other),
        };

        let history_ttl = get("AUTOPILOT_HISTORY_TTL_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.ttl);
        let history_min_interval = get("AUTOPILOT_HISTORY_MIN_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.min_interval);

        Ok(Self {
            db_path: get("AUTOPILOT_DB_PATH").unwrap_or_else(|| "data/research.db".to_string()),
            optimizer_url: get("AUTOPILOT_OPTIMIZER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8000".to_string()),
            history,
            history_ttl,
            history_min_interval,
        })
    }
}

async fn open_ledger(settings: &Settings) -> anyhow::Result<Arc<dyn Ledger>> {
    let db = persistence::Database::new(&settings.db_path)
        .await
        .map_err(|e| {
            error!("Failed to initialize database: {}", e);
            anyhow::anyhow!("Database initialization failed: {}", e)
        })?;
    info!("Database initialized: {}", settings.db_path);
    Ok(Arc::new(SqliteLedger::new(db.pool_clone())))
}

async fn build_autopilot(settings: &Settings) -> anyhow::Result<Arc<ResearchAutopilot>> {
    let ledger = open_ledger(settings).await?;

    let source: Arc<dyn HistorySource> = match &settings.history {
        HistoryBackend::Binance => Arc::new(BinanceSource::new()),
        HistoryBackend::Mt5Bridge(url) => Arc::new(Mt5BridgeSource::new(url.clone())),
    };
    let history = Arc::new(HistoryCoordinator::new(
        source,
        HistoryConfig {
            ttl: settings.history_ttl,
            min_interval: settings.history_min_interval,
            ..HistoryConfig::default()
        },
    ));

    Ok(Arc::new(ResearchAutopilot::new(
        history,
        Arc::new(HttpOptimizer::new(settings.optimizer_url.clone())),
        Arc::new(TrendVolatilityClassifier::new()),
        ledger,
    )))
}

// ============================================================================
// Serve command: Axum web server
// ============================================================================

#[derive(Clone)]
struct AppState {
    autopilot: Arc<ResearchAutopilot>,
}

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Research Autopilot v{} starting...", APP_VERSION);

    let settings = Settings::from_env()?;
    let state = AppState {
        autopilot: build_autopilot(&settings).await?,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", api_routes(state))
        .layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Research Autopilot v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health                          - Health check");
    println!("  GET  /api/research/sessions               - Recent sessions");
    println!("  POST /api/research/sessions               - Start a research session");
    println!("  GET  /api/research/sessions/:id           - Session status");
    println!("  GET  /api/research/sessions/:id/steps     - Session step trail");
    println!("  GET  /api/research/sessions/:id/results   - Session + experiments");
    println!("  GET  /api/research/sessions/:id/export    - Full export with dashboard");
    println!("  POST /api/research/sessions/:id/stop      - Request a stop");
    println!("  GET  /api/research/presets                - Saved search-space presets");
    println!("  GET  /api/research/presets/:name          - Read a preset");
    println!("  PUT  /api/research/presets/:name          - Save a preset");
    println!("  GET  /api/history/klines                  - Bars via the shared history cache");
    println!("\n  Database: {}", settings.db_path);
    println!("  Optimizer: {}", settings.optimizer_url);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route(
            "/research/sessions",
            get(api_list_sessions).post(api_start_session),
        )
        .route("/research/sessions/:id", get(api_session_status))
        .route("/research/sessions/:id/steps", get(api_session_steps))
        .route("/research/sessions/:id/results", get(api_session_results))
        .route("/research/sessions/:id/export", get(api_session_export))
        .route("/research/sessions/:id/stop", post(api_stop_session))
        .route("/research/presets", get(api_list_presets))
        .route(
            "/research/presets/:name",
            get(api_get_preset).put(api_save_preset),
        )
        .route("/history/klines", get(api_history_klines))
        .with_state(state)
}

// ============================================================================
// API Handlers: Research sessions
// ============================================================================

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn failure(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "message": message.into(),
        })),
    )
}

fn api_error(err: AutopilotError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        AutopilotError::Validation(_) => StatusCode::BAD_REQUEST,
        AutopilotError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AutopilotError::Ledger(e) => {
            error!("Ledger error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    failure(status, err.to_string())
}

/// GET /api/health
async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let history = state.autopilot.history();
    Json(serde_json::json!({
        "status": "ok",
        "version": APP_VERSION,
        "history_source": history.source_name(),
        "history_blocked_until": history.blocked_until_ms(),
        "timestamp": Utc::now().timestamp_millis(),
    }))
}

/// GET /api/research/sessions: most recent sessions
async fn api_list_sessions(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);
    let sessions = state.autopilot.list_sessions(limit).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": sessions,
        "total": sessions.len(),
    })))
}

/// POST /api/research/sessions: validate and launch a session
async fn api_start_session(
    State(state): State<AppState>,
    Json(config): Json<ResearchConfig>,
) -> ApiResult {
    info!(
        symbol = %config.symbol,
        timeframe = %config.timeframe,
        strategy = %config.strategy,
        "Starting research session via API"
    );
    let session = state.autopilot.start(config).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Session {} started", session.id),
        "session": session,
    })))
}

/// GET /api/research/sessions/:id
async fn api_session_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.autopilot.status(&id).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "active": state.autopilot.is_active(&id),
        "session": session,
    })))
}

/// GET /api/research/sessions/:id/steps
async fn api_session_steps(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let steps = state.autopilot.steps(&id).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": steps,
        "total": steps.len(),
    })))
}

/// GET /api/research/sessions/:id/results
async fn api_session_results(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let results = state.autopilot.results(&id).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "session": results.session,
        "experiments": results.experiments,
    })))
}

/// GET /api/research/sessions/:id/export
async fn api_session_export(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let export = state.autopilot.export(&id).await.map_err(api_error)?;
    let value = serde_json::to_value(&export)
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(value))
}

/// POST /api/research/sessions/:id/stop
async fn api_stop_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.autopilot.stop(&id).await.map_err(api_error)?;
    info!(session_id = %id, "Stop requested via API");
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Stop requested",
        "session": session,
    })))
}

// ============================================================================
// API Handlers: Presets
// ============================================================================

/// GET /api/research/presets
async fn api_list_presets(State(state): State<AppState>) -> ApiResult {
    let ledger = state.autopilot.ledger();
    let presets = registry::list_presets(ledger.as_ref())
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": presets,
        "total": presets.len(),
    })))
}

/// GET /api/research/presets/:name
async fn api_get_preset(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let ledger = state.autopilot.ledger();
    let grid = registry::load_preset(ledger.as_ref(), &name)
        .await
        .map_err(|e| match e {
            AutopilotError::Validation(engine::ValidationError::UnknownPreset(_)) => {
                failure(StatusCode::NOT_FOUND, e.to_string())
            }
            other => api_error(other),
        })?;
    Ok(Json(serde_json::json!({
        "success": true,
        "name": name,
        "grid": grid,
    })))
}

/// PUT /api/research/presets/:name
async fn api_save_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(grid): Json<ParamGrid>,
) -> ApiResult {
    let ledger = state.autopilot.ledger();
    registry::save_preset(ledger.as_ref(), &name, &grid)
        .await
        .map_err(api_error)?;
    info!(preset = %name, dimensions = grid.len(), "Preset saved");
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Preset {} saved", name),
    })))
}

// ============================================================================
// API Handlers: History
// ============================================================================

/// Resolve `start_time`/`end_time`/`days` query parameters into an epoch-ms range
fn history_window(params: &HashMap<String, String>, now_ms: i64) -> Result<(i64, i64), String> {
    let days: i64 = params
        .get("days")
        .and_then(|s| s.parse().ok())
        .unwrap_or(7);
    if days < 0 {
        return Err(format!("days must not be negative: {}", days));
    }
    let to_ms: i64 = params
        .get("end_time")
        .and_then(|s| s.parse().ok())
        .unwrap_or(now_ms);
    let from_ms = match params.get("start_time").and_then(|s| s.parse().ok()) {
        Some(start) => start,
        None => days
            .checked_mul(DAY_MS)
            .and_then(|span| to_ms.checked_sub(span))
            .ok_or_else(|| format!("days out of range: {}", days))?,
    };
    Ok((from_ms, to_ms))
}

/// GET /api/history/klines?symbol=BTCUSDT&timeframe=1h&days=7
async fn api_history_klines(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let symbol = params
        .get("symbol")
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| failure(StatusCode::BAD_REQUEST, "symbol is required"))?;
    let raw_timeframe = params.get("timeframe").map(String::as_str).unwrap_or("1h");
    let timeframe = engine::normalize_resolution(raw_timeframe).ok_or_else(|| {
        failure(
            StatusCode::BAD_REQUEST,
            format!("unsupported timeframe: {}", raw_timeframe),
        )
    })?;
    let (from_ms, to_ms) = history_window(&params, Utc::now().timestamp_millis())
        .map_err(|message| failure(StatusCode::BAD_REQUEST, message))?;

    match state
        .autopilot
        .history()
        .fetch(HistoryRequest {
            symbol,
            timeframe,
            from_ms,
            to_ms,
        })
        .await
    {
        Ok(series) => Ok(Json(serde_json::json!({
            "success": true,
            "data": series,
        }))),
        Err(e @ FetchError::RateLimited { .. }) => {
            Err(failure(StatusCode::TOO_MANY_REQUESTS, e.to_string()))
        }
        Err(e @ FetchError::InvalidRequest(_)) => Err(failure(StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => {
            warn!("History proxy fetch failed: {}", e);
            Err(failure(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

// ============================================================================
// Run command: CLI mode (no web server)
// ============================================================================

async fn cmd_run(config_path: &str, export: Option<String>) -> anyhow::Result<()> {
    println!("\n=== Research Autopilot v{} ===", APP_VERSION);

    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", config_path, e))?;
    let config: ResearchConfig = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid session config {}: {}", config_path, e))?;

    let settings = Settings::from_env()?;
    let autopilot = build_autopilot(&settings).await?;

    let session = autopilot.start(config).await?;
    println!("Session: {}", session.id);
    println!(
        "Symbol: {} | Timeframe: {} | Strategy: {} | Level: {} | Planned: {}",
        session.symbol,
        session.timeframe,
        session.strategy,
        session.config.level,
        session.config.max_experiments
    );
    println!("Press Ctrl+C to stop\n");

    // Ctrl+C requests a cooperative stop at the next iteration boundary
    let autopilot_for_ctrlc = autopilot.clone();
    let id_for_ctrlc = session.id.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting stop...");
        if let Err(e) = autopilot_for_ctrlc.stop(&id_for_ctrlc).await {
            warn!("Stop request failed: {}", e);
        }
    });

    // Progress display loop
    if let Some(mut rx) = autopilot.subscribe(&session.id) {
        loop {
            {
                let current = rx.borrow_and_update();
                let stats = &current.stats;
                print!(
                    "\r  [{}] {}/{} run | {} skipped | adopt {} / investigate {} / reject {} | failed {} | best {}      ",
                    current.status,
                    stats.experiments_run,
                    stats.experiments_planned,
                    stats.duplicates_skipped,
                    stats.adopted,
                    stats.investigated,
                    stats.rejected,
                    stats.failed_experiments,
                    stats
                        .best_score
                        .map(|s| s.round_dp(4).to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
                if current.status.is_terminal() {
                    break;
                }
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    let finished = autopilot.wait(&session.id).await?;
    println!("\n");
    println!(
        "  Finished: {} ({})",
        finished.status,
        finished.stop_reason.as_deref().unwrap_or("-")
    );
    if let Some(err) = &finished.last_error {
        println!("  Last error: {}", err);
    }
    if let Some(champion) = &finished.stats.champions.global {
        println!(
            "  Champion: {} score {} ({}) params {}",
            champion.experiment_id, champion.score, champion.decision, champion.params
        );
    }
    for warning in &finished.stats.warnings {
        println!("  ! {}", warning);
    }

    if let Some(path) = export {
        write_export(&autopilot, &finished.id, &path).await?;
    }

    Ok(())
}

// ============================================================================
// Export command
// ============================================================================

async fn cmd_export(session_id: &str, output: &str) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let autopilot = build_autopilot(&settings).await?;
    write_export(&autopilot, session_id, output).await
}

async fn write_export(autopilot: &ResearchAutopilot, session_id: &str, path: &str) -> anyhow::Result<()> {
    let export = autopilot.export(session_id).await?;
    let json = serde_json::to_string_pretty(&export)?;
    std::fs::write(path, json)?;
    println!(
        "  Exported {} experiments ({} steps) to {}",
        export.experiments.len(),
        export.steps.len(),
        path
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.db_path, "data/research.db");
        assert_eq!(settings.history, HistoryBackend::Binance);
        assert_eq!(settings.history_ttl, HistoryConfig::default().ttl);
    }

    #[test]
    fn test_settings_mt5_requires_bridge_url() {
        assert!(Settings::from_lookup(lookup(&[("AUTOPILOT_HISTORY_SOURCE", "mt5")])).is_err());

        let settings = Settings::from_lookup(lookup(&[
            ("AUTOPILOT_HISTORY_SOURCE", "MT5"),
            ("AUTOPILOT_MT5_BRIDGE_URL", "http://bridge:9000"),
            ("AUTOPILOT_HISTORY_MIN_INTERVAL_MS", "500"),
        ]))
        .unwrap();
        assert_eq!(
            settings.history,
            HistoryBackend::Mt5Bridge("http://bridge:9000".to_string())
        );
        assert_eq!(settings.history_min_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, _) = api_error(AutopilotError::SessionNotFound("rs-x".to_string()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = api_error(AutopilotError::Validation(
            engine::ValidationError::Missing("symbol"),
        ));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["success"], false);
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_history_window_resolution() {
        let now = 1_700_000_000_000;
        assert_eq!(history_window(&query(&[]), now), Ok((now - 7 * DAY_MS, now)));
        assert_eq!(
            history_window(&query(&[("days", "2"), ("end_time", "500000000")]), now),
            Ok((500_000_000 - 2 * DAY_MS, 500_000_000))
        );
        // an explicit start wins over days
        assert_eq!(
            history_window(&query(&[("start_time", "42"), ("days", "9999999999999")]), now),
            Ok((42, now))
        );
    }

    #[test]
    fn test_history_window_rejects_overflowing_days() {
        let now = 1_700_000_000_000;
        assert!(history_window(&query(&[("days", "9999999999999")]), now).is_err());
        let max = i64::MAX.to_string();
        assert!(history_window(&query(&[("days", max.as_str())]), now).is_err());
        assert!(history_window(&query(&[("days", "-3")]), now).is_err());
    }
}
