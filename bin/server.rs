// FX Feature Pipeline - Status Server
// Read-only JSON API over the version log, run records and latest features

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;

use fx_pipeline::logging::init_tracing;
use fx_pipeline::{db, stats, DataTable, DatasetVersion, PipelineConfig, RunRecord, TrainingStats};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<PipelineConfig>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl ToString) -> Self {
        tracing::error!(error = %message.to_string(), "request failed");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }

    fn not_found(message: impl ToString) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            success: false,
            data: (),
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn with_conn<T>(
    state: &AppState,
    f: impl FnOnce(&Connection) -> fx_pipeline::Result<T>,
) -> Result<T, ApiError> {
    let conn = state
        .db
        .lock()
        .map_err(|_| ApiError::internal("database lock poisoned"))?;
    f(&conn).map_err(ApiError::internal)
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// Latest engineered row, column → value
#[derive(Serialize)]
struct LatestFeatures {
    row_count: usize,
    values: Map<String, Value>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/versions - Dataset version log, oldest first
async fn get_versions(State(state): State<AppState>) -> ApiResult<Vec<DatasetVersion>> {
    let versions = with_conn(&state, db::get_dataset_versions)?;
    Ok(Json(ApiResponse::ok(versions)))
}

/// GET /api/runs?limit=N - Most recent pipeline runs
async fn get_runs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<RunRecord>> {
    let limit = query.limit.unwrap_or(20).min(500);
    let runs = with_conn(&state, |conn| db::get_runs(conn, limit))?;
    Ok(Json(ApiResponse::ok(runs)))
}

/// GET /api/features/latest - Last row of the feature dataset
async fn get_latest_features(State(state): State<AppState>) -> ApiResult<LatestFeatures> {
    let path = state.config.dataset_path();
    if !path.exists() {
        return Err(ApiError::not_found("no feature dataset yet"));
    }

    let table = DataTable::from_csv_path(&path).map_err(ApiError::internal)?;
    let last = table
        .rows
        .last()
        .ok_or_else(|| ApiError::not_found("feature dataset is empty"))?;

    let values = table
        .headers
        .iter()
        .zip(last)
        .map(|(name, cell)| {
            let value = match cell {
                None => Value::Null,
                Some(raw) => raw
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(raw.clone())),
            };
            (name.clone(), value)
        })
        .collect();

    Ok(Json(ApiResponse::ok(LatestFeatures {
        row_count: table.row_count(),
        values,
    })))
}

/// GET /api/training-stats - Lag statistics of the training target
async fn get_training_stats(State(state): State<AppState>) -> ApiResult<TrainingStats> {
    let path = state.config.training_stats_path();
    if !path.exists() {
        return Err(ApiError::not_found("training statistics not generated yet"));
    }
    let training = stats::read(&path).map_err(ApiError::internal)?;
    Ok(Json(ApiResponse::ok(training)))
}

/// GET / - Banner
async fn serve_index() -> impl IntoResponse {
    Html(format!(
        "<h1>FX Feature Pipeline {}</h1><p>Read-only status API under <code>/api</code>: \
         health, versions, runs, features/latest, training-stats.</p>",
        fx_pipeline::VERSION
    ))
}

fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/versions", get(get_versions))
        .route("/runs", get(get_runs))
        .route("/features/latest", get(get_latest_features))
        .route("/training-stats", get(get_training_stats))
        .with_state(state);

    Router::new()
        .route("/", get(serve_index))
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;

    init_tracing();

    let config = PipelineConfig::from_env().context("Failed to load configuration")?;
    let addr = config.listen_addr.clone();

    let conn = db::open_database(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(addr = %addr, "status server listening");
    println!("🚀 Status API running on http://{}/api/health", addr);

    axum::serve(listener, build_router(state))
        .await
        .context("Server error")?;

    Ok(())
}
