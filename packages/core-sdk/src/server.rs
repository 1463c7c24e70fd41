use std::{convert::Infallible, path::PathBuf};

use anyhow::{anyhow, Result};
use async_stream::stream;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::{
    aggregate::Aggregator,
    db,
    dispatch::{Batch, Dispatcher},
    llm::Executor,
    models::{DispatchSettings, GenerationParameters, ProviderConfig, RequestOutcome},
    telemetry,
};

type ApiError = (StatusCode, String);

/**
 * \brief Shared handler state: where the store lives.
 */
#[derive(Debug, Clone)]
pub struct AppState {
    pub db_path: PathBuf,
}

impl AppState {
    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }
}

/**
 * \brief Starts the local HTTP service with the static front end and the API.
 * \param addr listen address, e.g. "127.0.0.1:5173"
 */
pub async fn run(addr: &str) -> Result<()> {
    let db_path =
        PathBuf::from(std::env::var("CHATLIST_DB").unwrap_or_else(|_| "chatlist.db".to_string()));
    let state = AppState { db_path };
    let conn = state.open()?;
    db::migrate(&conn)?;
    telemetry::set_enabled(db::get_telemetry_enabled(&conn)?);

    let ui_root = std::env::var("CHATLIST_UI_DIR").unwrap_or_else(|_| "web".to_string());
    let static_service = get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    let app = router(state).fallback_service(static_service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    telemetry::log_event("server", &format!("listening on http://{}", addr));
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API routes without the static fallback.
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/models",
            get(list_models).post(save_model).delete(remove_model),
        )
        .route("/api/models/active", post(toggle_model))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/compare", post(compare))
        .route("/api/compare/retry", post(compare_retry))
        .route("/api/prompts", get(list_prompts))
        .route("/api/results", get(list_results).post(save_results))
        .route("/api/metrics", get(metrics))
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Deserialize, Debug)]
struct NameQuery {
    name: String,
}

#[derive(Deserialize, Debug)]
struct ActiveRequest {
    name: String,
    active: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct SettingsDto {
    dispatch: DispatchSettings,
    generation: GenerationParameters,
    telemetry_enabled: bool,
}

#[derive(Deserialize, Debug)]
struct SettingsUpdate {
    #[serde(default)]
    dispatch: Option<DispatchSettings>,
    #[serde(default)]
    generation: Option<GenerationParameters>,
    #[serde(default)]
    telemetry_enabled: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct CompareRequest {
    prompt: String,
    /** \brief Falls back to the stored generation defaults. */
    #[serde(default)]
    params: Option<GenerationParameters>,
    /** \brief Restrict the batch to these active models. */
    #[serde(default)]
    models: Option<Vec<String>>,
}

#[derive(Deserialize, Debug)]
struct RetryRequest {
    prompt: String,
    #[serde(default)]
    params: Option<GenerationParameters>,
    previous: Vec<RequestOutcome>,
}

#[derive(Deserialize, Debug)]
struct ResultsQuery {
    prompt_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct SaveResultsRequest {
    prompt: String,
    outcomes: Vec<RequestOutcome>,
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ProviderConfig>>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    let providers = db::list_providers(&conn, false).map_err(internal_err)?;
    Ok(Json(providers))
}

async fn save_model(
    State(state): State<AppState>,
    Json(provider): Json<ProviderConfig>,
) -> Result<Json<ProviderConfig>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    db::upsert_provider(&conn, &provider).map_err(bad_request)?;
    Ok(Json(provider))
}

async fn remove_model(
    State(state): State<AppState>,
    Query(q): Query<NameQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    db::delete_provider(&conn, &q.name).map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(serde_json::json!({"deleted": q.name})))
}

async fn toggle_model(
    State(state): State<AppState>,
    Json(req): Json<ActiveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    db::set_provider_active(&conn, &req.name, req.active)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(serde_json::json!({"name": req.name, "active": req.active})))
}

fn load_settings(conn: &Connection) -> Result<SettingsDto> {
    Ok(SettingsDto {
        dispatch: db::load_dispatch_settings(conn)?,
        generation: db::load_generation_defaults(conn)?,
        telemetry_enabled: db::get_telemetry_enabled(conn)?,
    })
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<SettingsDto>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    Ok(Json(load_settings(&conn).map_err(internal_err)?))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<SettingsDto>, ApiError> {
    if let Some(dispatch) = &update.dispatch {
        dispatch.validate().map_err(bad_request)?;
    }
    if let Some(generation) = &update.generation {
        generation.validate().map_err(bad_request)?;
    }
    let conn = state.open().map_err(internal_err)?;
    if let Some(dispatch) = update.dispatch {
        db::save_dispatch_settings(&conn, &dispatch).map_err(bad_request)?;
    }
    if let Some(generation) = update.generation {
        db::save_generation_defaults(&conn, &generation).map_err(bad_request)?;
    }
    if let Some(enabled) = update.telemetry_enabled {
        db::set_telemetry_enabled(&conn, enabled).map_err(internal_err)?;
        telemetry::set_enabled(enabled);
    }
    Ok(Json(load_settings(&conn).map_err(internal_err)?))
}

/**
 * \brief Everything a batch needs, read from the store right before dispatch.
 */
fn prepare_batch_inputs(
    conn: &Connection,
    params: Option<GenerationParameters>,
) -> Result<(Vec<ProviderConfig>, GenerationParameters, DispatchSettings), ApiError> {
    let params = match params {
        Some(p) => p,
        None => db::load_generation_defaults(conn).map_err(internal_err)?,
    };
    params.validate().map_err(bad_request)?;
    let settings = db::load_dispatch_settings(conn).map_err(internal_err)?;
    let providers = db::list_providers(conn, true).map_err(internal_err)?;
    Ok((providers, params, settings))
}

/**
 * \brief Fan-out SSE: `outcome` per arrival, then `done` with the full list.
 */
async fn compare(
    State(state): State<AppState>,
    Json(req): Json<CompareRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    let conn = state.open().map_err(internal_err)?;
    let (mut providers, params, settings) = prepare_batch_inputs(&conn, req.params)?;
    if let Some(names) = &req.models {
        providers.retain(|p| names.contains(&p.name));
    }
    if providers.is_empty() {
        return Err(bad_request(anyhow!("no active models selected")));
    }

    let dispatcher = Dispatcher::new(Executor::from_env().map_err(internal_err)?);
    let batch = dispatcher.dispatch(&req.prompt, &providers, &params, &settings);
    Ok(Sse::new(outcome_events(batch)).keep_alive(KeepAlive::new()))
}

async fn compare_retry(
    State(state): State<AppState>,
    Json(req): Json<RetryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    let (providers, params, settings) = prepare_batch_inputs(&conn, req.params)?;
    let dispatcher = Dispatcher::new(Executor::from_env().map_err(internal_err)?);
    let batch = dispatcher.retry_failed(&req.prompt, &req.previous, &providers, &params, &settings);
    Ok(Sse::new(outcome_events(batch)).keep_alive(KeepAlive::new()))
}

/**
 * \brief Dropping the returned stream (client gone) cancels the batch.
 */
fn outcome_events(batch: Batch) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        let total = batch.len();
        yield Ok::<_, Infallible>(Event::default()
            .event("meta")
            .data(serde_json::json!({ "total": total }).to_string()));

        let mut progress = Box::pin(Aggregator::new(batch).into_stream());
        let mut outcomes = Vec::with_capacity(total);
        while let Some(step) = progress.next().await {
            yield Ok(Event::default().event("outcome").data(
                serde_json::json!({
                    "outcome": step.outcome,
                    "completed": step.completed,
                    "total": step.total,
                })
                .to_string(),
            ));
            outcomes = step.snapshot;
        }
        yield Ok(Event::default()
            .event("done")
            .data(serde_json::json!({ "outcomes": outcomes }).to_string()));
    }
}

async fn list_prompts(
    State(state): State<AppState>,
) -> Result<Json<Vec<db::StoredPrompt>>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    Ok(Json(db::list_prompts(&conn).map_err(internal_err)?))
}

async fn list_results(
    State(state): State<AppState>,
    Query(q): Query<ResultsQuery>,
) -> Result<Json<Vec<db::StoredResult>>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    Ok(Json(db::list_results(&conn, q.prompt_id).map_err(internal_err)?))
}

async fn save_results(
    State(state): State<AppState>,
    Json(req): Json<SaveResultsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    let prompt_id = db::save_selected(&conn, &req.prompt, &req.outcomes).map_err(bad_request)?;
    telemetry::log_event(
        "server.results",
        &format!("saved {} responses under prompt {}", req.outcomes.len(), prompt_id),
    );
    Ok(Json(serde_json::json!({"prompt_id": prompt_id, "saved": req.outcomes.len()})))
}

async fn metrics(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    let per_model = db::all_metrics(&conn).map_err(internal_err)?;
    let popular = db::popularity(&conn, 5).map_err(internal_err)?;
    Ok(Json(serde_json::json!({"models": per_model, "popular": popular})))
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.open().map_err(internal_err)?;
    let active = db::list_providers(&conn, true).map_err(internal_err)?;
    Ok(Json(serde_json::json!({"ok": true, "active_models": active.len()})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_stub;

    async fn serve_api(db_path: PathBuf) -> String {
        let app = router(AppState { db_path });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind api");
        let addr = listener.local_addr().expect("api addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{}", addr)
    }

    fn temp_db(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = std::env::temp_dir().join(format!(
            "chatlist-{}-{}-{}.db",
            tag,
            std::process::id(),
            nanos
        ));
        let conn = Connection::open(&path).expect("open temp db");
        db::migrate(&conn).expect("migrate temp db");
        path
    }

    #[tokio::test]
    async fn test_compare_streams_outcomes_then_done() {
        std::env::set_var("CHATLIST_SERVER_TEST_KEY", "ok");
        let stub = spawn_stub().await;
        let path = temp_db("compare");
        {
            let conn = Connection::open(&path).expect("open");
            db::upsert_provider(
                &conn,
                &ProviderConfig::new("alpha", &stub.url, "CHATLIST_SERVER_TEST_KEY"),
            )
            .expect("alpha");
            db::upsert_provider(
                &conn,
                &ProviderConfig::new("beta", &stub.url, "CHATLIST_SERVER_TEST_MISSING"),
            )
            .expect("beta");
        }
        let base = serve_api(path.clone()).await;
        let client = reqwest::Client::new();

        let body = client
            .post(format!("{}/api/compare", base))
            .json(&serde_json::json!({"prompt": "hello"}))
            .send()
            .await
            .expect("compare")
            .text()
            .await
            .expect("body");
        assert_eq!(body.matches("event: outcome").count(), 2);
        assert!(body.contains("event: done"));
        assert!(body.contains("alpha:hello"));
        assert!(body.contains("Error: Auth"));

        let empty = client
            .post(format!("{}/api/compare", base))
            .json(&serde_json::json!({"prompt": "  "}))
            .send()
            .await
            .expect("compare empty");
        assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);

        let saved: serde_json::Value = client
            .post(format!("{}/api/results", base))
            .json(&serde_json::json!({
                "prompt": "hello",
                "outcomes": [{"model": "alpha", "response": "alpha:hello", "status": "Success", "resp_time": 0.2}]
            }))
            .send()
            .await
            .expect("save")
            .json()
            .await
            .expect("save json");
        assert_eq!(saved["saved"], 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_compare_retry_streams_only_failed_providers() {
        std::env::set_var("CHATLIST_SERVER_TEST_KEY", "ok");
        let stub = spawn_stub().await;
        let path = temp_db("retry");
        {
            let conn = Connection::open(&path).expect("open");
            for name in ["alpha", "beta", "gamma"] {
                db::upsert_provider(
                    &conn,
                    &ProviderConfig::new(name, &stub.url, "CHATLIST_SERVER_TEST_KEY"),
                )
                .expect("provider");
            }
        }
        let base = serve_api(path.clone()).await;

        let body = reqwest::Client::new()
            .post(format!("{}/api/compare/retry", base))
            .json(&serde_json::json!({
                "prompt": "again",
                "previous": [
                    {"model": "alpha", "response": "fine", "status": "Success", "resp_time": 0.4},
                    {"model": "beta", "response": "HTTP 503", "status": "Error: API", "resp_time": 1.1},
                    {"model": "gamma", "response": "fine", "status": "Success", "resp_time": 0.7}
                ]
            }))
            .send()
            .await
            .expect("retry")
            .text()
            .await
            .expect("body");

        assert_eq!(body.matches("event: outcome").count(), 1);
        assert!(body.contains("beta:again"));
        assert!(!body.contains("alpha"));
        assert!(!body.contains("gamma"));
        let outcome_at = body.find("event: outcome").expect("outcome event");
        let done_at = body.find("event: done").expect("done event");
        assert!(outcome_at < done_at);
        assert_eq!(stub.hits().len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_settings_roundtrip_and_validation() {
        let path = temp_db("settings");
        let base = serve_api(path.clone()).await;
        let client = reqwest::Client::new();

        let defaults: SettingsDto = client
            .get(format!("{}/api/settings", base))
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(defaults.dispatch, DispatchSettings::default());

        let updated: SettingsDto = client
            .post(format!("{}/api/settings", base))
            .json(&serde_json::json!({
                "dispatch": {"delay_step_seconds": 2.0, "timeout_seconds": 15.0}
            }))
            .send()
            .await
            .expect("post")
            .json()
            .await
            .expect("json");
        assert_eq!(updated.dispatch.delay_step_seconds, 2.0);
        assert_eq!(updated.dispatch.timeout_seconds, 15.0);

        let rejected = client
            .post(format!("{}/api/settings", base))
            .json(&serde_json::json!({
                "generation": {"temperature": 3.0, "max_tokens": 10, "top_p": 0.5}
            }))
            .send()
            .await
            .expect("post invalid");
        assert_eq!(rejected.status(), reqwest::StatusCode::BAD_REQUEST);

        let mixed = client
            .post(format!("{}/api/settings", base))
            .json(&serde_json::json!({
                "dispatch": {"delay_step_seconds": 9.0, "timeout_seconds": 90.0},
                "generation": {"temperature": 3.0, "max_tokens": 10, "top_p": 0.5}
            }))
            .send()
            .await
            .expect("post mixed");
        assert_eq!(mixed.status(), reqwest::StatusCode::BAD_REQUEST);

        let oversized = client
            .post(format!("{}/api/settings", base))
            .json(&serde_json::json!({
                "dispatch": {"delay_step_seconds": 0.0, "timeout_seconds": 1e20}
            }))
            .send()
            .await
            .expect("post oversized");
        assert_eq!(oversized.status(), reqwest::StatusCode::BAD_REQUEST);

        let current: SettingsDto = client
            .get(format!("{}/api/settings", base))
            .send()
            .await
            .expect("get after rejects")
            .json()
            .await
            .expect("json");
        assert_eq!(current.dispatch.delay_step_seconds, 2.0);
        assert_eq!(current.dispatch.timeout_seconds, 15.0);

        let _ = std::fs::remove_file(&path);
    }
}
