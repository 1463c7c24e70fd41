use anyhow::{bail, Result};
use rusqlite::{params, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::{collections::HashMap, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub use rusqlite::Connection;

use crate::models::{
    DispatchSettings, GenerationParameters, OutcomeStatus, ProviderConfig, RequestOutcome,
    DEFAULT_REQUEST_DELAY, DEFAULT_REQUEST_TIMEOUT,
};

pub const KEY_REQUEST_DELAY: &str = "request_delay";
pub const KEY_REQUEST_TIMEOUT: &str = "request_timeout";
const KEY_TELEMETRY: &str = "telemetry_enabled";
const KEY_TEMPERATURE: &str = "temperature";
const KEY_MAX_TOKENS: &str = "max_tokens";
const KEY_TOP_P: &str = "top_p";
const KEY_THINKING: &str = "thinking_enabled";

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/** \brief Free aggregator models seeded into an empty store. */
const DEFAULT_FREE_MODELS: [&str; 6] = [
    "nvidia/nemotron-nano-12b-v2-vl:free",
    "nvidia/nemotron-nano-9b-v2:free",
    "z-ai/glm-4.5-air:free",
    "qwen/qwen3-coder:free",
    "cognitivecomputations/dolphin-mistral-24b-venice-edition:free",
    "google/gemma-3-2b-it:free",
];

#[derive(Debug, Clone, Serialize)]
pub struct StoredPrompt {
    pub id: i64,
    pub date: String,
    pub prompt: String,
    pub tags: String,
}

/**
 * \brief Persisted outcome row.
 */
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub id: i64,
    pub prompt_id: i64,
    pub model_name: String,
    pub response: String,
    pub date: String,
    pub full_prompt: String,
    pub resp_time: f64,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelMetrics {
    /** \brief Mean response time over rows with a recorded time. */
    pub avg_time: f64,
    pub errors: i64,
}

/**
 * \brief Opens `chatlist.db` in the working directory, or `CHATLIST_DB` if set.
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("CHATLIST_DB").unwrap_or_else(|_| "chatlist.db".to_string());
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/**
 * \brief Creates tables and upgrades older files in place.
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            prompt TEXT NOT NULL,
            tags TEXT
        );

        CREATE TABLE IF NOT EXISTS results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prompt_id INTEGER,
            model_name TEXT,
            response TEXT,
            date TEXT,
            FOREIGN KEY (prompt_id) REFERENCES prompts(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS models (
            name TEXT PRIMARY KEY,
            api_url TEXT NOT NULL,
            api_id TEXT NOT NULL,
            is_active INTEGER DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        "#,
        )
    })?;

    ensure_column(conn, "results", "full_prompt", "TEXT")?;
    ensure_column(conn, "results", "resp_time", "REAL")?;
    ensure_column(conn, "results", "status", "TEXT")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
                [],
            )
        })?;
    }
    Ok(())
}

fn now_iso() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

// --- providers ---

pub fn upsert_provider(conn: &Connection, provider: &ProviderConfig) -> Result<()> {
    if provider.name.trim().is_empty() {
        bail!("provider name must not be empty");
    }
    retry_on_locked(|| {
        conn.execute(
            "INSERT OR REPLACE INTO models (name, api_url, api_id, is_active) VALUES (?1, ?2, ?3, ?4)",
            params![
                provider.name,
                provider.api_url,
                provider.credential_id,
                provider.active as i64
            ],
        )
    })?;
    Ok(())
}

pub fn delete_provider(conn: &Connection, name: &str) -> Result<()> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM models WHERE name=?1", params![name]))?;
    if rows == 0 {
        bail!("model {} not found", name);
    }
    Ok(())
}

pub fn set_provider_active(conn: &Connection, name: &str, active: bool) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE models SET is_active=?1 WHERE name=?2",
            params![active as i64, name],
        )
    })?;
    if rows == 0 {
        bail!("model {} not found", name);
    }
    Ok(())
}

/**
 * \brief Lists providers in insertion order, optionally only the active ones.
 */
pub fn list_providers(conn: &Connection, only_active: bool) -> Result<Vec<ProviderConfig>> {
    let sql = if only_active {
        "SELECT name, api_url, api_id, is_active FROM models WHERE is_active = 1 ORDER BY rowid ASC"
    } else {
        "SELECT name, api_url, api_id, is_active FROM models ORDER BY rowid ASC"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ProviderConfig {
                name: row.get(0)?,
                api_url: row.get(1)?,
                credential_id: row.get(2)?,
                active: row.get::<_, Option<i64>>(3)?.unwrap_or(1) != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_provider(conn: &Connection, name: &str) -> Result<Option<ProviderConfig>> {
    let provider = conn
        .query_row(
            "SELECT name, api_url, api_id, is_active FROM models WHERE name=?1",
            params![name],
            |row| {
                Ok(ProviderConfig {
                    name: row.get(0)?,
                    api_url: row.get(1)?,
                    credential_id: row.get(2)?,
                    active: row.get::<_, Option<i64>>(3)?.unwrap_or(1) != 0,
                })
            },
        )
        .optional()?;
    Ok(provider)
}

/**
 * \brief Seeds the free aggregator models plus one direct vendor when the table is empty.
 * \return Number of rows inserted.
 */
pub fn seed_default_providers(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(0);
    }
    let mut seeded = 0;
    for model_id in DEFAULT_FREE_MODELS {
        upsert_provider(
            conn,
            &ProviderConfig::new(model_id, OPENROUTER_URL, "OPENROUTER_API_KEY"),
        )?;
        seeded += 1;
    }
    upsert_provider(
        conn,
        &ProviderConfig::new(
            "gpt-4o-mini",
            "https://api.openai.com/v1/chat/completions",
            "OPENAI_API_KEY",
        ),
    )?;
    Ok(seeded + 1)
}

// --- prompts ---

pub fn add_prompt(conn: &Connection, text: &str, tags: &str) -> Result<i64> {
    let date = now_iso()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO prompts (date, prompt, tags) VALUES (?1, ?2, ?3)",
            params![date, text, tags],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief Most recent prompt row with exactly this text.
 */
pub fn find_prompt_id(conn: &Connection, text: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM prompts WHERE prompt=?1 ORDER BY date DESC, id DESC LIMIT 1",
            params![text],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn list_prompts(conn: &Connection) -> Result<Vec<StoredPrompt>> {
    let mut stmt =
        conn.prepare("SELECT id, date, prompt, tags FROM prompts ORDER BY date DESC, id DESC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(StoredPrompt {
                id: row.get(0)?,
                date: row.get(1)?,
                prompt: row.get(2)?,
                tags: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn delete_prompt(conn: &Connection, prompt_id: i64) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM results WHERE prompt_id=?1", params![prompt_id]))?;
    retry_on_locked(|| conn.execute("DELETE FROM prompts WHERE id=?1", params![prompt_id]))?;
    Ok(())
}

// --- results ---

pub fn save_result(
    conn: &Connection,
    prompt_id: i64,
    full_prompt: &str,
    outcome: &RequestOutcome,
) -> Result<i64> {
    let date = now_iso()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO results (prompt_id, model_name, response, date, full_prompt, resp_time, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                prompt_id,
                outcome.provider_name,
                outcome.response_text,
                date,
                full_prompt,
                outcome.elapsed_seconds,
                outcome.status.as_str()
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief Stores the prompt (reusing an identical earlier one) and the selected outcomes.
 * \return The prompt id.
 */
pub fn save_selected(conn: &Connection, prompt: &str, outcomes: &[RequestOutcome]) -> Result<i64> {
    if outcomes.is_empty() {
        bail!("no outcomes selected");
    }
    let prompt_id = match find_prompt_id(conn, prompt)? {
        Some(id) => id,
        None => add_prompt(conn, prompt, "")?,
    };
    for outcome in outcomes {
        save_result(conn, prompt_id, prompt, outcome)?;
    }
    Ok(prompt_id)
}

pub fn list_results(conn: &Connection, prompt_id: Option<i64>) -> Result<Vec<StoredResult>> {
    let base = "SELECT id, prompt_id, model_name, response, date, full_prompt, resp_time, status FROM results";
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(StoredResult {
            id: row.get(0)?,
            prompt_id: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
            model_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            response: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            date: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            full_prompt: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            resp_time: row.get::<_, Option<f64>>(6)?.unwrap_or_default(),
            status: row
                .get::<_, Option<String>>(7)?
                .unwrap_or_else(|| OutcomeStatus::Success.as_str().to_string()),
        })
    };
    let rows = match prompt_id {
        Some(id) => {
            let mut stmt =
                conn.prepare(&format!("{} WHERE prompt_id=?1 ORDER BY date DESC, id DESC", base))?;
            let rows = stmt
                .query_map(params![id], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!("{} ORDER BY date DESC, id DESC", base))?;
            let rows = stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn delete_result(conn: &Connection, result_id: i64) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM results WHERE id=?1", params![result_id]))?;
    Ok(())
}

// --- metrics ---

pub fn model_metrics(conn: &Connection, model_name: &str) -> Result<ModelMetrics> {
    let (avg, errors): (Option<f64>, i64) = conn.query_row(
        "SELECT AVG(resp_time), COUNT(*) FILTER (WHERE status LIKE 'Error%')
         FROM results WHERE model_name=?1 AND resp_time > 0",
        params![model_name],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(ModelMetrics {
        avg_time: round2(avg.unwrap_or(0.0)),
        errors,
    })
}

pub fn all_metrics(conn: &Connection) -> Result<HashMap<String, ModelMetrics>> {
    let mut stmt = conn.prepare(
        "SELECT model_name, AVG(resp_time), COUNT(*) FILTER (WHERE status LIKE 'Error%')
         FROM results WHERE resp_time > 0 GROUP BY model_name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ModelMetrics {
                    avg_time: round2(row.get::<_, Option<f64>>(1)?.unwrap_or(0.0)),
                    errors: row.get(2)?,
                },
            ))
        })?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    Ok(rows)
}

/**
 * \brief Most frequently saved models.
 */
pub fn popularity(conn: &Connection, limit: usize) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT model_name, COUNT(*) AS cnt FROM results GROUP BY model_name ORDER BY cnt DESC, model_name ASC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// --- settings ---

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM settings WHERE key=?1",
            params![key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(val.flatten())
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_parsed<T: std::str::FromStr>(conn: &Connection, key: &str, default: T) -> Result<T> {
    Ok(get_setting(conn, key)?
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default))
}

fn get_bool(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_setting(conn, key)?
        .map(|s| matches!(s.trim(), "1" | "true" | "True"))
        .unwrap_or(default))
}

fn set_bool(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_setting(conn, key, if value { "1" } else { "0" })
}

/**
 * \brief Reads `request_delay` / `request_timeout`; unparsable values fall back to defaults.
 */
pub fn load_dispatch_settings(conn: &Connection) -> Result<DispatchSettings> {
    Ok(DispatchSettings {
        delay_step_seconds: get_parsed(conn, KEY_REQUEST_DELAY, DEFAULT_REQUEST_DELAY)?,
        timeout_seconds: get_parsed(conn, KEY_REQUEST_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)?,
    })
}

pub fn save_dispatch_settings(conn: &Connection, settings: &DispatchSettings) -> Result<()> {
    settings.validate()?;
    set_setting(conn, KEY_REQUEST_DELAY, &settings.delay_step_seconds.to_string())?;
    set_setting(conn, KEY_REQUEST_TIMEOUT, &settings.timeout_seconds.to_string())?;
    Ok(())
}

pub fn load_generation_defaults(conn: &Connection) -> Result<GenerationParameters> {
    let fallback = GenerationParameters::default();
    Ok(GenerationParameters {
        temperature: get_parsed(conn, KEY_TEMPERATURE, fallback.temperature)?,
        max_tokens: get_parsed(conn, KEY_MAX_TOKENS, fallback.max_tokens)?,
        top_p: get_parsed(conn, KEY_TOP_P, fallback.top_p)?,
        thinking_enabled: get_bool(conn, KEY_THINKING, fallback.thinking_enabled)?,
    })
}

pub fn save_generation_defaults(conn: &Connection, params: &GenerationParameters) -> Result<()> {
    params.validate()?;
    set_setting(conn, KEY_TEMPERATURE, &params.temperature.to_string())?;
    set_setting(conn, KEY_MAX_TOKENS, &params.max_tokens.to_string())?;
    set_setting(conn, KEY_TOP_P, &params.top_p.to_string())?;
    set_bool(conn, KEY_THINKING, params.thinking_enabled)?;
    Ok(())
}

pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool(conn, KEY_TELEMETRY, true)
}

pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool(conn, KEY_TELEMETRY, enabled)
}

/**
 * \brief Retries SQLite writes that hit `database is locked`.
 * \details Linear backoff, at most 6 attempts.
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
