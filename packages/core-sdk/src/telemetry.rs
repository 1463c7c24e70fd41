use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

const LOG_FILE: &str = "chatlist.log";

/**
 * \brief Toggle file logging.
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief Record a routine event.
 */
pub fn log_event(category: &str, message: &str) {
    emit("INFO", category, message);
}

/**
 * \brief Record a recoverable problem, e.g. a credential rotation.
 */
pub fn log_warn(category: &str, message: &str) {
    emit("WARNING", category, message);
}

/**
 * \brief Record an error. Also echoed to stderr when enabled.
 */
pub fn log_error(category: &str, message: &str) {
    emit("ERROR", category, message);
}

fn emit(level: &str, category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    if level != "INFO" {
        eprintln!("[{}] {} - {}", level, category, message);
    }
    if let Err(err) = write_line(level, category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn log_dir() -> PathBuf {
    std::env::var("CHATLIST_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let dir = log_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}
