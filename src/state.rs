use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::TriageDb;
use crate::error::TriageError;
use crate::types::Config;

/// Environment variable that points at an alternate config file.
pub const CONFIG_ENV: &str = "INBOX_TRIAGE_CONFIG";

/// Shared database handle. One connection, serialized by a non-poisoning mutex.
pub type SharedDb = Arc<Mutex<TriageDb>>;

/// Process state shared by the HTTP service and the propagation worker.
pub struct AppState {
    pub config: Config,
    pub db: SharedDb,
}

impl AppState {
    /// Load config and open the database at its configured path.
    pub fn load() -> Result<Self, TriageError> {
        let config = load_config()?;
        let db_path = resolve_db_path(&config)?;
        let db = TriageDb::open_at(db_path)?;
        Ok(Self {
            config,
            db: Arc::new(Mutex::new(db)),
        })
    }
}

/// Get the state directory (~/.inbox-triage), creating it if needed
pub fn state_dir() -> Result<PathBuf, TriageError> {
    let home = dirs::home_dir()
        .ok_or_else(|| TriageError::Config("Could not find home directory".to_string()))?;
    let dir = home.join(".inbox-triage");

    if !dir.exists() {
        fs::create_dir_all(&dir)
            .map_err(|e| TriageError::Config(format!("Failed to create state dir: {}", e)))?;
    }

    Ok(dir)
}

/// Get the config file path (`$INBOX_TRIAGE_CONFIG` or ~/.inbox-triage/config.json)
pub fn config_path() -> Result<PathBuf, TriageError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| TriageError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".inbox-triage").join("config.json"))
}

/// Load configuration. A missing file yields the defaults.
pub fn load_config() -> Result<Config, TriageError> {
    let path = config_path()?;

    if !path.exists() {
        log::info!(
            "No config file at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)
        .map_err(|e| TriageError::Config(format!("Failed to read config: {}", e)))?;
    parse_config(&content)
}

/// Parse and validate config JSON.
pub fn parse_config(content: &str) -> Result<Config, TriageError> {
    let config: Config = serde_json::from_str(content)
        .map_err(|e| TriageError::Config(format!("Failed to parse config: {}", e)))?;

    if config.owner.trim().is_empty() {
        return Err(TriageError::Config("owner must not be empty".to_string()));
    }
    if config.page_size == 0 {
        return Err(TriageError::Config("pageSize must be at least 1".to_string()));
    }
    if config.summarizer.fallback_chars == 0 {
        return Err(TriageError::Config(
            "summarizer.fallbackChars must be at least 1".to_string(),
        ));
    }

    Ok(config)
}

/// Database path: the configured `dbPath`, else ~/.inbox-triage/triage.db.
pub fn resolve_db_path(config: &Config) -> Result<PathBuf, TriageError> {
    match &config.db_path {
        Some(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(state_dir()?.join("triage.db")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_rejects_empty_owner() {
        let err = parse_config(r#"{"owner": "  "}"#).unwrap_err();
        assert!(matches!(err, TriageError::Config(_)));
    }

    #[test]
    fn test_parse_config_rejects_zero_page_size() {
        assert!(parse_config(r#"{"pageSize": 0}"#).is_err());
    }

    #[test]
    fn test_parse_config_rejects_bad_json() {
        let err = parse_config("{ not json").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_resolve_db_path_prefers_explicit() {
        let config = parse_config(r#"{"dbPath": "/tmp/triage-test.db"}"#).unwrap();
        assert_eq!(
            resolve_db_path(&config).unwrap(),
            PathBuf::from("/tmp/triage-test.db")
        );
    }
}
