//! Local persistence: run history, significance tests, and the session id.
//!
//! Everything is stored as JSON under the platform data directory.

use crate::history::{RunHistory, SignificanceTests};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "showwhy-run";

fn data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("could not resolve the platform data directory")?
        .join(APP_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    Ok(dir)
}

pub fn load_history() -> Result<RunHistory> {
    load_json(&data_dir()?.join("run_history.json"))
}

pub fn save_history(history: &RunHistory) -> Result<PathBuf> {
    save_json(&data_dir()?.join("run_history.json"), history)
}

pub fn load_significance_tests() -> Result<SignificanceTests> {
    load_json(&data_dir()?.join("significance_tests.json"))
}

pub fn save_significance_tests(tests: &SignificanceTests) -> Result<PathBuf> {
    save_json(&data_dir()?.join("significance_tests.json"), tests)
}

/// The persisted session id, generated on first use. `reset` discards the
/// stored id so a new session starts, the same way an upload does.
pub fn load_or_create_session_id(reset: bool) -> Result<String> {
    let path = data_dir()?.join("session");
    if !reset {
        if let Ok(existing) = fs::read_to_string(&path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
        }
    }
    let session_id = uuid::Uuid::new_v4().to_string();
    fs::write(&path, &session_id)
        .with_context(|| format!("failed to persist session id to {}", path.display()))?;
    Ok(session_id)
}

/// Remember the session id of a run that was just made the default.
pub fn store_session_id(session_id: &str) -> Result<()> {
    let path = data_dir()?.join("session");
    fs::write(&path, session_id)
        .with_context(|| format!("failed to persist session id to {}", path.display()))
}

pub fn export_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

fn load_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("corrupt state file {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    }
}

fn save_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<PathBuf> {
    let out = serde_json::to_string_pretty(value)?;
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_json_defaults_when_missing() {
        let path = std::env::temp_dir().join("showwhy-run-test-missing.json");
        let _ = fs::remove_file(&path);
        let history: RunHistory = load_json(&path).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = std::env::temp_dir().join("showwhy-run-test-roundtrip.json");
        let mut tests = SignificanceTests::new();
        tests.apply_update("run-1", None, &Default::default());
        save_json(&path, &tests).unwrap();
        let loaded: SignificanceTests = load_json(&path).unwrap();
        assert_eq!(loaded.all().len(), 1);
        let _ = fs::remove_file(&path);
    }
}
