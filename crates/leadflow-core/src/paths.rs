use crate::error::{LeadflowError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const LEADFLOW_DIR: &str = ".leadflow";
pub const CONFIG_FILE: &str = ".leadflow/config.yaml";
pub const DB_FILE: &str = ".leadflow/leadflow.redb";
pub const SQLITE_FILE: &str = ".leadflow/leadflow.sqlite";

/// Cycle key used when the configuration does not name one.
pub const DEFAULT_CYCLE_KEY: &str = "default";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn leadflow_dir(root: &Path) -> PathBuf {
    root.join(LEADFLOW_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

pub fn sqlite_path(root: &Path) -> PathBuf {
    root.join(SQLITE_FILE)
}

// ---------------------------------------------------------------------------
// Cycle key validation
// ---------------------------------------------------------------------------

static KEY_RE: OnceLock<Regex> = OnceLock::new();

fn key_re() -> &'static Regex {
    KEY_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").expect("static pattern")
    })
}

/// A cycle key names one DispatchCycle record in the store.
pub fn validate_cycle_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 64 || !key_re().is_match(key) {
        return Err(LeadflowError::InvalidCycleKey(key.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
