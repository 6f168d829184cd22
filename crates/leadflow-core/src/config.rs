use crate::error::{LeadflowError, Result};
use crate::lead::StalenessWindow;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. Relative paths resolve against the project root.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// DistributionConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_cycle_key")]
    pub cycle_key: String,
    #[serde(default)]
    pub staleness: StalenessWindow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,
}

fn default_version() -> u32 {
    1
}

fn default_cycle_key() -> String {
    paths::DEFAULT_CYCLE_KEY.to_string()
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            cycle_key: default_cycle_key(),
            staleness: StalenessWindow::default(),
            store: None,
        }
    }
}

impl DistributionConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(LeadflowError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: DistributionConfig = serde_yaml::from_str(&data)?;
        paths::validate_cycle_key(&cfg.cycle_key)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        write_synced(&path, data.as_bytes())
    }

    /// Create `.leadflow/` and write a default config unless one exists.
    ///
    /// Returns the effective configuration either way.
    pub fn init(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(paths::leadflow_dir(root))?;
        if paths::config_path(root).exists() {
            return Self::load(root);
        }
        let cfg = Self::default();
        cfg.save(root)?;
        Ok(cfg)
    }

    /// redb database file this configuration points at.
    pub fn db_path(&self, root: &Path) -> PathBuf {
        self.store_path(root, paths::db_path(root))
    }

    /// The configured store path, or `default` when none is set.
    pub fn store_path(&self, root: &Path, default: PathBuf) -> PathBuf {
        match &self.store {
            Some(store) if store.path.is_absolute() => store.path.clone(),
            Some(store) => root.join(&store.path),
            None => default,
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if paths::validate_cycle_key(&self.cycle_key).is_err() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("cycle_key '{}' is not a valid key", self.cycle_key),
            });
        }

        let window = &self.staleness;
        if window.received_after.is_zero() || window.contact_after.is_zero() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "a zero staleness window makes every pooled lead claimable immediately"
                    .to_string(),
            });
        }

        if window.contact_after > window.received_after {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "staleness.contact_after ({}s) exceeds staleness.received_after ({}s); \
                     the contact window will never be the one that fires",
                    window.contact_after.as_secs(),
                    window.received_after.as_secs()
                ),
            });
        }

        warnings
    }
}

/// Replace `path` through a synced sibling tempfile so a crash never leaves a
/// truncated config behind.
fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
