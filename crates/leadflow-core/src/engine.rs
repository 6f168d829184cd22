use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::claim::ClaimArbiter;
use crate::config::{DistributionConfig, WarnLevel};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::intake::LeadIntake;
use crate::notify::Notifiers;
use crate::pool::PublicPool;
use crate::store::{LeadDb, StoreBackend};

/// Everything the distribution subsystem needs for one project root, wired
/// to the same store and configuration.
///
/// `Engine` (redb) serves the threads of one process. Use
/// `Engine::<SqliteStore>::open_with` when several processes share a root.
pub struct Engine<S = LeadDb> {
    root: PathBuf,
    config: DistributionConfig,
    store: Arc<S>,
    notifiers: Arc<Notifiers>,
}

impl Engine<LeadDb> {
    /// Open an initialized project. Fails with `NotInitialized` if
    /// `.leadflow/config.yaml` is missing.
    pub fn open(root: &Path) -> Result<Self> {
        Self::open_with(root)
    }

    /// Like `open`, but writes a default configuration first if needed.
    pub fn init(root: &Path) -> Result<Self> {
        Self::init_with(root)
    }
}

impl<S: StoreBackend> Engine<S> {
    /// `open` for an explicit store backend.
    pub fn open_with(root: &Path) -> Result<Self> {
        let config = DistributionConfig::load(root)?;
        Self::from_config(root, config)
    }

    /// `init` for an explicit store backend.
    pub fn init_with(root: &Path) -> Result<Self> {
        let config = DistributionConfig::init(root)?;
        Self::from_config(root, config)
    }

    fn from_config(root: &Path, config: DistributionConfig) -> Result<Self> {
        for w in config.validate() {
            match w.level {
                WarnLevel::Error => error!(message = %w.message, "config error"),
                WarnLevel::Warning => warn!(message = %w.message, "config warning"),
            }
        }
        let path = config.store_path(root, S::default_path(root));
        debug!(path = %path.display(), "opening lead store");
        let store = Arc::new(S::open_at(&path)?);
        Ok(Self {
            root: root.to_path_buf(),
            config,
            store,
            notifiers: Arc::new(Notifiers::new()),
        })
    }

    /// Replace the notifiers run after every dispatch or claim.
    pub fn with_notifiers(mut self, notifiers: Notifiers) -> Self {
        self.notifiers = Arc::new(notifiers);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn dispatcher(&self) -> Result<Dispatcher<S, S>> {
        Dispatcher::new(Arc::clone(&self.store), Arc::clone(&self.store))
            .with_cycle_key(self.config.cycle_key.clone())
    }

    pub fn intake(&self) -> Result<LeadIntake<S, S>> {
        Ok(LeadIntake::new(self.dispatcher()?, Arc::clone(&self.store))
            .with_notifiers(Arc::clone(&self.notifiers)))
    }

    pub fn arbiter(&self) -> ClaimArbiter<S> {
        ClaimArbiter::new(Arc::clone(&self.store), self.config.staleness)
            .with_notifiers(Arc::clone(&self.notifiers))
    }

    pub fn pool(&self) -> PublicPool<S> {
        PublicPool::new(Arc::clone(&self.store), self.config.staleness)
    }
}
