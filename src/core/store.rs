//! Store handle for Molt's state.
//!
//! A store is a directory holding the context database, the broker audit
//! ledger and an optional `molt.toml`. Two store kinds exist: a user store
//! shared by every project, and a repo store scoped to one checkout.

use crate::core::config::StoreConfig;
use crate::core::error::MoltError;
use std::fs;
use std::path::{Path, PathBuf};

/// Store type discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// User store: `~/.molt/`
    User,
    /// Repo store: `<repo>/.molt/`
    Repo,
}

/// Store handle representing a Molt workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Store type (User or Repo)
    pub kind: StoreKind,
    /// Absolute path to the store root directory
    pub root: PathBuf,
    /// Settings loaded from `molt.toml` (defaults when absent)
    pub config: StoreConfig,
}

impl Store {
    /// Open (creating if needed) the store at `root` and make sure its
    /// database and search projection are ready.
    pub fn open(kind: StoreKind, root: &Path) -> Result<Self, MoltError> {
        fs::create_dir_all(root).map_err(MoltError::IoError)?;
        let config = StoreConfig::load(root)?;
        Self::open_with_config(kind, root, config)
    }

    pub fn open_with_config(
        kind: StoreKind,
        root: &Path,
        config: StoreConfig,
    ) -> Result<Self, MoltError> {
        config.check()?;
        fs::create_dir_all(root).map_err(MoltError::IoError)?;
        let store = Store {
            kind,
            root: root.to_path_buf(),
            config,
        };
        crate::core::db::initialize_context_db(&store.root)?;
        crate::plugins::search::ensure_index(&store)?;
        Ok(store)
    }

    pub fn db_path(&self) -> PathBuf {
        crate::core::db::context_db_path(&self.root)
    }
}
