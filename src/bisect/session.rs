use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::bisect::catalog::{Catalog, RevisionCatalog};
use crate::bisect::config::{default_config_path, load_config, Config};
use crate::bisect::failures::FailureLog;
use crate::bisect::git::{GitRepo, History};
use crate::bisect::lock::StoreLock;
use crate::bisect::store::ArtifactStore;

/// Everything a command needs, resolved once from the configuration
pub struct Session {
    pub config : Config,
    pub history : Box<dyn History>,
    pub store : ArtifactStore,
    pub failures : FailureLog
}

impl Session {
    /// Load the configuration (from `config_path` or the default location)
    /// and resolve the external tools.  Fails before touching any state when
    /// the configuration is incomplete.
    pub fn open(config_path : Option<&Path>) -> anyhow::Result<Session> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?
        };
        let mut config = load_config(&path)?;
        config.resolve_tools()?;
        debug!("Loaded configuration from {:?}", path);
        Ok(Session::from_config(config))
    }

    pub fn from_config(config : Config) -> Session {
        let history = GitRepo::new(&config.paths.git, &config.paths.git_location, &config.catalog.remote);
        let store = ArtifactStore::from_config(&config);
        let failures = FailureLog::new(&config.paths.failure_log);
        Session { history : Box::new(history), store, failures, config }
    }

    /// Replace the store lock (tests use this to observe lock traffic)
    pub fn with_lock(mut self, lock : Arc<dyn StoreLock>) -> Session {
        let paths = &self.config.paths;
        self.store = ArtifactStore::new(&paths.binaries_location, &paths.archiver, &paths.strip, lock);
        self
    }

    pub fn revision_catalog(&self) -> RevisionCatalog<'_> {
        RevisionCatalog::new(self.history.as_ref(), &self.config.catalog)
    }

    /// Optionally refresh history, then snapshot the tracked revisions
    pub fn catalog(&self, pull : bool) -> anyhow::Result<Catalog> {
        let rc = self.revision_catalog();
        if pull {
            rc.pull();
        }
        rc.collect()
    }
}
