//! Command groups and the context they share.

pub mod job;
pub mod queue;
pub mod worker;

use anyhow::Result;
use hive_core::config::Config;
use hive_core::store::Store;
use std::path::PathBuf;

/// Loaded configuration plus a connected store.
pub struct Context {
    pub config: Config,
    pub store: Store,
    /// Configuration file passed on the command line, forwarded to children
    pub config_path: Option<PathBuf>,
}

impl Context {
    pub async fn connect(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let store = Store::connect(&config.redis).await?;

        Ok(Self {
            config,
            store,
            config_path,
        })
    }

    /// Global arguments a child `hive` process needs to see the same store.
    pub fn child_args(&self) -> Vec<String> {
        match &self.config_path {
            Some(path) => vec!["--config".into(), path.display().to_string()],
            None => Vec::new(),
        }
    }
}
