/// Wiring of configuration, catalog, discovery and executor for one run.
use anyhow::{Context, Result};
use elrond_core::{
    create_adapter, CommandExecutor, ElrondConfig, MountRegistry, Platform, ToolCatalog,
    ToolDiscovery,
};
use std::path::Path;
use std::sync::Arc;

pub struct Session {
    pub config: ElrondConfig,
    pub executor: Arc<CommandExecutor>,
}

impl Session {
    /// Load `config_path` (or platform defaults), apply `ELROND_*` overrides
    /// and build the discovery/executor pair.
    pub fn open(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => ElrondConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ElrondConfig::default(),
        };
        Self::with_config(config.apply_env()?)
    }

    pub fn with_config(config: ElrondConfig) -> Result<Self> {
        let catalog = ToolCatalog::load_or_builtin(config.catalog_path.as_deref())
            .context("Failed to load tool catalog")?;
        tracing::debug!("Tool catalog has {} entries", catalog.len());
        let discovery = Arc::new(ToolDiscovery::new(Arc::new(catalog)));
        Ok(Self {
            config,
            executor: Arc::new(CommandExecutor::new(discovery)),
        })
    }

    pub fn discovery(&self) -> &ToolDiscovery {
        self.executor.discovery()
    }

    /// Registry over the adapter for the host platform.
    pub fn registry(&self) -> Result<MountRegistry> {
        let adapter = create_adapter(Platform::current(), &self.config, self.executor.clone())?;
        Ok(MountRegistry::new(adapter))
    }
}
