//! Strategy registry
//!
//! Maps each [`Family`] to the strategy that syncs it.

use std::collections::HashMap;
use std::sync::Arc;

use super::{GitCommand, GitStrategy, NpmStrategy, SyncStrategy};
use crate::config::AppConfig;
use crate::error::SyncError;
use crate::types::Family;

#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<Family, Arc<dyn SyncStrategy>>,
}

impl StrategyRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in git and npm strategies.
    pub fn from_config(config: &AppConfig) -> Result<Self, SyncError> {
        let git = GitCommand::new(config.git_binary.clone());
        let mut registry = Self::new();
        registry.register(Arc::new(GitStrategy::new(git.clone())));
        registry.register(Arc::new(NpmStrategy::new(&config.npm.registry_url, git)?));
        Ok(registry)
    }

    /// Registers `strategy` under its own family, replacing any previous one.
    pub fn register(&mut self, strategy: Arc<dyn SyncStrategy>) {
        self.strategies.insert(strategy.family(), strategy);
    }

    /// Get the strategy for a family
    pub fn get(&self, family: Family) -> Result<Arc<dyn SyncStrategy>, SyncError> {
        self.strategies.get(&family).cloned().ok_or_else(|| {
            SyncError::storage(format!("no sync strategy registered for family '{family}'"))
        })
    }

    /// Registered families, sorted for stable ordering
    pub fn families(&self) -> Vec<Family> {
        let mut families: Vec<_> = self.strategies.keys().copied().collect();
        families.sort();
        families
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("families", &self.families())
            .finish()
    }
}
