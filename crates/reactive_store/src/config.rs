use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mutex_box::LockMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)] // if we add new fields, give them default values when deserializing old configs
pub struct StoreConfig {
    /// Used to label log output and the store's internal queues.
    pub name: Option<String>,
    pub lock_mode: LockMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: None,
            lock_mode: LockMode::Exclusive,
        }
    }
}

impl StoreConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.name {
            Some(name) if name.trim().is_empty() => Err(ConfigError::BlankName),
            _ => Ok(()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("store")
    }
}
