//! Store configuration.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::env;

/// Default number of backward checkpoints retained.
pub const DEFAULT_CHECKPOINT_SIZE: usize = 100;

/// Configuration shared by a store and the components built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Whether `add_row` reuses the ids of deleted rows
    pub reuse_row_ids: bool,
    /// Seed for a mergeable store's clock id (random when absent)
    pub unique_id: Option<String>,
    /// Backward checkpoints retained by `Checkpoints`
    pub checkpoint_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            reuse_row_ids: true,
            unique_id: None,
            checkpoint_size: DEFAULT_CHECKPOINT_SIZE,
        }
    }
}

impl StoreConfig {
    /// Builder-style setter for `reuse_row_ids`.
    pub fn with_reuse_row_ids(mut self, reuse: bool) -> Self {
        self.reuse_row_ids = reuse;
        self
    }

    /// Builder-style setter for `unique_id`.
    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    /// Builder-style setter for `checkpoint_size`.
    pub fn with_checkpoint_size(mut self, size: usize) -> Self {
        self.checkpoint_size = size;
        self
    }

    /// Parse configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(reuse) = env::var("CELLAR_REUSE_ROW_IDS") {
            config.reuse_row_ids = reuse
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("CELLAR_REUSE_ROW_IDS={reuse}")))?;
        }

        config.unique_id = env::var("CELLAR_UNIQUE_ID").ok();

        if let Ok(size) = env::var("CELLAR_CHECKPOINT_SIZE") {
            config.checkpoint_size = size
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("CELLAR_CHECKPOINT_SIZE={size}")))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert!(config.reuse_row_ids);
        assert_eq!(config.unique_id, None);
        assert_eq!(config.checkpoint_size, DEFAULT_CHECKPOINT_SIZE);
    }

    #[test]
    fn from_json_fills_defaults() {
        let config = StoreConfig::from_json(r#"{"uniqueId": "replica-a"}"#).unwrap();
        assert_eq!(config.unique_id.as_deref(), Some("replica-a"));
        assert!(config.reuse_row_ids);
        assert_eq!(config.checkpoint_size, DEFAULT_CHECKPOINT_SIZE);
    }

    #[test]
    fn from_json_rejects_garbage() {
        let result = StoreConfig::from_json(r#"{"checkpointSize": "many"}"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn builder() {
        let config = StoreConfig::default()
            .with_reuse_row_ids(false)
            .with_unique_id("node-1")
            .with_checkpoint_size(3);
        assert!(!config.reuse_row_ids);
        assert_eq!(config.unique_id.as_deref(), Some("node-1"));
        assert_eq!(config.checkpoint_size, 3);
    }

    #[test]
    fn serialization_format() {
        let json = serde_json::to_string(&StoreConfig::default()).unwrap();
        assert!(json.contains("reuseRowIds"));
        assert!(json.contains("checkpointSize"));
    }
}
