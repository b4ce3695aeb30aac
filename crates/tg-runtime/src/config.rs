use std::fmt;

use serde::{Deserialize, Serialize};
use tg_index::{MAX_BLOCK_THREADS, TileConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Tasks run on a dedicated worker thread in submission order.
    #[default]
    Async,
    /// Tasks run on the submitting thread before `enqueue` returns.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub name: String,
    pub mode: QueueMode,
    pub tile: TileConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            mode: QueueMode::default(),
            tile: TileConfig::default(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn with_mode(mode: QueueMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "queue name must not be empty".to_string(),
            });
        }
        let tile = &self.tile;
        let blocks = [
            ("tile.flat_block", u64::from(tile.flat_block)),
            ("tile.small_flat_block", u64::from(tile.small_flat_block)),
            (
                "tile.block2",
                u64::from(tile.block2[0]) * u64::from(tile.block2[1]),
            ),
            (
                "tile.block3",
                u64::from(tile.block3[0]) * u64::from(tile.block3[1]) * u64::from(tile.block3[2]),
            ),
        ];
        for (field, threads) in blocks {
            if threads == 0 || threads > u64::from(MAX_BLOCK_THREADS) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{threads} threads per block is outside 1..={MAX_BLOCK_THREADS}"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse { message: String },
    Invalid { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { message } => write!(f, "queue config parse failure: {message}"),
            Self::Invalid { field, reason } => {
                write!(f, "queue config field {field} is invalid: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
