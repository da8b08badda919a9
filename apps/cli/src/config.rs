//! Stored engine settings (`config.json` in the data directory)

use crate::output::parse_size;
use anyhow::{anyhow, bail, Context, Result};
use chunkfetch_types::EngineConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Keys whose values accept size suffixes
const SIZE_KEYS: &[&str] = &["chunk_size", "speed_limit"];

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            path: data_dir.join(CONFIG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load stored settings, defaults when nothing is stored yet
    pub async fn load(&self) -> Result<EngineConfig> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(EngineConfig::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let config: EngineConfig =
            serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", self.path.display()))?;
        validate(&config).with_context(|| format!("Invalid config in {}", self.path.display()))?;
        Ok(config)
    }

    pub async fn save(&self, config: &EngineConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Value of a single setting
pub fn get_value(config: &EngineConfig, key: &str) -> Result<Value> {
    let value = serde_json::to_value(config)?;
    value
        .get(key)
        .cloned()
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))
}

/// Copy of `config` with `key` set from its textual form
pub fn set_value(config: &EngineConfig, key: &str, raw: &str) -> Result<EngineConfig> {
    let mut value = serde_json::to_value(config)?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("Config is not an object"))?;

    let parsed = match fields.get(key) {
        None => bail!("Unknown config key: {}", key),
        Some(Value::Number(_)) if SIZE_KEYS.contains(&key) => Value::from(parse_size(raw).map_err(|e| anyhow!(e))?),
        Some(Value::Number(_)) => Value::from(
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("{} expects a whole number", key))?,
        ),
        Some(_) => Value::from(raw),
    };
    fields.insert(key.to_string(), parsed);

    let updated: EngineConfig = serde_json::from_value(value)?;
    validate(&updated)?;
    Ok(updated)
}

fn validate(config: &EngineConfig) -> Result<()> {
    if config.chunk_size == 0 {
        bail!("chunk_size must be greater than 0");
    }
    if config.max_concurrent == 0 {
        bail!("max_concurrent must be at least 1");
    }
    Ok(())
}
