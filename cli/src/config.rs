// Configuration management for the ghostrelay CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/ghostrelay/config.json
// - Linux: ~/.config/ghostrelay/config.json
// - Windows: %APPDATA%\ghostrelay\config.json
//
// Environment variables override the file; command-line flags override both.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory server listen port
    pub port: u16,

    /// Region recorded for nodes that register without one
    pub default_region: String,

    /// Tokens accepted at registration
    pub access_tokens: Vec<String>,

    /// Accept any token when `access_tokens` is empty
    pub open_access: bool,

    /// Seconds of silence before a node is evicted
    pub node_timeout_secs: u64,

    /// Seconds between liveness sweeps
    pub sweep_interval_secs: u64,

    /// Storage path for sessions and chunks
    pub data_dir: Option<String>,

    /// Settings for `ghostrelay node`
    pub node: NodeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub node_id: Option<String>,
    pub wallet_address: Option<String>,
    pub region: String,
    pub signaling_server: String,
    pub access_token: Option<String>,
    pub heartbeat_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            default_region: "unknown".to_string(),
            access_tokens: Vec::new(),
            open_access: true,
            node_timeout_secs: 60,
            sweep_interval_secs: 30,
            data_dir: None,
            node: NodeSettings::default(),
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            wallet_address: None,
            region: "unknown".to_string(),
            signaling_server: "ws://localhost:8080/ws".to_string(),
            access_token: None,
            heartbeat_secs: 30,
        }
    }
}

/// Parse a duration in seconds, refusing zero
fn positive_secs(key: &str, value: &str) -> Result<u64> {
    let secs: u64 = value.parse().context("Invalid number")?;
    if secs == 0 {
        anyhow::bail!("{} must be at least 1 second", key);
    }
    Ok(secs)
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("ghostrelay");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Default data directory (cross-platform)
    pub fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("ghostrelay");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .validate()
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply `PORT`, `NODE_ID`, `NODE_REGION`, `SIGNALING_SERVER` and
    /// `WALLET_ADDRESS` from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = port.parse().context("Invalid PORT")?;
        }
        if let Some(node_id) = lookup("NODE_ID") {
            self.node.node_id = optional(&node_id);
        }
        if let Some(region) = lookup("NODE_REGION") {
            self.node.region = region;
        }
        if let Some(server) = lookup("SIGNALING_SERVER") {
            self.node.signaling_server = server;
        }
        if let Some(wallet) = lookup("WALLET_ADDRESS") {
            self.node.wallet_address = optional(&wallet);
        }
        Ok(())
    }

    /// Set a config value in memory
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "port" => {
                self.port = value.parse().context("Invalid port number")?;
            }
            "default_region" => self.default_region = value.to_string(),
            "access_tokens" => {
                self.access_tokens = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "open_access" => {
                self.open_access = value.parse().context("Invalid boolean value")?;
            }
            "node_timeout_secs" => {
                self.node_timeout_secs = positive_secs(key, value)?;
            }
            "sweep_interval_secs" => {
                self.sweep_interval_secs = positive_secs(key, value)?;
            }
            "data_dir" => self.data_dir = optional(value),
            "node.node_id" => self.node.node_id = optional(value),
            "node.wallet_address" => self.node.wallet_address = optional(value),
            "node.region" => self.node.region = value.to_string(),
            "node.signaling_server" => self.node.signaling_server = value.to_string(),
            "node.access_token" => self.node.access_token = optional(value),
            "node.heartbeat_secs" => {
                self.node.heartbeat_secs = positive_secs(key, value)?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Reject timing values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        for (key, secs) in [
            ("node_timeout_secs", self.node_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("node.heartbeat_secs", self.node.heartbeat_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be at least 1 second", key);
            }
        }
        Ok(())
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_value(key, value)?;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "port" => Some(self.port.to_string()),
            "default_region" => Some(self.default_region.clone()),
            "access_tokens" => Some(self.access_tokens.join(",")),
            "open_access" => Some(self.open_access.to_string()),
            "node_timeout_secs" => Some(self.node_timeout_secs.to_string()),
            "sweep_interval_secs" => Some(self.sweep_interval_secs.to_string()),
            "data_dir" => self.data_dir.clone(),
            "node.node_id" => self.node.node_id.clone(),
            "node.wallet_address" => self.node.wallet_address.clone(),
            "node.region" => Some(self.node.region.clone()),
            "node.signaling_server" => Some(self.node.signaling_server.clone()),
            "node.access_token" => self.node.access_token.clone(),
            "node.heartbeat_secs" => Some(self.node.heartbeat_secs.to_string()),
            _ => None,
        }
    }

    /// List all config values. Tokens are not printed.
    pub fn list(&self) -> Vec<(String, String)> {
        let unset = || "(unset)".to_string();
        vec![
            ("port".to_string(), self.port.to_string()),
            ("default_region".to_string(), self.default_region.clone()),
            (
                "access_tokens".to_string(),
                format!("{} configured", self.access_tokens.len()),
            ),
            ("open_access".to_string(), self.open_access.to_string()),
            (
                "node_timeout_secs".to_string(),
                format!("{}s", self.node_timeout_secs),
            ),
            (
                "sweep_interval_secs".to_string(),
                format!("{}s", self.sweep_interval_secs),
            ),
            (
                "data_dir".to_string(),
                self.data_dir.clone().unwrap_or_else(|| "(memory)".to_string()),
            ),
            (
                "node.node_id".to_string(),
                self.node.node_id.clone().unwrap_or_else(unset),
            ),
            (
                "node.wallet_address".to_string(),
                self.node.wallet_address.clone().unwrap_or_else(unset),
            ),
            ("node.region".to_string(), self.node.region.clone()),
            (
                "node.signaling_server".to_string(),
                self.node.signaling_server.clone(),
            ),
            (
                "node.access_token".to_string(),
                if self.node.access_token.is_some() {
                    "(set)".to_string()
                } else {
                    unset()
                },
            ),
            (
                "node.heartbeat_secs".to_string(),
                format!("{}s", self.node.heartbeat_secs),
            ),
        ]
    }
}
