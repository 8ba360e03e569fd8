//! Configuration loader/writer plus strongly typed settings structures.
//!
//! Settings live in `~/.tagstream/{profile}/config.toml` (profile is the
//! character name, or `default`). The file is written from the embedded
//! defaults the first time it's needed; every field is optional on disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// Embed default configuration at compile time
const DEFAULT_CONFIG: &str = include_str!("../defaults/config.toml");

/// Top-level configuration object
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Limits and resync behavior for the stream parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Ceiling for the unconsumed tail carried between chunks (bytes)
    #[serde(default = "default_truncation_limit")]
    pub truncation_limit: usize,
    /// Ceiling for input held while waiting for a resync anchor (bytes)
    #[serde(default = "default_recovery_limit")]
    pub recovery_limit: usize,
    /// Literal markers where parsing may safely restart after malformed input
    #[serde(default = "default_resync_anchors")]
    pub resync_anchors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Messages kept per region channel before the oldest are pruned
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Also show region content (thoughts, speech, ...) in the main output
    #[serde(default)]
    pub mirror: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Tags that are published on the event bus as they're parsed
    #[serde(default = "default_publish_rules")]
    pub publish: Vec<PublishRule>,
}

/// Allow-list entry for event bus publication.
///
/// The event name is the tag name, suffixed with `:{value}` when
/// `key_attribute` is set and present on the tag (e.g. `progressBar:health`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRule {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_attribute: Option<String>,
}

impl PublishRule {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            key_attribute: None,
        }
    }

    pub fn keyed(tag: &str, key_attribute: &str) -> Self {
        Self {
            tag: tag.to_string(),
            key_attribute: Some(key_attribute.to_string()),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_truncation_limit() -> usize {
    10 * 1024
}

fn default_recovery_limit() -> usize {
    10 * 1024 * 1024
}

fn default_resync_anchors() -> Vec<String> {
    vec!["<prompt".to_string()]
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_publish_rules() -> Vec<PublishRule> {
    vec![
        PublishRule::new("left"),
        PublishRule::new("right"),
        PublishRule::new("spell"),
        PublishRule::keyed("progressBar", "id"),
        PublishRule::new("prompt"),
        PublishRule::new("nav"),
        PublishRule::new("compass"),
        PublishRule::new("streamWindow"),
        PublishRule::keyed("dialogData", "id"),
        PublishRule::new("pushStream"),
    ]
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            truncation_limit: default_truncation_limit(),
            recovery_limit: default_recovery_limit(),
            resync_anchors: default_resync_anchors(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            publish: default_publish_rules(),
        }
    }
}

impl Config {
    /// Load the profile config, writing the embedded defaults on first run
    pub fn load(character: Option<&str>) -> Result<Self> {
        let config_path = Self::config_path(character)?;

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create profile directory: {:?}", parent))?;
            }
            fs::write(&config_path, DEFAULT_CONFIG)
                .context(format!("Failed to write default config: {:?}", config_path))?;
            tracing::info!("Created default config at {:?}", config_path);
        }

        Self::load_from_file(&config_path)
    }

    /// Load a config file from an explicit path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        Self::parse(&contents).context(format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Base directory (~/.tagstream), overridable with TAGSTREAM_DIR
    pub fn base_dir() -> Result<PathBuf> {
        if let Ok(custom_dir) = std::env::var("TAGSTREAM_DIR") {
            return Ok(PathBuf::from(custom_dir));
        }

        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".tagstream"))
    }

    /// Returns: ~/.tagstream/{character}/config.toml or ~/.tagstream/default/config.toml
    pub fn config_path(character: Option<&str>) -> Result<PathBuf> {
        let profile_name = character.unwrap_or("default");
        Ok(Self::base_dir()?.join(profile_name).join("config.toml"))
    }
}
