//! Configuration for the crawling engine.
//!
//! A single JSON document with four recognised groups: `elasticsearch`,
//! `browser`, `embedder` and `llm`. Binaries usually embed the document
//! with `include_bytes!` and hand it to [`Config::from_json`].

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to resolve user data dir {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },
}

/// Search backend endpoint and credentials.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EsConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub address: String,
}

/// Browser launcher and viewport options.
///
/// `basic_remote_debugging_port` is the port of instance 0; instance `i`
/// listens on `basic_remote_debugging_port + i` with its own data dir
/// `<user_data_dir>/instance_<i>`.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserOptions {
    /// Explicit Chrome binary path. Empty means probe well-known locations.
    #[serde(default)]
    pub bin: String,
    pub user_data_dir: PathBuf,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub disable_blink_features: String,
    #[serde(default)]
    pub incognito: bool,
    #[serde(default)]
    pub disable_dev_shm_usage: bool,
    #[serde(default)]
    pub no_sandbox: bool,
    #[serde(default)]
    pub user_agent: String,
    /// Kill the Chrome subprocess when its handle is dropped.
    #[serde(default = "default_true")]
    pub leakless: bool,
    #[serde(default = "default_debug_port")]
    pub basic_remote_debugging_port: u16,
    #[serde(default = "default_page_width")]
    pub default_page_width: u32,
    #[serde(default = "default_page_height")]
    pub default_page_height: u32,
    #[serde(default)]
    pub disable_background_networking: bool,
    #[serde(default)]
    pub disable_background_timer_throttling: bool,
    /// Verbose logging of CDP handler traffic.
    #[serde(default)]
    pub trace: bool,
    /// JavaScript evaluated on every fresh page before first navigation.
    #[serde(default)]
    pub page_init_script: Option<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            bin: String::new(),
            user_data_dir: PathBuf::from("browser-data"),
            headless: true,
            disable_blink_features: String::new(),
            incognito: false,
            disable_dev_shm_usage: false,
            no_sandbox: false,
            user_agent: String::new(),
            leakless: true,
            basic_remote_debugging_port: default_debug_port(),
            default_page_width: default_page_width(),
            default_page_height: default_page_height(),
            disable_background_networking: false,
            disable_background_timer_throttling: false,
            trace: false,
            page_init_script: None,
        }
    }
}

fn default_headless() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_debug_port() -> u16 {
    9222
}

fn default_page_width() -> u32 {
    1280
}

fn default_page_height() -> u32 {
    800
}

/// Embedding provider endpoint and batch size.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbedderConfig {
    pub host: String,
    pub port: u16,
    pub model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl EmbedderConfig {
    /// Base URL of the provider, e.g. `http://localhost:11434`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_batch_size() -> usize {
    16
}

/// Chat model endpoint for the downstream retrieval agent. Parsed for
/// completeness; the crawling core never reads it.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub elasticsearch: EsConfig,
    pub browser: BrowserOptions,
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    /// Read and parse a config file from disk.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    /// Parse a JSON config document and resolve the browser data dir to an
    /// absolute path. Both failures are fatal at startup.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let mut cfg: Config = serde_json::from_slice(bytes)?;
        if cfg.browser.user_data_dir.is_relative() {
            cfg.browser.user_data_dir = std::path::absolute(&cfg.browser.user_data_dir).map_err(
                |source| ConfigError::DataDir {
                    path: cfg.browser.user_data_dir.display().to_string(),
                    source,
                },
            )?;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "elasticsearch": {
            "username": "elastic",
            "password": "changeme",
            "address": "https://localhost:9200"
        },
        "browser": {
            "bin": "",
            "user_data_dir": "browser-data",
            "headless": true,
            "no_sandbox": true,
            "user_agent": "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
            "basic_remote_debugging_port": 9301,
            "default_page_width": 1440,
            "default_page_height": 900
        },
        "embedder": {
            "host": "http://localhost",
            "port": 11434,
            "model": "nomic-embed-text",
            "batch_size": 8
        },
        "llm": {
            "host": "http://localhost",
            "port": 11434,
            "model": "qwen2.5"
        }
    }"#;

    #[test]
    fn parses_all_groups() {
        let cfg = Config::from_json(SAMPLE.as_bytes()).unwrap();
        assert_eq!(cfg.elasticsearch.address, "https://localhost:9200");
        assert!(cfg.browser.headless);
        assert!(cfg.browser.no_sandbox);
        assert_eq!(cfg.browser.basic_remote_debugging_port, 9301);
        assert_eq!(cfg.embedder.batch_size, 8);
        assert_eq!(cfg.embedder.endpoint(), "http://localhost:11434");
        assert_eq!(cfg.llm.model, "qwen2.5");
    }

    #[test]
    fn resolves_relative_data_dir() {
        let cfg = Config::from_json(SAMPLE.as_bytes()).unwrap();
        assert!(cfg.browser.user_data_dir.is_absolute());
        assert!(cfg
            .browser
            .user_data_dir
            .to_string_lossy()
            .ends_with("browser-data"));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let minimal = r#"{
            "elasticsearch": { "address": "http://localhost:9200" },
            "browser": { "user_data_dir": "/tmp/nh" },
            "embedder": { "host": "http://localhost", "port": 11434, "model": "m" }
        }"#;
        let cfg = Config::from_json(minimal.as_bytes()).unwrap();
        assert!(cfg.browser.headless);
        assert!(cfg.browser.leakless);
        assert_eq!(cfg.browser.default_page_width, 1280);
        assert_eq!(cfg.embedder.batch_size, 16);
        assert_eq!(cfg.llm.host, "");
    }

    #[test]
    fn malformed_config_is_fatal() {
        assert!(Config::from_json(b"{ not json").is_err());
        assert!(Config::from_json(b"{}").is_err());
    }
}
