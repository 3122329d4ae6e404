use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_conversation::ReconcileConfig;
use tracing::{debug, warn};

const CONFIG_DIR: &str = "tether";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
        }
    }
}

impl StoreConfig {
    fn default_url() -> String {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR);
        format!("sqlite://{}/tether.db?mode=rwc", dir.display())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RuntimeSection {
    pub inference_timeout_secs: f64,
    pub max_tool_rounds: usize,
    pub output_buffer: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            inference_timeout_secs: 300.0,
            max_tool_rounds: 8,
            output_buffer: 64,
        }
    }
}

impl RuntimeSection {
    /// Non-positive or non-finite values fall back to the default.
    #[must_use]
    pub fn inference_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.inference_timeout_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| {
                warn!(
                    "Invalid inference_timeout_secs {}, using default",
                    self.inference_timeout_secs
                );
                Duration::from_secs_f64(Self::default().inference_timeout_secs)
            })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Config {
    /// Load `~/tether/config.json` and apply `TETHER_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_dir()?.join(CONFIG_FILE);

        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found at: {}. Please run 'tether init' to create config.",
                config_path.display()
            );
        }

        let mut config = Self::from_path(&config_path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `TETHER_STORE_URL`, `TETHER_INFERENCE_TIMEOUT` and `TETHER_LOG`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TETHER_STORE_URL") {
            self.store.url = url;
        }
        if let Some(raw) = lookup("TETHER_INFERENCE_TIMEOUT") {
            match raw.trim().parse::<f64>() {
                Ok(secs) => self.runtime.inference_timeout_secs = secs,
                Err(e) => warn!("Ignoring TETHER_INFERENCE_TIMEOUT={}: {}", raw, e),
            }
        }
        if let Some(level) = lookup("TETHER_LOG") {
            self.logging.level = level;
        }
    }

    fn config_dir() -> anyhow::Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join(CONFIG_DIR))
    }

    pub fn ensure_config_dir() -> anyhow::Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    pub fn create_config() -> anyhow::Result<()> {
        let config_dir = Self::ensure_config_dir()?;
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            anyhow::bail!(
                "Config file already exists at: {}. Please edit it directly.",
                config_path.display()
            );
        }

        let config_template = Self::template(&config_dir);
        std::fs::write(&config_path, config_template)?;

        println!("✅ Created config file at: {}", config_path.display());
        println!();
        println!("📝 Next steps:");
        println!("   1. Point store.url at the database to keep conversations in");
        println!("   2. Run 'tether info' to check the store connection");
        println!("   3. Run 'tether history --conversation <id>' to inspect a conversation");
        println!();
        println!("🔧 Configuration options:");
        println!("   - runtime.inference_timeout_secs: Upper bound for one model call");
        println!("   - reconcile.include_trace_records: Re-admit llm_call traces into context");
        println!("   - reconcile.dedup_window: How far back repeated messages are dropped");
        println!();
        Ok(())
    }

    fn template(config_dir: &Path) -> String {
        format!(
            r#"{{
  "store": {{
    "url": "sqlite://{}/tether.db?mode=rwc"
  }},
  "runtime": {{
    "inference_timeout_secs": 300,
    "max_tool_rounds": 8,
    "output_buffer": 64
  }},
  "reconcile": {{
    "include_trace_records": false,
    "dedup_window": 1
  }},
  "logging": {{
    "level": "info"
  }}
}}
"#,
            config_dir.display()
        )
    }
}
