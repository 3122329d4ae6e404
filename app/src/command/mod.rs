//! Static strategy pattern for CLI commands.
//!
//! Each command is a separate strategy with its own input type, dispatched
//! statically from `main`.

use std::sync::Arc;

use tether_config::Config;
use tether_core::KvStore;
use tether_runtime::RuntimeConfig;
use tether_store::DatabaseKvStore;
use tracing::info;

mod history;
mod info;
mod init;
mod key;
mod version;

pub use history::{HistoryInput, HistoryStrategy};
pub use info::InfoStrategy;
pub use init::InitStrategy;
pub use key::{KeyInput, KeyStrategy};
pub use version::VersionStrategy;

/// Open the configured durable store.
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    info!("Connecting to store");
    let store = DatabaseKvStore::connect(&config.store.url).await?;
    Ok(Arc::new(store))
}

/// Engine settings from the loaded config.
fn runtime_config(config: &Config) -> RuntimeConfig {
    RuntimeConfig {
        inference_timeout: config.runtime.inference_timeout(),
        max_tool_rounds: config.runtime.max_tool_rounds,
        output_buffer: config.runtime.output_buffer,
        reconcile: config.reconcile.clone(),
    }
}

/// Shorten `s` to at most `max_chars` characters, marking the cut.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Contract for all command strategies.
///
/// Each strategy defines its own input type through the associated type, so
/// adding a command only requires implementing this trait.
pub trait CommandStrategy: Send + Sync + 'static {
    type Input;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_follows_file() {
        let mut config = Config::default();
        config.runtime.inference_timeout_secs = 1.5;
        config.runtime.max_tool_rounds = 3;
        config.reconcile.dedup_window = 4;

        let runtime = runtime_config(&config);
        assert_eq!(runtime.inference_timeout, std::time::Duration::from_millis(1500));
        assert_eq!(runtime.max_tool_rounds, 3);
        assert_eq!(runtime.output_buffer, 64);
        assert_eq!(runtime.reconcile.dedup_window, 4);
    }

    #[test]
    fn test_truncate_keeps_short_text() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }
}
