//! Kernel configuration loader.
//!
//! Reads `ironbatch.toml` from the data directory and deserializes it into
//! [`KernelConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use ironbatch_types::config::KernelConfig;

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "ironbatch.toml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "IRONBATCH_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `IRONBATCH_DATA_DIR` environment variable
/// 2. `~/.ironbatch`
/// 3. `.ironbatch` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".ironbatch");
    }
    PathBuf::from(".ironbatch")
}

/// Load kernel configuration from `{data_dir}/ironbatch.toml`.
///
/// - Missing file: [`KernelConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_kernel_config(data_dir: &Path) -> KernelConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no kernel config found, using defaults");
            return KernelConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read kernel config, using defaults");
            return KernelConfig::default();
        }
    };

    match toml::from_str::<KernelConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse kernel config, using defaults");
            KernelConfig::default()
        }
    }
}
