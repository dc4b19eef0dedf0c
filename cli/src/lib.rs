pub mod exec_cmd;
pub mod logging;
pub mod run_cmd;

use std::path::Path;

use anyhow::Context;
use intrusion_core::Config;
use intrusion_core::ConfigOverrides;

/// Loads `.env` from the working directory when present, then the config
/// file (explicit path or the default location) with `overrides` applied.
pub fn load_config(config_path: Option<&Path>, overrides: ConfigOverrides) -> anyhow::Result<Config> {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(err) if err.not_found() => {}
        Err(err) => tracing::warn!(error = %err, "failed to load .env"),
    }
    Config::load_with_cli_overrides(config_path, overrides)
        .context("failed to load configuration")
}
