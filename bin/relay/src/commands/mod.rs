pub mod agent;
pub mod config_cmd;
pub mod serve;
pub mod user;

use relay_core::{Config, Paths};
use std::path::PathBuf;

/// Resolve paths and load the config from `--config` or the default
/// location, with environment overrides applied. Returns the file the
/// config should be saved back to.
pub fn load_config(config_path: Option<PathBuf>) -> anyhow::Result<(Paths, Config, PathBuf)> {
    let paths = Paths::new();
    let config_file = config_path.unwrap_or_else(|| paths.config_file());
    let mut config = if config_file.exists() {
        Config::load(&config_file)?
    } else {
        Config::default()
    };
    config.apply_env();
    Ok((paths, config, config_file))
}
