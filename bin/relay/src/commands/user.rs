use relay_storage::Store;
use std::path::PathBuf;

use super::load_config;

fn open_store(config_path: Option<PathBuf>) -> anyhow::Result<Store> {
    let (paths, _config, _) = load_config(config_path)?;
    paths.ensure_dirs()?;
    Ok(Store::open(&paths.database_file())?)
}

pub async fn add(config_path: Option<PathBuf>, username: &str, password: &str) -> anyhow::Result<()> {
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    let store = open_store(config_path)?;
    let id = store.create_user(username, password)?;
    println!("✓ Created user '{}' (id {})", username, id);
    Ok(())
}

pub async fn passwd(config_path: Option<PathBuf>, username: &str, password: &str) -> anyhow::Result<()> {
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    let store = open_store(config_path)?;
    store.set_password(username, password)?;
    println!("✓ Password updated for '{}'", username);
    Ok(())
}
