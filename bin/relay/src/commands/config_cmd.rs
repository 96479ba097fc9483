use std::path::PathBuf;

use super::load_config;

fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{}***", visible)
}

/// Show the effective configuration as pretty-printed JSON.
pub async fn show(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (_paths, mut config, config_file) = load_config(config_path)?;
    config.llm.api_key = mask_secret(&config.llm.api_key);
    if let Some(password) = config.auth.default_password.as_mut() {
        *password = "***".to_string();
    }

    println!();
    println!("📋 Current Configuration");
    println!(
        "  File: {}{}",
        config_file.display(),
        if config_file.exists() { "" } else { " (not found, showing defaults)" }
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("sk-abcdef"), "sk-a***");
        assert_eq!(mask_secret("ab"), "ab***");
    }
}
