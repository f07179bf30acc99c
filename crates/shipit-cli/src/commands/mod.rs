//! CLI command implementations.

pub mod monitor;
pub mod status;
pub mod submit;
pub mod worker;

use anyhow::Result;
use std::path::Path;

/// Parse a `KEY=VALUE` build environment argument.
pub fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Join an API path onto the server URL.
pub fn endpoint(api_url: &str, path: &str) -> Result<url::Url> {
    let base = url::Url::parse(api_url)?;
    Ok(base.join(path)?)
}

pub fn validate(path: &Path) -> Result<()> {
    match shipit_config::load_system_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  database: {:?}", config.database.backend);
            println!("  bus:      {:?}", config.bus.backend);
            println!("  launcher: {:?}", config.launcher.backend);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
