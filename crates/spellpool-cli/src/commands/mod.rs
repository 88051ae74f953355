use std::path::Path;

use anyhow::Context;
use spellpool_core::{LoadProfile, PoolConfig};

pub mod config;
pub mod run;

/// Load the config file (or defaults), apply a profile, and normalize.
pub fn load_config(path: Option<&Path>, profile: Option<&str>) -> anyhow::Result<PoolConfig> {
    let mut config = match path {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PoolConfig::default(),
    };
    if let Some(name) = profile {
        let profile: LoadProfile = name.parse()?;
        config.apply_profile(profile);
    }
    let config = config.normalized();
    config.validate()?;
    Ok(config)
}
