//! CLI configuration (~/.actiontoken/config.toml)
//!
//! ```toml
//! database = "/var/lib/actiontoken/grants.db"
//! default_lifetime_secs = 86400
//!
//! [[types]]
//! name = "app.Doc"
//! attributes = ["title", "body"]
//! ```

use actiontoken_core::{StaticTypeRegistry, TokenLifecycle, TypeDescriptor};
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub database: Option<PathBuf>,
    pub default_lifetime_secs: Option<u64>,
    pub types: Vec<TypeDescriptor>,
}

impl Settings {
    /// Missing file means defaults and no registered types
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".actiontoken").join("config.toml"))
    }

    pub fn lifecycle(&self) -> anyhow::Result<TokenLifecycle> {
        match self.default_lifetime_secs {
            Some(secs) => lifecycle_for(secs),
            None => Ok(TokenLifecycle::default()),
        }
    }

    pub fn registry(&self) -> anyhow::Result<StaticTypeRegistry> {
        StaticTypeRegistry::from_descriptors(self.types.iter().cloned())
            .context("Invalid type in config")
    }
}

pub fn lifecycle_for(secs: u64) -> anyhow::Result<TokenLifecycle> {
    let lifetime = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("Token lifetime of {} seconds is out of range", secs))?;
    Ok(TokenLifecycle::new(lifetime))
}
