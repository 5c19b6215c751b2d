// src/config.rs

//! Configuration for pndstore
//!
//! A small TOML file supplies the repository list, locale preferences,
//! local search path and store location:
//!
//! ```toml
//! database = "/media/sd1/pandora/appdata/pndstore/app.db"
//! repositories = ["http://repo.openpandora.org/includes/get_data.php"]
//! locales = ["de_DE", "en_US"]
//! searchpath = ["/media/*/pandora/apps", "/media/*/pandora/desktop"]
//! timeout_secs = 30
//! ```
//!
//! Missing keys fall back to [`Config::default`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default repository
pub const DEFAULT_REPOSITORY: &str = "http://repo.openpandora.org/includes/get_data.php";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite metadata store
    pub database: PathBuf,
    /// Repository URLs; earlier entries win version ties
    pub repositories: Vec<String>,
    /// Locale preferences, most preferred first
    pub locales: Vec<String>,
    /// Glob patterns of directories holding installed packages
    pub searchpath: Vec<String>,
    /// Timeout for every network transfer
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("pndstore.db"),
            repositories: vec![DEFAULT_REPOSITORY.to_string()],
            locales: vec!["en_US".to_string()],
            searchpath: vec![
                "/media/*/pandora/apps".to_string(),
                "/media/*/pandora/desktop".to_string(),
                "/media/*/pandora/menu".to_string(),
                "/usr/pandora/apps".to_string(),
            ],
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| match e {
            Error::ConfigError(msg) => Error::ConfigError(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.locales.is_empty() {
            return Err(Error::ConfigError(
                "At least one locale preference is required".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::ConfigError("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Database path as a string, for the `db` functions
    pub fn database_str(&self) -> Result<&str> {
        self.database.to_str().ok_or_else(|| {
            Error::ConfigError(format!(
                "Database path is not valid UTF-8: {}",
                self.database.display()
            ))
        })
    }
}

/// Expand glob patterns into existing, canonical directories
///
/// Order follows the patterns; a directory matched twice appears once.
pub fn expand_search_paths(patterns: &[String]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut locations = Vec::new();

    for pattern in patterns {
        let paths = match glob::glob(pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Invalid search path pattern {}: {}", pattern, e);
                continue;
            }
        };

        for entry in paths {
            match entry {
                Ok(path) if path.is_dir() => {
                    let path = path.canonicalize().unwrap_or(path);
                    if seen.insert(path.clone()) {
                        locations.push(path);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Could not read search path entry: {}", e),
            }
        }
    }

    locations
}
