use std::path::PathBuf;

use serde::Deserialize;

use crate::error::AfError;
use crate::store::{default_store_path, StoreType};

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Default tracing filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub r#type: StoreType,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Record completed agent responses as `cache/<fingerprint>` aliases.
    #[serde(default = "default_persist")]
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persist: default_persist(),
        }
    }
}

fn default_persist() -> bool {
    true
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agentforum").join("config.toml"))
}

/// Loads the config file. A missing file yields the defaults.
pub fn load_config() -> Result<Config, AfError> {
    let Some(path) = config_path() else {
        return Ok(Config::default());
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e.into()),
    };

    parse_config(&content)
}

fn parse_config(content: &str) -> Result<Config, AfError> {
    Ok(toml::from_str(content)?)
}

pub fn resolve_store_config(
    config: &Config,
    cli_type: Option<StoreType>,
    cli_path: Option<PathBuf>,
) -> (StoreType, PathBuf) {
    let store_type = cli_type.unwrap_or(config.store.r#type);
    let store_path = cli_path
        .or_else(|| config.store.path.clone())
        .unwrap_or_else(default_store_path);

    (store_type, store_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.store.r#type, StoreType::Rocks);
        assert!(config.store.path.is_none());
        assert!(config.cache.persist);
    }

    #[test]
    fn full_file() {
        let config = parse_config(
            r#"
            log_level = "debug"
            [store]
            type = "memory"
            path = "/tmp/af"
            [cache]
            persist = false
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.store.r#type, StoreType::Memory);
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/af")));
        assert!(!config.cache.persist);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(matches!(parse_config("store = 3"), Err(AfError::Config(_))));
    }

    #[test]
    fn cli_overrides_file() {
        let config = parse_config("[store]\ntype = \"memory\"\npath = \"/from/file\"").unwrap();

        let (ty, path) = resolve_store_config(&config, None, None);
        assert_eq!(ty, StoreType::Memory);
        assert_eq!(path, PathBuf::from("/from/file"));

        let (ty, path) =
            resolve_store_config(&config, Some(StoreType::Rocks), Some("/from/cli".into()));
        assert_eq!(ty, StoreType::Rocks);
        assert_eq!(path, PathBuf::from("/from/cli"));
    }
}
