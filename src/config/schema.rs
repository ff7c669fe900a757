//! Configuration schema for stagebuild
//!
//! Configuration is stored at `~/.config/stagebuild/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Build settings
    pub build: BuildConfig,

    /// Stage cache settings
    pub cache: CacheConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Cache and build directories; relative paths are taken from the manifest directory
    pub state_dir: PathBuf,

    /// Shell used to run build and cleanup commands
    pub shell: String,

    /// Keep per-module build directories after a successful build
    pub keep_build_dirs: bool,

    /// Architecture to build for (default: host architecture)
    pub arch: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".stagebuild"),
            shell: "/bin/sh".to_string(),
            keep_build_dirs: false,
            arch: None,
        }
    }
}

/// Stage cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Use cached stages (false rebuilds everything but still fills the cache)
    pub enabled: bool,

    /// Collect garbage after each successful build
    pub gc: bool,

    /// Delete branches of other manifests and architectures during collection
    pub prune_other_branches: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gc: true,
            prune_other_branches: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[build]"));
        assert!(toml.contains("[cache]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.build.state_dir, PathBuf::from(".stagebuild"));
        assert!(config.cache.enabled);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            prune_other_branches = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.cache.prune_other_branches);
        assert!(config.cache.gc); // default preserved
        assert_eq!(config.build.shell, "/bin/sh");
    }
}
