//! Daemon settings: where the binding file lives and how often it is polled

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::reload::{DEFAULT_POLL_MS, MIN_POLL_MS};

/// Environment variable overriding the binding file path
pub const CONFIG_ENV: &str = "AUTOFIRE_CONFIG";

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// JSON file holding the slot list
    pub binding_file: PathBuf,

    /// Hot-reload poll interval, never below 100ms
    pub poll_interval: Duration,
}

impl Settings {
    /// Load settings from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(Self::resolve(&home, std::env::var(CONFIG_ENV).ok()))
    }

    fn resolve(home: &str, config_override: Option<String>) -> Self {
        let data_dir = PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("autofire");

        let binding_file = match config_override {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => data_dir.join("autofire.json"),
        };

        Self {
            data_dir,
            binding_file,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }

    /// Apply command-line overrides on top of the environment
    pub fn with_overrides(mut self, binding_file: Option<PathBuf>, poll_ms: Option<u64>) -> Self {
        if let Some(path) = binding_file {
            self.binding_file = path;
        }
        if let Some(ms) = poll_ms {
            self.poll_interval = Duration::from_millis(ms.max(MIN_POLL_MS));
        }
        self
    }

    /// Ensure the binding file's directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = self
            .binding_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(&self.data_dir);
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_under_home() {
        let settings = Settings::resolve("/home/player", None);
        assert_eq!(settings.data_dir, PathBuf::from("/home/player/.local/share/autofire"));
        assert_eq!(
            settings.binding_file,
            PathBuf::from("/home/player/.local/share/autofire/autofire.json")
        );
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_env_then_cli_override() {
        let settings = Settings::resolve("/home/player", Some("/tmp/env.json".to_string()));
        assert_eq!(settings.binding_file, PathBuf::from("/tmp/env.json"));

        let settings = settings.with_overrides(Some(PathBuf::from("/tmp/cli.json")), Some(20));
        assert_eq!(settings.binding_file, PathBuf::from("/tmp/cli.json"));
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_blank_env_override_is_ignored() {
        let settings = Settings::resolve("/home/player", Some("  ".to_string()));
        assert!(settings.binding_file.ends_with("autofire/autofire.json"));
    }

    #[test]
    fn test_ensure_dirs_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::resolve(dir.path().to_str().unwrap(), None);
        settings.ensure_dirs().unwrap();
        assert!(settings.data_dir.is_dir());
    }
}
