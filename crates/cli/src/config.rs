use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use frameloop_tasks::ManagerConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cli::CliArgs;

/// CLI configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Run the loop on a background thread
    #[serde(default)]
    pub threaded: bool,

    /// Seconds between heartbeat log lines
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: f64,

    /// Stop after this many cycles
    #[serde(default)]
    pub max_cycles: Option<u64>,

    /// Stop after this many seconds
    #[serde(default)]
    pub max_duration_secs: Option<f64>,

    /// Task manager settings
    #[serde(default)]
    pub manager: ManagerConfig,
}

fn default_heartbeat_secs() -> f64 {
    1.0
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            threaded: false,
            heartbeat_secs: default_heartbeat_secs(),
            max_cycles: None,
            max_duration_secs: None,
            manager: ManagerConfig::default(),
        }
    }
}

impl CliConfig {
    /// Return the default config directory path: ~/.config/frameloop/
    pub fn default_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("frameloop");
        Ok(config_dir)
    }

    /// Return the default config file path.
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load config from the given path, or the default path.
    /// Returns default config if the file does not exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            debug!(?config_path, "Loading config");
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config: {}", config_path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("failed to parse config: {}", config_path.display()))?;
            Ok(config)
        } else {
            debug!(?config_path, "Config file not found, using defaults");
            let config = Self::default();
            // Create directory and write default config
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let toml_str = toml::to_string_pretty(&config)
                .context("failed to serialize default config")?;
            std::fs::write(&config_path, toml_str).ok();
            Ok(config)
        }
    }

    /// Overlay command-line arguments. Arguments win over the file.
    pub fn apply_args(&mut self, args: &CliArgs) {
        if args.threaded {
            self.threaded = true;
        }
        if let Some(ms) = args.idle_sleep_ms {
            self.manager.idle_sleep_ms = ms;
        }
        if let Some(secs) = args.heartbeat_secs {
            self.heartbeat_secs = secs;
        }
        if args.cycles.is_some() {
            self.max_cycles = args.cycles;
        }
        if args.duration_secs.is_some() {
            self.max_duration_secs = args.duration_secs;
        }
    }

    pub fn heartbeat(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.heartbeat_secs)
            .with_context(|| format!("invalid heartbeat_secs: {}", self.heartbeat_secs))
    }

    pub fn max_duration(&self) -> Result<Option<Duration>> {
        self.max_duration_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid max_duration_secs: {}", secs))
            })
            .transpose()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        info!("Config loaded:");
        info!("  loop:      threaded={}, idle_sleep_ms={}", self.threaded, self.manager.idle_sleep_ms);
        info!("  heartbeat: every {}s", self.heartbeat_secs);
        info!(
            "  limits:    cycles={}, duration={}",
            self.max_cycles.map(|c| c.to_string()).as_deref().unwrap_or("(none)"),
            self.max_duration_secs.map(|s| format!("{}s", s)).as_deref().unwrap_or("(none)")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert!(!config.threaded);
        assert_eq!(config.heartbeat().unwrap(), Duration::from_secs(1));
        assert_eq!(config.max_duration().unwrap(), None);
        assert_eq!(config.manager, ManagerConfig::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = CliConfig::default();
        config.max_cycles = Some(10);
        config.manager.idle_sleep_ms = 2;
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: CliConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = CliConfig::load(path.to_str()).unwrap();
        assert_eq!(config, CliConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "threaded = true\n\n[manager]\nidle_sleep_ms = 3\n").unwrap();

        let config = CliConfig::load(path.to_str()).unwrap();
        assert!(config.threaded);
        assert_eq!(config.manager.idle_sleep_ms, 3);
        assert_eq!(config.heartbeat_secs, 1.0);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "threaded = \"maybe\"").unwrap();
        assert!(CliConfig::load(path.to_str()).is_err());
    }

    #[test]
    fn test_args_override_file() {
        let mut config = CliConfig::default();
        let args = CliArgs {
            threaded: true,
            idle_sleep_ms: Some(7),
            heartbeat_secs: Some(0.25),
            cycles: Some(100),
            ..CliArgs::default()
        };
        config.apply_args(&args);
        assert!(config.threaded);
        assert_eq!(config.manager.idle_sleep_ms, 7);
        assert_eq!(config.heartbeat().unwrap(), Duration::from_millis(250));
        assert_eq!(config.max_cycles, Some(100));
        assert_eq!(config.max_duration_secs, None);
    }

    #[test]
    fn test_negative_heartbeat_is_rejected() {
        let config = CliConfig {
            heartbeat_secs: -1.0,
            ..CliConfig::default()
        };
        assert!(config.heartbeat().is_err());
    }
}
