//! Configuration: an optional TOML file plus environment variable overrides.
//!
//! Config is stored in the OS-standard config directory:
//! - Linux: ~/.config/mediadex/config.toml
//! - macOS: ~/Library/Application Support/mediadex/config.toml
//! - Windows: %APPDATA%\mediadex\config.toml
//!
//! Environment variables always take precedence over the file, matching
//! the env-var-first posture of the original daemon (`MEDIASCANNER_*`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Static root directories to index and watch (in addition to any
    /// volumes discovered at runtime).
    pub library: LibraryConfig,

    /// Tuning for the debounce/idle behavior of the indexing pipeline.
    pub timing: TimingConfig,

    /// Environment-sourced settings that don't belong in the TOML file.
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

/// Settings read from the environment rather than the config file —
/// `MEDIASCANNER_USE_DBUS` and `MEDIASCANNER_RUN` only ever make sense as
/// process-launch overrides, never as persisted preferences.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Whether a client should talk to this daemon over RPC instead of
    /// in-process. Recorded for parity with the original daemon's client
    /// selection; this crate never implements the RPC façade itself.
    pub use_dbus: bool,

    /// Desktop-environment override (`MEDIASCANNER_RUN`), used upstream to
    /// force a particular desktop-specific integration path.
    pub desktop_environment: Option<String>,
}

/// Library management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Static paths to scan and watch at startup.
    pub paths: Vec<PathBuf>,

    /// Whether to install filesystem watches after the initial scan.
    pub watch_for_changes: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            watch_for_changes: true,
        }
    }
}

/// Timing knobs for the invalidation sender and bulk-scan progress pulses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Debounce delay, in milliseconds, before the invalidation sender
    /// fires a "catalog changed" notification. 0 = synchronous.
    pub invalidation_delay_ms: u64,

    /// How often, in seconds, a bulk volume scan commits its transaction
    /// and pulses an invalidation while still scanning.
    pub scan_commit_interval_secs: u64,

    /// How long, in seconds, the extractor worker process sits idle
    /// before self-terminating.
    pub extractor_worker_idle_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            invalidation_delay_ms: 500,
            scan_commit_interval_secs: 10,
            extractor_worker_idle_secs: 30,
        }
    }
}

impl TimingConfig {
    pub fn invalidation_delay(&self) -> Duration {
        Duration::from_millis(self.invalidation_delay_ms)
    }

    pub fn scan_commit_interval(&self) -> Duration {
        Duration::from_secs(self.scan_commit_interval_secs)
    }

    pub fn extractor_worker_idle(&self) -> Duration {
        Duration::from_secs(self.extractor_worker_idle_secs)
    }
}

/// Get the config directory path.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mediadex"))
}

/// Get the full path to the config file.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// The cache directory holding `mediastore.db`, honoring
/// `MEDIASCANNER_CACHEDIR` before falling back to `$XDG_CACHE_HOME`.
pub fn cache_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var("MEDIASCANNER_CACHEDIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::cache_dir()
        .map(|d| d.join("mediascanner-2.0"))
        .ok_or(ConfigError::NoConfigDir)
}

pub fn store_path() -> Result<PathBuf, ConfigError> {
    Ok(cache_dir()?.join("mediastore.db"))
}

/// Load configuration from disk, then apply environment overrides.
///
/// Returns a usable default config if the file is missing or can't be
/// parsed; a bad config file is logged, never fatal.
pub fn load() -> Config {
    let mut config = match config_path() {
        Some(path) if path.exists() => match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(?path, "loaded config");
                    config
                }
                Err(e) => {
                    tracing::error!(?path, error = %e, "failed to parse config file, using defaults");
                    Config::default()
                }
            },
            Err(e) => {
                tracing::error!(?path, error = %e, "failed to read config file, using defaults");
                Config::default()
            }
        },
        Some(path) => {
            tracing::info!(?path, "no config file present, using defaults");
            Config::default()
        }
        None => {
            tracing::warn!("could not determine config directory, using defaults");
            Config::default()
        }
    };

    apply_env_overrides(&mut config);
    config
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(paths) = std::env::var("MEDIASCANNER_LIBRARY_PATHS") {
        let parsed: Vec<PathBuf> = std::env::split_paths(&paths).collect();
        if !parsed.is_empty() {
            config.library.paths = parsed;
        }
    }

    config.runtime.use_dbus = std::env::var("MEDIASCANNER_USE_DBUS")
        .is_ok_and(|v| v != "0" && !v.eq_ignore_ascii_case("false"));
    config.runtime.desktop_environment = std::env::var("MEDIASCANNER_RUN").ok();
}

/// Save configuration to disk, creating the config directory if absent.
/// Writes atomically (write to a temp file, then rename).
pub fn save(config: &Config) -> Result<(), ConfigError> {
    let dir = config_dir().ok_or(ConfigError::NoConfigDir)?;
    let path = dir.join("config.toml");

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::CreateDir(dir.clone(), e))?;

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, &path)
        .map_err(|e| ConfigError::Rename(temp_path, path.clone(), e))?;

    tracing::info!(?path, "saved config");
    Ok(())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[library]"));
        assert!(toml.contains("[timing]"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.library.paths.push(PathBuf::from("/music"));
        config.timing.invalidation_delay_ms = 250;

        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.library.paths, vec![PathBuf::from("/music")]);
        assert_eq!(parsed.timing.invalidation_delay_ms, 250);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml = r#"
[library]
paths = ["/home/user/Music"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.library.paths, vec![PathBuf::from("/home/user/Music")]);
        assert!(config.library.watch_for_changes);
        assert_eq!(config.timing.scan_commit_interval_secs, 10);
    }

    #[test]
    fn test_runtime_env_overrides_recorded_not_persisted() {
        // SAFETY: test runs single-threaded within this process for these vars.
        unsafe {
            std::env::set_var("MEDIASCANNER_USE_DBUS", "1");
            std::env::set_var("MEDIASCANNER_RUN", "gnome");
        }
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        assert!(config.runtime.use_dbus);
        assert_eq!(config.runtime.desktop_environment.as_deref(), Some("gnome"));

        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(!toml.contains("use_dbus"));

        unsafe {
            std::env::remove_var("MEDIASCANNER_USE_DBUS");
            std::env::remove_var("MEDIASCANNER_RUN");
        }
    }

    #[test]
    fn test_cache_dir_env_override() {
        // SAFETY: test runs single-threaded within this process for this var.
        unsafe {
            std::env::set_var("MEDIASCANNER_CACHEDIR", "/tmp/mediadex-test-cache");
        }
        assert_eq!(cache_dir().unwrap(), PathBuf::from("/tmp/mediadex-test-cache"));
        unsafe {
            std::env::remove_var("MEDIASCANNER_CACHEDIR");
        }
    }
}
