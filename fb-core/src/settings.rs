//! Application Settings
//!
//! Persistent settings stored as JSON in ~/.config/fluxbar/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};

use tracing::warn;

use crate::constants::{paths, timing};
use crate::data::Preset;
use crate::error::{FluxbarError, Result};

// ============================================================================
// Cached Settings
// ============================================================================

static SETTINGS_CACHE: OnceLock<RwLock<Option<AppSettings>>> = OnceLock::new();

fn get_cache() -> &'static RwLock<Option<AppSettings>> {
    SETTINGS_CACHE.get_or_init(|| RwLock::new(None))
}

/// Cached settings, loading from disk on a cache miss. Falls back to defaults
/// when the file cannot be read.
pub fn get_cached_settings() -> AppSettings {
    if let Ok(guard) = get_cache().read() {
        if let Some(ref settings) = *guard {
            return settings.clone();
        }
    }

    let settings = load_settings().unwrap_or_else(|e| {
        warn!("Using default settings: {}", e);
        AppSettings::default()
    });
    update_cache(&settings);
    settings
}

/// Drop the cached copy so the next access rereads the file
pub fn invalidate_settings_cache() {
    if let Ok(mut guard) = get_cache().write() {
        *guard = None;
    }
}

fn update_cache(settings: &AppSettings) {
    if let Ok(mut guard) = get_cache().write() {
        *guard = Some(settings.clone());
    }
}

// ============================================================================
// Settings Model
// ============================================================================

/// How much the presentation layer shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ViewMode {
    Mini,
    #[default]
    Standard,
    Pro,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Preset applied when the engine starts
    #[serde(default)]
    pub preset: Preset,

    /// Poll period in seconds, one of 0.5, 1, 2 or 5
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: f64,

    #[serde(default)]
    pub view_mode: ViewMode,

    /// Failed passes in a row before readings are withdrawn
    #[serde(default = "default_stale_after_failures")]
    pub stale_after_failures: u32,
}

fn default_refresh_interval() -> f64 { timing::DEFAULT_REFRESH_SECS }
fn default_stale_after_failures() -> u32 { timing::STALE_AFTER_FAILURES }

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preset: Preset::default(),
            refresh_interval_secs: default_refresh_interval(),
            view_mode: ViewMode::default(),
            stale_after_failures: default_stale_after_failures(),
        }
    }
}

impl AppSettings {
    /// Check values a hand-edited file could get wrong
    pub fn validate(&self) -> Result<()> {
        crate::engine::validate_refresh(self.refresh_interval_secs)?;
        if self.stale_after_failures == 0 {
            return Err(FluxbarError::invalid_config(
                "stale_after_failures",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Replace invalid values with defaults
    fn sanitize(&mut self) {
        if let Err(e) = crate::engine::validate_refresh(self.refresh_interval_secs) {
            warn!("{}; using {}s", e, timing::DEFAULT_REFRESH_SECS);
            self.refresh_interval_secs = default_refresh_interval();
        }
        if self.stale_after_failures == 0 {
            self.stale_after_failures = default_stale_after_failures();
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Settings file path, creating the config directory when missing
pub fn get_settings_path() -> Result<PathBuf> {
    let dir = paths::user_config_dir()
        .ok_or_else(|| FluxbarError::config("Could not determine config directory"))?;

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| FluxbarError::FileWrite {
            path: dir.clone(),
            source: e,
        })?;
    }

    Ok(dir.join(paths::SETTINGS_FILE))
}

/// Load settings from the default location
pub fn load_settings() -> Result<AppSettings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from `path`. A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| FluxbarError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut settings: AppSettings = serde_json::from_str(&content)?;
    settings.sanitize();
    Ok(settings)
}

/// Save settings to the default location and refresh the cache
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    save_settings_to(&get_settings_path()?, settings)?;
    update_cache(settings);
    Ok(())
}

/// Write settings to `path` through a temp file and rename
pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    settings.validate()?;
    let json = serde_json::to_string_pretty(settings)?;

    let temp_path = path.with_extension("json.tmp");
    let write_err = |e| FluxbarError::FileWrite {
        path: temp_path.clone(),
        source: e,
    };

    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(json.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| FluxbarError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Load, modify and save in one step
pub fn update_setting<F>(updater: F) -> Result<AppSettings>
where
    F: FnOnce(&mut AppSettings),
{
    let mut settings = load_settings()?;
    updater(&mut settings);
    save_settings(&settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.refresh_interval_secs, 2.0);
        assert_eq!(settings.preset, Preset::Automatic);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let settings = AppSettings {
            preset: Preset::FullBlast,
            refresh_interval_secs: 0.5,
            view_mode: ViewMode::Pro,
            stale_after_failures: 3,
        };
        save_settings_to(&path, &settings).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"Full Blast\""));
        assert_eq!(load_settings_from(&path).unwrap(), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(FluxbarError::JsonParse(_))));
    }

    #[test]
    fn test_invalid_interval_sanitized_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"refresh_interval_secs": 3.0, "stale_after_failures": 0}"#).unwrap();
        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.refresh_interval_secs, 2.0);
        assert_eq!(settings.stale_after_failures, 10);
    }

    #[test]
    fn test_invalid_interval_rejected_on_save() {
        let dir = TempDir::new().unwrap();
        let settings = AppSettings {
            refresh_interval_secs: 0.25,
            ..Default::default()
        };
        assert!(save_settings_to(&dir.path().join("s.json"), &settings).is_err());
    }

    #[test]
    #[serial]
    fn test_default_location_follows_xdg() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("XDG_CONFIG_HOME", dir.path());
        invalidate_settings_cache();

        let saved = update_setting(|s| s.preset = Preset::Manual).unwrap();
        assert_eq!(saved.preset, Preset::Manual);
        assert!(dir.path().join("fluxbar").join("settings.json").exists());
        assert_eq!(get_cached_settings().preset, Preset::Manual);

        invalidate_settings_cache();
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}
