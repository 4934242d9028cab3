//! Bridge settings

use std::path::{Path, PathBuf};

use ps_protocol::Transport;
use ps_session::{RecordingConfig, SessionConfig};
use serde::{Deserialize, Serialize};

/// Persisted bridge settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Transport used when none is given on the command line
    pub transport: Transport,
    /// Engine, driver and timing tunables
    pub session: SessionConfig,
    /// Recording defaults
    pub recording: RecordingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: Transport::Usb,
            session: SessionConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl Settings {
    /// Get the XDG config directory for ps-bridge
    /// Uses $XDG_CONFIG_HOME/ps-bridge on Linux/macOS, falls back to ~/.config/ps-bridge
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("ps-bridge"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("ps-bridge"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from disk, falling back to defaults
    pub fn load() -> Self {
        Self::settings_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<PathBuf, String> {
        let path =
            Self::settings_path().ok_or_else(|| "Could not determine settings path".to_string())?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        std::fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("settings.json"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.transport = Transport::Ble;
        settings.session.ble.prefer_address = Some("AA:BB:CC:DD:EE:FF".to_string());
        settings.recording = RecordingConfig {
            enabled: true,
            directory: Some(dir.path().to_path_buf()),
        };
        settings.save_to(&path).unwrap();

        assert_eq!(Settings::load_from(&path), settings);
    }

    #[test]
    fn test_garbage_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"transport": "ble"}"#).unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.transport, Transport::Ble);
        assert_eq!(settings.session, SessionConfig::default());
    }
}
