//! Persisted device configuration
//!
//! A small JSON file holding the device identity, the OAuth token cache and
//! the wake-on-LAN target. An absent file is the unauthenticated starting
//! state, not an error. Every mutation goes through [`ConfigFile::save`],
//! which the token store invokes before new tokens are surfaced to callers.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const CONFIG_FILE_MODE: u32 = 0o644;

/// On-disk device state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    pub access_token: String,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token: String,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub wake_on_lan_mac: String,
}

/// Loads and persists [`DeviceConfig`] at a fixed path.
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config; an absent file yields the default state.
    pub fn load(&self) -> Result<DeviceConfig> {
        if !self.path.exists() {
            return Ok(DeviceConfig::default());
        }

        let data = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Write the config with mode 0644.
    pub fn save(&self, config: &DeviceConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(config)?;
        std::fs::write(&self.path, data)?;
        std::fs::set_permissions(
            &self.path,
            std::fs::Permissions::from_mode(CONFIG_FILE_MODE),
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_config() -> ConfigFile {
        let path = std::env::temp_dir().join(format!(
            "kvm-agent-config-{}-{:?}.json",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);
        ConfigFile::new(path)
    }

    #[test]
    fn test_absent_file_is_default_state() {
        let file = temp_config();
        let config = file.load().unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert!(config.access_token.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let file = temp_config();

        let config = DeviceConfig {
            id: "dev-1".to_string(),
            access_token: "at".to_string(),
            access_token_expires_at: Some(Utc.with_ymd_and_hms(2031, 1, 2, 3, 4, 5).unwrap()),
            refresh_token: "rt".to_string(),
            refresh_token_expires_at: Some(Utc.with_ymd_and_hms(2032, 1, 2, 3, 4, 5).unwrap()),
            wake_on_lan_mac: "C4:75:AB:1A:07:1B".to_string(),
        };
        file.save(&config).unwrap();

        assert_eq!(file.load().unwrap(), config);

        std::fs::remove_file(file.path()).unwrap();
    }

    #[test]
    fn test_file_mode_is_0644() {
        let file = temp_config();
        file.save(&DeviceConfig::default()).unwrap();

        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        std::fs::remove_file(file.path()).unwrap();
    }

    #[test]
    fn test_field_names_are_camel_case() {
        let file = temp_config();
        file.save(&DeviceConfig {
            id: "x".into(),
            access_token: "at".into(),
            ..Default::default()
        })
        .unwrap();

        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(raw.contains("\"accessToken\""));
        assert!(raw.contains("\"wakeOnLanMac\""));
        assert!(raw.contains("\"refreshTokenExpiresAt\""));

        std::fs::remove_file(file.path()).unwrap();
    }
}
