//! Configuration loading (ambient stack), grounded in `main.py`'s
//! `DEFAULT_CONFIG`/`load_config` deep-merge behavior: every section has
//! its own `Default` impl, and a partially-specified TOML file only
//! overrides the fields it mentions via `#[serde(default)]`.

use serde::Deserialize;

use crate::error::BridgeError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OmronConfig {
    pub device_model: String,
    pub mac_address: Option<String>,
    pub poll_interval_minutes: u64,
    /// `"all"` or `"new_only"`.
    pub read_mode: String,
    pub sync_time: bool,
    /// 16-byte hex-encoded pairing key; defaults to the factory key.
    pub pairing_key_hex: Option<String>,
}

impl Default for OmronConfig {
    fn default() -> Self {
        Self {
            device_model: "HEM-7361T".to_string(),
            mac_address: None,
            poll_interval_minutes: 60,
            read_mode: "new_only".to_string(),
            sync_time: true,
            pairing_key_hex: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub base_url: String,
    pub token_path: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://connect.example.com/api".to_string(),
            token_path: "./data/tokens/access_token".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "192.168.40.19".to_string(),
            port: 1883,
            username: None,
            password: None,
            base_topic: "omron/blood_pressure".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    pub database_path: String,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self { database_path: "./data/omron.db".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file: None }
    }
}

fn default_true() -> bool {
    true
}

/// One entry of `users[]`: maps a device `user_slot` to a human name and
/// the identity a sink should publish under, plus per-sink enables so a
/// given user can be excluded from the cloud or bus independently.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub user_slot: u32,
    pub name: String,
    pub remote_identity: String,
    #[serde(default = "default_true")]
    pub cloud_enabled: bool,
    #[serde(default = "default_true")]
    pub bus_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub omron: OmronConfig,
    pub cloud: CloudConfig,
    pub bus: BusConfig,
    pub deduplication: DeduplicationConfig,
    pub logging: LoggingConfig,
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Load from a TOML file if it exists, falling back to defaults for
    /// any section or field the file omits.
    pub fn load(path: Option<&str>) -> Result<Self, BridgeError> {
        let Some(path) = path else { return Ok(Config::default()) };
        if !std::path::Path::new(path).exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Decode(format!("failed to read config {path}: {e}")))?;
        toml::from_str(&text)
            .map_err(|e| BridgeError::Decode(format!("failed to parse config {path}: {e}")))
    }

    pub fn user_config(&self, slot: u32) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.user_slot == slot)
    }

    /// The identity a sink should publish readings under for this user
    /// slot: the configured `remote_identity`, or the raw slot number if
    /// the user isn't listed in `users[]`.
    pub fn remote_identity(&self, slot: u32) -> String {
        self.user_config(slot).map(|u| u.remote_identity.clone()).unwrap_or_else(|| slot.to_string())
    }

    /// Whether readings for this user slot should go to the given sink.
    /// Defaults to enabled when the user isn't listed in `users[]`.
    pub fn sink_enabled_for_user(&self, slot: u32, cloud: bool) -> bool {
        match self.user_config(slot) {
            Some(u) if cloud => u.cloud_enabled,
            Some(u) => u.bus_enabled,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_source_values() {
        let cfg = Config::default();
        assert_eq!(cfg.omron.device_model, "HEM-7361T");
        assert_eq!(cfg.omron.read_mode, "new_only");
        assert!(cfg.omron.sync_time);
        assert_eq!(cfg.bus.port, 1883);
        assert_eq!(cfg.deduplication.database_path, "./data/omron.db");
    }

    #[test]
    fn partial_toml_only_overrides_mentioned_fields() {
        let toml_text = r#"
            [omron]
            poll_interval_minutes = 15
        "#;
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.omron.poll_interval_minutes, 15);
        assert_eq!(cfg.omron.device_model, "HEM-7361T");
        assert_eq!(cfg.bus.host, "192.168.40.19");
    }

    #[test]
    fn missing_config_path_falls_back_to_defaults() {
        let cfg = Config::load(Some("/nonexistent/path/omron.toml")).unwrap();
        assert_eq!(cfg.omron.device_model, "HEM-7361T");
    }

    #[test]
    fn users_table_maps_slot_to_remote_identity_and_per_sink_enables() {
        let toml_text = r#"
            [[users]]
            user_slot = 1
            name = "Alice"
            remote_identity = "alice"
            bus_enabled = false

            [[users]]
            user_slot = 2
            name = "Bob"
            remote_identity = "bob"
        "#;
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.remote_identity(1), "alice");
        assert!(cfg.sink_enabled_for_user(1, true));
        assert!(!cfg.sink_enabled_for_user(1, false));
        assert!(cfg.sink_enabled_for_user(2, false));
    }

    #[test]
    fn unlisted_user_slot_falls_back_to_numeric_identity_and_enabled() {
        let cfg = Config::default();
        assert_eq!(cfg.remote_identity(3), "3");
        assert!(cfg.sink_enabled_for_user(3, true));
        assert!(cfg.sink_enabled_for_user(3, false));
    }
}
