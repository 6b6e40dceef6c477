//! Configuration management for the Bluetooth service.
//!
//! This module handles loading and saving configuration from disk. The
//! [`ConfigStore`] wraps it with the accessors the managers use to persist
//! trusted/blocked devices and adapter preferences.

use std::{env, fs, path::PathBuf, time::Duration};

use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
   bluez::client::ReconnectPolicy,
   error::{BluelinkError, Result},
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// Hardware addresses of devices marked trusted.
   #[serde(default)]
   pub trusted_devices: Vec<String>,

   /// Hardware addresses of devices marked blocked.
   #[serde(default)]
   pub blocked_devices: Vec<String>,

   /// Object path of the adapter to prefer as default.
   #[serde(default)]
   pub preferred_adapter: Option<String>,

   #[serde(default)]
   pub power_on_startup: bool,

   #[serde(default = "default_agent_capability")]
   pub agent_capability: String,

   #[serde(default = "default_rssi_refresh_interval")]
   pub rssi_refresh_interval_sec: u64,

   #[serde(default = "default_pairing_timeout")]
   pub pairing_timeout_sec: u64,

   #[serde(default)]
   pub reconnect: ReconnectConfig,

   #[serde(default = "default_true")]
   pub notifications: bool,

   /// Privileged actions the authorization policy refuses.
   #[serde(default)]
   pub denied_actions: Vec<String>,
}

/// Reconnect backoff settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
   #[serde(default = "default_base_delay_ms")]
   pub base_delay_ms: u64,

   #[serde(default = "default_max_delay")]
   pub max_delay_sec: u64,

   #[serde(default = "default_max_attempts")]
   pub max_attempts: u32,
}

fn default_agent_capability() -> String {
   "KeyboardDisplay".to_string()
}

const fn default_rssi_refresh_interval() -> u64 {
   30
}

const fn default_pairing_timeout() -> u64 {
   30
}

const fn default_true() -> bool {
   true
}

const fn default_base_delay_ms() -> u64 {
   1000
}

const fn default_max_delay() -> u64 {
   60
}

const fn default_max_attempts() -> u32 {
   10
}

impl Default for ReconnectConfig {
   fn default() -> Self {
      Self {
         base_delay_ms: default_base_delay_ms(),
         max_delay_sec: default_max_delay(),
         max_attempts: default_max_attempts(),
      }
   }
}

impl ReconnectConfig {
   pub fn policy(&self) -> ReconnectPolicy {
      ReconnectPolicy {
         base_delay: Duration::from_millis(self.base_delay_ms),
         max_delay: Duration::from_secs(self.max_delay_sec),
         max_attempts: self.max_attempts,
         ..ReconnectPolicy::default()
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         trusted_devices: vec![],
         blocked_devices: vec![],
         preferred_adapter: None,
         power_on_startup: false,
         agent_capability: default_agent_capability(),
         rssi_refresh_interval_sec: default_rssi_refresh_interval(),
         pairing_timeout_sec: default_pairing_timeout(),
         reconnect: ReconnectConfig::default(),
         notifications: true,
         denied_actions: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   fn save_to(&self, config_path: &PathBuf) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BLUELINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(BluelinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("bluelink").join("config.toml"))
   }

   pub fn rssi_refresh_interval(&self) -> Duration {
      Duration::from_secs(self.rssi_refresh_interval_sec.max(1))
   }

   pub fn pairing_timeout(&self) -> Duration {
      Duration::from_secs(self.pairing_timeout_sec.max(1))
   }
}

/// Get/set accessors over the persisted configuration.
///
/// Every mutation is written back to disk immediately, unless the store
/// was created in memory.
pub struct ConfigStore {
   config: Mutex<Config>,
   path: Option<PathBuf>,
}

impl ConfigStore {
   /// Loads the store from the default configuration path.
   pub fn load() -> Result<Self> {
      Ok(Self {
         config: Mutex::new(Config::load()?),
         path: Some(Config::config_path()?),
      })
   }

   pub fn open(path: PathBuf) -> Result<Self> {
      let config = if path.exists() {
         toml::from_str(&fs::read_to_string(&path)?)?
      } else {
         Config::default()
      };
      Ok(Self {
         config: Mutex::new(config),
         path: Some(path),
      })
   }

   pub const fn in_memory(config: Config) -> Self {
      Self {
         config: Mutex::new(config),
         path: None,
      }
   }

   pub fn snapshot(&self) -> Config {
      self.config.lock().clone()
   }

   fn update(&self, f: impl FnOnce(&mut Config) -> bool) -> Result<()> {
      let mut config = self.config.lock();
      if !f(&mut config) {
         return Ok(());
      }
      match &self.path {
         Some(path) => config.save_to(path),
         None => Ok(()),
      }
   }

   pub fn trusted_devices(&self) -> Vec<String> {
      self.config.lock().trusted_devices.clone()
   }

   pub fn blocked_devices(&self) -> Vec<String> {
      self.config.lock().blocked_devices.clone()
   }

   pub fn set_trusted(&self, address: &str, trusted: bool) -> Result<()> {
      self.update(|config| set_membership(&mut config.trusted_devices, address, trusted))
   }

   pub fn set_blocked(&self, address: &str, blocked: bool) -> Result<()> {
      self.update(|config| set_membership(&mut config.blocked_devices, address, blocked))
   }

   pub fn preferred_adapter(&self) -> Option<String> {
      self.config.lock().preferred_adapter.clone()
   }

   pub fn set_preferred_adapter(&self, path: Option<&str>) -> Result<()> {
      self.update(|config| {
         let new = path.map(str::to_owned);
         if config.preferred_adapter == new {
            return false;
         }
         config.preferred_adapter = new;
         true
      })
   }

   pub fn notifications_enabled(&self) -> bool {
      self.config.lock().notifications
   }

   pub fn is_denied(&self, action: &str) -> bool {
      self.config.lock().denied_actions.iter().any(|a| a == action)
   }

   /// Persists a set change, logging instead of failing: losing a
   /// preference must never fail the operation that produced it.
   pub fn persist_or_warn(&self, what: &str, result: Result<()>) {
      if let Err(e) = result {
         warn!("Failed to persist {what}: {e}");
      }
   }
}

fn set_membership(list: &mut Vec<String>, address: &str, member: bool) -> bool {
   let position = list.iter().position(|a| a.eq_ignore_ascii_case(address));
   match (position, member) {
      (None, true) => {
         list.push(address.to_owned());
         true
      },
      (Some(idx), false) => {
         list.remove(idx);
         true
      },
      _ => false,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   use tempfile::TempDir;

   #[test]
   fn test_defaults_from_empty_file() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config, Config::default());
      assert_eq!(config.rssi_refresh_interval(), Duration::from_secs(30));
      assert_eq!(config.reconnect.policy().max_attempts, 10);
   }

   #[test]
   fn test_store_persists_membership() -> Result<()> {
      let dir = TempDir::new().unwrap();
      let path = dir.path().join("bluelink").join("config.toml");

      let store = ConfigStore::open(path.clone())?;
      store.set_trusted("AA:BB:CC:DD:EE:FF", true)?;
      store.set_trusted("aa:bb:cc:dd:ee:ff", true)?;
      store.set_blocked("11:22:33:44:55:66", true)?;
      store.set_preferred_adapter(Some("/org/bluez/hci1"))?;

      let reopened = ConfigStore::open(path)?;
      assert_eq!(reopened.trusted_devices(), vec!["AA:BB:CC:DD:EE:FF".to_string()]);
      assert_eq!(reopened.blocked_devices(), vec!["11:22:33:44:55:66".to_string()]);
      assert_eq!(reopened.preferred_adapter().as_deref(), Some("/org/bluez/hci1"));

      reopened.set_trusted("aa:bb:cc:dd:ee:ff", false)?;
      assert!(reopened.trusted_devices().is_empty());
      Ok(())
   }

   #[test]
   fn test_in_memory_store_never_touches_disk() -> Result<()> {
      let store = ConfigStore::in_memory(Config::default());
      store.set_blocked("11:22:33:44:55:66", true)?;
      assert_eq!(store.snapshot().blocked_devices.len(), 1);
      Ok(())
   }
}
