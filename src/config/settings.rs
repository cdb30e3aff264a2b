//! Operator settings: cluster connection, timeouts, bridge policy
//!
//! Stored as YAML at `~/.standctl/config`. Every section has defaults, so a
//! missing file or a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::network::BridgePolicy;
use crate::tasks::TaskPolicy;

/// Default Proxmox API port
pub const DEFAULT_API_PORT: u16 = 8006;

/// Default settings file location: ~/.standctl/config
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".standctl")
        .join("config")
}

/// Top-level settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub bridges: BridgePolicy,

    #[serde(default)]
    pub roles: RoleSettings,

    /// Path of the template mapping database (`~` is expanded)
    #[serde(default = "default_template_cache")]
    pub template_cache: String,

    #[serde(default = "default_password_length")]
    pub password_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            timeouts: TimeoutSettings::default(),
            bridges: BridgePolicy::default(),
            roles: RoleSettings::default(),
            template_cache: default_template_cache(),
            password_length: default_password_length(),
        }
    }
}

/// How to reach the cluster API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_user")]
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_value: Option<String>,
    /// Verify the API certificate (clusters often use self-signed ones)
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_API_PORT,
            user: default_api_user(),
            token_name: None,
            token_value: None,
            verify_ssl: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ConnectionSettings {
    /// Base URL of the REST API
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }
}

/// Poll and verification timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub task_poll_interval_ms: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Pause before checking that deleted VMs are gone
    #[serde(default = "default_verify_delay")]
    pub verify_delay_secs: u64,
    /// Pause before the single verification retry
    #[serde(default = "default_verify_retry_delay")]
    pub verify_retry_delay_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            task_poll_interval_ms: default_poll_interval_ms(),
            task_timeout_secs: default_task_timeout(),
            verify_delay_secs: default_verify_delay(),
            verify_retry_delay_secs: default_verify_retry_delay(),
        }
    }
}

impl TimeoutSettings {
    pub fn task_policy(&self) -> TaskPolicy {
        TaskPolicy::new(
            Duration::from_millis(self.task_poll_interval_ms),
            Duration::from_secs(self.task_timeout_secs),
        )
    }
}

/// Roles granted to stand owners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSettings {
    #[serde(default = "default_pool_role")]
    pub pool_role: String,
    #[serde(default = "default_vm_role")]
    pub vm_role: String,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            pool_role: default_pool_role(),
            vm_role: default_vm_role(),
        }
    }
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_api_user() -> String {
    "root@pam".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_task_timeout() -> u64 {
    300
}

fn default_verify_delay() -> u64 {
    3
}

fn default_verify_retry_delay() -> u64 {
    10
}

fn default_pool_role() -> String {
    "PVEAdmin".to_string()
}

fn default_vm_role() -> String {
    "PVEVMUser".to_string()
}

fn default_template_cache() -> String {
    "~/.standctl/templates.redb".to_string()
}

fn default_password_length() -> usize {
    8
}

impl Settings {
    /// Template cache path with `~` and env vars expanded
    pub fn template_cache_path(&self) -> PathBuf {
        match shellexpand::full(&self.template_cache) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(shellexpand::tilde(&self.template_cache).as_ref()),
        }
    }
}

// ============================================================================
// SBIO: Pure parsing (no I/O)
// ============================================================================

pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

pub fn serialize_settings(settings: &Settings) -> Result<String, ConfigError> {
    serde_yaml::to_string(settings).map_err(|e| ConfigError::Parse(e.to_string()))
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_settings(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.connection.port, 8006);
        assert_eq!(settings.timeouts.task_timeout_secs, 300);
        assert_eq!(settings.roles.vm_role, "PVEVMUser");
        assert_eq!(settings.password_length, 8);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = parse_settings("connection:\n  host: pve.lab\ntimeouts:\n  task_timeout_secs: 60\n").unwrap();
        assert_eq!(settings.connection.host, "pve.lab");
        assert_eq!(settings.connection.user, "root@pam");
        assert_eq!(settings.timeouts.task_timeout_secs, 60);
        assert_eq!(settings.timeouts.task_poll_interval_ms, 2000);
        assert_eq!(
            settings.connection.base_url(),
            "https://pve.lab:8006/api2/json"
        );
    }

    #[test]
    fn test_task_policy_from_timeouts() {
        let policy = TimeoutSettings::default().task_policy();
        assert_eq!(policy.interval, Duration::from_secs(2));
        assert_eq!(policy.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings_from(&dir.path().join("absent")).unwrap();
        assert!(settings.connection.host.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config");
        let mut settings = Settings::default();
        settings.connection.host = "10.0.0.5".to_string();
        settings.template_cache = "/var/lib/standctl/templates.redb".to_string();
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.connection.host, "10.0.0.5");
        assert_eq!(
            loaded.template_cache_path(),
            PathBuf::from("/var/lib/standctl/templates.redb")
        );
    }
}
