pub mod settings;
pub mod stand;
pub mod users;
pub mod validation;

pub use settings::{
    default_settings_path, load_settings_from, save_settings_to, ConnectionSettings, RoleSettings,
    Settings, TimeoutSettings,
};
pub use stand::{DeviceType, MachineSpec, NetworkSpec, StandConfig, TemplateKey};
pub use users::{load_users_file, normalize_userid, parse_user_list, pool_name, UsersFile};
pub use validation::{
    is_valid_machine_name, validate_stand, validate_users, ValidationMessage, ValidationReport,
    ValidationSeverity,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from validation reports)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse: {0}")]
    Parse(String),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Parse a stand definition (YAML, or JSON as a YAML subset)
pub fn parse_stand(content: &str) -> Result<StandConfig, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Load and parse a stand file from disk.
/// Structural validation is left to [`validate_stand`].
pub fn load_stand_file(path: &Path) -> Result<StandConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_stand(&content)
}
