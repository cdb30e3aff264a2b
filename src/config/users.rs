//! User identifiers and user-list files

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Realm appended to bare user names
pub const DEFAULT_REALM: &str = "pve";

/// `{users: [...]}` as written by operators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: Vec<String>,
}

/// Append the default realm when the id has none
pub fn normalize_userid(user: &str) -> String {
    let user = user.trim();
    if user.contains('@') {
        user.to_string()
    } else {
        format!("{}@{}", user, DEFAULT_REALM)
    }
}

/// Pool owned by a user: the part before `@`
pub fn pool_name(userid: &str) -> &str {
    userid.split('@').next().unwrap_or(userid)
}

/// Parse a comma separated `--users` value
pub fn parse_user_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_users_file(content: &str) -> Result<UsersFile, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Load a users file from disk
pub fn load_users_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_users_file(&content)?.users)
}
