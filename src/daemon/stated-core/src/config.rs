//! Client configuration
//! Only describes where state lives and how reads and writes are bounded

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known root of the shared namespace
pub const DEFAULT_SHARED_ROOT: &str = "/var/state";

/// Private root relative to the user's home directory
pub const USER_ROOT_SUFFIX: &str = ".libstate/run";

pub const SHARED_ROOT_ENV: &str = "STATED_SHARED_ROOT";
pub const USER_ROOT_ENV: &str = "STATED_USER_ROOT";

/// Configuration for a stated client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root directory of shared names
    pub shared_root: PathBuf,
    /// Root directory of `user.` names (derived from the home directory if unset)
    pub user_root: Option<PathBuf>,
    /// How many times a read restarts on a changing file before giving up
    pub read_retry_limit: u32,
    /// Largest payload a binding will publish
    pub max_payload_len: usize,
    /// Permission bits for newly created state files
    pub file_mode: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            shared_root: PathBuf::from(DEFAULT_SHARED_ROOT),
            user_root: None,
            read_retry_limit: 64,
            max_payload_len: 16 * 1024 * 1024, // 16MB
            file_mode: 0o644,
        }
    }
}

impl ClientConfig {
    /// Defaults with `STATED_SHARED_ROOT` / `STATED_USER_ROOT` applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = std::env::var_os(SHARED_ROOT_ENV) {
            config.shared_root = PathBuf::from(root);
        }
        if let Some(root) = std::env::var_os(USER_ROOT_ENV) {
            config.user_root = Some(PathBuf::from(root));
        }
        config
    }

    /// Use `root`/shared and `root`/user as the two namespace roots
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            shared_root: root.join("shared"),
            user_root: Some(root.join("user")),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_retry_limit == 0 {
            return Err(Error::InvalidConfig(
                "read_retry_limit must be > 0".to_string(),
            ));
        }
        if self.max_payload_len == 0 {
            return Err(Error::InvalidConfig(
                "max_payload_len must be > 0".to_string(),
            ));
        }
        if self.file_mode & !0o7777 != 0 {
            return Err(Error::InvalidConfig(format!(
                "file_mode {:o} is not a permission mask",
                self.file_mode
            )));
        }
        if self.shared_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("shared_root is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shared_root, PathBuf::from("/var/state"));
        assert!(config.user_root.is_none());
    }

    #[test]
    fn test_zero_retry_limit_rejected() {
        let config = ClientConfig {
            read_retry_limit: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
shared_root = "/run/state"
read_retry_limit = 8
"#,
        )
        .unwrap();
        assert_eq!(config.shared_root, PathBuf::from("/run/state"));
        assert_eq!(config.read_retry_limit, 8);
        assert_eq!(config.file_mode, 0o644);
    }
}
