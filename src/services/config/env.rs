//! Well-known names, default locations and environment variables.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Namespace directory under the user's home (`~/.kubex`).
pub const NAMESPACE: &str = "kubex";
/// Module name; also the container name prefix and keyring service.
pub const APP_NAME: &str = "kubexdb";
pub const DEFAULT_ADMIN: &str = "kubexdb";
pub const DEFAULT_DB_NAME: &str = "kubexdb";

pub const CONFIG_FILE_VAR: &str = "KUBEXDB_CONFIGFILE";
pub const KEY_FILE_VAR: &str = "KUBEXDB_KEYFILE";
pub const CERT_FILE_VAR: &str = "KUBEXDB_CERTFILE";
pub const HIDE_BANNER_VAR: &str = "KUBEXDB_HIDEBANNER";

/// `~/.kubex/kubexdb`
pub fn home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| Error::ConfigNotFound {
        path: PathBuf::from("~").join(format!(".{}", NAMESPACE)).join(APP_NAME),
    })?;
    Ok(home.join(format!(".{}", NAMESPACE)).join(APP_NAME))
}

/// `$KUBEXDB_CONFIGFILE`, else `~/.kubex/kubexdb/config.json`.
pub fn default_config_path() -> Result<PathBuf> {
    match non_empty_var(CONFIG_FILE_VAR) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(home_dir()?.join("config.json")),
    }
}

/// `~/.kubex/kubexdb/volumes`
pub fn default_volume_root() -> Result<PathBuf> {
    Ok(home_dir()?.join("volumes"))
}

pub fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// `true`, `1`, `yes`, `y` in any case.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "y"
    )
}

pub fn banner_hidden() -> bool {
    non_empty_var(HIDE_BANNER_VAR).is_some_and(|value| is_truthy(&value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        for value in ["true", "TRUE", "1", "yes", "Y", " y "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["", "0", "no", "false", "on"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn test_home_layout() {
        if let Ok(dir) = home_dir() {
            assert!(dir.ends_with(".kubex/kubexdb"));
            assert!(default_volume_root().unwrap().ends_with(".kubex/kubexdb/volumes"));
        }
    }
}
