//! Platform-specific locations for the account database, config and cache

use std::path::PathBuf;

const APP_DIR: &str = "DeviceLink";

/// Get the platform-specific data directory for storing account state
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\DeviceLink
/// - macOS: ~/Library/Application Support/DeviceLink
/// - Linux/Other: ~/.local/share/DeviceLink
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Scratch space for downloaded sync attachments
pub fn get_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|c| c.join(APP_DIR))
        .unwrap_or_else(|| get_data_dir().join("cache"))
}

/// Get the default account database path
pub fn get_default_database_path() -> PathBuf {
    get_data_dir().join("account.db")
}

/// Get the default config file path
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("devicelink.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_live_under_app_dirs() {
        assert!(get_default_database_path().starts_with(get_data_dir()));
        assert!(get_default_config_path().starts_with(get_config_dir()));
        assert!(get_data_dir().ends_with(APP_DIR));
    }
}
