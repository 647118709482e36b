//! Config-directory resolution, grounded on `chat-cli::util::paths`'s habit of
//! centralizing `~/.config/<app>` resolution in one place rather than
//! scattering `dirs::home_dir()` calls through the codebase.

use std::path::PathBuf;

pub const APP_DIR_NAME: &str = "oneshotmcp";

/// `~/.config/<app>` (or the platform equivalent via `dirs::config_dir`).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn token_file() -> PathBuf {
    config_dir().join("tokens.json")
}

pub fn key_file() -> PathBuf {
    config_dir().join("key")
}
