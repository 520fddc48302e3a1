//! Cross-platform path resolution.
//!
//! All locations fall back to the current directory when the platform
//! directory cannot be determined.

use std::path::PathBuf;

const APP_DIR: &str = "imagescan";

/// Returns the directory for cached scan outcomes.
///
/// Platform-specific locations:
/// - Linux: `~/.cache/imagescan/`
/// - macOS: `~/Library/Caches/imagescan/`
/// - Windows: `%LOCALAPPDATA%\imagescan\cache\`
pub fn cache_dir() -> PathBuf {
    let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    if cfg!(target_os = "windows") {
        base.join(APP_DIR).join("cache")
    } else {
        base.join(APP_DIR)
    }
}

/// Returns the directory holding the tool catalog.
///
/// - Linux: `~/.local/share/imagescan/`
/// - macOS: `~/Library/Application Support/imagescan/`
/// - Windows: `%APPDATA%\imagescan\`
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Returns the directory holding `config.toml`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Root under which per-batch scanner caches are allocated.
pub fn scan_cache_root() -> PathBuf {
    cache_dir().join("scanner")
}
