//! Centralized path configuration.
//!
//! All on-disk locations go through this module so every entry point agrees
//! on where stage records, locks and configuration live.

use std::path::PathBuf;

/// Get the stagecraft data directory.
///
/// Resolution order:
/// 1. `STAGECRAFT_DATA_DIR` environment variable
/// 2. `/var/lib/stagecraft` if it exists (system install)
/// 3. `~/.stagecraft` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STAGECRAFT_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/stagecraft");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".stagecraft")).unwrap_or(system_dir)
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    data_dir()
}

/// Get the local stage record directory for a project.
pub fn stages_dir(project: &str) -> PathBuf {
    data_dir().join("stages").join(project)
}

/// Get the lock directory.
pub fn locks_dir() -> PathBuf {
    data_dir().join("locks")
}
