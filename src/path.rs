// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations of files that fsconverge reads from or writes
//! to when the user does not say otherwise.

use std::path::PathBuf;

/// System-wide fallback directory for paranoid backups.
pub const SYSTEM_BACKUP_DIR: &str = "/var/cache/fsconverge";

/// Determine default absolute path to client configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/fsconverge/config.toml`.
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("fsconverge").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to paranoid backup directory.
///
/// Privileged runs use [`SYSTEM_BACKUP_DIR`]. Everyone else gets
/// `$XDG_CACHE_HOME/fsconverge`, since they cannot write to the system
/// cache. Does not check if the path returned actually exists.
pub fn default_backup_dir() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(SYSTEM_BACKUP_DIR);
    }

    dirs::cache_dir()
        .map(|path| path.join("fsconverge"))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_BACKUP_DIR))
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
