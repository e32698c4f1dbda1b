// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! POSIX path reconciliation.
//!
//! The [`PosixTool`] verifies declared entries against what is on disk, and
//! installs them when they differ. Platform facilities that may be missing
//! (ACLs, security labels) sit behind the [`AclStore`] and
//! [`SecurityContext`] traits, so a system without them simply gets inert
//! backends instead of special cases.

pub mod acl;
pub mod content;
pub mod inspect;
pub mod install;
pub mod secontext;
pub mod verify;

use crate::{backup::BackupStore, config::ClientConfig, entry::DeclaredEntry};

use acl::{AclStore, SystemAcls};
use ignore::WalkBuilder;
use secontext::{SecurityContext, SelinuxContext};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, error, warn};

pub use install::InstallError;
pub use verify::{Axis, Mismatch, Verification};

/// Security label backend native to the build target.
pub type SystemSecurityContext = SelinuxContext;

/// Verifier and installer for declared path entries.
pub struct PosixTool<'cfg, A = SystemAcls, S = SystemSecurityContext>
where
    A: AclStore,
    S: SecurityContext,
{
    config: &'cfg ClientConfig,
    acls: A,
    secontext: S,
    backups: BackupStore,
}

impl<'cfg> PosixTool<'cfg> {
    /// Construct new tool with backends native to the running system.
    pub fn new(config: &'cfg ClientConfig) -> Self {
        Self::with_backends(config, SystemAcls::default(), SystemSecurityContext::default())
    }
}

impl<'cfg, A, S> PosixTool<'cfg, A, S>
where
    A: AclStore,
    S: SecurityContext,
{
    /// Construct new tool with explicit ACL and security label backends.
    pub fn with_backends(config: &'cfg ClientConfig, acls: A, secontext: S) -> Self {
        Self {
            config,
            acls,
            secontext,
            backups: BackupStore::new(&config.paranoid.path, config.paranoid.max_copies),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        self.config
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Back up whatever occupies the entry's path before it is overwritten.
    ///
    /// Only happens under the paranoid policy, and only for existing regular
    /// files, never FIFOs, devices, or symlinks. Failure is logged and never
    /// stops the install.
    pub(crate) fn paranoid_backup(&self, entry: &DeclaredEntry) {
        if !self.config.paranoid.wants_backup(entry.paranoid) {
            return;
        }

        match fs::symlink_metadata(&entry.name) {
            Ok(metadata) if metadata.file_type().is_file() => {
                if let Err(err) = self.backups.backup(&entry.name) {
                    error!("paranoid backup of {} failed: {err}", entry.name.display());
                }
            }
            Ok(_) => debug!("{} is not a regular file, no backup possible", entry.name.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("cannot examine {} for backup: {err}", entry.name.display()),
        }
    }
}

/// List every descendant of a directory in one snapshot.
///
/// Symlinks are never followed, and nothing is filtered out, hidden files
/// and ignore files included. The root itself is not part of the listing.
pub(crate) fn descendants(root: &Path) -> Vec<PathBuf> {
    WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("cannot list part of {}: {err}", root.display());
                None
            }
        })
        .filter(|entry| entry.depth() > 0)
        .map(|entry| entry.into_path())
        .collect()
}

/// Remove whatever occupies path, so something else can be put there.
///
/// Directories are only removed when empty. Absence is not an error.
pub(crate) fn remove_occupant(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Create missing ancestors of path.
pub(crate) fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if let Some(created) = mkdirp::mkdirp(parent)? {
            tracing::info!("created missing directory {}", created.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn remove_occupant_handles_each_kind() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("file");
        let empty = dir.path().join("empty");
        let full = dir.path().join("full");
        fs::write(&file, b"")?;
        fs::create_dir(&empty)?;
        fs::create_dir(&full)?;
        fs::write(full.join("child"), b"")?;

        remove_occupant(&file)?;
        remove_occupant(&empty)?;
        remove_occupant(&dir.path().join("missing"))?;
        assert!(remove_occupant(&full).is_err());

        assert_eq!(file.exists(), false);
        assert_eq!(empty.exists(), false);
        assert_eq!(full.exists(), true);

        Ok(())
    }

    #[test]
    fn ensure_parent_creates_ancestors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a/b/c/file");
        ensure_parent(&path)?;
        assert!(dir.path().join("a/b/c").is_dir());
        Ok(())
    }
}
