// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Entry installation.
//!
//! Bring a path into its declared state. Each entry type knows how to
//! create or replace its own object, and all of them finish by applying the
//! same shared metadata: ownership, permissions, security label, and ACLs.
//! Whether the install actually worked is left to re-verification by the
//! caller.

use crate::{
    entry::{DeclaredEntry, DeclaredPaths, DeviceType, EntryKind, SeContext},
    identity,
    posix::{
        acl::{self, AclStore},
        ensure_parent, remove_occupant,
        secontext::SecurityContext,
        verify::{wanted_acls, Verification},
        PosixTool,
    },
};

use filetime::FileTime;
use rustix::fs::{makedev, mknodat, FileType, Mode, CWD};
use std::{
    fs,
    io::{ErrorKind, Write},
    os::unix::fs::{chown, lchown, symlink, PermissionsExt},
    path::{Path, PathBuf},
};
use tracing::{error, info, instrument, warn};

impl<A, S> PosixTool<'_, A, S>
where
    A: AclStore,
    S: SecurityContext,
{
    /// Install entry, bringing its path into declared state.
    ///
    /// Takes the verification that found the entry out of state, since some
    /// types act on what it found, e.g., extra entries of pruned directories.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError`] describing the first step that failed.
    #[instrument(skip(self, entry, verification, declared), fields(path = %entry.name.display()), level = "debug")]
    pub fn install(
        &self,
        entry: &DeclaredEntry,
        verification: &Verification,
        declared: &DeclaredPaths,
    ) -> Result<()> {
        info!("installing {} {}", entry.kind, entry.name.display());
        match &entry.kind {
            EntryKind::Device { dev_type } => self.install_device(entry, dev_type),
            EntryKind::Directory { .. } => self.install_directory(entry, verification),
            EntryKind::File {
                content, mtime, ..
            } => self.install_file(entry, content, *mtime),
            EntryKind::Hardlink { to } => self.install_hardlink(entry, to),
            EntryKind::Nonexistent => self.install_nonexistent(entry, declared),
            EntryKind::Permissions => self.install_permissions(entry),
            EntryKind::Symlink { to } => self.install_symlink(entry, to),
        }
    }

    fn install_file(&self, entry: &DeclaredEntry, content: &[u8], mtime: Option<i64>) -> Result<()> {
        let path = &entry.name;
        if path.is_dir() && !path.is_symlink() {
            return Err(InstallError::Occupied(path.clone()));
        }

        ensure_parent(path).map_err(|source| io_error(path, "create parent of", source))?;
        self.paranoid_backup(entry);

        let parent = path.parent().unwrap_or(Path::new("/"));
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        // INVARIANT: Content lands next to its destination, then moves over it atomically.
        let mut staged = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .tempfile_in(parent)
            .map_err(|source| io_error(path, "stage", source))?;
        staged
            .write_all(content)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|source| io_error(path, "write", source))?;

        self.apply_metadata(entry, staged.path(), false)?;

        staged.persist(path).map_err(|err| io_error(path, "rename over", err.error))?;

        // INVARIANT: Policy labels follow the final name, not the staged one.
        if let Some(label @ SeContext::Default) = &entry.secontext {
            if self.secontext.supported() {
                self.secontext.write(path, label, false).map_err(|err| InstallError::Metadata {
                    path: path.clone(),
                    failures: vec![err.to_string()],
                })?;
            }
        }

        if let Some(mtime) = mtime {
            filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0))
                .map_err(|source| io_error(path, "set mtime of", source))?;
        }

        Ok(())
    }

    fn install_directory(&self, entry: &DeclaredEntry, verification: &Verification) -> Result<()> {
        let path = &entry.name;
        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                warn!("found non-directory at {}, replacing it", path.display());
                self.paranoid_backup(entry);
                fs::remove_file(path).map_err(|source| io_error(path, "remove", source))?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(path, "examine", source)),
        }

        if let Some(created) =
            mkdirp::mkdirp(path).map_err(|source| io_error(path, "create", source))?
        {
            info!("created directory {}", created.display());
        }

        let mut failed = Vec::new();
        for extra in &verification.extra {
            info!("pruning {}", extra.display());
            let removed = match fs::symlink_metadata(extra) {
                Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(extra),
                Ok(_) => fs::remove_file(extra),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = removed {
                error!("failed to prune {}: {err}", extra.display());
                failed.push(extra.clone());
            }
        }

        let applied = self.apply_metadata(entry, path, entry.recursive);
        if !failed.is_empty() {
            return Err(InstallError::Prune {
                path: path.clone(),
                failed,
            });
        }

        applied
    }

    fn install_symlink(&self, entry: &DeclaredEntry, to: &Path) -> Result<()> {
        let path = &entry.name;
        ensure_parent(path).map_err(|source| io_error(path, "create parent of", source))?;
        self.paranoid_backup(entry);
        remove_occupant(path).map_err(|source| io_error(path, "remove", source))?;
        symlink(to, path).map_err(|source| io_error(path, "symlink", source))?;
        self.apply_metadata(entry, path, false)
    }

    fn install_hardlink(&self, entry: &DeclaredEntry, to: &Path) -> Result<()> {
        let path = &entry.name;
        ensure_parent(path).map_err(|source| io_error(path, "create parent of", source))?;
        self.paranoid_backup(entry);
        remove_occupant(path).map_err(|source| io_error(path, "remove", source))?;
        fs::hard_link(to, path).map_err(|source| io_error(path, "hardlink", source))?;
        self.apply_metadata(entry, path, false)
    }

    fn install_device(&self, entry: &DeclaredEntry, dev_type: &DeviceType) -> Result<()> {
        let path = &entry.name;
        ensure_parent(path).map_err(|source| io_error(path, "create parent of", source))?;
        self.paranoid_backup(entry);
        remove_occupant(path).map_err(|source| io_error(path, "remove", source))?;

        let file_type = match dev_type {
            DeviceType::Block { .. } => FileType::BlockDevice,
            DeviceType::Char { .. } => FileType::CharacterDevice,
            DeviceType::Fifo => FileType::Fifo,
        };
        let dev = dev_type
            .numbers()
            .map(|(major, minor)| makedev(major, minor))
            .unwrap_or(0);
        let mode = Mode::from_raw_mode(entry.perms.map(|perms| perms.mode()).unwrap_or(0o600) as _);

        mknodat(CWD, path.as_path(), file_type, mode, dev)
            .map_err(|errno| io_error(path, "create device", errno.into()))?;

        self.apply_metadata(entry, path, false)
    }

    fn install_nonexistent(&self, entry: &DeclaredEntry, declared: &DeclaredPaths) -> Result<()> {
        let path = &entry.name;
        if entry.recursive {
            // INVARIANT: Never remove a subtree that holds something else declared.
            let managed = declared.descendants_of(path);
            if !managed.is_empty() {
                return Err(InstallError::ManagedSubtree {
                    path: path.clone(),
                    managed,
                });
            }
        }

        self.paranoid_backup(entry);
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(io_error(path, "examine", source)),
        };

        let removed = if metadata.is_dir() && entry.recursive {
            fs::remove_dir_all(path)
        } else if metadata.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        removed.map_err(|source| io_error(path, "remove", source))
    }

    fn install_permissions(&self, entry: &DeclaredEntry) -> Result<()> {
        let path = &entry.name;
        if fs::symlink_metadata(path).is_err() {
            return Err(InstallError::Missing(path.clone()));
        }
        self.apply_metadata(entry, path, entry.recursive)
    }

    /// Apply shared metadata of entry onto path.
    ///
    /// Every step is attempted even if an earlier one failed, so one bad
    /// attribute does not leave the others untouched.
    pub(crate) fn apply_metadata(&self, entry: &DeclaredEntry, path: &Path, recursive: bool) -> Result<()> {
        let mut failures = Vec::new();
        let is_link = matches!(entry.kind, EntryKind::Symlink { .. });

        let mut targets = vec![path.to_path_buf()];
        if recursive {
            targets.extend(super::descendants(path));
        }

        for target in &targets {
            let target_is_link = target.is_symlink();
            if let Some(ownership) = &entry.ownership {
                let uid = identity::entry_uid(&ownership.owner, &entry.name);
                let gid = identity::entry_gid(&ownership.group, &entry.name);
                let chowned = if is_link || target_is_link {
                    lchown(target, Some(uid), Some(gid))
                } else {
                    chown(target, Some(uid), Some(gid))
                };
                if let Err(err) = chowned {
                    failures.push(format!("set ownership of {}: {err}", target.display()));
                }
            }

            if let (Some(perms), false) = (entry.perms, is_link || target_is_link) {
                let result = fs::set_permissions(target, fs::Permissions::from_mode(perms.mode()));
                if let Err(err) = result {
                    failures.push(format!("set permissions of {}: {err}", target.display()));
                }
            }
        }

        if let Some(label) = &entry.secontext {
            if self.secontext.supported() {
                if let Err(err) = self.secontext.write(path, label, recursive) {
                    failures.push(err.to_string());
                }
            }
        }

        if !is_link {
            let wanted = wanted_acls(entry, path, path.is_dir());
            if !acl::apply(&self.acls, path, &wanted, recursive) {
                failures.push(format!("set ACLs of {}", path.display()));
            }
        }

        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            error!("failed to {failure}");
        }
        Err(InstallError::Metadata {
            path: entry.name.clone(),
            failures,
        })
    }
}

fn io_error(path: &Path, action: &'static str, source: std::io::Error) -> InstallError {
    InstallError::Io {
        action,
        path: path.into(),
        source,
    }
}

/// Installation error types.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("failed to {action} {:?}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to replace directory {:?} with a file", .0.display())]
    Occupied(PathBuf),

    #[error("cannot set permissions of missing path {:?}", .0.display())]
    Missing(PathBuf),

    #[error("refusing to remove {:?}, it holds declared entries: {}", path.display(), display_paths(managed))]
    ManagedSubtree { path: PathBuf, managed: Vec<PathBuf> },

    #[error("failed to prune {} entries from {:?}", failed.len(), path.display())]
    Prune { path: PathBuf, failed: Vec<PathBuf> },

    #[error("failed to apply metadata to {:?}: {}", path.display(), failures.join("; "))]
    Metadata { path: PathBuf, failures: Vec<String> },

    #[error("install of {:?} panicked: {message}", path.display())]
    Panicked { path: PathBuf, message: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Friendly result alias :3
type Result<T, E = InstallError> = std::result::Result<T, E>;
