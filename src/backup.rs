// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Paranoid backup store.
//!
//! Fsconverge keeps copies of files it is about to overwrite in one place
//! called the __backup store__. Backups exist purely for human recovery.
//! Nothing ever restores them automatically.
//!
//! # Backup Store Layout
//!
//! The backup store is a flat directory, by default `/var/cache/fsconverge`
//! for privileged runs. Each original path gets a __key__ made by replacing
//! every `/` with `_`, and each backup is named after its key followed by an
//! underscore and a sortable local timestamp. So,
//! `_etc_motd_2025-01-01T12:00:00.000000000` is a backup of `/etc/motd`.
//! Names of the same key sort oldest first.
//!
//! At most `max_copies` backups are kept per key. The oldest ones are
//! removed to make room for a new backup.

use chrono::{Local, NaiveDateTime};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{debug, info, instrument};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";
const TIMESTAMP_LEN: usize = "2025-01-01T00:00:00.000000000".len();

/// Directory of timestamped copies of overwritten files.
#[derive(Debug)]
pub struct BackupStore {
    store_path: PathBuf,
    max_copies: usize,

    // INVARIANT: Eviction and copy happen under one lock, one writer at a time.
    lock: Mutex<()>,
}

impl BackupStore {
    pub fn new(store_path: impl Into<PathBuf>, max_copies: usize) -> Self {
        Self {
            store_path: store_path.into(),
            max_copies,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    /// Key of original path inside the store.
    pub fn key(path: &Path) -> String {
        path.to_string_lossy().replace('/', "_")
    }

    /// List existing backups of path, oldest first.
    ///
    /// Only names made of the path's key, an underscore, and a parseable
    /// timestamp count. Anything else in the store is left alone.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::List`] if the store cannot be read.
    pub fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_", Self::key(path));
        let entries = match fs::read_dir(&self.store_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BackupError::List {
                    path: self.store_path.clone(),
                    source,
                })
            }
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let is_backup = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.get(..TIMESTAMP_LEN))
                .is_some_and(|stamp| NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok());
            if is_backup {
                backups.push(entry.path());
            }
        }

        backups.sort();
        Ok(backups)
    }

    /// Copy path into the store, evicting the oldest backups beyond the limit.
    ///
    /// Returns the location of the new backup, or nothing when the store
    /// keeps no copies at all.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Evict`] if an old backup cannot be removed.
    /// - Return [`BackupError::Copy`] if the new backup cannot be written.
    #[instrument(skip(self), level = "debug")]
    pub fn backup(&self, path: &Path) -> Result<Option<PathBuf>> {
        // INVARIANT: A poisoned lock guards nothing but ordering, so keep going.
        let _guard = self.lock.lock().unwrap_or_else(|poison| poison.into_inner());

        if self.max_copies == 0 {
            debug!("backup store keeps no copies, skipping {}", path.display());
            return Ok(None);
        }

        mkdirp::mkdirp(&self.store_path).map_err(|source| BackupError::Copy {
            path: self.store_path.clone(),
            source,
        })?;

        let mut existing = self.list(path)?;
        while existing.len() >= self.max_copies {
            let oldest = existing.remove(0);
            info!("removing old backup {}", oldest.display());
            fs::remove_file(&oldest).map_err(|source| BackupError::Evict {
                path: oldest.clone(),
                source,
            })?;
        }

        let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let mut target = self.store_path.join(format!("{}_{stamp}", Self::key(path)));
        let mut bump = 0;
        while target.exists() {
            bump += 1;
            target = self
                .store_path
                .join(format!("{}_{stamp}-{bump}", Self::key(path)));
        }

        fs::copy(path, &target).map_err(|source| BackupError::Copy {
            path: target.clone(),
            source,
        })?;
        info!("backup of {} saved to {}", path.display(), target.display());

        Ok(Some(target))
    }
}

/// Backup store error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("failed to list backup store {:?}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove old backup {:?}", path.display())]
    Evict {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write backup {:?}", path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = BackupError> = std::result::Result<T, E>;
