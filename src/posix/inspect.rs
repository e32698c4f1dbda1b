// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Current state inspection.
//!
//! Read what is actually on disk at a path, without interpreting it against
//! anything declared. Inspection never fails outright. Anything that cannot
//! be read is recorded as unknown, and verification treats unknown as a
//! mismatch wherever a constraint was declared.

use crate::{
    identity,
    posix::{acl::AclSet, PosixTool},
};

use std::{
    fs::{self, Metadata},
    io::ErrorKind,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

use super::{acl::AclStore, secontext::SecurityContext};

/// Kind of filesystem object found on disk.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Block,
    Char,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
            Self::Block => "block device",
            Self::Char => "character device",
            Self::Fifo => "fifo",
            Self::Socket => "socket",
        }
    }
}

/// Status of an existing filesystem object.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Stat {
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    pub owner: Option<String>,
    pub group: Option<String>,

    /// Permission bits only, file type stripped.
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub dev: u64,
    pub ino: u64,
    pub rdev: u64,
}

impl From<&Metadata> for Stat {
    fn from(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_block_device() {
            FileKind::Block
        } else if file_type.is_char_device() {
            FileKind::Char
        } else if file_type.is_fifo() {
            FileKind::Fifo
        } else if file_type.is_socket() {
            FileKind::Socket
        } else {
            FileKind::File
        };

        Self {
            kind,
            uid: metadata.uid(),
            gid: metadata.gid(),
            owner: identity::user_name(metadata.uid()),
            group: identity::group_name(metadata.gid()),
            mode: metadata.mode() & 0o7777,
            size: metadata.size(),
            mtime: metadata.mtime(),
            dev: metadata.dev(),
            ino: metadata.ino(),
            rdev: metadata.rdev(),
        }
    }
}

/// Everything known about current state at one path.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Inspection {
    pub path: PathBuf,

    /// Status, or nothing if path does not exist or cannot be examined.
    pub stat: Option<Stat>,

    /// Symlink target, for symlinks only.
    pub link_target: Option<PathBuf>,

    /// Current security label, if it could be read.
    pub secontext: Option<String>,

    /// Named ACL entries, if they could be read.
    pub acls: Option<AclSet>,
}

impl Inspection {
    pub fn exists(&self) -> bool {
        self.stat.is_some()
    }
}

/// Stat path, following symlinks unless told not to.
///
/// Anything other than a plain "not found" is logged before being treated
/// as absent.
pub fn stat(path: &Path, follow: bool) -> Option<Stat> {
    let result = if follow {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    };

    match result {
        Ok(metadata) => Some(Stat::from(&metadata)),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            warn!("cannot stat {}: {err}", path.display());
            None
        }
    }
}

impl<A, S> PosixTool<'_, A, S>
where
    A: AclStore,
    S: SecurityContext,
{
    /// Inspect current state of a single path.
    ///
    /// Symlinks are examined themselves when `follow` is unset. ACLs are
    /// never read through a symlink.
    #[instrument(skip(self), level = "debug")]
    pub fn inspect(&self, path: &Path, follow: bool) -> Inspection {
        let stat = stat(path, follow);
        let mut inspection = Inspection {
            path: path.into(),
            stat,
            link_target: None,
            secontext: None,
            acls: None,
        };

        let Some(stat) = &inspection.stat else {
            return inspection;
        };

        if stat.kind == FileKind::Symlink {
            inspection.link_target = fs::read_link(path).ok();
        }

        if self.secontext.supported() {
            inspection.secontext = self.secontext.read(path, follow).unwrap_or_else(|err| {
                debug!("{err}");
                None
            });
        }

        if stat.kind != FileKind::Symlink && self.acls.supported() {
            inspection.acls = self
                .acls
                .read(path)
                .inspect_err(|err| debug!("{err}"))
                .ok();
        }

        inspection
    }

    /// Inspect every descendant of a directory.
    ///
    /// Takes a single listing snapshot. Symlinks are never followed.
    pub fn inspect_recursive(&self, path: &Path) -> Vec<Inspection> {
        super::descendants(path)
            .into_iter()
            .map(|child| self.inspect(&child, false))
            .collect()
    }
}
