// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Entry verification.
//!
//! Compare declared state against inspected state axis by axis. Every axis
//! that disagrees becomes a [`Mismatch`], and whatever was observed on disk is
//! recorded as an annotation for reporting. Verification never changes the
//! filesystem.

use crate::{
    entry::{DeclaredEntry, DeclaredPaths, DeviceType, EntryKind},
    identity,
    posix::{
        acl::{self, AclSet, AclStore, AclType, NoAcls},
        content::{self, Comparison, ContentReport},
        inspect::{self, FileKind, Inspection, Stat},
        secontext::SecurityContext,
        PosixTool,
    },
};

use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Attribute of a filesystem object that can disagree with its declaration.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Exists,
    Type,
    Owner,
    Group,
    Perms,
    Mtime,
    Content,
    Target,
    Device,
    Secontext,
    Acl,
    Prune,

    /// State could not be determined at all.
    Unknown,
}

/// One disagreement between declared and current state.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct Mismatch {
    pub axis: Axis,
    pub path: PathBuf,
    pub message: String,
}

impl Display for Mismatch {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.message)
    }
}

/// Observed values of the entry's own path, recorded for reports.
#[derive(Default, Debug, PartialEq, Eq, Clone, Serialize)]
pub struct CurrentState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perms: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secontext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<u32>,
}

/// Outcome of verifying one entry.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Verification {
    /// Every axis that disagrees, in the order checked.
    pub mismatches: Vec<Mismatch>,

    /// Observed values at the entry's own path.
    pub current: CurrentState,

    /// Unmanaged children found in a pruned directory.
    pub extra: Vec<PathBuf>,

    /// Bounded description of a content difference.
    pub content: Option<ContentReport>,
}

impl Verification {
    /// Verification whose outcome could not be determined.
    pub fn unknown(path: &Path, message: impl Into<String>) -> Self {
        let mut result = Self::default();
        result.push(Axis::Unknown, path, message);
        result
    }

    /// Check if current state matches declared state on every axis.
    pub fn matches(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Human readable explanation of every mismatch.
    pub fn explanation(&self) -> String {
        self.mismatches
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn push(&mut self, axis: Axis, path: &Path, message: impl Into<String>) {
        let message = message.into();
        debug!("{message}");
        self.mismatches.push(Mismatch {
            axis,
            path: path.into(),
            message,
        });
    }
}

/// Named ACL entries an entry wants on a path.
///
/// Default entries are dropped for anything that is not a directory, since
/// only directories can hold them.
pub(crate) fn wanted_acls(entry: &DeclaredEntry, path: &Path, is_dir: bool) -> AclSet {
    let mut wanted = acl::declared_to_normalized(&entry.acls);
    if !is_dir {
        let before = wanted.len();
        wanted.retain(|key, _| key.kind != AclType::Default);
        if wanted.len() != before {
            warn!("ignoring default ACLs declared for non-directory {}", path.display());
        }
    }
    wanted
}

fn describe_id(id: u32, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{name} ({id})"),
        None => id.to_string(),
    }
}

impl<A, S> PosixTool<'_, A, S>
where
    A: AclStore,
    S: SecurityContext,
{
    /// Verify entry against current state.
    ///
    /// Needs the full set of declared paths, so that pruning can tell managed
    /// children from unmanaged ones.
    #[instrument(skip(self, entry, declared), fields(path = %entry.name.display()), level = "debug")]
    pub fn verify(&self, entry: &DeclaredEntry, declared: &DeclaredPaths) -> Verification {
        let mut result = Verification::default();
        if entry.kind == EntryKind::Nonexistent {
            self.verify_nonexistent(entry, &mut result);
            return result;
        }

        // INVARIANT: Never look through a symlink occupying the path.
        let inspection = self.inspect(&entry.name, false);
        let Some(stat) = &inspection.stat else {
            result.current.exists = Some(false);
            result.push(
                Axis::Exists,
                &entry.name,
                format!("{} {} does not exist", entry.kind, entry.name.display()),
            );
            return result;
        };
        result.current.exists = Some(true);

        match &entry.kind {
            EntryKind::File {
                content,
                binary,
                mtime,
            } => self.verify_file(entry, content, *binary, *mtime, stat, &mut result),
            EntryKind::Directory { prune } => {
                self.verify_directory(entry, *prune, stat, declared, &mut result)
            }
            EntryKind::Symlink { to } => verify_symlink(entry, to, &inspection, &mut result),
            EntryKind::Hardlink { to } => verify_hardlink(entry, to, stat, &mut result),
            EntryKind::Device { dev_type } => verify_device(entry, dev_type, stat, &mut result),
            EntryKind::Permissions | EntryKind::Nonexistent => {}
        }

        self.verify_metadata(entry, &inspection, &mut result, true);
        if entry.recursive && stat.kind == FileKind::Directory {
            for child in self.inspect_recursive(&entry.name) {
                self.verify_metadata(entry, &child, &mut result, false);
            }
        }

        result
    }

    fn verify_nonexistent(&self, entry: &DeclaredEntry, result: &mut Verification) {
        match fs::symlink_metadata(&entry.name) {
            Ok(_) => {
                result.current.exists = Some(true);
                result.push(
                    Axis::Exists,
                    &entry.name,
                    format!("{} exists but should not", entry.name.display()),
                );
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                result.current.exists = Some(false);
            }
            Err(err) => result.push(
                Axis::Exists,
                &entry.name,
                format!("cannot determine if {} exists: {err}", entry.name.display()),
            ),
        }
    }

    fn verify_file(
        &self,
        entry: &DeclaredEntry,
        desired: &[u8],
        binary: bool,
        mtime: Option<i64>,
        stat: &Stat,
        result: &mut Verification,
    ) {
        let path = &entry.name;
        if stat.kind != FileKind::File {
            result.push(
                Axis::Type,
                path,
                format!("{} is a {}, not a file", path.display(), stat.kind.as_str()),
            );
            return;
        }

        let current = match content::compare(path, stat.size, desired) {
            Ok(Comparison::Same) => None,
            Ok(Comparison::SizeDiffers) => Some(None),
            Ok(Comparison::BytesDiffer(current)) => Some(Some(current)),
            Err(err) => {
                result.push(
                    Axis::Content,
                    path,
                    format!("cannot read content of {}: {err}", path.display()),
                );
                return;
            }
        };

        if let Some(current) = current {
            result.push(
                Axis::Content,
                path,
                format!("content of {} is incorrect", path.display()),
            );

            // INVARIANT: Sensitive content never reaches a report.
            if !entry.sensitive {
                let settings = &self.config.report;
                let encoding = self.config.encoding;
                let described = match current.map(Ok).unwrap_or_else(|| fs::read(path)) {
                    Ok(current) => {
                        content::describe(path, &current, desired, binary, encoding, settings)
                    }
                    Err(err) => ContentReport::Unavailable {
                        reason: err.to_string(),
                    },
                };
                result.content = Some(described);
            }
        }

        if let Some(mtime) = mtime {
            result.current.mtime = Some(stat.mtime);
            if stat.mtime != mtime {
                result.push(
                    Axis::Mtime,
                    path,
                    format!(
                        "modification time of {} is {}, should be {mtime}",
                        path.display(),
                        stat.mtime
                    ),
                );
            }
        }
    }

    fn verify_directory(
        &self,
        entry: &DeclaredEntry,
        prune: bool,
        stat: &Stat,
        declared: &DeclaredPaths,
        result: &mut Verification,
    ) {
        let path = &entry.name;
        if stat.kind != FileKind::Directory {
            result.push(
                Axis::Type,
                path,
                format!("{} is a {}, not a directory", path.display(), stat.kind.as_str()),
            );
            return;
        }

        if !prune {
            return;
        }

        let children = match fs::read_dir(path) {
            Ok(children) => children,
            Err(err) => {
                warn!("cannot list {} for pruning: {err}", path.display());
                return;
            }
        };

        let mut extra: Vec<PathBuf> = children
            .flatten()
            .map(|child| child.path())
            .filter(|child| !declared.manages(child))
            .collect();
        if extra.is_empty() {
            return;
        }

        extra.sort();
        let names = extra
            .iter()
            .map(|child| child.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        result.push(
            Axis::Prune,
            path,
            format!("directory {} contains extra entries: {names}", path.display()),
        );
        result.extra = extra;
    }

    fn verify_metadata(
        &self,
        entry: &DeclaredEntry,
        inspection: &Inspection,
        result: &mut Verification,
        annotate: bool,
    ) {
        let Some(stat) = &inspection.stat else {
            return;
        };
        let path = &inspection.path;
        let is_link = stat.kind == FileKind::Symlink;

        if let Some(ownership) = &entry.ownership {
            let uid = identity::entry_uid(&ownership.owner, path);
            let gid = identity::entry_gid(&ownership.group, path);
            if annotate {
                result.current.owner = Some(stat.uid.to_string());
                result.current.group = Some(stat.gid.to_string());
            }
            if stat.uid != uid {
                result.push(
                    Axis::Owner,
                    path,
                    format!(
                        "owner of {} is {}, should be {}",
                        path.display(),
                        describe_id(stat.uid, stat.owner.as_deref()),
                        describe_id(uid, identity::user_name(uid).as_deref()),
                    ),
                );
            }
            if stat.gid != gid {
                result.push(
                    Axis::Group,
                    path,
                    format!(
                        "group of {} is {}, should be {}",
                        path.display(),
                        describe_id(stat.gid, stat.group.as_deref()),
                        describe_id(gid, identity::group_name(gid).as_deref()),
                    ),
                );
            }
        }

        if let (Some(perms), false) = (entry.perms, is_link) {
            if annotate {
                result.current.perms = Some(format!("{:04o}", stat.mode));
            }
            if stat.mode != perms.mode() {
                result.push(
                    Axis::Perms,
                    path,
                    format!(
                        "permissions of {} are {:04o}, should be {perms}",
                        path.display(),
                        stat.mode
                    ),
                );
            }
        }

        if let Some(label) = &entry.secontext {
            if self.secontext.supported() {
                if annotate {
                    result.current.secontext = inspection.secontext.clone();
                }
                match self.secontext.desired_label(path, label) {
                    Ok(wanted) if inspection.secontext.as_deref() == Some(wanted.as_str()) => {}
                    Ok(wanted) => result.push(
                        Axis::Secontext,
                        path,
                        format!(
                            "security context of {} is {}, should be {wanted}",
                            path.display(),
                            inspection.secontext.as_deref().unwrap_or("unknown"),
                        ),
                    ),
                    Err(err) => result.push(Axis::Secontext, path, err.to_string()),
                }
            }
        }

        if !is_link {
            self.verify_acls(entry, inspection, stat, result);
        }
    }

    fn verify_acls(
        &self,
        entry: &DeclaredEntry,
        inspection: &Inspection,
        stat: &Stat,
        result: &mut Verification,
    ) {
        let path = &inspection.path;
        if !self.acls.supported() {
            if !entry.acls.is_empty() {
                NoAcls::notice();
            }
            return;
        }

        let wanted = wanted_acls(entry, path, stat.kind == FileKind::Directory);
        match &inspection.acls {
            Some(existing) => {
                for line in acl::diff(&wanted, existing).lines() {
                    result.push(Axis::Acl, path, format!("{}: {line}", path.display()));
                }
            }
            None if !wanted.is_empty() => result.push(
                Axis::Acl,
                path,
                format!("cannot read ACLs of {}", path.display()),
            ),
            None => {}
        }
    }
}

fn verify_symlink(entry: &DeclaredEntry, to: &Path, inspection: &Inspection, result: &mut Verification) {
    let path = &entry.name;
    let kind = inspection.stat.as_ref().map(|stat| stat.kind);
    if kind != Some(FileKind::Symlink) {
        result.push(
            Axis::Type,
            path,
            format!("{} is not a symlink", path.display()),
        );
        return;
    }

    result.current.to = inspection.link_target.clone();
    if inspection.link_target.as_deref() != Some(to) {
        result.push(
            Axis::Target,
            path,
            format!(
                "symlink {} points to {}, should point to {}",
                path.display(),
                inspection
                    .link_target
                    .as_deref()
                    .map(|target| target.display().to_string())
                    .unwrap_or_else(|| "nothing".into()),
                to.display()
            ),
        );
    }
}

fn verify_hardlink(entry: &DeclaredEntry, to: &Path, stat: &Stat, result: &mut Verification) {
    let linked = inspect::stat(to, true)
        .is_some_and(|target| target.dev == stat.dev && target.ino == stat.ino);
    if !linked {
        result.push(
            Axis::Target,
            &entry.name,
            format!(
                "hardlink {} is not linked to {}",
                entry.name.display(),
                to.display()
            ),
        );
    }
}

fn verify_device(entry: &DeclaredEntry, dev_type: &DeviceType, stat: &Stat, result: &mut Verification) {
    let path = &entry.name;
    let expect = match dev_type {
        DeviceType::Block { .. } => FileKind::Block,
        DeviceType::Char { .. } => FileKind::Char,
        DeviceType::Fifo => FileKind::Fifo,
    };
    if stat.kind != expect {
        result.push(
            Axis::Type,
            path,
            format!(
                "{} is a {}, should be a {}",
                path.display(),
                stat.kind.as_str(),
                expect.as_str()
            ),
        );
        return;
    }

    let Some((major, minor)) = dev_type.numbers() else {
        return;
    };
    let current_major = rustix::fs::major(stat.rdev as _);
    let current_minor = rustix::fs::minor(stat.rdev as _);
    result.current.major = Some(current_major);
    result.current.minor = Some(current_minor);
    if (current_major, current_minor) != (major, minor) {
        result.push(
            Axis::Device,
            path,
            format!(
                "device {} is {current_major}:{current_minor}, should be {major}:{minor}",
                path.display()
            ),
        );
    }
}
