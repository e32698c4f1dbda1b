// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! POSIX access control lists.
//!
//! Declared and on-disk ACLs are both normalized into an [`AclSet`], a map
//! keyed by `(type, scope, qualifier)`. Only __named__ entries take part.
//! Base entries (owning user, owning group, other) and the mask are handled
//! by ordinary permission bits and are never compared here.

use crate::{entry::AclDecl, identity};

use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
    sync::Once,
};
use tracing::{error, warn};

/// Whether an ACL entry governs access or is inherited by new children.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AclType {
    Access,
    Default,
}

/// Whether an ACL entry names a user or a group.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AclScope {
    User,
    Group,
}

/// Key identifying one named ACL entry.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct AclKey {
    pub kind: AclType,
    pub scope: AclScope,
    pub qualifier: String,
}

impl Display for AclKey {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let scope = match self.scope {
            AclScope::User => "user",
            AclScope::Group => "group",
        };
        if self.kind == AclType::Default {
            fmt.write_str("default:")?;
        }
        write!(fmt, "{scope}:{}", self.qualifier)
    }
}

/// Three-bit permission set of one ACL entry.
#[derive(Default, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct AclPerms(u8);

impl AclPerms {
    pub const READ: u8 = 4;
    pub const WRITE: u8 = 2;
    pub const EXECUTE: u8 = 1;

    pub fn new(bits: u8) -> Self {
        Self(bits & 0o7)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl Display for AclPerms {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let flag = |bit: u8, ch: char| if self.0 & bit != 0 { ch } else { '-' };
        write!(
            fmt,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXECUTE, 'x')
        )
    }
}

/// Normalized named ACL entries of one path.
pub type AclSet = BTreeMap<AclKey, AclPerms>;

/// Parse permission string of an ACL declaration.
///
/// Accepts either a single octal digit or any combination of `r`, `w`, `x`
/// and `-`. Anything else is logged and yields empty permissions, so one bad
/// declaration never takes down the rest of the entry.
pub fn parse_perm_string(data: &str) -> AclPerms {
    let data = data.trim();
    if let Ok(digit) = data.parse::<u8>() {
        if digit <= 7 {
            return AclPerms::new(digit);
        }
    }

    let mut bits = 0;
    for ch in data.chars() {
        bits |= match ch {
            'r' => AclPerms::READ,
            'w' => AclPerms::WRITE,
            'x' => AclPerms::EXECUTE,
            '-' => 0,
            _ => {
                error!("unknown permission character {ch:?} in ACL perms {data:?}");
                return AclPerms::default();
            }
        };
    }

    AclPerms::new(bits)
}

/// Normalize declared ACL entries into a comparable set.
///
/// Numeric qualifiers are replaced by names when the identity databases know
/// them, matching how on-disk entries are read back. Later declarations of
/// the same key win.
pub fn declared_to_normalized(decls: &[AclDecl]) -> AclSet {
    decls
        .iter()
        .map(|decl| {
            let qualifier = match decl.scope {
                AclScope::User => identity::user_qualifier(&decl.qualifier),
                AclScope::Group => identity::group_qualifier(&decl.qualifier),
            };
            let key = AclKey {
                kind: decl.kind,
                scope: decl.scope,
                qualifier,
            };
            (key, decl.perms)
        })
        .collect()
}

/// Difference between wanted and existing ACL sets.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct AclDiff {
    /// Wanted but absent on disk.
    pub missing: Vec<(AclKey, AclPerms)>,

    /// Present with different permissions: key, wanted, existing.
    pub wrong: Vec<(AclKey, AclPerms, AclPerms)>,

    /// Present on disk but not wanted.
    pub extra: Vec<(AclKey, AclPerms)>,
}

impl AclDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.wrong.is_empty() && self.extra.is_empty()
    }

    /// Human readable lines, one per difference.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (key, perms) in &self.missing {
            lines.push(format!("ACL {key} missing, should be {perms}"));
        }
        for (key, wanted, existing) in &self.wrong {
            lines.push(format!("ACL {key} is {existing}, should be {wanted}"));
        }
        for (key, perms) in &self.extra {
            lines.push(format!("extra ACL {key}:{perms}"));
        }
        lines
    }
}

/// Compare wanted ACL set against existing ACL set.
pub fn diff(wanted: &AclSet, existing: &AclSet) -> AclDiff {
    let mut result = AclDiff::default();
    for (key, perms) in wanted {
        match existing.get(key) {
            None => result.missing.push((key.clone(), *perms)),
            Some(current) if current != perms => {
                result.wrong.push((key.clone(), *perms, *current))
            }
            Some(_) => {}
        }
    }
    for (key, perms) in existing {
        if !wanted.contains_key(key) {
            result.extra.push((key.clone(), *perms));
        }
    }
    result
}

/// Backend that reads and writes ACLs on the filesystem.
pub trait AclStore {
    /// Determine if the platform supports ACLs at all.
    fn supported(&self) -> bool;

    /// Read named ACL entries of path.
    ///
    /// # Errors
    ///
    /// - Return error if the ACL cannot be read from path.
    fn read(&self, path: &Path) -> Result<AclSet>;

    /// Replace named ACL entries of path with wanted set.
    ///
    /// Base entries stay as they are. Mask is recomputed afterwards.
    ///
    /// # Errors
    ///
    /// - Return error if the new ACL cannot be written to path.
    fn write(&self, path: &Path, wanted: &AclSet) -> Result<()>;
}

/// Apply wanted ACL set to path, and to every descendant when recursive.
///
/// Paths that hold no named entries and want none are left alone. Returns
/// false if any path could not be updated. Without ACL support, declared
/// entries are ignored with a notice.
pub fn apply<A: AclStore>(store: &A, path: &Path, wanted: &AclSet, recursive: bool) -> bool {
    if !store.supported() {
        if !wanted.is_empty() {
            NoAcls::notice();
        }
        return true;
    }

    let mut targets = vec![path.to_path_buf()];
    if recursive {
        targets.extend(super::descendants(path));
    }

    let mut ok = true;
    for target in targets {
        if wanted.is_empty() {
            match store.read(&target) {
                Ok(existing) if existing.is_empty() => continue,
                Ok(_) => {}
                Err(err) => {
                    warn!("cannot read ACL of {}: {err}", target.display());
                    continue;
                }
            }
        }

        if let Err(err) = store.write(&target, wanted) {
            error!("failed to set ACL of {}: {err}", target.display());
            ok = false;
        }
    }

    ok
}

/// ACL backend for platforms without ACL support.
///
/// Everything succeeds. Declaring ACLs anyway is logged once per process.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoAcls;

static NO_ACL_NOTICE: Once = Once::new();

impl NoAcls {
    /// Log that declared ACLs are being ignored.
    pub fn notice() {
        NO_ACL_NOTICE.call_once(|| {
            warn!("ACLs declared but ACL support is unavailable, ignoring them");
        });
    }
}

impl AclStore for NoAcls {
    fn supported(&self) -> bool {
        false
    }

    fn read(&self, _: &Path) -> Result<AclSet> {
        Ok(AclSet::new())
    }

    fn write(&self, _: &Path, wanted: &AclSet) -> Result<()> {
        if !wanted.is_empty() {
            Self::notice();
        }
        Ok(())
    }
}

#[cfg(all(feature = "acl", target_os = "linux"))]
mod system {
    use super::*;

    use exacl::{getfacl, setfacl, AclEntry, AclEntryKind, AclOption, Flag, Perm};

    /// ACL backend on top of the platform ACL library.
    #[derive(Default, Debug, Clone, Copy)]
    pub struct ExaclStore;

    impl AclStore for ExaclStore {
        fn supported(&self) -> bool {
            true
        }

        fn read(&self, path: &Path) -> Result<AclSet> {
            let mut set = AclSet::new();
            let access = getfacl(path, AclOption::ACCESS_ACL).map_err(|source| AclError::Read {
                path: path.into(),
                source,
            })?;
            collect(&mut set, AclType::Access, &access);

            if path.is_dir() {
                let default =
                    getfacl(path, AclOption::DEFAULT_ACL).map_err(|source| AclError::Read {
                        path: path.into(),
                        source,
                    })?;
                collect(&mut set, AclType::Default, &default);
            }

            Ok(set)
        }

        fn write(&self, path: &Path, wanted: &AclSet) -> Result<()> {
            let is_dir = path.is_dir();
            let read_err = |source: std::io::Error| AclError::Read {
                path: path.into(),
                source,
            };

            let access = getfacl(path, AclOption::ACCESS_ACL).map_err(read_err)?;
            let mut access = base_entries(access, Flag::empty());

            let mut default = Vec::new();
            if is_dir {
                let existing = getfacl(path, AclOption::DEFAULT_ACL).map_err(read_err)?;
                let wants_default = wanted.keys().any(|key| key.kind == AclType::Default);
                if !existing.is_empty() {
                    default = base_entries(existing, Flag::DEFAULT);
                } else if wants_default {
                    // INVARIANT: Default ACL needs base entries, so derive them from access ACL.
                    default = access
                        .iter()
                        .cloned()
                        .map(|mut entry| {
                            entry.flags = Flag::DEFAULT;
                            entry
                        })
                        .collect();
                }
            }

            for (key, perms) in wanted {
                let (target, flags) = match key.kind {
                    AclType::Access => (&mut access, Flag::empty()),
                    AclType::Default if is_dir => (&mut default, Flag::DEFAULT),
                    AclType::Default => {
                        warn!("cannot set default ACL {key} on non-directory {}", path.display());
                        continue;
                    }
                };

                let (kind, id) = match key.scope {
                    AclScope::User => (AclEntryKind::User, identity::resolve_user(&key.qualifier)),
                    AclScope::Group => {
                        (AclEntryKind::Group, identity::resolve_group(&key.qualifier))
                    }
                };
                let id = match id {
                    Ok(id) => id,
                    Err(err) => {
                        error!("cannot resolve ACL qualifier of {key}: {err}");
                        continue;
                    }
                };

                target.push(AclEntry {
                    kind,
                    name: id.to_string(),
                    perms: to_perm(*perms),
                    flags,
                    allow: true,
                });
            }

            add_mask(&mut access, Flag::empty());
            add_mask(&mut default, Flag::DEFAULT);
            access.extend(default);

            setfacl(&[path], &access, AclOption::empty()).map_err(|source| AclError::Write {
                path: path.into(),
                source,
            })
        }
    }

    fn collect(set: &mut AclSet, kind: AclType, entries: &[AclEntry]) {
        for entry in entries {
            if entry.name.is_empty() {
                continue;
            }

            let (scope, qualifier) = match entry.kind {
                AclEntryKind::User => (AclScope::User, identity::user_qualifier(&entry.name)),
                AclEntryKind::Group => (AclScope::Group, identity::group_qualifier(&entry.name)),
                _ => continue,
            };

            let key = AclKey {
                kind,
                scope,
                qualifier,
            };
            set.insert(key, from_perm(entry.perms));
        }
    }

    /// Strip named entries and the mask, keeping owner, group, and other.
    fn base_entries(entries: Vec<AclEntry>, flags: Flag) -> Vec<AclEntry> {
        entries
            .into_iter()
            .filter(|entry| entry.name.is_empty() && entry.kind != AclEntryKind::Mask)
            .map(|mut entry| {
                entry.flags = flags;
                entry
            })
            .collect()
    }

    fn add_mask(entries: &mut Vec<AclEntry>, flags: Flag) {
        let named = entries.iter().any(|entry| !entry.name.is_empty());
        if !named {
            return;
        }

        let perms = entries
            .iter()
            .filter(|entry| {
                entry.kind == AclEntryKind::Group
                    || (entry.kind == AclEntryKind::User && !entry.name.is_empty())
            })
            .fold(Perm::empty(), |acc, entry| acc | entry.perms);

        entries.push(AclEntry {
            kind: AclEntryKind::Mask,
            name: String::new(),
            perms,
            flags,
            allow: true,
        });
    }

    fn to_perm(perms: AclPerms) -> Perm {
        let mut perm = Perm::empty();
        if perms.bits() & AclPerms::READ != 0 {
            perm |= Perm::READ;
        }
        if perms.bits() & AclPerms::WRITE != 0 {
            perm |= Perm::WRITE;
        }
        if perms.bits() & AclPerms::EXECUTE != 0 {
            perm |= Perm::EXECUTE;
        }
        perm
    }

    fn from_perm(perm: Perm) -> AclPerms {
        let mut bits = 0;
        if perm.contains(Perm::READ) {
            bits |= AclPerms::READ;
        }
        if perm.contains(Perm::WRITE) {
            bits |= AclPerms::WRITE;
        }
        if perm.contains(Perm::EXECUTE) {
            bits |= AclPerms::EXECUTE;
        }
        AclPerms::new(bits)
    }
}

#[cfg(all(feature = "acl", target_os = "linux"))]
pub use system::ExaclStore;

/// ACL backend native to the build target.
#[cfg(all(feature = "acl", target_os = "linux"))]
pub type SystemAcls = ExaclStore;

/// ACL backend native to the build target.
#[cfg(not(all(feature = "acl", target_os = "linux")))]
pub type SystemAcls = NoAcls;

/// ACL error types.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("failed to read ACL of {:?}", path.display())]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write ACL of {:?}", path.display())]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = AclError> = std::result::Result<T, E>;
