// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Declared entries.
//!
//! A __declared entry__ is one unit of desired filesystem state. Entries
//! arrive grouped into __bundles__ inside a specification document. Every
//! attribute of a raw entry is optional on the wire, so each raw record is
//! validated into a [`DeclaredEntry`] whose [`EntryKind`] carries exactly the
//! data its type requires. Records that fail validation are __incomplete__:
//! they are reported, but never verified or installed.
//!
//! # Specification Layout
//!
//! ```toml
//! [[bundle]]
//! name = "motd"
//!
//! [[bundle.path]]
//! name = "/etc/motd"
//! type = "file"
//! owner = "root"
//! group = "root"
//! perms = "0644"
//! content = "hello\n"
//! ```

use crate::{
    config::TextEncoding,
    posix::acl::{parse_perm_string, AclPerms, AclScope, AclType},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Sentinel label asking for the policy default security context.
pub const DEFAULT_SECONTEXT: &str = "__default__";

/// Specification document holding bundles of raw entries.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Specification {
    /// Bundles of the specification, in declaration order.
    #[serde(rename = "bundle", default)]
    pub bundles: Vec<Bundle>,
}

impl FromStr for Specification {
    type Err = EntryError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(EntryError::Deserialize)
    }
}

impl Specification {
    /// Collect every declared path name across all bundles.
    ///
    /// Incomplete entries still count. They are part of what the
    /// specification manages, even if they cannot be acted upon.
    pub fn declared_paths(&self) -> DeclaredPaths {
        DeclaredPaths(
            self.bundles
                .iter()
                .flat_map(|bundle| bundle.paths.iter())
                .filter_map(|raw| raw.name.as_deref())
                .map(PathBuf::from)
                .collect(),
        )
    }
}

/// Logical group of entries.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Bundle {
    /// Name of the bundle.
    pub name: String,

    /// Entries not tied to a bundle proper.
    #[serde(default)]
    pub independent: bool,

    /// Path entries of the bundle.
    #[serde(rename = "path", default)]
    pub paths: Vec<RawEntry>,
}

/// Entry exactly as received, before validation.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RawEntry {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub perms: Option<String>,
    pub content: Option<String>,
    pub encoding: Option<String>,
    pub empty: Option<bool>,
    pub to: Option<String>,
    pub dev_type: Option<String>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub mtime: Option<i64>,
    pub recursive: Option<bool>,
    pub prune: Option<bool>,
    pub sensitive: Option<bool>,
    pub paranoid: Option<bool>,
    pub secontext: Option<String>,
    pub failure: Option<String>,
    #[serde(rename = "acl", default)]
    pub acls: Vec<RawAcl>,
}

impl RawEntry {
    /// Entry type as declared, or `file` when only content implies it.
    pub fn kind_name(&self) -> &str {
        match (&self.kind, &self.content) {
            (Some(kind), _) => kind.as_str(),
            (None, Some(_)) => "file",
            (None, None) => "unknown",
        }
    }
}

/// ACL declaration exactly as received.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RawAcl {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub scope: Option<String>,
    pub qualifier: Option<String>,
    pub perms: Option<String>,
}

/// Validated desired state of one filesystem object.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DeclaredEntry {
    /// Absolute path of the object.
    pub name: PathBuf,

    /// Type of object and its type-specific data.
    pub kind: EntryKind,

    /// Desired owner and group. Absent only for [`EntryKind::Nonexistent`].
    pub ownership: Option<Ownership>,

    /// Desired permission bits. Absent for links and nonexistent entries.
    pub perms: Option<Perms>,

    /// Desired security label.
    pub secontext: Option<SeContext>,

    /// Desired ACL entries, in declaration order.
    pub acls: Vec<AclDecl>,

    /// Propagate metadata to every descendant.
    pub recursive: bool,

    /// Never place content or diffs into reports.
    pub sensitive: bool,

    /// Request a backup before overwriting.
    pub paranoid: bool,
}

impl DeclaredEntry {
    /// Validate raw entry.
    ///
    /// # Errors
    ///
    /// - Return [`EntryError::Incomplete`] if required attributes are missing.
    /// - Return [`EntryError::UnknownType`] for unknown entry types.
    /// - Return other variants for malformed attribute values.
    pub fn from_raw(raw: &RawEntry, encoding: TextEncoding) -> Result<Self> {
        let name = raw
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(EntryError::Unnamed)?;
        let name = PathBuf::from(name);
        if !name.is_absolute() {
            return Err(EntryError::RelativePath(name));
        }

        let kind_name = raw.kind_name().to_string();
        let mut missing = Vec::new();
        let mut require = |attr: &'static str, present: bool| {
            if !present {
                missing.push(attr);
            }
        };

        let needs_perms = matches!(
            kind_name.as_str(),
            "device" | "directory" | "file" | "permissions"
        );
        let needs_owner = kind_name != "nonexistent";
        if needs_owner {
            require("owner", raw.owner.as_deref().is_some_and(|v| !v.is_empty()));
            require("group", raw.group.as_deref().is_some_and(|v| !v.is_empty()));
        }
        if needs_perms {
            require("perms", raw.perms.as_deref().is_some_and(|v| !v.is_empty()));
        }

        match kind_name.as_str() {
            "file" => require(
                "content",
                raw.content.is_some() || raw.empty.unwrap_or(false),
            ),
            "symlink" | "hardlink" => {
                require("to", raw.to.as_deref().is_some_and(|v| !v.is_empty()))
            }
            "device" => {
                require("dev_type", raw.dev_type.is_some());
                if matches!(raw.dev_type.as_deref(), Some("block" | "char")) {
                    require("major", raw.major.is_some());
                    require("minor", raw.minor.is_some());
                }
            }
            "directory" | "nonexistent" | "permissions" => {}
            other => return Err(EntryError::UnknownType(other.into())),
        }

        if !missing.is_empty() {
            return Err(EntryError::Incomplete { name, missing });
        }

        let kind = match kind_name.as_str() {
            "device" => EntryKind::Device {
                dev_type: DeviceType::from_raw(raw)?,
            },
            "directory" => EntryKind::Directory {
                prune: raw.prune.unwrap_or(false),
            },
            "file" => {
                let (content, binary) = decode_content(raw, encoding)?;
                EntryKind::File {
                    content,
                    binary,
                    mtime: raw.mtime,
                }
            }
            "hardlink" => EntryKind::Hardlink {
                to: raw.to.clone().unwrap_or_default().into(),
            },
            "nonexistent" => EntryKind::Nonexistent,
            "permissions" => EntryKind::Permissions,
            _ => EntryKind::Symlink {
                to: raw.to.clone().unwrap_or_default().into(),
            },
        };

        let ownership = match (&raw.owner, &raw.group) {
            (Some(owner), Some(group)) if needs_owner => Some(Ownership {
                owner: owner.clone(),
                group: group.clone(),
            }),
            _ => None,
        };

        let perms = match &raw.perms {
            Some(perms) if needs_perms => Some(perms.parse()?),
            _ => None,
        };

        let acls = raw
            .acls
            .iter()
            .map(AclDecl::from_raw)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            kind,
            ownership,
            perms,
            secontext: raw.secontext.as_deref().map(SeContext::from),
            acls,
            recursive: raw.recursive.unwrap_or(false),
            sensitive: raw.sensitive.unwrap_or(false),
            paranoid: raw.paranoid.unwrap_or(false),
        })
    }

    /// Entry type as a lowercase word.
    pub fn kind_name(&self) -> &'static str {
        self.kind.as_str()
    }
}

fn decode_content(raw: &RawEntry, encoding: TextEncoding) -> Result<(Vec<u8>, bool)> {
    let text = match &raw.content {
        Some(text) => text,
        // INVARIANT: Completeness check guarantees the empty flag here.
        None => return Ok((Vec::new(), false)),
    };

    if raw.encoding.as_deref() == Some("base64") {
        let compact: String = text.split_whitespace().collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|source| EntryError::Base64 {
                name: raw.name.clone().unwrap_or_default(),
                source,
            })?;
        return Ok((bytes, true));
    }

    if !encoding.decodes(text.as_bytes()) {
        return Err(EntryError::Encoding {
            name: raw.name.clone().unwrap_or_default(),
            encoding,
        });
    }

    Ok((text.as_bytes().to_vec(), false))
}

/// Type of filesystem object along with type-specific desired data.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum EntryKind {
    /// Block device, character device, or FIFO.
    Device { dev_type: DeviceType },

    /// Directory, optionally pruned of unmanaged children.
    Directory { prune: bool },

    /// Regular file with decoded content.
    File {
        content: Vec<u8>,
        binary: bool,
        mtime: Option<i64>,
    },

    /// Hard link to another path.
    Hardlink { to: PathBuf },

    /// Path that must not exist.
    Nonexistent,

    /// Metadata only on a pre-existing path.
    Permissions,

    /// Symbolic link to target.
    Symlink { to: PathBuf },
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device { .. } => "device",
            Self::Directory { .. } => "directory",
            Self::File { .. } => "file",
            Self::Hardlink { .. } => "hardlink",
            Self::Nonexistent => "nonexistent",
            Self::Permissions => "permissions",
            Self::Symlink { .. } => "symlink",
        }
    }
}

impl Display for EntryKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Device node type.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeviceType {
    Block { major: u32, minor: u32 },
    Char { major: u32, minor: u32 },
    Fifo,
}

impl DeviceType {
    fn from_raw(raw: &RawEntry) -> Result<Self> {
        let major = raw.major.unwrap_or_default();
        let minor = raw.minor.unwrap_or_default();
        match raw.dev_type.as_deref() {
            Some("block") => Ok(Self::Block { major, minor }),
            Some("char") => Ok(Self::Char { major, minor }),
            Some("fifo") => Ok(Self::Fifo),
            other => Err(EntryError::UnknownDeviceType(
                other.unwrap_or_default().into(),
            )),
        }
    }

    /// Major and minor numbers, if the device type has them.
    pub fn numbers(&self) -> Option<(u32, u32)> {
        match *self {
            Self::Block { major, minor } | Self::Char { major, minor } => Some((major, minor)),
            Self::Fifo => None,
        }
    }
}

/// Desired owner and group, symbolic or numeric.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Ownership {
    pub owner: String,
    pub group: String,
}

/// Permission bits, always shown zero-padded to four octal digits.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Perms(u32);

impl Perms {
    pub fn new(mode: u32) -> Self {
        Self(mode & 0o7777)
    }

    pub fn mode(&self) -> u32 {
        self.0
    }
}

impl FromStr for Perms {
    type Err = EntryError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mode = u32::from_str_radix(data.trim(), 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| EntryError::BadPerms(data.into()))?;
        Ok(Self(mode))
    }
}

impl Display for Perms {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{:04o}", self.0)
    }
}

/// Desired security label.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SeContext {
    /// Whatever label policy computes for the path.
    Default,

    /// Literal label.
    Label(String),
}

impl From<&str> for SeContext {
    fn from(label: &str) -> Self {
        if label == DEFAULT_SECONTEXT {
            Self::Default
        } else {
            Self::Label(label.into())
        }
    }
}

impl Display for SeContext {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Default => fmt.write_str(DEFAULT_SECONTEXT),
            Self::Label(label) => fmt.write_str(label),
        }
    }
}

/// Validated ACL declaration.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AclDecl {
    pub kind: AclType,
    pub scope: AclScope,
    pub qualifier: String,
    pub perms: AclPerms,
}

impl AclDecl {
    fn from_raw(raw: &RawAcl) -> Result<Self> {
        let kind = match raw.kind.as_deref() {
            None | Some("access") => AclType::Access,
            Some("default") => AclType::Default,
            Some(other) => return Err(EntryError::BadAcl(format!("unknown ACL type {other:?}"))),
        };
        let scope = match raw.scope.as_deref() {
            Some("user") => AclScope::User,
            Some("group") => AclScope::Group,
            other => return Err(EntryError::BadAcl(format!("unknown ACL scope {other:?}"))),
        };
        let qualifier = raw
            .qualifier
            .clone()
            .filter(|qualifier| !qualifier.is_empty())
            .ok_or_else(|| EntryError::BadAcl("ACL without qualifier".into()))?;
        let perms = raw
            .perms
            .as_deref()
            .map(parse_perm_string)
            .ok_or_else(|| EntryError::BadAcl(format!("ACL for {qualifier} without perms")))?;

        Ok(Self {
            kind,
            scope,
            qualifier,
            perms,
        })
    }
}

/// Set of every path named by the specification.
///
/// Read-only during a run. Prune and subtree-safety decisions consult it.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct DeclaredPaths(BTreeSet<PathBuf>);

impl DeclaredPaths {
    pub fn contains(&self, path: &Path) -> bool {
        self.0.contains(path)
    }

    /// List declared paths strictly below given path.
    pub fn descendants_of(&self, path: &Path) -> Vec<PathBuf> {
        self.0
            .iter()
            .filter(|declared| declared.as_path() != path && declared.starts_with(path))
            .cloned()
            .collect()
    }

    /// Check if path is declared, or holds something declared beneath it.
    pub fn manages(&self, path: &Path) -> bool {
        self.contains(path) || !self.descendants_of(path).is_empty()
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for DeclaredPaths {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Specification error types.
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    /// Failed to deserialize specification document.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Entry carries no name.
    #[error("entry has no name")]
    Unnamed,

    /// Entry name is not an absolute path.
    #[error("entry name {:?} is not absolute", .0.display())]
    RelativePath(PathBuf),

    /// Entry type is not one we handle.
    #[error("unknown entry type {0:?}")]
    UnknownType(String),

    /// Entry lacks attributes its type requires.
    #[error("incomplete entry {:?}: missing {}", name.display(), missing.join(":"))]
    Incomplete {
        name: PathBuf,
        missing: Vec<&'static str>,
    },

    /// Entry is declared more than once.
    #[error("entry {:?} declared more than once", .0.display())]
    Duplicate(PathBuf),

    /// Permission string is not a valid octal mode.
    #[error("malformed permissions {0:?}")]
    BadPerms(String),

    /// Device type is not block, char, or fifo.
    #[error("unknown device type {0:?}")]
    UnknownDeviceType(String),

    /// ACL declaration is malformed.
    #[error("malformed ACL: {0}")]
    BadAcl(String),

    /// Base64 content cannot be decoded.
    #[error("cannot decode base64 content of {name:?}")]
    Base64 {
        name: String,
        #[source]
        source: base64::DecodeError,
    },

    /// Text content does not fit configured encoding.
    #[error("content of {name:?} is not valid {encoding:?}")]
    Encoding {
        name: String,
        encoding: TextEncoding,
    },
}

/// Friendly result alias :3
type Result<T, E = EntryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn raw(kind: &str, name: &str) -> RawEntry {
        RawEntry {
            name: Some(name.into()),
            kind: Some(kind.into()),
            owner: Some("root".into()),
            group: Some("root".into()),
            perms: Some("0644".into()),
            ..Default::default()
        }
    }

    #[test]
    fn deserialize_specification() -> anyhow::Result<()> {
        let spec: Specification = r#"
            [[bundle]]
            name = "motd"

            [[bundle.path]]
            name = "/etc/motd"
            type = "file"
            owner = "root"
            group = "root"
            perms = "644"
            content = "hello\n"

            [[bundle.path.acl]]
            type = "default"
            scope = "group"
            qualifier = "wheel"
            perms = "r-x"
        "#
        .parse()?;

        let entry = DeclaredEntry::from_raw(&spec.bundles[0].paths[0], TextEncoding::Utf8)?;
        pretty_assertions::assert_eq!(entry.name, PathBuf::from("/etc/motd"));
        pretty_assertions::assert_eq!(entry.perms.map(|perms| perms.to_string()), Some("0644".into()));
        pretty_assertions::assert_eq!(
            entry.kind,
            EntryKind::File {
                content: b"hello\n".to_vec(),
                binary: false,
                mtime: None,
            }
        );
        pretty_assertions::assert_eq!(
            entry.acls,
            vec![AclDecl {
                kind: AclType::Default,
                scope: AclScope::Group,
                qualifier: "wheel".into(),
                perms: AclPerms::new(5),
            }]
        );

        Ok(())
    }

    #[test]
    fn content_implies_file() -> anyhow::Result<()> {
        let mut entry = raw("file", "/etc/issue");
        entry.kind = None;
        entry.content = Some("aGVsbG8K".into());
        entry.encoding = Some("base64".into());

        let entry = DeclaredEntry::from_raw(&entry, TextEncoding::Utf8)?;
        pretty_assertions::assert_eq!(
            entry.kind,
            EntryKind::File {
                content: b"hello\n".to_vec(),
                binary: true,
                mtime: None,
            }
        );

        Ok(())
    }

    #[test_case("file", &["content"]; "file without content")]
    #[test_case("symlink", &["to"]; "symlink without target")]
    #[test_case("hardlink", &["to"]; "hardlink without target")]
    #[test]
    fn incomplete_entries(kind: &str, expect: &[&str]) {
        let result = DeclaredEntry::from_raw(&raw(kind, "/tmp/x"), TextEncoding::Utf8);
        match result {
            Err(EntryError::Incomplete { missing, .. }) => pretty_assertions::assert_eq!(missing, expect),
            other => panic!("expected incomplete entry, got {other:?}"),
        }
    }

    #[test]
    fn device_requires_numbers_unless_fifo() {
        let mut entry = raw("device", "/dev/thing");
        entry.dev_type = Some("char".into());
        let result = DeclaredEntry::from_raw(&entry, TextEncoding::Utf8);
        assert!(matches!(result, Err(EntryError::Incomplete { .. })));

        entry.dev_type = Some("fifo".into());
        let entry = DeclaredEntry::from_raw(&entry, TextEncoding::Utf8).unwrap();
        pretty_assertions::assert_eq!(
            entry.kind,
            EntryKind::Device {
                dev_type: DeviceType::Fifo
            }
        );
    }

    #[test]
    fn nonexistent_needs_only_name() {
        let entry = RawEntry {
            name: Some("/tmp/gone".into()),
            kind: Some("nonexistent".into()),
            ..Default::default()
        };
        let entry = DeclaredEntry::from_raw(&entry, TextEncoding::Utf8).unwrap();
        pretty_assertions::assert_eq!(entry.kind, EntryKind::Nonexistent);
        pretty_assertions::assert_eq!(entry.ownership, None);
    }

    #[test_case("0644", Some(0o644); "padded")]
    #[test_case("755", Some(0o755); "unpadded")]
    #[test_case("4755", Some(0o4755); "setuid")]
    #[test_case("rw-r--r--", None; "symbolic")]
    #[test_case("17777", None; "too large")]
    #[test]
    fn parse_perms(data: &str, expect: Option<u32>) {
        pretty_assertions::assert_eq!(data.parse::<Perms>().ok().map(|perms| perms.mode()), expect);
    }

    #[test]
    fn reject_relative_and_unknown() {
        let result = DeclaredEntry::from_raw(&raw("file", "etc/motd"), TextEncoding::Utf8);
        assert!(matches!(result, Err(EntryError::RelativePath(_))));

        let result = DeclaredEntry::from_raw(&raw("socket", "/run/x"), TextEncoding::Utf8);
        assert!(matches!(result, Err(EntryError::UnknownType(_))));
    }

    #[test]
    fn ascii_rejects_non_ascii_text() {
        let mut entry = raw("file", "/etc/motd");
        entry.content = Some("héllo".into());
        let result = DeclaredEntry::from_raw(&entry, TextEncoding::Ascii);
        assert!(matches!(result, Err(EntryError::Encoding { .. })));
    }

    #[test]
    fn declared_paths_manage_ancestors() {
        let paths: DeclaredPaths = ["/srv/d", "/srv/d/sub/keep"].into_iter().collect();
        assert!(paths.manages(Path::new("/srv/d/sub")));
        assert!(!paths.manages(Path::new("/srv/d/other")));
        pretty_assertions::assert_eq!(
            paths.descendants_of(Path::new("/srv/d")),
            vec![PathBuf::from("/srv/d/sub/keep")]
        );
    }
}
