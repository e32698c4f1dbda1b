// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Owner and group resolution.
//!
//! Declared entries name their owner and group either numerically or
//! symbolically. Every lookup goes straight to the system user and group
//! databases. Nothing is cached, because those databases may change between
//! reconciliation runs.

use nix::unistd::{Gid, Group, Uid, User};
use std::path::Path;
use tracing::error;

/// Resolve user specification to numeric user ID.
///
/// Numeric strings are parsed directly without touching the user database.
///
/// # Errors
///
/// - Return [`IdentityError::UnknownUser`] if no such user exists.
/// - Return [`IdentityError::Lookup`] if the user database cannot be read.
pub fn resolve_user(spec: &str) -> Result<u32> {
    if let Ok(uid) = spec.parse::<u32>() {
        return Ok(uid);
    }

    User::from_name(spec)
        .map_err(|source| IdentityError::Lookup {
            name: spec.into(),
            source,
        })?
        .map(|user| user.uid.as_raw())
        .ok_or_else(|| IdentityError::UnknownUser(spec.into()))
}

/// Resolve group specification to numeric group ID.
///
/// # Errors
///
/// - Return [`IdentityError::UnknownGroup`] if no such group exists.
/// - Return [`IdentityError::Lookup`] if the group database cannot be read.
pub fn resolve_group(spec: &str) -> Result<u32> {
    if let Ok(gid) = spec.parse::<u32>() {
        return Ok(gid);
    }

    Group::from_name(spec)
        .map_err(|source| IdentityError::Lookup {
            name: spec.into(),
            source,
        })?
        .map(|group| group.gid.as_raw())
        .ok_or_else(|| IdentityError::UnknownGroup(spec.into()))
}

/// Resolve owner of entry, falling back to root.
///
/// Lookup failure is logged against the entry path and degrades to UID 0.
pub fn entry_uid(spec: &str, path: &Path) -> u32 {
    resolve_user(spec).unwrap_or_else(|err| {
        error!("uid normalization failed for {spec} on {}: {err}", path.display());
        0
    })
}

/// Resolve group of entry, falling back to root.
pub fn entry_gid(spec: &str, path: &Path) -> u32 {
    resolve_group(spec).unwrap_or_else(|err| {
        error!("gid normalization failed for {spec} on {}: {err}", path.display());
        0
    })
}

/// Reverse lookup of user name for reporting.
pub fn user_name(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

/// Reverse lookup of group name for reporting.
pub fn group_name(gid: u32) -> Option<String> {
    Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
}

/// Normalize user qualifier to a name when possible.
///
/// Numeric qualifiers become names if the user database knows them. Anything
/// unresolvable is kept as given.
pub fn user_qualifier(qualifier: &str) -> String {
    match qualifier.parse::<u32>() {
        Ok(uid) => user_name(uid).unwrap_or_else(|| qualifier.into()),
        Err(_) => qualifier.into(),
    }
}

/// Normalize group qualifier to a name when possible.
pub fn group_qualifier(qualifier: &str) -> String {
    match qualifier.parse::<u32>() {
        Ok(gid) => group_name(gid).unwrap_or_else(|| qualifier.into()),
        Err(_) => qualifier.into(),
    }
}

/// Identity lookup error types.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Symbolic user name does not exist.
    #[error("no such user {0:?}")]
    UnknownUser(String),

    /// Symbolic group name does not exist.
    #[error("no such group {0:?}")]
    UnknownGroup(String),

    /// System identity database could not be queried.
    #[error("failed to look up {name:?}")]
    Lookup {
        name: String,
        #[source]
        source: nix::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = IdentityError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case("0", 0; "root")]
    #[test_case("1000", 1000; "regular")]
    #[test_case("65534", 65534; "nobody")]
    #[test]
    fn resolve_numeric_user(spec: &str, expect: u32) {
        pretty_assertions::assert_eq!(resolve_user(spec).unwrap(), expect);
    }

    #[test]
    fn resolve_root_by_name() {
        pretty_assertions::assert_eq!(resolve_user("root").unwrap(), 0);
        pretty_assertions::assert_eq!(resolve_group("0").unwrap(), 0);
    }

    #[test]
    fn unknown_user_falls_back_to_root() {
        let missing = "no-such-user-fsconverge";
        assert!(matches!(
            resolve_user(missing),
            Err(IdentityError::UnknownUser(_))
        ));
        pretty_assertions::assert_eq!(entry_uid(missing, Path::new("/tmp/x")), 0);
        pretty_assertions::assert_eq!(entry_gid("no-such-group-fsconverge", Path::new("/tmp/x")), 0);
    }

    #[test]
    fn unresolvable_qualifier_kept_numeric() {
        pretty_assertions::assert_eq!(user_qualifier("4000000000"), "4000000000");
        pretty_assertions::assert_eq!(user_qualifier("alice-not-here"), "alice-not-here");
    }
}
