// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Security context labels.
//!
//! Labels live in the `security.selinux` extended attribute. Policy defaults
//! are asked of the system policy tools, `matchpathcon` for lookup and
//! `restorecon` for restoring, rather than re-implementing file context
//! matching here.

use crate::entry::SeContext;

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, instrument};

/// Extended attribute holding the security label.
pub const SELINUX_XATTR: &str = "security.selinux";

/// Backend that reads and writes security labels.
pub trait SecurityContext {
    /// Determine if security labeling is active on this system.
    fn supported(&self) -> bool;

    /// Read current label of path.
    ///
    /// Symlinks are followed only when `follow` is set.
    ///
    /// # Errors
    ///
    /// - Return [`SecontextError::Read`] if the label cannot be read.
    fn read(&self, path: &Path, follow: bool) -> Result<Option<String>>;

    /// Label policy assigns to path by default.
    ///
    /// # Errors
    ///
    /// - Return [`SecontextError::Policy`] if policy has no answer for path.
    fn default_label(&self, path: &Path) -> Result<String>;

    /// Set label of path, and of every descendant when recursive.
    ///
    /// # Errors
    ///
    /// - Return [`SecontextError::Write`] if any label cannot be set.
    fn write(&self, path: &Path, label: &SeContext, recursive: bool) -> Result<()>;

    /// Resolve the concrete label wanted for path.
    ///
    /// # Errors
    ///
    /// - Return [`SecontextError::Policy`] if the default label is wanted
    ///   but policy has no answer for path.
    fn desired_label(&self, path: &Path, label: &SeContext) -> Result<String> {
        match label {
            SeContext::Default => self.default_label(path),
            SeContext::Label(label) => Ok(label.clone()),
        }
    }
}

/// Backend for systems without security labeling.
///
/// Every label check passes and every write is a no-op.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoSecurityContext;

impl SecurityContext for NoSecurityContext {
    fn supported(&self) -> bool {
        false
    }

    fn read(&self, _: &Path, _: bool) -> Result<Option<String>> {
        Ok(None)
    }

    fn default_label(&self, _: &Path) -> Result<String> {
        Ok(String::new())
    }

    fn write(&self, _: &Path, _: &SeContext, _: bool) -> Result<()> {
        Ok(())
    }
}

/// SELinux labeling through extended attributes and policy tools.
#[derive(Debug, Clone)]
pub struct SelinuxContext {
    enforce_file: PathBuf,
}

impl Default for SelinuxContext {
    fn default() -> Self {
        Self {
            enforce_file: PathBuf::from("/sys/fs/selinux/enforce"),
        }
    }
}

impl SecurityContext for SelinuxContext {
    fn supported(&self) -> bool {
        self.enforce_file.exists()
    }

    fn read(&self, path: &Path, follow: bool) -> Result<Option<String>> {
        let value = if follow {
            xattr::get_deref(path, SELINUX_XATTR)
        } else {
            xattr::get(path, SELINUX_XATTR)
        }
        .map_err(|source| SecontextError::Read {
            path: path.into(),
            source,
        })?;

        Ok(value.map(|bytes| {
            // INVARIANT: Labels are stored NUL terminated.
            let bytes = bytes.strip_suffix(&[0]).unwrap_or(&bytes[..]);
            String::from_utf8_lossy(bytes).into_owned()
        }))
    }

    #[instrument(skip(self), level = "debug")]
    fn default_label(&self, path: &Path) -> Result<String> {
        let label = syscall_non_interactive("matchpathcon", [OsStr::new("-n"), path.as_os_str()])
            .map_err(|source| SecontextError::Policy {
                path: path.into(),
                source,
            })?;
        debug!("policy default label of {} is {label}", path.display());
        Ok(label)
    }

    #[instrument(skip(self), level = "debug")]
    fn write(&self, path: &Path, label: &SeContext, recursive: bool) -> Result<()> {
        let write_err = |source: std::io::Error| SecontextError::Write {
            path: path.into(),
            source,
        };

        match label {
            SeContext::Default => {
                let mut args = Vec::new();
                if recursive {
                    args.push(OsStr::new("-R"));
                }
                args.push(path.as_os_str());
                syscall_non_interactive("restorecon", args).map_err(write_err)?;
            }
            SeContext::Label(label) => {
                let mut targets = vec![path.to_path_buf()];
                if recursive {
                    targets.extend(super::descendants(path));
                }
                for target in targets {
                    xattr::set(&target, SELINUX_XATTR, label.as_bytes()).map_err(|source| {
                        SecontextError::Write {
                            path: target.clone(),
                            source,
                        }
                    })?;
                }
            }
        }

        Ok(())
    }
}

fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> std::io::Result<String> {
    let output = Command::new(cmd.as_ref()).args(args).output()?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "command {:?} failed: {}",
            cmd.as_ref(),
            stderr.trim_end()
        )));
    }

    // INVARIANT: Chomp trailing newlines.
    Ok(stdout.trim_end().to_string())
}

/// Security context error types.
#[derive(Debug, thiserror::Error)]
pub enum SecontextError {
    #[error("failed to read security context of {:?}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set security context of {:?}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no default security context for {:?}, missing fcontext rule?", path.display())]
    Policy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = SecontextError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn no_security_context_is_inert() -> anyhow::Result<()> {
        let ctx = NoSecurityContext;
        assert!(!ctx.supported());
        assert_eq!(ctx.read(Path::new("/"), true)?, None);
        ctx.write(Path::new("/nonexistent"), &SeContext::Default, true)?;
        Ok(())
    }

    #[test]
    fn literal_label_needs_no_policy() -> anyhow::Result<()> {
        let ctx = NoSecurityContext;
        let label = SeContext::Label("system_u:object_r:etc_t:s0".into());
        assert_eq!(
            ctx.desired_label(Path::new("/etc/motd"), &label)?,
            "system_u:object_r:etc_t:s0"
        );
        Ok(())
    }

    #[test]
    fn selinux_unsupported_without_enforce_file() {
        let ctx = SelinuxContext {
            enforce_file: PathBuf::from("/nonexistent/fsconverge/enforce"),
        };
        assert!(!ctx.supported());
    }

    #[test]
    fn failed_command_is_an_error() {
        assert!(syscall_non_interactive("false", [""; 0]).is_err());
        assert_eq!(
            syscall_non_interactive("echo", ["label_t"]).unwrap(),
            "label_t"
        );
    }
}
