// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

mod integration;

use fsconverge::{
    config::ClientConfig,
    driver::{Confirm, Reconciler},
    entry::Specification,
    posix::{acl::NoAcls, secontext::NoSecurityContext, PosixTool},
    report::RunReport,
};

use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch root to reconcile specifications against.
pub(crate) struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub(crate) fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Render specification template.
    ///
    /// Replaces `@ROOT@` with the sandbox root, and `@UID@`/`@GID@` with the
    /// identity running the tests so nothing needs root privileges.
    pub(crate) fn spec(&self, template: &str) -> Result<Specification> {
        let data = template
            .replace("@ROOT@", &self.dir.path().display().to_string())
            .replace("@UID@", &nix::unistd::getuid().as_raw().to_string())
            .replace("@GID@", &nix::unistd::getgid().as_raw().to_string());
        Ok(data.parse()?)
    }
}

/// Reconcile without ACL or security label support, confirming every prompt.
pub(crate) fn reconcile(config: &ClientConfig, spec: &Specification) -> RunReport {
    reconcile_with(config, spec, |_: &str| true)
}

pub(crate) fn reconcile_with(
    config: &ClientConfig,
    spec: &Specification,
    confirm: impl Confirm,
) -> RunReport {
    let tool = PosixTool::with_backends(config, NoAcls, NoSecurityContext);
    Reconciler::with_parts(config, tool, confirm).run(spec)
}
