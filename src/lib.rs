// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Converge POSIX filesystem state onto a declared specification.
//!
//! A specification lists bundles of path entries: files, directories,
//! links, device nodes, paths that must not exist, and paths whose metadata
//! alone is managed. The [`Reconciler`] verifies each entry against the live
//! system, decides which mismatches may be repaired, installs them, and
//! produces a [`RunReport`] of the outcome.
//!
//! [`Reconciler`]: crate::driver::Reconciler
//! [`RunReport`]: crate::report::RunReport

pub mod backup;
pub mod config;
pub mod driver;
pub mod entry;
pub mod identity;
pub mod path;
pub mod posix;
pub mod report;
