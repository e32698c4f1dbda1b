// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File content comparison.
//!
//! Content is compared in stages: sizes first, bytes only when sizes agree.
//! Whatever ends up describing a difference is bounded before it reaches a
//! report. Text gets a unified diff computed under a wall-clock deadline,
//! binary data is carried as base64, and anything too large collapses into
//! its SHA-256 digest.

use crate::config::{ReportSettings, TextEncoding};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use sha2::{Digest, Sha256};
use similar::{Algorithm, TextDiff};
use std::{
    fs::File,
    io::Read,
    path::Path,
    time::{Duration, Instant},
};
use tracing::{info, warn};

/// Diffs slower than this get logged.
const SLOW_DIFF: Duration = Duration::from_secs(5);

/// Bounded description of how on-disk content differs from declared content.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentReport {
    /// Unified diff from current to declared text.
    Diff { text: String },

    /// Base64 of current binary content.
    CurrentFile { base64: String },

    /// SHA-256 of current content, when the description is too large.
    Digest { sha256: String },

    /// No description could be produced.
    Unavailable { reason: String },
}

/// Check if bytes look like text under given encoding.
///
/// Control characters other than tab, line feed, and carriage return mark
/// data as binary.
pub fn is_text(bytes: &[u8], encoding: TextEncoding) -> bool {
    let controls = bytes
        .iter()
        .any(|byte| *byte < 0x20 && !matches!(byte, b'\t' | b'\n' | b'\r'));
    !controls && encoding.decodes(bytes)
}

/// Check on-disk file against declared content.
///
/// Sizes are compared before any bytes are read. On mismatch, the current
/// bytes are returned when they were read, so the caller can describe the
/// difference without reading the file twice.
///
/// # Errors
///
/// - Return error if the file cannot be opened or read.
pub fn compare(path: &Path, size: u64, desired: &[u8]) -> std::io::Result<Comparison> {
    if size != desired.len() as u64 {
        return Ok(Comparison::SizeDiffers);
    }

    let mut current = Vec::with_capacity(desired.len());
    File::open(path)?.read_to_end(&mut current)?;
    if current == desired {
        Ok(Comparison::Same)
    } else {
        Ok(Comparison::BytesDiffer(current))
    }
}

/// Outcome of [`compare`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Comparison {
    Same,
    SizeDiffers,
    BytesDiffer(Vec<u8>),
}

/// Describe difference between current and desired content.
pub fn describe(
    path: &Path,
    current: &[u8],
    desired: &[u8],
    binary: bool,
    encoding: TextEncoding,
    settings: &ReportSettings,
) -> ContentReport {
    if binary || !is_text(current, encoding) || !is_text(desired, encoding) {
        return bound(STANDARD.encode(current), current, settings, |base64| {
            ContentReport::CurrentFile { base64 }
        });
    }

    // INVARIANT: Both sides passed text checks above.
    let current_text = String::from_utf8_lossy(current);
    let desired_text = String::from_utf8_lossy(desired);
    match unified_diff(path, &current_text, &desired_text, settings.diff_timeout()) {
        Some(text) => bound(text, current, settings, |text| ContentReport::Diff { text }),
        None => ContentReport::Unavailable {
            reason: "diff took too long to compute".into(),
        },
    }
}

/// Compute unified diff under a wall-clock deadline.
///
/// Returns nothing if the deadline passed before the diff finished.
pub fn unified_diff(path: &Path, current: &str, desired: &str, timeout: Duration) -> Option<String> {
    let start = Instant::now();
    let deadline = start + timeout;
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .deadline(deadline)
        .diff_lines(current, desired);

    let elapsed = start.elapsed();
    if Instant::now() >= deadline {
        warn!("diff of {} exceeded {timeout:?}, giving up", path.display());
        return None;
    }
    if elapsed >= SLOW_DIFF {
        info!("diff of {} took {elapsed:?}", path.display());
    }

    let name = path.display().to_string();
    Some(
        diff.unified_diff()
            .context_radius(3)
            .header(&name, &name)
            .to_string(),
    )
}

/// Hex SHA-256 digest of data.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn bound(
    text: String,
    raw: &[u8],
    settings: &ReportSettings,
    wrap: impl FnOnce(String) -> ContentReport,
) -> ContentReport {
    if text.len() > settings.max_content_size {
        return ContentReport::Digest {
            sha256: sha256_hex(raw),
        };
    }
    wrap(text)
}
