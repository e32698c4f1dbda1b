// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the client configuration file to simplify the
//! process of serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! The configuration is an explicit value handed to every component that
//! needs it. There is no process-wide options object.

use crate::path::default_backup_dir;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

/// Client configuration layout.
///
/// # General Layout
///
/// Top-level switches control how a run behaves as a whole (dry run,
/// interactive prompting, bundle filters). The `paranoid` table controls
/// backups, the `report` table bounds what is placed into reports, and the
/// `decision` table filters which entries may be installed.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Text encoding used to interpret declared and on-disk content.
    pub encoding: TextEncoding,

    /// Prompt before installing each entry that failed verification.
    pub interactive: bool,

    /// Verify only. Never modify the system.
    pub dry_run: bool,

    /// Only install entries belonging to these bundles.
    pub bundles: Vec<String>,

    /// Never install entries belonging to these bundles.
    pub skip_bundles: Vec<String>,

    /// Paranoid backup settings.
    pub paranoid: ParanoidSettings,

    /// Report bounding settings.
    pub report: ReportSettings,

    /// Decision list settings.
    pub decision: DecisionSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            encoding: TextEncoding::default(),
            interactive: false,
            dry_run: false,
            bundles: Vec::new(),
            skip_bundles: Vec::new(),
            paranoid: ParanoidSettings::default(),
            report: ReportSettings::default(),
            decision: DecisionSettings::default(),
        }
    }
}

impl FromStr for ClientConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: ClientConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on backup directory path.
        config.paranoid.path = PathBuf::from(
            shellexpand::full(config.paranoid.path.to_string_lossy().as_ref())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned(),
        );

        // INVARIANT: Reject bad decision patterns up front, not mid-run.
        for pattern in &config.decision.list {
            Pattern::new(pattern).map_err(|err| ConfigError::DecisionPattern {
                pattern: pattern.clone(),
                reason: err.msg.into(),
            })?;
        }

        Ok(config)
    }
}

impl Display for ClientConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Text encoding of managed content.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
pub enum TextEncoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,

    #[serde(rename = "ascii", alias = "ASCII")]
    Ascii,
}

impl TextEncoding {
    /// Check if bytes decode cleanly under this encoding.
    pub fn decodes(&self, bytes: &[u8]) -> bool {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes).is_ok(),
            Self::Ascii => bytes.is_ascii(),
        }
    }
}

/// Paranoid backup settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ParanoidSettings {
    /// Global paranoid policy.
    pub enabled: bool,

    /// How the global policy and per-entry flag combine.
    pub combine: ParanoidCombine,

    /// Directory that holds backups.
    pub path: PathBuf,

    /// Maximum number of backups kept per original path.
    pub max_copies: usize,
}

impl Default for ParanoidSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            combine: ParanoidCombine::default(),
            path: default_backup_dir(),
            max_copies: 1,
        }
    }
}

impl ParanoidSettings {
    /// Determine if an entry with given paranoid flag must be backed up.
    pub fn wants_backup(&self, entry_flag: bool) -> bool {
        match self.combine {
            ParanoidCombine::Either => self.enabled || entry_flag,
            ParanoidCombine::Both => self.enabled && entry_flag,
        }
    }
}

/// Combination rule for global and per-entry paranoid flags.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParanoidCombine {
    /// Either flag forces a backup.
    #[default]
    Either,

    /// Both flags must be set.
    Both,
}

/// Report bounding settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Content or diff larger than this many bytes is replaced by a digest.
    pub max_content_size: usize,

    /// Wall-clock budget for computing a content diff.
    pub diff_timeout_secs: u64,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            max_content_size: 1024 * 1024,
            diff_timeout_secs: 30,
        }
    }
}

impl ReportSettings {
    pub fn diff_timeout(&self) -> Duration {
        Duration::from_secs(self.diff_timeout_secs)
    }
}

/// Decision list settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DecisionSettings {
    /// How the list is interpreted.
    pub mode: DecisionMode,

    /// Glob patterns matched against `type:path`.
    pub list: Vec<String>,
}

impl DecisionSettings {
    /// Determine if entry may be installed under current decision mode.
    ///
    /// Patterns were validated on load. Any pattern that still fails to
    /// compile simply never matches.
    pub fn permits(&self, kind: &str, name: &str) -> bool {
        let subject = format!("{kind}:{name}");
        let matched = self
            .list
            .iter()
            .filter_map(|pattern| Pattern::new(pattern).ok())
            .any(|pattern| pattern.matches(&subject));

        match self.mode {
            DecisionMode::None => true,
            DecisionMode::Whitelist => matched,
            DecisionMode::Blacklist => !matched,
        }
    }
}

/// Decision list mode.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    #[default]
    None,
    Whitelist,
    Blacklist,
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Decision list contains an invalid glob pattern.
    #[error("invalid decision pattern {pattern:?}: {reason}")]
    DecisionPattern { pattern: String, reason: String },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}
