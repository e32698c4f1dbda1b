// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run reports.
//!
//! A [`RunReport`] is the outcome of one reconciliation run, meant for
//! whoever records results. It serializes to TOML, with one `[[entry]]` table
//! per declared entry.

use crate::posix::{content::ContentReport, verify::CurrentState, Axis};

use serde::Serialize;
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};

/// Overall state of the system after a run.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Clean,
    Dirty,
}

/// Final state of one entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalState {
    /// Matched without any install.
    Good,

    /// Still does not match.
    Bad,

    /// Installed and now matches.
    Modified,
}

/// What happened to one entry during a run.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Matched, no action taken.
    Clean,

    /// Installed, and now matches.
    Converged,

    /// Install attempted but entry still does not match.
    Failed,

    /// Mismatched, but install was suppressed or declined.
    Skipped,

    /// Entry lacks required attributes, so it was never acted upon.
    Incomplete,

    /// Policy layer could not bind entry.
    BindFailure,
}

/// Report of one entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct EntryReport {
    pub bundle: String,
    pub name: PathBuf,
    pub kind: String,
    pub state: FinalState,
    pub outcome: Outcome,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub axes: Vec<Axis>,

    pub current: CurrentState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentReport>,
}

/// Report of a whole run.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub total: usize,
    pub good: usize,
    pub bad: usize,
    pub modified: usize,

    /// Unmanaged objects found inside pruned directories.
    pub extra: Vec<PathBuf>,

    #[serde(rename = "entry")]
    pub entries: Vec<EntryReport>,
}

impl RunReport {
    /// Assemble report, deriving counts from entry states.
    pub fn new(entries: Vec<EntryReport>, extra: Vec<PathBuf>) -> Self {
        let count = |state: FinalState| entries.iter().filter(|entry| entry.state == state).count();
        let bad = count(FinalState::Bad);
        let modified = count(FinalState::Modified);
        let good = count(FinalState::Good) + modified;

        Self {
            state: if bad == 0 { RunState::Clean } else { RunState::Dirty },
            total: entries.len(),
            good,
            bad,
            modified,
            extra,
            entries,
        }
    }

    /// Find report of entry by name.
    ///
    /// Duplicates are reported too, so the first declaration is returned.
    pub fn entry(&self, name: impl AsRef<Path>) -> Option<&EntryReport> {
        self.entries
            .iter()
            .find(|entry| entry.name == name.as_ref())
    }

    pub fn is_clean(&self) -> bool {
        self.state == RunState::Clean
    }
}

impl Display for RunReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(|_| FmtError)?
                .as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report(name: &str, state: FinalState, outcome: Outcome) -> EntryReport {
        EntryReport {
            bundle: "base".into(),
            name: name.into(),
            kind: "file".into(),
            state,
            outcome,
            explanation: None,
            axes: Vec::new(),
            current: CurrentState::default(),
            content: None,
        }
    }

    #[test]
    fn counts_follow_entry_states() {
        let result = RunReport::new(
            vec![
                report("/a", FinalState::Good, Outcome::Clean),
                report("/b", FinalState::Modified, Outcome::Converged),
                report("/c", FinalState::Bad, Outcome::Failed),
            ],
            Vec::new(),
        );

        assert_eq!(result.state, RunState::Dirty);
        assert_eq!((result.total, result.good, result.bad, result.modified), (3, 2, 1, 1));
        assert_eq!(result.entry("/c").map(|entry| entry.outcome), Some(Outcome::Failed));
    }

    #[test]
    fn serialize_to_toml() {
        let mut bad = report("/etc/motd", FinalState::Bad, Outcome::Skipped);
        bad.explanation = Some("permissions of /etc/motd are 0600, should be 0644".into());
        bad.axes = vec![Axis::Perms];
        bad.current.perms = Some("0600".into());
        let result = RunReport::new(vec![bad], vec![PathBuf::from("/srv/d/stray")]).to_string();

        assert!(result.contains("state = \"dirty\""));
        assert!(result.contains("[[entry]]"));
        assert!(result.contains("outcome = \"skipped\""));
        assert!(result.contains("axes = ["));
        assert!(result.contains("perms = \"0600\""));
        assert!(result.contains("/srv/d/stray"));
    }
}
