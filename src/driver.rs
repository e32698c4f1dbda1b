// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reconciliation driver.
//!
//! Run one reconciliation pass over a specification:
//!
//! 1. Validate every raw entry, setting aside bind failures, incomplete
//!    entries, and duplicates.
//! 2. Verify every valid entry (the verify pass).
//! 3. Decide which mismatched entries may be installed: dry run, bundle
//!    filters, decision lists, and interactive confirmation all get a say.
//! 4. Install the chosen entries in declaration order, re-verifying each.
//! 5. Re-verify bundles that saw a modification, reinstalling entries that
//!    an install in the same bundle clobbered.
//!
//! One entry failing, even by panicking, never stops the rest of the run.

use crate::{
    config::{ClientConfig, DecisionMode},
    entry::{DeclaredEntry, DeclaredPaths, EntryError, RawEntry, Specification},
    posix::{
        acl::{AclStore, SystemAcls},
        content::ContentReport,
        secontext::SecurityContext,
        InstallError, PosixTool, SystemSecurityContext, Verification,
    },
    report::{EntryReport, FinalState, Outcome, RunReport},
};

use indicatif::ProgressBar;
use std::{
    any::Any,
    collections::{BTreeSet, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, instrument, warn};

/// Yes or no question put to the operator.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Ask on the terminal. Anything but an explicit yes is a no.
#[derive(Default, Debug, Clone, Copy)]
pub struct InquireConfirm;

impl Confirm for InquireConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        inquire::Confirm::new(prompt)
            .with_default(false)
            .prompt()
            .unwrap_or(false)
    }
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Reconciliation driver over a [`PosixTool`].
pub struct Reconciler<'cfg, A = SystemAcls, S = SystemSecurityContext, C = InquireConfirm>
where
    A: AclStore,
    S: SecurityContext,
    C: Confirm,
{
    config: &'cfg ClientConfig,
    tool: PosixTool<'cfg, A, S>,
    confirm: C,
    progress: ProgressBar,
    cancel: Arc<AtomicBool>,
}

impl<'cfg> Reconciler<'cfg> {
    /// Construct new driver with native backends and terminal prompts.
    pub fn new(config: &'cfg ClientConfig) -> Self {
        Self::with_parts(config, PosixTool::new(config), InquireConfirm)
    }
}

impl<'cfg, A, S, C> Reconciler<'cfg, A, S, C>
where
    A: AclStore,
    S: SecurityContext,
    C: Confirm,
{
    /// Construct new driver from explicit parts.
    pub fn with_parts(config: &'cfg ClientConfig, tool: PosixTool<'cfg, A, S>, confirm: C) -> Self {
        Self {
            config,
            tool,
            confirm,
            progress: ProgressBar::hidden(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Show progress of the verify pass on given bar.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Flag that stops the run between entries once set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn tool(&self) -> &PosixTool<'cfg, A, S> {
        &self.tool
    }

    /// Reconcile system against specification.
    #[instrument(skip(self, spec), level = "debug")]
    pub fn run(&self, spec: &Specification) -> RunReport {
        let declared = spec.declared_paths();
        let mut slots = self.prepare(spec);

        self.inventory(&mut slots, &declared);
        self.display_state("initial", &slots, false);

        let chosen = self.decide(spec, &slots);
        for index in chosen {
            if self.cancelled() {
                break;
            }
            self.install(&mut slots[index], &declared);
        }
        self.handle_clobbered(&mut slots, &declared);

        self.display_state("final", &slots, true);
        let extra = collect_extra(&slots);
        RunReport::new(slots.iter().map(Slot::report).collect(), extra)
    }

    fn prepare(&self, spec: &Specification) -> Vec<Slot> {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();

        for bundle in &spec.bundles {
            for raw in &bundle.paths {
                let prepared = if let Some(failure) = &raw.failure {
                    error!("failed to bind entry {}: {failure}", raw_name(raw).display());
                    Prepared::BindFailure(failure.clone())
                } else {
                    match DeclaredEntry::from_raw(raw, self.config.encoding) {
                        Ok(entry) if !seen.insert(entry.name.clone()) => {
                            let err = EntryError::Duplicate(entry.name);
                            error!("{err}");
                            Prepared::Incomplete(err.to_string())
                        }
                        Ok(entry) => Prepared::Ready(Box::new(entry)),
                        Err(err) => {
                            error!("{err}");
                            Prepared::Incomplete(err.to_string())
                        }
                    }
                };

                slots.push(Slot {
                    bundle: bundle.name.clone(),
                    name: raw_name(raw),
                    kind: raw.kind_name().to_string(),
                    prepared,
                    initial: None,
                    last: None,
                    attempted: false,
                    error: None,
                });
            }
        }

        slots
    }

    fn inventory(&self, slots: &mut [Slot], declared: &DeclaredPaths) {
        self.progress.set_length(slots.len() as u64);
        self.progress.set_message("verifying");

        for slot in slots.iter_mut() {
            if self.cancelled() {
                break;
            }
            if let Prepared::Ready(entry) = &slot.prepared {
                let verification = self.verify(entry, declared);
                slot.initial = Some(verification.clone());
                slot.last = Some(verification);
            }
            self.progress.inc(1);
        }

        self.progress.finish_and_clear();
    }

    fn decide(&self, spec: &Specification, slots: &[Slot]) -> Vec<usize> {
        let mut chosen: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.ready().is_some() && !slot.matches())
            .map(|(index, _)| index)
            .collect();

        if self.config.dry_run {
            if !chosen.is_empty() {
                info!(
                    "in dry run mode, suppressing install of: {}",
                    describe(slots, &chosen)
                );
            }
            return Vec::new();
        }

        let known: HashSet<&str> = spec.bundles.iter().map(|bundle| bundle.name.as_str()).collect();
        for name in self.config.bundles.iter().chain(&self.config.skip_bundles) {
            if !known.contains(name.as_str()) {
                warn!("bundle {name} not found");
            }
        }

        chosen.retain(|index| {
            let bundle = slots[*index].bundle.as_str();
            let wanted = self.config.bundles.is_empty()
                || self.config.bundles.iter().any(|name| name == bundle);
            let skipped = self.config.skip_bundles.iter().any(|name| name == bundle);
            wanted && !skipped
        });

        let decision = &self.config.decision;
        if decision.mode != DecisionMode::None {
            let (kept, suppressed): (Vec<usize>, Vec<usize>) =
                chosen.into_iter().partition(|index| {
                    let slot = &slots[*index];
                    decision.permits(&slot.kind, &slot.name.to_string_lossy())
                });
            if !suppressed.is_empty() {
                info!(
                    "in {:?} decision mode, suppressing install of: {}",
                    decision.mode,
                    describe(slots, &suppressed)
                );
            }
            chosen = kept;
        }

        if self.config.interactive {
            chosen.retain(|index| {
                let prompt = slots[*index].prompt();
                self.progress.suspend(|| self.confirm.confirm(&prompt))
            });
        }

        chosen
    }

    fn install(&self, slot: &mut Slot, declared: &DeclaredPaths) {
        let Prepared::Ready(entry) = &slot.prepared else {
            return;
        };

        slot.attempted = true;
        let found = slot.last.clone().unwrap_or_default();
        let result = catch_unwind(AssertUnwindSafe(|| self.tool.install(entry, &found, declared)))
            .unwrap_or_else(|payload| {
                Err(InstallError::Panicked {
                    path: entry.name.clone(),
                    message: panic_message(payload.as_ref()),
                })
            });

        match result {
            Ok(()) => debug!("install of {} finished", entry.name.display()),
            Err(err) => {
                error!("{err}");
                slot.error = Some(err.to_string());
            }
        }

        slot.last = Some(self.verify(entry, declared));
    }

    fn handle_clobbered(&self, slots: &mut [Slot], declared: &DeclaredPaths) {
        let modified: BTreeSet<String> = slots
            .iter()
            .filter(|slot| slot.attempted && slot.matches())
            .map(|slot| slot.bundle.clone())
            .collect();
        if modified.is_empty() {
            return;
        }
        info!(
            "the following bundles have been modified: {}",
            modified.iter().cloned().collect::<Vec<_>>().join(", ")
        );

        let mut clobbered = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.attempted || !modified.contains(&slot.bundle) || !slot.matches() {
                continue;
            }
            if self.cancelled() {
                return;
            }
            if let Prepared::Ready(entry) = &slot.prepared {
                let verification = self.verify(entry, declared);
                if !verification.matches() {
                    clobbered.push(index);
                }
                slot.last = Some(verification);
            }
        }

        if clobbered.is_empty() {
            return;
        }
        info!("found clobbered entries: {}", describe(slots, &clobbered));

        if self.config.interactive {
            return;
        }
        for index in clobbered {
            if self.cancelled() {
                break;
            }
            self.install(&mut slots[index], declared);
        }
    }

    fn verify(&self, entry: &DeclaredEntry, declared: &DeclaredPaths) -> Verification {
        catch_unwind(AssertUnwindSafe(|| self.tool.verify(entry, declared))).unwrap_or_else(
            |payload| {
                let message = format!(
                    "verify of {} panicked: {}",
                    entry.name.display(),
                    panic_message(payload.as_ref())
                );
                error!("{message}");
                Verification::unknown(&entry.name, message)
            },
        )
    }

    fn cancelled(&self) -> bool {
        let cancelled = self.cancel.load(Ordering::Relaxed);
        if cancelled {
            warn!("run cancelled, not dispatching further entries");
        }
        cancelled
    }

    fn display_state(&self, phase: &str, slots: &[Slot], list_incorrect: bool) {
        let correct = slots.iter().filter(|slot| slot.matches()).count();
        let extra = collect_extra(slots).len();

        info!("phase: {phase}");
        info!("correct entries: {correct}");
        info!("incorrect entries: {}", slots.len() - correct);
        if list_incorrect {
            for slot in slots.iter().filter(|slot| !slot.matches()) {
                info!("    {}:{}", slot.kind, slot.name.display());
            }
        }
        info!("total managed entries: {}", slots.len());
        info!("unmanaged entries: {extra}");
        if correct == slots.len() && extra == 0 {
            info!("all entries correct");
        }
    }
}

enum Prepared {
    Ready(Box<DeclaredEntry>),
    Incomplete(String),
    BindFailure(String),
}

/// Bookkeeping of one raw entry across a run.
struct Slot {
    bundle: String,
    name: PathBuf,
    kind: String,
    prepared: Prepared,

    /// Verification of the verify pass.
    initial: Option<Verification>,

    /// Most recent verification.
    last: Option<Verification>,

    /// Install was dispatched for this entry.
    attempted: bool,

    /// Error of the last install, if it failed.
    error: Option<String>,
}

impl Slot {
    fn ready(&self) -> Option<&DeclaredEntry> {
        match &self.prepared {
            Prepared::Ready(entry) => Some(&**entry),
            _ => None,
        }
    }

    fn matches(&self) -> bool {
        self.last.as_ref().is_some_and(Verification::matches)
    }

    fn prompt(&self) -> String {
        let mut prompt = String::new();
        if let Some(verification) = &self.last {
            prompt.push_str(&verification.explanation());
            prompt.push('\n');
            match &verification.content {
                Some(ContentReport::Diff { text }) => prompt.push_str(text),
                Some(_) => prompt.push_str("Binary file, no printable diff\n"),
                None => {}
            }
        }
        prompt.push_str(&format!("Install {} {}:", self.kind, self.name.display()));
        prompt
    }

    fn report(&self) -> EntryReport {
        let mut report = EntryReport {
            bundle: self.bundle.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            state: FinalState::Bad,
            outcome: Outcome::Skipped,
            explanation: None,
            axes: Vec::new(),
            current: Default::default(),
            content: None,
        };

        let entry = match &self.prepared {
            Prepared::Ready(entry) => entry,
            Prepared::Incomplete(reason) => {
                report.outcome = Outcome::Incomplete;
                report.explanation = Some(reason.clone());
                return report;
            }
            Prepared::BindFailure(reason) => {
                report.outcome = Outcome::BindFailure;
                report.explanation = Some(reason.clone());
                return report;
            }
        };

        let Some(last) = &self.last else {
            report.explanation = Some("not verified, run was cancelled".into());
            return report;
        };

        (report.state, report.outcome) = match (self.attempted, last.matches()) {
            (false, true) => (FinalState::Good, Outcome::Clean),
            (false, false) => (FinalState::Bad, Outcome::Skipped),
            (true, true) => (FinalState::Modified, Outcome::Converged),
            (true, false) => (FinalState::Bad, Outcome::Failed),
        };

        report.current = last.current.clone();
        if !last.matches() {
            let mut explanation = last.explanation();
            if let Some(error) = &self.error {
                explanation.push_str(&format!("\ninstall failed: {error}"));
            }
            report.explanation = Some(explanation);
            report.axes = last.mismatches.iter().map(|mismatch| mismatch.axis).collect();
        } else if let Some(initial) = self.initial.as_ref().filter(|_| self.attempted) {
            // Converged entries report what was repaired.
            report.axes = initial.mismatches.iter().map(|mismatch| mismatch.axis).collect();
        }

        // INVARIANT: Sensitive content never reaches a report.
        if !entry.sensitive && !last.matches() {
            report.content = last.content.clone();
        }

        report
    }
}

fn raw_name(raw: &RawEntry) -> PathBuf {
    PathBuf::from(raw.name.clone().unwrap_or_default())
}

fn describe(slots: &[Slot], indices: &[usize]) -> String {
    indices
        .iter()
        .map(|index| format!("{}:{}", slots[*index].kind, slots[*index].name.display()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn collect_extra(slots: &[Slot]) -> Vec<PathBuf> {
    slots
        .iter()
        .filter_map(|slot| slot.last.as_ref())
        .flat_map(|verification| verification.extra.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
