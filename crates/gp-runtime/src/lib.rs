#![forbid(unsafe_code)]

use std::fmt;
use std::time::Instant;

use gp_core::EvalMode;

/// Pipeline stage a ledger entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StageKind {
    Policy,
    Reference,
    Export,
    Convert,
    Candidate,
    Compare,
}

impl StageKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Reference => "reference",
            Self::Export => "export",
            Self::Convert => "convert",
            Self::Candidate => "candidate",
            Self::Compare => "compare",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEntry {
    pub ts_unix_ms: u128,
    pub stage: StageKind,
    pub outcome: StageOutcome,
    pub duration_ms: u128,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageLedger {
    entries: Vec<StageEntry>,
}

impl StageLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        stage: StageKind,
        outcome: StageOutcome,
        duration_ms: u128,
        summary: impl Into<String>,
    ) {
        self.entries.push(StageEntry {
            ts_unix_ms: now_unix_ms(),
            stage,
            outcome,
            duration_ms,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[StageEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First stage that failed, if any.
    #[must_use]
    pub fn failed_stage(&self) -> Option<StageKind> {
        self.entries
            .iter()
            .find(|entry| entry.outcome == StageOutcome::Failed)
            .map(|entry| entry.stage)
    }

    /// Stages that completed successfully, in execution order.
    #[must_use]
    pub fn completed_stages(&self) -> Vec<StageKind> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome == StageOutcome::Ok && entry.stage != StageKind::Policy)
            .map(|entry| entry.stage)
            .collect()
    }

    #[must_use]
    pub fn total_duration_ms(&self) -> u128 {
        self.entries.iter().map(|entry| entry.duration_ms).sum()
    }
}

/// Open stage measurement; closed by [`CaseRuntime::finish_stage`] or
/// [`CaseRuntime::fail_stage`].
#[derive(Debug)]
pub struct StageTimer {
    stage: StageKind,
    started: Instant,
}

impl StageTimer {
    #[must_use]
    pub fn stage(&self) -> StageKind {
        self.stage
    }
}

/// Per-case execution context holding the evidence of every stage the case
/// went through. The eval mode is fixed at construction and logged as the
/// first ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseRuntime {
    case: String,
    ledger: StageLedger,
}

impl CaseRuntime {
    #[must_use]
    pub fn new(case: impl Into<String>, mode: EvalMode) -> Self {
        let mut ledger = StageLedger::new();
        ledger.record(
            StageKind::Policy,
            StageOutcome::Ok,
            0,
            format!("mode initialized to {mode:?}"),
        );
        Self {
            case: case.into(),
            ledger,
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &StageLedger {
        &self.ledger
    }

    #[must_use]
    pub fn begin_stage(&self, stage: StageKind) -> StageTimer {
        StageTimer {
            stage,
            started: Instant::now(),
        }
    }

    pub fn finish_stage(&mut self, timer: StageTimer, summary: impl Into<String>) {
        self.ledger.record(
            timer.stage,
            StageOutcome::Ok,
            timer.started.elapsed().as_millis(),
            summary,
        );
    }

    pub fn fail_stage<E>(&mut self, timer: StageTimer, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            timer.stage,
            StageOutcome::Failed,
            timer.started.elapsed().as_millis(),
            format!("{} failed case={}: {error}", timer.stage.label(), self.case),
        );
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
