//! Test phase definitions and the per-mode phase plan.

use crate::bundle::{ARCHIVE, BUILD_SCRIPT, RUN_SCRIPT, TESTS};
use crate::config::StorageMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The two phases a bundle can go through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Unpack and compile the submission.
    Build,
    /// Execute the tests against the built submission.
    Run,
}

impl PhaseKind {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Build => "build",
            PhaseKind::Run => "run",
        }
    }

    pub fn script(&self) -> &'static str {
        match self {
            PhaseKind::Build => BUILD_SCRIPT,
            PhaseKind::Run => RUN_SCRIPT,
        }
    }

    /// If this phase does not complete, every later phase is skipped.
    pub fn gates_later_phases(&self) -> bool {
        matches!(self, PhaseKind::Build)
    }
}

/// One group of input files, scripts, output files and a timeout, executed
/// as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestPhase {
    pub kind: PhaseKind,
    /// Copied host to guest before the scripts run.
    pub input: Vec<String>,
    /// Copied host to guest, then executed in order.
    pub script: Vec<String>,
    /// Copied guest to host afterwards, even after a timeout.
    pub output: Vec<String>,
    /// Bound for each script of the phase.
    pub timeout: Duration,
}

impl TestPhase {
    /// Create a phase whose outputs are its captured stdout and stderr.
    pub fn new(kind: PhaseKind, input: Vec<String>, timeout: Duration) -> Self {
        Self {
            kind,
            input,
            script: vec![kind.script().to_string()],
            output: vec![stdout_file(kind), stderr_file(kind)],
            timeout,
        }
    }

    pub fn build(timeout: Duration) -> Self {
        Self::new(
            PhaseKind::Build,
            vec![ARCHIVE.to_string(), TESTS.to_string()],
            timeout,
        )
    }

    pub fn run(input: Vec<String>, timeout: Duration) -> Self {
        Self::new(PhaseKind::Run, input, timeout)
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// File the guest shell redirects script stdout into.
    pub fn stdout_file(&self) -> String {
        stdout_file(self.kind)
    }

    /// File the guest shell redirects script stderr into.
    pub fn stderr_file(&self) -> String {
        stderr_file(self.kind)
    }
}

fn stdout_file(kind: PhaseKind) -> String {
    format!("{}-stdout.vmr", kind.name())
}

fn stderr_file(kind: PhaseKind) -> String {
    format!("{}-stderr.vmr", kind.name())
}

/// Ordered phases for a submission intake shape.
///
/// - `normal`: build (archive + tests), then run
/// - `large`: run only, with the tests; the archive was pre-staged
pub fn phase_plan(mode: StorageMode, timeout: Duration) -> Vec<TestPhase> {
    match mode {
        StorageMode::Normal => vec![TestPhase::build(timeout), TestPhase::run(Vec::new(), timeout)],
        StorageMode::Large => vec![TestPhase::run(vec![TESTS.to_string()], timeout)],
    }
}
