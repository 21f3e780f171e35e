//! vmchecker guest test execution controller
//!
//! Drives one submission bundle through a disposable virtual machine:
//! connect, revert, power on, wait for tools, log in, stage files, run the
//! build and test scripts under a wall-clock bound, collect results and tear
//! the guest down again on every exit path.

pub mod bounded;
pub mod bundle;
pub mod config;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod guest;
pub mod host_aux;
pub mod obs;
pub mod orchestrator;
pub mod phase;
pub mod stager;
pub mod telemetry;

pub use bounded::{run_bounded, run_bounded_detailed, Bounded};
pub use bundle::Bundle;
pub use config::{
    AssignmentSpec, CourseConfig, DescriptorSource, GuestCredentials, MachineSpec, StorageMode,
    SubmissionConfig, TesterSpec,
};
pub use error::{ConfigError, ExecutorError, GuestError, GuestResult, Result};
pub use executor::{prepare, run_bundle, vmrun_hypervisor};
pub use guest::{
    revert_to_snapshot, GuestDir, GuestSession, Hypervisor, SnapshotSelector, VmrunHypervisor,
};
pub use host_aux::{DialogResponder, HostAuxProcess};
pub use orchestrator::{
    wait_for_tools, PhaseReport, RunOutcome, RunReport, RunState, TestJob, TestOrchestrator,
};
pub use phase::{phase_plan, PhaseKind, TestPhase};
pub use stager::{stage_in, stage_out, StageReport};
pub use telemetry::init_tracing;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
