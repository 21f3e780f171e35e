//! Structured observability hooks for the bundle run lifecycle.
//!
//! - Run-scoped tracing span via [`run_span`]
//! - Emission functions for lifecycle events: start, state change, phase
//!   finish, run finish, teardown errors

use tracing::{info, info_span, warn, Span};

/// Span tagged with the run id and assignment, attached to a run's future.
///
/// ```ignore
/// orchestrator_run(job).instrument(run_span("3f1c...", "so-tema1")).await;
/// // every event inside is associated with run_id and assignment
/// ```
pub fn run_span(run_id: &str, assignment: &str) -> Span {
    info_span!("vmchecker.run", run_id = %run_id, assignment = %assignment)
}

/// Emit event: run started for a bundle.
pub fn emit_run_started(run_id: &str, bundle: &str, machine: &str, mode: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        bundle = %bundle,
        machine = %machine,
        mode = %mode,
    );
}

/// Emit event: the orchestrator entered a new state.
pub fn emit_state_entered(run_id: &str, state: &str) {
    info!(event = "run.state", run_id = %run_id, state = %state);
}

/// Emit event: a phase finished, with or without a timeout.
pub fn emit_phase_finished(run_id: &str, phase: &str, completed: bool, duration_ms: u64) {
    info!(
        event = "phase.finished",
        run_id = %run_id,
        phase = %phase,
        completed = completed,
        duration_ms = duration_ms,
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, success: bool, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        success = success,
        duration_ms = duration_ms,
    );
}

/// Emit event: a teardown step failed (warning level, never fatal).
pub fn emit_teardown_error(step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "teardown.error", step = %step, error = %error);
}
