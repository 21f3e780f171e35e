//! Test orchestration: drives one bundle through the guest lifecycle.
//!
//! ```text
//! CONNECTED -> REVERTED (if configured) -> POWERED_ON -> TOOLS_READY -> LOGGED_IN
//!    -> BUILD_PHASE (normal mode only) -> RUN_PHASE -> TORN_DOWN
//! ```
//!
//! `TORN_DOWN` is always reached. Once a session exists it is owned by a
//! [`Teardown`] guard that stops the host auxiliary process, powers the guest
//! off and unregisters it exactly once, on every exit path including a panic
//! in the middle of a phase.

use crate::bounded::{run_bounded, run_bounded_detailed, Bounded};
use crate::bundle::Bundle;
use crate::config::{AssignmentSpec, MachineSpec, StorageMode, TesterSpec};
use crate::error::{GuestError, GuestResult};
use crate::guest::{revert_to_snapshot, GuestDir, GuestSession, Hypervisor, SnapshotSelector};
use crate::host_aux::{self, DialogResponder, HostAuxProcess};
use crate::obs::{
    emit_phase_finished, emit_run_finished, emit_run_started, emit_state_entered,
    emit_teardown_error, run_span,
};
use crate::phase::{phase_plan, PhaseKind, TestPhase};
use crate::stager::{self, StageReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn, Instrument, Span};
use uuid::Uuid;

/// Lifecycle states of one bundle run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Connected,
    Reverted,
    PoweredOn,
    ToolsReady,
    LoggedIn,
    BuildPhase,
    RunPhase,
    TornDown,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Connected => "connected",
            RunState::Reverted => "reverted",
            RunState::PoweredOn => "powered_on",
            RunState::ToolsReady => "tools_ready",
            RunState::LoggedIn => "logged_in",
            RunState::BuildPhase => "build_phase",
            RunState::RunPhase => "run_phase",
            RunState::TornDown => "torn_down",
        }
    }
}

impl From<PhaseKind> for RunState {
    fn from(kind: PhaseKind) -> Self {
        match kind {
            PhaseKind::Build => RunState::BuildPhase,
            PhaseKind::Run => RunState::RunPhase,
        }
    }
}

/// Whether the tests got to run. A failing test inside the guest is still
/// a `Success` here.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
}

/// Result of one executed phase.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: PhaseKind,
    /// Every script returned within the phase timeout.
    pub completed: bool,
    pub timed_out_script: Option<String>,
    /// Error reported by a script invocation that returned in time.
    pub failure: Option<String>,
    pub staged_in: StageReport,
    pub staged_out: StageReport,
    pub duration_ms: u64,
}

/// Summary of one bundle run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub bundle: PathBuf,
    pub assignment: String,
    pub machine: String,
    pub mode: StorageMode,
    pub descriptor: PathBuf,
    /// States in the order they were entered.
    pub states: Vec<RunState>,
    pub phases: Vec<PhaseReport>,
    /// A build timeout skipped the remaining phases.
    pub aborted: bool,
    pub outcome: RunOutcome,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl RunReport {
    fn new(run_id: String, job: &TestJob) -> Self {
        Self {
            run_id,
            bundle: job.bundle.dir().to_path_buf(),
            assignment: job.assignment.id.clone(),
            machine: job.machine.id.clone(),
            mode: job.assignment.storage,
            descriptor: job.descriptor.clone(),
            states: Vec::new(),
            phases: Vec::new(),
            aborted: false,
            outcome: RunOutcome::Failure,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn reached(&self, state: RunState) -> bool {
        self.states.contains(&state)
    }

    fn enter(&mut self, state: RunState) {
        emit_state_entered(&self.run_id, state.name());
        self.states.push(state);
    }

    fn finish(mut self, outcome: RunOutcome, started: Instant) -> Self {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
        self.duration_ms = started.elapsed().as_millis() as u64;
        emit_run_finished(&self.run_id, self.success(), self.duration_ms);
        self
    }
}

/// Everything one run needs, resolved before any guest is touched.
#[derive(Debug, Clone)]
pub struct TestJob {
    pub bundle: Bundle,
    pub assignment: AssignmentSpec,
    pub machine: MachineSpec,
    pub descriptor: PathBuf,
}

/// Releases the guest and the auxiliary process exactly once.
struct Teardown {
    session: Option<Arc<dyn GuestSession>>,
    aux: Option<HostAuxProcess>,
}

impl Teardown {
    fn new(session: Arc<dyn GuestSession>) -> Self {
        Self {
            session: Some(session),
            aux: None,
        }
    }

    fn attach_aux(&mut self, aux: Option<HostAuxProcess>) {
        self.aux = aux;
    }

    /// Auxiliary process first, then power-off, then unregister. Errors are
    /// logged and swallowed.
    fn release(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        host_aux::stop(self.aux.take());

        if let Err(e) = session.power_off() {
            emit_teardown_error("power_off", &e);
        }
        if session.is_registered() {
            if let Err(e) = session.unregister() {
                emit_teardown_error("unregister", &e);
            }
        }
        info!(descriptor = %session.descriptor().display(), "guest torn down");
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.release();
    }
}

/// Wait for guest tools, bounded by `timeout`. On failure a note is appended
/// to the bundle's stderr artifact.
pub async fn wait_for_tools(
    session: &Arc<dyn GuestSession>,
    bundle: &Bundle,
    timeout: Duration,
) -> bool {
    let s = session.clone();
    let ready = run_bounded("wait-for-tools", timeout, move || s.wait_for_tools(timeout)).await;
    if !ready {
        bundle.append_note(&format!(
            "Guest tools did not become ready within {}s; the tests could not be run.",
            timeout.as_secs()
        ));
    }
    ready
}

/// Quote `s` for a POSIX guest shell.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The chmod and invocation commands for one phase script, in guest shell
/// paths. Stdout and stderr are redirected into the phase's output files.
fn script_commands(
    machine: &MachineSpec,
    phase: &TestPhase,
    script: &str,
) -> GuestResult<(String, String)> {
    let home = machine.home_in_shell.trim_end_matches('/');
    let shell_dir = GuestDir::new(format!("{home}/"))?;
    let script_path = shell_quote(&shell_dir.join(script)?);
    let stdout = shell_quote(&shell_dir.join(&phase.stdout_file())?);
    let stderr = shell_quote(&shell_dir.join(&phase.stderr_file())?);

    let chmod = format!("chmod +x {script_path}");
    let invoke = format!(
        "cd {} && {script_path} > {stdout} 2> {stderr}",
        shell_quote(shell_dir.as_str())
    );
    Ok((chmod, invoke))
}

/// Drives bundles through a guest obtained from a [`Hypervisor`].
pub struct TestOrchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    power_on_grace: Duration,
    responder: Option<String>,
}

impl TestOrchestrator {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, tester: &TesterSpec) -> Self {
        Self {
            hypervisor,
            power_on_grace: tester.power_on_grace,
            responder: tester.power_on_responder.clone(),
        }
    }

    /// Run one bundle to `TORN_DOWN` and report what happened.
    pub async fn run(&self, job: &TestJob) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let span = run_span(&run_id, &job.assignment.id);
        self.drive(job, run_id).instrument(span).await
    }

    async fn drive(&self, job: &TestJob, run_id: String) -> RunReport {
        let started = Instant::now();
        emit_run_started(
            &run_id,
            &job.bundle.dir().display().to_string(),
            &job.machine.id,
            job.assignment.storage.as_str(),
        );
        let mut report = RunReport::new(run_id, job);

        let hypervisor = self.hypervisor.clone();
        let descriptor = job.descriptor.clone();
        let connected = off_runtime(move || hypervisor.connect(&descriptor))
            .await
            .and_then(|connected| connected);
        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "cannot open guest session");
                job.bundle
                    .append_note(&format!("Cannot connect to the test machine: {e}"));
                report.failure = Some(e.to_string());
                report.enter(RunState::TornDown);
                return report.finish(RunOutcome::Failure, started);
            }
        };
        report.enter(RunState::Connected);

        let mut teardown = Teardown::new(session.clone());

        if let Err(e) = self.power_on_and_login(&session, job, &mut report).await {
            warn!(error = %e, "guest could not be prepared");
            report.failure = Some(e.to_string());
            teardown.release();
            report.enter(RunState::TornDown);
            return report.finish(RunOutcome::Failure, started);
        }

        if !job.assignment.settle_delay.is_zero() {
            tokio::time::sleep(job.assignment.settle_delay).await;
        }

        if let Some(remote) = &job.assignment.remote {
            info!(
                host = %remote.host,
                base_path = %remote.base_path,
                "large submission archive was pre-staged by the retrieval step"
            );
        }

        if let Some(command) = job.assignment.host_command.as_deref() {
            teardown.attach_aux(HostAuxProcess::start(job.bundle.dir(), command));
        }

        for phase in phase_plan(job.assignment.storage, job.assignment.timeout) {
            report.enter(phase.kind.into());
            let phase_report = self.execute_phase(&session, job, &phase, &report.run_id).await;
            let abort = !phase_report.completed && phase.kind.gates_later_phases();
            report.phases.push(phase_report);
            if abort {
                job.bundle.append_note(&format!(
                    "The {} phase did not complete; later phases were skipped.",
                    phase.name()
                ));
                report.aborted = true;
                break;
            }
        }

        teardown.release();
        report.enter(RunState::TornDown);
        report.finish(RunOutcome::Success, started)
    }

    /// Revert (if configured), power on, wait for tools, log in, each
    /// failure annotated in the stderr artifact.
    async fn power_on_and_login(
        &self,
        session: &Arc<dyn GuestSession>,
        job: &TestJob,
        report: &mut RunReport,
    ) -> GuestResult<()> {
        let bundle = &job.bundle;

        if job.assignment.revert_snapshot {
            let s = session.clone();
            let reverted =
                off_runtime(move || revert_to_snapshot(s.as_ref(), SnapshotSelector::Latest))
                    .await
                    .and_then(|index| index);
            if let Err(e) = reverted {
                bundle.append_note(&format!("Cannot revert the test machine to its snapshot: {e}"));
                return Err(e);
            }
            report.enter(RunState::Reverted);
        }

        if let Err(e) = self.power_on(session).await {
            bundle.append_note(&format!("Cannot power on the test machine: {e}"));
            return Err(e);
        }
        report.enter(RunState::PoweredOn);

        if !wait_for_tools(session, bundle, job.assignment.tools_timeout).await {
            return Err(GuestError::ToolsTimeout {
                secs: job.assignment.tools_timeout.as_secs(),
            });
        }
        report.enter(RunState::ToolsReady);

        let s = session.clone();
        let credentials = job.machine.credentials.clone();
        let logged_in = off_runtime(move || s.login(&credentials))
            .await
            .and_then(|login| login);
        if let Err(e) = logged_in {
            bundle.append_note(&format!("Cannot log into the test machine: {e}"));
            return Err(e);
        }
        report.enter(RunState::LoggedIn);
        Ok(())
    }

    /// Power on without blocking past the grace window. If the call is still
    /// pending by then, the dialog responder is spawned and the wait resumes
    /// without a bound.
    async fn power_on(&self, session: &Arc<dyn GuestSession>) -> GuestResult<()> {
        let (tx, mut rx) = oneshot::channel();
        let s = session.clone();
        thread::Builder::new()
            .name("power-on".to_string())
            .spawn(move || {
                let _ = tx.send(s.power_on());
            })?;

        if let Ok(result) = tokio::time::timeout(self.power_on_grace, &mut rx).await {
            return flatten_power_on(result);
        }

        warn!(
            grace_ms = self.power_on_grace.as_millis() as u64,
            "power-on still pending, guest may be waiting on a dialog"
        );
        let responder = self
            .responder
            .as_deref()
            .and_then(|command| DialogResponder::spawn(command, session.descriptor()));
        let result = rx.await;
        if let Some(responder) = responder {
            responder.finish();
        }
        flatten_power_on(result)
    }

    /// Stage in, run each script under the phase timeout, stage out. Output
    /// is staged out even after a timeout to keep partial results.
    async fn execute_phase(
        &self,
        session: &Arc<dyn GuestSession>,
        job: &TestJob,
        phase: &TestPhase,
        run_id: &str,
    ) -> PhaseReport {
        let started = Instant::now();
        let machine = &job.machine;
        let host_dir = job.bundle.dir();

        let staged_in = {
            let s = session.clone();
            let host_dir = host_dir.to_path_buf();
            let base_dir = machine.base_dir.clone();
            let (input, script) = (phase.input.clone(), phase.script.clone());
            off_runtime(move || {
                stager::stage_in_groups(
                    s.as_ref(),
                    &host_dir,
                    &base_dir,
                    &[input.as_slice(), script.as_slice()],
                )
            })
            .await
            .unwrap_or_else(|e| unstaged(&phase.input, &phase.script, &e))
        };

        let mut completed = true;
        let mut timed_out_script = None;
        let mut failure = None;
        for script in &phase.script {
            let (chmod, invoke) = match script_commands(machine, phase, script) {
                Ok(commands) => commands,
                Err(e) => {
                    warn!(script = %script, error = %e, "cannot build script command");
                    completed = false;
                    failure = Some(e.to_string());
                    break;
                }
            };

            let s = session.clone();
            let shell = machine.shell_path.clone();
            let label = format!("{}:{}", phase.name(), script);
            let outcome = run_bounded_detailed(&label, phase.timeout, move || {
                s.run_in_guest(&shell, &chmod)?;
                s.run_in_guest(&shell, &invoke)
            })
            .await;

            match outcome {
                Bounded::Completed => {}
                Bounded::TimedOut => {
                    job.bundle.append_note(&format!(
                        "{} did not finish within {}s.",
                        script,
                        phase.timeout.as_secs()
                    ));
                    completed = false;
                    timed_out_script = Some(script.clone());
                    break;
                }
                Bounded::Failed(e) => {
                    job.bundle
                        .append_note(&format!("{script} could not be run in the guest: {e}"));
                    completed = false;
                    failure = Some(e);
                    break;
                }
            }
        }

        let staged_out = {
            let s = session.clone();
            let host_dir = host_dir.to_path_buf();
            let base_dir = machine.base_dir.clone();
            let output = phase.output.clone();
            off_runtime(move || stager::stage_out(s.as_ref(), &host_dir, &base_dir, &output))
                .await
                .unwrap_or_else(|e| unstaged(&phase.output, &[], &e))
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        emit_phase_finished(run_id, phase.name(), completed, duration_ms);

        PhaseReport {
            phase: phase.kind,
            completed,
            timed_out_script,
            failure,
            staged_in,
            staged_out,
            duration_ms,
        }
    }
}

/// Run a blocking guest call on tokio's blocking pool. A panic inside `op`
/// resumes on the calling task so the teardown guard still unwinds.
async fn off_runtime<T, F>(op: F) -> GuestResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    match tokio::task::spawn_blocking(move || span.in_scope(op)).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(GuestError::Command(format!("blocking guest call cancelled: {e}"))),
    }
}

/// Staging report for a pass whose blocking task never ran.
fn unstaged(first: &[String], second: &[String], error: &GuestError) -> StageReport {
    warn!(error = %error, "staging pass did not run");
    StageReport {
        transferred: Vec::new(),
        anomalies: first.iter().chain(second).cloned().collect(),
    }
}

fn flatten_power_on(
    result: Result<GuestResult<()>, oneshot::error::RecvError>,
) -> GuestResult<()> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(GuestError::PowerOn("power-on thread panicked".to_string())),
    }
}
