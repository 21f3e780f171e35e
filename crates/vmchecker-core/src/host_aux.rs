//! Host-side helper processes scoped to one bundle run.
//!
//! - [`HostAuxProcess`]: optional instrumentation (e.g. kernel message capture)
//!   whose output is appended to the bundle's `run-km.vmr`.
//! - [`DialogResponder`]: spawned when power-on stalls on a pending guest
//!   dialog, and reaped once power-on returns.
//!
//! Both are convenience processes: start and stop failures are logged and
//! swallowed, they never decide the run outcome.

use crate::bundle::AUX_LOG;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a stopped process gets to exit after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);
const REAP_POLL: Duration = Duration::from_millis(20);

/// Environment variable carrying the guest descriptor to the dialog responder.
pub const RESPONDER_DESCRIPTOR_ENV: &str = "VMCHECKER_VMX";

/// Spawn `command_line` through `sh -c` in its own process group.
fn spawn_shell(
    command_line: &str,
    stdout: Stdio,
    stderr: Stdio,
    envs: &[(&str, &str)],
) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.spawn()
}

/// SIGTERM the child's process group, escalate to SIGKILL after `grace`,
/// and reap it.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        debug!(pid = child.id(), error = %e, "SIGTERM to process group failed");
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(REAP_POLL);
    }

    warn!(pid = child.id(), "process ignored SIGTERM, killing");
    let _ = killpg(pgid, Signal::SIGKILL);
    child.kill().or_else(|e| {
        if e.kind() == std::io::ErrorKind::InvalidInput {
            Ok(())
        } else {
            Err(e)
        }
    })?;
    child.wait().map(|_| ())
}

/// A running host auxiliary process and its log handle.
#[derive(Debug)]
pub struct HostAuxProcess {
    child: Child,
    log: File,
    log_path: PathBuf,
    command_line: String,
}

impl HostAuxProcess {
    /// Start `command_line` with its output appended to `run-km.vmr` in
    /// `bundle_dir`. An empty command starts nothing.
    pub fn start(bundle_dir: &Path, command_line: &str) -> Option<Self> {
        let command_line = command_line.trim();
        if command_line.is_empty() {
            return None;
        }

        let log_path = bundle_dir.join(AUX_LOG);
        let spawned = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .and_then(|log| {
                let stdout = log.try_clone()?;
                let stderr = log.try_clone()?;
                let child = spawn_shell(command_line, stdout.into(), stderr.into(), &[])?;
                Ok((child, log))
            });

        match spawned {
            Ok((child, log)) => {
                info!(
                    pid = child.id(),
                    command = %command_line,
                    log = %log_path.display(),
                    "host auxiliary process started"
                );
                Some(Self {
                    child,
                    log,
                    log_path,
                    command_line: command_line.to_string(),
                })
            }
            Err(e) => {
                warn!(command = %command_line, error = %e, "cannot start host auxiliary process");
                None
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Terminate the process and close its log handle.
    pub fn stop(mut self) {
        match terminate(&mut self.child, STOP_GRACE) {
            Ok(()) => info!(command = %self.command_line, "host auxiliary process stopped"),
            Err(e) => warn!(
                command = %self.command_line,
                error = %e,
                "cannot stop host auxiliary process"
            ),
        }
        if let Err(e) = self.log.sync_all() {
            debug!(error = %e, "cannot flush host auxiliary log");
        }
    }
}

/// Stop an optional auxiliary process; `None` is a no-op.
pub fn stop(handle: Option<HostAuxProcess>) {
    if let Some(process) = handle {
        process.stop();
    }
}

/// Host process that answers a pending guest dialog during power-on.
#[derive(Debug)]
pub struct DialogResponder {
    child: Child,
}

impl DialogResponder {
    /// Spawn `command_line` with the guest descriptor in `VMCHECKER_VMX`.
    pub fn spawn(command_line: &str, descriptor: &Path) -> Option<Self> {
        let command_line = command_line.trim();
        if command_line.is_empty() {
            return None;
        }
        let descriptor = descriptor.to_string_lossy();
        match spawn_shell(
            command_line,
            Stdio::null(),
            Stdio::null(),
            &[(RESPONDER_DESCRIPTOR_ENV, descriptor.as_ref())],
        ) {
            Ok(child) => {
                info!(pid = child.id(), command = %command_line, "dialog responder spawned");
                Some(Self { child })
            }
            Err(e) => {
                warn!(command = %command_line, error = %e, "cannot spawn dialog responder");
                None
            }
        }
    }

    /// Reap the responder, terminating it if it is still running.
    pub fn finish(mut self) {
        if let Err(e) = terminate(&mut self.child, STOP_GRACE) {
            warn!(error = %e, "cannot reap dialog responder");
        }
    }
}
