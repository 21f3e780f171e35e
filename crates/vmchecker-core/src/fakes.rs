//! Recording fakes for the guest traits (testing only)
//!
//! `RecordingHypervisor` and `RecordingSession` satisfy the [`Hypervisor`] and
//! [`GuestSession`] contracts without a virtualization host. Every call is
//! recorded as a [`GuestOp`] before its scripted behavior runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::config::GuestCredentials;
use crate::error::{GuestError, GuestResult};
use crate::guest::{GuestSession, Hypervisor};

/// One recorded guest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestOp {
    Revert(usize),
    PowerOn,
    WaitForTools,
    Login(String),
    /// Guest-side destination path.
    CopyIn(String),
    /// Guest-side source path.
    CopyOut(String),
    /// Full command handed to the guest shell.
    Run(String),
    PowerOff,
    Unregister,
}

/// How a script invocation behaves inside the fake guest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScriptBehavior {
    #[default]
    Complete,
    /// Block the calling thread, then complete.
    Hang(Duration),
    Fail,
}

/// Scripted behavior of a [`RecordingSession`].
#[derive(Debug, Clone)]
pub struct SessionScript {
    pub snapshots: usize,
    pub power_on_delay: Duration,
    pub power_on_fails: bool,
    pub tools_ready: bool,
    pub login_ok: bool,
    /// File names present in the guest before any copy.
    pub guest_files: Vec<String>,
    /// Behavior per script file name; unlisted scripts complete.
    pub scripts: HashMap<String, ScriptBehavior>,
    /// Extra files a script leaves in the guest, keyed by script name.
    pub outputs: HashMap<String, Vec<String>>,
    pub registered: bool,
    pub power_off_fails: bool,
    /// Panic while copying this file name into the guest.
    pub panic_on_copy_in: Option<String>,
    /// Host pidfile inspected by `power_off`; whether that process was still
    /// alive is kept for [`RecordingSession::pid_alive_at_power_off`].
    pub pidfile_at_power_off: Option<PathBuf>,
}

impl Default for SessionScript {
    fn default() -> Self {
        Self {
            snapshots: 1,
            power_on_delay: Duration::ZERO,
            power_on_fails: false,
            tools_ready: true,
            login_ok: true,
            guest_files: Vec::new(),
            scripts: HashMap::new(),
            outputs: HashMap::new(),
            registered: false,
            power_off_fails: false,
            panic_on_copy_in: None,
            pidfile_at_power_off: None,
        }
    }
}

impl SessionScript {
    pub fn with_script(mut self, name: &str, behavior: ScriptBehavior) -> Self {
        self.scripts.insert(name.to_string(), behavior);
        self
    }
}

/// Last path segment, for either guest separator.
fn file_name(guest_path: &str) -> &str {
    guest_path.rsplit(['/', '\\']).next().unwrap_or(guest_path)
}

fn read_pid(pidfile: &Path) -> Option<Pid> {
    let text = std::fs::read_to_string(pidfile).ok()?;
    text.trim().parse::<i32>().ok().map(Pid::from_raw)
}

/// Redirect targets (`> path`, `2> path`) of a shell command.
fn redirect_targets(command: &str) -> Vec<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    tokens
        .windows(2)
        .filter(|pair| pair[0] == ">" || pair[0] == "2>")
        .map(|pair| file_name(pair[1].trim_matches('\'')).to_string())
        .collect()
}

/// In-memory guest session that records every call.
#[derive(Debug)]
pub struct RecordingSession {
    descriptor: PathBuf,
    script: SessionScript,
    ops: Mutex<Vec<GuestOp>>,
    guest_files: Mutex<HashSet<String>>,
    pid_alive_at_power_off: Mutex<Option<bool>>,
}

impl RecordingSession {
    pub fn new(script: SessionScript) -> Self {
        Self::with_descriptor("/vm/fake.vmx", script)
    }

    pub fn with_descriptor(descriptor: impl Into<PathBuf>, script: SessionScript) -> Self {
        let guest_files = script.guest_files.iter().cloned().collect();
        Self {
            descriptor: descriptor.into(),
            script,
            ops: Mutex::new(Vec::new()),
            guest_files: Mutex::new(guest_files),
            pid_alive_at_power_off: Mutex::new(None),
        }
    }

    /// Calls recorded so far, in order.
    pub fn ops(&self) -> Vec<GuestOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, op: &GuestOp) -> usize {
        self.ops.lock().unwrap().iter().filter(|o| *o == op).count()
    }

    /// Guest paths copied in, in order.
    pub fn copied_in(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                GuestOp::CopyIn(path) => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Guest paths copied out, in order.
    pub fn copied_out(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                GuestOp::CopyOut(path) => Some(path),
                _ => None,
            })
            .collect()
    }

    /// `None` if no pidfile was configured or it held no pid at power-off.
    pub fn pid_alive_at_power_off(&self) -> Option<bool> {
        *self.pid_alive_at_power_off.lock().unwrap()
    }

    pub fn has_guest_file(&self, name: &str) -> bool {
        self.guest_files.lock().unwrap().contains(name)
    }

    fn record(&self, op: GuestOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn add_guest_file(&self, name: &str) {
        self.guest_files.lock().unwrap().insert(name.to_string());
    }

    /// Name of the scripted file a command invokes, if any.
    fn invoked_script(&self, command: &str) -> Option<String> {
        self.script
            .scripts
            .keys()
            .chain(self.script.outputs.keys())
            .find(|name| command.contains(&format!("/{name}")))
            .cloned()
    }
}

impl GuestSession for RecordingSession {
    fn descriptor(&self) -> &Path {
        &self.descriptor
    }

    fn snapshot_count(&self) -> GuestResult<usize> {
        Ok(self.script.snapshots)
    }

    fn revert_to_snapshot_at(&self, index: usize) -> GuestResult<()> {
        self.record(GuestOp::Revert(index));
        Ok(())
    }

    fn power_on(&self) -> GuestResult<()> {
        self.record(GuestOp::PowerOn);
        if !self.script.power_on_delay.is_zero() {
            thread::sleep(self.script.power_on_delay);
        }
        if self.script.power_on_fails {
            return Err(GuestError::PowerOn("scripted power-on failure".to_string()));
        }
        Ok(())
    }

    fn wait_for_tools(&self, timeout: Duration) -> GuestResult<()> {
        self.record(GuestOp::WaitForTools);
        if self.script.tools_ready {
            return Ok(());
        }
        thread::sleep(timeout);
        Err(GuestError::ToolsTimeout {
            secs: timeout.as_secs(),
        })
    }

    fn login(&self, credentials: &GuestCredentials) -> GuestResult<()> {
        self.record(GuestOp::Login(credentials.user.clone()));
        if self.script.login_ok {
            Ok(())
        } else {
            Err(GuestError::Auth {
                user: credentials.user.clone(),
                reason: "scripted rejection".to_string(),
            })
        }
    }

    fn copy_to_guest(&self, host: &Path, guest: &str) -> GuestResult<()> {
        self.record(GuestOp::CopyIn(guest.to_string()));
        let name = file_name(guest);
        if self.script.panic_on_copy_in.as_deref() == Some(name) {
            panic!("scripted panic while copying {name}");
        }
        if !host.is_file() {
            return Err(GuestError::Transfer {
                from: host.display().to_string(),
                to: guest.to_string(),
                reason: "no such host file".to_string(),
            });
        }
        self.add_guest_file(name);
        Ok(())
    }

    fn copy_from_guest(&self, guest: &str, host: &Path) -> GuestResult<()> {
        self.record(GuestOp::CopyOut(guest.to_string()));
        let name = file_name(guest);
        if !self.has_guest_file(name) {
            return Err(GuestError::Transfer {
                from: guest.to_string(),
                to: host.display().to_string(),
                reason: "no such guest file".to_string(),
            });
        }
        std::fs::write(host, format!("{name} from guest\n"))?;
        Ok(())
    }

    fn run_in_guest(&self, _shell: &str, command: &str) -> GuestResult<()> {
        self.record(GuestOp::Run(command.to_string()));
        if command.starts_with("chmod ") {
            return Ok(());
        }

        // the shell creates redirect targets before the script runs
        for target in redirect_targets(command) {
            self.add_guest_file(&target);
        }

        let Some(script) = self.invoked_script(command) else {
            return Ok(());
        };
        for output in self.script.outputs.get(&script).into_iter().flatten() {
            self.add_guest_file(output);
        }
        match self.script.scripts.get(&script).cloned().unwrap_or_default() {
            ScriptBehavior::Complete => Ok(()),
            ScriptBehavior::Hang(duration) => {
                thread::sleep(duration);
                Ok(())
            }
            ScriptBehavior::Fail => Err(GuestError::Command(format!("{script} exited abnormally"))),
        }
    }

    fn power_off(&self) -> GuestResult<()> {
        self.record(GuestOp::PowerOff);
        if let Some(pidfile) = &self.script.pidfile_at_power_off {
            let alive = read_pid(pidfile).map(|pid| kill(pid, None).is_ok());
            *self.pid_alive_at_power_off.lock().unwrap() = alive;
        }
        if self.script.power_off_fails {
            return Err(GuestError::Teardown("scripted power-off failure".to_string()));
        }
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.script.registered
    }

    fn unregister(&self) -> GuestResult<()> {
        self.record(GuestOp::Unregister);
        Ok(())
    }
}

/// Hands out [`RecordingSession`]s and remembers the last one.
#[derive(Debug, Default)]
pub struct RecordingHypervisor {
    script: SessionScript,
    fail_connect: bool,
    connects: AtomicUsize,
    last: Mutex<Option<Arc<RecordingSession>>>,
}

impl RecordingHypervisor {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// A hypervisor whose host is unreachable.
    pub fn unreachable() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Session opened by the most recent successful `connect`.
    pub fn session(&self) -> Option<Arc<RecordingSession>> {
        self.last.lock().unwrap().clone()
    }
}

impl Hypervisor for RecordingHypervisor {
    fn connect(&self, descriptor: &Path) -> GuestResult<Arc<dyn GuestSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(GuestError::Connection("host unreachable".to_string()));
        }
        let session = Arc::new(RecordingSession::with_descriptor(
            descriptor,
            self.script.clone(),
        ));
        *self.last.lock().unwrap() = Some(session.clone());
        Ok(session)
    }
}
