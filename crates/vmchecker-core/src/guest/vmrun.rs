//! `vmrun` backend: drives VMware guests through the `vmrun` command-line
//! tool, locally or against a remote host (`-h https://host:port/sdk`).

use super::{GuestSession, Hypervisor};
use crate::config::{GuestCredentials, TesterSpec};
use crate::error::{GuestError, GuestResult};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TOOLS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// vmrun reports a non-zero exit of the guest program as its own failure.
/// A failing student script is not a control plane failure.
const GUEST_NONZERO_EXIT: &str = "Guest program exited with non-zero exit code";

/// Command builder shared by the hypervisor and its sessions.
#[derive(Debug, Clone)]
struct Vmrun {
    program: PathBuf,
    host_args: Vec<String>,
}

impl Vmrun {
    fn from_tester(tester: &TesterSpec) -> Self {
        let mut host_args = vec!["-T".to_string(), tester.vmware_type.clone()];
        if let Some(remote) = &tester.remote {
            let url = match remote.port {
                Some(port) => format!("https://{}:{}/sdk", remote.hostname, port),
                None => format!("https://{}/sdk", remote.hostname),
            };
            host_args.extend([
                "-h".to_string(),
                url,
                "-u".to_string(),
                remote.username.clone(),
                "-p".to_string(),
                remote.password.clone(),
            ]);
        }
        Self {
            program: tester.vmrun_path.clone(),
            host_args,
        }
    }

    fn args(&self, guest: Option<&GuestCredentials>, verb: &str, rest: &[&str]) -> Vec<String> {
        let mut args = self.host_args.clone();
        if let Some(creds) = guest {
            args.extend([
                "-gu".to_string(),
                creds.user.clone(),
                "-gp".to_string(),
                creds.password.clone(),
            ]);
        }
        args.push(verb.to_string());
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    /// Run one vmrun verb; `Err` carries vmrun's own error text.
    fn run(
        &self,
        guest: Option<&GuestCredentials>,
        verb: &str,
        rest: &[&str],
    ) -> Result<String, String> {
        debug!(verb = %verb, "vmrun");
        let output = Command::new(&self.program)
            .args(self.args(guest, verb, rest))
            .output()
            .map_err(|e| format!("cannot execute {}: {}", self.program.display(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stdout.is_empty() { stderr } else { stdout };
        Err(format!(
            "vmrun {} exited with {}: {}",
            verb,
            output.status.code().unwrap_or(-1),
            message
        ))
    }
}

/// Parse `vmrun listSnapshots` output: a `Total snapshots: N` header
/// followed by one snapshot name per line, oldest first.
fn parse_snapshot_list(output: &str) -> Result<Vec<String>, String> {
    let mut lines = output.lines();
    let header = lines
        .next()
        .ok_or_else(|| "empty listSnapshots output".to_string())?;
    let total: usize = header
        .rsplit(':')
        .next()
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| format!("unexpected listSnapshots header {header:?}"))?;

    let names: Vec<String> = lines
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if names.len() != total {
        return Err(format!(
            "listSnapshots announced {} snapshot(s) but listed {}",
            total,
            names.len()
        ));
    }
    Ok(names)
}

/// [`Hypervisor`] backed by the `vmrun` tool.
#[derive(Debug, Clone)]
pub struct VmrunHypervisor {
    vmrun: Vmrun,
    local: bool,
    register_vm: bool,
}

impl VmrunHypervisor {
    pub fn new(tester: &TesterSpec) -> Self {
        Self {
            vmrun: Vmrun::from_tester(tester),
            local: tester.remote.is_none(),
            register_vm: tester.register_vm,
        }
    }
}

impl Hypervisor for VmrunHypervisor {
    fn connect(&self, descriptor: &Path) -> GuestResult<Arc<dyn GuestSession>> {
        // Remote descriptors live in host datastores and cannot be checked here.
        if self.local && !descriptor.is_file() {
            return Err(GuestError::DescriptorNotFound(descriptor.to_path_buf()));
        }

        self.vmrun
            .run(None, "list", &[])
            .map_err(GuestError::Connection)?;

        let vmx = descriptor.to_string_lossy().into_owned();
        if self.register_vm {
            self.vmrun
                .run(None, "register", &[&vmx])
                .map_err(GuestError::Registration)?;
            info!(descriptor = %vmx, "guest descriptor registered");
        }

        Ok(Arc::new(VmrunSession {
            vmrun: self.vmrun.clone(),
            descriptor: descriptor.to_path_buf(),
            vmx,
            registered: self.register_vm,
            credentials: Mutex::new(None),
        }))
    }
}

/// One guest opened through `vmrun`.
#[derive(Debug)]
pub struct VmrunSession {
    vmrun: Vmrun,
    descriptor: PathBuf,
    vmx: String,
    registered: bool,
    credentials: Mutex<Option<GuestCredentials>>,
}

impl VmrunSession {
    fn logged_in(&self) -> GuestResult<GuestCredentials> {
        let creds = self
            .credentials
            .lock()
            .map_err(|_| GuestError::Command("credential lock poisoned".to_string()))?;
        creds
            .clone()
            .ok_or_else(|| GuestError::Command("not logged into guest".to_string()))
    }

    fn snapshot_names(&self) -> GuestResult<Vec<String>> {
        let output = self
            .vmrun
            .run(None, "listSnapshots", &[&self.vmx])
            .map_err(GuestError::Command)?;
        parse_snapshot_list(&output).map_err(GuestError::Command)
    }
}

impl GuestSession for VmrunSession {
    fn descriptor(&self) -> &Path {
        &self.descriptor
    }

    fn snapshot_count(&self) -> GuestResult<usize> {
        Ok(self.snapshot_names()?.len())
    }

    fn revert_to_snapshot_at(&self, index: usize) -> GuestResult<()> {
        let names = self.snapshot_names()?;
        let name = names.get(index).ok_or(GuestError::Snapshot {
            index,
            count: names.len(),
        })?;
        self.vmrun
            .run(None, "revertToSnapshot", &[&self.vmx, name])
            .map(|_| ())
            .map_err(GuestError::Command)
    }

    fn power_on(&self) -> GuestResult<()> {
        self.vmrun
            .run(None, "start", &[&self.vmx, "nogui"])
            .map(|_| ())
            .map_err(GuestError::PowerOn)
    }

    fn wait_for_tools(&self, timeout: Duration) -> GuestResult<()> {
        let start = Instant::now();
        loop {
            match self.vmrun.run(None, "checkToolsState", &[&self.vmx]) {
                Ok(state) if state.trim() == "running" => return Ok(()),
                Ok(state) => debug!(state = %state, "guest tools not ready"),
                Err(e) => debug!(error = %e, "checkToolsState failed"),
            }
            if start.elapsed() >= timeout {
                return Err(GuestError::ToolsTimeout {
                    secs: timeout.as_secs(),
                });
            }
            thread::sleep(TOOLS_POLL_INTERVAL);
        }
    }

    fn login(&self, credentials: &GuestCredentials) -> GuestResult<()> {
        self.vmrun
            .run(Some(credentials), "listProcessesInGuest", &[&self.vmx])
            .map_err(|reason| GuestError::Auth {
                user: credentials.user.clone(),
                reason,
            })?;

        let mut slot = self
            .credentials
            .lock()
            .map_err(|_| GuestError::Command("credential lock poisoned".to_string()))?;
        *slot = Some(credentials.clone());
        Ok(())
    }

    fn copy_to_guest(&self, host: &Path, guest: &str) -> GuestResult<()> {
        let creds = self.logged_in()?;
        let host_str = host.to_string_lossy();
        self.vmrun
            .run(
                Some(&creds),
                "CopyFileFromHostToGuest",
                &[&self.vmx, &host_str, guest],
            )
            .map(|_| ())
            .map_err(|reason| GuestError::Transfer {
                from: host_str.to_string(),
                to: guest.to_string(),
                reason,
            })
    }

    fn copy_from_guest(&self, guest: &str, host: &Path) -> GuestResult<()> {
        let creds = self.logged_in()?;
        let host_str = host.to_string_lossy();
        self.vmrun
            .run(
                Some(&creds),
                "CopyFileFromGuestToHost",
                &[&self.vmx, guest, &host_str],
            )
            .map(|_| ())
            .map_err(|reason| GuestError::Transfer {
                from: guest.to_string(),
                to: host_str.to_string(),
                reason,
            })
    }

    fn run_in_guest(&self, shell: &str, command: &str) -> GuestResult<()> {
        let creds = self.logged_in()?;
        match self
            .vmrun
            .run(Some(&creds), "runScriptInGuest", &[&self.vmx, shell, command])
        {
            Ok(_) => Ok(()),
            Err(e) if e.contains(GUEST_NONZERO_EXIT) => {
                debug!(error = %e, "guest command exited non-zero");
                Ok(())
            }
            Err(e) => Err(GuestError::Command(e)),
        }
    }

    fn power_off(&self) -> GuestResult<()> {
        self.vmrun
            .run(None, "stop", &[&self.vmx, "hard"])
            .map(|_| ())
            .map_err(GuestError::Teardown)
    }

    fn is_registered(&self) -> bool {
        self.registered
    }

    fn unregister(&self) -> GuestResult<()> {
        if !self.registered {
            warn!(descriptor = %self.vmx, "unregister requested for an unregistered guest");
            return Ok(());
        }
        self.vmrun
            .run(None, "unregister", &[&self.vmx])
            .map(|_| ())
            .map_err(GuestError::Teardown)
    }
}
