//! File staging between the bundle directory and the guest working directory.
//!
//! Transfers never abort a run. A missing host-side source before an inbound
//! copy, a failed copy, or a file still absent after an outbound copy is
//! logged and recorded in the returned [`StageReport`].

use crate::guest::{GuestDir, GuestSession};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

/// What happened to each file of one staging pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Files whose copy call succeeded.
    pub transferred: Vec<String>,
    /// Files with an anomaly (missing source, failed copy, missing result).
    pub anomalies: Vec<String>,
}

impl StageReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    fn merge(&mut self, other: StageReport) {
        self.transferred.extend(other.transferred);
        self.anomalies.extend(other.anomalies);
    }
}

/// Copy `files` from `host_dir` into `guest_dir`, in order.
pub fn stage_in<S>(
    session: &dyn GuestSession,
    host_dir: &Path,
    guest_dir: &GuestDir,
    files: &[S],
) -> StageReport
where
    S: AsRef<str>,
{
    let mut report = StageReport::default();
    for name in files.iter().map(AsRef::as_ref) {
        let host = host_dir.join(name);
        let guest = match guest_dir.join(name) {
            Ok(guest) => guest,
            Err(e) => {
                warn!(file = %name, error = %e, "cannot build guest path");
                report.anomalies.push(name.to_string());
                continue;
            }
        };

        let mut clean = true;
        if !host.is_file() {
            warn!(file = %name, host = %host.display(), "source missing before copy to guest");
            clean = false;
        }

        match session.copy_to_guest(&host, &guest) {
            Ok(()) => {
                debug!(file = %name, guest = %guest, "copied to guest");
                report.transferred.push(name.to_string());
            }
            Err(e) => {
                warn!(file = %name, error = %e, "copy to guest failed");
                clean = false;
            }
        }

        if !clean {
            report.anomalies.push(name.to_string());
        }
    }
    report
}

/// Copy `files` from `guest_dir` back into `host_dir`, in order.
pub fn stage_out<S>(
    session: &dyn GuestSession,
    host_dir: &Path,
    guest_dir: &GuestDir,
    files: &[S],
) -> StageReport
where
    S: AsRef<str>,
{
    let mut report = StageReport::default();
    for name in files.iter().map(AsRef::as_ref) {
        let host = host_dir.join(name);
        let guest = match guest_dir.join(name) {
            Ok(guest) => guest,
            Err(e) => {
                warn!(file = %name, error = %e, "cannot build guest path");
                report.anomalies.push(name.to_string());
                continue;
            }
        };

        let mut clean = true;
        match session.copy_from_guest(&guest, &host) {
            Ok(()) => {
                debug!(file = %name, guest = %guest, "copied from guest");
                report.transferred.push(name.to_string());
            }
            Err(e) => {
                warn!(file = %name, error = %e, "copy from guest failed");
                clean = false;
            }
        }

        if !host.is_file() {
            warn!(
                file = %name,
                host = %host.display(),
                "destination missing after copy from guest"
            );
            clean = false;
        }

        if !clean {
            report.anomalies.push(name.to_string());
        }
    }
    report
}

/// Stage several file groups in one pass, e.g. a phase's inputs then scripts.
pub fn stage_in_groups(
    session: &dyn GuestSession,
    host_dir: &Path,
    guest_dir: &GuestDir,
    groups: &[&[String]],
) -> StageReport {
    let mut report = StageReport::default();
    for files in groups {
        report.merge(stage_in(session, host_dir, guest_dir, files));
    }
    report
}
