//! Whole-bundle entry point: validate the bundle, load its configuration,
//! resolve the guest descriptor, then hand over to the orchestrator.
//!
//! Setup failures return `Err` before any guest session is opened; the caller
//! maps them to a non-zero exit. Everything after connect is reported through
//! the returned [`RunReport`].

use crate::bundle::{Bundle, COURSE_CONFIG, SUBMISSION_CONFIG};
use crate::config::{CourseConfig, SubmissionConfig, TesterSpec};
use crate::error::Result;
use crate::guest::{Hypervisor, VmrunHypervisor};
use crate::orchestrator::{RunReport, TestJob, TestOrchestrator};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Default control plane: the `vmrun` backend configured from `[Tester]`.
pub fn vmrun_hypervisor(tester: &TesterSpec) -> Arc<dyn Hypervisor> {
    Arc::new(VmrunHypervisor::new(tester))
}

/// Resolve everything a run needs from the bundle directory alone.
pub fn prepare(dir: &Path) -> Result<(TestJob, TesterSpec)> {
    let bundle = Bundle::open(dir)?;
    let submission = SubmissionConfig::load(&bundle.path(SUBMISSION_CONFIG))?;
    let course = CourseConfig::load(&bundle.path(COURSE_CONFIG))?;

    let tester = course.tester()?;
    let (assignment, machine) = course.assignment(&submission.assignment)?;
    let descriptor = bundle.resolve_descriptor(&machine.descriptor)?;

    info!(
        bundle = %bundle.dir().display(),
        assignment = %assignment.id,
        user = %submission.user,
        machine = %machine.id,
        descriptor = %descriptor.display(),
        "bundle prepared"
    );

    Ok((
        TestJob {
            bundle,
            assignment,
            machine,
            descriptor,
        },
        tester,
    ))
}

/// Run the bundle in `dir` against the control plane built by
/// `make_hypervisor`.
pub async fn run_bundle<F>(dir: &Path, make_hypervisor: F) -> Result<RunReport>
where
    F: FnOnce(&TesterSpec) -> Arc<dyn Hypervisor>,
{
    let (job, tester) = match prepare(dir) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!(bundle = %dir.display(), error = %e, "bundle setup failed");
            Bundle::new(dir).append_note(&format!("Cannot start the test run: {e}"));
            return Err(e);
        }
    };

    let orchestrator = TestOrchestrator::new(make_hypervisor(&tester), &tester);
    Ok(orchestrator.run(&job).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ARCHIVE, STDERR_ARTIFACT, TESTS};
    use crate::error::ExecutorError;
    use tempfile::tempdir;

    const COURSE: &str = "\
[assignment so-1]
Machine = linux
Timeout = 30
StorageType = large

[machine linux]
GuestUser = student
GuestPassword = student
GuestBasePath = /home/student/
";

    fn write_bundle(dir: &Path) {
        std::fs::write(dir.join(ARCHIVE), b"zip").unwrap();
        std::fs::write(dir.join(TESTS), b"zip").unwrap();
        std::fs::write(
            dir.join(SUBMISSION_CONFIG),
            "[Assignment]\nAssignment = so-1\nUser = alice\n",
        )
        .unwrap();
        std::fs::write(dir.join(COURSE_CONFIG), COURSE).unwrap();
    }

    #[test]
    fn test_prepare_discovers_descriptor_in_bundle() {
        let dir = tempdir().unwrap();
        write_bundle(dir.path());
        std::fs::write(dir.path().join("linux.vmx"), b"").unwrap();

        let (job, tester) = prepare(dir.path()).unwrap();
        assert_eq!(job.assignment.id, "so-1");
        assert_eq!(job.machine.id, "linux");
        assert_eq!(job.descriptor, dir.path().join("linux.vmx"));
        assert_eq!(tester, TesterSpec::default());
    }

    #[test]
    fn test_prepare_without_descriptor() {
        let dir = tempdir().unwrap();
        write_bundle(dir.path());
        assert!(matches!(
            prepare(dir.path()),
            Err(ExecutorError::DescriptorUnresolved(_))
        ));
    }

    #[test]
    fn test_prepare_unknown_assignment() {
        let dir = tempdir().unwrap();
        write_bundle(dir.path());
        std::fs::write(
            dir.path().join(SUBMISSION_CONFIG),
            "[Assignment]\nAssignment = so-9\nUser = alice\n",
        )
        .unwrap();
        assert!(matches!(prepare(dir.path()), Err(ExecutorError::Config(_))));
    }

    #[tokio::test]
    async fn test_setup_failure_is_noted_and_never_builds_a_hypervisor() {
        let dir = tempdir().unwrap();
        let result = run_bundle(dir.path(), |_| -> Arc<dyn Hypervisor> {
            panic!("hypervisor must not be built for an incomplete bundle")
        })
        .await;
        assert!(matches!(result, Err(ExecutorError::MissingBundleFiles { .. })));
        let note = std::fs::read_to_string(dir.path().join(STDERR_ARTIFACT)).unwrap();
        assert!(note.contains("archive.zip"));
    }
}
