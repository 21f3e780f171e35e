//! Lifecycle tests for the test orchestrator, driven through the recording
//! hypervisor: operation order per storage mode, phase timeouts, failure
//! paths and the exactly-once teardown guarantee.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use vmchecker_core::bundle::{
    ARCHIVE, AUX_LOG, BUILD_SCRIPT, COURSE_CONFIG, RUN_SCRIPT, STDERR_ARTIFACT, SUBMISSION_CONFIG,
    TESTS,
};
use vmchecker_core::fakes::{GuestOp, RecordingHypervisor, ScriptBehavior, SessionScript};
use vmchecker_core::{
    AssignmentSpec, Bundle, DescriptorSource, GuestCredentials, GuestDir, GuestSession,
    MachineSpec, RunState, StorageMode, TestJob, TestOrchestrator, TesterSpec,
};

// -------------------------------------------------------------------------
// fixtures
// -------------------------------------------------------------------------

const HOME: &str = "/home/student/";

fn machine() -> MachineSpec {
    MachineSpec {
        id: "so-linux".to_string(),
        descriptor: DescriptorSource::FromBundle,
        credentials: GuestCredentials {
            user: "student".to_string(),
            password: "student".to_string(),
        },
        shell_path: "/bin/bash".to_string(),
        base_dir: GuestDir::new(HOME).unwrap(),
        home_in_shell: "/home/student".to_string(),
        host_command: None,
    }
}

fn assignment(storage: StorageMode, timeout: Duration) -> AssignmentSpec {
    AssignmentSpec {
        id: "so-tema1".to_string(),
        machine: "so-linux".to_string(),
        timeout,
        revert_snapshot: true,
        tools_timeout: Duration::from_millis(300),
        settle_delay: Duration::ZERO,
        storage,
        remote: None,
        host_command: None,
    }
}

fn job(dir: &Path, storage: StorageMode, timeout: Duration) -> TestJob {
    for name in [
        ARCHIVE,
        TESTS,
        SUBMISSION_CONFIG,
        COURSE_CONFIG,
        BUILD_SCRIPT,
        RUN_SCRIPT,
    ] {
        std::fs::write(dir.join(name), name).unwrap();
    }
    TestJob {
        bundle: Bundle::open(dir).unwrap(),
        assignment: assignment(storage, timeout),
        machine: machine(),
        descriptor: dir.join("guest.vmx"),
    }
}

fn tester() -> TesterSpec {
    TesterSpec {
        power_on_grace: Duration::from_millis(100),
        ..TesterSpec::default()
    }
}

fn orchestrator(hypervisor: &Arc<RecordingHypervisor>) -> TestOrchestrator {
    TestOrchestrator::new(hypervisor.clone(), &tester())
}

fn guest(name: &str) -> String {
    format!("{HOME}{name}")
}

fn notes(dir: &Path) -> String {
    std::fs::read_to_string(dir.join(STDERR_ARTIFACT)).unwrap_or_default()
}

// -------------------------------------------------------------------------
// operation order
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_normal_mode_operation_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(report.success());
    assert!(!report.aborted);
    assert_eq!(
        report.states,
        vec![
            RunState::Connected,
            RunState::Reverted,
            RunState::PoweredOn,
            RunState::ToolsReady,
            RunState::LoggedIn,
            RunState::BuildPhase,
            RunState::RunPhase,
            RunState::TornDown,
        ]
    );

    let session = hypervisor.session().unwrap();
    assert_eq!(session.descriptor(), dir.path().join("guest.vmx").as_path());
    assert_eq!(
        session.ops(),
        vec![
            GuestOp::Revert(0),
            GuestOp::PowerOn,
            GuestOp::WaitForTools,
            GuestOp::Login("student".to_string()),
            GuestOp::CopyIn(guest("archive.zip")),
            GuestOp::CopyIn(guest("tests.zip")),
            GuestOp::CopyIn(guest("build.sh")),
            GuestOp::Run("chmod +x /home/student/build.sh".to_string()),
            GuestOp::Run(
                "cd /home/student/ && /home/student/build.sh \
                 > /home/student/build-stdout.vmr 2> /home/student/build-stderr.vmr"
                    .to_string()
            ),
            GuestOp::CopyOut(guest("build-stdout.vmr")),
            GuestOp::CopyOut(guest("build-stderr.vmr")),
            GuestOp::CopyIn(guest("run.sh")),
            GuestOp::Run("chmod +x /home/student/run.sh".to_string()),
            GuestOp::Run(
                "cd /home/student/ && /home/student/run.sh \
                 > /home/student/run-stdout.vmr 2> /home/student/run-stderr.vmr"
                    .to_string()
            ),
            GuestOp::CopyOut(guest("run-stdout.vmr")),
            GuestOp::CopyOut(guest("run-stderr.vmr")),
            GuestOp::PowerOff,
        ]
    );

    for output in [
        "build-stdout.vmr",
        "build-stderr.vmr",
        "run-stdout.vmr",
        "run-stderr.vmr",
    ] {
        assert!(dir.path().join(output).is_file(), "{output} not retrieved");
    }
    assert!(report.phases.iter().all(|p| p.completed));
    assert!(report.phases.iter().all(|p| p.staged_in.is_clean()));
    assert!(notes(dir.path()).is_empty());
}

#[tokio::test]
async fn test_large_mode_never_stages_archive() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Large, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(report.success());
    assert!(!report.reached(RunState::BuildPhase));
    assert!(report.reached(RunState::RunPhase));

    let session = hypervisor.session().unwrap();
    assert_eq!(session.copied_in(), vec![guest("tests.zip"), guest("run.sh")]);
    assert_eq!(
        session.copied_out(),
        vec![guest("run-stdout.vmr"), guest("run-stderr.vmr")]
    );
}

#[tokio::test]
async fn test_revert_skipped_when_not_configured() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    job.assignment.revert_snapshot = false;
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(report.success());
    assert!(!report.reached(RunState::Reverted));
    assert_eq!(hypervisor.session().unwrap().ops()[0], GuestOp::PowerOn);
}

// -------------------------------------------------------------------------
// phase timeouts and failures
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_build_timeout_skips_run_phase() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_millis(200));
    let script = SessionScript::default()
        .with_script("build.sh", ScriptBehavior::Hang(Duration::from_secs(3)));
    let hypervisor = Arc::new(RecordingHypervisor::new(script));

    let report = orchestrator(&hypervisor).run(&job).await;

    // the tests ran, they just did not finish
    assert!(report.success());
    assert!(report.aborted);
    assert_eq!(report.phases.len(), 1);
    assert!(!report.phases[0].completed);
    assert_eq!(report.phases[0].timed_out_script.as_deref(), Some("build.sh"));
    assert!(!report.reached(RunState::RunPhase));
    assert!(report.reached(RunState::TornDown));

    let session = hypervisor.session().unwrap();
    // partial output still retrieved
    assert!(session
        .copied_out()
        .contains(&guest("build-stdout.vmr")));
    assert!(!session.copied_in().contains(&guest("run.sh")));
    assert_eq!(session.count(&GuestOp::PowerOff), 1);
    assert!(notes(dir.path()).contains("build.sh did not finish"));
}

#[tokio::test]
async fn test_run_timeout_still_stages_out() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_millis(200));
    let script = SessionScript::default()
        .with_script("run.sh", ScriptBehavior::Hang(Duration::from_secs(3)));
    let hypervisor = Arc::new(RecordingHypervisor::new(script));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(report.success());
    assert!(!report.aborted);
    assert_eq!(report.phases.len(), 2);
    assert!(report.phases[0].completed);
    assert!(!report.phases[1].completed);
    assert_eq!(report.phases[1].timed_out_script.as_deref(), Some("run.sh"));

    let session = hypervisor.session().unwrap();
    assert!(session.copied_out().contains(&guest("run-stdout.vmr")));
    assert!(session.copied_out().contains(&guest("run-stderr.vmr")));
    assert_eq!(session.ops().last(), Some(&GuestOp::PowerOff));
    assert!(dir.path().join("run-stdout.vmr").is_file());
}

#[tokio::test]
async fn test_failing_test_script_is_content_not_controller_failure() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let script = SessionScript::default().with_script("run.sh", ScriptBehavior::Fail);
    let hypervisor = Arc::new(RecordingHypervisor::new(script));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(report.success());
    let run = &report.phases[1];
    assert!(!run.completed);
    assert!(run.timed_out_script.is_none());
    assert!(run.failure.as_deref().unwrap_or_default().contains("run.sh"));
    assert!(notes(dir.path()).contains("run.sh could not be run"));
}

// -------------------------------------------------------------------------
// preparation failures
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_tools_timeout_fails_run_and_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        tools_ready: false,
        ..SessionScript::default()
    }));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(!report.success());
    assert!(report.reached(RunState::PoweredOn));
    assert!(!report.reached(RunState::ToolsReady));
    assert_eq!(report.states.last(), Some(&RunState::TornDown));
    assert!(report.phases.is_empty());

    let session = hypervisor.session().unwrap();
    assert!(session.copied_in().is_empty());
    assert_eq!(session.count(&GuestOp::Login("student".to_string())), 0);
    assert_eq!(session.count(&GuestOp::PowerOff), 1);
    assert!(notes(dir.path()).contains("Guest tools did not become ready"));
}

#[tokio::test]
async fn test_login_failure_fails_run_and_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        login_ok: false,
        ..SessionScript::default()
    }));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(!report.success());
    assert!(report.reached(RunState::ToolsReady));
    assert!(!report.reached(RunState::LoggedIn));
    assert!(report.failure.as_deref().unwrap_or_default().contains("student"));

    let session = hypervisor.session().unwrap();
    assert!(session.copied_in().is_empty());
    assert_eq!(session.ops().last(), Some(&GuestOp::PowerOff));
    assert!(notes(dir.path()).contains("Cannot log into the test machine"));
}

#[tokio::test]
async fn test_missing_snapshot_fails_before_power_on() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        snapshots: 0,
        ..SessionScript::default()
    }));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(!report.success());
    assert_eq!(
        report.states,
        vec![RunState::Connected, RunState::TornDown]
    );
    assert_eq!(hypervisor.session().unwrap().ops(), vec![GuestOp::PowerOff]);
    assert!(notes(dir.path()).contains("snapshot"));
}

#[tokio::test]
async fn test_power_on_failure_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        power_on_fails: true,
        ..SessionScript::default()
    }));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(!report.success());
    assert!(!report.reached(RunState::PoweredOn));
    assert_eq!(
        hypervisor.session().unwrap().count(&GuestOp::PowerOff),
        1
    );
    assert!(notes(dir.path()).contains("Cannot power on the test machine"));
}

#[tokio::test]
async fn test_unreachable_host_never_opens_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::unreachable());

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(!report.success());
    assert_eq!(report.states, vec![RunState::TornDown]);
    assert_eq!(hypervisor.connect_count(), 1);
    assert!(hypervisor.session().is_none());
    assert!(notes(dir.path()).contains("Cannot connect to the test machine"));
}

// -------------------------------------------------------------------------
// teardown
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_every_exit_path_tears_down_exactly_once() {
    let scripts = vec![
        SessionScript::default(),
        SessionScript {
            tools_ready: false,
            ..SessionScript::default()
        },
        SessionScript {
            login_ok: false,
            ..SessionScript::default()
        },
        SessionScript {
            snapshots: 0,
            ..SessionScript::default()
        },
        SessionScript::default()
            .with_script("build.sh", ScriptBehavior::Hang(Duration::from_secs(3))),
        SessionScript::default()
            .with_script("run.sh", ScriptBehavior::Hang(Duration::from_secs(3))),
    ];

    for script in scripts {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), StorageMode::Normal, Duration::from_millis(200));
        let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
            registered: true,
            ..script
        }));

        let report = orchestrator(&hypervisor).run(&job).await;

        let session = hypervisor.session().unwrap();
        assert_eq!(session.count(&GuestOp::PowerOff), 1, "{:?}", report.states);
        assert_eq!(session.count(&GuestOp::Unregister), 1, "{:?}", report.states);
        assert_eq!(report.states.last(), Some(&RunState::TornDown));
    }
}

#[tokio::test]
async fn test_unregister_follows_power_off_for_registered_guest() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Large, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        registered: true,
        ..SessionScript::default()
    }));

    orchestrator(&hypervisor).run(&job).await;

    let ops = hypervisor.session().unwrap().ops();
    assert_eq!(
        &ops[ops.len() - 2..],
        &[GuestOp::PowerOff, GuestOp::Unregister]
    );
}

#[tokio::test]
async fn test_teardown_errors_never_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        power_off_fails: true,
        registered: true,
        ..SessionScript::default()
    }));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(report.success());
    // unregister is still attempted after a failed power-off
    assert_eq!(
        hypervisor.session().unwrap().count(&GuestOp::Unregister),
        1
    );
}

#[test]
fn test_panic_mid_phase_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Normal, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        panic_on_copy_in: Some("tests.zip".to_string()),
        ..SessionScript::default()
    }));
    let orchestrator = orchestrator(&hypervisor);

    let outcome = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(orchestrator.run(&job))
    })
    .join();

    assert!(outcome.is_err(), "the panic should surface to the caller");
    let session = hypervisor.session().unwrap();
    assert_eq!(session.count(&GuestOp::PowerOff), 1);
    assert!(session.copied_in().contains(&guest("tests.zip")));
}

// -------------------------------------------------------------------------
// host-side helpers
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_stalled_power_on_spawns_dialog_responder() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Large, Duration::from_secs(5));
    let out = dir.path().join("responder.out");
    let tester = TesterSpec {
        power_on_grace: Duration::from_millis(100),
        power_on_responder: Some(format!("echo \"$VMCHECKER_VMX\" > {}", out.display())),
        ..TesterSpec::default()
    };
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        power_on_delay: Duration::from_millis(800),
        ..SessionScript::default()
    }));

    let report = TestOrchestrator::new(hypervisor.clone(), &tester)
        .run(&job)
        .await;

    // power-on is awaited past the grace window rather than abandoned
    assert!(report.success());
    assert!(report.reached(RunState::PoweredOn));
    let seen = std::fs::read_to_string(&out).unwrap();
    assert_eq!(seen.trim(), dir.path().join("guest.vmx").display().to_string());
}

#[tokio::test]
async fn test_quick_power_on_never_spawns_responder() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Large, Duration::from_secs(5));
    let out = dir.path().join("responder.out");
    let tester = TesterSpec {
        power_on_grace: Duration::from_secs(2),
        power_on_responder: Some(format!("touch {}", out.display())),
        ..TesterSpec::default()
    };
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));

    let report = TestOrchestrator::new(hypervisor.clone(), &tester)
        .run(&job)
        .await;

    assert!(report.success());
    assert!(!out.exists());
}

fn aux_job(dir: &Path) -> (TestJob, PathBuf) {
    let mut job = job(dir, StorageMode::Normal, Duration::from_secs(5));
    let pidfile = dir.join("aux.pid");
    job.assignment.host_command = Some(format!(
        "echo aux-started; echo $$ > {}; exec sleep 30",
        pidfile.display()
    ));
    (job, pidfile)
}

fn aux_pid(pidfile: &Path) -> Pid {
    let text = std::fs::read_to_string(pidfile).unwrap();
    Pid::from_raw(text.trim().parse().unwrap())
}

#[tokio::test]
async fn test_host_aux_stopped_before_power_off() {
    let dir = tempfile::tempdir().unwrap();
    let (job, pidfile) = aux_job(dir.path());
    let script = SessionScript {
        pidfile_at_power_off: Some(pidfile.clone()),
        ..SessionScript::default()
    }
    .with_script("build.sh", ScriptBehavior::Hang(Duration::from_millis(500)));
    let hypervisor = Arc::new(RecordingHypervisor::new(script));

    let report = orchestrator(&hypervisor).run(&job).await;

    assert!(report.success());
    let log = std::fs::read_to_string(dir.path().join(AUX_LOG)).unwrap();
    assert!(log.contains("aux-started"));
    let session = hypervisor.session().unwrap();
    assert_eq!(session.pid_alive_at_power_off(), Some(false));
    assert!(kill(aux_pid(&pidfile), None).is_err());
}

#[test]
fn test_host_aux_stopped_when_a_phase_panics() {
    let dir = tempfile::tempdir().unwrap();
    let (job, pidfile) = aux_job(dir.path());
    let script = SessionScript {
        panic_on_copy_in: Some(RUN_SCRIPT.to_string()),
        pidfile_at_power_off: Some(pidfile.clone()),
        ..SessionScript::default()
    }
    .with_script("build.sh", ScriptBehavior::Hang(Duration::from_millis(500)));
    let hypervisor = Arc::new(RecordingHypervisor::new(script));
    let orchestrator = orchestrator(&hypervisor);

    let outcome = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(orchestrator.run(&job))
    })
    .join();

    assert!(outcome.is_err());
    let session = hypervisor.session().unwrap();
    assert_eq!(session.count(&GuestOp::PowerOff), 1);
    assert_eq!(session.pid_alive_at_power_off(), Some(false));
    assert!(kill(aux_pid(&pidfile), None).is_err());
}

#[tokio::test]
async fn test_report_serialises_to_json() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), StorageMode::Large, Duration::from_secs(5));
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));

    let report = orchestrator(&hypervisor).run(&job).await;
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["outcome"], "success");
    assert_eq!(json["mode"], "large");
    assert_eq!(json["assignment"], "so-tema1");
    assert_eq!(json["states"].as_array().unwrap().last().unwrap(), "torn_down");
    assert_eq!(json["phases"][0]["phase"], "run");
    assert!(report.finished_at.is_some());
}
