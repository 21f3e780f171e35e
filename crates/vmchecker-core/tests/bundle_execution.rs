//! Whole-bundle execution: configuration files on disk through to the
//! recording control plane.

use std::path::Path;
use std::sync::Arc;

use vmchecker_core::bundle::{ARCHIVE, COURSE_CONFIG, STDERR_ARTIFACT, SUBMISSION_CONFIG, TESTS};
use vmchecker_core::fakes::{GuestOp, RecordingHypervisor, SessionScript};
use vmchecker_core::{run_bundle, ExecutorError, Hypervisor, StorageMode, TesterSpec};

const COURSE: &str = r#"
[Tester]
VMwareType = ws
PowerOnGraceSeconds = 1

[assignment so-tema1]
Machine = so-linux
Timeout = 5
ToolsTimeout = 2
RevertToSnapshot = yes

[assignment so-large]
Machine = so-linux-bundled
Timeout = 5
RevertToSnapshot = no
StorageType = large
StorageHost = storage.example.org
StorageUsername = vmchecker
StorageBasepath = /srv/large
Unpack = yes

[machine so-linux]
VMPath = /vm/so-linux/so-linux.vmx
GuestUser = student
GuestPassword = student
GuestShellPath = /bin/bash
GuestBasePath = /home/student/
GuestHomeInShell = /home/student

[machine so-linux-bundled]
GuestUser = student
GuestPassword = student
GuestBasePath = /home/student/
"#;

fn write_bundle(dir: &Path, assignment: &str) {
    std::fs::write(dir.join(ARCHIVE), b"zip").unwrap();
    std::fs::write(dir.join(TESTS), b"zip").unwrap();
    std::fs::write(dir.join("build.sh"), b"#!/bin/sh\nmake\n").unwrap();
    std::fs::write(dir.join("run.sh"), b"#!/bin/sh\n./run-tests\n").unwrap();
    std::fs::write(
        dir.join(SUBMISSION_CONFIG),
        format!("[Assignment]\nAssignment = {assignment}\nUser = alice\n"),
    )
    .unwrap();
    std::fs::write(dir.join(COURSE_CONFIG), COURSE).unwrap();
}

#[tokio::test]
async fn test_normal_bundle_runs_against_pinned_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(dir.path(), "so-tema1");
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));
    let handle = hypervisor.clone();

    let report = run_bundle(dir.path(), move |tester: &TesterSpec| -> Arc<dyn Hypervisor> {
        assert_eq!(tester.vmware_type, "ws");
        hypervisor
    })
    .await
    .unwrap();

    assert!(report.success());
    assert_eq!(report.mode, StorageMode::Normal);
    assert_eq!(report.phases.len(), 2);
    assert_eq!(handle.connect_count(), 1);

    let session = handle.session().unwrap();
    assert_eq!(session.ops()[0], GuestOp::Revert(0));
    assert!(report.descriptor.ends_with("so-linux.vmx"));
    assert!(!dir.path().join(STDERR_ARTIFACT).exists());
}

#[tokio::test]
async fn test_large_bundle_uses_bundled_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(dir.path(), "so-large");
    std::fs::create_dir_all(dir.path().join("vm")).unwrap();
    std::fs::write(dir.path().join("vm/guest.vmx"), b"").unwrap();
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));
    let handle = hypervisor.clone();

    let report = run_bundle(dir.path(), move |_| -> Arc<dyn Hypervisor> { hypervisor })
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(report.mode, StorageMode::Large);
    assert_eq!(report.descriptor, dir.path().join("vm/guest.vmx"));

    let session = handle.session().unwrap();
    assert!(!session
        .copied_in()
        .iter()
        .any(|path| path.ends_with(ARCHIVE)));
    assert_eq!(session.count(&GuestOp::Revert(0)), 0);
}

#[tokio::test]
async fn test_missing_bundle_files_never_connect() {
    for missing in [ARCHIVE, TESTS, SUBMISSION_CONFIG, COURSE_CONFIG] {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "so-tema1");
        std::fs::remove_file(dir.path().join(missing)).unwrap();
        let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));
        let handle = hypervisor.clone();

        let result = run_bundle(dir.path(), move |_| -> Arc<dyn Hypervisor> { hypervisor }).await;

        match result {
            Err(ExecutorError::MissingBundleFiles { missing: files, .. }) => {
                assert_eq!(files, vec![missing.to_string()]);
            }
            other => panic!("expected MissingBundleFiles, got {:?}", other.map(|r| r.outcome)),
        }
        assert_eq!(handle.connect_count(), 0);
        let note = std::fs::read_to_string(dir.path().join(STDERR_ARTIFACT)).unwrap();
        assert!(note.contains(missing));
    }
}

#[tokio::test]
async fn test_unresolved_descriptor_never_connects() {
    let dir = tempfile::tempdir().unwrap();
    // the bundled machine has no VMPath and the bundle carries no descriptor
    write_bundle(dir.path(), "so-large");
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript::default()));
    let handle = hypervisor.clone();

    let result = run_bundle(dir.path(), move |_| -> Arc<dyn Hypervisor> { hypervisor }).await;

    assert!(matches!(result, Err(ExecutorError::DescriptorUnresolved(_))));
    assert_eq!(handle.connect_count(), 0);
    assert!(dir.path().join(STDERR_ARTIFACT).is_file());
}

#[tokio::test]
async fn test_login_failure_reported_as_failed_run() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(dir.path(), "so-tema1");
    let hypervisor = Arc::new(RecordingHypervisor::new(SessionScript {
        login_ok: false,
        ..SessionScript::default()
    }));
    let handle = hypervisor.clone();

    let report = run_bundle(dir.path(), move |_| -> Arc<dyn Hypervisor> { hypervisor })
        .await
        .unwrap();

    assert!(!report.success());
    assert_eq!(handle.session().unwrap().count(&GuestOp::PowerOff), 1);
}
