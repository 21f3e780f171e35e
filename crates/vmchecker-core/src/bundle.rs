//! Bundle directory layout and the artifacts the executor writes into it.

use crate::config::DescriptorSource;
use crate::error::{ExecutorError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const ARCHIVE: &str = "archive.zip";
pub const TESTS: &str = "tests.zip";
pub const SUBMISSION_CONFIG: &str = "submission-config";
pub const COURSE_CONFIG: &str = "course-config";
pub const BUILD_SCRIPT: &str = "build.sh";
pub const RUN_SCRIPT: &str = "run.sh";
/// Human-readable failure notes appended by the executor.
pub const STDERR_ARTIFACT: &str = "vmchecker-stderr.vmr";
/// Output of the host auxiliary process, append mode.
pub const AUX_LOG: &str = "run-km.vmr";

/// Files that must exist before a run may start.
pub const REQUIRED_FILES: [&str; 4] = [ARCHIVE, TESTS, SUBMISSION_CONFIG, COURSE_CONFIG];

/// Extension of a virtual machine descriptor.
pub const DESCRIPTOR_EXTENSION: &str = "vmx";

/// One submission's on-disk bundle. Annotated in place, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    dir: PathBuf,
}

impl Bundle {
    /// Wrap a directory without validating it.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Wrap a directory and check that every required file is present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let bundle = Self::new(dir);
        let missing = bundle.missing_files();
        if !missing.is_empty() {
            return Err(ExecutorError::MissingBundleFiles {
                bundle: bundle.dir.clone(),
                missing,
            });
        }
        Ok(bundle)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn missing_files(&self) -> Vec<String> {
        REQUIRED_FILES
            .iter()
            .filter(|name| !self.path(name).is_file())
            .map(|name| name.to_string())
            .collect()
    }

    /// Append a line to the stderr artifact. Failures are logged only.
    pub fn append_note(&self, note: &str) {
        let path = self.path(STDERR_ARTIFACT);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{}", note));
        match result {
            Ok(()) => debug!(note = %note, "stderr artifact annotated"),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                note = %note,
                "cannot append to stderr artifact"
            ),
        }
    }

    /// First `*.vmx` file under the bundle, in file-name order.
    pub fn find_descriptor(&self) -> Option<PathBuf> {
        WalkDir::new(&self.dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .find(|path| {
                path.extension()
                    .map(|ext| ext.eq_ignore_ascii_case(DESCRIPTOR_EXTENSION))
                    .unwrap_or(false)
            })
    }

    /// Pinned descriptor if configured, otherwise one found in the bundle.
    pub fn resolve_descriptor(&self, source: &DescriptorSource) -> Result<PathBuf> {
        match source {
            DescriptorSource::Pinned(path) => Ok(path.clone()),
            DescriptorSource::FromBundle => self
                .find_descriptor()
                .ok_or_else(|| ExecutorError::DescriptorUnresolved(self.dir.clone())),
        }
    }
}
