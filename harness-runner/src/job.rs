// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Job descriptors: one named build-option profile plus test-selection
//! arguments.

use camino::Utf8PathBuf;

/// A single entry in the test matrix.
///
/// A job names a build-option profile and the arguments passed to the test
/// phase for binaries built with that profile. Jobs are immutable: they are
/// created from the static matrix configuration and never change during a
/// run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobDescriptor {
    name: String,
    build_args: Vec<String>,
    test_args: Vec<String>,
    skip_reason: Option<String>,
}

impl JobDescriptor {
    /// Creates a new job with the given name and build arguments.
    pub fn new(name: impl Into<String>, build_args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            build_args: build_args.into_iter().map(|arg| arg.into()).collect(),
            test_args: Vec::new(),
            skip_reason: None,
        }
    }

    /// Adds test-phase arguments to this job.
    pub fn with_test_args(mut self, test_args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.test_args = test_args.into_iter().map(|arg| arg.into()).collect();
        self
    }

    /// Marks this job as skipped for the given reason. A `None` reason
    /// leaves the job runnable (mirrors conditional skips in the matrix).
    pub fn with_skip_reason(mut self, reason: Option<impl Into<String>>) -> Self {
        self.skip_reason = reason.map(|reason| reason.into());
        self
    }

    /// The job's name, used for its build directory and in reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build arguments in their configured (display) order. Order is not
    /// significant for build-cache identity.
    pub fn build_args(&self) -> &[String] {
        &self.build_args
    }

    /// Test-phase arguments.
    pub fn test_args(&self) -> &[String] {
        &self.test_args
    }

    /// The reason this job is skipped, if any.
    pub fn skip_reason(&self) -> Option<&str> {
        self.skip_reason.as_deref()
    }

    /// True if this job runs its suite through the two-phase snapshot
    /// protocol.
    pub fn is_snapshot(&self) -> bool {
        self.test_args.iter().any(|arg| arg == "--snapshot")
    }

    /// The build directory for this job under `outdir`, with a `-debug`
    /// suffix for debug builds.
    pub fn build_dir(&self, outdir: &camino::Utf8Path, debug: bool) -> Utf8PathBuf {
        if debug {
            outdir.join(format!("{}-debug", self.name))
        } else {
            outdir.join(&self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn build_dir_debug_suffix() {
        let job = JobDescriptor::new("jjs_tests", ["--lto=off"]);
        let outdir = Utf8Path::new("build/tests");
        assert_eq!(job.build_dir(outdir, false), "build/tests/jjs_tests");
        assert_eq!(job.build_dir(outdir, true), "build/tests/jjs_tests-debug");
    }

    #[test]
    fn snapshot_detection() {
        let direct = JobDescriptor::new("jjs_tests", ["--lto=off"]);
        let snapshot = JobDescriptor::new("jjs_tests-snapshot", ["--snapshot-save=on"])
            .with_test_args(["--snapshot"]);
        assert!(!direct.is_snapshot());
        assert!(snapshot.is_snapshot());
    }
}
