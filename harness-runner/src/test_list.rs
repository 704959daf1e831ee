// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test discovery.
//!
//! Walks a test directory (and/or reads a test-list file) to produce the
//! ordered, filtered set of tests for one job. Discovery is deterministic:
//! the same directory and skip list always yield the same ordered sequence.

use crate::errors::DiscoveryError;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Directory names whose contents are support code, not tests.
const EXCLUDED_CONTAINERS: &[&str] = &["lib", "exclude"];

/// Path suffix of the shared fixtures directory.
const FIXTURES_DIR: &str = "tests/jjs/fixtures";

/// How a test script is loaded by the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestKind {
    /// A classic script (`.js`), run with the sloppy loader.
    Classic,
    /// A module (`.mjs`), run with the module loader.
    Module,
}

impl TestKind {
    /// The `--loader` value for this kind.
    pub fn loader(self) -> &'static str {
        match self {
            TestKind::Classic => "sloppy",
            TestKind::Module => "module",
        }
    }

    fn from_path(path: &Utf8Path) -> Option<Self> {
        match path.extension() {
            Some("js") => Some(TestKind::Classic),
            Some("mjs") => Some(TestKind::Module),
            _ => None,
        }
    }
}

/// A single discovered test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestRecord {
    /// Normalized path of the test script.
    pub path: Utf8PathBuf,
    /// How the script is loaded.
    pub kind: TestKind,
    /// Whether this test is expected to exit with code 1.
    pub expected_fail: bool,
}

impl TestRecord {
    fn new(path: Utf8PathBuf) -> Option<Self> {
        let kind = TestKind::from_path(&path)?;
        let expected_fail = is_expected_to_fail(&path);
        Some(Self {
            path,
            kind,
            expected_fail,
        })
    }
}

/// Policy: a test is expected to fail if any of its path segments is
/// literally `fail`. For such tests, exit code 1 is the pass condition.
pub fn is_expected_to_fail(path: &Utf8Path) -> bool {
    path.components().any(|c| c.as_str() == "fail")
}

/// Policy: tests under `lib` or `exclude` directories, or anywhere under
/// the shared fixtures directory, are support files and are not run.
pub fn is_excluded_container(path: &Utf8Path) -> bool {
    let Some(container) = path.parent() else {
        return false;
    };
    if matches!(container.file_name(), Some(name) if EXCLUDED_CONTAINERS.contains(&name)) {
        return true;
    }
    container
        .as_str()
        .contains(&FIXTURES_DIR.replace('/', std::path::MAIN_SEPARATOR_STR))
}

/// The ordered set of tests for one job.
#[derive(Clone, Debug, Default)]
pub struct TestList {
    tests: Vec<TestRecord>,
}

impl TestList {
    /// Discovers tests from a directory and/or a list file.
    ///
    /// Directory discovery recursively collects files with a recognized
    /// extension. List-file entries are one relative path per line,
    /// resolved against the list file's directory. The combined set is
    /// sorted lexicographically by path, then filtered: paths containing
    /// any skip pattern as a substring are dropped, followed by paths in
    /// excluded container directories.
    pub fn discover(
        test_dir: Option<&Utf8Path>,
        test_list: Option<&Utf8Path>,
        skip_patterns: &[String],
    ) -> Result<Self, DiscoveryError> {
        let mut paths = Vec::new();

        if let Some(dir) = test_dir {
            collect_scripts(dir, &mut paths)?;
        }

        if let Some(list) = test_list {
            let contents = fs::read_to_string(list).map_err(|error| DiscoveryError::ReadList {
                path: list.to_owned(),
                error,
            })?;
            let base = list.parent().unwrap_or(Utf8Path::new(""));
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                paths.push(normalize(&base.join(line)));
            }
        }

        paths.sort();
        paths.dedup();

        let tests = paths
            .into_iter()
            .filter(|path| {
                !skip_patterns
                    .iter()
                    .any(|pattern| path.as_str().contains(pattern.as_str()))
            })
            .filter(|path| !is_excluded_container(path))
            .filter_map(TestRecord::new)
            .collect();

        Ok(Self { tests })
    }

    /// Creates a test list from pre-built records. Mostly useful in tests.
    pub fn from_records(tests: Vec<TestRecord>) -> Self {
        Self { tests }
    }

    /// The number of tests that will be run.
    pub fn run_count(&self) -> usize {
        self.tests.len()
    }

    /// True if discovery produced no tests. An empty suite is a failure
    /// condition for the job: it must not be mistaken for a passing suite.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Iterates over the tests in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &TestRecord> + '_ {
        self.tests.iter()
    }
}

fn collect_scripts(dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<(), DiscoveryError> {
    let entries = fs::read_dir(dir).map_err(|error| DiscoveryError::ReadDir {
        dir: dir.to_owned(),
        error,
    })?;
    for entry in entries {
        let entry = entry.map_err(|error| DiscoveryError::ReadDir {
            dir: dir.to_owned(),
            error,
        })?;
        let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
            DiscoveryError::NonUtf8Path {
                path: path.to_string_lossy().into_owned(),
            }
        })?;
        let file_type = entry.file_type().map_err(|error| DiscoveryError::ReadDir {
            dir: dir.to_owned(),
            error,
        })?;
        if file_type.is_dir() {
            collect_scripts(&path, out)?;
        } else if TestKind::from_path(&path).is_some() {
            out.push(normalize(&path));
        }
    }
    Ok(())
}

/// Normalizes `.` and `..` components so ordering and substring filters
/// behave identically across invocation styles.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component.as_str() {
            "." => {}
            ".." => {
                if !out.pop() {
                    out.push("..");
                }
            }
            _ => out.push(component),
        }
    }
    out
}
