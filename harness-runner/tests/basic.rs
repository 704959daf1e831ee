// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests driving the runner and session against stub engine
//! binaries (shell scripts).

#![cfg(unix)]

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use harness_runner::{
    build_cache::ScriptBuild,
    reporter::TestEvent,
    runner::{
        ExecutorStrategy, Outcome, TestMode, TestPhase, TestRecipe, TestRunnerBuilder, TestThreads,
    },
    session::{JobPlan, SessionBuilder, TestSource},
    signal::SignalHandlerKind,
    test_list::TestList,
};
use harness_runner::job::JobDescriptor;
use std::{fs, os::unix::fs::PermissionsExt};

/// Stub engine: validates the `--loader` argument against the script's
/// extension, then exits 1 for sources marked `@fail`, 7 for `@crash`, and
/// 0 otherwise.
const ENGINE_SCRIPT: &str = r#"#!/bin/sh
loader=""
path=""
while [ $# -gt 0 ]; do
  case "$1" in
    test) shift ;;
    --pmap) shift 2 ;;
    --loader) loader="$2"; shift 2 ;;
    *) path="$1"; shift ;;
  esac
done
case "$path" in
  *.mjs) want="module" ;;
  *.snapshot) want="snapshot" ;;
  *) want="sloppy" ;;
esac
if [ "$loader" != "$want" ]; then
  echo "wrong loader for $path: $loader"
  exit 3
fi
if grep -q "@fail" "$path"; then
  echo "expected failure: $path"
  exit 1
fi
if grep -q "@crash" "$path"; then
  exit 7
fi
echo "ok: $path"
exit 0
"#;

/// Stub snapshot generator: fails for sources marked `@genfail`, otherwise
/// copies the source to the artifact path.
const SNAPSHOT_SCRIPT: &str = r#"#!/bin/sh
out=""
src=""
while [ $# -gt 0 ]; do
  case "$1" in
    generate) shift ;;
    -o) out="$2"; shift 2 ;;
    *) src="$1"; shift ;;
  esac
done
if grep -q "@genfail" "$src"; then
  echo "generation refused: $src"
  exit 1
fi
cp "$src" "$out"
exit 0
"#;

/// Stub build script: "installs" the stub engine binaries under the
/// requested prefix.
const BUILD_SCRIPT: &str = r#"#!/bin/sh
install=""
for arg in "$@"; do
  case "$arg" in
    --install=*) install="${arg#--install=}" ;;
  esac
done
mkdir -p "$install/bin"
cp "$(dirname "$0")/jjs" "$install/bin/jjs"
cp "$(dirname "$0")/jjs-snapshot" "$install/bin/jjs-snapshot"
exit 0
"#;

fn write_executable(path: &Utf8Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
    fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(0o755)).unwrap();
}

fn write_test(path: &Utf8Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Installs the stub engine into `dir` and returns the engine path.
fn install_engine(dir: &Utf8Path) -> Utf8PathBuf {
    let engine = dir.join("bin/jjs");
    write_executable(&engine, ENGINE_SCRIPT);
    write_executable(&dir.join("bin/jjs-snapshot"), SNAPSHOT_SCRIPT);
    engine
}

fn recipe(engine: &Utf8Path, mode: TestMode, artifact_dir: &Utf8Path) -> TestRecipe {
    TestRecipe {
        runtime: None,
        engine: engine.to_owned(),
        pmap: None,
        mode,
        artifact_dir: artifact_dir.to_owned(),
    }
}

/// Runs the list and collects per-test (path, outcome, phase) triples.
fn run_collecting(
    test_list: &TestList,
    recipe: TestRecipe,
    strategy: ExecutorStrategy,
) -> (
    harness_runner::runner::RunStats,
    Vec<(Utf8PathBuf, Outcome, TestPhase)>,
) {
    let mut builder = TestRunnerBuilder::default();
    builder.set_strategy(strategy);
    let runner = builder
        .build(test_list, recipe, "stub run".to_owned(), SignalHandlerKind::Noop)
        .unwrap();

    let mut finished = Vec::new();
    let stats = runner.execute(|event| {
        if let TestEvent::TestFinished { test, status, .. } = event {
            finished.push((test.path.clone(), status.outcome(), status.phase));
        }
    });
    (stats, finished)
}

#[test]
fn direct_tests_classify_and_run_in_parallel() {
    let dir = Utf8TempDir::new().unwrap();
    let engine = install_engine(dir.path());

    let tests = dir.path().join("tests");
    write_test(&tests.join("pass.js"), "// ok\n");
    write_test(&tests.join("module.mjs"), "// ok\n");
    write_test(&tests.join("fail/expected.js"), "// @fail\n");
    write_test(&tests.join("fail/surprise.js"), "// passes anyway\n");
    write_test(&tests.join("crash.js"), "// @crash\n");

    let test_list = TestList::discover(Some(&tests), None, &[]).unwrap();
    assert_eq!(test_list.run_count(), 5);

    let (stats, finished) = run_collecting(
        &test_list,
        recipe(&engine, TestMode::Direct, dir.path()),
        ExecutorStrategy::Pooled(TestThreads::Count(4)),
    );

    assert_eq!(stats.finished_count, 5);
    assert_eq!(stats.passed, 3, "pass.js, module.mjs, fail/expected.js");
    assert_eq!(stats.passed_xfail, 1);
    assert_eq!(stats.failed, 2, "crash.js and fail/surprise.js");
    assert_eq!(stats.failed_xpass, 1);
    assert!(!stats.is_success());

    let outcome_of = |name: &str| {
        finished
            .iter()
            .find(|(path, _, _)| path.as_str().ends_with(name))
            .map(|(_, outcome, _)| *outcome)
            .unwrap()
    };
    assert_eq!(outcome_of("pass.js"), Outcome::Pass);
    assert_eq!(outcome_of("module.mjs"), Outcome::Pass, "module loader used");
    assert_eq!(outcome_of("fail/expected.js"), Outcome::PassXfail);
    assert_eq!(outcome_of("fail/surprise.js"), Outcome::FailXpass);
    assert_eq!(outcome_of("crash.js"), Outcome::Fail);
}

#[test]
fn serial_strategy_reports_in_discovery_order() {
    let dir = Utf8TempDir::new().unwrap();
    let engine = install_engine(dir.path());

    let tests = dir.path().join("tests");
    write_test(&tests.join("a.js"), "// ok\n");
    write_test(&tests.join("b.js"), "// ok\n");
    write_test(&tests.join("c.js"), "// ok\n");

    let test_list = TestList::discover(Some(&tests), None, &[]).unwrap();
    let (stats, finished) = run_collecting(
        &test_list,
        recipe(&engine, TestMode::Direct, dir.path()),
        ExecutorStrategy::Serial,
    );

    assert!(stats.is_success());
    let names: Vec<_> = finished
        .iter()
        .map(|(path, _, _)| path.file_name().unwrap().to_owned())
        .collect();
    assert_eq!(names, vec!["a.js", "b.js", "c.js"]);
}

#[test]
fn snapshot_protocol_generates_executes_and_cleans_up() {
    let dir = Utf8TempDir::new().unwrap();
    let engine = install_engine(dir.path());
    let artifact_dir = dir.path().join("artifacts");
    fs::create_dir_all(&artifact_dir).unwrap();

    let tests = dir.path().join("tests");
    write_test(&tests.join("pass.js"), "// ok\n");
    write_test(&tests.join("genfail.js"), "// @genfail\n");
    write_test(&tests.join("fail/expected.js"), "// @fail\n");
    write_test(&tests.join("fail/surprise.js"), "// passes anyway\n");

    let test_list = TestList::discover(Some(&tests), None, &[]).unwrap();
    let (stats, finished) = run_collecting(
        &test_list,
        recipe(&engine, TestMode::Snapshot, &artifact_dir),
        ExecutorStrategy::Pooled(TestThreads::Count(2)),
    );

    assert_eq!(stats.finished_count, 4);
    assert_eq!(stats.passed, 2);
    assert_eq!(stats.failed, 2);

    let entry_of = |name: &str| {
        finished
            .iter()
            .find(|(path, _, _)| path.as_str().ends_with(name))
            .map(|(_, outcome, phase)| (*outcome, *phase))
            .unwrap()
    };
    // The artifact round-trips through generation and execution.
    assert_eq!(entry_of("pass.js"), (Outcome::Pass, TestPhase::Execute));
    // Generation failure short-circuits the execute phase and classifies
    // against the generation exit code.
    assert_eq!(entry_of("genfail.js"), (Outcome::Fail, TestPhase::Generate));
    // The @fail marker survives into the artifact, so the execute phase
    // exits 1 -- the expected failure.
    assert_eq!(
        entry_of("fail/expected.js"),
        (Outcome::PassXfail, TestPhase::Execute)
    );
    assert_eq!(
        entry_of("fail/surprise.js"),
        (Outcome::FailXpass, TestPhase::Execute)
    );

    // No transient artifacts survive the run.
    let leftovers: Vec<_> = fs::read_dir(&artifact_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "leftover artifacts: {leftovers:?}");
}

#[test]
fn session_runs_a_job_end_to_end() {
    let dir = Utf8TempDir::new().unwrap();

    // Tool layout mirrors a source tree: the build script installs the
    // engine stubs.
    let tools = dir.path().join("tools");
    write_executable(&tools.join("jjs"), ENGINE_SCRIPT);
    write_executable(&tools.join("jjs-snapshot"), SNAPSHOT_SCRIPT);
    let build_script = tools.join("build.py");
    write_executable(&build_script, BUILD_SCRIPT);

    let tests = dir.path().join("tests/jjs");
    write_test(&tests.join("pass.js"), "// ok\n");
    write_test(&tests.join("fail/expected.js"), "// @fail\n");

    let mut builder = SessionBuilder::default();
    builder
        .set_outdir(dir.path().join("build/tests"))
        .set_strategy(ExecutorStrategy::Serial)
        .set_signal_handler_kind(SignalHandlerKind::Noop);
    let mut session = builder.build(ScriptBuild::new(build_script));

    let plans = vec![JobPlan {
        job: JobDescriptor::new("jjs_tests", ["--function-to-string=on"]),
        source: Some(TestSource {
            test_dir: Some(tests.clone()),
            test_list: None,
            skip_patterns: vec![],
        }),
    }];

    let mut out = Vec::new();
    let mut reporter = harness_runner::reporter::TestReporterBuilder::default().build();
    let summary = session
        .execute(&plans, |event| reporter.report_event(event, &mut out))
        .unwrap();

    assert!(summary.is_success(), "summary: {summary:?}");
    let rendered = String::from_utf8(out).unwrap();
    assert!(rendered.contains("PASS: "), "got: {rendered}");
    assert!(rendered.contains("PASS (XFAIL): "), "got: {rendered}");
    assert!(
        rendered.contains("2 tests run: 2 passed (1 xfail), 0 failed"),
        "got: {rendered}"
    );
}
