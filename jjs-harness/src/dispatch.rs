// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::ExpectedError,
    matrix,
    output::{OutputContext, OutputOpts},
};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use harness_runner::{
    build_cache::ScriptBuild,
    errors::WriteEventError,
    job::JobDescriptor,
    reporter::TestReporterBuilder,
    runner::{ExecutorStrategy, TestThreads},
    session::{JobPlan, SessionBuilder, TestSource},
};
use std::io::{BufWriter, Write};

/// Build-matrix test orchestrator for the JJS engine.
#[derive(Debug, Parser)]
#[command(name = "jjs-harness", version)]
pub struct JjsHarnessApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl JjsHarnessApp {
    /// Initializes logging and color handling.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app.
    pub fn exec(self) -> Result<(), ExpectedError> {
        let output = self.output.init();

        match self.command {
            Command::List { selection } => exec_list(&selection),
            Command::Run {
                selection,
                build_opts,
                runner_opts,
            } => exec_run(&selection, build_opts, runner_opts, output),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the jobs in the test matrix
    List {
        #[command(flatten)]
        selection: SuiteSelection,
    },
    /// Build engines and run the selected suites
    ///
    /// Each job builds the engine with its build-option profile (reusing
    /// equivalent builds), then runs its suite against the binary. The
    /// process exits non-zero if any build or any test failed.
    Run {
        #[command(flatten)]
        selection: SuiteSelection,

        #[command(flatten)]
        build_opts: BuildOpts,

        #[command(flatten)]
        runner_opts: RunnerOpts,
    },
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Suite selection")]
struct SuiteSelection {
    /// Run jjs-tests
    #[arg(long)]
    jjs_tests: bool,

    /// Run jjs-snapshot-tests
    #[arg(long)]
    jjs_snapshot_tests: bool,

    /// Run jjs-pack-tests
    #[arg(long)]
    jjs_pack_tests: bool,

    /// Run buildoption-test (build-only jobs)
    #[arg(long)]
    buildoption_test: bool,

    /// Run all suites
    #[arg(long, alias = "precommit")]
    all: bool,

    /// Disable the snapshot suite (useful with --all)
    #[arg(long)]
    no_snapshot_tests: bool,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Build options")]
struct BuildOpts {
    /// Project root containing the test suites and the build script
    #[arg(long, value_name = "DIR", default_value = ".")]
    root: Utf8PathBuf,

    /// Build script to invoke [default: <root>/tools/build.py]
    #[arg(long, value_name = "FILE")]
    build_script: Option<Utf8PathBuf>,

    /// Output directory for per-job builds [default: <root>/build/tests]
    #[arg(long, value_name = "DIR")]
    outdir: Option<Utf8PathBuf>,

    /// Build debug version binaries
    #[arg(long)]
    build_debug: bool,

    /// Comma separated list of extra build options for every job
    #[arg(long, value_name = "LIST")]
    buildoptions: Option<String>,

    /// Toolchain file forwarded to the build script
    #[arg(long, value_name = "FILE")]
    toolchain: Option<Utf8PathBuf>,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Runner options")]
struct RunnerOpts {
    /// Only print out failing tests
    #[arg(long, short = 'q')]
    quiet: bool,

    /// Number of tests to run simultaneously [default: logical CPU count]
    #[arg(long, short = 'j', value_name = "THREADS")]
    test_threads: Option<TestThreads>,

    /// Run tests one at a time
    #[arg(long, conflicts_with = "test_threads")]
    serial: bool,

    /// File with one extra test path per line, resolved against its own
    /// directory and appended to each suite's discovered tests
    #[arg(long, value_name = "FILE")]
    test_list: Option<Utf8PathBuf>,

    /// Comma separated list of patterns of excluded JS tests
    #[arg(long, value_name = "LIST")]
    skip_list: Option<String>,

    /// File with one extra skip pattern per line for the snapshot suite
    #[arg(long, value_name = "FILE")]
    snapshot_skip_list: Option<Utf8PathBuf>,

    /// JJS engine pmap file [default: <root>/tests/jjs/pmap.json if present]
    #[arg(long, value_name = "FILE")]
    pmap: Option<Utf8PathBuf>,

    /// Execution runtime (e.g. qemu) wrapped around engine invocations
    #[arg(long, value_name = "FILE", env = "RUNTIME")]
    runtime: Option<Utf8PathBuf>,
}

/// Which suite a matrix job belongs to; decides its test source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SuiteKind {
    JjsTests,
    Snapshot,
    Pack,
    BuildOnly,
}

fn suite_jobs(selection: &SuiteSelection) -> Result<Vec<(SuiteKind, JobDescriptor)>, ExpectedError> {
    let all = selection.all;
    let mut jobs = Vec::new();

    if selection.jjs_tests || all {
        jobs.extend(
            matrix::jjs_tests_jobs()
                .into_iter()
                .map(|job| (SuiteKind::JjsTests, job)),
        );
    }
    if (selection.jjs_snapshot_tests || all) && !selection.no_snapshot_tests {
        jobs.extend(
            matrix::jjs_snapshot_tests_jobs()
                .into_iter()
                .map(|job| (SuiteKind::Snapshot, job)),
        );
    }
    if selection.jjs_pack_tests || all {
        jobs.extend(
            matrix::jjs_pack_tests_jobs()
                .into_iter()
                .map(|job| (SuiteKind::Pack, job)),
        );
    }
    if selection.buildoption_test || all {
        jobs.extend(
            matrix::buildoption_jobs()
                .into_iter()
                .map(|job| (SuiteKind::BuildOnly, job)),
        );
    }

    if jobs.is_empty() {
        return Err(ExpectedError::NoSuitesSelected);
    }
    Ok(jobs)
}

fn exec_list(selection: &SuiteSelection) -> Result<(), ExpectedError> {
    let jobs = suite_jobs(selection)?;

    let stdout = std::io::stdout();
    let lock = stdout.lock();
    // Buffer the output to minimize syscalls.
    let mut writer = BufWriter::new(lock);

    let result = (|| -> std::io::Result<()> {
        for (kind, job) in &jobs {
            write!(writer, "{}", job.name())?;
            if *kind == SuiteKind::BuildOnly {
                write!(writer, " (build only)")?;
            }
            if let Some(reason) = job.skip_reason() {
                write!(writer, " (skipped: {reason})")?;
            }
            write!(writer, ": {}", job.build_args().join(" "))?;
            if !job.test_args().is_empty() {
                write!(writer, " [{}]", job.test_args().join(" "))?;
            }
            writeln!(writer)?;
        }
        writer.flush()
    })();

    result.map_err(|error| ExpectedError::OutputWrite { error })
}

fn exec_run(
    selection: &SuiteSelection,
    build_opts: BuildOpts,
    runner_opts: RunnerOpts,
    output: OutputContext,
) -> Result<(), ExpectedError> {
    let jobs = suite_jobs(selection)?;
    let root = &build_opts.root;

    let skip_patterns = split_list(runner_opts.skip_list.as_deref());
    let snapshot_skip_patterns = match &runner_opts.snapshot_skip_list {
        Some(path) => {
            let contents =
                std::fs::read_to_string(path).map_err(|error| ExpectedError::SnapshotSkipListRead {
                    path: path.clone(),
                    error,
                })?;
            contents
                .lines()
                .map(|line| line.trim().to_owned())
                .filter(|line| !line.is_empty())
                .collect()
        }
        None => Vec::new(),
    };

    let plans: Vec<JobPlan> = jobs
        .into_iter()
        .map(|(kind, job)| {
            let source = match kind {
                SuiteKind::BuildOnly => None,
                SuiteKind::JjsTests => Some(TestSource {
                    test_dir: Some(root.join(matrix::JJS_TESTS_DIR)),
                    test_list: runner_opts.test_list.clone(),
                    skip_patterns: skip_patterns.clone(),
                }),
                SuiteKind::Snapshot => Some(TestSource {
                    test_dir: Some(root.join(matrix::JJS_TESTS_DIR)),
                    test_list: runner_opts.test_list.clone(),
                    skip_patterns: skip_patterns
                        .iter()
                        .chain(snapshot_skip_patterns.iter())
                        .cloned()
                        .collect(),
                }),
                SuiteKind::Pack => Some(TestSource {
                    test_dir: Some(root.join(matrix::JJS_PACK_TESTS_DIR)),
                    test_list: runner_opts.test_list.clone(),
                    skip_patterns: skip_patterns.clone(),
                }),
            };
            JobPlan { job, source }
        })
        .collect();

    let strategy = if runner_opts.serial {
        ExecutorStrategy::Serial
    } else {
        ExecutorStrategy::Pooled(runner_opts.test_threads.unwrap_or(TestThreads::NumCpus))
    };

    let pmap = runner_opts.pmap.clone().or_else(|| {
        let default = root.join(matrix::JJS_TESTS_PMAP_FILE);
        default.is_file().then_some(default)
    });

    let build_script = build_opts
        .build_script
        .unwrap_or_else(|| root.join("tools/build.py"));
    let outdir = build_opts
        .outdir
        .unwrap_or_else(|| root.join("build/tests"));

    let mut builder = SessionBuilder::default();
    builder
        .set_outdir(outdir)
        .set_build_debug(build_opts.build_debug)
        .set_extra_build_options(split_list(build_opts.buildoptions.as_deref()))
        .set_toolchain(build_opts.toolchain)
        .set_pmap(pmap)
        .set_runtime(runner_opts.runtime)
        .set_strategy(strategy);
    let mut session = builder.build(ScriptBuild::new(build_script));

    let mut reporter_builder = TestReporterBuilder::default();
    reporter_builder.set_quiet(runner_opts.quiet);
    let mut reporter = reporter_builder.build();
    if output.color.should_colorize(supports_color::Stream::Stderr) {
        reporter.colorize();
    }

    let stderr = std::io::stderr();
    let mut writer = BufWriter::new(stderr);
    let summary = session.execute(&plans, |event| {
        // Write and flush each event so progress is visible as it happens.
        reporter.report_event(event, &mut writer)?;
        writer.flush().map_err(WriteEventError::Io)
    })?;
    writer
        .flush()
        .map_err(|error| ExpectedError::OutputWrite { error })?;

    if summary.is_success() {
        Ok(())
    } else {
        Err(ExpectedError::TestRunFailed {
            failed_jobs: summary
                .failed_jobs()
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
        })
    }
}

fn split_list(list: Option<&str>) -> Vec<String> {
    list.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect()
    })
    .unwrap_or_default()
}
