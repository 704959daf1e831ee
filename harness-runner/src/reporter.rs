// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints out and aggregates test execution statuses.
//!
//! The main structure in this module is [`TestReporter`]. Events are
//! produced by a [`TestRunner`](crate::runner::TestRunner) and consumed
//! here; per-test lines carry a running `tested/total` index, and failing
//! tests get their captured output printed verbatim between delimiter
//! lines.

use crate::{
    errors::WriteEventError,
    runner::{ExecuteStatus, Outcome, RunStats},
    test_list::{TestList, TestRecord},
};
use owo_colors::{OwoColorize, Style};
use std::{
    io::{self, Write},
    time::{Duration, SystemTime},
};

/// A test event.
///
/// Events are produced by a [`TestRunner`](crate::runner::TestRunner) and
/// consumed by a [`TestReporter`].
#[derive(Clone, Debug)]
pub enum TestEvent<'a> {
    /// The test run started.
    RunStarted {
        /// The list of tests that will be run.
        test_list: &'a TestList,

        /// The command identifying this run in reports.
        command: String,
    },

    /// A test started running.
    TestStarted {
        /// The test that was started.
        test: &'a TestRecord,
    },

    /// A test finished running.
    TestFinished {
        /// The test that finished.
        test: &'a TestRecord,

        /// The execution status of the test.
        status: ExecuteStatus,

        /// Current statistics for the number of tests run so far.
        current_stats: RunStats,

        /// The number of tests still running, excluding this one.
        running: usize,
    },

    /// A cancellation notice was received.
    RunBeginCancel {
        /// The number of tests still running.
        running: usize,

        /// The reason the run was canceled.
        reason: CancelReason,
    },

    /// The test run finished.
    RunFinished {
        /// The command identifying this run in reports.
        command: String,

        /// The time at which the run was started.
        start_time: SystemTime,

        /// The amount of time it took for the tests to run.
        elapsed: Duration,

        /// Statistics for the run.
        run_stats: RunStats,
    },
}

// Note: the order here matters -- it indicates severity of cancellation.
/// The reason a test run is being canceled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// An error occurred while reporting results.
    ReportError,

    /// A termination signal (on Unix, SIGTERM or SIGHUP) was received.
    Signal,

    /// An interrupt (on Unix, Ctrl-C) was received.
    Interrupt,
}

impl CancelReason {
    fn to_static_str(self) -> &'static str {
        match self {
            CancelReason::ReportError => "reporting error",
            CancelReason::Signal => "signal",
            CancelReason::Interrupt => "interrupt",
        }
    }
}

/// Delimits verbatim process output for a failing test.
const OUTPUT_DELIMITER: &str = "================================================";

/// Test reporter builder.
#[derive(Debug, Default)]
pub struct TestReporterBuilder {
    quiet: bool,
}

impl TestReporterBuilder {
    /// Sets quiet mode: only print out failing tests.
    pub fn set_quiet(&mut self, quiet: bool) -> &mut Self {
        self.quiet = quiet;
        self
    }

    /// Creates a new test reporter.
    pub fn build(&self) -> TestReporter {
        TestReporter {
            quiet: self.quiet,
            styles: Box::default(),
            total: 0,
            cancel_status: None,
        }
    }
}

/// Writes test events to an output stream.
pub struct TestReporter {
    quiet: bool,
    styles: Box<Styles>,
    total: usize,
    cancel_status: Option<CancelReason>,
}

impl TestReporter {
    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Reports a test event.
    pub fn report_event(
        &mut self,
        event: TestEvent<'_>,
        writer: impl Write,
    ) -> Result<(), WriteEventError> {
        self.write_event_impl(&event, writer)
            .map_err(WriteEventError::Io)
    }

    fn write_event_impl(
        &mut self,
        event: &TestEvent<'_>,
        mut writer: impl Write,
    ) -> io::Result<()> {
        match event {
            TestEvent::RunStarted { test_list, command } => {
                // A new run resets the reporter's per-run state.
                self.total = test_list.run_count();
                self.cancel_status = None;

                write!(writer, "{:>12} ", "Starting".style(self.styles.pass))?;
                writeln!(
                    writer,
                    "{} tests [{command}]",
                    self.total.style(self.styles.count)
                )?;
            }
            TestEvent::TestStarted { .. } => {}
            TestEvent::TestFinished {
                test,
                status,
                current_stats,
                running: _,
            } => {
                let outcome = status.outcome();
                if outcome.is_success() && self.quiet {
                    return Ok(());
                }

                write!(
                    writer,
                    "[{:>4}/{:>4}] ",
                    current_stats.finished_count, self.total
                )?;

                match outcome {
                    Outcome::Pass => {
                        write!(writer, "{}", "PASS".style(self.styles.pass))?;
                    }
                    Outcome::PassXfail => {
                        write!(writer, "{}", "PASS (XFAIL)".style(self.styles.pass))?;
                    }
                    Outcome::Fail => {
                        write!(writer, "{}", "FAIL".style(self.styles.fail))?;
                        write_exit_code(&mut writer, status)?;
                    }
                    Outcome::FailXpass => {
                        write!(writer, "{}", "FAIL (XPASS)".style(self.styles.fail))?;
                        write_exit_code(&mut writer, status)?;
                    }
                }
                writeln!(writer, ": {}", test.path)?;

                // Don't print failure output after Ctrl-C: the terminal
                // belongs to the user again.
                if !outcome.is_success() && self.cancel_status < Some(CancelReason::Signal) {
                    writeln!(writer, "{OUTPUT_DELIMITER}")?;
                    writer.write_all(&status.stdout)?;
                    writer.write_all(&status.stderr)?;
                    writeln!(writer, "{OUTPUT_DELIMITER}")?;
                }
            }
            TestEvent::RunBeginCancel { running, reason } => {
                self.cancel_status = self.cancel_status.max(Some(*reason));

                write!(writer, "{:>12} ", "Canceling".style(self.styles.fail))?;
                writeln!(
                    writer,
                    "due to {}: {} tests still running",
                    reason.to_static_str().style(self.styles.fail),
                    running.style(self.styles.count),
                )?;
            }
            TestEvent::RunFinished {
                command,
                start_time: _,
                elapsed,
                run_stats,
            } => {
                if run_stats.is_canceled() {
                    // Partial results are not summarized: report the run as
                    // incomplete instead.
                    write!(writer, "{:>12} ", "Canceled".style(self.styles.fail))?;
                    write!(writer, "[{:>8.3?}s] ", elapsed.as_secs_f64())?;
                    writeln!(
                        writer,
                        "{}/{} tests run [{command}]",
                        run_stats.finished_count.style(self.styles.count),
                        run_stats.initial_run_count.style(self.styles.count),
                    )?;
                    return Ok(());
                }

                let summary_style = if run_stats.failed > 0 {
                    self.styles.fail
                } else {
                    self.styles.pass
                };
                write!(writer, "{:>12} ", "Summary".style(summary_style))?;
                write!(writer, "[{:>8.3?}s] ", elapsed.as_secs_f64())?;

                write!(
                    writer,
                    "{} tests run: {} passed",
                    run_stats.finished_count.style(self.styles.count),
                    run_stats.passed.style(self.styles.pass),
                )?;
                if run_stats.passed_xfail > 0 {
                    write!(
                        writer,
                        " ({} {})",
                        run_stats.passed_xfail.style(self.styles.count),
                        "xfail".style(self.styles.skip),
                    )?;
                }
                write!(
                    writer,
                    ", {} failed",
                    run_stats.failed.style(if run_stats.failed > 0 {
                        self.styles.fail
                    } else {
                        self.styles.count
                    }),
                )?;
                if run_stats.failed_xpass > 0 {
                    write!(
                        writer,
                        " ({} {})",
                        run_stats.failed_xpass.style(self.styles.count),
                        "xpass".style(self.styles.fail),
                    )?;
                }
                writeln!(writer, " [{command}]")?;
            }
        }

        Ok(())
    }
}

fn write_exit_code(mut writer: impl Write, status: &ExecuteStatus) -> io::Result<()> {
    match status.exit_code {
        Some(code) => write!(writer, " ({code})"),
        None => write!(writer, " (killed)"),
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        runner::TestPhase,
        test_list::{TestKind, TestRecord},
    };
    use bytes::Bytes;
    use camino::Utf8PathBuf;

    fn record(path: &str, expected_fail: bool) -> TestRecord {
        TestRecord {
            path: Utf8PathBuf::from(path),
            kind: TestKind::Classic,
            expected_fail,
        }
    }

    fn status(exit_code: Option<i32>, expected_fail: bool, stdout: &str) -> ExecuteStatus {
        ExecuteStatus {
            exit_code,
            expected_fail,
            phase: TestPhase::Direct,
            stdout: Bytes::from(stdout.to_owned()),
            stderr: Bytes::new(),
            start_time: SystemTime::now(),
            time_taken: Duration::from_millis(12),
        }
    }

    fn finished_event<'a>(
        test: &'a TestRecord,
        status: ExecuteStatus,
        finished_count: usize,
    ) -> TestEvent<'a> {
        TestEvent::TestFinished {
            test,
            status,
            current_stats: RunStats {
                initial_run_count: 2,
                finished_count,
                ..RunStats::default()
            },
            running: 0,
        }
    }

    fn render(reporter: &mut TestReporter, events: Vec<TestEvent<'_>>) -> String {
        let mut buf = Vec::new();
        for event in events {
            reporter.report_event(event, &mut buf).unwrap();
        }
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn pass_and_fail_lines() {
        let test_list = TestList::from_records(vec![
            record("tests/a.js", false),
            record("tests/fail/b.js", true),
        ]);
        let passing = record("tests/a.js", false);
        let failing = record("tests/c.js", false);

        let mut reporter = TestReporterBuilder::default().build();
        let out = render(
            &mut reporter,
            vec![
                TestEvent::RunStarted {
                    test_list: &test_list,
                    command: "jjs test tests/jjs".to_owned(),
                },
                finished_event(&passing, status(Some(0), false, ""), 1),
                finished_event(&failing, status(Some(1), false, "TypeError: boom\n"), 2),
            ],
        );

        assert!(out.contains("[   1/   2] PASS: tests/a.js"), "got: {out}");
        assert!(out.contains("[   2/   2] FAIL (1): tests/c.js"), "got: {out}");
        // Failure output is printed verbatim between delimiters.
        assert!(
            out.contains(&format!("{OUTPUT_DELIMITER}\nTypeError: boom\n{OUTPUT_DELIMITER}")),
            "got: {out}"
        );
    }

    #[test]
    fn xfail_and_xpass_labels() {
        let xfail = record("tests/fail/a.js", true);
        let xpass = record("tests/fail/b.js", true);

        let mut reporter = TestReporterBuilder::default().build();
        let out = render(
            &mut reporter,
            vec![
                finished_event(&xfail, status(Some(1), true, ""), 1),
                finished_event(&xpass, status(Some(0), true, ""), 2),
            ],
        );

        assert!(out.contains("PASS (XFAIL): tests/fail/a.js"), "got: {out}");
        assert!(out.contains("FAIL (XPASS) (0): tests/fail/b.js"), "got: {out}");
    }

    #[test]
    fn quiet_mode_suppresses_passes_only() {
        let passing = record("tests/a.js", false);
        let failing = record("tests/b.js", false);

        let mut builder = TestReporterBuilder::default();
        builder.set_quiet(true);
        let mut reporter = builder.build();
        let out = render(
            &mut reporter,
            vec![
                finished_event(&passing, status(Some(0), false, ""), 1),
                finished_event(&failing, status(Some(2), false, ""), 2),
            ],
        );

        assert!(!out.contains("PASS"), "got: {out}");
        assert!(out.contains("FAIL (2): tests/b.js"), "got: {out}");
    }

    #[test]
    fn summary_line_counts_and_command() {
        let mut reporter = TestReporterBuilder::default().build();
        let out = render(
            &mut reporter,
            vec![TestEvent::RunFinished {
                command: "jjs test tests/jjs".to_owned(),
                start_time: SystemTime::now(),
                elapsed: Duration::from_secs(3),
                run_stats: RunStats {
                    initial_run_count: 5,
                    finished_count: 5,
                    passed: 4,
                    passed_xfail: 1,
                    failed: 1,
                    failed_xpass: 0,
                },
            }],
        );

        assert!(
            out.contains("5 tests run: 4 passed (1 xfail), 1 failed [jjs test tests/jjs]"),
            "got: {out}"
        );
    }

    #[test]
    fn canceled_runs_are_not_summarized() {
        let mut reporter = TestReporterBuilder::default().build();
        let out = render(
            &mut reporter,
            vec![TestEvent::RunFinished {
                command: "jjs test tests/jjs".to_owned(),
                start_time: SystemTime::now(),
                elapsed: Duration::from_secs(1),
                run_stats: RunStats {
                    initial_run_count: 10,
                    finished_count: 7,
                    passed: 7,
                    ..RunStats::default()
                },
            }],
        );

        assert!(out.contains("Canceled"), "got: {out}");
        assert!(out.contains("7/10 tests run"), "got: {out}");
        assert!(!out.contains("passed"), "got: {out}");
    }
}
