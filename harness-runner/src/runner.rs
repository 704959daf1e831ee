// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]: a bounded worker
//! pool that executes one external engine process per test and streams
//! completed results back in completion order. Direct tests are a single
//! engine invocation; snapshot tests go through the two-phase
//! generate-then-execute protocol with unconditional artifact cleanup.

use crate::{
    errors::RunnerBuildError,
    helpers,
    reporter::{CancelReason, TestEvent},
    signal::{SignalEvent, SignalHandler, SignalHandlerKind},
    test_list::{TestList, TestRecord},
};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::prelude::*;
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime},
};
use tokio::{io::AsyncReadExt, process::Command, runtime::Runtime, sync::broadcast};
use tracing::{debug, warn};

/// Number of tests to run simultaneously.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestThreads {
    /// A fixed number of workers.
    Count(usize),

    /// One worker per available processing unit.
    NumCpus,
}

impl TestThreads {
    /// Gets the actual number of workers computed at runtime.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(threads) => threads.max(1),
            Self::NumCpus => std::thread::available_parallelism()
                .map(|threads| threads.get())
                .unwrap_or(1),
        }
    }
}

impl FromStr for TestThreads {
    type Err = TestThreadsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            Ok(Self::NumCpus)
        } else if let Ok(threads) = s.parse::<usize>() {
            Ok(Self::Count(threads))
        } else {
            Err(TestThreadsParseError {
                input: s.to_owned(),
            })
        }
    }
}

/// Error returned while parsing a [`TestThreads`] value from a string.
#[derive(Clone, Debug, thiserror::Error)]
#[error("unrecognized test-threads value: {input} (expected an integer or \"num-cpus\")")]
pub struct TestThreadsParseError {
    input: String,
}

/// How tests are scheduled onto workers.
///
/// Both strategies share one execution path; serial runs are a pool of
/// size one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutorStrategy {
    /// Run tests one at a time, in discovery order.
    Serial,

    /// Run tests on a bounded pool. Completion order is not submission
    /// order.
    Pooled(TestThreads),
}

impl ExecutorStrategy {
    fn compute(self) -> usize {
        match self {
            Self::Serial => 1,
            Self::Pooled(threads) => threads.compute(),
        }
    }
}

/// Whether a job's suite runs directly or through the snapshot protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestMode {
    /// `<engine> test --loader {sloppy|module} <path>`.
    Direct,
    /// `<engine>-snapshot generate -o <artifact> <path>`, then
    /// `<engine> test --loader snapshot <artifact>`.
    Snapshot,
}

/// Everything needed to turn a [`TestRecord`] into engine invocations.
#[derive(Clone, Debug)]
pub struct TestRecipe {
    /// Optional execution-runtime wrapper (e.g. qemu) prefixed to every
    /// invocation.
    pub runtime: Option<Utf8PathBuf>,
    /// The engine binary under test.
    pub engine: Utf8PathBuf,
    /// Optional pmap file passed to every `test` invocation.
    pub pmap: Option<Utf8PathBuf>,
    /// Direct or snapshot execution.
    pub mode: TestMode,
    /// Directory for transient snapshot artifacts.
    pub artifact_dir: Utf8PathBuf,
}

impl TestRecipe {
    fn base_command(&self, program: &Utf8Path) -> Command {
        match &self.runtime {
            Some(runtime) => {
                let mut cmd = Command::new(runtime.as_std_path());
                cmd.arg(program.as_std_path());
                cmd
            }
            None => Command::new(program.as_std_path()),
        }
    }

    fn direct_command(&self, test: &TestRecord) -> Command {
        let mut cmd = self.base_command(&self.engine);
        cmd.arg("test");
        if let Some(pmap) = &self.pmap {
            cmd.arg("--pmap").arg(pmap.as_std_path());
        }
        cmd.arg("--loader").arg(test.kind.loader());
        cmd.arg(test.path.as_std_path());
        cmd
    }

    fn generate_command(&self, test: &TestRecord, artifact: &Utf8Path) -> Command {
        let tool = helpers::snapshot_tool_path(&self.engine);
        let mut cmd = self.base_command(&tool);
        cmd.arg("generate");
        cmd.arg("-o").arg(artifact.as_std_path());
        cmd.arg(test.path.as_std_path());
        cmd
    }

    fn execute_command(&self, artifact: &Utf8Path) -> Command {
        let mut cmd = self.base_command(&self.engine);
        cmd.arg("test");
        if let Some(pmap) = &self.pmap {
            cmd.arg("--pmap").arg(pmap.as_std_path());
        }
        cmd.arg("--loader").arg("snapshot");
        cmd.arg(artifact.as_std_path());
        cmd
    }
}

/// The classified result of one test.
///
/// Never stored: always recomputed from the actual exit code and the
/// expected-to-fail flag, so the two can never drift apart.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Exit code 0 and the test was expected to pass.
    Pass,
    /// Exit code 1 and the test was expected to fail.
    PassXfail,
    /// Any failing combination other than an unexpected pass.
    Fail,
    /// Exit code 0 but the test was expected to fail. A regression signal.
    FailXpass,
}

impl Outcome {
    /// Classifies an exit code against the expected-to-fail flag.
    ///
    /// `None` means the process died without an exit code (e.g. a signal)
    /// and counts as an abnormal exit.
    pub fn classify(exit_code: Option<i32>, expected_fail: bool) -> Self {
        match (exit_code, expected_fail) {
            (Some(0), false) => Outcome::Pass,
            (Some(0), true) => Outcome::FailXpass,
            (Some(1), true) => Outcome::PassXfail,
            _ => Outcome::Fail,
        }
    }

    /// True if the test counts as passed.
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Pass | Outcome::PassXfail)
    }
}

/// The phase that produced a test's final exit code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestPhase {
    /// A direct engine invocation.
    Direct,
    /// Snapshot generation. Terminal only when generation failed; the
    /// execute phase is skipped entirely in that case.
    Generate,
    /// Snapshot execution.
    Execute,
}

/// Information about a single execution of a test.
#[derive(Clone, Debug)]
pub struct ExecuteStatus {
    /// The exit code of the phase that decided this test. `None` if the
    /// process died without one.
    pub exit_code: Option<i32>,
    /// Whether the test was expected to fail.
    pub expected_fail: bool,
    /// The phase that produced `exit_code`.
    pub phase: TestPhase,
    /// Captured standard output.
    pub stdout: Bytes,
    /// Captured standard error.
    pub stderr: Bytes,
    /// The time at which the test started.
    pub start_time: SystemTime,
    /// The time it took for the test to run.
    pub time_taken: Duration,
}

impl ExecuteStatus {
    /// The classified outcome, recomputed from the exit code and the
    /// expected-to-fail flag.
    pub fn outcome(&self) -> Outcome {
        Outcome::classify(self.exit_code, self.expected_fail)
    }
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of tests expected to run at the beginning. If the run is
    /// canceled this stays greater than `finished_count`.
    pub initial_run_count: usize,

    /// The number of tests that finished running. Always equal to
    /// `passed + failed`.
    pub finished_count: usize,

    /// Tests that passed, including expected failures that failed.
    pub passed: usize,

    /// The subset of `passed` that were expected failures (exit code 1).
    pub passed_xfail: usize,

    /// Tests that failed, including expected failures that passed.
    pub failed: usize,

    /// The subset of `failed` that were expected failures passing
    /// unexpectedly.
    pub failed_xpass: usize,
}

impl RunStats {
    /// True if this run completed and nothing failed.
    pub fn is_success(&self) -> bool {
        !self.is_canceled() && self.failed == 0
    }

    /// True if the run was cut short: fewer tests finished than were
    /// dispatched. Partial results are not summarized.
    pub fn is_canceled(&self) -> bool {
        self.initial_run_count > self.finished_count
    }

    fn on_test_finished(&mut self, status: &ExecuteStatus) {
        self.finished_count += 1;
        match status.outcome() {
            Outcome::Pass => self.passed += 1,
            Outcome::PassXfail => {
                self.passed += 1;
                self.passed_xfail += 1;
            }
            Outcome::Fail => self.failed += 1,
            Outcome::FailXpass => {
                self.failed += 1;
                self.failed_xpass += 1;
            }
        }
    }
}

/// Test runner options.
#[derive(Debug)]
pub struct TestRunnerBuilder {
    strategy: ExecutorStrategy,
}

impl Default for TestRunnerBuilder {
    fn default() -> Self {
        Self {
            strategy: ExecutorStrategy::Pooled(TestThreads::NumCpus),
        }
    }
}

impl TestRunnerBuilder {
    /// Sets the executor strategy.
    pub fn set_strategy(&mut self, strategy: ExecutorStrategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Creates a new test runner.
    ///
    /// `command` identifies the run in the final summary.
    pub fn build<'a>(
        &self,
        test_list: &'a TestList,
        recipe: TestRecipe,
        command: String,
        handler_kind: SignalHandlerKind,
    ) -> Result<TestRunner<'a>, RunnerBuildError> {
        let test_threads = self.strategy.compute();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("harness-runner-worker")
            .build()
            .map_err(RunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // handler_kind.build() must be called from within the guard.
        let handler = handler_kind.build()?;

        Ok(TestRunner {
            inner: TestRunnerInner {
                test_threads,
                test_list,
                recipe,
                command,
                artifact_seq: AtomicU64::new(0),
                runtime,
            },
            handler,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner<'a> {
    inner: TestRunnerInner<'a>,
    handler: SignalHandler,
}

impl<'a> TestRunner<'a> {
    /// Executes the listed tests, each one in its own process.
    ///
    /// The callback is called with events as each test completes, in
    /// completion order.
    pub fn execute<F>(mut self, mut callback: F) -> RunStats
    where
        F: FnMut(TestEvent<'a>),
    {
        self.try_execute::<std::convert::Infallible, _>(|event| {
            callback(event);
            Ok(())
        })
        .expect("Err branch is infallible")
    }

    /// Executes the listed tests, each one in its own process.
    ///
    /// If the callback returns an error, the run is canceled and the error
    /// is propagated after in-flight tests settle.
    pub fn try_execute<E, F>(&mut self, callback: F) -> Result<RunStats, E>
    where
        F: FnMut(TestEvent<'a>) -> Result<(), E>,
    {
        self.inner.try_execute(&mut self.handler, callback)
    }
}

#[derive(Debug)]
struct TestRunnerInner<'a> {
    test_threads: usize,
    test_list: &'a TestList,
    recipe: TestRecipe,
    command: String,
    artifact_seq: AtomicU64,
    runtime: Runtime,
}

impl<'a> TestRunnerInner<'a> {
    fn try_execute<E, F>(&self, signal_handler: &mut SignalHandler, callback: F) -> Result<RunStats, E>
    where
        F: FnMut(TestEvent<'a>) -> Result<(), E>,
    {
        let canceled = AtomicBool::new(false);
        let canceled_ref = &canceled;

        let mut ctx = CallbackContext::new(callback, self.command.clone(), self.test_list.run_count());

        // Send the initial event.
        // (Don't need to set the canceled atomic if this fails because the
        // run hasn't started yet.)
        ctx.run_started(self.test_list)?;

        // Stores the first error that occurred. This error is propagated up.
        let mut first_error = None;

        let ctx_mut = &mut ctx;
        let first_error_mut = &mut first_error;

        // 4 is greater than the number of messages that will ever be sent
        // over this channel. Also hold a receiver open so there are no
        // spurious SendErrors on the sender.
        let (forward_sender, _forward_receiver) = broadcast::channel::<SignalForwardEvent>(4);
        let forward_sender_ref = &forward_sender;

        self.runtime.block_on(async move {
            let (run_sender, mut run_receiver) = tokio::sync::mpsc::unbounded_channel();

            let run_fut = async move {
                // Moving run_sender in means it is dropped once the stream
                // completes, which closes the channel and ends the dispatch
                // loop below.
                let run_sender = run_sender;
                stream::iter(self.test_list.iter())
                    .map(|test| {
                        let this_run_sender = run_sender.clone();
                        async move {
                            // Subscribe *before* checking canceled_ref: the
                            // canceling side sets the flag first and then
                            // broadcasts, so this order cannot lose both.
                            let mut this_forward_receiver = forward_sender_ref.subscribe();

                            if canceled_ref.load(Ordering::Acquire) {
                                return;
                            }

                            let _ = this_run_sender.send(InternalTestEvent::Started { test });
                            let status = self.run_test(test, &mut this_forward_receiver).await;
                            let _ = this_run_sender.send(InternalTestEvent::Finished { test, status });
                        }
                    })
                    // buffer_unordered means tests are dispatched in
                    // discovery order but finish in any order.
                    .buffer_unordered(self.test_threads)
                    .collect::<()>()
                    .await;
            };

            let dispatch_fut = async move {
                let mut signals_done = false;

                loop {
                    let internal_event = tokio::select! {
                        internal_event = run_receiver.recv() => {
                            match internal_event {
                                Some(event) => InternalEvent::Test(event),
                                None => {
                                    // All runs have been completed.
                                    break;
                                }
                            }
                        },
                        internal_event = signal_handler.recv(), if !signals_done => {
                            match internal_event {
                                Some(event) => InternalEvent::Signal(event),
                                None => {
                                    signals_done = true;
                                    continue;
                                }
                            }
                        },
                    };

                    match ctx_mut.handle_event(internal_event) {
                        Ok(()) => {}
                        Err(err) => {
                            // canceled_ref is set *before* the broadcast so
                            // workers subscribing late still observe it.
                            canceled_ref.store(true, Ordering::Release);

                            match err {
                                InternalError::Error(err) => {
                                    if first_error_mut.is_none() {
                                        *first_error_mut = Some(err);
                                    }
                                    let _ = ctx_mut.begin_cancel(CancelReason::ReportError);
                                }
                                InternalError::SignalCanceled(forward_event, err) => {
                                    if first_error_mut.is_none() {
                                        *first_error_mut = err;
                                    }
                                    // Let in-flight child processes know.
                                    // No receivers is fine: nothing is
                                    // running.
                                    let _ = forward_sender_ref.send(forward_event);
                                }
                            }
                        }
                    }
                }
            };

            futures::join!(run_fut, dispatch_fut);
        });

        match ctx.run_finished() {
            Ok(()) => {}
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            None => Ok(ctx.run_stats),
            Some(err) => Err(err),
        }
    }

    // ---
    // Helper methods
    // ---

    /// Runs an individual test in its own process.
    async fn run_test(
        &self,
        test: &'a TestRecord,
        forward_receiver: &mut broadcast::Receiver<SignalForwardEvent>,
    ) -> ExecuteStatus {
        let start_time = SystemTime::now();
        let stopwatch = Instant::now();

        let (phase, result) = match self.recipe.mode {
            TestMode::Direct => (
                TestPhase::Direct,
                self.run_child(self.recipe.direct_command(test), forward_receiver)
                    .await,
            ),
            TestMode::Snapshot => self.run_snapshot(test, forward_receiver).await,
        };

        let (exit_code, stdout, stderr) = match result {
            Ok(output) => (output.exit_code, output.stdout, output.stderr),
            Err(error) => {
                // The engine could not be spawned at all. Treated as an
                // abnormal exit; the error text stands in for output.
                warn!("failed to execute {}: {error}", test.path);
                (None, Bytes::new(), Bytes::from(error.to_string()))
            }
        };

        ExecuteStatus {
            exit_code,
            expected_fail: test.expected_fail,
            phase,
            stdout,
            stderr,
            start_time,
            time_taken: stopwatch.elapsed(),
        }
    }

    /// Runs the two-phase snapshot protocol for one test.
    ///
    /// The transient artifact gets a unique name from a monotonically
    /// increasing counter, so concurrent snapshot tests never collide. The
    /// artifact is deleted after the execute phase on success and failure
    /// paths alike.
    async fn run_snapshot(
        &self,
        test: &'a TestRecord,
        forward_receiver: &mut broadcast::Receiver<SignalForwardEvent>,
    ) -> (TestPhase, std::io::Result<ChildOutput>) {
        let seq = self.artifact_seq.fetch_add(1, Ordering::Relaxed);
        let artifact = self.recipe.artifact_dir.join(format!("js-{seq}.snapshot"));

        let generated = self
            .run_child(self.recipe.generate_command(test, &artifact), forward_receiver)
            .await;

        match &generated {
            Ok(output) if output.exit_code == Some(0) => {}
            _ => {
                // Generation failed: there is no artifact to execute. The
                // generation exit code classifies the test.
                self.remove_artifact(&artifact).await;
                return (TestPhase::Generate, generated);
            }
        }

        let executed = self
            .run_child(self.recipe.execute_command(&artifact), forward_receiver)
            .await;
        self.remove_artifact(&artifact).await;
        (TestPhase::Execute, executed)
    }

    async fn remove_artifact(&self, artifact: &Utf8Path) {
        match tokio::fs::remove_file(artifact).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!("failed to remove snapshot artifact {artifact}: {error}"),
        }
    }

    /// Spawns one child process, captures its output, and waits for it,
    /// reacting to forwarded shutdown signals.
    async fn run_child(
        &self,
        mut cmd: Command,
        forward_receiver: &mut broadcast::Receiver<SignalForwardEvent>,
    ) -> std::io::Result<ChildOutput> {
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        imp::cmd_pre_exec(&mut cmd);

        let mut child = cmd.spawn()?;

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let mut stdout = bytes::BytesMut::with_capacity(4096);
        let mut stderr = bytes::BytesMut::with_capacity(4096);

        // The output futures borrow the buffers, so they live in an inner
        // scope that ends before the buffers are frozen.
        let status = {
            let stdout_fut = async {
                if let Some(mut pipe) = child_stdout {
                    loop {
                        stdout.reserve(4096);
                        let bytes_read = pipe.read_buf(&mut stdout).await?;
                        if bytes_read == 0 {
                            break;
                        }
                    }
                }
                Ok::<_, std::io::Error>(())
            };
            tokio::pin!(stdout_fut);
            let mut stdout_done = false;

            let stderr_fut = async {
                if let Some(mut pipe) = child_stderr {
                    loop {
                        stderr.reserve(4096);
                        let bytes_read = pipe.read_buf(&mut stderr).await?;
                        if bytes_read == 0 {
                            break;
                        }
                    }
                }
                Ok::<_, std::io::Error>(())
            };
            tokio::pin!(stderr_fut);
            let mut stderr_done = false;

            let status = loop {
                tokio::select! {
                    res = &mut stdout_fut, if !stdout_done => {
                        stdout_done = true;
                        res?;
                    }
                    res = &mut stderr_fut, if !stderr_done => {
                        stderr_done = true;
                        res?;
                    }
                    res = child.wait() => {
                        break res?;
                    }
                    recv = forward_receiver.recv() => {
                        // The sender stays open longer than the whole loop
                        // and the buffer is big enough for every message
                        // ever sent, so a RecvError cannot happen here.
                        let forward_event = recv.expect("broadcast sender outlives the run");
                        imp::terminate_child(&mut child, forward_event, forward_receiver).await;
                    }
                };
            };

            // Drain whatever output remains after exit.
            if !stdout_done {
                stdout_fut.await?;
            }
            if !stderr_done {
                stderr_fut.await?;
            }

            status
        };

        debug!("child exited with {status}");

        Ok(ChildOutput {
            exit_code: status.code(),
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
        })
    }
}

/// Captured result of one child process.
#[derive(Clone, Debug)]
struct ChildOutput {
    exit_code: Option<i32>,
    stdout: Bytes,
    stderr: Bytes,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum SignalCount {
    Once,
    Twice,
}

impl SignalCount {
    fn to_forward_event(self, event: SignalEvent) -> SignalForwardEvent {
        match self {
            Self::Once => SignalForwardEvent::Once(event),
            Self::Twice => SignalForwardEvent::Twice,
        }
    }
}

/// Shutdown notification forwarded to in-flight child processes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SignalForwardEvent {
    Once(SignalEvent),
    Twice,
}

struct CallbackContext<F, E> {
    callback: F,
    command: String,
    start_time: SystemTime,
    stopwatch: Instant,
    run_stats: RunStats,
    running: usize,
    cancel_state: Option<CancelReason>,
    signal_count: Option<SignalCount>,
    phantom: std::marker::PhantomData<E>,
}

impl<'a, F, E> CallbackContext<F, E>
where
    F: FnMut(TestEvent<'a>) -> Result<(), E>,
{
    fn new(callback: F, command: String, initial_run_count: usize) -> Self {
        Self {
            callback,
            command,
            start_time: SystemTime::now(),
            stopwatch: Instant::now(),
            run_stats: RunStats {
                initial_run_count,
                ..RunStats::default()
            },
            running: 0,
            cancel_state: None,
            signal_count: None,
            phantom: std::marker::PhantomData,
        }
    }

    fn run_started(&mut self, test_list: &'a TestList) -> Result<(), E> {
        let command = self.command.clone();
        (self.callback)(TestEvent::RunStarted { test_list, command })
    }

    fn handle_event(&mut self, event: InternalEvent<'a>) -> Result<(), InternalError<E>> {
        match event {
            InternalEvent::Test(InternalTestEvent::Started { test }) => {
                self.running += 1;
                (self.callback)(TestEvent::TestStarted { test }).map_err(InternalError::Error)
            }
            InternalEvent::Test(InternalTestEvent::Finished { test, status }) => {
                self.running -= 1;
                self.run_stats.on_test_finished(&status);

                // A test failure never cancels the pool: the remaining
                // tests always run to completion.
                (self.callback)(TestEvent::TestFinished {
                    test,
                    status,
                    current_stats: self.run_stats,
                    running: self.running,
                })
                .map_err(InternalError::Error)
            }
            InternalEvent::Signal(event) => {
                let signal_count = self.increment_signal_count();
                let forward_event = signal_count.to_forward_event(event);

                let cancel_reason = match event {
                    #[cfg(unix)]
                    SignalEvent::Hangup | SignalEvent::Term => CancelReason::Signal,
                    SignalEvent::Interrupt => CancelReason::Interrupt,
                };

                Err(InternalError::SignalCanceled(
                    forward_event,
                    self.begin_cancel(cancel_reason).err(),
                ))
            }
        }
    }

    fn increment_signal_count(&mut self) -> SignalCount {
        let new_count = match self.signal_count {
            None => SignalCount::Once,
            Some(SignalCount::Once) => SignalCount::Twice,
            Some(SignalCount::Twice) => {
                // The process was signaled 3 times. Time to panic.
                panic!("Signaled 3 times, exiting immediately");
            }
        };
        self.signal_count = Some(new_count);
        new_count
    }

    /// Begins cancellation of a test run. Reports it if the current cancel
    /// state is less severe than the incoming one.
    fn begin_cancel(&mut self, reason: CancelReason) -> Result<(), E> {
        if self.cancel_state < Some(reason) {
            self.cancel_state = Some(reason);
            (self.callback)(TestEvent::RunBeginCancel {
                running: self.running,
                reason,
            })?;
        }
        Ok(())
    }

    fn run_finished(&mut self) -> Result<(), E> {
        let command = self.command.clone();
        (self.callback)(TestEvent::RunFinished {
            command,
            start_time: self.start_time,
            elapsed: self.stopwatch.elapsed(),
            run_stats: self.run_stats,
        })
    }
}

#[derive(Debug)]
enum InternalEvent<'a> {
    Test(InternalTestEvent<'a>),
    Signal(SignalEvent),
}

#[derive(Debug)]
enum InternalTestEvent<'a> {
    Started {
        test: &'a TestRecord,
    },
    Finished {
        test: &'a TestRecord,
        status: ExecuteStatus,
    },
}

#[derive(Debug)]
enum InternalError<E> {
    Error(E),
    SignalCanceled(SignalForwardEvent, Option<E>),
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestMode::Direct => write!(f, "direct"),
            TestMode::Snapshot => write!(f, "snapshot"),
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use libc::{SIGHUP, SIGINT, SIGKILL, SIGTERM};
    use tokio::process::Child;

    /// Pre-execution configuration on Unix: give each child its own
    /// process group so termination signals reach grandchildren too.
    pub(super) fn cmd_pre_exec(cmd: &mut Command) {
        cmd.process_group(0);
    }

    pub(super) async fn terminate_child(
        child: &mut Child,
        forward_event: SignalForwardEvent,
        forward_receiver: &mut broadcast::Receiver<SignalForwardEvent>,
    ) {
        let Some(pid) = child.id() else {
            // The process has already exited.
            return;
        };
        let pid = pid as i32;
        let term_signal = match forward_event {
            SignalForwardEvent::Once(SignalEvent::Hangup) => SIGHUP,
            SignalForwardEvent::Once(SignalEvent::Term) => SIGTERM,
            SignalForwardEvent::Once(SignalEvent::Interrupt) => SIGINT,
            SignalForwardEvent::Twice => SIGKILL,
        };
        unsafe {
            // The child got its own process group in cmd_pre_exec -- signal
            // the whole group.
            libc::kill(-pid, term_signal);
        }

        if term_signal == SIGKILL {
            // SIGKILL guarantees the process group is dead.
            return;
        }

        // Grace period before a hard shutdown.
        let sleep = tokio::time::sleep(Duration::from_secs(10));
        tokio::select! {
            biased;

            _ = child.wait() => {
                // The process exited.
            }
            _ = forward_receiver.recv() => {
                // A second signal while waiting always means kill
                // immediately.
                unsafe {
                    libc::kill(-pid, SIGKILL);
                }
            }
            _ = sleep => {
                unsafe {
                    libc::kill(-pid, SIGKILL);
                }
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::process::Child;

    pub(super) fn cmd_pre_exec(_cmd: &mut Command) {
        // Windows propagates console Ctrl-C to child processes; nothing to
        // configure up front.
    }

    pub(super) async fn terminate_child(
        child: &mut Child,
        _forward_event: SignalForwardEvent,
        _forward_receiver: &mut broadcast::Receiver<SignalForwardEvent>,
    ) {
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_classification_table() {
        // (actual exit code, expected_to_fail) -> outcome, per the fixed
        // classification table.
        assert_eq!(Outcome::classify(Some(0), false), Outcome::Pass);
        assert_eq!(Outcome::classify(Some(0), true), Outcome::FailXpass);
        assert_eq!(Outcome::classify(Some(1), true), Outcome::PassXfail);
        assert_eq!(Outcome::classify(Some(1), false), Outcome::Fail);
        assert_eq!(Outcome::classify(Some(2), false), Outcome::Fail);
        assert_eq!(Outcome::classify(Some(2), true), Outcome::Fail);
        assert_eq!(Outcome::classify(None, false), Outcome::Fail);
        assert_eq!(Outcome::classify(None, true), Outcome::Fail);

        assert!(Outcome::Pass.is_success());
        assert!(Outcome::PassXfail.is_success());
        assert!(!Outcome::Fail.is_success());
        assert!(!Outcome::FailXpass.is_success());
    }

    #[test]
    fn run_stats_accumulation() {
        fn status(exit_code: Option<i32>, expected_fail: bool) -> ExecuteStatus {
            ExecuteStatus {
                exit_code,
                expected_fail,
                phase: TestPhase::Direct,
                stdout: Bytes::new(),
                stderr: Bytes::new(),
                start_time: SystemTime::now(),
                time_taken: Duration::ZERO,
            }
        }

        let mut stats = RunStats {
            initial_run_count: 4,
            ..RunStats::default()
        };
        stats.on_test_finished(&status(Some(0), false));
        stats.on_test_finished(&status(Some(1), true));
        stats.on_test_finished(&status(Some(1), false));
        stats.on_test_finished(&status(Some(0), true));

        assert_eq!(stats.finished_count, 4);
        assert_eq!(stats.passed, 2);
        assert_eq!(stats.passed_xfail, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.failed_xpass, 1);
        // The core invariant: every finished test is either passed or
        // failed.
        assert_eq!(stats.finished_count, stats.passed + stats.failed);
        assert!(!stats.is_canceled());
        assert!(!stats.is_success());
    }

    #[test]
    fn canceled_runs_are_failures() {
        let stats = RunStats {
            initial_run_count: 10,
            finished_count: 7,
            passed: 7,
            ..RunStats::default()
        };
        assert!(stats.is_canceled());
        assert!(!stats.is_success());
    }

    #[test]
    fn executor_strategy_pool_sizes() {
        assert_eq!(ExecutorStrategy::Serial.compute(), 1);
        assert_eq!(
            ExecutorStrategy::Pooled(TestThreads::Count(4)).compute(),
            4
        );
        // A zero count is clamped rather than deadlocking the pool.
        assert_eq!(
            ExecutorStrategy::Pooled(TestThreads::Count(0)).compute(),
            1
        );
        assert!(ExecutorStrategy::Pooled(TestThreads::NumCpus).compute() >= 1);
    }

    #[test]
    fn test_threads_from_str() {
        assert_eq!("num-cpus".parse::<TestThreads>().unwrap(), TestThreads::NumCpus);
        assert_eq!("6".parse::<TestThreads>().unwrap(), TestThreads::Count(6));
        assert!("six".parse::<TestThreads>().is_err());
    }
}
