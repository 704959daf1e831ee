// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-run orchestrator.
//!
//! A [`Session`] sequences each job through build, deduplication,
//! discovery and execution, and aggregates results across jobs. It owns
//! the build cache and the binary-identity map; both live for exactly one
//! run. Failures are recovered at the smallest unit that allows forward
//! progress: a failed build or an empty suite fails its job, not the run.

use crate::{
    build_cache::{BinaryIdentity, BuildCache, BuildContext},
    errors::{SessionError, WriteEventError},
    helpers,
    job::JobDescriptor,
    reporter::TestEvent,
    runner::{ExecutorStrategy, RunStats, TestMode, TestRecipe, TestRunnerBuilder},
    signal::SignalHandlerKind,
    test_list::TestList,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Where one job's tests come from.
#[derive(Clone, Debug, Default)]
pub struct TestSource {
    /// Directory to discover tests in, recursively.
    pub test_dir: Option<Utf8PathBuf>,
    /// File listing one test path per line, resolved against its own
    /// directory.
    pub test_list: Option<Utf8PathBuf>,
    /// Substring patterns; matching test paths are skipped.
    pub skip_patterns: Vec<String>,
}

/// One job plus its test source. Build-only jobs have no source: their
/// success is the build's success.
#[derive(Clone, Debug)]
pub struct JobPlan {
    /// The job descriptor.
    pub job: JobDescriptor,
    /// The job's test source, or `None` for build-only jobs.
    pub source: Option<TestSource>,
}

/// The terminal state of one job.
#[derive(Clone, Debug)]
pub enum JobStatus {
    /// The job was marked skipped in the matrix.
    Skipped {
        /// The configured reason.
        reason: String,
    },

    /// The build collaborator exited non-zero. The job's tests were not
    /// run.
    BuildFailed {
        /// The build exit code.
        exit_code: i32,
    },

    /// A build-only job built successfully.
    Built,

    /// Discovery produced zero tests. A silently-empty suite must not be
    /// mistaken for a passing one, so this is a failure.
    NoTests,

    /// The job's binary was already exercised by an earlier job (same
    /// build directory or byte-identical binary); its outcome is the
    /// earlier job's outcome.
    Deduped {
        /// The name of the earlier equivalent job.
        same_as: String,
    },

    /// The suite ran to completion (or was canceled mid-run).
    Completed {
        /// The run's statistics.
        stats: RunStats,
    },
}

/// The result of one job.
#[derive(Clone, Debug)]
pub struct JobResult {
    /// The job's name.
    pub name: String,
    /// How the job ended.
    pub status: JobStatus,
}

/// Aggregate results for a whole session.
#[derive(Clone, Debug, Default)]
pub struct SessionSummary {
    /// Per-job results, in execution order.
    pub jobs: Vec<JobResult>,
}

impl SessionSummary {
    /// True if every job succeeded. Deduped jobs take on the outcome of
    /// the job they were deduplicated against.
    pub fn is_success(&self) -> bool {
        self.jobs.iter().all(|job| self.job_succeeded(job))
    }

    /// Names of jobs that failed, in execution order.
    pub fn failed_jobs(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|job| !self.job_succeeded(job))
            .map(|job| job.name.as_str())
            .collect()
    }

    fn job_succeeded(&self, job: &JobResult) -> bool {
        match &job.status {
            JobStatus::Skipped { .. } | JobStatus::Built => true,
            JobStatus::BuildFailed { .. } | JobStatus::NoTests => false,
            JobStatus::Completed { stats } => stats.is_success(),
            JobStatus::Deduped { same_as } => self
                .jobs
                .iter()
                .find(|other| &other.name == same_as)
                .is_some_and(|other| self.job_succeeded(other)),
        }
    }
}

/// Session options.
#[derive(Debug)]
pub struct SessionBuilder {
    outdir: Utf8PathBuf,
    build_debug: bool,
    extra_build_options: Vec<String>,
    toolchain: Option<Utf8PathBuf>,
    pmap: Option<Utf8PathBuf>,
    runtime: Option<Utf8PathBuf>,
    strategy: ExecutorStrategy,
    handler_kind: SignalHandlerKind,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            outdir: Utf8PathBuf::from("build/tests"),
            build_debug: false,
            extra_build_options: Vec::new(),
            toolchain: None,
            pmap: None,
            runtime: None,
            strategy: ExecutorStrategy::Pooled(crate::runner::TestThreads::NumCpus),
            handler_kind: SignalHandlerKind::Standard,
        }
    }
}

impl SessionBuilder {
    /// Sets the root of per-job build directories.
    pub fn set_outdir(&mut self, outdir: impl Into<Utf8PathBuf>) -> &mut Self {
        self.outdir = outdir.into();
        self
    }

    /// Builds debug binaries: `--debug` is appended to every job's build
    /// args and `-debug` to its build directory name.
    pub fn set_build_debug(&mut self, build_debug: bool) -> &mut Self {
        self.build_debug = build_debug;
        self
    }

    /// Extra build options appended to every job (skipping options a job
    /// already carries).
    pub fn set_extra_build_options(
        &mut self,
        options: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.extra_build_options = options.into_iter().map(|opt| opt.into()).collect();
        self
    }

    /// Toolchain file forwarded to the build collaborator.
    pub fn set_toolchain(&mut self, toolchain: Option<Utf8PathBuf>) -> &mut Self {
        self.toolchain = toolchain;
        self
    }

    /// Pmap file forwarded to every engine `test` invocation.
    pub fn set_pmap(&mut self, pmap: Option<Utf8PathBuf>) -> &mut Self {
        self.pmap = pmap;
        self
    }

    /// Execution-runtime wrapper (e.g. qemu) prefixed to engine
    /// invocations.
    pub fn set_runtime(&mut self, runtime: Option<Utf8PathBuf>) -> &mut Self {
        self.runtime = runtime;
        self
    }

    /// Sets the executor strategy shared by all jobs.
    pub fn set_strategy(&mut self, strategy: ExecutorStrategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Sets the signal-handler kind. Tests use
    /// [`SignalHandlerKind::Noop`].
    pub fn set_signal_handler_kind(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.handler_kind = kind;
        self
    }

    /// Creates a session around the given build collaborator.
    pub fn build<B: BuildContext>(self, context: B) -> Session<B> {
        Session {
            context,
            cache: BuildCache::new(),
            outdir: self.outdir,
            build_debug: self.build_debug,
            extra_build_options: self.extra_build_options,
            toolchain: self.toolchain,
            pmap: self.pmap,
            runtime: self.runtime,
            strategy: self.strategy,
            handler_kind: self.handler_kind,
        }
    }
}

/// Orchestrates one run over a list of job plans.
///
/// Created using [`SessionBuilder::build`].
#[derive(Debug)]
pub struct Session<B> {
    context: B,
    cache: BuildCache,
    outdir: Utf8PathBuf,
    build_debug: bool,
    extra_build_options: Vec<String>,
    toolchain: Option<Utf8PathBuf>,
    pmap: Option<Utf8PathBuf>,
    runtime: Option<Utf8PathBuf>,
    strategy: ExecutorStrategy,
    handler_kind: SignalHandlerKind,
}

impl<B: BuildContext> Session<B> {
    /// Runs every job plan in order, reporting test events through
    /// `callback`.
    pub fn execute<F>(
        &mut self,
        plans: &[JobPlan],
        mut callback: F,
    ) -> Result<SessionSummary, SessionError>
    where
        F: for<'a> FnMut(TestEvent<'a>) -> Result<(), WriteEventError>,
    {
        let mut summary = SessionSummary::default();
        // First job to test each build directory / binary identity.
        let mut tested_dirs: HashMap<Utf8PathBuf, String> = HashMap::new();
        let mut tested_hashes: HashMap<BinaryIdentity, String> = HashMap::new();

        for plan in plans {
            let status = self.execute_job(plan, &mut tested_dirs, &mut tested_hashes, &mut callback)?;

            let canceled =
                matches!(&status, JobStatus::Completed { stats } if stats.is_canceled());
            summary.jobs.push(JobResult {
                name: plan.job.name().to_owned(),
                status,
            });
            if canceled {
                warn!("run canceled; skipping remaining jobs");
                break;
            }
        }

        Ok(summary)
    }

    fn execute_job<F>(
        &mut self,
        plan: &JobPlan,
        tested_dirs: &mut HashMap<Utf8PathBuf, String>,
        tested_hashes: &mut HashMap<BinaryIdentity, String>,
        callback: &mut F,
    ) -> Result<JobStatus, SessionError>
    where
        F: for<'a> FnMut(TestEvent<'a>) -> Result<(), WriteEventError>,
    {
        let job = &plan.job;

        if let Some(reason) = job.skip_reason() {
            warn!("skipping: {} ({reason})", job.name());
            return Ok(JobStatus::Skipped {
                reason: reason.to_owned(),
            });
        }

        let build_args = self.merged_build_args(job);
        let build_dir = job.build_dir(&self.outdir, self.build_debug);
        let output = self.cache.ensure_built(
            &mut self.context,
            &build_args,
            build_dir,
            self.toolchain.as_deref(),
        )?;

        if !output.is_success() {
            error!("build failed for {}: exit code {}", job.name(), output.exit_code);
            return Ok(JobStatus::BuildFailed {
                exit_code: output.exit_code,
            });
        }

        let Some(source) = &plan.source else {
            return Ok(JobStatus::Built);
        };

        if let Some(prior) = tested_dirs.get(&output.build_dir) {
            info!("skipping: already tested with {}", output.build_dir);
            return Ok(JobStatus::Deduped {
                same_as: prior.clone(),
            });
        }
        tested_dirs.insert(output.build_dir.clone(), job.name().to_owned());

        let engine = helpers::engine_binary_path(&output.build_dir);
        let identity = BinaryIdentity::of_file(&engine)?;
        if let Some(prior) = tested_hashes.get(&identity) {
            info!("skipping: already tested with equivalent {prior}");
            return Ok(JobStatus::Deduped {
                same_as: prior.clone(),
            });
        }
        tested_hashes.insert(identity, job.name().to_owned());

        let test_list = TestList::discover(
            source.test_dir.as_deref(),
            source.test_list.as_deref(),
            &source.skip_patterns,
        )?;
        if test_list.is_empty() {
            error!("no tests to execute for {}", job.name());
            return Ok(JobStatus::NoTests);
        }

        let mode = if job.is_snapshot() {
            TestMode::Snapshot
        } else {
            TestMode::Direct
        };
        let recipe = TestRecipe {
            runtime: self.runtime.clone(),
            engine: engine.clone(),
            pmap: self.pmap.clone(),
            mode,
            artifact_dir: output.build_dir.clone(),
        };
        let command = command_summary(&engine, mode, source);
        info!("test command: {command}");

        let mut builder = TestRunnerBuilder::default();
        builder.set_strategy(self.strategy);
        let mut runner = builder.build(&test_list, recipe, command, self.handler_kind)?;
        let stats = runner
            .try_execute(|event| callback(event))
            .map_err(SessionError::WriteEvent)?;

        Ok(JobStatus::Completed { stats })
    }

    /// A job's effective build arguments: its own options, the debug
    /// option when requested, then session-wide extras it doesn't already
    /// carry.
    fn merged_build_args(&self, job: &JobDescriptor) -> Vec<String> {
        let mut args = job.build_args().to_vec();
        if self.build_debug {
            args.push("--debug".to_owned());
        }
        for option in &self.extra_build_options {
            if !args.contains(option) {
                args.push(option.clone());
            }
        }
        args
    }
}

fn command_summary(engine: &Utf8Path, mode: TestMode, source: &TestSource) -> String {
    let mut parts = vec![engine.to_string(), "test".to_owned()];
    if mode == TestMode::Snapshot {
        parts.push("--snapshot".to_owned());
    }
    if let Some(dir) = &source.test_dir {
        parts.push(dir.to_string());
    }
    if let Some(list) = &source.test_list {
        parts.push(list.to_string());
    }
    parts.join(" ")
}
