// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by harness-runner.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// An error that occurred while invoking the external build collaborator.
///
/// A build that runs but exits non-zero is *not* an error at this level;
/// non-zero exit codes are surfaced through the build cache and recorded
/// against the job. This type covers failures to run the collaborator at
/// all.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The build command could not be spawned.
    #[error("failed to execute build command `{command}`")]
    Spawn {
        /// The command that failed to start.
        command: String,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while discovering tests.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A directory could not be enumerated.
    #[error("failed to read test directory `{dir}`")]
    ReadDir {
        /// The directory being enumerated.
        dir: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A test-list file could not be read.
    #[error("failed to read test list `{path}`")]
    ReadList {
        /// The list file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A discovered path was not valid UTF-8.
    #[error("test path `{path}` is not valid UTF-8")]
    NonUtf8Path {
        /// A lossy rendition of the offending path.
        path: String,
    },
}

/// An error that occurred while hashing a built binary for identity
/// deduplication.
#[derive(Debug, Error)]
#[error("failed to hash binary `{path}`")]
pub struct BinaryHashError {
    /// The binary being hashed.
    pub path: Utf8PathBuf,
    /// The underlying error.
    #[source]
    pub error: io::Error,
}

/// An error that occurred while building a test runner.
#[derive(Debug, Error)]
pub enum RunnerBuildError {
    /// The tokio runtime could not be created.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// The signal handler could not be set up.
    #[error(transparent)]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] pub(crate) io::Error);

/// An error that occurred while writing a test event to output.
#[derive(Debug, Error)]
pub enum WriteEventError {
    /// An I/O error occurred while writing the event.
    #[error("error writing to output")]
    Io(#[source] io::Error),
}

/// An error that aborted a session before its jobs could complete.
///
/// Per-job failures (failed builds, failed tests, empty suites) are not
/// session errors: they are recorded in the session summary and surfaced
/// through the process exit code. This type covers infrastructure failures
/// that make continuing meaningless.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The build collaborator could not be invoked.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Test discovery failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// A built binary could not be hashed.
    #[error(transparent)]
    BinaryHash(#[from] BinaryHashError),

    /// The test runner could not be constructed.
    #[error(transparent)]
    RunnerBuild(#[from] RunnerBuildError),

    /// A test event could not be reported.
    #[error(transparent)]
    WriteEvent(#[from] WriteEventError),
}
