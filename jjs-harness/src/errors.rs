// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::OutputContext;
use camino::Utf8PathBuf;
use harness_runner::errors::SessionError;
use owo_colors::OwoColorize;
use std::{error::Error, io};
use thiserror::Error;

/// An error occurred in a program that jjs-harness ran, not in jjs-harness
/// itself.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("no test suites selected")]
    NoSuitesSelected,

    #[error("failed to read snapshot skip list `{path}`")]
    SnapshotSkipListRead {
        path: Utf8PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("session aborted")]
    SessionAborted {
        #[from]
        error: SessionError,
    },

    #[error("test run failed")]
    TestRunFailed {
        /// Names of the jobs that failed.
        failed_jobs: Vec<String>,
    },

    #[error("error writing to output")]
    OutputWrite {
        #[source]
        error: io::Error,
    },
}

impl ExpectedError {
    /// The exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::NoSuitesSelected => 2,
            Self::SnapshotSkipListRead { .. }
            | Self::SessionAborted { .. }
            | Self::TestRunFailed { .. }
            | Self::OutputWrite { .. } => 1,
        }
    }

    /// Displays this error to stderr, along with its source chain.
    pub fn display_to_stderr(&self, output: &OutputContext) {
        let styles = output.stderr_styles();

        match self {
            Self::NoSuitesSelected => {
                tracing::error!(
                    "no test suites selected; pass {} (or see --help for individual suites)",
                    "--all".style(styles.bold),
                );
            }
            Self::TestRunFailed { failed_jobs } => {
                tracing::error!(
                    "{} job(s) {}: {}",
                    failed_jobs.len(),
                    "failed".style(styles.failure),
                    failed_jobs.join(", "),
                );
            }
            other => {
                tracing::error!("{other}");
                let mut source = other.source();
                while let Some(error) = source {
                    tracing::error!("  caused by: {error}");
                    source = error.source();
                }
            }
        }
    }
}
