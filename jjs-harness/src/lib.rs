// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Build-matrix test orchestrator for the JJS engine.
//!
//! Builds the engine once per build-option profile, deduplicates
//! equivalent builds, and runs the JS test suites against each binary.
//! Intended to be invoked from CI; the process exit code is zero only if
//! every selected build and test passed.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod matrix;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
