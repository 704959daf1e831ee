// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The static test matrix: which jobs exist and which build options each
//! one carries.

use harness_runner::job::JobDescriptor;

/// Test directory for the jjs-tests suites, relative to the project root.
pub(crate) const JJS_TESTS_DIR: &str = "tests/jjs";

/// Test directory for the jjs-pack suite, relative to the project root.
pub(crate) const JJS_PACK_TESTS_DIR: &str = "tests/pack";

/// Default pmap file passed to engine invocations, relative to the project
/// root.
pub(crate) const JJS_TESTS_PMAP_FILE: &str = "tests/jjs/pmap.json";

// vm configuration plus the options the tests themselves need.
const OPTIONS_COMMON: &[&str] = &["--default-vm-heap-size=512", "--function-to-string=on"];

const OPTIONS_SNAPSHOT: &[&str] = &[
    "--snapshot-save=on",
    "--snapshot-exec=on",
    "--jjs-cmdline-snapshot=on",
];

const OPTIONS_STACK_LIMIT: &[&str] = &["--default-vm-stack-limit=96"];

const BUILDOPTIONS_COMMON: &[&str] = &["--lto=off"];

fn skip_if(condition: bool, reason: &str) -> Option<String> {
    condition.then(|| reason.to_owned())
}

fn concat(base: &[&str], extra: &[&str]) -> Vec<String> {
    base.iter()
        .chain(extra.iter())
        .map(|opt| (*opt).to_owned())
        .collect()
}

/// Jobs for the jjs-tests suite.
pub(crate) fn jjs_tests_jobs() -> Vec<JobDescriptor> {
    vec![JobDescriptor::new("jjs_tests", concat(OPTIONS_COMMON, &[]))]
}

/// Jobs for the jjs-snapshot-tests suite.
pub(crate) fn jjs_snapshot_tests_jobs() -> Vec<JobDescriptor> {
    vec![
        JobDescriptor::new("jjs_tests-snapshot", concat(OPTIONS_COMMON, OPTIONS_SNAPSHOT))
            .with_test_args(["--snapshot"]),
    ]
}

/// Jobs for the jjs-pack suite.
pub(crate) fn jjs_pack_tests_jobs() -> Vec<JobDescriptor> {
    vec![JobDescriptor::new(
        "jjs_pack_tests",
        concat(OPTIONS_COMMON, &["--jjs-pack=on"]),
    )]
}

/// The buildoption-test family: build-only jobs exercising option
/// combinations that must keep compiling.
pub(crate) fn buildoption_jobs() -> Vec<JobDescriptor> {
    vec![
        JobDescriptor::new(
            "buildoption_test-lto",
            concat(BUILDOPTIONS_COMMON, &["--lto=on"]),
        ),
        JobDescriptor::new(
            "buildoption_test-logging",
            concat(BUILDOPTIONS_COMMON, &["--logging=on"]),
        ),
        JobDescriptor::new(
            "buildoption_test-amalgam",
            concat(BUILDOPTIONS_COMMON, &["--amalgam=on"]),
        ),
        JobDescriptor::new(
            "buildoption_test-valgrind",
            concat(BUILDOPTIONS_COMMON, &["--valgrind=on"]),
        )
        .with_skip_reason(skip_if(
            cfg!(windows),
            "valgrind not supported on msvc (mingw is ok)",
        )),
        JobDescriptor::new(
            "buildoption_test-init_flag",
            concat(
                BUILDOPTIONS_COMMON,
                &["--mem-stats=on", "--show-opcodes=on", "--show-regexp-opcodes=on"],
            ),
        ),
        JobDescriptor::new(
            "buildoption_test-no_lcache_prophashmap",
            concat(
                BUILDOPTIONS_COMMON,
                &[
                    "--compile-flag=-DJJS_LCACHE=0",
                    "--compile-flag=-DJJS_PROPERTY_HASHMAP=0",
                ],
            ),
        ),
        JobDescriptor::new(
            "buildoption_test-shared_libs",
            concat(BUILDOPTIONS_COMMON, &["--shared-libs=on"]),
        )
        .with_skip_reason(skip_if(
            cfg!(windows),
            "not yet supported, link failure on Windows",
        )),
        JobDescriptor::new(
            "buildoption_test-cmdline_snapshot",
            concat(BUILDOPTIONS_COMMON, &["--jjs-cmdline-snapshot=on"]),
        ),
        JobDescriptor::new(
            "buildoption_test-recursion_limit",
            concat(BUILDOPTIONS_COMMON, OPTIONS_STACK_LIMIT),
        ),
        JobDescriptor::new(
            "buildoption_test-module-off",
            concat(
                BUILDOPTIONS_COMMON,
                &[
                    "--compile-flag=-DJJS_MODULE_SYSTEM=0",
                    "--compile-flag=-DJJS_ANNEX=0",
                ],
            ),
        ),
        JobDescriptor::new(
            "buildoption_test-commonjs-off",
            concat(
                BUILDOPTIONS_COMMON,
                &["--compile-flag=-DJJS_ANNEX_COMMONJS=0"],
            ),
        ),
        JobDescriptor::new(
            "buildoption_test-esm-off",
            concat(BUILDOPTIONS_COMMON, &["--compile-flag=-DJJS_ANNEX_ESM=0"]),
        ),
        JobDescriptor::new(
            "buildoption_test-vmod-off",
            concat(BUILDOPTIONS_COMMON, &["--compile-flag=-DJJS_ANNEX_VMOD=0"]),
        ),
        JobDescriptor::new(
            "buildoption_test-builtin-proxy-off",
            concat(
                BUILDOPTIONS_COMMON,
                &["--compile-flag=-DJJS_BUILTIN_PROXY=0"],
            ),
        ),
    ]
}
