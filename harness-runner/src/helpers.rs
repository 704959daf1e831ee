// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared helpers for locating engine binaries.

use camino::{Utf8Path, Utf8PathBuf};

/// The file-name suffix of executables on the current platform.
pub const fn exe_suffix() -> &'static str {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            ".exe"
        } else {
            ""
        }
    }
}

/// Returns the path of the engine binary produced by a build, under the
/// build directory's install prefix.
pub fn engine_binary_path(build_dir: &Utf8Path) -> Utf8PathBuf {
    build_dir
        .join("local")
        .join("bin")
        .join(format!("jjs{}", exe_suffix()))
}

/// Returns the snapshot generator binary that sits next to an engine
/// binary: `jjs[.exe]` -> `jjs-snapshot[.exe]`.
pub fn snapshot_tool_path(engine: &Utf8Path) -> Utf8PathBuf {
    let file_name = engine.file_name().unwrap_or_default();
    let stem = file_name.strip_suffix(exe_suffix()).unwrap_or(file_name);
    engine.with_file_name(format!("{}-snapshot{}", stem, exe_suffix()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_path_layout() {
        let path = engine_binary_path(Utf8Path::new("build/tests/jjs_tests"));
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                assert_eq!(path, Utf8PathBuf::from("build/tests/jjs_tests/local/bin/jjs.exe"));
            } else {
                assert_eq!(path, Utf8PathBuf::from("build/tests/jjs_tests/local/bin/jjs"));
            }
        }
    }

    #[test]
    fn snapshot_tool_is_engine_sibling() {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                let tool = snapshot_tool_path(Utf8Path::new("bin/jjs.exe"));
                assert_eq!(tool, Utf8PathBuf::from("bin/jjs-snapshot.exe"));
            } else {
                let tool = snapshot_tool_path(Utf8Path::new("bin/jjs"));
                assert_eq!(tool, Utf8PathBuf::from("bin/jjs-snapshot"));
            }
        }
    }
}
