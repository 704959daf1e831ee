// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The binary build cache.
//!
//! Builds are deduplicated at two levels. First by build-argument identity:
//! the cache key is the sort-normalized argument set, so two jobs whose
//! argument lists differ only in order share one build. Second by content:
//! after a successful build the binary is hashed, and the orchestrator skips
//! re-running the suite against a binary whose hash it has already tested.

use crate::errors::{BinaryHashError, BuildError};
use camino::{Utf8Path, Utf8PathBuf};
use sha1::{Digest, Sha1};
use std::{collections::HashMap, fmt, fs::File, io::Read, process::Command};
use tracing::{debug, error, info};

/// Block size for streaming binary hashing. Binaries are hashed in fixed
/// blocks so memory use stays bounded regardless of binary size.
const HASH_BLOCK_SIZE: usize = 65536;

/// The external build collaborator.
///
/// Implementations produce an engine binary under `build_dir` from a set of
/// build options and return the build's exit code. The production
/// implementation shells out to the project's build script; tests inject
/// counting stubs.
pub trait BuildContext {
    /// Runs a build. Returns the build command's exit code; zero means the
    /// binary exists under `build_dir`.
    fn build(
        &mut self,
        build_args: &[String],
        build_dir: &Utf8Path,
        toolchain: Option<&Utf8Path>,
    ) -> Result<i32, BuildError>;
}

/// Builds by invoking the project's build script.
#[derive(Clone, Debug)]
pub struct ScriptBuild {
    script: Utf8PathBuf,
}

impl ScriptBuild {
    /// Creates a build context around the given build script.
    pub fn new(script: impl Into<Utf8PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl BuildContext for ScriptBuild {
    fn build(
        &mut self,
        build_args: &[String],
        build_dir: &Utf8Path,
        toolchain: Option<&Utf8Path>,
    ) -> Result<i32, BuildError> {
        let mut cmd = Command::new(self.script.as_std_path());
        cmd.args(build_args)
            .arg(format!("--builddir={build_dir}"))
            .arg(format!("--install={}", build_dir.join("local")));
        if let Some(toolchain) = toolchain {
            cmd.arg(format!("--toolchain={toolchain}"));
        }

        info!("build command: {} {}", self.script, shell_join(build_args));

        let output = cmd.output().map_err(|err| BuildError::Spawn {
            command: self.script.to_string(),
            error: err,
        })?;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            // Surface the collaborator's output on failure; it is the only
            // diagnostic the build system gives us.
            error!(
                "build failed with code {code}:\n{}",
                String::from_utf8_lossy(&output.stdout)
            );
        }
        Ok(code)
    }
}

fn shell_join(args: &[String]) -> String {
    args.join(" ")
}

/// The result of one build request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildOutput {
    /// The build command's exit code.
    pub exit_code: i32,
    /// The job's build directory. Valid even on failure (partial output may
    /// exist there).
    pub build_dir: Utf8PathBuf,
}

impl BuildOutput {
    /// True if the build produced a binary.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Process-scoped build cache keyed by normalized build arguments.
///
/// Owned by the session; lives for one orchestration run. A second request
/// with an order-permuted but equal argument list observes the first
/// request's recorded result without invoking the collaborator again.
#[derive(Debug, Default)]
pub struct BuildCache {
    built: HashMap<Vec<String>, BuildOutput>,
}

impl BuildCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a binary for `build_args` exists, building at most once per
    /// normalized argument set.
    pub fn ensure_built<B: BuildContext>(
        &mut self,
        context: &mut B,
        build_args: &[String],
        build_dir: Utf8PathBuf,
        toolchain: Option<&Utf8Path>,
    ) -> Result<BuildOutput, BuildError> {
        let key = normalized_key(build_args);
        if let Some(output) = self.built.get(&key) {
            info!(
                "skipping: already built at {} with exit code {}",
                output.build_dir, output.exit_code
            );
            return Ok(output.clone());
        }

        let exit_code = context.build(build_args, &build_dir, toolchain)?;
        let output = BuildOutput {
            exit_code,
            build_dir,
        };
        self.built.insert(key, output.clone());
        Ok(output)
    }

    /// The number of distinct builds performed so far.
    pub fn len(&self) -> usize {
        self.built.len()
    }

    /// True if no builds have been performed.
    pub fn is_empty(&self) -> bool {
        self.built.is_empty()
    }
}

fn normalized_key(build_args: &[String]) -> Vec<String> {
    let mut key = build_args.to_vec();
    key.sort_unstable();
    key
}

/// SHA-1 content digest of a built binary.
///
/// Two differently-configured builds that produce byte-identical binaries
/// share one identity; the suite runs at most once per identity.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BinaryIdentity([u8; 20]);

impl BinaryIdentity {
    /// Hashes the file at `path` in fixed-size blocks.
    pub fn of_file(path: &Utf8Path) -> Result<Self, BinaryHashError> {
        let map_err = |error| BinaryHashError {
            path: path.to_owned(),
            error,
        };

        let mut file = File::open(path).map_err(map_err)?;
        let mut hasher = Sha1::new();
        let mut block = vec![0u8; HASH_BLOCK_SIZE];
        loop {
            let read = file.read(&mut block).map_err(map_err)?;
            if read == 0 {
                break;
            }
            hasher.update(&block[..read]);
        }
        let digest = hasher.finalize();
        debug!("hashed {path}: {}", hex::encode(&digest));
        Ok(Self(digest.into()))
    }
}

impl fmt::Display for BinaryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    /// Build context that records every invocation.
    #[derive(Debug, Default)]
    struct CountingBuild {
        invocations: Vec<Vec<String>>,
        exit_code: i32,
    }

    impl BuildContext for CountingBuild {
        fn build(
            &mut self,
            build_args: &[String],
            _build_dir: &Utf8Path,
            _toolchain: Option<&Utf8Path>,
        ) -> Result<i32, BuildError> {
            self.invocations.push(build_args.to_vec());
            Ok(self.exit_code)
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reordered_args_share_one_build() {
        let mut cache = BuildCache::new();
        let mut context = CountingBuild::default();

        let first = cache
            .ensure_built(
                &mut context,
                &args(&["--x=1", "--y=2"]),
                "out/first".into(),
                None,
            )
            .unwrap();
        let second = cache
            .ensure_built(
                &mut context,
                &args(&["--y=2", "--x=1"]),
                "out/second".into(),
                None,
            )
            .unwrap();

        assert_eq!(context.invocations.len(), 1, "collaborator invoked once");
        // The second job observes the first job's result, including its
        // build directory.
        assert_eq!(second, first);
        assert_eq!(second.build_dir, "out/first");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_args_build_separately() {
        let mut cache = BuildCache::new();
        let mut context = CountingBuild::default();

        cache
            .ensure_built(&mut context, &args(&["--x=1"]), "out/a".into(), None)
            .unwrap();
        cache
            .ensure_built(&mut context, &args(&["--x=2"]), "out/b".into(), None)
            .unwrap();

        assert_eq!(context.invocations.len(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_builds_are_cached_too() {
        let mut cache = BuildCache::new();
        let mut context = CountingBuild {
            exit_code: 2,
            ..Default::default()
        };

        let first = cache
            .ensure_built(&mut context, &args(&["--x=1"]), "out/a".into(), None)
            .unwrap();
        let second = cache
            .ensure_built(&mut context, &args(&["--x=1"]), "out/a".into(), None)
            .unwrap();

        assert!(!first.is_success());
        assert_eq!(first, second);
        assert_eq!(context.invocations.len(), 1, "failure is not retried");
    }

    #[test]
    fn identical_bytes_share_identity() {
        let dir = Utf8TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");
        std::fs::write(&a, b"engine-bytes").unwrap();
        std::fs::write(&b, b"engine-bytes").unwrap();
        std::fs::write(&c, b"other-bytes").unwrap();

        let id_a = BinaryIdentity::of_file(&a).unwrap();
        let id_b = BinaryIdentity::of_file(&b).unwrap();
        let id_c = BinaryIdentity::of_file(&c).unwrap();
        assert_eq!(id_a, id_b);
        assert_ne!(id_a, id_c);
    }

    #[test]
    fn hashing_streams_large_files() {
        let dir = Utf8TempDir::new().unwrap();
        let big = dir.path().join("big.bin");
        // Spans multiple hash blocks, including a partial final block.
        let data = vec![0xabu8; HASH_BLOCK_SIZE * 2 + 17];
        std::fs::write(&big, &data).unwrap();

        let id = BinaryIdentity::of_file(&big).unwrap();
        let expected = {
            let mut hasher = Sha1::new();
            hasher.update(&data);
            hex::encode(hasher.finalize())
        };
        assert_eq!(id.to_string(), expected);
    }
}
