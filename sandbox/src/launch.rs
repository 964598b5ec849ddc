//! Launch argument construction for the external sandbox binary.
//!
//! Mirrors `newSandbox` and `mountArgs` in `omogenexec`'s `eval/sandbox.go`:
//! the same flags, the same defaults, and the same writable-first mount
//! ordering.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default PID limit applied to an ordinary (non-compilation) run.
pub const DEFAULT_PID_LIMIT: u32 = 10;

/// PID limit applied while running a compiler, which may legitimately spawn helper processes.
pub const COMPILE_PID_LIMIT: u32 = 30;

const DEFAULT_INODE_LIMIT: u64 = 1000;
const BLOCK_SIZE: u64 = 4096;
const DEFAULT_BLOCK_LIMIT_BYTES: u64 = 1_000_000_000;

/// A single filesystem path the sandboxed process is allowed to see, and whether it may write to
/// it.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Mount {
    path: PathBuf,
    writable: bool,
}

/// Builder for the arguments passed on the external sandbox binary's command line.
///
/// One `LaunchArgs` corresponds to one sandbox instance; it is consumed by `Controller::start`.
#[derive(Clone, Debug)]
pub struct LaunchArgs {
    sandbox_id: u32,
    cpu_time_limit_ms: u64,
    memory_limit_mb: u64,
    pid_limit: u32,
    inode_limit: u64,
    block_limit: u64,
    working_dir: Option<PathBuf>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    mounts: Vec<Mount>,
}

impl LaunchArgs {
    /// Start building launch arguments for the given sandbox slot and CPU/memory limits.
    ///
    /// `pid_limit` defaults to [`DEFAULT_PID_LIMIT`]; callers compiling untrusted source should
    /// raise it to [`COMPILE_PID_LIMIT`] via [`LaunchArgs::pid_limit`].
    pub fn new(sandbox_id: u32, cpu_time_limit_ms: u64, memory_limit_mb: u64) -> Self {
        LaunchArgs {
            sandbox_id,
            cpu_time_limit_ms,
            memory_limit_mb,
            pid_limit: DEFAULT_PID_LIMIT,
            inode_limit: DEFAULT_INODE_LIMIT,
            block_limit: DEFAULT_BLOCK_LIMIT_BYTES / BLOCK_SIZE,
            working_dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
            mounts: Vec::new(),
        }
    }

    /// The sandbox's own wall clock limit is derived from the CPU limit, never set directly:
    /// `2 * cpu + 1000` milliseconds, matching `newSandbox` in the original. A process that is
    /// merely sleeping (not spinning) is given twice its CPU budget, plus a second of slack,
    /// before the sandbox kills it for running too long in wall-clock time.
    fn wall_time_limit_ms(&self) -> u64 {
        2 * self.cpu_time_limit_ms + 1000
    }

    pub fn pid_limit(mut self, limit: u32) -> Self {
        self.pid_limit = limit;
        self
    }

    pub fn working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Redirect the sandboxed process's stdin from `path`. The containing directory is
    /// automatically added to the readable mount set.
    pub fn stdin<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let path = path.into();
        self.add_containing_dir(&path, false);
        self.stdin = Some(path);
        self
    }

    /// Redirect the sandboxed process's stdout to `path`. The containing directory is
    /// automatically added to the writable mount set.
    pub fn stdout<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let path = path.into();
        self.add_containing_dir(&path, true);
        self.stdout = Some(path);
        self
    }

    /// Redirect the sandboxed process's stderr to `path`. The containing directory is
    /// automatically added to the writable mount set.
    pub fn stderr<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let path = path.into();
        self.add_containing_dir(&path, true);
        self.stderr = Some(path);
        self
    }

    /// Mount `path` readable (but not writable) inside the sandbox, unless it is already mounted
    /// writable.
    pub fn readable<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.mounts.push(Mount { path: path.into(), writable: false });
        self
    }

    /// Mount `path` writable inside the sandbox.
    pub fn writable<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.mounts.push(Mount { path: path.into(), writable: true });
        self
    }

    fn add_containing_dir(&mut self, path: &Path, writable: bool) {
        if let Some(parent) = path.parent() {
            self.mounts.push(Mount { path: parent.to_path_buf(), writable });
        }
    }

    /// Render the de-duplicated, writable-first mount arguments: for a path that was requested
    /// both writable and read-only, the writable request wins, matching `mountArgs` in the
    /// original.
    fn mount_args(&self) -> Vec<String> {
        let mut writable_seen = HashSet::new();
        let mut out = Vec::new();

        for mount in self.mounts.iter().filter(|m| m.writable) {
            if writable_seen.insert(mount.path.clone()) {
                out.push("--writable".to_owned());
                out.push(mount.path.to_string_lossy().into_owned());
            }
        }

        let mut readable_seen = HashSet::new();
        for mount in self.mounts.iter().filter(|m| !m.writable) {
            if writable_seen.contains(&mount.path) {
                continue;
            }
            if readable_seen.insert(mount.path.clone()) {
                out.push("--readable".to_owned());
                out.push(mount.path.to_string_lossy().into_owned());
            }
        }

        out
    }

    /// Render the full argument vector to pass to the sandbox binary, in the order
    /// `eval/sandbox.go`'s `newSandbox` builds them.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--sandbox-id".to_owned(),
            self.sandbox_id.to_string(),
            "--time-lim-ms".to_owned(),
            self.cpu_time_limit_ms.to_string(),
            "--wall-time-lim-ms".to_owned(),
            self.wall_time_limit_ms().to_string(),
            "--memory-mb".to_owned(),
            self.memory_limit_mb.to_string(),
            "--pid-limit".to_owned(),
            self.pid_limit.to_string(),
            "--inodes".to_owned(),
            self.inode_limit.to_string(),
            "--blocks".to_owned(),
            self.block_limit.to_string(),
        ];

        if let Some(dir) = &self.working_dir {
            args.push("--working-dir".to_owned());
            args.push(dir.to_string_lossy().into_owned());
        }
        if let Some(path) = &self.stdin {
            args.push("--stdin".to_owned());
            args.push(path.to_string_lossy().into_owned());
        }
        if let Some(path) = &self.stdout {
            args.push("--stdout".to_owned());
            args.push(path.to_string_lossy().into_owned());
        }
        if let Some(path) = &self.stderr {
            args.push("--stderr".to_owned());
            args.push(path.to_string_lossy().into_owned());
        }

        args.extend(self.mount_args());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_time_limit_is_derived_from_cpu_limit() {
        let args = LaunchArgs::new(0, 1000, 256);
        assert!(args.to_args().windows(2).any(|w| w[0] == "--wall-time-lim-ms" && w[1] == "3000"));
    }

    #[test]
    fn default_pid_limit_is_ten() {
        let args = LaunchArgs::new(0, 1000, 256);
        assert!(args.to_args().windows(2).any(|w| w[0] == "--pid-limit" && w[1] == "10"));
    }

    #[test]
    fn compile_pid_limit_overrides_default() {
        let args = LaunchArgs::new(0, 1000, 256).pid_limit(COMPILE_PID_LIMIT);
        assert!(args.to_args().windows(2).any(|w| w[0] == "--pid-limit" && w[1] == "30"));
    }

    #[test]
    fn stdin_adds_containing_dir_as_readable() {
        let args = LaunchArgs::new(0, 1000, 256).stdin("/box/in/input.txt");
        let rendered = args.to_args();
        let idx = rendered.iter().position(|a| a == "--readable").unwrap();
        assert_eq!(rendered[idx + 1], "/box/in");
    }

    #[test]
    fn writable_mount_wins_over_readable_duplicate() {
        let args = LaunchArgs::new(0, 1000, 256)
            .readable("/box/work")
            .writable("/box/work");
        let rendered = args.mount_args();
        assert_eq!(rendered, vec!["--writable".to_owned(), "/box/work".to_owned()]);
    }

    #[test]
    fn mount_args_puts_writable_paths_before_readable() {
        let args = LaunchArgs::new(0, 1000, 256)
            .readable("/box/ro")
            .writable("/box/rw");
        let rendered = args.mount_args();
        assert_eq!(
            rendered,
            vec![
                "--writable".to_owned(), "/box/rw".to_owned(),
                "--readable".to_owned(), "/box/ro".to_owned(),
            ]
        );
    }
}
