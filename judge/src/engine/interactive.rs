//! FIFO plumbing for interactive evaluation: two judge-created named pipes connect the
//! contestant's program and the validator's stdio, each kept open from the host side so neither
//! sandboxed process can observe a premature EOF while the other has not yet opened its end.
//!
//! Grounded in the pipe setup described for interactive judging (`runner/interactive.go` in the
//! original implementation).

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::Result;

/// A named pipe plus a host-held read/write descriptor on it.
///
/// Opening a FIFO for read-only (or write-only) blocks until a peer opens the other end; holding
/// our own `O_RDWR` handle means that open always has a peer, so neither sandboxed process's
/// `open()` on the path can deadlock, and the pipe does not report EOF just because one side's
/// process has exited while the other is still mid-read.
pub struct Fifo {
    pub path: PathBuf,
    _keep_alive: File,
}

/// Create a fresh FIFO at `path`, replacing any stale node left over from a previous case.
pub fn create_fifo(path: &Path) -> Result<Fifo> {
    let _ = fs::remove_file(path);
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP)
        .map_err(|e| {
            crate::Error::from(
                e.as_errno()
                    .map(std::io::Error::from)
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
            )
        })?;
    let keep_alive = OpenOptions::new().read(true).write(true).open(path)?;
    Ok(Fifo { path: path.to_owned(), _keep_alive: keep_alive })
}
