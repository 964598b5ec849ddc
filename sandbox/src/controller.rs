//! Owns the external sandbox binary's child process for the lifetime of one sandbox slot.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use log::{trace, warn};

use crate::launch::LaunchArgs;
use crate::protocol::{self, ExecResult};
use crate::{Error, ErrorKind, Result};

/// A running instance of the external sandbox binary, ready to accept commands.
///
/// Created by [`Controller::start`], which spawns the binary with the arguments built from a
/// [`LaunchArgs`] and keeps its stdin/stdout open for the `run`/`done` exchange described in
/// [`protocol`]. Call [`Controller::finish`] exactly once when the sandbox is no longer needed.
pub struct Controller {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    finished: bool,
}

impl Controller {
    /// Launch the sandbox binary at `binary_path` with the given arguments.
    pub fn start(binary_path: &str, args: &LaunchArgs) -> Result<Controller> {
        let mut child = Command::new(binary_path)
            .args(args.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| ErrorKind::SandboxMissing(binary_path.to_owned()))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));

        trace!("sandbox controller started: {}", binary_path);

        Ok(Controller { child, stdin: Some(stdin), stdout, finished: false })
    }

    /// Run one command inside the sandbox and block for its result.
    ///
    /// `cmd` is the program to execute; `args` are its arguments, exactly as they will be passed
    /// to the sandboxed process. Fails with [`ErrorKind::ControllerMisuse`] if called after
    /// [`Controller::finish`].
    pub fn run(&mut self, cmd: &str, args: &[&str]) -> Result<ExecResult> {
        if self.finished {
            bail!(ErrorKind::ControllerMisuse("run called after finish".to_owned()));
        }

        let stdin = self.stdin.as_mut().expect("stdin live until finish");
        protocol::write_command(stdin, cmd, args)?;
        trace!("sandbox command sent: {} {:?}", cmd, args);

        let mut tokens = Vec::new();
        loop {
            let mut line = String::new();
            let read = self.stdout.read_line(&mut line)?;
            if read == 0 {
                let logs = self.drain_stderr();
                return Err(Error::from(ErrorKind::SandboxDied(logs)));
            }
            let is_done = line.split_whitespace().any(|t| t == "done");
            tokens.extend(line.split_whitespace().map(|t| t.to_owned()));
            if is_done {
                break;
            }
        }

        let result = protocol::read_reply(tokens.into_iter(), "");
        match &result {
            Ok(r) => trace!("sandbox reply: {:?}", r),
            Err(e) => warn!("sandbox protocol error: {}", e),
        }
        result
    }

    /// Close the sandbox's stdin and wait for the process to exit. Idempotent: calling it more
    /// than once is a no-op after the first call.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        // Taking and dropping `stdin` closes the write end of the pipe, which is what actually
        // produces EOF on the child's stdin; the sandbox binary is expected to exit once it
        // observes that EOF.
        drop(self.stdin.take());
        self.child.wait()?;
        Ok(())
    }

    fn drain_stderr(&mut self) -> String {
        match self.child.stderr.take() {
            Some(stderr) => {
                let mut reader = BufReader::new(stderr);
                let mut buf = String::new();
                use std::io::Read;
                let _ = reader.read_to_string(&mut buf);
                buf
            }
            None => String::new(),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish();
        }
    }
}
