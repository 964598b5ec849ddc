//! Wire protocol spoken with the external sandbox binary over its stdin/stdout pipes.
//!
//! A command is one frame: a field count byte (`n <= 255`) followed by `n`
//! NUL-terminated strings (`cmd`, then its arguments). A reply is a sequence
//! of whitespace-separated tokens terminated by the literal token `done`:
//! `killed tle|setup`, `code <int>`, `signal <int>`, `mem <bytes>`,
//! `cpu <ms>`. Every field of `ExecResult` starts at its zero value and is
//! filled in as matching tokens are read.

use std::io::Write;

use crate::{ErrorKind, Result};

/// Encode one command and its arguments as a wire frame and write it to `out`.
///
/// Returns [`ErrorKind::TooManyArguments`] if `cmd` plus `args` would exceed the wire format's
/// 255-field limit.
pub fn write_command<W: Write>(out: &mut W, cmd: &str, args: &[&str]) -> Result<()> {
    let field_count = 1 + args.len();
    if field_count > 255 {
        bail!(ErrorKind::TooManyArguments(field_count));
    }

    out.write_all(&[field_count as u8])?;
    out.write_all(cmd.as_bytes())?;
    out.write_all(&[0u8])?;
    for arg in args {
        out.write_all(arg.as_bytes())?;
        out.write_all(&[0u8])?;
    }
    out.flush()?;
    Ok(())
}

/// How a sandboxed run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExitType {
    /// The process ran to completion and exited with a code.
    Exited,
    /// The process was killed by the delivery of a signal.
    Signaled,
    /// The sandbox killed the process for exceeding its CPU or wall-clock time limit.
    TimedOut,
}

/// The outcome of running one command inside the sandbox: how it exited and what it used.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecResult {
    pub exit_type: ExitType,
    pub exit_code: i32,
    pub signal: i32,
    pub memory_usage_kb: u64,
    pub cpu_time_ms: u64,
}

impl ExecResult {
    /// Does `exit_code` match, for a process that ran to completion?
    pub fn crashed_with(&self, code: i32) -> bool {
        self.exit_type == ExitType::Exited && self.exit_code == code
    }

    /// Did the process die from a signal, rather than exiting on its own?
    pub fn crashed(&self) -> bool {
        self.exit_type == ExitType::Signaled
    }

    /// Did the sandbox kill the process for running too long?
    pub fn timed_out(&self) -> bool {
        self.exit_type == ExitType::TimedOut
    }
}

/// Parse one reply from a stream of whitespace-separated tokens, up to and including the
/// terminating `done` token.
///
/// `killed setup` is reported as [`ErrorKind::SetupFailed`] rather than folded into a normal
/// `ExecResult`, matching the original's `logger.Fatalf` treatment of a setup failure: a judge
/// host cannot usefully continue an evaluation whose sandbox failed to even start the command.
pub fn read_reply<I>(mut tokens: I, stderr_log: &str) -> Result<ExecResult>
where
    I: Iterator<Item = String>,
{
    let mut exit_type = None;
    let mut exit_code = 0;
    let mut signal = 0;
    let mut memory_usage_kb = 0;
    let mut cpu_time_ms = 0;

    loop {
        let token = tokens
            .next()
            .ok_or_else(|| ErrorKind::SandboxDied(stderr_log.to_owned()))?;

        match token.as_str() {
            "done" => break,
            "killed" => {
                let reason = tokens
                    .next()
                    .ok_or_else(|| ErrorKind::SandboxDied(stderr_log.to_owned()))?;
                match reason.as_str() {
                    "tle" => exit_type = Some(ExitType::TimedOut),
                    "setup" => bail!(ErrorKind::SetupFailed(stderr_log.to_owned())),
                    other => bail!(ErrorKind::ProtocolError(format!("killed {}", other))),
                }
            }
            "code" => {
                let value = next_int(&mut tokens, stderr_log)?;
                exit_type = Some(ExitType::Exited);
                exit_code = value;
            }
            "signal" => {
                let value = next_int(&mut tokens, stderr_log)?;
                exit_type = Some(ExitType::Signaled);
                signal = value;
            }
            "mem" => {
                let bytes = next_u64(&mut tokens, stderr_log)?;
                memory_usage_kb = bytes / 1000;
            }
            "cpu" => {
                cpu_time_ms = next_u64(&mut tokens, stderr_log)?;
            }
            other => bail!(ErrorKind::ProtocolError(other.to_owned())),
        }
    }

    let exit_type = exit_type.ok_or_else(|| ErrorKind::ProtocolError("done".to_owned()))?;
    Ok(ExecResult { exit_type, exit_code, signal, memory_usage_kb, cpu_time_ms })
}

fn next_int<I: Iterator<Item = String>>(tokens: &mut I, stderr_log: &str) -> Result<i32> {
    let token = tokens.next().ok_or_else(|| ErrorKind::SandboxDied(stderr_log.to_owned()))?;
    token
        .parse()
        .map_err(|_| ErrorKind::ProtocolError(token).into())
}

fn next_u64<I: Iterator<Item = String>>(tokens: &mut I, stderr_log: &str) -> Result<u64> {
    let token = tokens.next().ok_or_else(|| ErrorKind::SandboxDied(stderr_log.to_owned()))?;
    token
        .parse()
        .map_err(|_| ErrorKind::ProtocolError(token).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> impl Iterator<Item = String> + '_ {
        s.split_whitespace().map(|t| t.to_owned())
    }

    #[test]
    fn write_command_encodes_field_count_and_nul_terminated_args() {
        let mut buf = Vec::new();
        write_command(&mut buf, "run", &["/bin/echo", "hi"]).unwrap();
        assert_eq!(buf[0], 3u8);
        assert_eq!(&buf[1..], b"run\0/bin/echo\0hi\0");
    }

    #[test]
    fn write_command_rejects_more_than_255_fields() {
        let args: Vec<String> = (0..255).map(|i| i.to_string()).collect();
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let mut buf = Vec::new();
        let result = write_command(&mut buf, "run", &arg_refs);
        assert!(result.is_err());
    }

    #[test]
    fn read_reply_parses_normal_exit() {
        let result = read_reply(tokens("code 0 mem 1024000 cpu 15 done"), "").unwrap();
        assert_eq!(result.exit_type, ExitType::Exited);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.memory_usage_kb, 1024);
        assert_eq!(result.cpu_time_ms, 15);
    }

    #[test]
    fn read_reply_parses_signal_death() {
        let result = read_reply(tokens("signal 11 mem 500 cpu 3 done"), "").unwrap();
        assert_eq!(result.exit_type, ExitType::Signaled);
        assert_eq!(result.signal, 11);
        assert!(result.crashed());
    }

    #[test]
    fn read_reply_parses_tle() {
        let result = read_reply(tokens("killed tle mem 500 cpu 1000 done"), "").unwrap();
        assert!(result.timed_out());
    }

    #[test]
    fn read_reply_treats_killed_setup_as_fatal() {
        let result = read_reply(tokens("killed setup done"), "boom");
        assert!(result.is_err());
    }

    #[test]
    fn read_reply_rejects_unknown_token() {
        let result = read_reply(tokens("bogus done"), "");
        assert!(result.is_err());
    }

    #[test]
    fn read_reply_rejects_truncated_stream() {
        let result = read_reply(tokens("code 0 mem"), "log output");
        assert!(result.is_err());
    }
}
