//! This crate implements the judge's bridge to the external sandbox binary
//! (`omogenexec` or a compatible replacement).
//!
//! The sandbox itself -- cgroup/namespace isolation, resource accounting,
//! syscall restriction -- is implemented by a separately developed setuid
//! helper binary that this crate does not re-implement. What this crate owns
//! is:
//!
//! * launch argument construction for that external binary (`launch`);
//! * the small line protocol used to send it commands and read back exit
//!   classification and resource usage (`protocol`);
//! * a controller type that owns the long-lived child process for the
//!   duration of one evaluation (`controller`).

#[macro_use]
extern crate error_chain;
extern crate libc;

mod controller;
mod launch;
mod protocol;

pub use controller::Controller;
pub use launch::{LaunchArgs, COMPILE_PID_LIMIT, DEFAULT_PID_LIMIT};
pub use protocol::{ExecResult, ExitType};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        /// The sandbox binary could not be spawned at all.
        SandboxMissing(path: String) {
            description("sandbox binary missing")
            display("could not launch sandbox binary at \"{}\"", path)
        }

        /// The sandbox died, or closed its reply stream, before a reply was fully read.
        SandboxDied(logs: String) {
            description("sandbox died")
            display("sandbox process died unexpectedly, captured stderr: {}", logs)
        }

        /// The sandbox reported that a command died during its own setup phase.
        SetupFailed(logs: String) {
            description("sandbox run died during setup")
            display("sandbox run died during setup, captured stderr: {}", logs)
        }

        /// The reply stream contained a token this crate does not understand. This indicates a
        /// version mismatch between this crate and the sandbox binary and is not recoverable.
        ProtocolError(token: String) {
            description("unrecognized sandbox protocol token")
            display("unrecognized output from sandbox: \"{}\"", token)
        }

        /// A command frame would have exceeded the wire format's argument count limit.
        TooManyArguments(count: usize) {
            description("too many arguments for one command frame")
            display("command frame has {} arguments, limit is 255", count)
        }

        /// `Controller::run` was called after `finish`, or some other lifecycle violation.
        ControllerMisuse(what: String) {
            description("sandbox controller used incorrectly")
            display("sandbox controller misuse: {}", what)
        }
    }
}

/// Measurement of the size of a block of memory, expressed in whichever unit is natural at the
/// call site. All conversions go through kilobytes, the unit the sandbox protocol reports in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemorySize {
    KiloBytes(u64),
    MegaBytes(u64),
}

impl MemorySize {
    pub fn as_kb(self) -> u64 {
        match self {
            MemorySize::KiloBytes(kb) => kb,
            MemorySize::MegaBytes(mb) => mb * 1000,
        }
    }

    pub fn as_mb(self) -> u64 {
        match self {
            MemorySize::KiloBytes(kb) => (kb + 999) / 1000,
            MemorySize::MegaBytes(mb) => mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_size_conversions_round_trip_on_exact_multiples() {
        let mb = MemorySize::MegaBytes(256);
        assert_eq!(mb.as_kb(), 256_000);
        assert_eq!(mb.as_mb(), 256);
    }

    #[test]
    fn memory_size_as_mb_rounds_up() {
        let kb = MemorySize::KiloBytes(1);
        assert_eq!(kb.as_mb(), 1);
    }
}
