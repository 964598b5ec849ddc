//! This crate implements the core logic of the judge: filesystem staging, the
//! output differ, the compilation pipeline and the evaluation engine that
//! drives them over a test-group tree.

#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate log;
extern crate nix;
extern crate sandbox;

pub mod compile;
pub mod differ;
pub mod engine;
pub mod filebase;
pub mod filelinker;

use std::cmp::Ordering;
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use filebase::FileBase;
pub use filelinker::FileLinker;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(::sandbox::Error, ::sandbox::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        /// A path supplied to a `FileBase` resolves outside of its root.
        PathEscape(root: String, path: String) {
            description("path escapes file base root")
            display("path \"{}\" escapes file base root \"{}\"", path, root)
        }

        /// The permission-fix helper (`omogenexec-fixpermissions`) exited non-zero.
        FixPermissionsFailed(status: String) {
            description("fixpermissions helper failed")
            display("omogenexec-fixpermissions exited with {}", status)
        }

        /// A custom validator exited with neither the accept nor the reject code, and did not
        /// time out.
        ValidatorCrashed(output: String) {
            description("validator crashed")
            display("validator exited abnormally: {}", output)
        }

        /// A custom validator failed to finish within its (generous) time limit. Per the error
        /// handling design, this aborts the whole evaluation rather than just the case: a
        /// validator timeout indicates a broken problem setup, not a property of the submission.
        ValidatorTimedOut {
            description("validator timed out")
            display("validator did not finish within its time limit")
        }

        /// A `score.txt` file produced by a scoring validator did not parse as a float.
        MalformedScore(text: String) {
            description("malformed score.txt")
            display("could not parse score.txt contents as a float: \"{}\"", text)
        }

        /// A custom grader's stdout did not match `"<verdict-abbrev> <score>"`.
        MalformedGraderOutput(text: String) {
            description("malformed grader output")
            display("could not parse grader output: \"{}\"", text)
        }

        /// A verdict abbreviation on the grader wire protocol was not one of AC/RTE/TLE/WA.
        UnknownVerdictAbbreviation(text: String) {
            description("unknown verdict abbreviation")
            display("unknown verdict abbreviation: \"{}\"", text)
        }
    }
}

/// A compiled artifact: a root directory, a run-command argument vector, and a language tag.
///
/// The run command may reference `{files}` (source paths, substituted for no-compile languages)
/// and `{main}` (substituted with a discovered entry-point identifier, e.g. by the Java
/// compilation strategy).
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Program {
    /// Root directory under which the program's files live.
    pub root: PathBuf,

    /// Argument vector used to run the program, possibly containing `{files}`/`{main}`
    /// placeholders that the compilation pipeline resolves.
    pub run_command: Vec<String>,

    /// Opaque language tag (e.g. `"cpp"`, `"python3"`), used only for diagnostics here; the
    /// per-language toolchain dispatch that would act on it is out of scope.
    pub language: String,
}

impl Program {
    pub fn new<P, L>(root: P, run_command: Vec<String>, language: L) -> Program
    where
        P: Into<PathBuf>,
        L: Into<String>,
    {
        Program { root: root.into(), run_command, language: language.into() }
    }
}

/// Whether an evaluation runs the program against judge-provided input in one shot (`BATCH`) or
/// concurrently against an interactor (`INTERACTIVE`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PlanType {
    Batch,
    Interactive,
}

/// Everything the evaluation engine needs to judge one submission against one problem.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EvaluationPlan {
    pub program: Program,
    pub validator: Option<Program>,
    pub grader: Option<Program>,
    pub cpu_time_limit_ms: u64,
    pub memory_limit_kb: u64,
    pub validator_cpu_time_limit_ms: u64,
    pub validator_memory_limit_kb: u64,
    pub plan_type: PlanType,
    pub scoring_validator: bool,
    pub root: TestGroup,
}

/// How a group combines the numeric scores of its children.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ScoringMode {
    Sum,
    /// Aliased to `Sum`: the original system never divides by child count here, and this crate
    /// preserves that behavior rather than silently "fixing" it into a true average.
    Avg,
    Min,
    Max,
}

/// How a group combines the verdicts of its children.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VerdictMode {
    /// Take the first non-accepted child verdict, in child order.
    FirstError,
    /// Take the worst non-accepted child verdict by the fixed worseness ordering.
    WorstError,
    /// Always accept, regardless of children.
    AlwaysAccept,
}

/// A node of the recursive test-group tree: either a named collection of children with an
/// aggregation policy, or (via [`TestCase`]) a judgeable leaf.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TestGroup {
    pub name: String,
    pub groups: Vec<TestGroup>,
    pub cases: Vec<TestCase>,
    pub break_on_fail: bool,
    pub scoring_mode: ScoringMode,
    pub verdict_mode: VerdictMode,
    pub accept_if_any_accepted: bool,
    pub accept_score: f64,
    pub reject_score: f64,
    pub custom_grading: bool,
    pub grader_flags: Vec<String>,
    pub output_validator_flags: Vec<String>,
    /// Only meaningful on the root group: drop the lexicographically first child (the
    /// conventional `sample` group) from the aggregated result.
    pub ignore_sample: bool,
}

impl TestGroup {
    pub fn new<T: Into<String>>(name: T) -> TestGroup {
        TestGroup {
            name: name.into(),
            groups: Vec::new(),
            cases: Vec::new(),
            break_on_fail: false,
            scoring_mode: ScoringMode::Sum,
            verdict_mode: VerdictMode::FirstError,
            accept_if_any_accepted: false,
            accept_score: 1.0,
            reject_score: 0.0,
            custom_grading: false,
            grader_flags: Vec::new(),
            output_validator_flags: Vec::new(),
            ignore_sample: false,
        }
    }
}

/// A single `(input, reference-output)` pair plus a name, both paths host-absolute and read-only
/// to this system.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TestCase {
    pub name: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// Verdict of one test case or the aggregation of a test group.
///
/// Worseness ordering (used by [`VerdictMode::WorstError`]):
/// `Accepted < RuntimeError < TimeLimitExceeded < WrongAnswer`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Verdict {
    Accepted,
    RuntimeError,
    TimeLimitExceeded,
    WrongAnswer,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    fn worseness_rank(&self) -> u8 {
        match self {
            Verdict::Accepted => 0,
            Verdict::RuntimeError => 1,
            Verdict::TimeLimitExceeded => 2,
            Verdict::WrongAnswer => 3,
        }
    }

    /// Abbreviation used on the grader wire protocol.
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::RuntimeError => "RTE",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::WrongAnswer => "WA",
        }
    }

    pub fn from_abbreviation(s: &str) -> Result<Verdict> {
        match s {
            "AC" => Ok(Verdict::Accepted),
            "RTE" => Ok(Verdict::RuntimeError),
            "TLE" => Ok(Verdict::TimeLimitExceeded),
            "WA" => Ok(Verdict::WrongAnswer),
            other => bail!(ErrorKind::UnknownVerdictAbbreviation(other.to_owned())),
        }
    }
}

impl PartialOrd for Verdict {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Verdict {
    fn cmp(&self, other: &Self) -> Ordering {
        self.worseness_rank().cmp(&other.worseness_rank())
    }
}

/// Whether a [`EvalResult`] describes a single test case or the aggregation of a test group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResultKind {
    TestCase,
    TestGroup,
}

/// A result emitted on the output channel: either a leaf case's outcome or a group's aggregation
/// of its children, in the order described by spec section 5 (children before their parent).
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EvalResult {
    pub kind: ResultKind,
    /// Name of the case or group this result belongs to.
    pub name: String,
    pub verdict: Verdict,
    pub score: f64,
    pub time_usage_ms: u64,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_worseness_ordering_matches_spec() {
        assert!(Verdict::Accepted < Verdict::RuntimeError);
        assert!(Verdict::RuntimeError < Verdict::TimeLimitExceeded);
        assert!(Verdict::TimeLimitExceeded < Verdict::WrongAnswer);
    }

    #[test]
    fn verdict_abbreviation_round_trips() {
        for v in [Verdict::Accepted, Verdict::RuntimeError, Verdict::TimeLimitExceeded, Verdict::WrongAnswer] {
            let abbrev = v.abbreviation();
            assert_eq!(Verdict::from_abbreviation(abbrev).unwrap(), v);
        }
    }

    #[test]
    fn unknown_abbreviation_is_an_error() {
        assert!(Verdict::from_abbreviation("XX").is_err());
    }
}
