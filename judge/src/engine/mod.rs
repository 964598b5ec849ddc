//! Drives the test-group tree: ordering, caching, per-case execution (batch or interactive),
//! validator invocation, verdict/score merging, custom grader invocation.
//!
//! Grounded in `Evaluator` (`eval/eval.go` in the original implementation), which is the fuller,
//! more authoritative revision of the evaluator compared to the earlier `judgehost/eval.go`.

mod interactive;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{self, Sender};
use std::thread;

use log::{info, trace, warn};

use sandbox::{Controller, LaunchArgs};

use crate::filebase::FileBase;
use crate::filelinker::FileLinker;
use crate::{
    Error, ErrorKind, EvalResult, EvaluationPlan, PlanType, Program, Result, ResultKind, ScoringMode,
    TestCase, TestGroup, Verdict, VerdictMode,
};

/// A channel over which the evaluator streams per-case and per-group results as they become
/// available. Backpressure is the consumer's problem; dropped once the root group finishes.
pub type ResultSink = Sender<EvalResult>;

/// Paths and policy knobs a judge host must be able to point at its own install, generalizing
/// the fixed constants `omogenexec` bakes in.
#[derive(Clone, Debug)]
pub struct JudgeEngineConfig {
    pub sandbox_binary: PathBuf,
    pub fixpermissions_binary: PathBuf,
    pub judge_gid: Option<u32>,
    pub grader_cpu_time_limit_ms: u64,
    pub grader_memory_limit_mb: u64,
}

impl Default for JudgeEngineConfig {
    fn default() -> Self {
        JudgeEngineConfig {
            sandbox_binary: PathBuf::from("/usr/bin/omogenexec"),
            fixpermissions_binary: PathBuf::from("/usr/bin/omogenexec-fixpermissions"),
            judge_gid: None,
            grader_cpu_time_limit_ms: 60_000,
            grader_memory_limit_mb: 1024,
        }
    }
}

/// Identifies a case's judging by the facts the engine considers sufficient for cache reuse
/// (spec invariant: two cases with identical keys must yield identical case-level results before
/// group-specific score substitution).
type CacheKey = (PathBuf, PathBuf, String);

/// The reusable part of a case's outcome: a verdict plus, when the validator is scoring, the
/// score it produced. The group-relative accept/reject score is deliberately not baked in here
/// so the same record can feed both the live path and cache hits through one helper.
#[derive(Clone, Debug)]
struct CaseOutcome {
    verdict: Verdict,
    validator_score: Option<f64>,
    time_usage_ms: u64,
    message: Option<String>,
}

/// Drives one submission's evaluation against one plan's test-group tree.
pub struct Evaluator {
    config: JudgeEngineConfig,
    plan: EvaluationPlan,
    root: FileBase,

    program_linker: FileLinker,
    program_sandbox: Controller,

    validator_linker: Option<FileLinker>,
    validator_sandbox: Option<Controller>,
    validator_command: Option<Vec<String>>,
    validator_feedback_dir: Option<PathBuf>,

    grader_linker: Option<FileLinker>,
    grader_sandbox: Option<Controller>,
    grader_command: Option<Vec<String>>,

    interactive_dir: Option<PathBuf>,

    cache: HashMap<CacheKey, CaseOutcome>,
}

impl Evaluator {
    /// Set up filelinkers and launch the program/validator/grader sandboxes for one evaluation.
    /// `eval_root` is a fresh directory that will hold `env/`, `valenv/`, `graderenv/`,
    /// `interactive/` and the per-case `case-<name>/` directories.
    pub fn new(config: JudgeEngineConfig, plan: EvaluationPlan, eval_root: &Path) -> Result<Evaluator> {
        run_fixpermissions(&config, eval_root, "before")?;

        let root = FileBase::new(eval_root, None, config.judge_gid)?;

        let interactive_dir = if plan.plan_type == PlanType::Interactive {
            Some(root.sub_base("interactive")?.root().to_path_buf())
        } else {
            None
        };

        let program_base = root.sub_base("env")?;
        let program_linker = FileLinker::new(&program_base)?;
        let program_sandbox =
            start_program_sandbox(&config, &plan, &program_linker, interactive_dir.as_deref())?;

        let (validator_linker, validator_sandbox, validator_command, validator_feedback_dir) =
            match &plan.validator {
                Some(validator) => {
                    let base = root.sub_base("valenv")?;
                    let linker = FileLinker::new(&base)?;
                    let feedback_dir = base.sub_base("feedback")?.root().to_path_buf();
                    let sandbox = start_jury_sandbox(
                        &config,
                        2,
                        validator,
                        plan.validator_cpu_time_limit_ms,
                        plan.validator_memory_limit_kb,
                        interactive_dir.as_deref(),
                    )?;
                    let command = build_validator_command(validator, &linker, &feedback_dir);
                    (Some(linker), Some(sandbox), Some(command), Some(feedback_dir))
                }
                None => (None, None, None, None),
            };

        let (grader_linker, grader_sandbox, grader_command) = match &plan.grader {
            Some(grader) => {
                let base = root.sub_base("graderenv")?;
                let linker = FileLinker::new(&base)?;
                let sandbox = start_jury_sandbox(
                    &config,
                    3,
                    grader,
                    config.grader_cpu_time_limit_ms,
                    config.grader_memory_limit_mb * 1000,
                    None,
                )?;
                (Some(linker), Some(sandbox), Some(grader.run_command.clone()))
            }
            None => (None, None, None),
        };

        Ok(Evaluator {
            config,
            plan,
            root,
            program_linker,
            program_sandbox,
            validator_linker,
            validator_sandbox,
            validator_command,
            validator_feedback_dir,
            grader_linker,
            grader_sandbox,
            grader_command,
            interactive_dir,
            cache: HashMap::new(),
        })
    }

    /// Evaluate the whole plan, streaming results to `sink` as they become available, and return
    /// the aggregated top-level result. The sink is dropped (closing the channel) once the root
    /// group finishes.
    pub fn evaluate(mut self, sink: ResultSink) -> Result<EvalResult> {
        let root_group = self.plan.root.clone();
        let result = self.evaluate_group(&root_group, &sink, true);

        let eval_root = self.root.root().to_path_buf();
        self.finish_sandboxes();
        run_fixpermissions(&self.config, &eval_root, "after")?;

        result
    }

    fn finish_sandboxes(&mut self) {
        if let Err(e) = self.program_sandbox.finish() {
            warn!("program sandbox finish failed: {}", e);
        }
        if let Some(s) = self.validator_sandbox.as_mut() {
            if let Err(e) = s.finish() {
                warn!("validator sandbox finish failed: {}", e);
            }
        }
        if let Some(s) = self.grader_sandbox.as_mut() {
            if let Err(e) = s.finish() {
                warn!("grader sandbox finish failed: {}", e);
            }
        }
    }

    fn evaluate_group(&mut self, group: &TestGroup, sink: &ResultSink, is_root: bool) -> Result<EvalResult> {
        trace!("entering group \"{}\"", group.name);

        let mut children = gather_children(group);
        children.sort_by(|a, b| a.name().cmp(b.name()));

        let mut results = Vec::with_capacity(children.len());
        for child in &children {
            let result = match child {
                Child::Group(g) => self.evaluate_group(g, sink, false)?,
                Child::Case(c) => self.evaluate_case(c, group, sink)?,
            };
            let non_accepted = !result.verdict.is_accepted();
            results.push(result);
            if non_accepted && group.break_on_fail {
                break;
            }
        }

        let mut for_aggregation = results.clone();
        if is_root && group.ignore_sample && !for_aggregation.is_empty() {
            for_aggregation.remove(0);
        }

        let (verdict, score, time_usage_ms) = if group.custom_grading {
            self.custom_grade(group, &for_aggregation)?
        } else {
            default_grade(group, &for_aggregation)
        };

        let result = EvalResult {
            kind: ResultKind::TestGroup,
            name: group.name.clone(),
            verdict,
            score,
            time_usage_ms,
            message: None,
        };

        sink.send(result.clone())
            .map_err(|_| Error::from("result consumer disconnected"))?;

        Ok(result)
    }

    fn evaluate_case(&mut self, case: &TestCase, group: &TestGroup, sink: &ResultSink) -> Result<EvalResult> {
        let key: CacheKey = (
            case.input_path.clone(),
            case.output_path.clone(),
            group.output_validator_flags.join(" "),
        );

        let outcome = if let Some(cached) = self.cache.get(&key) {
            trace!("cache hit for case \"{}\"", case.name);
            cached.clone()
        } else {
            let fresh = match self.plan.plan_type {
                PlanType::Batch => self.evaluate_case_batch(case, group)?,
                PlanType::Interactive => self.evaluate_case_interactive(case, group)?,
            };
            self.cache.insert(key, fresh.clone());
            fresh
        };

        let score = score_for_group(&outcome, group);
        let result = EvalResult {
            kind: ResultKind::TestCase,
            name: case.name.clone(),
            verdict: outcome.verdict,
            score,
            time_usage_ms: outcome.time_usage_ms,
            message: outcome.message,
        };

        sink.send(result.clone())
            .map_err(|_| Error::from("result consumer disconnected"))?;

        Ok(result)
    }

    fn evaluate_case_batch(&mut self, case: &TestCase, group: &TestGroup) -> Result<CaseOutcome> {
        let case_dir = self.root.sub_base(format!("case-{}", case.name))?;

        self.program_linker.link_file(&case.input_path, "input", false)?;
        self.program_linker.create_empty("output")?;
        self.program_linker.create_empty("error")?;

        let argv = self.plan.program.run_command.clone();
        let args: Vec<&str> = argv.iter().skip(1).map(|s| s.as_str()).collect();
        let exec = self.program_sandbox.run(&argv[0], &args)?;

        let output_path = self.program_linker.path_for("output", true);
        let error_path = self.program_linker.path_for("error", true);
        case_dir.link_into(&output_path, "output")?;
        case_dir.link_into(&error_path, "error")?;

        let outcome = if exec.timed_out() {
            CaseOutcome {
                verdict: Verdict::TimeLimitExceeded,
                validator_score: None,
                time_usage_ms: exec.cpu_time_ms,
                message: None,
            }
        } else if exec.crashed() || !exec.crashed_with(0) {
            CaseOutcome {
                verdict: Verdict::RuntimeError,
                validator_score: None,
                time_usage_ms: exec.cpu_time_ms,
                message: None,
            }
        } else {
            let team_output = self.program_linker.read_write_side("output")?;
            let (accepted, validator_score, message) =
                self.check_acceptance(case, group, &case_dir, &team_output)?;
            CaseOutcome {
                verdict: if accepted { Verdict::Accepted } else { Verdict::WrongAnswer },
                validator_score,
                time_usage_ms: exec.cpu_time_ms,
                message,
            }
        };

        self.program_linker.clear()?;
        if let Some(linker) = &self.validator_linker {
            linker.clear()?;
        }

        Ok(outcome)
    }

    /// Decide whether `team_output` is accepted: by custom validator if configured, else by the
    /// output differ against the case's reference answer.
    fn check_acceptance(
        &mut self,
        case: &TestCase,
        group: &TestGroup,
        case_dir: &FileBase,
        team_output: &[u8],
    ) -> Result<(bool, Option<f64>, Option<String>)> {
        if self.validator_command.is_some() {
            self.run_validator(case, group, case_dir, team_output)
        } else {
            let reference = std::fs::read(&case.output_path)?;
            let args = crate::differ::DiffArgs::parse(&group.output_validator_flags);
            let result = crate::differ::diff(&reference, team_output, &args);
            match result {
                crate::differ::DiffResult::Match => Ok((true, None, None)),
                crate::differ::DiffResult::Mismatch { message } => Ok((false, None, Some(message))),
            }
        }
    }

    /// Run the custom validator for a batch case: link input/team-output/judge-answer, invoke
    /// it, and interpret its exit code per the Kattis validator API (42 = accept, 43 = reject,
    /// anything else that isn't a timeout is a fatal evaluation error).
    fn run_validator(
        &mut self,
        case: &TestCase,
        group: &TestGroup,
        case_dir: &FileBase,
        team_output: &[u8],
    ) -> Result<(bool, Option<f64>, Option<String>)> {
        let linker = self.validator_linker.as_ref().expect("validator configured");
        linker.link_file(&case.input_path, "input", false)?;
        linker.link_file(&case.output_path, "judge_answer", false)?;

        let team_output_path = case_dir.write_file("team_output", team_output)?;
        linker.link_file(&team_output_path, "team_output", false)?;

        let mut argv = self.validator_command.clone().expect("validator configured");
        argv.extend(group.output_validator_flags.iter().cloned());

        let args: Vec<&str> = argv.iter().skip(1).map(|s| s.as_str()).collect();
        let sandbox = self.validator_sandbox.as_mut().expect("validator configured");
        let exec = sandbox.run(&argv[0], &args)?;

        let (outcome, _, message) = self.interpret_validator_exit(&exec)?;
        let feedback_dir = self.validator_feedback_dir.clone().expect("validator configured");
        let score = self.read_validator_score(&feedback_dir, outcome)?;
        Ok((outcome, score, message.or_else(|| self.read_validator_message(&feedback_dir))))
    }

    fn interpret_validator_exit(
        &self,
        exec: &sandbox::ExecResult,
    ) -> Result<(bool, Option<f64>, Option<String>)> {
        if exec.timed_out() {
            bail!(ErrorKind::ValidatorTimedOut);
        } else if exec.crashed_with(42) {
            Ok((true, None, None))
        } else if exec.crashed_with(43) {
            Ok((false, None, None))
        } else {
            bail!(ErrorKind::ValidatorCrashed(format!(
                "exit_code={} signal={}",
                exec.exit_code, exec.signal
            )));
        }
    }

    fn read_validator_message(&self, feedback_dir: &Path) -> Option<String> {
        std::fs::read_to_string(feedback_dir.join("judgemessage.txt")).ok()
    }

    fn read_validator_score(&self, feedback_dir: &Path, accepted: bool) -> Result<Option<f64>> {
        if !self.plan.scoring_validator || !accepted {
            return Ok(None);
        }
        match std::fs::read_to_string(feedback_dir.join("score.txt")) {
            Ok(text) => match text.trim().parse::<f64>() {
                Ok(value) => Ok(Some(value)),
                Err(_) => bail!(ErrorKind::MalformedScore(text)),
            },
            Err(_) => {
                info!("scoring validator accepted without producing score.txt");
                Ok(None)
            }
        }
    }

    /// Run program and validator concurrently over a pair of judge-created FIFOs, per section
    /// 4.6.3. When the validator accepts and the program is subsequently killed by `SIGPIPE`
    /// (writing to the now-closed pipe after the validator has already finished reading), the
    /// program's death does not downgrade the verdict.
    fn evaluate_case_interactive(&mut self, case: &TestCase, group: &TestGroup) -> Result<CaseOutcome> {
        let interactive_dir = self.interactive_dir.clone().expect("interactive plan configured");
        let to_program = interactive_dir.join("to_program");
        let to_validator = interactive_dir.join("to_validator");
        let _program_fifo = interactive::create_fifo(&to_program)?;
        let _validator_fifo = interactive::create_fifo(&to_validator)?;

        let validator_linker = self.validator_linker.as_ref().expect("validator configured");
        validator_linker.link_file(&case.input_path, "input", false)?;
        validator_linker.link_file(&case.output_path, "judge_answer", false)?;

        let program_argv = self.plan.program.run_command.clone();
        let mut validator_argv = self.validator_command.clone().expect("validator configured");
        validator_argv.extend(group.output_validator_flags.iter().cloned());

        let program_sandbox = &mut self.program_sandbox;
        let validator_sandbox = self.validator_sandbox.as_mut().expect("validator configured");

        // Which task's sandbox.run() returns first, so the verdict logic below can tell a
        // program crash the validator already judged apart from one it raced ahead of.
        let (order_tx, order_rx) = mpsc::channel::<&'static str>();

        let (program_result, validator_result) = thread::scope(|scope| {
            let program_order_tx = order_tx.clone();
            let program_handle = scope.spawn(move || {
                let args: Vec<&str> = program_argv.iter().skip(1).map(|s| s.as_str()).collect();
                let result = program_sandbox.run(&program_argv[0], &args);
                let _ = program_order_tx.send("program");
                result
            });
            let validator_order_tx = order_tx.clone();
            let validator_handle = scope.spawn(move || {
                let args: Vec<&str> = validator_argv.iter().skip(1).map(|s| s.as_str()).collect();
                let result = validator_sandbox.run(&validator_argv[0], &args);
                let _ = validator_order_tx.send("validator");
                result
            });
            (
                program_handle.join().expect("program thread panicked"),
                validator_handle.join().expect("validator thread panicked"),
            )
        });
        drop(order_tx);
        let validator_first = order_rx.recv() == Ok("validator");

        let program_exec = program_result?;
        let validator_exec = validator_result?;

        let (validator_accepted, _, message) = self.interpret_validator_exit(&validator_exec)?;

        let crashed = program_exec.crashed() || !program_exec.crashed_with(0);

        let verdict = if program_exec.timed_out() {
            Verdict::TimeLimitExceeded
        } else if crashed
            && program_exec.signal != libc::SIGPIPE
            && (!validator_first || validator_accepted)
        {
            Verdict::RuntimeError
        } else if validator_accepted {
            Verdict::Accepted
        } else {
            Verdict::WrongAnswer
        };

        let feedback_dir = self.validator_feedback_dir.clone().expect("validator configured");
        let validator_score = self.read_validator_score(&feedback_dir, verdict.is_accepted())?;
        let message = message.or_else(|| self.read_validator_message(&feedback_dir));

        self.validator_linker.as_ref().unwrap().clear()?;

        Ok(CaseOutcome { verdict, validator_score, time_usage_ms: program_exec.cpu_time_ms, message })
    }

    fn custom_grade(&mut self, group: &TestGroup, children: &[EvalResult]) -> Result<(Verdict, f64, u64)> {
        let mut input = String::new();
        for child in children {
            input.push_str(child.verdict.abbreviation());
            input.push(' ');
            input.push_str(&child.score.to_string());
            input.push('\n');
        }

        let linker = self.grader_linker.as_ref().expect("grader configured");
        let input_path = linker.path_for("input", true);
        std::fs::write(&input_path, input.as_bytes())?;
        linker.create_empty("output")?;

        let mut argv = self.grader_command.clone().expect("grader configured");
        argv.extend(group.grader_flags.iter().cloned());
        let args: Vec<&str> = argv.iter().skip(1).map(|s| s.as_str()).collect();

        let sandbox = self.grader_sandbox.as_mut().expect("grader configured");
        sandbox.run(&argv[0], &args)?;

        let output = linker.read_write_side("output")?;
        let output_text = String::from_utf8_lossy(&output);
        let mut parts = output_text.trim().splitn(2, ' ');
        let verdict_text = parts.next().unwrap_or("").trim();
        let score_text = parts.next().unwrap_or("").trim();

        let verdict = Verdict::from_abbreviation(verdict_text)
            .map_err(|_| Error::from(ErrorKind::MalformedGraderOutput(output_text.clone().into_owned())))?;
        let score: f64 = score_text
            .parse()
            .map_err(|_| Error::from(ErrorKind::MalformedGraderOutput(output_text.into_owned())))?;

        linker.clear()?;

        let time_usage_ms = children.iter().map(|c| c.time_usage_ms).max().unwrap_or(0);
        Ok((verdict, score, time_usage_ms))
    }
}

/// One element the group traversal visits, either another group or a leaf case.
enum Child<'a> {
    Group(&'a TestGroup),
    Case(&'a TestCase),
}

impl<'a> Child<'a> {
    fn name(&self) -> &str {
        match self {
            Child::Group(g) => &g.name,
            Child::Case(c) => &c.name,
        }
    }
}

fn gather_children(group: &TestGroup) -> Vec<Child<'_>> {
    let mut children: Vec<Child<'_>> = group.groups.iter().map(Child::Group).collect();
    children.extend(group.cases.iter().map(Child::Case));
    children
}

/// Re-apply the group-relative accept/reject score to a case outcome. Used for both the live
/// evaluation path and cache hits, so the two can never drift (spec property P4).
fn score_for_group(outcome: &CaseOutcome, group: &TestGroup) -> f64 {
    match outcome.validator_score {
        Some(score) => score,
        None => {
            if outcome.verdict.is_accepted() {
                group.accept_score
            } else {
                group.reject_score
            }
        }
    }
}

/// Default (non-custom-grader) aggregation of a group's children: verdict by `VerdictMode`,
/// score by `ScoringMode`, time by the maximum over children.
fn default_grade(group: &TestGroup, children: &[EvalResult]) -> (Verdict, f64, u64) {
    let mut verdict = Verdict::Accepted;
    match group.verdict_mode {
        VerdictMode::FirstError => {
            for child in children {
                if !child.verdict.is_accepted() {
                    verdict = child.verdict;
                    break;
                }
            }
        }
        VerdictMode::WorstError => {
            for child in children {
                if !child.verdict.is_accepted() && child.verdict > verdict {
                    verdict = child.verdict;
                }
            }
        }
        VerdictMode::AlwaysAccept => {
            verdict = Verdict::Accepted;
        }
    }

    if !matches!(group.verdict_mode, VerdictMode::AlwaysAccept)
        && group.accept_if_any_accepted
        && children.iter().any(|c| c.verdict.is_accepted())
    {
        verdict = Verdict::Accepted;
    }

    let score = match group.scoring_mode {
        ScoringMode::Sum | ScoringMode::Avg => children.iter().map(|c| c.score).sum(),
        ScoringMode::Min => children.iter().map(|c| c.score).fold(f64::INFINITY, f64::min),
        ScoringMode::Max => children.iter().map(|c| c.score).fold(f64::NEG_INFINITY, f64::max),
    };
    let score = if children.is_empty() { 0.0 } else { score };

    let time_usage_ms = children.iter().map(|c| c.time_usage_ms).max().unwrap_or(0);

    (verdict, score, time_usage_ms)
}

fn start_program_sandbox(
    config: &JudgeEngineConfig,
    plan: &EvaluationPlan,
    linker: &FileLinker,
    interactive_dir: Option<&Path>,
) -> Result<Controller> {
    let memory_limit_mb = (plan.memory_limit_kb + 999) / 1000;
    let mut args = LaunchArgs::new(1, plan.cpu_time_limit_ms, memory_limit_mb)
        .working_dir(&plan.program.root)
        .readable(&plan.program.root);

    args = match interactive_dir {
        Some(dir) => args.writable(dir).stdin(dir.join("to_program")).stdout(dir.join("to_validator")),
        None => args
            .stdin(linker.path_for("input", false))
            .stdout(linker.path_for("output", true))
            .stderr(linker.path_for("error", true)),
    };

    Ok(Controller::start(config.sandbox_binary.to_str().unwrap(), &args)?)
}

fn start_jury_sandbox(
    config: &JudgeEngineConfig,
    sandbox_id: u32,
    program: &Program,
    cpu_time_limit_ms: u64,
    memory_limit_kb: u64,
    interactive_dir: Option<&Path>,
) -> Result<Controller> {
    let memory_limit_mb = (memory_limit_kb + 999) / 1000;
    let mut args = LaunchArgs::new(sandbox_id, cpu_time_limit_ms, memory_limit_mb)
        .working_dir(&program.root)
        .readable(&program.root);

    if let Some(dir) = interactive_dir {
        args = args.writable(dir).stdin(dir.join("to_validator")).stdout(dir.join("to_program"));
    }

    Ok(Controller::start(config.sandbox_binary.to_str().unwrap(), &args)?)
}

/// Build the validator's run command once, appending the per-case path arguments that never
/// change across cases (the linker always relinks these same three names).
fn build_validator_command(validator: &Program, linker: &FileLinker, feedback_dir: &Path) -> Vec<String> {
    let mut command = validator.run_command.clone();
    command.push(linker.path_for("input", false).to_string_lossy().into_owned());
    command.push(linker.path_for("judge_answer", false).to_string_lossy().into_owned());
    command.push(feedback_dir.to_string_lossy().into_owned());
    command
}

fn run_fixpermissions(config: &JudgeEngineConfig, path: &Path, when: &str) -> Result<()> {
    let parent = path.parent().unwrap_or(path);
    let status = Command::new(&config.fixpermissions_binary).arg("--path").arg(parent).status();

    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => {
            if when == "after" {
                warn!("fixpermissions ({}) failed with {}, not masking original error", when, s);
                Ok(())
            } else {
                bail!(ErrorKind::FixPermissionsFailed(s.to_string()))
            }
        }
        Err(e) => {
            warn!("could not invoke fixpermissions helper: {}", e);
            if when == "after" {
                Ok(())
            } else {
                Err(Error::from(e))
            }
        }
    }
}
