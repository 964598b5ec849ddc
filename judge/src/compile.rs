//! Runs the configured compiler inside a sandbox against filtered source files, captures
//! stderr, reports success with a run command or failure with compiler output.
//!
//! Grounded in `Compile`/`NoCompile`/`CppCompile`/`javaCompile` (`eval/compilers.go` and
//! `judgehost/compilers.go` in the original implementation). The Java main-class scan is built
//! directly from this crate's specification document, since the disassembler-invocation body was
//! not present in the retrieved original source.

use std::path::PathBuf;

use sandbox::{Controller, LaunchArgs};

use crate::filebase::FileBase;
use crate::{Program, Result};

const COMPILE_CPU_TIME_LIMIT_MS: u64 = 60_000;
const COMPILE_MEMORY_LIMIT_MB: u64 = 1024;

const MAIN_SIGNATURE: &str = "public static void main(java.lang.String[]);";
const MAIN_SIGNATURE_VARARGS: &str = "public static void main(java.lang.String...);";

const COMPILER_ERRORS_FILE: &str = "__compiler_errors";
const JAVAP_OUTPUT_FILE: &str = "__javap_output";

/// A judge-provided source file, relative name plus contents, to be materialized under the
/// compilation's output directory before the compiler runs.
pub struct SourceFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// How to turn a set of source files into a runnable [`Program`].
pub enum CompileStrategy {
    /// Script languages: select sources by extension and substitute them into a run-command
    /// template at `{files}`.
    NoCompile { run_command_template: Vec<String>, extensions: Vec<String> },
    /// Native/bytecode single-command compile: run `compiler_command` with `{files}` substituted,
    /// then use `run_command` unchanged on success.
    SingleStep { compiler_command: Vec<String>, run_command: Vec<String> },
    /// Like `SingleStep`, but after a successful compile, walks the produced `.class` files,
    /// disassembles each with `disassembler_command`, and substitutes the discovered main class
    /// into `run_command_template` at `{main}`.
    JavaStyle {
        compiler_command: Vec<String>,
        disassembler_command: Vec<String>,
        run_command_template: Vec<String>,
    },
}

/// The result of a compilation attempt: never an error, per the error-handling design (a failed
/// compile is a first-class outcome a caller inspects, not a propagated `Err`).
pub enum CompilationOutcome {
    Success(Program),
    Failure { compiler_errors: String },
}

fn has_extension(name: &str, extensions: &[String]) -> bool {
    extensions.iter().any(|ext| name.ends_with(ext.as_str()))
}

/// Substitute the literal token `{files}` in `template` with `paths`, each becoming its own
/// argument; all other tokens pass through unchanged.
fn substitute_files(template: &[String], paths: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(template.len() + paths.len());
    for token in template {
        if token == "{files}" {
            out.extend(paths.iter().cloned());
        } else {
            out.push(token.clone());
        }
    }
    out
}

/// Substitute the literal token `{main}` in `template` with `main_class`.
fn substitute_main(template: &[String], main_class: &str) -> Vec<String> {
    template
        .iter()
        .map(|token| if token == "{main}" { main_class.to_owned() } else { token.clone() })
        .collect()
}

/// Stage `sources` under `output_dir`, then dispatch to `strategy`.
pub fn compile(
    sandbox_binary: &str,
    strategy: &CompileStrategy,
    sources: &[SourceFile],
    output_dir: &FileBase,
    language: &str,
) -> Result<CompilationOutcome> {
    for source in sources {
        output_dir.write_file(&source.name, &source.contents)?;
    }

    match strategy {
        CompileStrategy::NoCompile { run_command_template, extensions } => {
            no_compile(run_command_template, extensions, sources, output_dir)
        }
        CompileStrategy::SingleStep { compiler_command, run_command } => single_step_compile(
            sandbox_binary,
            compiler_command,
            run_command.clone(),
            output_dir,
            language,
        ),
        CompileStrategy::JavaStyle { compiler_command, disassembler_command, run_command_template } => {
            java_compile(
                sandbox_binary,
                compiler_command,
                disassembler_command,
                run_command_template,
                output_dir,
                language,
            )
        }
    }
}

fn no_compile(
    run_command_template: &[String],
    extensions: &[String],
    sources: &[SourceFile],
    output_dir: &FileBase,
) -> Result<CompilationOutcome> {
    let matched: Vec<String> = sources
        .iter()
        .filter(|s| has_extension(&s.name, extensions))
        .map(|s| output_dir.root().join(&s.name).to_string_lossy().into_owned())
        .collect();

    if matched.is_empty() {
        return Ok(CompilationOutcome::Failure {
            compiler_errors: "No valid source files found".to_owned(),
        });
    }

    let run_command = substitute_files(run_command_template, &matched);
    Ok(CompilationOutcome::Success(Program::new(output_dir.root(), run_command, "no-compile")))
}

/// Launch the dedicated compile sandbox: 60s CPU, 1GB memory, a raised PID limit, `TMPDIR`
/// pointed at the output directory, and stderr redirected to `__compiler_errors`, matching
/// `cppCompile`/`sandboxForCompile` in the original.
fn start_compile_sandbox(sandbox_binary: &str, output_dir: &FileBase) -> Result<Controller> {
    let args = LaunchArgs::new(0, COMPILE_CPU_TIME_LIMIT_MS, COMPILE_MEMORY_LIMIT_MB)
        .pid_limit(sandbox::COMPILE_PID_LIMIT)
        .working_dir(output_dir.root())
        .writable(output_dir.root())
        .stderr(output_dir.root().join(COMPILER_ERRORS_FILE));
    Ok(Controller::start(sandbox_binary, &args)?)
}

/// Launch a disassembler sandbox whose stdout is pinned to a single fixed file. Unlike the
/// compile sandbox this is started once per `javap` invocation, since a `Controller`'s stdio
/// redirection is fixed for its whole lifetime and each class needs its own disassembly read
/// back before the next one overwrites it.
fn start_javap_sandbox(sandbox_binary: &str, output_dir: &FileBase) -> Result<Controller> {
    let args = LaunchArgs::new(0, COMPILE_CPU_TIME_LIMIT_MS, COMPILE_MEMORY_LIMIT_MB)
        .pid_limit(sandbox::COMPILE_PID_LIMIT)
        .working_dir(output_dir.root())
        .writable(output_dir.root())
        .stdout(output_dir.root().join(JAVAP_OUTPUT_FILE));
    Ok(Controller::start(sandbox_binary, &args)?)
}

fn single_step_compile(
    sandbox_binary: &str,
    compiler_command: &[String],
    run_command: Vec<String>,
    output_dir: &FileBase,
    language: &str,
) -> Result<CompilationOutcome> {
    output_dir.write_file("__compiler_input", b"")?;

    let source_paths: Vec<String> = std::fs::read_dir(output_dir.root())?
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_string_lossy().into_owned())
        .collect();
    let argv = substitute_files(compiler_command, &source_paths);

    let mut sandbox = start_compile_sandbox(sandbox_binary, output_dir)?;
    let args: Vec<&str> = argv.iter().skip(1).map(|s| s.as_str()).collect();
    let result = sandbox.run(&argv[0], &args)?;
    sandbox.finish()?;

    if result.crashed_with(0) {
        Ok(CompilationOutcome::Success(Program::new(output_dir.root(), run_command, language)))
    } else {
        let errors = output_dir.read_file(COMPILER_ERRORS_FILE).unwrap_or_default();
        Ok(CompilationOutcome::Failure { compiler_errors: String::from_utf8_lossy(&errors).into_owned() })
    }
}

fn java_compile(
    sandbox_binary: &str,
    compiler_command: &[String],
    disassembler_command: &[String],
    run_command_template: &[String],
    output_dir: &FileBase,
    language: &str,
) -> Result<CompilationOutcome> {
    output_dir.write_file("__compiler_input", b"")?;

    let source_paths: Vec<String> = std::fs::read_dir(output_dir.root())?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|ext| ext == "java").unwrap_or(false))
        .map(|e| e.path().to_string_lossy().into_owned())
        .collect();
    let argv = substitute_files(compiler_command, &source_paths);

    let mut sandbox = start_compile_sandbox(sandbox_binary, output_dir)?;
    let args: Vec<&str> = argv.iter().skip(1).map(|s| s.as_str()).collect();
    let result = sandbox.run(&argv[0], &args)?;
    sandbox.finish()?;

    if !result.crashed_with(0) {
        let errors = output_dir.read_file(COMPILER_ERRORS_FILE).unwrap_or_default();
        return Ok(CompilationOutcome::Failure {
            compiler_errors: String::from_utf8_lossy(&errors).into_owned(),
        });
    }

    let class_files: Vec<PathBuf> = std::fs::read_dir(output_dir.root())?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "class").unwrap_or(false))
        .collect();

    let mut main_classes = Vec::new();
    for class_file in &class_files {
        let class_name = class_file.file_stem().unwrap().to_string_lossy().into_owned();
        let disasm_argv = substitute_files(disassembler_command, std::slice::from_ref(&class_name));

        let mut javap_sandbox = start_javap_sandbox(sandbox_binary, output_dir)?;
        let dargs: Vec<&str> = disasm_argv.iter().skip(1).map(|s| s.as_str()).collect();
        let _ = javap_sandbox.run(&disasm_argv[0], &dargs)?;
        javap_sandbox.finish()?;

        let stdout_bytes = output_dir.read_file(JAVAP_OUTPUT_FILE).unwrap_or_default();
        let stdout_text = String::from_utf8_lossy(&stdout_bytes);
        if has_main_method(&stdout_text) {
            main_classes.push(class_name);
        }
    }

    match main_classes.len() {
        0 => Ok(CompilationOutcome::Failure { compiler_errors: "No main function found".to_owned() }),
        1 => {
            let run_command = substitute_main(run_command_template, &main_classes[0]);
            Ok(CompilationOutcome::Success(Program::new(output_dir.root(), run_command, language)))
        }
        _ => Ok(CompilationOutcome::Failure {
            compiler_errors: "Multiple main functions found".to_owned(),
        }),
    }
}

fn has_main_method(disassembly: &str) -> bool {
    disassembly.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == MAIN_SIGNATURE || trimmed == MAIN_SIGNATURE_VARARGS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_files_expands_files_token_inline() {
        let template = vec!["python3".to_owned(), "{files}".to_owned()];
        let out = substitute_files(&template, &["a.py".to_owned(), "b.py".to_owned()]);
        assert_eq!(out, vec!["python3", "a.py", "b.py"]);
    }

    #[test]
    fn substitute_main_replaces_placeholder_only() {
        let template = vec!["java".to_owned(), "-cp".to_owned(), ".".to_owned(), "{main}".to_owned()];
        let out = substitute_main(&template, "Solution");
        assert_eq!(out, vec!["java", "-cp", ".", "Solution"]);
    }

    #[test]
    fn has_main_method_recognizes_both_signature_forms() {
        assert!(has_main_method("  public static void main(java.lang.String[]);\n"));
        assert!(has_main_method("  public static void main(java.lang.String...);\n"));
        assert!(!has_main_method("  public Solution();\n"));
    }

    #[test]
    fn has_extension_matches_suffix() {
        assert!(has_extension("solution.py", &["py".to_owned()]));
        assert!(!has_extension("solution.cpp", &["py".to_owned()]));
    }
}
