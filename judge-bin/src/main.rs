//! Command-line wrapper: reads a JSON-encoded evaluation plan, drives the engine, and streams
//! the resulting per-case/per-group results to stdout as newline-delimited JSON.

#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate judge;

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use error_chain::ChainedError;

use judge::engine::{Evaluator, JudgeEngineConfig};
use judge::EvaluationPlan;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Judge(::judge::Error, ::judge::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
    }
}

fn get_arg_matches() -> clap::ArgMatches<'static> {
    clap::App::new("judge-bin")
        .version("0.1.0")
        .author("Lancern <msrlancern@126.com>")
        .about("A wrapper program for running the wave judge evaluation engine in a CLI environment.")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            clap::SubCommand::with_name("evaluate")
                .version("0.1.0")
                .author("Lancern <msrlancern@126.com>")
                .about("Evaluate a submission against an evaluation plan")
                .arg(
                    clap::Arg::with_name("plan")
                        .long("plan")
                        .required(true)
                        .takes_value(true)
                        .value_name("PLAN_JSON")
                        .help("path to a JSON-encoded evaluation plan"),
                )
                .arg(
                    clap::Arg::with_name("eval_root")
                        .long("root")
                        .required(true)
                        .takes_value(true)
                        .value_name("EVAL_ROOT")
                        .help("scratch directory the engine may freely create and populate"),
                )
                .arg(
                    clap::Arg::with_name("sandbox_binary")
                        .long("sandbox-binary")
                        .takes_value(true)
                        .value_name("PATH")
                        .help("path to the external sandbox binary (default: /usr/bin/omogenexec)"),
                )
                .arg(
                    clap::Arg::with_name("fixpermissions_binary")
                        .long("fixpermissions-binary")
                        .takes_value(true)
                        .value_name("PATH")
                        .help("path to the permission-fixing helper binary"),
                )
                .arg(
                    clap::Arg::with_name("gid")
                        .long("gid")
                        .takes_value(true)
                        .value_name("GID")
                        .help("group id applied to every file the engine creates"),
                ),
        )
        .get_matches()
}

fn do_evaluate(matches: &clap::ArgMatches<'_>) -> Result<()> {
    let plan_path = PathBuf::from(matches.value_of("plan").expect("required"));
    let plan_json = std::fs::read_to_string(&plan_path)?;
    let plan: EvaluationPlan = serde_json::from_str(&plan_json)?;

    let eval_root = PathBuf::from(matches.value_of("eval_root").expect("required"));

    let mut config = JudgeEngineConfig::default();
    if let Some(bin) = matches.value_of("sandbox_binary") {
        config.sandbox_binary = PathBuf::from(bin);
    }
    if let Some(bin) = matches.value_of("fixpermissions_binary") {
        config.fixpermissions_binary = PathBuf::from(bin);
    }
    if let Some(gid) = matches.value_of("gid") {
        config.judge_gid =
            Some(gid.parse().map_err(|_| Error::from(format!("invalid --gid value: \"{}\"", gid)))?);
    }

    let evaluator = Evaluator::new(config, plan, &eval_root)?;

    let (sender, receiver) = mpsc::channel();
    let worker = thread::spawn(move || evaluator.evaluate(sender));

    for result in receiver {
        println!("{}", serde_json::to_string(&result).expect("EvalResult always serializes"));
    }

    worker.join().expect("evaluator thread panicked")?;
    Ok(())
}

fn do_main() -> Result<()> {
    env_logger::init();

    let matches = get_arg_matches();
    match matches.subcommand() {
        ("evaluate", Some(evaluate_matches)) => do_evaluate(evaluate_matches),
        _ => unreachable!(),
    }
}

fn main() -> Result<()> {
    match do_main() {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e.display_chain());
            Err(e)
        }
    }
}
