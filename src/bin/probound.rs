//! Command-line entry point
//!
//! One invocation is one verification job: a program file plus a
//! postexpectation and a candidate upper bound, handed to BMC, k-induction
//! or a race of both. Options left unset on the command line can be supplied
//! by a leading `// ARGS: …` (or `# ARGS: …`) comment in the program file.
//!
//! Exit code 0 means the bound question was decided (refuted or inductive);
//! anything else — undecided, error, out-of-memory, cancellation — is
//! non-zero.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::ExitCode;

use probound::cmd::{self, CheckerChoice, CliOptions};
use probound::CheckOptions;

const USAGE: &str = "\
probound — refute or prove upper bounds on probabilistic loops

USAGE:
    probound <PROGRAM> --post <EXPECTATION> --pre <BOUND> [OPTIONS]

OPTIONS:
    --post <E>                          The postexpectation.
    --pre <E>                           The candidate upper bound on the pre-expectation.
    --checker <bmc|kind|both>           Which checker to run (default: both).
    --stats-path <PATH>                 Where to write <PATH>.json / <PATH>.bin statistics.
    --assert-inductive <N>              Fail unless proven inductive at exactly depth N.
    --assert-refute <N>                 Fail unless refuted at exactly depth N.
    --name <NAME>                       A name to attach to the statistics.
    --ert / --no-ert                    Check expected runtimes instead of outcomes.
    --memory-limit <MB>                 Process-wide memory ceiling in megabytes.
    --max-iterations <N>                Iteration budget per worker (default: 500).
    --unrollings-between-sat-checks <N> Unrollings per satisfiability check (default: 1).
    --no-simplify                       Keep formulae unsimplified after substitution.

The first line of <PROGRAM> may be `// ARGS: …` or `# ARGS: …` to supply
defaults for options not given on the command line.
";

const VALUE_FLAGS: &[&str] = &[
    "--post",
    "--pre",
    "--checker",
    "--stats-path",
    "--assert-inductive",
    "--assert-refute",
    "--name",
    "--memory-limit",
    "--max-iterations",
    "--unrollings-between-sat-checks",
];

const SWITCH_FLAGS: &[&str] = &["--ert", "--no-ert", "--no-simplify", "--help"];

#[derive(Default)]
struct RawArgs {
    values: HashMap<String, String>,
    switches: HashSet<String>,
    positional: Vec<String>,
}

fn parse_raw(args: &[String]) -> anyhow::Result<RawArgs> {
    let mut raw = RawArgs::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            let value = it
                .next()
                .ok_or_else(|| anyhow::anyhow!("{arg} expects a value"))?;
            raw.values.insert(arg.clone(), value.clone());
        } else if SWITCH_FLAGS.contains(&arg.as_str()) {
            raw.switches.insert(arg.clone());
        } else if arg.starts_with("--") {
            anyhow::bail!("unknown option {arg}\n\n{USAGE}");
        } else {
            raw.positional.push(arg.clone());
        }
    }
    Ok(raw)
}

/// Fill options the command line left unset from the ARGS comment.
fn merge_defaults(cli: &mut RawArgs, defaults: RawArgs) {
    for (key, value) in defaults.values {
        cli.values.entry(key).or_insert(value);
    }
    for switch in defaults.switches {
        let opposite = match switch.as_str() {
            "--ert" => Some("--no-ert"),
            "--no-ert" => Some("--ert"),
            _ => None,
        };
        let contested = opposite.is_some_and(|other| cli.switches.contains(other));
        if !contested {
            cli.switches.insert(switch);
        }
    }
}

fn parse_count(raw: &RawArgs, key: &str) -> anyhow::Result<Option<usize>> {
    match raw.values.get(key) {
        None => Ok(None),
        Some(text) => text
            .parse::<usize>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{key} expects a non-negative integer, got `{text}`")),
    }
}

fn build_options(raw: &RawArgs, program_path: PathBuf, program_code: String) -> anyhow::Result<CliOptions> {
    let checker = match raw.values.get("--checker") {
        None => CheckerChoice::Both,
        Some(text) => text.parse::<CheckerChoice>().map_err(|e| anyhow::anyhow!(e))?,
    };
    let options = CheckOptions {
        max_iterations: parse_count(raw, "--max-iterations")?.unwrap_or(500),
        unrollings_between_sat_checks: parse_count(raw, "--unrollings-between-sat-checks")?
            .unwrap_or(1),
        simplify_formulae: !raw.switches.contains("--no-simplify"),
        assert_inductive: parse_count(raw, "--assert-inductive")?,
        assert_refute: parse_count(raw, "--assert-refute")?,
        ert: raw.switches.contains("--ert") && !raw.switches.contains("--no-ert"),
    };
    Ok(CliOptions {
        program_path,
        program_code,
        post: raw.values.get("--post").cloned(),
        pre: raw.values.get("--pre").cloned(),
        checker,
        stats_path: raw.values.get("--stats-path").map(PathBuf::from),
        name: raw.values.get("--name").cloned(),
        memory_limit_mb: parse_count(raw, "--memory-limit")?.map(|mb| mb as u64),
        options,
    })
}

fn real_main() -> anyhow::Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut raw = parse_raw(&args)?;
    if raw.switches.contains("--help") || args.is_empty() {
        print!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }
    if raw.positional.len() != 1 {
        anyhow::bail!("expected exactly one program file\n\n{USAGE}");
    }
    let program_path = PathBuf::from(&raw.positional[0]);
    let program_code = std::fs::read_to_string(&program_path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", program_path.display()))?;

    if let Some(comment_args) = cmd::args_comment(&program_code) {
        merge_defaults(&mut raw, parse_raw(&comment_args)?);
    }

    let opts = build_options(&raw, program_path, program_code)?;
    let status = cmd::run(opts)?;
    println!("{status}");
    Ok(if status.is_decided() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match real_main() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
