//! Worker orchestration
//!
//! A verification job is one or two [`CheckTask`]s. In `both` mode the BMC
//! and k-induction workers race as isolated blocking tasks on the tokio
//! runtime, each with its own cancellation flag: the first **definitive**
//! verdict (refuted or inductive) flips the sibling's flag, the sibling
//! notices between iterations, records a `sigterm` status and bows out. A
//! worker that merely exhausts its iteration budget does not win the race.
//!
//! Every worker persists its statistics twice — `started` right away, the
//! terminal status on the way out — so an externally killed run still leaves
//! a readable trace. SIGTERM/SIGINT from the parent propagate through a
//! signal listener that cancels all workers.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bmc::{BmcOutcome, IncrementalBmc};
use crate::kind::{IncrementalKInduction, KindOutcome};
use crate::solver::SolverError;
use crate::stats::{Statistics, Status, TaskArgs};
use crate::{CheckError, CheckOptions};

/// Which checker(s) to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckerChoice {
    Bmc,
    Kind,
    Both,
}

impl std::str::FromStr for CheckerChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bmc" => Ok(CheckerChoice::Bmc),
            "kind" => Ok(CheckerChoice::Kind),
            "both" => Ok(CheckerChoice::Both),
            other => Err(format!("unknown checker `{other}` (expected bmc, kind or both)")),
        }
    }
}

/// One concrete checker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checker {
    Bmc,
    KInduction,
}

impl std::fmt::Display for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Checker::Bmc => "bmc",
            Checker::KInduction => "kind",
        })
    }
}

/// Fully resolved job description, after CLI and `// ARGS:` merging.
#[derive(Clone, Debug)]
pub struct CliOptions {
    pub program_path: PathBuf,
    pub program_code: String,
    pub post: Option<String>,
    pub pre: Option<String>,
    pub checker: CheckerChoice,
    pub stats_path: Option<PathBuf>,
    pub name: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub options: CheckOptions,
}

/// One worker's inputs.
#[derive(Clone, Debug)]
pub struct CheckTask {
    pub name: Option<String>,
    pub checker: Checker,
    pub program_path: String,
    pub program_code: String,
    pub post: String,
    pub pre: String,
    pub stats_path: Option<PathBuf>,
    pub options: CheckOptions,
    pub memory_limited: bool,
}

impl CheckTask {
    fn args_mirror(&self) -> TaskArgs {
        TaskArgs {
            name: self.name.clone(),
            checker: self.checker.to_string(),
            program: self.program_path.clone(),
            post: Some(self.post.clone()),
            pre: Some(self.pre.clone()),
            assert_inductive: self.options.assert_inductive,
            assert_refute: self.options.assert_refute,
            ert: self.options.ert,
        }
    }

    fn write_statistics(&self, stats: &mut Statistics, status: Status) {
        stats.status = status;
        if let Some(path) = &self.stats_path {
            if let Err(error) = stats.dump_to_files(path) {
                warn!(%error, path = %path.display(), "failed to write statistics");
            }
        }
    }
}

/// Run one worker to completion, classifying every exit into a [`Status`].
pub fn run_check_task(task: &CheckTask, cancel: Arc<AtomicBool>) -> Status {
    let mut stats = Statistics::new(task.args_mirror());
    task.write_statistics(&mut stats, Status::Started);

    let status = match task.checker {
        Checker::Bmc => {
            let outcome = IncrementalBmc::new(
                &task.program_code,
                &task.post,
                &task.pre,
                &task.options,
                &mut stats,
            )
            .and_then(|mut bmc| bmc.run(&mut stats, &cancel));
            match outcome {
                Ok(BmcOutcome::Refuted) => Status::Refuted,
                Ok(BmcOutcome::Exhausted) => Status::Undecided,
                Err(error) => classify_error(task, error),
            }
        }
        Checker::KInduction => {
            let outcome = IncrementalKInduction::new(
                &task.program_code,
                &task.post,
                &task.pre,
                &task.options,
                &mut stats,
            )
            .and_then(|mut kind| kind.run(&mut stats, &cancel));
            match outcome {
                Ok(KindOutcome::Inductive) => Status::Inductive,
                Ok(KindOutcome::Exhausted) => Status::Undecided,
                Err(error) => classify_error(task, error),
            }
        }
    };

    stats.total_time.stop();
    info!(checker = %task.checker, %status, "worker finished\n{stats}");
    task.write_statistics(&mut stats, status);
    status
}

fn classify_error(task: &CheckTask, error: CheckError) -> Status {
    match error {
        CheckError::Cancelled => Status::Sigterm,
        // Under a memory ceiling the practically observable OOM is the
        // solver child dying mid-query; the limit is process-wide and
        // inherited by the child.
        CheckError::Solver(SolverError::ProcessExited) if task.memory_limited => {
            error!(checker = %task.checker, "solver process died under the memory ceiling");
            Status::Oom
        }
        error => {
            error!(checker = %task.checker, %error, "worker failed");
            Status::Err
        }
    }
}

/// Run a verification job end to end. Returns the decisive status.
pub fn run(opts: CliOptions) -> anyhow::Result<Status> {
    if opts.options.assert_inductive.is_some() && opts.options.assert_refute.is_some() {
        anyhow::bail!("--assert-inductive and --assert-refute are mutually exclusive");
    }
    let post = opts.post.clone().ok_or_else(|| anyhow::anyhow!("--post is required"))?;
    let pre = opts.pre.clone().ok_or_else(|| anyhow::anyhow!("--pre is required"))?;

    if let Some(megabytes) = opts.memory_limit_mb {
        set_max_memory(megabytes);
    }

    let task_for = |checker: Checker| -> CheckTask {
        let stats_path = opts.stats_path.as_ref().map(|path| {
            if opts.checker == CheckerChoice::Both {
                append_stem(path, &checker.to_string())
            } else {
                path.clone()
            }
        });
        CheckTask {
            name: opts.name.clone(),
            checker,
            program_path: opts.program_path.display().to_string(),
            program_code: opts.program_code.clone(),
            post: post.clone(),
            pre: pre.clone(),
            stats_path,
            options: opts.options.clone(),
            memory_limited: opts.memory_limit_mb.is_some(),
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        match opts.checker {
            CheckerChoice::Bmc => run_single(task_for(Checker::Bmc)).await,
            CheckerChoice::Kind => run_single(task_for(Checker::KInduction)).await,
            CheckerChoice::Both => {
                run_race(task_for(Checker::Bmc), task_for(Checker::KInduction)).await
            }
        }
    })
}

async fn run_single(task: CheckTask) -> anyhow::Result<Status> {
    let cancel = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(vec![cancel.clone()]);
    let worker_cancel = cancel.clone();
    let status =
        tokio::task::spawn_blocking(move || run_check_task(&task, worker_cancel)).await?;
    Ok(status)
}

async fn run_race(bmc_task: CheckTask, kind_task: CheckTask) -> anyhow::Result<Status> {
    let bmc_cancel = Arc::new(AtomicBool::new(false));
    let kind_cancel = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(vec![bmc_cancel.clone(), kind_cancel.clone()]);

    let bmc_flag = bmc_cancel.clone();
    let mut bmc_handle = tokio::task::spawn_blocking(move || run_check_task(&bmc_task, bmc_flag));
    let kind_flag = kind_cancel.clone();
    let mut kind_handle =
        tokio::task::spawn_blocking(move || run_check_task(&kind_task, kind_flag));

    let (first, first_was_bmc) = tokio::select! {
        result = &mut bmc_handle => (result?, true),
        result = &mut kind_handle => (result?, false),
    };
    let (sibling_handle, sibling_cancel) =
        if first_was_bmc { (kind_handle, kind_cancel) } else { (bmc_handle, bmc_cancel) };

    if first.is_decided() {
        sibling_cancel.store(true, Ordering::Relaxed);
        let _ = sibling_handle.await;
        return Ok(first);
    }
    // No verdict yet; let the sibling finish the job.
    let second = sibling_handle.await?;
    Ok(if second.is_decided() { second } else { first })
}

#[cfg(unix)]
fn spawn_signal_listener(flags: Vec<Arc<AtomicBool>>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "failed to install the SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        warn!("termination signal received, cancelling workers");
        for flag in &flags {
            flag.store(true, Ordering::Relaxed);
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(flags: Vec<Arc<AtomicBool>>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for flag in &flags {
                flag.store(true, Ordering::Relaxed);
            }
        }
    });
}

/// Process-wide address-space ceiling, inherited by solver children.
#[cfg(unix)]
pub fn set_max_memory(megabytes: u64) {
    use rlimit::Resource;
    let bytes = megabytes.saturating_mul(1024 * 1024);
    let hard = Resource::AS.get().map(|(_, hard)| hard).unwrap_or(rlimit::INFINITY);
    match Resource::AS.set(bytes.min(hard), hard) {
        Ok(()) => info!(megabytes, "memory ceiling installed"),
        Err(error) => warn!(%error, "failed to set the memory ceiling"),
    }
}

/// No-op outside unix.
#[cfg(not(unix))]
pub fn set_max_memory(_megabytes: u64) {
    warn!("memory ceilings are not supported on this platform");
}

// ---------------------------------------------------------------------------
// `// ARGS:` comment defaults and stats-path plumbing
// ---------------------------------------------------------------------------

/// Extra arguments from a leading `// ARGS: …` or `# ARGS: …` comment line.
pub fn args_comment(source: &str) -> Option<Vec<String>> {
    let first = source.lines().next()?.trim();
    let rest = first
        .strip_prefix("// ARGS:")
        .or_else(|| first.strip_prefix("# ARGS:"))?;
    Some(split_args_line(rest))
}

/// Quote-aware whitespace splitting for the ARGS comment line.
fn split_args_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Append `-{text}` to the first dot-separated component of the file name:
/// `stats.json` becomes `stats-bmc.json`.
pub fn append_stem(path: &Path, text: &str) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("stats");
    let mut parts: Vec<String> = name.split('.').map(String::from).collect();
    parts[0] = format!("{}-{}", parts[0], text);
    path.with_file_name(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_comment_accepts_both_comment_styles() {
        let slash = "// ARGS: --post \"totalFailed\" --pre \"totalFailed + 1\" --checker both\nnat x;";
        let args = args_comment(slash).expect("parsed");
        assert_eq!(
            args,
            vec!["--post", "totalFailed", "--pre", "totalFailed + 1", "--checker", "both"]
        );

        let hash = "# ARGS: --ert\nwhile (true) { skip }";
        assert_eq!(args_comment(hash).expect("parsed"), vec!["--ert"]);

        assert!(args_comment("nat x;\n// ARGS: --ert").is_none(), "only the first line counts");
    }

    #[test]
    fn quoted_arguments_keep_their_spaces() {
        let args = split_args_line(" --pre 'c + 0.99' --name run ");
        assert_eq!(args, vec!["--pre", "c + 0.99", "--name", "run"]);
    }

    #[test]
    fn stem_suffix_lands_before_the_extension() {
        assert_eq!(append_stem(Path::new("out/stats.json"), "bmc"), PathBuf::from("out/stats-bmc.json"));
        assert_eq!(append_stem(Path::new("stats"), "kind"), PathBuf::from("stats-kind"));
        assert_eq!(
            append_stem(Path::new("a/b/run.stats.json"), "bmc"),
            PathBuf::from("a/b/run-bmc.stats.json")
        );
    }

    #[test]
    fn checker_choice_parses_the_cli_values() {
        assert_eq!("bmc".parse::<CheckerChoice>(), Ok(CheckerChoice::Bmc));
        assert_eq!("kind".parse::<CheckerChoice>(), Ok(CheckerChoice::Kind));
        assert_eq!("both".parse::<CheckerChoice>(), Ok(CheckerChoice::Both));
        assert!("vi".parse::<CheckerChoice>().is_err());
    }
}
