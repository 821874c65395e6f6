//! Run statistics
//!
//! Each worker keeps one [`Statistics`] value: the mirrored CLI inputs, the
//! terminal status, three wall-clock timers (total, formula construction,
//! satisfiability checks), the unrolling depth reached and the number of
//! formulae on the solver. It is persisted twice — once with status
//! `started`, once at termination — as a human-readable JSON file and a
//! binary twin for the tabulator.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A start/stop stopwatch that serializes as elapsed seconds.
///
/// Reading [`Timer::value`] while the timer runs includes the running span,
/// so a worker killed mid-check still persists a meaningful total.
#[derive(Debug, Default)]
pub struct Timer {
    elapsed: Duration,
    started: Option<Instant>,
}

impl Timer {
    /// Timer that is already running.
    pub fn running() -> Self {
        Self { elapsed: Duration::ZERO, started: Some(Instant::now()) }
    }

    /// Start the timer. Must not already be running.
    pub fn start(&mut self) {
        debug_assert!(self.started.is_none(), "timer started twice");
        self.started = Some(Instant::now());
    }

    /// Stop the timer and accumulate the span since [`Timer::start`].
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed += started.elapsed();
        } else {
            debug_assert!(false, "stopped a timer that was not running");
        }
    }

    /// Elapsed seconds, including a currently running span.
    pub fn value(&self) -> f64 {
        let running = self.started.map(|s| s.elapsed()).unwrap_or(Duration::ZERO);
        (self.elapsed + running).as_secs_f64()
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} s", self.value())
    }
}

impl Serialize for Timer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.value())
    }
}

impl<'de> Deserialize<'de> for Timer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Ok(Timer { elapsed: Duration::from_secs_f64(seconds.max(0.0)), started: None })
    }
}

/// Terminal status of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Started,
    Refuted,
    Inductive,
    Undecided,
    Sigterm,
    Oom,
    Err,
}

impl Status {
    /// Whether the bound question was decided either way.
    pub fn is_decided(self) -> bool {
        matches!(self, Status::Refuted | Status::Inductive)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Started => "started",
            Status::Refuted => "refuted",
            Status::Inductive => "inductive",
            Status::Undecided => "undecided",
            Status::Sigterm => "sigterm",
            Status::Oom => "oom",
            Status::Err => "err",
        };
        f.write_str(name)
    }
}

/// Mirror of the worker's inputs, persisted alongside the results.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskArgs {
    pub name: Option<String>,
    pub checker: String,
    pub program: String,
    pub post: Option<String>,
    pub pre: Option<String>,
    pub assert_inductive: Option<usize>,
    pub assert_refute: Option<usize>,
    pub ert: bool,
}

/// Everything a worker reports.
#[derive(Debug, Serialize, Deserialize)]
pub struct Statistics {
    pub args: TaskArgs,
    pub status: Status,
    pub total_time: Timer,
    pub compute_formulae_time: Timer,
    pub sat_check_time: Timer,
    pub k: Option<usize>,
    pub number_formulae: Option<usize>,
}

impl Statistics {
    /// Fresh statistics with the total timer already running.
    pub fn new(args: TaskArgs) -> Self {
        Self {
            args,
            status: Status::Started,
            total_time: Timer::running(),
            compute_formulae_time: Timer::default(),
            sat_check_time: Timer::default(),
            k: None,
            number_formulae: None,
        }
    }

    /// Write `<path>.json` (pretty JSON) and `<path>.bin` (bincode).
    pub fn dump_to_files(&self, path: &Path) -> std::io::Result<()> {
        let mut json_path = path.as_os_str().to_owned();
        json_path.push(".json");
        let json = serde_json::to_string_pretty(self)?;
        File::create(Path::new(&json_path))?.write_all(json.as_bytes())?;

        let mut bin_path = path.as_os_str().to_owned();
        bin_path.push(".bin");
        let encoded = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        File::create(Path::new(&bin_path))?.write_all(&encoded)?;
        Ok(())
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------ Statistics ------")?;
        writeln!(f, "Total time = {}.", self.total_time)?;
        writeln!(f, "Time for computing formulae = {}.", self.compute_formulae_time)?;
        write!(f, "Time for sat checks: {}.", self.sat_check_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_accumulate_across_spans() {
        let mut timer = Timer::default();
        timer.start();
        timer.stop();
        timer.start();
        timer.stop();
        assert!(timer.value() >= 0.0);
        assert!(timer.started.is_none());
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let mut stats = Statistics::new(TaskArgs {
            name: Some("geo".into()),
            checker: "bmc".into(),
            program: "geo.pgcl".into(),
            post: Some("c".into()),
            pre: Some("c + 0.99".into()),
            assert_inductive: None,
            assert_refute: Some(12),
            ert: false,
        });
        stats.status = Status::Refuted;
        stats.k = Some(12);
        stats.number_formulae = Some(40);

        let json = serde_json::to_string(&stats).unwrap();
        let back: Statistics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, Status::Refuted);
        assert_eq!(back.k, Some(12));
        assert_eq!(back.args.assert_refute, Some(12));
        assert!(json.contains("\"status\": \"refuted\"") || json.contains("\"status\":\"refuted\""));
    }

    #[test]
    fn binary_round_trip_matches_json_twin() {
        let stats = Statistics::new(TaskArgs::default());
        let bytes = bincode::serialize(&stats).unwrap();
        let back: Statistics = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.status, Status::Started);
    }

    #[test]
    fn dump_writes_both_files() {
        let dir = std::env::temp_dir().join("probound-stats-test");
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("run");
        let stats = Statistics::new(TaskArgs::default());
        stats.dump_to_files(&base).unwrap();
        assert!(dir.join("run.json").exists());
        assert!(dir.join("run.bin").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
