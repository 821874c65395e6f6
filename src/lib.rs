//! Crate root: public surface, shared options, and job-wide error categories
//!
//! `probound` answers one question about a probabilistic loop
//! `while (B) { body }` with a loop-free body: is a candidate expectation `I`
//! an upper bound on `wp⟦·⟧(f)` (or `ert⟦·⟧(f)`)? Two incremental procedures
//! attack it from opposite sides and can race each other:
//!
//! - **Bounded model checking** ([`bmc`]) searches for a state whose
//!   `Φᵏ(0)` value already exceeds `I` — a definitive *refutation*.
//! - **k-induction** ([`kind`]) tries to prove
//!   `Φ(I ⊓ Ψ(I) ⊓ … ⊓ Ψᵏ⁻¹(I)) ≤ I` — a definitive *proof*.
//!
//! Both work on the same skeleton: the loop is lowered to partitioned guard
//! classes by the [`functional`] module over hash-consed [`term`]s, each
//! unrolling depth is named by a fresh uninterpreted function, and advancing a
//! depth rewrites the accumulated formulae with the EUF-aware [`subst`]
//! machinery instead of re-encoding anything. An external SMT process behind
//! [`solver`] answers the queries.
//!
//! ## Invariants
//!
//! - **Partitioning.** The guards of the loop-execute and loop-terminated
//!   classes are pairwise mutually exclusive and jointly cover every state
//!   with non-negative variables; every query asserts `vᵢ ≥ 0`.
//! - **Outer arguments.** Every `P_i`/`K_i` application at the defining
//!   position takes the ordered program-variable tuple; substitution
//!   composition only ever happens inside the argument terms.
//! - **Monotone accumulation.** Formulae asserted at earlier depths stay
//!   valid; only the zero-step family and (for induction) the innermost
//!   execute/continuation layer are transient, scoped by push/pop.
//! - **Truncated subtraction.** Every `a - b` of the surface syntax is an
//!   uninterpreted `Monus`/`RMonus` application, axiomatized per recorded
//!   argument pair.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Incremental bounded model checking: formula generator and driver.
pub mod bmc;
/// Expression bridge: pGCL AST to typed terms, monus accumulation.
pub mod bridge;
/// Worker orchestration: tasks, racing, cancellation, statistics files.
pub mod cmd;
/// Characteristic functional: SNF to partitioned guard classes.
pub mod functional;
/// Incremental k-induction: pointwise-minimum encoding and driver.
pub mod kind;
/// pGCL surface: AST, parser, input checks.
pub mod pgcl;
/// Summation normal form of loops and expectations.
pub mod snf;
/// SMT-LIB2 interface to the external solver process.
pub mod solver;
/// Timers, run statistics and their persistence.
pub mod stats;
/// EUF-aware substitution and local simplification.
pub mod subst;
/// Hash-consed term arena.
pub mod term;

#[cfg(test)]
pub(crate) mod fixtures;

pub use cmd::{CheckerChoice, CliOptions};
pub use stats::{Statistics, Status};

/// Tunables shared by both checkers.
#[derive(Clone, Debug)]
pub struct CheckOptions {
    /// Iteration budget per worker.
    pub max_iterations: usize,
    /// How many unrollings to perform between satisfiability checks (≥ 1).
    pub unrollings_between_sat_checks: usize,
    /// Simplify formulae after substitution; keeps the accumulated sets
    /// deduplicated and the solver fast.
    pub simplify_formulae: bool,
    /// Abort unless inductiveness is decided at exactly this depth.
    pub assert_inductive: Option<usize>,
    /// Abort unless refutation is decided at exactly this depth.
    pub assert_refute: Option<usize>,
    /// Check expected runtimes instead of expected outcomes.
    pub ert: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            unrollings_between_sat_checks: 1,
            simplify_formulae: true,
            assert_inductive: None,
            assert_refute: None,
            ert: false,
        }
    }
}

/// Everything that can go wrong inside a worker. Classified into a terminal
/// [`Status`] only at the worker boundary.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// Syntax error in the program or an expectation.
    #[error(transparent)]
    Parse(#[from] pgcl::ParseError),
    /// Well-formed input outside the supported fragment.
    #[error(transparent)]
    Reject(#[from] pgcl::RejectError),
    /// Lowering failure (infinity discipline, unknown variable, division).
    #[error(transparent)]
    Bridge(#[from] bridge::BridgeError),
    /// The solver process failed or answered `unknown`.
    #[error(transparent)]
    Solver(#[from] solver::SolverError),
    /// The total DNF of the candidate bound misses part of the state space.
    #[error("the guards of the candidate upper bound do not cover all non-negative states")]
    UpperBoundNotTotal,
    /// `--assert-inductive`/`--assert-refute` disagreed with the run.
    #[error("decided at depth {found}, but depth {expected} was asserted")]
    AssertionMismatch {
        /// Depth demanded on the command line.
        expected: usize,
        /// Depth actually reached.
        found: usize,
    },
    /// The sibling worker won the race or a termination signal arrived.
    #[error("cancelled")]
    Cancelled,
    /// Rejected combination of options.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}
