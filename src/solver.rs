//! External SMT solver driven over an SMT-LIB2 pipe
//!
//! The checkers only need five operations from a solver: `push`, `pop`,
//! `add_assertion`, `is_sat(extra)` and `get_model`. We satisfy that contract
//! by spawning a solver process (`z3 -in` unless `PROBOUND_SOLVER` overrides
//! the command line) and speaking SMT-LIB2 over its stdin/stdout with
//! `:print-success` acknowledgements, so the pipe can never silently desync.
//!
//! Symbol declarations are scoped to the assertion level they first appear
//! in: a `(pop)` forgets them on both sides, and the next assertion that
//! mentions the symbol re-declares it. Assertion counts are tracked per level
//! so the drivers can report the number of live formulae.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use ahash::AHashSet;
use num_rational::BigRational;
use num_traits::Signed;
use tracing::trace;

use crate::stats::Timer;
use crate::term::{collect_symbols, Op, Payload, Sort, TermId, TermStore};

/// Logic sent to the solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Logic {
    /// Linear mixed integer/real arithmetic with uninterpreted functions.
    QfUfLira,
    /// Everything the solver has; used when a non-linear expression slipped in.
    All,
}

impl Logic {
    fn name(self) -> &'static str {
        match self {
            Logic::QfUfLira => "QF_UFLIRA",
            Logic::All => "ALL",
        }
    }
}

/// Failures at the solver boundary.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("failed to spawn solver process `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("solver pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("solver process exited unexpectedly")]
    ProcessExited,
    #[error("solver replied `{got}` where `{expected}` was expected")]
    UnexpectedResponse { expected: &'static str, got: String },
    #[error("solver returned `unknown` for a satisfiability query")]
    UnknownVerdict,
}

/// Command line used when `PROBOUND_SOLVER` is unset.
const DEFAULT_SOLVER: &str = "z3 -in";

/// Handle to a running solver process.
pub struct SmtProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Symbols declared per assertion level; popped together with the level.
    declared: Vec<AHashSet<TermId>>,
    /// Assertions per level, for [`SmtProcess::num_assertions`].
    asserted: Vec<usize>,
    last_model: Option<String>,
}

impl SmtProcess {
    /// Spawn a solver and fix the logic.
    pub fn spawn(logic: Logic) -> Result<Self, SolverError> {
        let command_line =
            std::env::var("PROBOUND_SOLVER").unwrap_or_else(|_| DEFAULT_SOLVER.to_string());
        let mut parts = command_line.split_whitespace();
        let program = parts.next().unwrap_or("z3");
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SolverError::Spawn { command: command_line.clone(), source })?;
        let stdin = child.stdin.take().ok_or(SolverError::ProcessExited)?;
        let stdout = BufReader::new(child.stdout.take().ok_or(SolverError::ProcessExited)?);
        let mut solver = Self {
            child,
            stdin,
            stdout,
            declared: vec![AHashSet::new()],
            asserted: vec![0],
            last_model: None,
        };
        solver.command("(set-option :print-success true)")?;
        solver.expect_success()?;
        solver.command(&format!("(set-logic {})", logic.name()))?;
        solver.expect_success()?;
        Ok(solver)
    }

    /// Push one assertion level.
    pub fn push(&mut self) -> Result<(), SolverError> {
        self.command("(push 1)")?;
        self.expect_success()?;
        self.declared.push(AHashSet::new());
        self.asserted.push(0);
        Ok(())
    }

    /// Pop one assertion level, forgetting its assertions and declarations.
    pub fn pop(&mut self) -> Result<(), SolverError> {
        self.command("(pop 1)")?;
        self.expect_success()?;
        self.declared.pop();
        self.asserted.pop();
        debug_assert!(!self.declared.is_empty(), "popped the base level");
        Ok(())
    }

    /// Assert `formula` at the current level.
    pub fn add_assertion(
        &mut self,
        store: &TermStore,
        formula: TermId,
    ) -> Result<(), SolverError> {
        self.declare_symbols(store, formula)?;
        let mut line = String::from("(assert ");
        write_term(store, formula, &mut line);
        line.push(')');
        self.command(&line)?;
        self.expect_success()?;
        *self.asserted.last_mut().expect("assertion level") += 1;
        Ok(())
    }

    /// Satisfiability of the current stack, optionally conjoined with a
    /// transient `extra` formula that is retracted before returning.
    pub fn is_sat(
        &mut self,
        store: &TermStore,
        extra: Option<TermId>,
    ) -> Result<bool, SolverError> {
        self.last_model = None;
        match extra {
            Some(formula) => {
                self.push()?;
                self.add_assertion(store, formula)?;
                let verdict = self.check_sat()?;
                if verdict {
                    self.last_model = Some(self.read_model()?);
                }
                self.pop()?;
                Ok(verdict)
            }
            None => {
                let verdict = self.check_sat()?;
                if verdict {
                    self.last_model = Some(self.read_model()?);
                }
                Ok(verdict)
            }
        }
    }

    /// [`SmtProcess::is_sat`] with the check time booked onto `timer`.
    pub fn is_sat_timed(
        &mut self,
        store: &TermStore,
        extra: Option<TermId>,
        timer: &mut Timer,
    ) -> Result<bool, SolverError> {
        timer.start();
        let result = self.is_sat(store, extra);
        timer.stop();
        result
    }

    /// Model of the most recent satisfiable check, as solver-printed text.
    pub fn get_model(&self) -> Option<&str> {
        self.last_model.as_deref()
    }

    /// Number of assertions currently on the stack.
    pub fn num_assertions(&self) -> usize {
        self.asserted.iter().sum()
    }

    // ------------------------------------------------------------------
    // Wire plumbing
    // ------------------------------------------------------------------

    fn declare_symbols(&mut self, store: &TermStore, formula: TermId) -> Result<(), SolverError> {
        let mut symbols = Vec::new();
        collect_symbols(store, formula, &mut symbols);
        for symbol in symbols {
            if self.declared.iter().any(|level| level.contains(&symbol)) {
                continue;
            }
            let line = match &store.node(symbol).payload {
                Payload::Sym(name) => {
                    format!("(declare-fun {} () {})", name, sort_name(store.sort(symbol)))
                }
                Payload::Fun(name, params, ret) => {
                    let params: Vec<&str> = params.iter().map(|s| sort_name(*s)).collect();
                    format!("(declare-fun {} ({}) {})", name, params.join(" "), sort_name(*ret))
                }
                other => panic!("cannot declare non-symbol payload {other:?}"),
            };
            self.command(&line)?;
            self.expect_success()?;
            self.declared.last_mut().expect("declaration level").insert(symbol);
        }
        Ok(())
    }

    fn check_sat(&mut self) -> Result<bool, SolverError> {
        self.command("(check-sat)")?;
        let reply = self.read_line()?;
        match reply.as_str() {
            "sat" => Ok(true),
            "unsat" => Ok(false),
            "unknown" => Err(SolverError::UnknownVerdict),
            other => Err(SolverError::UnexpectedResponse {
                expected: "sat|unsat|unknown",
                got: other.to_string(),
            }),
        }
    }

    fn read_model(&mut self) -> Result<String, SolverError> {
        self.command("(get-model)")?;
        let mut text = String::new();
        let mut depth: i64 = 0;
        loop {
            let line = self.read_line()?;
            depth += line.matches('(').count() as i64;
            depth -= line.matches(')').count() as i64;
            text.push_str(&line);
            text.push('\n');
            if depth <= 0 {
                break;
            }
        }
        Ok(text)
    }

    fn command(&mut self, line: &str) -> Result<(), SolverError> {
        trace!(target: "probound::smt", "{line}");
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, SolverError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.stdout.read_line(&mut line)?;
            if n == 0 {
                return Err(SolverError::ProcessExited);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }

    fn expect_success(&mut self) -> Result<(), SolverError> {
        let reply = self.read_line()?;
        if reply == "success" {
            Ok(())
        } else {
            Err(SolverError::UnexpectedResponse { expected: "success", got: reply })
        }
    }
}

impl Drop for SmtProcess {
    fn drop(&mut self) {
        let _ = self.stdin.write_all(b"(exit)\n");
        let _ = self.stdin.flush();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn sort_name(sort: Sort) -> &'static str {
    match sort {
        Sort::Bool => "Bool",
        Sort::Int => "Int",
        Sort::Real => "Real",
    }
}

/// Render `id` as an SMT-LIB2 s-expression.
pub fn write_term(store: &TermStore, id: TermId, out: &mut String) {
    let node = store.node(id);
    match (node.op, &node.payload) {
        (Op::True, _) => out.push_str("true"),
        (Op::False, _) => out.push_str("false"),
        (Op::IntLit, Payload::Int(value)) => {
            if value.is_negative() {
                out.push_str(&format!("(- {})", value.magnitude()));
            } else {
                out.push_str(&value.to_string());
            }
        }
        (Op::RealLit, Payload::Real(value)) => write_rational(value, out),
        (Op::Var, Payload::Sym(name)) => out.push_str(name),
        (Op::FunSym, Payload::Fun(name, _, _)) => out.push_str(name),
        (Op::Apply, _) => {
            out.push('(');
            for (i, child) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_term(store, *child, out);
            }
            out.push(')');
        }
        (op, _) => {
            let head = match op {
                Op::Not => "not",
                Op::And => "and",
                Op::Or => "or",
                Op::Implies => "=>",
                Op::Iff | Op::Eq => "=",
                Op::Le => "<=",
                Op::Lt => "<",
                Op::Ge => ">=",
                Op::Gt => ">",
                Op::Add => "+",
                Op::Sub => "-",
                Op::Mul => "*",
                Op::Ite => "ite",
                Op::ToReal => "to_real",
                _ => unreachable!("leaf handled above"),
            };
            out.push('(');
            out.push_str(head);
            for child in &node.children {
                out.push(' ');
                write_term(store, *child, out);
            }
            out.push(')');
        }
    }
}

fn write_rational(value: &BigRational, out: &mut String) {
    if value.is_negative() {
        out.push_str("(- ");
        write_rational(&-value.clone(), out);
        out.push(')');
        return;
    }
    if value.is_integer() {
        out.push_str(&format!("{}.0", value.to_integer()));
    } else {
        out.push_str(&format!("(/ {}.0 {}.0)", value.numer(), value.denom()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigInt;

    #[test]
    fn renders_nested_formulae() {
        let mut store = TermStore::new();
        let x = store.var("x", Sort::Int);
        let zero = store.int(0);
        let ge = store.ge(x, zero);
        let p = store.fun("P_1", vec![Sort::Int], Sort::Real);
        let app = store.apply(p, vec![x]);
        let bound = store.real_frac(99, 100);
        let gt = store.gt(app, bound);
        let f = store.and(vec![ge, gt]);
        let mut text = String::new();
        write_term(&store, f, &mut text);
        assert_eq!(text, "(and (>= x 0) (> (P_1 x) (/ 99.0 100.0)))");
    }

    #[test]
    fn renders_negative_literals_prefix_style() {
        let mut store = TermStore::new();
        let neg = store.int(BigInt::from(-3));
        let mut text = String::new();
        write_term(&store, neg, &mut text);
        assert_eq!(text, "(- 3)");

        let negr = store.real_frac(-1, 2);
        let mut text = String::new();
        write_term(&store, negr, &mut text);
        assert_eq!(text, "(- (/ 1.0 2.0))");
    }

    #[test]
    fn integral_reals_render_with_decimal_point() {
        let mut store = TermStore::new();
        let two = store.real_frac(2, 1);
        let mut text = String::new();
        write_term(&store, two, &mut text);
        assert_eq!(text, "2.0");
    }
}
