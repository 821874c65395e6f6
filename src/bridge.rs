//! Expression bridge: pGCL AST to typed SMT terms
//!
//! Lowering is driven by a small options struct per call site:
//!
//! - `to_real` — arithmetic expectation parts live in `Real`; variables and
//!   nat literals are cast on the way in. Guards and substitution values stay
//!   in `Int`.
//! - `monus` — when set, `a - b` lowers to `Monus(a, b)` (or `RMonus` in real
//!   context) and the pair is recorded in the accumulator so the generators
//!   can axiomatize it. The accumulator is explicit state threaded through
//!   every call; nothing hides in globals.
//! - `allow_infinity` — `\infty` lowers to the unconstrained real symbol, but
//!   only as a whole summand: as an operand of `+`, `-` or `*` it is an error.
//!
//! `=` between Boolean operands becomes an equivalence, everything else
//! arithmetic equality. Iverson brackets are dropped; the caller multiplies
//! the contained Boolean into its enclosing expectation summand.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use ahash::{AHashMap, AHashSet};
use smol_str::SmolStr;

use crate::pgcl::{BinOp, Expr, UnOp};
use crate::term::{Sort, TermId, TermStore};

/// SMT-side incarnation of the program: variable symbols, the infinity
/// placeholder and the two monus function symbols.
pub struct SmtEnv {
    /// Program variable symbols (`Int`), in declaration order.
    pub vars: Vec<TermId>,
    /// Variable lookup by name.
    pub by_name: AHashMap<SmolStr, TermId>,
    /// Unconstrained `Real` symbol standing in for `∞`.
    pub infinity: TermId,
    /// `Monus : Int × Int → Int`.
    pub monus: TermId,
    /// `RMonus : Real × Real → Real`.
    pub rmonus: TermId,
}

impl SmtEnv {
    /// Build the environment for the given declaration-ordered variables.
    pub fn new(store: &mut TermStore, names: &[SmolStr]) -> Self {
        let vars: Vec<TermId> = names.iter().map(|n| store.var(n, Sort::Int)).collect();
        let by_name = names.iter().cloned().zip(vars.iter().copied()).collect();
        let infinity = store.var("infinity", Sort::Real);
        let monus = store.fun("Monus", vec![Sort::Int, Sort::Int], Sort::Int);
        let rmonus = store.fun("RMonus", vec![Sort::Real, Sort::Real], Sort::Real);
        Self { vars, by_name, infinity, monus, rmonus }
    }
}

/// Deferred truncated-subtraction pairs, deduplicated, in discovery order.
#[derive(Default)]
pub struct MonusPairs {
    pairs: Vec<(TermId, TermId)>,
    seen: AHashSet<(TermId, TermId)>,
}

impl MonusPairs {
    fn insert(&mut self, lhs: TermId, rhs: TermId) {
        if self.seen.insert((lhs, rhs)) {
            self.pairs.push((lhs, rhs));
        }
    }

    /// Recorded pairs in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (TermId, TermId)> + '_ {
        self.pairs.iter().copied()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of recorded pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// Integer and real monus pairs encountered while lowering.
#[derive(Default)]
pub struct MonusAccumulator {
    /// Pairs for `Monus`.
    pub int: MonusPairs,
    /// Pairs for `RMonus`.
    pub real: MonusPairs,
}

/// Per-call lowering options.
#[derive(Clone, Copy)]
pub struct LowerOpts {
    /// Cast variables and nat literals to `Real`.
    pub to_real: bool,
    /// Rewrite `-` to the appropriate monus function.
    pub monus: bool,
    /// Permit `\infty` as a whole summand.
    pub allow_infinity: bool,
}

impl LowerOpts {
    /// Integer context for guards and substitution values.
    pub fn guard() -> Self {
        Self { to_real: false, monus: true, allow_infinity: false }
    }

    /// Integer context that may mention `∞` (e.g. `done`, expectation guards).
    pub fn guard_with_infinity() -> Self {
        Self { to_real: false, monus: true, allow_infinity: true }
    }

    /// Real context for expectation arithmetic.
    pub fn arith() -> Self {
        Self { to_real: true, monus: true, allow_infinity: true }
    }
}

/// Lowering failures.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("infinity must not occur in a composed arithmetic expression")]
    InfinityComposed,
    #[error("infinity is not allowed in this position")]
    InfinityNotAllowed,
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("division must be between constants")]
    UnsupportedDivision,
}

/// Lower an expression to a term.
pub fn lower_expr(
    store: &mut TermStore,
    env: &SmtEnv,
    pairs: &mut MonusAccumulator,
    expr: &Expr,
    opts: LowerOpts,
) -> Result<TermId, BridgeError> {
    match expr {
        Expr::BoolLit(value) => Ok(store.bool_const(*value)),
        Expr::NatLit(value) => {
            if opts.to_real {
                Ok(store.real(num_rational::BigRational::from_integer(value.clone())))
            } else {
                Ok(store.int(value.clone()))
            }
        }
        Expr::RealLit(value) => Ok(store.real(value.clone())),
        Expr::Infinity => {
            if opts.allow_infinity {
                Ok(env.infinity)
            } else {
                Err(BridgeError::InfinityNotAllowed)
            }
        }
        Expr::Var(name) => {
            let symbol = env
                .by_name
                .get(name)
                .copied()
                .ok_or_else(|| BridgeError::UnknownVariable(name.to_string()))?;
            if opts.to_real {
                Ok(store.to_real(symbol))
            } else {
                Ok(symbol)
            }
        }
        Expr::Unary(UnOp::Not, inner) => {
            let inner = lower_expr(store, env, pairs, inner, opts)?;
            Ok(store.not(inner))
        }
        // The bracket is dropped; the contained Boolean is the result.
        Expr::Unary(UnOp::Iverson, inner) => lower_expr(store, env, pairs, inner, opts),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = lower_expr(store, env, pairs, lhs, opts)?;
            let rhs = lower_expr(store, env, pairs, rhs, opts)?;
            match op {
                BinOp::Or => Ok(store.or(vec![lhs, rhs])),
                BinOp::And => Ok(store.and(vec![lhs, rhs])),
                BinOp::Le => Ok(store.le(lhs, rhs)),
                BinOp::Lt => Ok(store.lt(lhs, rhs)),
                BinOp::Eq => Ok(store.eq(lhs, rhs)),
                BinOp::Add => {
                    check_composed(env, lhs, rhs)?;
                    Ok(store.add(vec![lhs, rhs]))
                }
                BinOp::Mul => {
                    check_composed(env, lhs, rhs)?;
                    Ok(store.mul(vec![lhs, rhs]))
                }
                BinOp::Sub => {
                    check_composed(env, lhs, rhs)?;
                    if opts.monus {
                        if opts.to_real {
                            pairs.real.insert(lhs, rhs);
                            Ok(store.apply(env.rmonus, vec![lhs, rhs]))
                        } else {
                            pairs.int.insert(lhs, rhs);
                            Ok(store.apply(env.monus, vec![lhs, rhs]))
                        }
                    } else {
                        Ok(store.sub(lhs, rhs))
                    }
                }
                BinOp::Div => Err(BridgeError::UnsupportedDivision),
            }
        }
    }
}

fn check_composed(env: &SmtEnv, lhs: TermId, rhs: TermId) -> Result<(), BridgeError> {
    if lhs == env.infinity || rhs == env.infinity {
        Err(BridgeError::InfinityComposed)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgcl::parse_expectation;
    use crate::term::Op;

    fn setup() -> (TermStore, SmtEnv, MonusAccumulator) {
        let mut store = TermStore::new();
        let env = SmtEnv::new(&mut store, &["c".into(), "f".into()]);
        (store, env, MonusAccumulator::default())
    }

    #[test]
    fn guards_lower_to_integer_comparisons() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("f = 1").unwrap();
        let t = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::guard()).unwrap();
        assert_eq!(store.op(t), Op::Eq);
        assert!(pairs.int.is_empty());
    }

    #[test]
    fn minus_becomes_monus_and_is_recorded_once() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("c - 1").unwrap();
        let a = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::guard()).unwrap();
        let b = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::guard()).unwrap();
        assert_eq!(a, b, "re-lowering is identical");
        assert_eq!(store.op(a), Op::Apply);
        assert_eq!(store.node(a).children[0], env.monus);
        assert_eq!(pairs.int.len(), 1);
        assert!(pairs.real.is_empty());
    }

    #[test]
    fn real_context_uses_rmonus_and_casts() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("c - 1").unwrap();
        let t = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::arith()).unwrap();
        assert_eq!(store.node(t).children[0], env.rmonus);
        assert_eq!(store.sort(t), Sort::Real);
        assert_eq!(pairs.real.len(), 1);
        assert!(pairs.int.is_empty());
    }

    #[test]
    fn standalone_infinity_is_the_placeholder_symbol() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("\\infty").unwrap();
        let t = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::arith()).unwrap();
        assert_eq!(t, env.infinity);
    }

    #[test]
    fn composed_infinity_is_rejected() {
        let (mut store, env, mut pairs) = setup();
        for src in ["\\infty + 1", "c * \\infty", "\\infty - c"] {
            let e = parse_expectation(src).unwrap();
            let r = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::arith());
            assert!(
                matches!(r, Err(BridgeError::InfinityComposed)),
                "{src} should be rejected"
            );
        }
    }

    #[test]
    fn infinity_needs_permission() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("\\infty").unwrap();
        let r = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::guard());
        assert!(matches!(r, Err(BridgeError::InfinityNotAllowed)));
    }

    #[test]
    fn iverson_brackets_are_dropped() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("[f=1]").unwrap();
        let t = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::guard()).unwrap();
        assert_eq!(store.sort(t), Sort::Bool);
    }

    #[test]
    fn boolean_equality_becomes_equivalence() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("(f=1) = (c=0)").unwrap();
        let t = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::guard()).unwrap();
        assert_eq!(store.op(t), Op::Iff);
    }

    #[test]
    fn unknown_variables_are_reported() {
        let (mut store, env, mut pairs) = setup();
        let e = parse_expectation("ghost + 1").unwrap();
        let r = lower_expr(&mut store, &env, &mut pairs, &e, LowerOpts::guard());
        assert!(matches!(r, Err(BridgeError::UnknownVariable(_))));
    }
}
