//! Summation normal form of the loop and of expectations
//!
//! The loop-free body of `while (B) { body }` denotes a finite sub-distribution
//! over variable updates, conditioned on guards. Expanding it left to right
//! yields the summation normal form: a list of branches
//! `(guard, probability, substitution, tick)` whose guards carry `B` as the
//! leading conjunct, plus the termination guard `done = ¬B`. Substitutions are
//! totalized over every declared variable so each one is a complete state
//! update.
//!
//! Expectations (`post` and candidate bounds) normalize into `(guard, arith)`
//! summand pairs: products distribute over sums, Iverson factors conjoin into
//! the guard, everything else multiplies into the arithmetic part. The pairs
//! need not partition the state space — the characteristic functional builds
//! the partition afterwards.

#![forbid(unsafe_code)]

use ahash::AHashMap;
use num_rational::BigRational;
use num_traits::{One, Zero};
use smol_str::SmolStr;

use crate::pgcl::{BinOp, Expr, Instr, Program, RejectError, UnOp};

/// One branch of the loop body in summation normal form.
#[derive(Clone, Debug)]
pub struct BodyBranch {
    /// `B ∧ branch condition`, evaluated in the state at loop entry.
    pub guard: Expr,
    /// Constant branch probability.
    pub prob: BigRational,
    /// Total variable update, in declaration order.
    pub subst: Vec<(SmolStr, Expr)>,
    /// Runtime cost accrued on this branch (`ert` mode).
    pub tick: BigRational,
}

/// The loop in summation normal form.
#[derive(Clone, Debug)]
pub struct LoopSnf {
    /// All body branches.
    pub branches: Vec<BodyBranch>,
    /// `¬B`.
    pub done: Expr,
}

/// Compute the summation normal form of the program's single loop.
pub fn loop_snf(program: &Program) -> Result<LoopSnf, RejectError> {
    let (loop_guard, body) = crate::pgcl::one_big_loop(program)?;
    let declared: Vec<SmolStr> = program.declarations.iter().map(|(n, _)| n.clone()).collect();

    let seed = PartialBranch {
        condition: Expr::BoolLit(true),
        prob: BigRational::one(),
        subst: AHashMap::new(),
        tick: BigRational::zero(),
    };
    let expanded = expand_instrs(body, vec![seed], &declared)?;

    let branches = expanded
        .into_iter()
        .map(|branch| {
            let guard = conjoin(loop_guard.clone(), branch.condition);
            let subst = declared
                .iter()
                .map(|name| {
                    let value =
                        branch.subst.get(name).cloned().unwrap_or_else(|| Expr::Var(name.clone()));
                    (name.clone(), value)
                })
                .collect();
            BodyBranch { guard, prob: branch.prob, subst, tick: branch.tick }
        })
        .collect();

    let done = Expr::Unary(UnOp::Not, Box::new(loop_guard.clone()));
    Ok(LoopSnf { branches, done })
}

#[derive(Clone)]
struct PartialBranch {
    condition: Expr,
    prob: BigRational,
    subst: AHashMap<SmolStr, Expr>,
    tick: BigRational,
}

fn expand_instrs(
    instrs: &[Instr],
    mut branches: Vec<PartialBranch>,
    declared: &[SmolStr],
) -> Result<Vec<PartialBranch>, RejectError> {
    for instr in instrs {
        branches = expand_instr(instr, branches, declared)?;
    }
    Ok(branches)
}

fn expand_instr(
    instr: &Instr,
    branches: Vec<PartialBranch>,
    declared: &[SmolStr],
) -> Result<Vec<PartialBranch>, RejectError> {
    match instr {
        Instr::Skip => Ok(branches),
        Instr::Assign(name, value) => {
            if !declared.contains(name) {
                return Err(RejectError::UnknownVariable(name.to_string()));
            }
            Ok(branches
                .into_iter()
                .map(|mut branch| {
                    let rewritten = apply_subst(value, &branch.subst);
                    branch.subst.insert(name.clone(), rewritten);
                    branch
                })
                .collect())
        }
        Instr::Tick(amount) => {
            let value = amount.constant().ok_or(RejectError::NonLiteralTick)?;
            Ok(branches
                .into_iter()
                .map(|mut branch| {
                    branch.tick += value.clone();
                    branch
                })
                .collect())
        }
        Instr::Choice(lhs, prob, rhs) => {
            let mut out = Vec::new();
            let complement = BigRational::one() - prob.clone();
            let left_seed: Vec<PartialBranch> = branches
                .iter()
                .cloned()
                .map(|mut b| {
                    b.prob *= prob.clone();
                    b
                })
                .collect();
            out.extend(expand_instrs(lhs, left_seed, declared)?);
            let right_seed: Vec<PartialBranch> = branches
                .into_iter()
                .map(|mut b| {
                    b.prob *= complement.clone();
                    b
                })
                .collect();
            out.extend(expand_instrs(rhs, right_seed, declared)?);
            Ok(out)
        }
        Instr::If(cond, then_branch, else_branch) => {
            let mut out = Vec::new();
            let taken: Vec<PartialBranch> = branches
                .iter()
                .cloned()
                .map(|mut b| {
                    let c = apply_subst(cond, &b.subst);
                    b.condition = conjoin(b.condition, c);
                    b
                })
                .collect();
            out.extend(expand_instrs(then_branch, taken, declared)?);
            let skipped: Vec<PartialBranch> = branches
                .into_iter()
                .map(|mut b| {
                    let c = apply_subst(cond, &b.subst);
                    b.condition = conjoin(b.condition, Expr::Unary(UnOp::Not, Box::new(c)));
                    b
                })
                .collect();
            out.extend(expand_instrs(else_branch, skipped, declared)?);
            Ok(out)
        }
        Instr::While(_, _) => Err(RejectError::NestedLoop),
    }
}

/// Rewrite `expr` under a variable substitution.
pub fn apply_subst(expr: &Expr, subst: &AHashMap<SmolStr, Expr>) -> Expr {
    match expr {
        Expr::Var(name) => subst.get(name).cloned().unwrap_or_else(|| expr.clone()),
        Expr::Unary(op, inner) => Expr::Unary(*op, Box::new(apply_subst(inner, subst))),
        Expr::Binary(op, lhs, rhs) => Expr::Binary(
            *op,
            Box::new(apply_subst(lhs, subst)),
            Box::new(apply_subst(rhs, subst)),
        ),
        _ => expr.clone(),
    }
}

fn conjoin(lhs: Expr, rhs: Expr) -> Expr {
    match (&lhs, &rhs) {
        (Expr::BoolLit(true), _) => rhs,
        (_, Expr::BoolLit(true)) => lhs,
        _ => Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs)),
    }
}

/// Normalize an expectation into `(guard, arith)` summand pairs.
///
/// Sums concatenate; products distribute and split their factors into Iverson
/// guards (conjoined) and arithmetic factors (multiplied); a bare Iverson
/// bracket contributes weight one; everything else is a whole summand.
pub fn normalize_expectation(expr: &Expr) -> Vec<(Expr, Expr)> {
    match expr {
        Expr::Binary(BinOp::Add, lhs, rhs) => {
            let mut pairs = normalize_expectation(lhs);
            pairs.extend(normalize_expectation(rhs));
            pairs
        }
        Expr::Binary(BinOp::Mul, lhs, rhs) => {
            let left = normalize_expectation(lhs);
            let right = normalize_expectation(rhs);
            let mut pairs = Vec::with_capacity(left.len() * right.len());
            for (lg, la) in &left {
                for (rg, ra) in &right {
                    let guard = conjoin(lg.clone(), rg.clone());
                    let arith = multiply(la.clone(), ra.clone());
                    pairs.push((guard, arith));
                }
            }
            pairs
        }
        Expr::Unary(UnOp::Iverson, guard) => {
            vec![((**guard).clone(), Expr::NatLit(1.into()))]
        }
        _ => vec![(Expr::BoolLit(true), expr.clone())],
    }
}

fn multiply(lhs: Expr, rhs: Expr) -> Expr {
    match (&lhs, &rhs) {
        (Expr::NatLit(n), _) if n.is_one() => rhs,
        (_, Expr::NatLit(n)) if n.is_one() => lhs,
        _ => Expr::Binary(BinOp::Mul, Box::new(lhs), Box::new(rhs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgcl::{parse_expectation, parse_program};

    const GEO: &str = "
        nat c;
        nat f;
        while (f = 1) {
            { f := 0 } [0.5] { c := c + 1 }
        }
    ";

    #[test]
    fn geometric_body_has_two_branches() {
        let program = parse_program(GEO).unwrap();
        let snf = loop_snf(&program).unwrap();
        assert_eq!(snf.branches.len(), 2);
        for branch in &snf.branches {
            assert_eq!(branch.prob, BigRational::new(1.into(), 2.into()));
            assert_eq!(branch.subst.len(), 2, "substitutions are totalized");
            assert!(branch.tick.is_zero());
        }
        // Left branch kills the flag, right branch counts.
        assert_eq!(snf.branches[0].subst[1], ("f".into(), Expr::NatLit(0.into())));
        match &snf.branches[1].subst[0] {
            (name, Expr::Binary(BinOp::Add, _, _)) => assert_eq!(name, "c"),
            other => panic!("expected c := c + 1, got {other:?}"),
        }
    }

    #[test]
    fn sequencing_composes_substitutions() {
        let src = "
            nat sent;
            nat failed;
            while (sent < 10) {
                { failed := 0; sent := sent + 1 } [0.9] { failed := failed + 1 }
            }
        ";
        let program = parse_program(src).unwrap();
        let snf = loop_snf(&program).unwrap();
        assert_eq!(snf.branches.len(), 2);
        let success = &snf.branches[0];
        assert_eq!(success.subst[1], ("failed".into(), Expr::NatLit(0.into())));
        assert_eq!(success.prob, BigRational::new(9.into(), 10.into()));
    }

    #[test]
    fn branch_conditions_see_earlier_assignments() {
        let src = "
            nat k;
            while (k < 5) {
                k := k + 1;
                if (k = 3) { k := 0 } { skip }
            }
        ";
        let program = parse_program(src).unwrap();
        let snf = loop_snf(&program).unwrap();
        assert_eq!(snf.branches.len(), 2);
        // The condition must be (k+1) = 3, not k = 3.
        let taken = &snf.branches[0];
        let printed = format!("{:?}", taken.guard);
        assert!(printed.contains("Add"), "guard should mention k+1: {printed}");
    }

    #[test]
    fn nested_choice_multiplies_probabilities() {
        let src = "
            nat x;
            while (x = 0) {
                { { x := 1 } [0.5] { x := 2 } } [0.4] { skip }
            }
        ";
        let program = parse_program(src).unwrap();
        let snf = loop_snf(&program).unwrap();
        let probs: Vec<BigRational> = snf.branches.iter().map(|b| b.prob.clone()).collect();
        assert!(probs.contains(&BigRational::new(1.into(), 5.into())));
        assert!(probs.contains(&BigRational::new(3.into(), 5.into())));
    }

    #[test]
    fn ticks_accumulate_and_must_be_literals() {
        let src = "
            nat x;
            while (0 < x) {
                tick(1);
                x := x - 1;
                tick(2)
            }
        ";
        let program = parse_program(src).unwrap();
        let snf = loop_snf(&program).unwrap();
        assert_eq!(snf.branches.len(), 1);
        assert_eq!(snf.branches[0].tick, BigRational::from_integer(3.into()));

        let bad = "
            nat x;
            while (0 < x) { tick(x) }
        ";
        let program = parse_program(bad).unwrap();
        assert!(matches!(loop_snf(&program), Err(RejectError::NonLiteralTick)));
    }

    #[test]
    fn expectation_pairs_split_guards_from_weights() {
        let e = parse_expectation("[f=1]*(c+1) + [not (f=1)]*c").unwrap();
        let pairs = normalize_expectation(&e);
        assert_eq!(pairs.len(), 2);
        assert!(matches!(pairs[0].0, Expr::Binary(BinOp::Eq, _, _)));
        assert!(matches!(pairs[1].0, Expr::Unary(UnOp::Not, _)));
    }

    #[test]
    fn bare_arithmetic_normalizes_with_true_guards() {
        let e = parse_expectation("c + 0.99").unwrap();
        let pairs = normalize_expectation(&e);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, Expr::BoolLit(true));
        assert_eq!(pairs[1].0, Expr::BoolLit(true));
    }

    #[test]
    fn constant_products_stay_single_summands() {
        let e = parse_expectation("[x=0]*0.35*0.4").unwrap();
        let pairs = normalize_expectation(&e);
        assert_eq!(pairs.len(), 1);
    }
}
