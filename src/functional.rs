//! Characteristic functional of the loop
//!
//! Lifts the summation normal form to the two guard partitions every encoding
//! is built from:
//!
//! - the **loop-execute DNF** — pairwise-exclusive guards under which the
//!   loop body fires, each carrying its `(probability, substitution, tick)`
//!   updates, and
//! - the **loop-terminated DNF** — pairwise-exclusive guards under which the
//!   loop is done, each carrying the postexpectation's value as a real term.
//!
//! Mutual exclusivity is what lets the generators pin one arithmetic
//! definition of `P_i` per guard without contradicting themselves. The
//! `{T,F}^m` sign assignments are enumerated as a tree and pruned at the
//! first UNSAT prefix; a dedicated solver instance owned by the functional
//! answers the pruning queries.
//!
//! Candidate upper bounds go through the same machinery via
//! [`CharacteristicFunctional::upper_bound_dnf`], in two flavours: the finite
//! one for refutation queries (summands equal to `∞` can never be exceeded
//! and are dropped) and the total one for the pointwise-minimum encoding,
//! which is verified to cover every non-negative state.

#![forbid(unsafe_code)]

use smol_str::SmolStr;
use tracing::{debug, info};

use crate::bridge::{lower_expr, LowerOpts, MonusAccumulator, SmtEnv};
use crate::pgcl::{self, Program};
use crate::snf;
use crate::solver::{Logic, SmtProcess, SolverError};
use crate::stats::Statistics;
use crate::subst::{Simplifier, Substitution};
use crate::term::{TermId, TermStore};
use crate::CheckError;

/// One loop-execute partition class.
#[derive(Clone, Debug)]
pub struct LoopExecuteEntry {
    /// Partition guard (does not include the non-negativity constraints).
    pub guard: TermId,
    /// Updates that fire under this guard.
    pub updates: Vec<ProbSubstTick>,
}

/// One weighted update of a loop-execute entry.
#[derive(Clone, Debug)]
pub struct ProbSubstTick {
    /// Branch probability as a real literal.
    pub prob: TermId,
    /// Total variable substitution.
    pub subst: Substitution,
    /// Branch runtime cost as a real literal.
    pub tick: TermId,
}

/// The characteristic functional, built once per verification job.
pub struct CharacteristicFunctional {
    env: SmtEnv,
    /// Monus pairs recorded while lowering; the generators axiomatize them.
    pub monus: MonusAccumulator,
    loop_execute: Vec<LoopExecuteEntry>,
    loop_terminated: Vec<(TermId, TermId)>,
    substitutions: Vec<Substitution>,
    done: TermId,
    non_negative: TermId,
    non_negative_constraints: Vec<TermId>,
    is_linear: bool,
    prune_solver: SmtProcess,
    simplifier: Simplifier,
}

impl CharacteristicFunctional {
    /// Build the functional for `program` and the postexpectation `post`.
    pub fn new(
        store: &mut TermStore,
        program: &Program,
        post: &str,
        stats: &mut Statistics,
    ) -> Result<Self, CheckError> {
        pgcl::check_nat_declarations(program)?;
        let names: Vec<SmolStr> = program.declarations.iter().map(|(n, _)| n.clone()).collect();
        let env = SmtEnv::new(store, &names);
        let mut monus = MonusAccumulator::default();
        let mut simplifier = Simplifier::new();
        let mut prune_solver = SmtProcess::spawn(Logic::All)?;
        let is_linear = pgcl::program_is_linear(program);

        let loop_snf = snf::loop_snf(program)?;

        // Lower the body branches. Guards and probabilities are simplified
        // here; substitutions compose trivial conjuncts into them later.
        let mut tuples: Vec<(TermId, TermId, Substitution, TermId)> = Vec::new();
        for branch in &loop_snf.branches {
            let guard = lower_expr(store, &env, &mut monus, &branch.guard, LowerOpts::guard())?;
            let guard = simplifier.simplify(store, guard);
            let prob = store.real(branch.prob.clone());
            let tick = store.real(branch.tick.clone());
            let mut subst = Substitution::new();
            for (name, expr) in &branch.subst {
                let symbol = env.by_name[name];
                let value =
                    lower_expr(store, &env, &mut monus, expr, LowerOpts::guard_with_infinity())?;
                subst.insert(symbol, value);
            }
            tuples.push((guard, prob, subst, tick));
        }
        debug!(count = tuples.len(), "summation normal form before pruning");

        // Drop branches whose guard alone is already unsatisfiable.
        let mut live = Vec::new();
        for tuple in tuples {
            if prune_solver.is_sat_timed(store, Some(tuple.0), &mut stats.sat_check_time)? {
                live.push(tuple);
            }
        }
        debug!(count = live.len(), "summation normal form after pruning");

        let non_negative_constraints: Vec<TermId> = env
            .vars
            .iter()
            .map(|&v| {
                let zero = store.int(0);
                store.ge(v, zero)
            })
            .collect();
        let non_negative = store.and(non_negative_constraints.clone());

        let loop_execute = build_loop_execute_dnf(
            store,
            &mut prune_solver,
            &mut simplifier,
            stats,
            &live,
            non_negative,
        )?;
        info!(entries = loop_execute.len(), "loop-execute partition");

        let done = lower_expr(store, &env, &mut monus, &loop_snf.done, LowerOpts::guard_with_infinity())?;

        let post_expr = pgcl::parse_expectation(post)?;
        let is_linear = is_linear && pgcl::expr_is_linear(&post_expr);
        let post_pairs = lower_expectation_pairs(store, &env, &mut monus, &post_expr)?;
        let loop_terminated = build_guarded_sum_dnf(
            store,
            &mut prune_solver,
            &mut simplifier,
            stats,
            &post_pairs,
            &[done, non_negative],
            &[done],
            None,
        )?;
        info!(entries = loop_terminated.len(), "loop-terminated partition");

        // Deduplicated substitution list Σ, in first-seen order.
        let mut substitutions: Vec<Substitution> = Vec::new();
        for entry in &loop_execute {
            for update in &entry.updates {
                if !substitutions.contains(&update.subst) {
                    substitutions.push(update.subst.clone());
                }
            }
        }

        Ok(Self {
            env,
            monus,
            loop_execute,
            loop_terminated,
            substitutions,
            done,
            non_negative,
            non_negative_constraints,
            is_linear,
            prune_solver,
            simplifier,
        })
    }

    /// DNF of a candidate upper bound. With `ignore_infinity` set, classes
    /// whose value is `∞` are discarded (nothing exceeds `∞`); otherwise the
    /// guards are checked to cover every non-negative state.
    pub fn upper_bound_dnf(
        &mut self,
        store: &mut TermStore,
        bound: &str,
        ignore_infinity: bool,
        stats: &mut Statistics,
    ) -> Result<Vec<(TermId, TermId)>, CheckError> {
        let expr = pgcl::parse_expectation(bound)?;
        self.is_linear = self.is_linear && pgcl::expr_is_linear(&expr);
        let pairs = lower_expectation_pairs(store, &self.env, &mut self.monus, &expr)?;
        let skip = if ignore_infinity { Some(self.env.infinity) } else { None };
        let dnf = build_guarded_sum_dnf(
            store,
            &mut self.prune_solver,
            &mut self.simplifier,
            stats,
            &pairs,
            &[self.non_negative],
            &[],
            skip,
        )?;
        info!(
            entries = dnf.len(),
            ignore_infinity, "candidate upper bound partition"
        );

        if !ignore_infinity {
            // Used in a pointwise-minimum computation: the classes must
            // partition all non-negative states.
            let guards: Vec<TermId> = dnf.iter().map(|(g, _)| *g).collect();
            let covered = store.or(guards);
            let uncovered = store.not(covered);
            let test = store.and(vec![self.non_negative, uncovered]);
            if self
                .prune_solver
                .is_sat_timed(store, Some(test), &mut stats.sat_check_time)?
            {
                return Err(CheckError::UpperBoundNotTotal);
            }
        }
        Ok(dnf)
    }

    /// Loop-execute partition.
    pub fn loop_execute_dnf(&self) -> &[LoopExecuteEntry] {
        &self.loop_execute
    }

    /// Loop-terminated partition.
    pub fn loop_terminated_dnf(&self) -> &[(TermId, TermId)] {
        &self.loop_terminated
    }

    /// Deduplicated substitutions seen on execution (Σ).
    pub fn substitutions(&self) -> &[Substitution] {
        &self.substitutions
    }

    /// `¬B`.
    pub fn done(&self) -> TermId {
        self.done
    }

    /// Program variable symbols in declaration order; also the outer
    /// argument tuple of every `P_i` and `K_i` application.
    pub fn vars_argument(&self) -> &[TermId] {
        &self.env.vars
    }

    /// The SMT-side environment (variables, infinity, monus symbols).
    pub fn env(&self) -> &SmtEnv {
        &self.env
    }

    /// One `v >= 0` constraint per program variable.
    pub fn non_negative_constraints(&self) -> &[TermId] {
        &self.non_negative_constraints
    }

    /// Whether program, post- and (so far seen) bound expectations are linear.
    pub fn is_linear(&self) -> bool {
        self.is_linear
    }
}

/// Lower normalized `(guard, arith)` expectation pairs.
fn lower_expectation_pairs(
    store: &mut TermStore,
    env: &SmtEnv,
    monus: &mut MonusAccumulator,
    expr: &pgcl::Expr,
) -> Result<Vec<(TermId, TermId)>, CheckError> {
    let mut out = Vec::new();
    for (guard, arith) in snf::normalize_expectation(expr) {
        let g = lower_expr(store, env, monus, &guard, LowerOpts::guard_with_infinity())?;
        let a = lower_expr(store, env, monus, &arith, LowerOpts::arith())?;
        out.push((g, a));
    }
    Ok(out)
}

fn build_loop_execute_dnf(
    store: &mut TermStore,
    solver: &mut SmtProcess,
    simplifier: &mut Simplifier,
    stats: &mut Statistics,
    tuples: &[(TermId, TermId, Substitution, TermId)],
    non_negative: TermId,
) -> Result<Vec<LoopExecuteEntry>, CheckError> {
    let guards: Vec<TermId> = tuples.iter().map(|t| t.0).collect();
    let assignments =
        enumerate_assignments(store, solver, stats, &guards, &[non_negative])?;
    let zero = store.real_zero();

    let mut dnf = Vec::new();
    for (literals, flags) in assignments {
        let updates: Vec<ProbSubstTick> = flags
            .iter()
            .enumerate()
            .filter(|&(i, &b)| b && tuples[i].1 != zero)
            .map(|(i, _)| ProbSubstTick {
                prob: tuples[i].1,
                subst: tuples[i].2.clone(),
                tick: tuples[i].3,
            })
            .collect();
        // An all-negative class is the ¬B part of the functional; it belongs
        // to the loop-terminated partition, not here.
        if updates.is_empty() {
            continue;
        }
        let conj = store.and(literals);
        let guard = simplifier.simplify(store, conj);
        dnf.push(LoopExecuteEntry { guard, updates });
    }
    Ok(dnf)
}

/// Shared DNF builder for `(guard, arith)` pair lists: postexpectations and
/// candidate bounds. `fixed` conjuncts constrain satisfiability only;
/// `kept` conjuncts additionally become part of the emitted guards. Classes
/// with a summand equal to `skip_summand` are dropped.
#[allow(clippy::too_many_arguments)]
fn build_guarded_sum_dnf(
    store: &mut TermStore,
    solver: &mut SmtProcess,
    simplifier: &mut Simplifier,
    stats: &mut Statistics,
    pairs: &[(TermId, TermId)],
    fixed: &[TermId],
    kept: &[TermId],
    skip_summand: Option<TermId>,
) -> Result<Vec<(TermId, TermId)>, CheckError> {
    let guards: Vec<TermId> = pairs.iter().map(|p| p.0).collect();
    let assignments = enumerate_assignments(store, solver, stats, &guards, fixed)?;

    let mut dnf = Vec::new();
    for (mut literals, flags) in assignments {
        let selected: Vec<TermId> = flags
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b)
            .map(|(i, _)| pairs[i].1)
            .collect();
        if let Some(skip) = skip_summand {
            if selected.contains(&skip) {
                continue;
            }
        }
        literals.extend_from_slice(kept);
        let conj = store.and(literals);
        let guard = simplifier.simplify(store, conj);
        let sum = if selected.is_empty() { store.real_zero() } else { store.add(selected) };
        let arith = simplifier.simplify(store, sum);
        dnf.push((guard, arith));
    }
    Ok(dnf)
}

/// Enumerate the satisfiable sign assignments over `guards`, conjoined with
/// `fixed`, pruning every subtree whose prefix is already UNSAT. Returns the
/// chosen literals and the sign flags per surviving assignment.
fn enumerate_assignments(
    store: &mut TermStore,
    solver: &mut SmtProcess,
    stats: &mut Statistics,
    guards: &[TermId],
    fixed: &[TermId],
) -> Result<Vec<(Vec<TermId>, Vec<bool>)>, SolverError> {
    fn descend(
        store: &mut TermStore,
        solver: &mut SmtProcess,
        stats: &mut Statistics,
        guards: &[TermId],
        fixed: &[TermId],
        literals: &mut Vec<TermId>,
        flags: &mut Vec<bool>,
        out: &mut Vec<(Vec<TermId>, Vec<bool>)>,
    ) -> Result<(), SolverError> {
        if flags.len() == guards.len() {
            out.push((literals.clone(), flags.clone()));
            return Ok(());
        }
        let next = guards[flags.len()];
        let negated = store.not(next);
        for (literal, flag) in [(next, true), (negated, false)] {
            literals.push(literal);
            flags.push(flag);
            let mut conj = literals.clone();
            conj.extend_from_slice(fixed);
            let test = store.and(conj);
            if solver.is_sat_timed(store, Some(test), &mut stats.sat_check_time)? {
                descend(store, solver, stats, guards, fixed, literals, flags, out)?;
            }
            literals.pop();
            flags.pop();
        }
        Ok(())
    }

    let mut out = Vec::new();
    let mut literals = Vec::new();
    let mut flags = Vec::new();
    descend(store, solver, stats, guards, fixed, &mut literals, &mut flags, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, solver_available};
    use crate::stats::{Statistics, TaskArgs};

    fn build(program_src: &str, post: &str) -> (TermStore, CharacteristicFunctional, Statistics) {
        let program = pgcl::parse_program(program_src).expect("parse");
        let mut store = TermStore::new();
        let mut stats = Statistics::new(TaskArgs::default());
        let cf = CharacteristicFunctional::new(&mut store, &program, post, &mut stats)
            .expect("characteristic functional");
        (store, cf, stats)
    }

    #[test]
    fn geometric_partitions_into_one_execute_and_one_terminated_class() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let (_store, cf, _stats) = build(fixtures::GEOMETRIC, "c");
        assert_eq!(cf.loop_execute_dnf().len(), 1);
        assert_eq!(cf.loop_execute_dnf()[0].updates.len(), 2);
        assert_eq!(cf.loop_terminated_dnf().len(), 1);
        assert_eq!(cf.substitutions().len(), 2);
    }

    #[test]
    fn partition_guards_are_mutually_exclusive_and_cover_everything() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        for (program, post) in
            [(fixtures::GEOMETRIC, "c"), (fixtures::BRP_TOTAL_FAILED, "totalFailed")]
        {
            let (mut store, cf, mut stats) = build(program, post);
            let mut solver = SmtProcess::spawn(Logic::All).expect("solver");
            let non_negative = store.and(cf.non_negative_constraints().to_vec());

            let mut guards: Vec<TermId> =
                cf.loop_execute_dnf().iter().map(|e| e.guard).collect();
            guards.extend(cf.loop_terminated_dnf().iter().map(|&(g, _)| g));

            for i in 0..guards.len() {
                for j in (i + 1)..guards.len() {
                    let overlap = store.and(vec![guards[i], guards[j], non_negative]);
                    let sat = solver
                        .is_sat_timed(&store, Some(overlap), &mut stats.sat_check_time)
                        .expect("overlap check");
                    assert!(
                        !sat,
                        "guards {} and {} overlap",
                        store.display(guards[i]),
                        store.display(guards[j])
                    );
                }
            }

            let any = store.or(guards);
            let uncovered = store.not(any);
            let gap = store.and(vec![non_negative, uncovered]);
            let sat = solver
                .is_sat_timed(&store, Some(gap), &mut stats.sat_check_time)
                .expect("coverage check");
            assert!(!sat, "some non-negative state is in no partition class");
        }
    }

    #[test]
    fn monus_axioms_stay_between_zero_and_the_minuend() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let (mut store, cf, mut stats) = build(fixtures::GEOMETRIC_MONUS, "c");
        assert!(!cf.monus.int.is_empty(), "the decrement records a monus pair");

        let mut solver = SmtProcess::spawn(Logic::All).expect("solver");
        let mut simplifier = Simplifier::new();
        let zero = store.int(0);
        let axioms =
            crate::bmc::monus_axioms(&mut store, &mut simplifier, cf.env().monus, &cf.monus.int, zero);
        let non_negative = store.and(cf.non_negative_constraints().to_vec());

        for (a, b) in cf.monus.int.iter() {
            let app = store.apply(cf.env().monus, vec![a, b]);
            let below_zero = store.lt(app, zero);
            let above_minuend = store.gt(app, a);
            let violation = store.or(vec![below_zero, above_minuend]);
            let mut conjuncts: Vec<TermId> = axioms.iter().copied().collect();
            conjuncts.push(non_negative);
            conjuncts.push(violation);
            let query = store.and(conjuncts);
            let sat = solver
                .is_sat_timed(&store, Some(query), &mut stats.sat_check_time)
                .expect("monus bound check");
            assert!(!sat, "monus axiom admits a value outside [0, a]");
        }
    }

    #[test]
    fn non_linear_bounds_downgrade_the_solver_logic() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let (mut store, mut cf, mut stats) = build(fixtures::GEOMETRIC, "c");
        assert!(cf.is_linear());
        cf.upper_bound_dnf(&mut store, "c*c + 1", true, &mut stats)
            .expect("non-linear partition");
        assert!(!cf.is_linear());
    }

    #[test]
    fn finite_bound_partition_drops_infinite_classes() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let (mut store, mut cf, mut stats) = build(fixtures::GEOMETRIC, "c");
        let bound = "[f=1]*c + [not (f=1)]*\\infty";
        let finite = cf
            .upper_bound_dnf(&mut store, bound, true, &mut stats)
            .expect("finite partition");
        let total = cf
            .upper_bound_dnf(&mut store, bound, false, &mut stats)
            .expect("total partition");
        assert_eq!(finite.len(), 1);
        assert_eq!(total.len(), 2);
        assert!(total.iter().any(|&(_, arith)| arith == cf.env().infinity));
    }
}
