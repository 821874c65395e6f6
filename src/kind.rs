//! Incremental k-induction
//!
//! Park-style proof search: the bound `I` is accepted once
//! `Φ(I ⊓ Ψ(I) ⊓ … ⊓ Ψᵏ⁻¹(I)) ≤ I` holds. The encoding layers on the BMC
//! formula generator — its `P_i` family now names `Φ(Ψ^{i-1}(I))` instead of
//! `Φ^i(0)` — and adds
//!
//! - **pointwise-minimum formulae** over a parallel family `K_i`: for every
//!   pair of partition classes of the functional and of `I`'s total DNF, two
//!   guarded equations pin `K_i(v̄)` to whichever of the running value and
//!   `I`'s value is smaller. The minimum is definable per class exactly
//!   because both partitions are mutually exclusive.
//! - **continuation formulae** pinning the innermost `P` to `I` itself,
//!   rewritten under every body substitution so they constrain the argument
//!   tuples the unrolling actually reaches.
//!
//! The induction query asks for a state where `P_1` exceeds `I` over the
//! finite bound classes; `∞`-classes cannot be exceeded, but they must stay
//! in the minimum and continuation encodings, which need `I`'s total DNF.
//! An UNSAT answer means `I` is k-inductive.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::bmc::BmcFormulaGenerator;
use crate::functional::CharacteristicFunctional;
use crate::pgcl;
use crate::solver::{Logic, SmtProcess};
use crate::stats::Statistics;
use crate::subst::{substitute_all, Simplifier, Substitution};
use crate::term::{TermId, TermStore};
use crate::{CheckError, CheckOptions};

/// Verdict of a k-induction run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindOutcome {
    /// The bound is k-inductive at the reached depth.
    Inductive,
    /// Not k-inductive within the iteration budget.
    Exhausted,
}

// ===========================================================================
// Formula generator
// ===========================================================================

/// Generates and advances the k-induction encoding on top of a BMC generator.
pub struct KindFormulaGenerator {
    bmc: BmcFormulaGenerator,
    eufs: Vec<TermId>,
    k_inductive_query: TermId,
    loop_terminated: BTreeSet<TermId>,
    loop_execute: BTreeSet<TermId>,
    substituted_loop_execute: BTreeSet<TermId>,
    pointwise_minimum: BTreeSet<TermId>,
    continuation: BTreeSet<TermId>,
    first_monus: Option<BTreeSet<TermId>>,
    first_rmonus: Option<BTreeSet<TermId>>,
    unrolling_depth: usize,
    simplify_formulae: bool,
    simplifier: Simplifier,
}

impl KindFormulaGenerator {
    /// Encode the 1-induction check `Φ(I) ≤ I`.
    pub fn new(
        store: &mut TermStore,
        cf: &mut CharacteristicFunctional,
        bound: &str,
        simplify_formulae: bool,
        ert: bool,
        stats: &mut Statistics,
    ) -> Result<Self, CheckError> {
        let mut bmc = BmcFormulaGenerator::new(store, cf, bound, simplify_formulae, ert, stats)?;
        // The total DNF feeds the minimum and continuation encodings. The
        // induction query ranges over the finite classes only and asks the
        // same question of `P_1` as the refutation query, so it is reused.
        let upper_bound_total = cf.upper_bound_dnf(store, bound, false, stats)?;

        let mut simplifier = Simplifier::new();
        let first_p = bmc.eufs()[0];
        let second_p = bmc.eufs()[1];
        let vars: Vec<TermId> = cf.vars_argument().to_vec();

        let arg_sorts = vec![crate::term::Sort::Int; vars.len()];
        let first_k = store.fun("K_1", arg_sorts, crate::term::Sort::Real);
        let eufs = vec![first_k];

        let k_inductive_query = bmc.refute_query();

        let loop_terminated = bmc.loop_terminated().clone();
        let loop_execute = bmc.loop_execute().clone();

        // K_1 = min(running value, I), one pair of guarded equations per
        // (functional class × bound class).
        let p_outer = store.apply(first_p, vars.clone());
        let k_outer = store.apply(first_k, vars.clone());
        let mut pointwise_minimum = BTreeSet::new();
        for entry in cf.loop_execute_dnf() {
            for &(guard_i, arith_i) in &upper_bound_total {
                let below = store.le(p_outer, arith_i);
                let ante = store.and(vec![entry.guard, guard_i, below]);
                let keep = store.eq(k_outer, p_outer);
                let f = store.implies(ante, keep);
                pointwise_minimum.insert(simplifier.simplify(store, f));

                let above = store.gt(p_outer, arith_i);
                let ante = store.and(vec![entry.guard, guard_i, above]);
                let clamp = store.eq(k_outer, arith_i);
                let f = store.implies(ante, clamp);
                pointwise_minimum.insert(simplifier.simplify(store, f));
            }
        }
        for &(guard_p, arith_p) in cf.loop_terminated_dnf() {
            for &(guard_i, arith_i) in &upper_bound_total {
                let below = store.le(arith_p, arith_i);
                let ante = store.and(vec![guard_p, guard_i, below]);
                let keep = store.eq(k_outer, arith_p);
                let f = store.implies(ante, keep);
                pointwise_minimum.insert(simplifier.simplify(store, f));

                let above = store.gt(arith_p, arith_i);
                let ante = store.and(vec![guard_p, guard_i, above]);
                let clamp = store.eq(k_outer, arith_i);
                let f = store.implies(ante, clamp);
                pointwise_minimum.insert(simplifier.simplify(store, f));
            }
        }

        // P_2 encodes I itself, at every argument tuple the body reaches.
        let p2_outer = store.apply(second_p, vars.clone());
        let mut continuation = BTreeSet::new();
        for &(guard_i, arith_i) in &upper_bound_total {
            let eq = store.eq(p2_outer, arith_i);
            continuation.insert(store.implies(guard_i, eq));
        }
        let mut shifted_continuation = BTreeSet::new();
        for sigma in cf.substitutions() {
            let simp = simplify_formulae.then_some(&mut simplifier);
            let mut rewritten = substitute_all(store, &continuation, sigma, simp);
            shifted_continuation.append(&mut rewritten);
        }
        let continuation = shifted_continuation;

        // The 1-induction check already involves two execute layers, so the
        // first monus batch is kept aside and handed out together with the
        // advanced one.
        let first_monus = Some(bmc.monus().clone());
        let first_rmonus = Some(bmc.rmonus().clone());
        bmc.prepare_next_depth(store, cf);

        debug!(
            minimum = pointwise_minimum.len(),
            continuation = continuation.len(),
            "1-induction encoding ready"
        );
        Ok(Self {
            bmc,
            eufs,
            k_inductive_query,
            loop_terminated,
            loop_execute,
            substituted_loop_execute: BTreeSet::new(),
            pointwise_minimum,
            continuation,
            first_monus,
            first_rmonus,
            unrolling_depth: 1,
            simplify_formulae,
            simplifier,
        })
    }

    /// Move from the k-induction to the (k+1)-induction encoding.
    pub fn prepare_next_depth(&mut self, store: &mut TermStore, cf: &CharacteristicFunctional) {
        self.unrolling_depth += 1;

        let name = format!("K_{}", self.eufs.len() + 1);
        let arg_sorts = vec![crate::term::Sort::Int; cf.vars_argument().len()];
        let new_k = store.fun(&name, arg_sorts, crate::term::Sort::Real);
        self.eufs.push(new_k);

        let bmc_eufs = self.bmc.eufs().to_vec();
        let old_k = self.eufs[self.eufs.len() - 2];

        // The innermost P of the current execute layer becomes the new K:
        // its value is about to be clamped by the minimum with I.
        let mut into_k = Substitution::new();
        into_k.insert(bmc_eufs[bmc_eufs.len() - 2], new_k);
        self.substituted_loop_execute =
            substitute_all(store, &self.loop_execute, &into_k, None);

        // Continuation formulae follow the unrolling one layer deeper.
        let mut continuation = BTreeSet::new();
        for sigma in cf.substitutions() {
            let mut composed = sigma.clone();
            composed.insert(bmc_eufs[bmc_eufs.len() - 2], bmc_eufs[bmc_eufs.len() - 1]);
            let simp = self.simplify_formulae.then_some(&mut self.simplifier);
            let mut rewritten = substitute_all(store, &self.continuation, &composed, simp);
            continuation.append(&mut rewritten);
        }
        self.continuation = continuation;

        // The minimum layer shifts both families at once.
        let mut minimum = BTreeSet::new();
        for sigma in cf.substitutions() {
            let mut composed = sigma.clone();
            composed.insert(bmc_eufs[bmc_eufs.len() - 3], bmc_eufs[bmc_eufs.len() - 2]);
            composed.insert(old_k, new_k);
            let simp = self.simplify_formulae.then_some(&mut self.simplifier);
            let mut rewritten = substitute_all(store, &self.pointwise_minimum, &composed, simp);
            minimum.append(&mut rewritten);
        }
        self.pointwise_minimum = minimum;

        // Terminated formulae of the current layer, then pull the next
        // execute/monus layer out of the BMC generator.
        self.loop_terminated = self.bmc.loop_terminated().clone();
        self.bmc.prepare_next_depth(store, cf);
        self.loop_execute = self.bmc.loop_execute().clone();
    }

    pub fn loop_terminated(&self) -> &BTreeSet<TermId> {
        &self.loop_terminated
    }

    pub fn loop_execute(&self) -> &BTreeSet<TermId> {
        &self.loop_execute
    }

    pub fn substituted_loop_execute(&self) -> &BTreeSet<TermId> {
        &self.substituted_loop_execute
    }

    pub fn pointwise_minimum(&self) -> &BTreeSet<TermId> {
        &self.pointwise_minimum
    }

    pub fn continuation(&self) -> &BTreeSet<TermId> {
        &self.continuation
    }

    /// Monus definitions: the BMC generator's current batch, plus — exactly
    /// once — the depth-zero batch the 1-induction check already needs.
    pub fn take_monus(&mut self) -> BTreeSet<TermId> {
        let mut out = self.bmc.monus().clone();
        if let Some(first) = self.first_monus.take() {
            out.extend(first);
        }
        out
    }

    /// Same hand-out-once scheme for the real monus definitions.
    pub fn take_rmonus(&mut self) -> BTreeSet<TermId> {
        let mut out = self.bmc.rmonus().clone();
        if let Some(first) = self.first_rmonus.take() {
            out.extend(first);
        }
        out
    }

    pub fn k_inductive_query(&self) -> TermId {
        self.k_inductive_query
    }

    pub fn unrolling_depth(&self) -> usize {
        self.unrolling_depth
    }
}

// ===========================================================================
// Driver
// ===========================================================================

/// Incremental k-induction over one solver instance.
pub struct IncrementalKInduction {
    store: TermStore,
    cf: CharacteristicFunctional,
    generator: KindFormulaGenerator,
    solver: SmtProcess,
    max_iterations: usize,
    assert_inductive: Option<usize>,
}

impl IncrementalKInduction {
    /// Parse, encode the 1-induction check and load the solver.
    pub fn new(
        program_src: &str,
        post: &str,
        bound: &str,
        options: &CheckOptions,
        stats: &mut Statistics,
    ) -> Result<Self, CheckError> {
        let program = pgcl::parse_program(program_src)?;
        let mut store = TermStore::new();
        let mut cf = CharacteristicFunctional::new(&mut store, &program, post, stats)?;
        let generator = KindFormulaGenerator::new(
            &mut store,
            &mut cf,
            bound,
            options.simplify_formulae,
            options.ert,
            stats,
        )?;
        debug!(linear = cf.is_linear(), ert = options.ert, "k-induction encoding ready");
        let logic = if cf.is_linear() { Logic::QfUfLira } else { Logic::All };
        let solver = SmtProcess::spawn(logic)?;

        let mut driver = Self {
            store,
            cf,
            generator,
            solver,
            max_iterations: options.max_iterations,
            assert_inductive: options.assert_inductive,
        };
        driver.setup(stats)?;
        Ok(driver)
    }

    /// Stack layout: `v̄ ≥ 0` | push | terminated + monus + rmonus | push |
    /// continuation + execute (popped every iteration, because the innermost
    /// `P` is about to be rewritten to a `K`).
    fn setup(&mut self, stats: &mut Statistics) -> Result<(), CheckError> {
        stats.compute_formulae_time.start();
        for &constraint in self.cf.non_negative_constraints() {
            self.solver.add_assertion(&self.store, constraint)?;
        }
        self.solver.push()?;

        for &formula in self.generator.loop_terminated() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for formula in self.generator.take_monus() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for formula in self.generator.take_rmonus() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        self.solver.push()?;

        for &formula in self.generator.continuation() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.loop_execute() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        stats.compute_formulae_time.stop();
        Ok(())
    }

    /// Run until inductive, exhausted or cancelled.
    pub fn run(
        &mut self,
        stats: &mut Statistics,
        cancel: &AtomicBool,
    ) -> Result<KindOutcome, CheckError> {
        for _ in 0..self.max_iterations {
            if cancel.load(Ordering::Relaxed) {
                return Err(CheckError::Cancelled);
            }
            if self.is_k_inductive(stats)? {
                let depth = self.generator.unrolling_depth();
                info!(depth, formulae = self.solver.num_assertions(), "inductive");
                stats.k = Some(depth);
                stats.number_formulae = Some(self.solver.num_assertions());
                self.check_expected_depth(depth)?;
                return Ok(KindOutcome::Inductive);
            }
            self.advance(stats)?;
        }

        let depth = self.generator.unrolling_depth();
        info!(depth, max_iterations = self.max_iterations, "not k-inductive");
        stats.k = Some(depth);
        stats.number_formulae = Some(self.solver.num_assertions());
        self.check_expected_depth(depth)?;
        Ok(KindOutcome::Exhausted)
    }

    /// UNSAT of the induction query means the bound is k-inductive.
    pub fn is_k_inductive(&mut self, stats: &mut Statistics) -> Result<bool, CheckError> {
        let query = self.generator.k_inductive_query();
        debug!(
            formulae = self.solver.num_assertions(),
            "induction check: {}",
            self.store.display(query)
        );
        let sat =
            self.solver
                .is_sat_timed(&self.store, Some(query), &mut stats.sat_check_time)?;
        if sat {
            if let Some(model) = self.solver.get_model() {
                debug!(%model, "counterexample to inductivity");
            }
        }
        Ok(!sat)
    }

    fn advance(&mut self, stats: &mut Statistics) -> Result<(), CheckError> {
        stats.compute_formulae_time.start();
        self.generator.prepare_next_depth(&mut self.store, &self.cf);

        self.solver.pop()?;
        for &formula in self.generator.substituted_loop_execute() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.loop_terminated() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for formula in self.generator.take_monus() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.pointwise_minimum() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        self.solver.push()?;

        for &formula in self.generator.loop_execute() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.continuation() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        stats.compute_formulae_time.stop();
        info!(
            depth = self.generator.unrolling_depth(),
            formulae = self.solver.num_assertions(),
            "advanced induction depth"
        );
        Ok(())
    }

    fn check_expected_depth(&self, found: usize) -> Result<(), CheckError> {
        if let Some(expected) = self.assert_inductive {
            if expected != found {
                return Err(CheckError::AssertionMismatch { expected, found });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, solver_available};
    use crate::stats::{Statistics, TaskArgs};

    fn run_kind(
        program: &str,
        post: &str,
        bound: &str,
        options: &CheckOptions,
    ) -> (KindOutcome, Option<usize>) {
        let mut stats = Statistics::new(TaskArgs::default());
        let cancel = AtomicBool::new(false);
        let mut kind = IncrementalKInduction::new(program, post, bound, options, &mut stats)
            .expect("k-induction construction");
        let outcome = kind.run(&mut stats, &cancel).expect("k-induction run");
        (outcome, stats.k)
    }

    #[test]
    fn exact_conditional_bound_is_one_inductive() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let options = CheckOptions { max_iterations: 5, ..CheckOptions::default() };
        let (outcome, k) = run_kind(
            fixtures::GEOMETRIC,
            "c",
            "[f=1]*(c+1) + [not (f=1)]*c",
            &options,
        );
        assert_eq!(outcome, KindOutcome::Inductive);
        assert_eq!(k, Some(1));
    }

    #[test]
    fn loose_linear_bound_is_two_inductive() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let options = CheckOptions { max_iterations: 5, ..CheckOptions::default() };
        let (outcome, k) = run_kind(fixtures::GEOMETRIC, "c", "c + 1", &options);
        assert_eq!(outcome, KindOutcome::Inductive);
        assert_eq!(k, Some(2));
    }

    #[test]
    fn conditional_retransmission_bound_is_inductive_within_five() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let options = CheckOptions { max_iterations: 8, ..CheckOptions::default() };
        let (outcome, k) = run_kind(
            fixtures::BRP_TOTAL_FAILED,
            "totalFailed",
            "[toSend <= 4]*(totalFailed+1) + [not (toSend <= 4)]*\\infty",
            &options,
        );
        assert_eq!(outcome, KindOutcome::Inductive);
        assert!(k.expect("depth recorded") <= 5);
    }

    #[test]
    fn conditioned_failure_probability_bound_is_inductive() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let options = CheckOptions { max_iterations: 8, ..CheckOptions::default() };
        let (outcome, _) = run_kind(
            fixtures::BRP_SIMPLE,
            "[failed=maxFailed]",
            "[sent = 0 & failed = 0 & failed < maxFailed & toSend <= 4] * 0.35 \
             + [not (sent = 0 & failed = 0 & failed < maxFailed & toSend <= 4)]*1",
            &options,
        );
        assert_eq!(outcome, KindOutcome::Inductive);
    }

    #[test]
    fn uniform_generator_window_bound_is_inductive() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let options = CheckOptions { max_iterations: 12, ..CheckOptions::default() };
        let guard = "elow+4=ehigh & n=ehigh-elow+1 & v=1 & c=0 & running=0 \
                     & elow <= i & i <= ehigh";
        let bound = format!("[{guard}]*(1/5) + [not ({guard})]*1");
        let (outcome, _) = run_kind(fixtures::UNIFORM_GENERATOR, "[c=i]", &bound, &options);
        assert_eq!(outcome, KindOutcome::Inductive);
    }

    #[test]
    fn exact_runtime_bound_is_one_inductive() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        let options =
            CheckOptions { max_iterations: 5, ert: true, ..CheckOptions::default() };
        let (outcome, k) = run_kind(
            fixtures::GEOMETRIC_TICK,
            "0",
            "[f=1]*2 + [not (f=1)]*0",
            &options,
        );
        assert_eq!(outcome, KindOutcome::Inductive);
        assert_eq!(k, Some(1));
    }

    #[test]
    fn unbounded_retransmissions_are_not_inductive_within_budget() {
        if !solver_available() {
            eprintln!("no SMT solver on PATH, skipping");
            return;
        }
        // The same conditional shape without the toSend window is refutable,
        // so induction must keep failing.
        let options = CheckOptions { max_iterations: 3, ..CheckOptions::default() };
        let (outcome, k) =
            run_kind(fixtures::BRP_TOTAL_FAILED, "totalFailed", "totalFailed + 1", &options);
        assert_eq!(outcome, KindOutcome::Exhausted);
        assert_eq!(k, Some(4), "three failed checks advance the encoding three times");
    }
}
