//! Incremental bounded model checking
//!
//! Refutation search: find a state `s ≥ 0` with `Φᵏ(0)(s)` above the
//! candidate bound. Each unrolling depth `k` is named by an uninterpreted
//! function `P_{k+1} : Intⁿ → Real`; the formula generator maintains three
//! formula families over them —
//!
//! 1. *loop-terminated*: `guard → P_i(v̄) = arith`,
//! 2. *zero-step-not-terminated*: `¬done → P_i(v̄) = 0` (transient; popped
//!    and re-asserted around every satisfiability check),
//! 3. *loop-execute*: `guard → P_i(v̄) = Σ p_j · P_{i+1}(σ_j(v̄))`
//!    (with `p_j · (tick_j + …)` in expected-runtime mode),
//!
//! plus the monus definitions. Advancing a depth never re-encodes anything:
//! the accumulated formulae are rewritten by the loop's substitutions
//! composed with the shift `P_old → P_new`, which is exactly the algebraic
//! step from `Φᵏ` to `Φᵏ⁺¹`. The refutation query stays fixed on `P_1`.
//!
//! The driver owns the solver: variable non-negativity at the bottom,
//! persistent families above it, one transient level on top.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::bridge::MonusPairs;
use crate::functional::CharacteristicFunctional;
use crate::pgcl;
use crate::solver::{Logic, SmtProcess};
use crate::stats::Statistics;
use crate::subst::{substitute, substitute_all, Simplifier, Substitution};
use crate::term::{Sort, TermId, TermStore};
use crate::{CheckError, CheckOptions};

/// Verdict of a BMC run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BmcOutcome {
    /// The bound was exceeded at the reached depth.
    Refuted,
    /// No refutation within the iteration budget.
    Exhausted,
}

// ===========================================================================
// Formula generator
// ===========================================================================

/// Generates and advances the BMC encoding. Pure formula bookkeeping; the
/// driver decides what goes onto the solver when.
pub struct BmcFormulaGenerator {
    eufs: Vec<TermId>,
    euf_arg_sorts: Vec<Sort>,
    refute_query: TermId,
    loop_terminated: BTreeSet<TermId>,
    zero_step_not_terminated: BTreeSet<TermId>,
    loop_execute: BTreeSet<TermId>,
    pending_loop_execute: Option<BTreeSet<TermId>>,
    monus: BTreeSet<TermId>,
    rmonus: BTreeSet<TermId>,
    simplify_formulae: bool,
    simplifier: Simplifier,
}

impl BmcFormulaGenerator {
    /// Encode depth zero (`Φ(0)`) and the refutation query for `bound`.
    pub fn new(
        store: &mut TermStore,
        cf: &mut CharacteristicFunctional,
        bound: &str,
        simplify_formulae: bool,
        ert: bool,
        stats: &mut Statistics,
    ) -> Result<Self, CheckError> {
        let upper_bound_dnf = cf.upper_bound_dnf(store, bound, true, stats)?;

        let euf_arg_sorts = vec![Sort::Int; cf.vars_argument().len()];
        let mut generator = Self {
            eufs: Vec::new(),
            euf_arg_sorts,
            refute_query: store.fls(),
            loop_terminated: BTreeSet::new(),
            zero_step_not_terminated: BTreeSet::new(),
            loop_execute: BTreeSet::new(),
            pending_loop_execute: None,
            monus: BTreeSet::new(),
            rmonus: BTreeSet::new(),
            simplify_formulae,
            simplifier: Simplifier::new(),
        };

        let first = generator.fresh_euf(store);
        generator.eufs.push(first);
        let second = generator.fresh_euf(store);
        generator.eufs.push(second);

        // P_1 names Φ^depth(0); the query never moves off it.
        generator.refute_query = refutation_query(store, cf, first, &upper_bound_dnf);

        let vars: Vec<TermId> = cf.vars_argument().to_vec();
        let outer = store.apply(first, vars.clone());

        for &(guard, arith) in cf.loop_terminated_dnf() {
            let eq = store.eq(outer, arith);
            let f = store.implies(guard, eq);
            generator.loop_terminated.insert(generator.simplifier.simplify(store, f));
        }

        {
            let done = cf.done();
            let not_done = store.not(done);
            let zero = store.real_zero();
            let eq = store.eq(outer, zero);
            let f = store.implies(not_done, eq);
            generator
                .zero_step_not_terminated
                .insert(generator.simplifier.simplify(store, f));
        }

        for entry in cf.loop_execute_dnf() {
            let mut summands = Vec::with_capacity(entry.updates.len());
            for update in &entry.updates {
                let args = substituted_arguments(&vars, &update.subst);
                let continuation = store.apply(second, args);
                let weighted = if ert {
                    let stepped = store.add(vec![update.tick, continuation]);
                    store.mul(vec![update.prob, stepped])
                } else {
                    store.mul(vec![update.prob, continuation])
                };
                summands.push(weighted);
            }
            let rhs = store.add(summands);
            let eq = store.eq(outer, rhs);
            let f = store.implies(entry.guard, eq);
            generator.loop_execute.insert(generator.simplifier.simplify(store, f));
        }

        let int_zero = store.int(0);
        generator.monus = monus_axioms(
            store,
            &mut generator.simplifier,
            cf.env().monus,
            &cf.monus.int,
            int_zero,
        );
        let real_zero = store.real_zero();
        generator.rmonus = monus_axioms(
            store,
            &mut generator.simplifier,
            cf.env().rmonus,
            &cf.monus.real,
            real_zero,
        );

        debug!(
            terminated = generator.loop_terminated.len(),
            execute = generator.loop_execute.len(),
            monus = generator.monus.len(),
            rmonus = generator.rmonus.len(),
            "initial formula families"
        );
        Ok(generator)
    }

    /// Shift the encoding from `Φᵏ` to `Φᵏ⁺¹`.
    pub fn prepare_next_depth(&mut self, store: &mut TermStore, cf: &CharacteristicFunctional) {
        if let Some(pending) = self.pending_loop_execute.take() {
            self.loop_execute = pending;
        }

        let old = self.eufs[self.eufs.len() - 2];
        let new = self.eufs[self.eufs.len() - 1];

        let mut terminated = BTreeSet::new();
        let mut zero_step = BTreeSet::new();
        let mut monus = BTreeSet::new();
        let mut rmonus = BTreeSet::new();
        for sigma in cf.substitutions() {
            let mut composed = sigma.clone();
            composed.insert(old, new);
            terminated.append(&mut self.rewrite_set(store, &self.loop_terminated.clone(), &composed));
            zero_step.append(&mut self.rewrite_set(
                store,
                &self.zero_step_not_terminated.clone(),
                &composed,
            ));
            if !self.monus.is_empty() {
                monus.append(&mut self.rewrite_set(store, &self.monus.clone(), &composed));
            }
            if !self.rmonus.is_empty() {
                rmonus.append(&mut self.rewrite_set(store, &self.rmonus.clone(), &composed));
            }
        }
        self.loop_terminated = terminated;
        self.zero_step_not_terminated = zero_step;
        self.monus = monus;
        self.rmonus = rmonus;

        // Pending loop-execute formulae: first bump the continuation symbol,
        // then compose the body substitution with the index shift.
        let new_new = self.fresh_euf(store);
        self.eufs.push(new_new);
        let mut pending = BTreeSet::new();
        let mut bump = Substitution::new();
        bump.insert(new, new_new);
        for sigma in cf.substitutions() {
            let mut composed = sigma.clone();
            composed.insert(old, new);
            for &formula in &self.loop_execute {
                let bumped = substitute(store, formula, &bump);
                let shifted = substitute(store, bumped, &composed);
                let shifted = if self.simplify_formulae {
                    self.simplifier.simplify(store, shifted)
                } else {
                    shifted
                };
                pending.insert(shifted);
            }
        }
        self.pending_loop_execute = Some(pending);
    }

    fn rewrite_set(
        &mut self,
        store: &mut TermStore,
        set: &BTreeSet<TermId>,
        map: &Substitution,
    ) -> BTreeSet<TermId> {
        let simplifier = self.simplify_formulae.then_some(&mut self.simplifier);
        substitute_all(store, set, map, simplifier)
    }

    fn fresh_euf(&mut self, store: &mut TermStore) -> TermId {
        let name = format!("P_{}", self.eufs.len() + 1);
        store.fun(&name, self.euf_arg_sorts.clone(), Sort::Real)
    }

    pub fn loop_terminated(&self) -> &BTreeSet<TermId> {
        &self.loop_terminated
    }

    pub fn loop_execute(&self) -> &BTreeSet<TermId> {
        &self.loop_execute
    }

    pub fn zero_step_not_terminated(&self) -> &BTreeSet<TermId> {
        &self.zero_step_not_terminated
    }

    pub fn monus(&self) -> &BTreeSet<TermId> {
        &self.monus
    }

    pub fn rmonus(&self) -> &BTreeSet<TermId> {
        &self.rmonus
    }

    pub fn refute_query(&self) -> TermId {
        self.refute_query
    }

    /// Uninterpreted function family, oldest first.
    pub fn eufs(&self) -> &[TermId] {
        &self.eufs
    }

    /// Depth currently encoded by `P_1`.
    pub fn unrolling_depth(&self) -> usize {
        self.eufs.len() - 2
    }
}

/// `⋁ (guard ∧ P(v̄) > arith)` over the finite bound classes.
fn refutation_query(
    store: &mut TermStore,
    cf: &CharacteristicFunctional,
    euf: TermId,
    upper_bound_dnf: &[(TermId, TermId)],
) -> TermId {
    let outer = store.apply(euf, cf.vars_argument().to_vec());
    let disjuncts: Vec<TermId> = upper_bound_dnf
        .iter()
        .map(|&(guard, arith)| {
            let above = store.gt(outer, arith);
            store.and(vec![guard, above])
        })
        .collect();
    store.or(disjuncts)
}

/// Argument tuple of a continuation application: each variable routed
/// through the branch substitution.
pub(crate) fn substituted_arguments(vars: &[TermId], sigma: &Substitution) -> Vec<TermId> {
    vars.iter().map(|v| sigma.get(v).copied().unwrap_or(*v)).collect()
}

/// `ite(b ≤ a, M(a,b) = a − b, M(a,b) = 0)` for every recorded pair.
pub(crate) fn monus_axioms(
    store: &mut TermStore,
    simplifier: &mut Simplifier,
    fun: TermId,
    pairs: &MonusPairs,
    zero: TermId,
) -> BTreeSet<TermId> {
    let mut out = BTreeSet::new();
    for (a, b) in pairs.iter() {
        let cond = store.le(b, a);
        let app = store.apply(fun, vec![a, b]);
        let diff = store.sub(a, b);
        let defined = store.eq(app, diff);
        let clamped = store.eq(app, zero);
        let axiom = store.ite(cond, defined, clamped);
        out.insert(simplifier.simplify(store, axiom));
    }
    out
}

// ===========================================================================
// Driver
// ===========================================================================

/// Incremental BMC over one solver instance.
pub struct IncrementalBmc {
    store: TermStore,
    cf: CharacteristicFunctional,
    generator: BmcFormulaGenerator,
    solver: SmtProcess,
    max_iterations: usize,
    unrollings_between_sat_checks: usize,
    unrollings_until_next_check: usize,
    assert_refute: Option<usize>,
}

impl IncrementalBmc {
    /// Parse, encode depth zero and load the solver.
    pub fn new(
        program_src: &str,
        post: &str,
        bound: &str,
        options: &CheckOptions,
        stats: &mut Statistics,
    ) -> Result<Self, CheckError> {
        if options.unrollings_between_sat_checks < 1 {
            return Err(CheckError::Config(
                "there has to be at least one unrolling between two sat checks",
            ));
        }
        let program = pgcl::parse_program(program_src)?;
        let mut store = TermStore::new();
        let mut cf = CharacteristicFunctional::new(&mut store, &program, post, stats)?;
        let generator = BmcFormulaGenerator::new(
            &mut store,
            &mut cf,
            bound,
            options.simplify_formulae,
            options.ert,
            stats,
        )?;
        debug!(linear = cf.is_linear(), ert = options.ert, "bmc encoding ready");
        let logic = if cf.is_linear() { Logic::QfUfLira } else { Logic::All };
        let solver = SmtProcess::spawn(logic)?;

        let mut driver = Self {
            store,
            cf,
            generator,
            solver,
            max_iterations: options.max_iterations,
            unrollings_between_sat_checks: options.unrollings_between_sat_checks - 1,
            unrollings_until_next_check: options.unrollings_between_sat_checks,
            assert_refute: options.assert_refute,
        };
        driver.setup(stats)?;
        Ok(driver)
    }

    /// Stack layout: `v̄ ≥ 0` | push | terminated + monus + rmonus | push |
    /// transient zero-step formulae.
    fn setup(&mut self, stats: &mut Statistics) -> Result<(), CheckError> {
        stats.compute_formulae_time.start();
        for &constraint in self.cf.non_negative_constraints() {
            self.solver.add_assertion(&self.store, constraint)?;
        }
        self.solver.push()?;

        for &formula in self.generator.loop_terminated() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.monus() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.rmonus() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        self.solver.push()?;

        for &formula in self.generator.zero_step_not_terminated() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        stats.compute_formulae_time.stop();
        Ok(())
    }

    /// Run until refuted, exhausted or cancelled.
    pub fn run(
        &mut self,
        stats: &mut Statistics,
        cancel: &AtomicBool,
    ) -> Result<BmcOutcome, CheckError> {
        for _ in 0..self.max_iterations {
            if cancel.load(Ordering::Relaxed) {
                return Err(CheckError::Cancelled);
            }
            if self.unrollings_until_next_check == 0 {
                self.unrollings_until_next_check = self.unrollings_between_sat_checks;
                if self.check_refute(stats)? {
                    let depth = self.generator.unrolling_depth();
                    info!(
                        depth,
                        formulae = self.solver.num_assertions(),
                        "refuted"
                    );
                    stats.k = Some(depth);
                    stats.number_formulae = Some(self.solver.num_assertions());
                    self.check_expected_depth(depth)?;
                    return Ok(BmcOutcome::Refuted);
                }
            } else {
                self.unrollings_until_next_check -= 1;
            }
            let check_next = self.unrollings_until_next_check == 0;
            self.advance(check_next, stats)?;
        }

        let depth = self.generator.unrolling_depth();
        info!(depth, max_iterations = self.max_iterations, "no refutation found");
        stats.k = Some(depth);
        stats.number_formulae = Some(self.solver.num_assertions());
        self.check_expected_depth(depth)?;
        Ok(BmcOutcome::Exhausted)
    }

    /// Is there a state whose `Φᵏ(0)` value exceeds the bound?
    pub fn check_refute(&mut self, stats: &mut Statistics) -> Result<bool, CheckError> {
        let query = self.generator.refute_query();
        debug!(
            formulae = self.solver.num_assertions(),
            "refutation check: {}",
            self.store.display(query)
        );
        let sat =
            self.solver
                .is_sat_timed(&self.store, Some(query), &mut stats.sat_check_time)?;
        if sat {
            if let Some(model) = self.solver.get_model() {
                debug!(%model, "refuting state");
            }
        }
        Ok(sat)
    }

    /// Advance one depth: pop the transient level, assert the next depth's
    /// families, push, and re-assert the zero-step formulae only when a
    /// check follows.
    pub(crate) fn advance(
        &mut self,
        assert_zero_step: bool,
        stats: &mut Statistics,
    ) -> Result<(), CheckError> {
        stats.compute_formulae_time.start();
        self.generator.prepare_next_depth(&mut self.store, &self.cf);

        self.solver.pop()?;
        for &formula in self.generator.loop_execute() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.loop_terminated() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        for &formula in self.generator.monus() {
            self.solver.add_assertion(&self.store, formula)?;
        }
        self.solver.push()?;
        if assert_zero_step {
            for &formula in self.generator.zero_step_not_terminated() {
                self.solver.add_assertion(&self.store, formula)?;
            }
        }
        stats.compute_formulae_time.stop();
        info!(
            depth = self.generator.unrolling_depth(),
            formulae = self.solver.num_assertions(),
            "advanced unrolling"
        );
        Ok(())
    }

    fn check_expected_depth(&self, found: usize) -> Result<(), CheckError> {
        if let Some(expected) = self.assert_refute {
            if expected != found {
                return Err(CheckError::AssertionMismatch { expected, found });
            }
        }
        Ok(())
    }

    /// Formula generator (for layering and tests).
    pub fn generator(&self) -> &BmcFormulaGenerator {
        &self.generator
    }
}
