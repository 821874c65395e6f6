//! Substitution and local simplification over the term arena
//!
//! Two pure rewrites used throughout the unrolling machinery:
//!
//! - [`substitute`] — most-general substitution. Replaces any exact-match
//!   subterm, and, crucially, rewrites the **head symbol** of function
//!   applications when the head appears as a map key. Generic term rewriting
//!   leaves application heads alone; shifting `P_i` to `P_{i+1}` (and `P_i`
//!   to `K_i`) between unrolling depths depends on head rewriting.
//! - [`Simplifier`] — local constant folding and identity elimination.
//!   Idempotent. Substitution composes program-variable updates into guards
//!   and arguments; folding collapses the resulting `x+1+1` / `2=2` debris so
//!   that the hash-consed formula sets deduplicate across depths.
//!
//! Neither touches solver state.

#![forbid(unsafe_code)]

use ahash::AHashMap;
use num_rational::BigRational;
use num_traits::Zero;

use crate::term::{Op, Payload, Sort, TermId, TermStore};

/// A substitution map. Keys are exact subterms or function symbols.
pub type Substitution = AHashMap<TermId, TermId>;

/// Apply `map` to `term`, most-general, bottom-up, memoized per call.
pub fn substitute(store: &mut TermStore, term: TermId, map: &Substitution) -> TermId {
    let mut memo = AHashMap::new();
    subst_rec(store, term, map, &mut memo)
}

/// Apply `map` to every formula in `set`, optionally simplifying results.
pub fn substitute_all(
    store: &mut TermStore,
    formulae: &std::collections::BTreeSet<TermId>,
    map: &Substitution,
    simplifier: Option<&mut Simplifier>,
) -> std::collections::BTreeSet<TermId> {
    let mut out = std::collections::BTreeSet::new();
    match simplifier {
        Some(simp) => {
            for &f in formulae {
                let s = substitute(store, f, map);
                out.insert(simp.simplify(store, s));
            }
        }
        None => {
            for &f in formulae {
                out.insert(substitute(store, f, map));
            }
        }
    }
    out
}

fn subst_rec(
    store: &mut TermStore,
    term: TermId,
    map: &Substitution,
    memo: &mut AHashMap<TermId, TermId>,
) -> TermId {
    if let Some(&replacement) = map.get(&term) {
        return replacement;
    }
    if let Some(&done) = memo.get(&term) {
        return done;
    }
    let (op, payload, children, sort) = {
        let node = store.node(term);
        (node.op, node.payload.clone(), node.children.clone(), node.sort)
    };
    let result = if children.is_empty() {
        term
    } else if op == Op::Apply {
        let head = children[0];
        let new_head = map.get(&head).copied().unwrap_or(head);
        let mut changed = new_head != head;
        let mut args = Vec::with_capacity(children.len() - 1);
        for &child in &children[1..] {
            let new_child = subst_rec(store, child, map, memo);
            changed |= new_child != child;
            args.push(new_child);
        }
        if changed {
            store.apply(new_head, args)
        } else {
            term
        }
    } else {
        let mut changed = false;
        let mut new_children = Vec::with_capacity(children.len());
        for &child in &children {
            let new_child = subst_rec(store, child, map, memo);
            changed |= new_child != child;
            new_children.push(new_child);
        }
        if changed {
            store.rebuild(op, payload, new_children, sort)
        } else {
            term
        }
    };
    memo.insert(term, result);
    result
}

/// Local simplifier with a persistent memo table.
///
/// Sound to keep alive for the whole job: the arena is append-only, so a
/// memoized result never goes stale.
pub struct Simplifier {
    memo: AHashMap<TermId, TermId>,
}

impl Default for Simplifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Simplifier {
    /// Fresh simplifier.
    pub fn new() -> Self {
        Self { memo: AHashMap::new() }
    }

    /// Simplify `term`, bottom-up.
    pub fn simplify(&mut self, store: &mut TermStore, term: TermId) -> TermId {
        if let Some(&done) = self.memo.get(&term) {
            return done;
        }
        let (op, payload, children, sort) = {
            let node = store.node(term);
            (node.op, node.payload.clone(), node.children.clone(), node.sort)
        };
        let kids: Vec<TermId> = children.iter().map(|&c| self.simplify(store, c)).collect();
        let result = self.rewrite(store, op, payload, kids, sort);
        self.memo.insert(term, result);
        self.memo.insert(result, result);
        result
    }

    fn rewrite(
        &mut self,
        store: &mut TermStore,
        op: Op,
        payload: Payload,
        kids: Vec<TermId>,
        sort: Sort,
    ) -> TermId {
        match op {
            Op::And => {
                let mut flat = Vec::new();
                for k in kids {
                    match store.op(k) {
                        Op::True => {}
                        Op::False => return store.fls(),
                        Op::And => flat.extend(store.node(k).children.iter().copied()),
                        _ => flat.push(k),
                    }
                }
                flat.dedup();
                store.and(flat)
            }
            Op::Or => {
                let mut flat = Vec::new();
                for k in kids {
                    match store.op(k) {
                        Op::False => {}
                        Op::True => return store.tru(),
                        Op::Or => flat.extend(store.node(k).children.iter().copied()),
                        _ => flat.push(k),
                    }
                }
                flat.dedup();
                store.or(flat)
            }
            Op::Not => match store.op(kids[0]) {
                Op::True => store.fls(),
                Op::False => store.tru(),
                Op::Not => store.node(kids[0]).children[0],
                _ => store.not(kids[0]),
            },
            Op::Implies => {
                let (lhs, rhs) = (kids[0], kids[1]);
                match (store.op(lhs), store.op(rhs)) {
                    (Op::True, _) => rhs,
                    (Op::False, _) => store.tru(),
                    (_, Op::True) => store.tru(),
                    (_, Op::False) => {
                        let n = store.not(lhs);
                        self.simplify(store, n)
                    }
                    _ if lhs == rhs => store.tru(),
                    _ => store.implies(lhs, rhs),
                }
            }
            Op::Iff => {
                let (lhs, rhs) = (kids[0], kids[1]);
                match (store.op(lhs), store.op(rhs)) {
                    _ if lhs == rhs => store.tru(),
                    (Op::True, _) => rhs,
                    (_, Op::True) => lhs,
                    (Op::False, _) => {
                        let n = store.not(rhs);
                        self.simplify(store, n)
                    }
                    (_, Op::False) => {
                        let n = store.not(lhs);
                        self.simplify(store, n)
                    }
                    _ => store.iff(lhs, rhs),
                }
            }
            Op::Eq | Op::Le | Op::Lt | Op::Ge | Op::Gt => {
                let (lhs, rhs) = (kids[0], kids[1]);
                if let (Some(a), Some(b)) = (store.literal_value(lhs), store.literal_value(rhs)) {
                    let holds = match op {
                        Op::Eq => a == b,
                        Op::Le => a <= b,
                        Op::Lt => a < b,
                        Op::Ge => a >= b,
                        Op::Gt => a > b,
                        _ => unreachable!(),
                    };
                    return store.bool_const(holds);
                }
                if lhs == rhs {
                    return store.bool_const(matches!(op, Op::Eq | Op::Le | Op::Ge));
                }
                store.rebuild(op, Payload::None, vec![lhs, rhs], Sort::Bool)
            }
            Op::Add => {
                let mut flat = Vec::new();
                let mut constant = BigRational::zero();
                for k in kids {
                    if store.op(k) == Op::Add {
                        for c in store.node(k).children.clone() {
                            match store.literal_value(c) {
                                Some(v) => constant += v,
                                None => flat.push(c),
                            }
                        }
                    } else {
                        match store.literal_value(k) {
                            Some(v) => constant += v,
                            None => flat.push(k),
                        }
                    }
                }
                if flat.is_empty() {
                    return store.literal_of_sort(constant, sort);
                }
                if !constant.is_zero() {
                    let lit = store.literal_of_sort(constant, sort);
                    flat.push(lit);
                }
                store.add(flat)
            }
            Op::Sub => {
                let (lhs, rhs) = (kids[0], kids[1]);
                if let (Some(a), Some(b)) = (store.literal_value(lhs), store.literal_value(rhs)) {
                    return store.literal_of_sort(a - b, sort);
                }
                if store.is_zero_literal(rhs) {
                    return lhs;
                }
                store.sub(lhs, rhs)
            }
            Op::Mul => {
                let mut flat = Vec::new();
                let mut constant: BigRational = num_traits::One::one();
                for k in kids {
                    if store.op(k) == Op::Mul {
                        for c in store.node(k).children.clone() {
                            match store.literal_value(c) {
                                Some(v) => constant *= v,
                                None => flat.push(c),
                            }
                        }
                    } else {
                        match store.literal_value(k) {
                            Some(v) => constant *= v,
                            None => flat.push(k),
                        }
                    }
                }
                if constant.is_zero() || flat.is_empty() {
                    return store.literal_of_sort(constant, sort);
                }
                if !num_traits::One::is_one(&constant) {
                    let lit = store.literal_of_sort(constant, sort);
                    flat.insert(0, lit);
                }
                store.mul(flat)
            }
            Op::Ite => {
                let (cond, then, els) = (kids[0], kids[1], kids[2]);
                match store.op(cond) {
                    Op::True => then,
                    Op::False => els,
                    _ if then == els => then,
                    _ => store.ite(cond, then, els),
                }
            }
            Op::ToReal => store.to_real(kids[0]),
            _ if kids.is_empty() => store.rebuild(op, payload, kids, sort),
            Op::Apply => {
                let head = kids[0];
                store.apply(head, kids[1..].to_vec())
            }
            _ => store.rebuild(op, payload, kids, sort),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TermStore, TermId, TermId) {
        let mut store = TermStore::new();
        let x = store.var("x", Sort::Int);
        let y = store.var("y", Sort::Int);
        (store, x, y)
    }

    #[test]
    fn substitutes_exact_subterms() {
        let (mut store, x, y) = setup();
        let one = store.int(1);
        let xp1 = store.add(vec![x, one]);
        let mut map = Substitution::new();
        map.insert(x, y);
        let r = substitute(&mut store, xp1, &map);
        let expected = store.add(vec![y, one]);
        assert_eq!(r, expected);
    }

    #[test]
    fn substitutes_function_heads() {
        let (mut store, x, _) = setup();
        let p1 = store.fun("P_1", vec![Sort::Int], Sort::Real);
        let p2 = store.fun("P_2", vec![Sort::Int], Sort::Real);
        let app = store.apply(p1, vec![x]);
        let half = store.real_frac(1, 2);
        let t = store.mul(vec![half, app]);
        let mut map = Substitution::new();
        map.insert(p1, p2);
        let r = substitute(&mut store, t, &map);
        let app2 = store.apply(p2, vec![x]);
        let expected = store.mul(vec![half, app2]);
        assert_eq!(r, expected);
    }

    #[test]
    fn head_and_argument_rewrites_compose() {
        let (mut store, x, _) = setup();
        let p1 = store.fun("P_1", vec![Sort::Int], Sort::Real);
        let p2 = store.fun("P_2", vec![Sort::Int], Sort::Real);
        let one = store.int(1);
        let xp1 = store.add(vec![x, one]);
        let app = store.apply(p1, vec![x]);
        let mut map = Substitution::new();
        map.insert(p1, p2);
        map.insert(x, xp1);
        let r = substitute(&mut store, app, &map);
        let expected = store.apply(p2, vec![xp1]);
        assert_eq!(r, expected);
    }

    #[test]
    fn simplifier_folds_constants() {
        let (mut store, x, _) = setup();
        let mut simp = Simplifier::new();
        let one = store.int(1);
        let a = store.add(vec![x, one]);
        let b = store.add(vec![a, one]);
        let r = simp.simplify(&mut store, b);
        let two = store.int(2);
        let expected = store.add(vec![x, two]);
        assert_eq!(r, expected);
    }

    #[test]
    fn simplifier_drops_trivial_conjuncts() {
        let (mut store, x, y) = setup();
        let mut simp = Simplifier::new();
        let two = store.int(2);
        let trivially_true = store.eq(two, two);
        let live = store.lt(x, y);
        let conj = store.and(vec![trivially_true, live]);
        assert_eq!(simp.simplify(&mut store, conj), live);
    }

    #[test]
    fn simplifier_evaluates_probability_arithmetic() {
        let mut store = TermStore::new();
        let mut simp = Simplifier::new();
        let one = store.real_frac(1, 1);
        let four_fifths = store.real_frac(4, 5);
        let diff = store.sub(one, four_fifths);
        let r = simp.simplify(&mut store, diff);
        assert_eq!(r, store.real_frac(1, 5));
    }

    #[test]
    fn simplifier_is_idempotent() {
        let (mut store, x, y) = setup();
        let mut simp = Simplifier::new();
        let zero = store.int(0);
        let one = store.int(1);
        let sum = store.add(vec![x, zero, one]);
        let guard = store.le(sum, y);
        let tru = store.tru();
        let f = store.and(vec![guard, tru]);
        let once = simp.simplify(&mut store, f);
        let twice = simp.simplify(&mut store, once);
        assert_eq!(once, twice);
    }

    #[test]
    fn implication_from_false_guard_collapses() {
        let (mut store, x, _) = setup();
        let mut simp = Simplifier::new();
        let fls = store.fls();
        let zero = store.int(0);
        let body = store.eq(x, zero);
        let f = store.implies(fls, body);
        let r = simp.simplify(&mut store, f);
        assert_eq!(r, store.tru());
    }
}
