//! Hash-consed term DAG for the QF_UFLIRA fragment
//!
//! Every formula the checkers build lives in one append-only arena. Terms are
//! interned on construction: structurally equal terms always receive the same
//! [`TermId`], so equality, hashing and set membership on formulae are `O(1)`
//! id operations. This is what makes the substitution-driven unrolling cheap —
//! formula sets deduplicate by id, and rewrites memoize by id.
//!
//! The arena never frees nodes. Ids are creation-ordered, which keeps
//! `BTreeSet<TermId>` iteration deterministic across a run.

#![forbid(unsafe_code)]

use ahash::AHashMap;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Zero};
use smol_str::SmolStr;

/// Index of an interned term in its [`TermStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId(u32);

impl TermId {
    /// Raw index into the arena.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// First-order sorts of the fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sort {
    /// Propositional sort.
    Bool,
    /// Unbounded integers (program variables).
    Int,
    /// Rationals (probabilities, expectations, runtimes).
    Real,
}

/// Node operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    True,
    False,
    IntLit,
    RealLit,
    /// Free constant symbol (program variable or the infinity placeholder).
    Var,
    /// Uninterpreted function symbol; only ever appears as the head child of
    /// an [`Op::Apply`] node or as a substitution-map key.
    FunSym,
    Not,
    And,
    Or,
    Implies,
    /// Boolean equivalence; `eq` lowers `=` between Booleans to this.
    Iff,
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
    Add,
    Sub,
    Mul,
    Ite,
    ToReal,
    /// Function application: `children[0]` is the [`Op::FunSym`] head, the
    /// remaining children are the arguments.
    Apply,
}

/// Leaf data carried by a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Payload {
    /// No payload (all non-leaf operators).
    None,
    /// Integer literal.
    Int(BigInt),
    /// Rational literal.
    Real(BigRational),
    /// Symbol name (for [`Op::Var`]; the sort lives on the node).
    Sym(SmolStr),
    /// Function symbol: name, argument sorts, result sort.
    Fun(SmolStr, Vec<Sort>, Sort),
}

/// One interned node.
#[derive(Clone, Debug)]
pub struct Node {
    /// Operator.
    pub op: Op,
    /// Leaf data.
    pub payload: Payload,
    /// Child term ids (empty for leaves).
    pub children: Vec<TermId>,
    /// Sort of the term this node roots.
    pub sort: Sort,
}

#[derive(Hash, PartialEq, Eq)]
struct NodeKey {
    op: Op,
    payload: Payload,
    children: Vec<TermId>,
}

/// Append-only arena with an interner.
pub struct TermStore {
    nodes: Vec<Node>,
    interner: AHashMap<NodeKey, TermId>,
}

impl Default for TermStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TermStore {
    /// Empty store.
    pub fn new() -> Self {
        Self { nodes: Vec::new(), interner: AHashMap::new() }
    }

    /// Node behind `id`.
    #[inline]
    pub fn node(&self, id: TermId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Operator of `id`.
    #[inline]
    pub fn op(&self, id: TermId) -> Op {
        self.nodes[id.index()].op
    }

    /// Sort of `id`.
    #[inline]
    pub fn sort(&self, id: TermId) -> Sort {
        self.nodes[id.index()].sort
    }

    /// Number of interned terms.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn intern(&mut self, op: Op, payload: Payload, children: Vec<TermId>, sort: Sort) -> TermId {
        let key = NodeKey { op, payload: payload.clone(), children: children.clone() };
        if let Some(&id) = self.interner.get(&key) {
            return id;
        }
        let id = TermId(self.nodes.len() as u32);
        self.nodes.push(Node { op, payload, children, sort });
        self.interner.insert(key, id);
        id
    }

    /// Re-intern a node with fresh children, keeping operator, payload and
    /// sort. Substitution and simplification rebuild through this.
    pub(crate) fn rebuild(
        &mut self,
        op: Op,
        payload: Payload,
        children: Vec<TermId>,
        sort: Sort,
    ) -> TermId {
        self.intern(op, payload, children, sort)
    }

    // ------------------------------------------------------------------
    // Leaves
    // ------------------------------------------------------------------

    /// Boolean constant.
    pub fn bool_const(&mut self, value: bool) -> TermId {
        if value {
            self.intern(Op::True, Payload::None, Vec::new(), Sort::Bool)
        } else {
            self.intern(Op::False, Payload::None, Vec::new(), Sort::Bool)
        }
    }

    /// `true`.
    pub fn tru(&mut self) -> TermId {
        self.bool_const(true)
    }

    /// `false`.
    pub fn fls(&mut self) -> TermId {
        self.bool_const(false)
    }

    /// Integer literal.
    pub fn int(&mut self, value: impl Into<BigInt>) -> TermId {
        self.intern(Op::IntLit, Payload::Int(value.into()), Vec::new(), Sort::Int)
    }

    /// Rational literal. Integral rationals stay `Real`-sorted.
    pub fn real(&mut self, value: BigRational) -> TermId {
        self.intern(Op::RealLit, Payload::Real(value), Vec::new(), Sort::Real)
    }

    /// Rational literal from a small fraction.
    pub fn real_frac(&mut self, num: i64, den: i64) -> TermId {
        self.real(BigRational::new(BigInt::from(num), BigInt::from(den)))
    }

    /// The `Real` zero.
    pub fn real_zero(&mut self) -> TermId {
        self.real(BigRational::zero())
    }

    /// Free constant symbol.
    pub fn var(&mut self, name: &str, sort: Sort) -> TermId {
        self.intern(Op::Var, Payload::Sym(SmolStr::new(name)), Vec::new(), sort)
    }

    /// Uninterpreted function symbol.
    pub fn fun(&mut self, name: &str, args: Vec<Sort>, ret: Sort) -> TermId {
        self.intern(Op::FunSym, Payload::Fun(SmolStr::new(name), args, ret), Vec::new(), ret)
    }

    // ------------------------------------------------------------------
    // Boolean structure
    // ------------------------------------------------------------------

    /// Negation.
    pub fn not(&mut self, a: TermId) -> TermId {
        debug_assert_eq!(self.sort(a), Sort::Bool);
        self.intern(Op::Not, Payload::None, vec![a], Sort::Bool)
    }

    /// n-ary conjunction. Empty is `true`, singleton is the element itself.
    pub fn and(&mut self, args: Vec<TermId>) -> TermId {
        match args.len() {
            0 => self.tru(),
            1 => args[0],
            _ => self.intern(Op::And, Payload::None, args, Sort::Bool),
        }
    }

    /// n-ary disjunction. Empty is `false`, singleton is the element itself.
    pub fn or(&mut self, args: Vec<TermId>) -> TermId {
        match args.len() {
            0 => self.fls(),
            1 => args[0],
            _ => self.intern(Op::Or, Payload::None, args, Sort::Bool),
        }
    }

    /// Implication.
    pub fn implies(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        self.intern(Op::Implies, Payload::None, vec![lhs, rhs], Sort::Bool)
    }

    /// Boolean equivalence.
    pub fn iff(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        self.intern(Op::Iff, Payload::None, vec![lhs, rhs], Sort::Bool)
    }

    /// Equality; dispatches to [`TermStore::iff`] when both sides are Boolean.
    pub fn eq(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        if self.sort(lhs) == Sort::Bool && self.sort(rhs) == Sort::Bool {
            return self.iff(lhs, rhs);
        }
        debug_assert_eq!(self.sort(lhs), self.sort(rhs));
        self.intern(Op::Eq, Payload::None, vec![lhs, rhs], Sort::Bool)
    }

    /// `lhs <= rhs`.
    pub fn le(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        self.intern(Op::Le, Payload::None, vec![lhs, rhs], Sort::Bool)
    }

    /// `lhs < rhs`.
    pub fn lt(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        self.intern(Op::Lt, Payload::None, vec![lhs, rhs], Sort::Bool)
    }

    /// `lhs >= rhs`.
    pub fn ge(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        self.intern(Op::Ge, Payload::None, vec![lhs, rhs], Sort::Bool)
    }

    /// `lhs > rhs`.
    pub fn gt(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        self.intern(Op::Gt, Payload::None, vec![lhs, rhs], Sort::Bool)
    }

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------

    /// n-ary sum. Must be non-empty; singleton is the element itself.
    pub fn add(&mut self, args: Vec<TermId>) -> TermId {
        debug_assert!(!args.is_empty());
        if args.len() == 1 {
            return args[0];
        }
        let sort = self.sort(args[0]);
        self.intern(Op::Add, Payload::None, args, sort)
    }

    /// Binary difference (only used inside monus axioms).
    pub fn sub(&mut self, lhs: TermId, rhs: TermId) -> TermId {
        let sort = self.sort(lhs);
        self.intern(Op::Sub, Payload::None, vec![lhs, rhs], sort)
    }

    /// n-ary product. Must be non-empty; singleton is the element itself.
    pub fn mul(&mut self, args: Vec<TermId>) -> TermId {
        debug_assert!(!args.is_empty());
        if args.len() == 1 {
            return args[0];
        }
        let sort = self.sort(args[0]);
        self.intern(Op::Mul, Payload::None, args, sort)
    }

    /// If-then-else.
    pub fn ite(&mut self, cond: TermId, then: TermId, els: TermId) -> TermId {
        debug_assert_eq!(self.sort(cond), Sort::Bool);
        let sort = self.sort(then);
        self.intern(Op::Ite, Payload::None, vec![cond, then, els], sort)
    }

    /// Int-to-Real cast; folds integer literals immediately.
    pub fn to_real(&mut self, a: TermId) -> TermId {
        if self.sort(a) == Sort::Real {
            return a;
        }
        if let Payload::Int(v) = &self.node(a).payload {
            let r = BigRational::from_integer(v.clone());
            return self.real(r);
        }
        self.intern(Op::ToReal, Payload::None, vec![a], Sort::Real)
    }

    /// Apply an uninterpreted function symbol to arguments.
    pub fn apply(&mut self, head: TermId, args: Vec<TermId>) -> TermId {
        let ret = match &self.node(head).payload {
            Payload::Fun(_, params, ret) => {
                debug_assert_eq!(params.len(), args.len());
                *ret
            }
            other => panic!("apply head must be a function symbol, got {other:?}"),
        };
        let mut children = Vec::with_capacity(args.len() + 1);
        children.push(head);
        children.extend(args);
        self.intern(Op::Apply, Payload::None, children, ret)
    }

    // ------------------------------------------------------------------
    // Inspection helpers
    // ------------------------------------------------------------------

    /// Numeric value of an `IntLit`/`RealLit`, if `id` is one.
    pub fn literal_value(&self, id: TermId) -> Option<BigRational> {
        match &self.node(id).payload {
            Payload::Int(v) => Some(BigRational::from_integer(v.clone())),
            Payload::Real(r) => Some(r.clone()),
            _ => None,
        }
    }

    /// Whether `id` is the literal zero (of either numeric sort).
    pub fn is_zero_literal(&self, id: TermId) -> bool {
        self.literal_value(id).is_some_and(|v| v.is_zero())
    }

    /// Whether `id` is the literal one (of either numeric sort).
    pub fn is_one_literal(&self, id: TermId) -> bool {
        self.literal_value(id).is_some_and(|v| v.is_one())
    }

    /// Symbol name of a `Var` or `FunSym`.
    pub fn symbol_name(&self, id: TermId) -> Option<&SmolStr> {
        match &self.node(id).payload {
            Payload::Sym(name) => Some(name),
            Payload::Fun(name, _, _) => Some(name),
            _ => None,
        }
    }

    /// Numeric literal of the node's own sort from a rational value.
    pub fn literal_of_sort(&mut self, value: BigRational, sort: Sort) -> TermId {
        match sort {
            Sort::Int => {
                debug_assert!(value.is_integer());
                let v = value.to_integer();
                self.int(v)
            }
            Sort::Real => self.real(value),
            Sort::Bool => panic!("no Boolean numeric literal"),
        }
    }

    /// Human-oriented rendering for logs and test failure messages.
    pub fn display(&self, id: TermId) -> String {
        let mut out = String::new();
        self.write_display(id, &mut out);
        out
    }

    fn write_display(&self, id: TermId, out: &mut String) {
        let node = self.node(id);
        match (node.op, &node.payload) {
            (Op::True, _) => out.push_str("true"),
            (Op::False, _) => out.push_str("false"),
            (Op::IntLit, Payload::Int(v)) => out.push_str(&v.to_string()),
            (Op::RealLit, Payload::Real(r)) => {
                if r.is_integer() {
                    out.push_str(&format!("{}.0", r.to_integer()));
                } else {
                    out.push_str(&format!("{}/{}", r.numer(), r.denom()));
                }
            }
            (Op::Var, Payload::Sym(name)) => out.push_str(name),
            (Op::FunSym, Payload::Fun(name, _, _)) => out.push_str(name),
            (op, _) => {
                let sym = match op {
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
                    Op::Apply => "",
                    _ => unreachable!(),
                };
                out.push('(');
                if !sym.is_empty() {
                    out.push_str(sym);
                    out.push(' ');
                }
                for (i, child) in node.children.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    self.write_display(*child, out);
                }
                out.push(')');
            }
        }
    }
}

/// Collect every `Var` and `FunSym` occurring in `id`, in first-visit order.
pub fn collect_symbols(store: &TermStore, id: TermId, out: &mut Vec<TermId>) {
    fn walk(store: &TermStore, id: TermId, seen: &mut ahash::AHashSet<TermId>, out: &mut Vec<TermId>) {
        if !seen.insert(id) {
            return;
        }
        let node = store.node(id);
        match node.op {
            Op::Var | Op::FunSym => out.push(id),
            _ => {
                for &child in &node.children {
                    walk(store, child, seen, out);
                }
            }
        }
    }
    let mut seen = ahash::AHashSet::new();
    walk(store, id, &mut seen, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_structural() {
        let mut store = TermStore::new();
        let x = store.var("x", Sort::Int);
        let one = store.int(1);
        let a = store.add(vec![x, one]);
        let x2 = store.var("x", Sort::Int);
        let one2 = store.int(1);
        let b = store.add(vec![x2, one2]);
        assert_eq!(a, b);
        assert_eq!(x, x2);
    }

    #[test]
    fn equals_dispatches_to_iff_on_booleans() {
        let mut store = TermStore::new();
        let p = store.var("p", Sort::Bool);
        let q = store.var("q", Sort::Bool);
        let e = store.eq(p, q);
        assert_eq!(store.op(e), Op::Iff);

        let x = store.var("x", Sort::Int);
        let y = store.var("y", Sort::Int);
        let e = store.eq(x, y);
        assert_eq!(store.op(e), Op::Eq);
    }

    #[test]
    fn to_real_folds_integer_literals() {
        let mut store = TermStore::new();
        let five = store.int(5);
        let r = store.to_real(five);
        assert_eq!(store.op(r), Op::RealLit);
        assert_eq!(store.literal_value(r), Some(BigRational::from_integer(5.into())));
    }

    #[test]
    fn apply_carries_result_sort() {
        let mut store = TermStore::new();
        let p = store.fun("P_1", vec![Sort::Int, Sort::Int], Sort::Real);
        let x = store.var("x", Sort::Int);
        let y = store.var("y", Sort::Int);
        let app = store.apply(p, vec![x, y]);
        assert_eq!(store.sort(app), Sort::Real);
        assert_eq!(store.node(app).children[0], p);
    }

    #[test]
    fn symbol_collection_visits_heads() {
        let mut store = TermStore::new();
        let p = store.fun("P_1", vec![Sort::Int], Sort::Real);
        let x = store.var("x", Sort::Int);
        let app = store.apply(p, vec![x]);
        let half = store.real_frac(1, 2);
        let t = store.mul(vec![half, app]);
        let mut syms = Vec::new();
        collect_symbols(&store, t, &mut syms);
        assert!(syms.contains(&p));
        assert!(syms.contains(&x));
    }
}
