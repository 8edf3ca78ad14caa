// src/graph/mod.rs
//
// Sea-of-nodes SSA graph: the node arena, def/use edge maintenance and
// the builder API the parser drives.
//
// Control is ordinary data on a distinguished control type; there are no
// basic blocks. Every node caches its forward flow value `val`, its
// backward liveness `live` and an optional type variable `tv`. The
// caches are owned by the driver; nothing here recomputes them eagerly.

mod callepi;
mod ideal;
mod live;
mod value;

pub use ideal::Ideal;

use smallvec::SmallVec;

use rustc_hash::FxHashMap;

use crate::tvar::{TvId, TvStore};
use crate::types::{TypeId, TypeStore};

/// Index of the memory argument in a call tuple.
pub const MEM_IDX: usize = 1;
/// Index of the function pointer in a call tuple.
pub const FPTR_IDX: usize = 2;
/// Index of the first real argument in a call tuple.
pub const ARG_IDX: usize = 3;
/// Index of the result in a function-return tuple.
pub const REZ_IDX: usize = 2;

/// A unique node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Integer primitives; enough surface for folding and one-op inlining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimOp {
    Add,
    Sub,
    Mul,
    Eq,
}

/// Forward references move through three states; reaching the end of
/// scope before `Defined` is a program error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrefState {
    Undeclared,
    Scoped,
    Defined,
}

/// Node operations.
#[derive(Debug, Clone)]
pub enum Op {
    /// Constant with an interned type.
    Con(TypeId),
    /// Program entry control.
    Start,
    /// Program entry memory; everything still to-be-allocated.
    StartMem,
    /// Worst-case default memory, one def slot per alias.
    DefMem,
    /// Graph root: defs are [mem, rez]; always pinned.
    Scope,
    /// Object construction; defs are the field values in label order.
    Struct { labels: Vec<Box<str>> },
    /// Allocation site minting pointers to a fresh alias class.
    New { alias: u32 },
    /// defs are [mem, ptr, obj]; produces the updated memory.
    Store,
    /// defs are [ctrl, pred]; produces a 2-tuple of branch controls.
    If,
    /// Control projection out of a tuple producer.
    CProj(u32),
    /// Data projection out of a tuple producer.
    Proj(u32),
    /// Memory flowing from a call into its callee.
    MProj,
    /// Call-graph control edge from a call into a Fun.
    CEProj,
    /// defs are [ctrl-ish, data...]; the data meet gated by control.
    Phi,
    /// Function head. defs[0] is unused; caller control edges follow, kept
    /// index-parallel with every Parm's actual inputs.
    Fun { fidx: u32, nargs: u32 },
    /// defs are [fun, actual per caller...]; idx names the call arg slot.
    Parm { idx: u32 },
    /// defs are [ctrl, mem, rez, fun]; produces (ctrl, mem, rez).
    Ret,
    /// defs are [ctrl, mem, fptr, args...]; produces the call tuple.
    Call,
    /// Merge of all returns reaching a call. defs are [call, defmem,
    /// wired rets...]; after inlining collapses it, defs are [ctrl, mem,
    /// rez] and `is_copy` is set.
    CallEpi { is_copy: bool },
    /// Named forward reference from the parser.
    ForwardRef { name: Box<str>, state: FrefState },
    /// defs are [lhs, rhs].
    Prim(PrimOp),
}

/// A vertex in the graph. Edges are kept both ways: `defs` are ordered
/// inputs (nullable), `uses` the reverse multiset.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub defs: SmallVec<[Option<NodeId>; 4]>,
    pub uses: SmallVec<[NodeId; 4]>,
    pub val: TypeId,
    pub live: TypeId,
    pub tv: Option<TvId>,
    pub keep: u32,
    pub dead: bool,
}

/// The node arena.
pub struct Nodes {
    nodes: Vec<Node>,
    fun_by_fidx: FxHashMap<u32, NodeId>,
    formals: FxHashMap<NodeId, Vec<TypeId>>,
    spans: FxHashMap<NodeId, (usize, usize)>,
}

impl Nodes {
    pub fn new() -> Self {
        Nodes {
            nodes: Vec::new(),
            fun_by_fidx: FxHashMap::default(),
            formals: FxHashMap::default(),
            spans: FxHashMap::default(),
        }
    }

    /// Attach the parse location (offset, length) a node came from.
    pub fn set_span(&mut self, n: NodeId, offset: usize, len: usize) {
        self.spans.insert(n, (offset, len));
    }

    pub fn span_of(&self, n: NodeId) -> Option<(usize, usize)> {
        self.spans.get(&n).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId).filter(|&id| !self.node(id).dead)
    }

    /// Create a node; both vals start at the lattice top (dead/unknown).
    pub fn create(&mut self, op: Op, defs: Vec<Option<NodeId>>, top: TypeId) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        if let Op::Fun { fidx, .. } = &op {
            self.fun_by_fidx.insert(*fidx, id);
        }
        self.nodes.push(Node {
            op,
            defs: SmallVec::new(),
            uses: SmallVec::new(),
            val: top,
            live: top,
            tv: None,
            keep: 0,
            dead: false,
        });
        for d in defs {
            self.add_def(id, d);
        }
        id
    }

    /// Input accessor; a missing def reads as None.
    #[inline]
    pub fn def(&self, n: NodeId, i: usize) -> Option<NodeId> {
        self.node(n).defs.get(i).copied().flatten()
    }

    /// The cached value of input `i`, or `top` when the slot is empty.
    #[inline]
    pub fn val(&self, n: NodeId, i: usize, top: TypeId) -> TypeId {
        match self.def(n, i) {
            Some(d) => self.node(d).val,
            None => top,
        }
    }

    pub fn add_def(&mut self, n: NodeId, def: Option<NodeId>) {
        self.node_mut(n).defs.push(def);
        if let Some(d) = def {
            self.node_mut(d).uses.push(n);
        }
    }

    pub fn set_def(&mut self, n: NodeId, i: usize, def: Option<NodeId>) {
        let old = self.node(n).defs[i];
        if old == def {
            return;
        }
        if let Some(o) = old {
            self.remove_use(o, n);
        }
        self.node_mut(n).defs[i] = def;
        if let Some(d) = def {
            self.node_mut(d).uses.push(n);
        }
    }

    /// Remove input `i`, shifting the rest down. Fun and Parm rely on the
    /// shift staying index-parallel across both node kinds.
    pub fn remove_def(&mut self, n: NodeId, i: usize) {
        let old = self.node_mut(n).defs.remove(i);
        if let Some(o) = old {
            self.remove_use(o, n);
        }
    }

    /// Drop every input, releasing the use edges.
    pub fn pop_defs(&mut self, n: NodeId) {
        while !self.node(n).defs.is_empty() {
            let i = self.node(n).defs.len() - 1;
            self.remove_def(n, i);
        }
    }

    fn remove_use(&mut self, def: NodeId, user: NodeId) {
        let uses = &mut self.node_mut(def).uses;
        if let Some(pos) = uses.iter().position(|&u| u == user) {
            uses.swap_remove(pos);
        }
    }

    /// Replace every use of `old` with `new`, then kill `old`.
    pub fn subsume(&mut self, old: NodeId, new: NodeId) {
        let users: Vec<NodeId> = self.node(old).uses.to_vec();
        for u in users {
            let slots: Vec<usize> = self
                .node(u)
                .defs
                .iter()
                .enumerate()
                .filter(|(_, d)| **d == Some(old))
                .map(|(i, _)| i)
                .collect();
            for i in slots {
                self.set_def(u, i, Some(new));
            }
        }
        self.kill(old);
    }

    /// Release a node that has become unreachable.
    pub fn kill(&mut self, n: NodeId) {
        debug_assert!(self.node(n).uses.is_empty(), "kill of a node still in use");
        debug_assert_eq!(self.node(n).keep, 0, "kill of a pinned node");
        self.pop_defs(n);
        let fidx = match &self.node(n).op {
            Op::Fun { fidx, .. } => Some(*fidx),
            _ => None,
        };
        self.node_mut(n).dead = true;
        if let Some(f) = fidx {
            self.fun_by_fidx.remove(&f);
        }
    }

    /// Sweep nodes that lost their last use; killing one can strand more,
    /// so iterate to a fixed point.
    pub fn cleanup_dead(&mut self) {
        loop {
            let mut killed = false;
            for i in 0..self.nodes.len() as u32 {
                let id = NodeId(i);
                let n = self.node(id);
                if !n.dead && n.keep == 0 && n.uses.is_empty() {
                    self.kill(id);
                    killed = true;
                }
            }
            if !killed {
                break;
            }
        }
    }

    pub fn keep(&mut self, n: NodeId) {
        self.node_mut(n).keep += 1;
    }

    pub fn unkeep(&mut self, n: NodeId) {
        self.node_mut(n).keep -= 1;
    }

    /// The Fun node registered for a fidx, dead ones excluded.
    pub fn find_fidx(&self, fidx: u32) -> Option<NodeId> {
        self.fun_by_fidx.get(&fidx).copied().filter(|&f| !self.node(f).dead)
    }

    /// Re-home a Fun onto another fidx, as the split machinery does when
    /// the old id becomes a pure parent.
    pub fn set_fidx(&mut self, fun: NodeId, new_fidx: u32) {
        let old = match &mut self.node_mut(fun).op {
            Op::Fun { fidx, .. } => std::mem::replace(fidx, new_fidx),
            _ => panic!("set_fidx of a non-Fun"),
        };
        self.fun_by_fidx.remove(&old);
        self.fun_by_fidx.insert(new_fidx, fun);
    }

    /// The Ret node of a Fun.
    pub fn fun_ret(&self, fun: NodeId) -> Option<NodeId> {
        self.node(fun)
            .uses
            .iter()
            .copied()
            .find(|&u| matches!(self.node(u).op, Op::Ret) && self.def(u, 3) == Some(fun))
    }

    /// Declared formal argument types for a Fun, if the parser gave any.
    pub fn fun_formals(&self, fun: NodeId) -> Option<&Vec<TypeId>> {
        self.formals.get(&fun)
    }

    pub fn set_fun_formals(&mut self, fun: NodeId, formals: Vec<TypeId>) {
        self.formals.insert(fun, formals);
    }

    /// All Parm nodes hanging off a Fun.
    pub fn fun_parms(&self, fun: NodeId) -> Vec<NodeId> {
        self.node(fun)
            .uses
            .iter()
            .copied()
            .filter(|&u| matches!(self.node(u).op, Op::Parm { .. }) && self.def(u, 0) == Some(fun))
            .collect()
    }

    /// Short display label, mostly for tracing and the inspector.
    pub fn xstr(&self, n: NodeId) -> String {
        let node = self.node(n);
        if node.dead {
            return format!("DEAD#{}", n.0);
        }
        match &node.op {
            Op::Con(_) => format!("Con#{}", n.0),
            Op::Start => "Start".into(),
            Op::StartMem => "StartMem".into(),
            Op::DefMem => "DefMem".into(),
            Op::Scope => "Scope".into(),
            Op::Struct { .. } => format!("Struct#{}", n.0),
            Op::New { alias } => format!("New*{}", alias),
            Op::Store => format!("Store#{}", n.0),
            Op::If => format!("If#{}", n.0),
            Op::CProj(i) => format!("CProj{}", i),
            Op::Proj(i) => format!("Proj{}", i),
            Op::MProj => "MProj".into(),
            Op::CEProj => "CEProj".into(),
            Op::Phi => format!("Phi#{}", n.0),
            Op::Fun { fidx, .. } => format!("Fun[{}]", fidx),
            Op::Parm { idx } => format!("Parm{}", idx),
            Op::Ret => format!("Ret#{}", n.0),
            Op::Call => format!("Call#{}", n.0),
            Op::CallEpi { is_copy: true } => "CopyEpi".into(),
            Op::CallEpi { is_copy: false } => "CallEpi".into(),
            Op::ForwardRef { name, .. } => format!("???{}", name),
            Op::Prim(p) => format!("{:?}", p),
        }
    }

    /// Memory-flavored nodes carry Mem liveness; everything else carries
    /// plain scalar liveness.
    pub fn is_mem(&self, types: &TypeStore, n: NodeId) -> bool {
        match &self.node(n).op {
            Op::StartMem | Op::DefMem | Op::Store | Op::MProj => true,
            Op::Parm { idx } => *idx as usize == MEM_IDX,
            _ => matches!(types.kind(self.node(n).val), crate::types::TypeKind::Mem { .. }),
        }
    }
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound construction API; the parser's window into the graph.
pub struct GraphBuilder<'a> {
    pub nodes: &'a mut Nodes,
    pub types: &'a mut TypeStore,
    pub tvs: &'a mut TvStore,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(u: &'a mut crate::Universe) -> Self {
        GraphBuilder { nodes: &mut u.nodes, types: &mut u.types, tvs: &mut u.tvs }
    }

    fn mk(&mut self, op: Op, defs: Vec<Option<NodeId>>) -> NodeId {
        let top = self.types.t().any;
        let n = self.nodes.create(op, defs, top);
        let tv = self.tvs.new_leaf();
        self.tvs.deps_add(tv, n);
        self.nodes.node_mut(n).tv = Some(tv);
        n
    }

    pub fn new_con(&mut self, ty: TypeId) -> NodeId {
        let n = self.mk(Op::Con(ty), vec![]);
        // Function pointers keep a plain variable: their shape comes from
        // unifying with the function itself, not from the flow type
        if !matches!(self.types.kind(ty), crate::types::TypeKind::FunPtr { .. }) {
            let tv = self.tvs.new_base(ty);
            self.nodes.node_mut(n).tv = Some(tv);
        }
        n
    }

    pub fn new_start(&mut self) -> NodeId {
        self.mk(Op::Start, vec![])
    }

    pub fn new_start_mem(&mut self, start: NodeId) -> NodeId {
        self.mk(Op::StartMem, vec![Some(start)])
    }

    pub fn new_def_mem(&mut self) -> NodeId {
        self.mk(Op::DefMem, vec![None, None])
    }

    /// The graph root; pinned so liveness has somewhere to start.
    pub fn new_scope(&mut self, mem: NodeId, rez: NodeId) -> NodeId {
        let n = self.mk(Op::Scope, vec![Some(mem), Some(rez)]);
        self.nodes.keep(n);
        n
    }

    pub fn new_if(&mut self, ctrl: NodeId, pred: NodeId) -> NodeId {
        self.mk(Op::If, vec![Some(ctrl), Some(pred)])
    }

    pub fn new_cproj(&mut self, t: NodeId, idx: u32) -> NodeId {
        self.mk(Op::CProj(idx), vec![Some(t)])
    }

    pub fn new_proj(&mut self, t: NodeId, idx: u32) -> NodeId {
        self.mk(Op::Proj(idx), vec![Some(t)])
    }

    pub fn new_struct(&mut self, fields: Vec<(&str, NodeId)>) -> NodeId {
        let labels: Vec<Box<str>> = fields.iter().map(|(l, _)| (*l).into()).collect();
        let defs = fields.into_iter().map(|(_, n)| Some(n)).collect();
        self.mk(Op::Struct { labels }, defs)
    }

    /// A fresh allocation site with its own alias class.
    pub fn new_new(&mut self) -> NodeId {
        let alias = self.types.alias_tree.new_id();
        self.mk(Op::New { alias }, vec![])
    }

    pub fn new_store(&mut self, mem: NodeId, ptr: NodeId, obj: NodeId) -> NodeId {
        self.mk(Op::Store, vec![Some(mem), Some(ptr), Some(obj)])
    }

    /// A function head with a fresh fidx.
    pub fn new_fun(&mut self, nargs: u32) -> NodeId {
        let fidx = self.types.fidx_tree.new_id();
        self.mk(Op::Fun { fidx, nargs }, vec![None])
    }

    /// A function head on an already-allocated fidx; used for clones made
    /// after a fidx split.
    pub fn new_fun_with_fidx(&mut self, fidx: u32, nargs: u32) -> NodeId {
        self.mk(Op::Fun { fidx, nargs }, vec![None])
    }

    pub fn new_parm(&mut self, fun: NodeId, idx: u32) -> NodeId {
        self.mk(Op::Parm { idx }, vec![Some(fun)])
    }

    pub fn new_ret(&mut self, ctrl: NodeId, mem: NodeId, rez: NodeId, fun: NodeId) -> NodeId {
        self.mk(Op::Ret, vec![Some(ctrl), Some(mem), Some(rez), Some(fun)])
    }

    pub fn new_call(
        &mut self,
        ctrl: NodeId,
        mem: NodeId,
        fptr: NodeId,
        args: &[NodeId],
    ) -> NodeId {
        let mut defs = vec![Some(ctrl), Some(mem), Some(fptr)];
        defs.extend(args.iter().map(|&a| Some(a)));
        self.mk(Op::Call, defs)
    }

    pub fn new_callepi(&mut self, call: NodeId, defmem: Option<NodeId>) -> NodeId {
        self.mk(Op::CallEpi { is_copy: false }, vec![Some(call), defmem])
    }

    pub fn new_forward_ref(&mut self, name: &str) -> NodeId {
        self.mk(Op::ForwardRef { name: name.into(), state: FrefState::Undeclared }, vec![])
    }

    pub fn new_prim(&mut self, op: PrimOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.mk(Op::Prim(op), vec![Some(lhs), Some(rhs)])
    }

    /// A constant function pointer for a Fun node. It shares the Fun's
    /// type variable; the pointer and the function are the same thing to
    /// the unifier.
    pub fn new_funptr(&mut self, fun: NodeId) -> NodeId {
        let (fidx, nargs) = match self.nodes.node(fun).op {
            Op::Fun { fidx, nargs } => (fidx, nargs),
            _ => panic!("new_funptr of a non-Fun"),
        };
        let t = self.types.t();
        let fp = self.types.funptr_make(
            crate::bits::BitsFun::make_const(fidx),
            nargs as u8,
            t.any,
            t.scalar,
        );
        let con = self.new_con(fp);
        let tv = self.nodes.node(fun).tv;
        self.nodes.node_mut(con).tv = tv;
        con
    }

    /// Advance a forward ref once its scope is known.
    pub fn scope_forward_ref(&mut self, fref: NodeId) {
        match &mut self.nodes.node_mut(fref).op {
            Op::ForwardRef { state, .. } => {
                debug_assert_eq!(*state, FrefState::Undeclared);
                *state = FrefState::Scoped;
            }
            _ => panic!("not a forward ref"),
        }
    }

    /// Resolve a forward ref to its definition, collapsing it out of the
    /// graph.
    pub fn define_forward_ref(&mut self, fref: NodeId, def: NodeId) {
        match &mut self.nodes.node_mut(fref).op {
            Op::ForwardRef { state, .. } => {
                debug_assert_eq!(*state, FrefState::Scoped);
                *state = FrefState::Defined;
            }
            _ => panic!("not a forward ref"),
        }
        self.nodes.subsume(fref, def);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Universe;

    #[test]
    fn test_edges_both_ways() {
        let mut u = Universe::new();
        let mut b = GraphBuilder::new(&mut u);
        let five = {
            let t = b.types.int_con(5);
            b.new_con(t)
        };
        let mem = {
            let t = b.types.t().allmem;
            b.new_con(t)
        };
        let scope = b.new_scope(mem, five);
        assert_eq!(u.nodes.def(scope, 0), Some(mem));
        assert_eq!(u.nodes.def(scope, 1), Some(five));
        assert!(u.nodes.node(five).uses.contains(&scope));
        assert!(u.nodes.node(mem).uses.contains(&scope));
    }

    #[test]
    fn test_subsume_moves_uses() {
        let mut u = Universe::new();
        let mut b = GraphBuilder::new(&mut u);
        let a = {
            let t = b.types.int_con(1);
            b.new_con(t)
        };
        let c = {
            let t = b.types.int_con(2);
            b.new_con(t)
        };
        let p = b.new_prim(PrimOp::Add, a, c);
        let d = {
            let t = b.types.int_con(3);
            b.new_con(t)
        };
        u.nodes.subsume(a, d);
        assert_eq!(u.nodes.def(p, 0), Some(d));
        assert!(u.nodes.node(a).dead);
        assert!(u.nodes.node(d).uses.contains(&p));
    }

    #[test]
    fn test_remove_def_shifts() {
        let mut u = Universe::new();
        let mut b = GraphBuilder::new(&mut u);
        let f = b.new_fun(1);
        let p = b.new_parm(f, ARG_IDX as u32);
        let a0 = {
            let t = b.types.int_con(10);
            b.new_con(t)
        };
        let a1 = {
            let t = b.types.int_con(11);
            b.new_con(t)
        };
        u.nodes.add_def(p, Some(a0));
        u.nodes.add_def(p, Some(a1));
        u.nodes.remove_def(p, 1);
        assert_eq!(u.nodes.def(p, 1), Some(a1));
        assert!(u.nodes.node(a0).uses.is_empty());
    }
}
