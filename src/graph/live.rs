// src/graph/live.rs
//
// Backward liveness. live() re-derives a node's liveness from its uses;
// live_use(use, def) is one use's contribution to one def. Liveness only
// ever falls in the lattice (toward "all live") as the driver iterates;
// ANY means dead, ALL means a fully demanded scalar, Mem values carry
// per-alias demand for memory nodes.

use crate::types::{TypeId, TypeKind, TypeStore};

use super::{Nodes, NodeId, Op, MEM_IDX};

impl Nodes {
    /// Recompute this node's liveness from its uses (or its own demand,
    /// for the pinned graph root).
    pub fn live(&self, types: &mut TypeStore, n: NodeId, post_cg: bool) -> TypeId {
        let t = types.t();
        if let Op::Scope = self.node(n).op {
            return self.scope_live(types, n);
        }
        let mut acc = t.any;
        let uses: Vec<NodeId> = self.node(n).uses.to_vec();
        for u in uses {
            let c = self.live_use(types, u, n, post_cg);
            acc = types.meet(acc, c);
        }
        if self.node(n).keep > 0 && acc == t.any {
            // Pinned but otherwise unused: keep it minimally alive
            acc = if self.is_mem(types, n) { t.anymem } else { t.all };
        }
        acc
    }

    // The scope demands its result fully; it demands memory only as far
    // as the result can reach it.
    fn scope_live(&self, types: &mut TypeStore, n: NodeId) -> TypeId {
        let t = types.t();
        let rez = match self.def(n, 1) {
            Some(r) => self.node(r).val,
            None => return t.anymem,
        };
        if !val_escapes(types, rez) {
            return t.anymem;
        }
        let mem = match self.def(n, 0) {
            Some(m) => self.node(m).val,
            None => return t.anymem,
        };
        if matches!(types.kind(mem), TypeKind::Mem { .. }) {
            types.flatten_live_fields(mem)
        } else {
            t.allmem
        }
    }

    /// This node's contribution to one of its defs.
    pub fn live_use(
        &self,
        types: &mut TypeStore,
        u: NodeId,
        def: NodeId,
        post_cg: bool,
    ) -> TypeId {
        let t = types.t();
        let node = self.node(u);
        match &node.op {
            Op::Scope => {
                if self.def(u, 0) == Some(def) {
                    // The memory the scope returns
                    self.scope_live(types, u)
                } else {
                    t.all
                }
            }
            Op::Store => {
                if self.def(u, 0) == Some(def) {
                    node.live
                } else {
                    t.all
                }
            }
            Op::Call => {
                if self.def(u, MEM_IDX) == Some(def) {
                    node.live
                } else {
                    t.all
                }
            }
            Op::Ret => {
                if self.def(u, 1) == Some(def) {
                    node.live
                } else {
                    t.all
                }
            }
            Op::CallEpi { .. } => self.callepi_live_use(types, u, def, post_cg),
            // A dead If demands nothing
            Op::If => {
                if node.val == t.if_any {
                    t.any
                } else {
                    t.all
                }
            }
            _ => {
                if self.is_mem(types, def) {
                    node.live
                } else {
                    t.all
                }
            }
        }
    }
}

/// Can this value reach memory? Pointers and unresolved scalars escape;
/// plain numbers and control do not.
pub fn val_escapes(types: &TypeStore, val: TypeId) -> bool {
    matches!(
        types.kind(val),
        TypeKind::MemPtr { .. }
            | TypeKind::FunPtr { .. }
            | TypeKind::Simple(crate::types::Simple::Scalar)
            | TypeKind::Simple(crate::types::Simple::All)
    )
}
