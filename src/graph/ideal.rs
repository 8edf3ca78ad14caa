// src/graph/ideal.rs
//
// Local rewrites. ideal_reduce() inspects one node and either returns a
// replacement, reports in-place progress, or leaves the graph alone.
// The heavy rewrites (wiring and inlining) live with CallEpi.

use crate::opt::Work;
use crate::types::TypeStore;

use super::{Nodes, NodeId, Op};

/// Outcome of one ideal_reduce attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ideal {
    /// No change.
    None,
    /// The node rewrote itself or the graph around it.
    Progress,
    /// The node should be replaced by the given node.
    Replace(NodeId),
}

impl Nodes {
    /// If this node is a pass-through for projection `idx`, the node the
    /// projection should forward to.
    pub fn is_copy(&self, types: &TypeStore, n: NodeId, idx: u32) -> Option<NodeId> {
        let t = types.t();
        match &self.node(n).op {
            Op::If => {
                let v = self.node(n).val;
                if v == t.if_true && idx == 1 {
                    return self.def(n, 0);
                }
                if v == t.if_false && idx == 0 {
                    return self.def(n, 0);
                }
                None
            }
            Op::CallEpi { is_copy: true } => self.def(n, idx as usize),
            _ => None,
        }
    }

    /// One local rewrite step.
    pub fn ideal_reduce(
        &mut self,
        types: &mut TypeStore,
        work: &mut Work,
        n: NodeId,
        post_cg: bool,
    ) -> Ideal {
        match self.node(n).op.clone() {
            Op::CProj(idx) | Op::Proj(idx) => {
                let producer = match self.def(n, 0) {
                    Some(p) => p,
                    None => return Ideal::None,
                };
                match self.is_copy(types, producer, idx) {
                    Some(tgt) => Ideal::Replace(tgt),
                    None => Ideal::None,
                }
            }
            Op::MProj => {
                let producer = match self.def(n, 0) {
                    Some(p) => p,
                    None => return Ideal::None,
                };
                match self.is_copy(types, producer, super::MEM_IDX as u32) {
                    Some(tgt) => Ideal::Replace(tgt),
                    None => Ideal::None,
                }
            }
            Op::CallEpi { is_copy: false } => self.callepi_ideal(types, work, n, post_cg),
            _ => Ideal::None,
        }
    }
}
