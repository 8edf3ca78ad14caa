// src/opt/mod.rs
//
// The fixpoint driver: one flow worklist, one unify worklist, and the
// delayed-fresh / delayed-resolve queues drained between rounds.
//
// Each iteration pops a node and recomputes its value, its liveness and
// its type variable. Any change re-enqueues the right neighbors: uses
// for values, defs for liveness, and the variable's watching nodes for
// unification. Monotonicity does the termination proof: values only
// fall, liveness only rises, and type variables only expand or unify.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::graph::{Ideal, NodeId, Op, ARG_IDX, FPTR_IDX};
use crate::tvar::{TvId, TvVec};
use crate::Universe;

/// Deduplicating FIFO worklist.
pub struct Work {
    q: VecDeque<NodeId>,
    on: FxHashSet<NodeId>,
}

impl Work {
    pub fn new() -> Self {
        Work { q: VecDeque::new(), on: FxHashSet::default() }
    }

    pub fn add(&mut self, n: NodeId) {
        if self.on.insert(n) {
            self.q.push_back(n);
        }
    }

    pub fn pop(&mut self) -> Option<NodeId> {
        let n = self.q.pop_front()?;
        self.on.remove(&n);
        Some(n)
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }
}

impl Default for Work {
    fn default() -> Self {
        Self::new()
    }
}

/// What one fixpoint run did.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixpointStats {
    pub rounds: usize,
    pub flow_steps: usize,
    pub unify_steps: usize,
    /// Value recomputations that tried to rise; always zero unless a
    /// transfer function is buggy.
    pub non_monotone: usize,
}

/// Worklist fixpoint over values, liveness and type variables.
pub struct Driver {
    work_flow: Work,
    work_unify: Work,
    /// Set once the call graph is complete: freezes stop, DefMem dies.
    pub post_cg: bool,
    /// Backstop for broken transfer functions; generous by default.
    pub max_steps: usize,
}

impl Driver {
    pub fn new() -> Self {
        Driver { work_flow: Work::new(), work_unify: Work::new(), post_cg: false, max_steps: 1 << 20 }
    }

    /// Run to a joint fixpoint of flow values, liveness and unification.
    pub fn run(&mut self, u: &mut Universe) -> FixpointStats {
        let mut stats = FixpointStats::default();
        for n in u.nodes.ids().collect::<Vec<_>>() {
            self.work_flow.add(n);
            self.work_unify.add(n);
        }
        loop {
            stats.rounds += 1;
            while let Some(n) = self.work_flow.pop() {
                if u.nodes.node(n).dead {
                    continue;
                }
                stats.flow_steps += 1;
                if stats.flow_steps > self.max_steps {
                    warn!("flow worklist exceeded {} steps; bailing", self.max_steps);
                    return stats;
                }
                self.step_flow(u, n, &mut stats);
            }
            while let Some(n) = self.work_unify.pop() {
                if u.nodes.node(n).dead {
                    continue;
                }
                stats.unify_steps += 1;
                if self.step_unify(u, n) {
                    for d in u.tvs.take_pending_deps() {
                        self.work_flow.add(d);
                        self.work_unify.add(d);
                    }
                }
            }
            // Between rounds: replay delayed fresh-unifications and field
            // resolutions discovered since the last drain
            let p1 = u.tvs.do_delay_fresh(&mut u.types);
            let p2 = u.tvs.do_delay_resolve(&mut u.types);
            for d in u.tvs.take_pending_deps() {
                self.work_flow.add(d);
                self.work_unify.add(d);
            }
            if self.work_flow.is_empty() && self.work_unify.is_empty() && !p1 && !p2 {
                break;
            }
        }
        u.nodes.cleanup_dead();
        debug!(
            rounds = stats.rounds,
            flow = stats.flow_steps,
            unify = stats.unify_steps,
            "fixpoint reached"
        );
        stats
    }

    fn step_flow(&mut self, u: &mut Universe, n: NodeId, stats: &mut FixpointStats) {
        // Rewrite first: wiring a call before evaluating it keeps the
        // evaluation from bottoming out on a target about to be wired
        match u.nodes.ideal_reduce(&mut u.types, &mut self.work_flow, n, self.post_cg) {
            Ideal::None => {}
            Ideal::Progress => {
                self.work_flow.add(n);
            }
            Ideal::Replace(r) => {
                trace!(node = %u.nodes.xstr(n), with = %u.nodes.xstr(r), "replace");
                let uses: Vec<NodeId> = u.nodes.node(n).uses.to_vec();
                u.nodes.subsume(n, r);
                self.work_flow.add(r);
                for use_ in uses {
                    self.work_flow.add(use_);
                }
                return;
            }
        }
        let old = u.nodes.node(n).val;
        let v = u.nodes.value(&mut u.types, n, self.post_cg);
        if v != old {
            if u.types.meet(old, v) != v {
                stats.non_monotone += 1;
                trace!(node = %u.nodes.xstr(n), "value rose in the lattice");
            }
            u.nodes.node_mut(n).val = v;
            trace!(node = %u.nodes.xstr(n), val = %u.types.str_of(v), "val");
            let uses: Vec<NodeId> = u.nodes.node(n).uses.to_vec();
            for use_ in uses {
                self.work_flow.add(use_);
                self.add_work_use_extra(u, use_, n);
            }
            self.work_unify.add(n);
        }
        let oldl = u.nodes.node(n).live;
        let l = u.nodes.live(&mut u.types, n, self.post_cg);
        if l != oldl {
            u.nodes.node_mut(n).live = l;
            for i in 0..u.nodes.node(n).defs.len() {
                if let Some(d) = u.nodes.def(n, i) {
                    self.work_flow.add(d);
                }
            }
        }
    }

    // When a Call's value changes, its CallEpi neighbors shift liveness:
    // the called memory, the function pointer, and every wired return.
    fn add_work_use_extra(&mut self, u: &Universe, use_: NodeId, chg: NodeId) {
        if !matches!(u.nodes.node(use_).op, Op::CallEpi { .. }) {
            return;
        }
        if !matches!(u.nodes.node(chg).op, Op::Call) {
            return;
        }
        if let Some(m) = u.nodes.def(chg, crate::graph::MEM_IDX) {
            self.work_flow.add(m);
        }
        if let Some(f) = u.nodes.def(chg, FPTR_IDX) {
            self.work_flow.add(f);
        }
        for k in 0..u.nodes.nwired(use_) {
            if let Some(r) = u.nodes.wired(use_, k) {
                self.work_flow.add(r);
            }
        }
    }

    // Per-node Hindley-Milner contribution. Only a few nodes carry
    // interesting unification duties; the rest report no progress.
    fn step_unify(&mut self, u: &mut Universe, n: NodeId) -> bool {
        match u.nodes.node(n).op.clone() {
            Op::CallEpi { is_copy: false } => self.unify_callepi(u, n),
            Op::Fun { .. } => self.unify_fun(u, n),
            _ => false,
        }
    }

    // The call side demands the callee look like a function over the
    // actual argument variables returning the CallEpi's variable.
    fn unify_callepi(&mut self, u: &mut Universe, n: NodeId) -> bool {
        let cepi_tv = match u.nodes.node(n).tv {
            Some(tv) => tv,
            None => return false,
        };
        let cepi_tv_root = u.tvs.find(cepi_tv);
        if u.tvs.is_err(cepi_tv_root) {
            return false; // already sick, nothing to add
        }
        let call = match u.nodes.def(n, 0) {
            Some(c) => c,
            None => return false,
        };
        let fdx = match u.nodes.def(call, FPTR_IDX) {
            Some(f) => f,
            None => return false,
        };
        let tfun = match u.nodes.node(fdx).tv {
            Some(tv) => tv,
            None => return false,
        };
        let tfun = u.tvs.find(tfun);
        if u.tvs.is_err(tfun) {
            return u.tvs.unify(&mut u.types, cepi_tv, tfun);
        }
        let arg_tvs: Vec<TvId> = (ARG_IDX..u.nodes.node(call).defs.len())
            .filter_map(|i| u.nodes.def(call, i))
            .filter_map(|a| u.nodes.node(a).tv)
            .collect();

        let mut progress = false;
        let is_lambda = matches!(u.tvs.kind(tfun), crate::tvar::TvKind::Lambda { .. });
        if !is_lambda {
            let nfun = u.tvs.new_lambda(TvVec::from_slice(&arg_tvs), cepi_tv);
            progress |= u.tvs.unify(&mut u.types, tfun, nfun);
        } else {
            let nargs = match u.tvs.kind(tfun) {
                crate::tvar::TvKind::Lambda { args, .. } => args.len(),
                _ => unreachable!(),
            };
            if nargs != arg_tvs.len() {
                let err = u.tvs.new_err("mismatched argument lengths");
                return u.tvs.unify(&mut u.types, cepi_tv, err);
            }
            for (i, &a) in arg_tvs.iter().enumerate() {
                let tfun2 = u.tvs.find(tfun);
                if let Some(formal) = u.tvs.arg(tfun2, i) {
                    progress |= u.tvs.unify(&mut u.types, a, formal);
                }
            }
            let tfun2 = u.tvs.find(tfun);
            if let Some(ret) = u.tvs.arg(tfun2, arg_tvs.len()) {
                progress |= u.tvs.unify(&mut u.types, cepi_tv, ret);
            }
        }
        progress
    }

    // The function side ties its Parms and Ret into one lambda variable.
    fn unify_fun(&mut self, u: &mut Universe, fun: NodeId) -> bool {
        let fun_tv = match u.nodes.node(fun).tv {
            Some(tv) => tv,
            None => return false,
        };
        let fun_tv = u.tvs.find(fun_tv);
        if matches!(u.tvs.kind(fun_tv), crate::tvar::TvKind::Lambda { .. }) {
            return false;
        }
        let nargs = match u.nodes.node(fun).op {
            Op::Fun { nargs, .. } => nargs as usize,
            _ => return false,
        };
        let mut parm_tvs: Vec<(u32, TvId)> = Vec::new();
        for p in u.nodes.fun_parms(fun) {
            if let Op::Parm { idx } = u.nodes.node(p).op {
                if idx as usize >= ARG_IDX {
                    if let Some(tv) = u.nodes.node(p).tv {
                        parm_tvs.push((idx, tv));
                    }
                }
            }
        }
        if parm_tvs.len() != nargs {
            return false; // parms not all built yet
        }
        parm_tvs.sort_by_key(|&(idx, _)| idx);
        let ret = match u.nodes.fun_ret(fun) {
            Some(r) => r,
            None => return false,
        };
        let rez = match u.nodes.def(ret, 2) {
            Some(r) => r,
            None => return false,
        };
        let ret_tv = match u.nodes.node(rez).tv {
            Some(tv) => tv,
            None => return false,
        };
        let args: TvVec = parm_tvs.iter().map(|&(_, tv)| tv).collect();
        let lam = u.tvs.new_lambda(args, ret_tv);
        u.tvs.unify(&mut u.types, fun_tv, lam)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}
