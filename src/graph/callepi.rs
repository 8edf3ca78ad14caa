// src/graph/callepi.rs
//
// Call-graph discovery and collapse. A CallEpi is the merge point of all
// returns reaching its call. Call-graph edges start implicit in the
// call's fidx set; they are wired incrementally as the set sharpens and
// unwired again when sharpening excludes a callee. Trivial callees
// inline by rewriting the CallEpi into a copy of (ctrl, mem, rez).

use tracing::debug;

use crate::bits::{BitsAlias, BitsFun, ALL_BIT, NIL_BIT};
use crate::opt::Work;
use crate::types::{TypeId, TypeIdVec, TypeKind, TypeStore};

use super::{Ideal, NodeId, Nodes, Op, ARG_IDX, FPTR_IDX, MEM_IDX, REZ_IDX};

impl Nodes {
    pub fn callepi_call(&self, n: NodeId) -> Option<NodeId> {
        self.def(n, 0)
    }

    pub fn nwired(&self, n: NodeId) -> usize {
        self.node(n).defs.len().saturating_sub(2)
    }

    pub fn wired(&self, n: NodeId, k: usize) -> Option<NodeId> {
        self.def(n, k + 2)
    }

    /// The fidx of a Ret's function, if the function is still around.
    pub fn ret_fidx(&self, ret: NodeId) -> Option<u32> {
        let fun = self.def(ret, 3)?;
        match self.node(fun).op {
            Op::Fun { fidx, .. } => Some(fidx),
            _ => None,
        }
    }

    fn call_fidxs(&self, types: &TypeStore, call: NodeId) -> Option<BitsFun> {
        match types.kind(self.node(call).val) {
            TypeKind::Tuple { ts } if ts.len() > FPTR_IDX => match types.kind(ts[FPTR_IDX]) {
                TypeKind::FunPtr { fidxs, .. } => Some(fidxs.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    // -----------------------------------------------------------------
    // Value

    /// Merge call-graph edges. If the call could still reach an unwired,
    /// recently split target, the value freezes in place rather than
    /// sliding backward; otherwise it is the meet of all wired returns
    /// still named by the fidx set, with memory split around the call by
    /// the escaping alias set.
    pub fn callepi_value(&self, types: &mut TypeStore, n: NodeId, post_cg: bool) -> TypeId {
        let t = types.t();
        if matches!(self.node(n).op, Op::CallEpi { is_copy: true }) {
            return self.node(n).val;
        }
        let call = match self.callepi_call(n) {
            Some(c) => c,
            None => return self.node(n).val,
        };
        let tcall = self.node(call).val;
        let ts = match types.kind(tcall) {
            TypeKind::Tuple { ts } if ts.len() >= ARG_IDX => ts.clone(),
            _ => return types.oob(tcall, t.ret_bot),
        };
        let ctrl = ts[0];
        if ctrl != t.ctrl && ctrl != t.all {
            return types.dual(t.ret_bot);
        }
        let (fidxs, _nargs) = match types.kind(ts[FPTR_IDX]) {
            TypeKind::FunPtr { fidxs, nargs, .. } => (fidxs.clone(), *nargs),
            _ => return types.oob(ts[FPTR_IDX], t.ret_bot),
        };
        // Calling nothing, or still choosing: best case
        if fidxs.is_empty() || fidxs.above_center() {
            return t.ret_top;
        }
        let defmem = self.def(n, 1).map(|d| {
            let v = self.node(d).val;
            if matches!(types.kind(v), TypeKind::Mem { .. }) {
                v
            } else {
                types.oob(v, t.allmem)
            }
        });

        let mut full = fidxs.test(ALL_BIT);
        if !full {
            'outer: for fidx in fidxs.iter() {
                if fidx == NIL_BIT {
                    continue;
                }
                let mut kids = 0;
                for k in 0..self.nwired(n) {
                    let ret = match self.wired(n, k) {
                        Some(r) => r,
                        None => continue,
                    };
                    let rfidx = match self.ret_fidx(ret) {
                        Some(f) => f,
                        None => continue,
                    };
                    if fidx == rfidx {
                        continue 'outer; // directly wired is always ok
                    }
                    if types.fidx_tree.parent(rfidx) == Some(fidx) {
                        kids += 1;
                    }
                }
                if types.fidx_tree.is_parent(fidx) {
                    // A split parent needs both halves wired before the
                    // meet can be trusted; until then, freeze in place.
                    if kids >= 2 {
                        continue 'outer;
                    }
                    return self.node(n).val;
                }
                if !post_cg {
                    // Unwired unknown target before the call graph closes
                    full = true;
                    break;
                }
            }
        }

        let mut trez = t.any;
        let mut tmem = t.anymem;
        if full {
            trez = t.all;
            tmem = defmem.unwrap_or(t.allmem);
        } else {
            for k in 0..self.nwired(n) {
                let ret = match self.wired(n, k) {
                    Some(r) => r,
                    None => continue,
                };
                let rfidx = match self.ret_fidx(ret) {
                    Some(f) => f,
                    None => continue,
                };
                if !fidxs.test_recur(&types.fidx_tree, rfidx) {
                    continue; // wired, but no longer called
                }
                let rv = self.node(ret).val;
                let rvts = match types.kind(rv) {
                    TypeKind::Tuple { ts } if ts.len() == 3 => ts.clone(),
                    _ => {
                        let ob = types.oob(rv, t.ret_bot);
                        match types.kind(ob) {
                            TypeKind::Tuple { ts } => ts.clone(),
                            _ => continue,
                        }
                    }
                };
                tmem = types.meet(tmem, rvts[MEM_IDX]);
                trez = types.meet(trez, rvts[REZ_IDX]);
            }
        }

        let caller_mem = {
            let m = ts[MEM_IDX];
            if matches!(types.kind(m), TypeKind::Mem { .. }) {
                m
            } else {
                types.oob(m, t.allmem)
            }
        };

        // Skip the memory build entirely when nothing downstream wants it
        let wants_mem = self.node(n).keep > 0
            || self
                .node(n)
                .uses
                .iter()
                .any(|&u| matches!(self.node(u).op, Op::MProj | Op::Proj(1)));
        let tmem3 = if !wants_mem {
            t.anymem
        } else {
            let esc_in = self.call_escapees(types, call, caller_mem);
            live_out(types, caller_mem, tmem, trez, &esc_in, if post_cg { None } else { defmem })
        };

        types.tuple_make(TypeIdVec::from_slice(&[t.ctrl, tmem3, trez]))
    }

    // Aliases escaping into the call through any argument.
    fn call_escapees(&self, types: &mut TypeStore, call: NodeId, caller_mem: TypeId) -> BitsAlias {
        let mut esc = BitsAlias::empty();
        let t = types.t();
        for i in ARG_IDX..self.node(call).defs.len() {
            let av = self.val(call, i, t.any);
            let from = match types.kind(av).clone() {
                TypeKind::MemPtr { aliases, .. } => aliases,
                TypeKind::FunPtr { dsp, .. } => match types.kind(dsp) {
                    TypeKind::MemPtr { aliases, .. } => aliases.clone(),
                    _ => continue,
                },
                TypeKind::Simple(crate::types::Simple::Scalar)
                | TypeKind::Simple(crate::types::Simple::All) => BitsAlias::nzero(),
                _ => continue,
            };
            let reach = types.all_reaching_aliases(caller_mem, &from);
            esc = esc.meet(&reach, &types.alias_tree);
        }
        esc
    }

    // -----------------------------------------------------------------
    // Liveness

    /// A wired return is alive only while the call still names its fidx;
    /// the default-memory input dies once the call graph is final.
    pub fn callepi_live_use(
        &self,
        types: &mut TypeStore,
        n: NodeId,
        def: NodeId,
        post_cg: bool,
    ) -> TypeId {
        let t = types.t();
        let live = self.node(n).live;
        if matches!(self.node(n).op, Op::CallEpi { is_copy: true }) {
            return self.node(def).live;
        }
        if self.def(n, 0) == Some(def) {
            return live;
        }
        if self.def(n, 1) == Some(def) {
            return if post_cg { t.any } else { live };
        }
        // A wired Ret
        let call = match self.callepi_call(n) {
            Some(c) => c,
            None => return live,
        };
        let fidxs = match self.call_fidxs(types, call) {
            Some(f) => f,
            None => {
                let tcall = self.node(call).val;
                return if types.above_center(tcall) { t.any } else { live };
            }
        };
        let rfidx = match self.ret_fidx(def) {
            Some(f) => f,
            None => return t.any,
        };
        if fidxs.above_center() || !fidxs.test_recur(&types.fidx_tree, rfidx) {
            return t.any; // call does not call this
        }
        live
    }

    // -----------------------------------------------------------------
    // Wiring

    // Basic argument sanity for a candidate callee.
    fn good_call(&self, types: &TypeStore, call: NodeId, fun: NodeId) -> bool {
        let t = types.t();
        let tcall = self.node(call).val;
        let ts = match types.kind(tcall) {
            TypeKind::Tuple { ts } => ts,
            _ => return false,
        };
        if ts.is_empty() || (ts[0] != t.ctrl && ts[0] != t.all) {
            return false;
        }
        let nargs = match self.node(fun).op {
            Op::Fun { nargs, .. } => nargs as usize,
            _ => return false,
        };
        self.node(call).defs.len() - ARG_IDX == nargs
    }

    /// Inspect the call's resolved fidxs and wire any call-graph edge that
    /// is ready: not a split parent, not a forward ref, not already wired,
    /// and passing the basic argument check. Returns true on progress.
    pub fn check_and_wire(&mut self, types: &mut TypeStore, work: &mut Work, n: NodeId) -> bool {
        let call = match self.callepi_call(n) {
            Some(c) => c,
            None => return false,
        };
        let fidxs = match self.call_fidxs(types, call) {
            Some(f) => f,
            None => return false,
        };
        if fidxs == BitsFun::full() || fidxs.above_center() {
            return false;
        }
        let mut progress = false;
        for fidx in fidxs.iter() {
            if fidx == NIL_BIT || fidx == ALL_BIT {
                continue;
            }
            if types.fidx_tree.is_parent(fidx) {
                continue; // parents settle out through their children
            }
            let fun = match self.find_fidx(fidx) {
                Some(f) => f,
                None => continue,
            };
            let ret = match self.fun_ret(fun) {
                Some(r) => r,
                None => continue, // mid-death
            };
            if self.node(n).defs.iter().any(|&d| d == Some(ret)) {
                continue; // wired already
            }
            if !self.good_call(types, call, fun) {
                continue;
            }
            self.wire(types, work, call, fun, ret, n);
            progress = true;
        }
        progress
    }

    /// Wire Call->Fun and Ret->CallEpi, adding one def to the Fun and one
    /// actual to every Parm so the caller columns stay index-parallel.
    pub fn wire(
        &mut self,
        types: &mut TypeStore,
        work: &mut Work,
        call: NodeId,
        fun: NodeId,
        ret: NodeId,
        cepi: NodeId,
    ) {
        debug!(call = call.0, fun = fun.0, "wire");
        let t = types.t();
        for parm in self.fun_parms(fun) {
            let idx = match self.node(parm).op {
                Op::Parm { idx } => idx as usize,
                _ => unreachable!(),
            };
            let actual = if idx == MEM_IDX {
                self.create(Op::MProj, vec![Some(call)], t.any)
            } else if idx < self.node(call).defs.len() {
                self.create(Op::Proj(idx as u32), vec![Some(call)], t.any)
            } else {
                // Missing argument: wire anyway, the error surfaces later
                self.create(Op::Con(t.all), vec![], t.any)
            };
            self.add_def(parm, Some(actual));
            work.add(actual);
            work.add(parm);
        }
        let cep = self.create(Op::CEProj, vec![Some(call)], t.any);
        self.add_def(fun, Some(cep));
        work.add(cep);
        work.add(fun);
        let uses: Vec<NodeId> = self.node(fun).uses.to_vec();
        for u in uses {
            work.add(u);
        }
        self.add_def(cepi, Some(ret));
        work.add(cepi);
        work.add(call);
        work.add(ret);
    }

    /// Remove a call-graph edge in both directions. The def/use edges
    /// return exactly to their pre-wire shape.
    pub fn unwire(&mut self, _types: &mut TypeStore, work: &mut Work, cepi: NodeId, ret: NodeId) {
        let call = self.callepi_call(cepi);
        if let Some(fun) = self.def(ret, 3) {
            if !self.node(fun).dead {
                let mut slot = None;
                for i in 1..self.node(fun).defs.len() {
                    if let Some(cep) = self.def(fun, i) {
                        if matches!(self.node(cep).op, Op::CEProj) && self.def(cep, 0) == call {
                            slot = Some((i, cep));
                            break;
                        }
                    }
                }
                if let Some((i, cep)) = slot {
                    debug!(fun = fun.0, "unwire");
                    for parm in self.fun_parms(fun) {
                        if i < self.node(parm).defs.len() {
                            let actual = self.def(parm, i);
                            self.remove_def(parm, i);
                            if let Some(a) = actual {
                                self.reap(a);
                            }
                            work.add(parm);
                        }
                    }
                    self.remove_def(fun, i);
                    self.reap(cep);
                    work.add(fun);
                    let uses: Vec<NodeId> = self.node(fun).uses.to_vec();
                    for u in uses {
                        work.add(u);
                    }
                }
            }
        }
        if let Some(pos) = self.node(cepi).defs.iter().position(|&d| d == Some(ret)) {
            self.remove_def(cepi, pos);
        }
        work.add(cepi);
        work.add(ret);
    }

    // Kill a rewrite-temporary that lost its last use.
    fn reap(&mut self, n: NodeId) {
        if !self.node(n).dead && self.node(n).uses.is_empty() && self.node(n).keep == 0 {
            self.kill(n);
        }
    }

    // Kill a detached subgraph root and whatever it strands; keeps an
    // inlined-away callee from recomputing upward while it waits for the
    // final sweep.
    fn reap_deep(&mut self, n: NodeId) {
        if self.node(n).dead || !self.node(n).uses.is_empty() || self.node(n).keep != 0 {
            return;
        }
        let defs: Vec<NodeId> = self.node(n).defs.iter().copied().flatten().collect();
        self.kill(n);
        for d in defs {
            self.reap_deep(d);
        }
    }

    // -----------------------------------------------------------------
    // Inlining

    /// CallEpi local rewrite: drop stale edges, wire fresh ones, and
    /// inline a single wired trivial callee (identity body, constant
    /// body, or a one-op body over parameters and constants).
    pub fn callepi_ideal(
        &mut self,
        types: &mut TypeStore,
        work: &mut Work,
        n: NodeId,
        _post_cg: bool,
    ) -> Ideal {
        let t = types.t();
        let call = match self.callepi_call(n) {
            Some(c) => c,
            None => return Ideal::None,
        };
        let tcall = self.node(call).val;
        match types.kind(tcall) {
            TypeKind::Tuple { ts } if !ts.is_empty() && ts[0] == t.ctrl => {}
            _ => return Ideal::None, // call not executable
        }
        let fidxs = match self.call_fidxs(types, call) {
            Some(f) => f,
            None => return Ideal::None,
        };

        // Sharpened fidxs exclude a wired callee: remove the edge
        if !fidxs.test(ALL_BIT) {
            for k in 0..self.nwired(n) {
                let ret = match self.wired(n, k) {
                    Some(r) => r,
                    None => continue,
                };
                let stale = match self.ret_fidx(ret) {
                    Some(rf) => !fidxs.test_recur(&types.fidx_tree, rf),
                    None => true,
                };
                if stale {
                    self.unwire(types, work, n, ret);
                    return Ideal::Progress;
                }
            }
        }

        if self.check_and_wire(types, work, n) {
            return Ideal::Progress;
        }

        // Trivial inline wants exactly one wired, exactly one named fidx
        if self.nwired(n) != 1 {
            return Ideal::None;
        }
        let fidx = match fidxs.abit() {
            Some(f) => f,
            None => return Ideal::None,
        };
        if fidxs.above_center() || types.fidx_tree.is_parent(fidx) {
            return Ideal::None;
        }
        let ret = match self.wired(n, 0) {
            Some(r) => r,
            None => return Ideal::None,
        };
        let fun = match self.def(ret, 3) {
            Some(f) => f,
            None => return Ideal::None,
        };
        if self.node(fun).val != t.ctrl {
            return Ideal::None;
        }
        if self.call_err(types, call, fun) {
            return Ideal::None; // args need a real conversion
        }

        let cctl = self.def(call, 0);
        let cmem = self.def(call, MEM_IDX);
        let rctl = self.def(ret, 0);
        let rmem = self.def(ret, 1);
        let rrez = match self.def(ret, 2) {
            Some(r) => r,
            None => return Ideal::None,
        };

        // A function that does nothing with memory uses the call memory
        let parm_on_fun = |s: &Self, x: NodeId| {
            matches!(s.node(x).op, Op::Parm { .. }) && s.def(x, 0) == Some(fun)
        };
        let rmem_eff = match rmem {
            Some(m)
                if parm_on_fun(self, m) && matches!(self.node(m).op, Op::Parm { idx: 1 }) =>
            {
                cmem
            }
            Some(m) if types.above_center(self.node(m).val) => cmem,
            other => other,
        };

        // Post-call memory must be compatible with what the body returns
        if let TypeKind::Tuple { ts } = types.kind(self.node(n).val) {
            if ts.len() == 3 {
                let selfmem = ts[MEM_IDX];
                if let Some(m) = rmem_eff {
                    let mval = self.node(m).val;
                    if !types.isa(mval, selfmem) {
                        return Ideal::None;
                    }
                }
            }
        }

        // Identity body: the return is a Parm of this fun
        if let Op::Parm { idx } = self.node(rrez).op {
            if self.def(rrez, 0) == Some(fun) && cmem == rmem_eff {
                if let Some(arg) = self.def(call, idx as usize) {
                    debug!(cepi = n.0, "inline identity");
                    self.unwire(types, work, n, ret);
                    self.set_is_copy(work, n, cctl, cmem, Some(arg));
                    self.reap_deep(ret);
                    return Ideal::Progress;
                }
            }
            return Ideal::None;
        }

        // Constant body
        let trez = self.node(rrez).val;
        if types.is_con(trez) && rctl == Some(fun) && cmem == rmem_eff {
            debug!(cepi = n.0, "inline constant");
            let con = self.create(Op::Con(trez), vec![], trez);
            self.node_mut(con).val = trez;
            self.unwire(types, work, n, ret);
            self.set_is_copy(work, n, cctl, cmem, Some(con));
            self.reap_deep(ret);
            work.add(con);
            return Ideal::Progress;
        }

        // One-op body over params and constants, no memory effects
        if cmem == rmem_eff {
            let defs: Vec<Option<NodeId>> = self.node(rrez).defs.to_vec();
            let trivial = defs.iter().all(|d| match d {
                None => true,
                Some(x) => {
                    *x == fun || parm_on_fun(self, *x) || matches!(self.node(*x).op, Op::Con(_))
                }
            });
            if trivial && !defs.is_empty() {
                debug!(cepi = n.0, "inline one-op");
                let mapped: Vec<Option<NodeId>> = defs
                    .iter()
                    .map(|d| match d {
                        Some(x) if parm_on_fun(self, *x) => match self.node(*x).op {
                            Op::Parm { idx } => self.def(call, idx as usize),
                            _ => unreachable!(),
                        },
                        Some(x) if *x == fun => cctl,
                        other => *other,
                    })
                    .collect();
                let op = self.node(rrez).op.clone();
                let irez = self.create(op, mapped, t.any);
                self.unwire(types, work, n, ret);
                self.set_is_copy(work, n, cctl, cmem, Some(irez));
                self.reap_deep(ret);
                work.add(irez);
                return Ideal::Progress;
            }
        }

        Ideal::None
    }

    // ArgConversion check: a call whose actuals need a non-free bit-shape
    // conversion to the formals is left alone.
    fn call_err(&self, types: &TypeStore, call: NodeId, fun: NodeId) -> bool {
        let formals = match self.fun_formals(fun) {
            Some(f) => f,
            None => return false,
        };
        let t = types.t();
        for (k, &formal) in formals.iter().enumerate() {
            let i = ARG_IDX + k;
            if i >= self.node(call).defs.len() {
                return true;
            }
            let actual = self.val(call, i, t.any);
            if types.bit_shape(actual, formal) == 99 {
                return true;
            }
        }
        false
    }

    // Collapse the CallEpi into a copy of (ctrl, mem, rez). Projections
    // fold through is_copy afterwards.
    fn set_is_copy(
        &mut self,
        work: &mut Work,
        n: NodeId,
        ctl: Option<NodeId>,
        mem: Option<NodeId>,
        rez: Option<NodeId>,
    ) {
        self.pop_defs(n);
        self.node_mut(n).op = Op::CallEpi { is_copy: true };
        self.add_def(n, ctl);
        self.add_def(n, mem);
        self.add_def(n, rez);
        work.add(n);
        let uses: Vec<NodeId> = self.node(n).uses.to_vec();
        for u in uses {
            work.add(u);
        }
    }

    /// Split a function's fidx in the tree: the old id becomes the parent
    /// of a fresh child, and every interned set naming the parent now
    /// conservatively covers both halves. The caller hands the child id
    /// to the clone it builds.
    pub fn split_fidx(&mut self, types: &mut TypeStore, fun: NodeId) -> u32 {
        let fidx = match self.node(fun).op {
            Op::Fun { fidx, .. } => fidx,
            _ => panic!("split_fidx of a non-Fun"),
        };
        let kid = types.fidx_tree.split(fidx);
        debug!(parent = fidx, kid, "fidx split");
        kid
    }
}

// Post-call memory: escaping aliases meet the callee's returned memory,
// non-escaping aliases keep the caller's pre-call state. Before the call
// graph is final the result joins with the global default memory to keep
// parser-level strength.
fn live_out(
    types: &mut TypeStore,
    caller_mem: TypeId,
    post_call: TypeId,
    trez: TypeId,
    esc_in: &BitsAlias,
    defmem: Option<TypeId>,
) -> TypeId {
    if caller_mem == post_call {
        return caller_mem;
    }
    let esc_out = esc_out(types, post_call, trez);
    let full = BitsAlias::full();
    let nzero = BitsAlias::nzero();
    if *esc_in == full || *esc_in == nzero || esc_out == full || esc_out == nzero {
        let mt = types.meet(caller_mem, post_call);
        return match defmem {
            None => mt,
            Some(d) => types.join(mt, d),
        };
    }
    if esc_in.is_empty() && esc_out.is_empty() {
        return match defmem {
            None => caller_mem,
            Some(d) => types.join(caller_mem, d),
        };
    }
    let mut len = types.mem_len(caller_mem).max(types.mem_len(post_call));
    len = len.max(esc_out.iter().max().map_or(0, |m| m as usize + 1));
    if let Some(d) = defmem {
        len = len.max(types.mem_len(d));
    }
    let tree = types.alias_tree.clone();
    let mut objs: Vec<Option<TypeId>> = vec![None; len];
    for (i, slot) in objs.iter_mut().enumerate().skip(1) {
        let a = i as u32;
        let ein = esc_in.test_recur(&tree, a);
        let eout = esc_out.test_recur(&tree, a);
        let pre = types.mem_at(caller_mem, a);
        let mut obj = if ein || eout {
            let post = types.mem_at(post_call, a);
            types.meet(pre, post)
        } else {
            pre
        };
        if let Some(d) = defmem {
            let dat = types.mem_at(d, a);
            obj = types.join(obj, dat);
        }
        *slot = Some(obj);
    }
    types.mem_make(false, objs)
}

// Aliases escaping out of the call through its result.
fn esc_out(types: &mut TypeStore, post_mem: TypeId, trez: TypeId) -> BitsAlias {
    let t = types.t();
    if trez == t.nil || trez == t.xnil {
        return BitsAlias::empty();
    }
    let trez = match types.kind(trez) {
        TypeKind::FunPtr { dsp, .. } => *dsp,
        _ => trez,
    };
    match types.kind(trez).clone() {
        TypeKind::MemPtr { aliases, .. } => types.all_reaching_aliases(post_mem, &aliases),
        TypeKind::Simple(crate::types::Simple::Scalar)
        | TypeKind::Simple(crate::types::Simple::All) => BitsAlias::nzero(),
        _ => BitsAlias::empty(),
    }
}
