// src/tvar/fresh.rs
//
// Let-polymorphism: fresh instantiation against a non-generic set, the
// delayed-fresh list that replays instantiations when a generic leaf
// later grows structure, and delayed field resolution for structs with
// inferable labels.

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::NodeId;
use crate::types::TypeStore;

use super::{DelayFresh, TvId, TvKind, TvStore, TvVec};

type Dups = FxHashMap<(u32, u32), TvId>;
type Vars = FxHashMap<TvId, TvId>;

impl TvStore {
    /// Unify `that` with a lazily made fresh copy of `gen`. Variables of
    /// `gen` captured in `nongen` are not generalized: they hard-unify
    /// instead of cloning. Generic leaves record a delayed fresh so later
    /// structure re-triggers this call. Returns progress.
    pub fn fresh_unify(
        &mut self,
        types: &mut TypeStore,
        site: Option<NodeId>,
        gen: TvId,
        that: TvId,
        nongen: &Rc<Vec<TvId>>,
    ) -> bool {
        let gen = self.find(gen);
        let that = self.find(that);
        if gen == that {
            return false;
        }
        let root = DelayFresh { lhs: gen, rhs: that, nongen: nongen.clone(), site };
        let mut vars = Vars::default();
        let mut dups = Dups::default();
        self.fresh_inner(types, &root, gen, that, &mut vars, &mut dups)
    }

    fn fresh_inner(
        &mut self,
        types: &mut TypeStore,
        root: &DelayFresh,
        gen: TvId,
        that: TvId,
        vars: &mut Vars,
        dups: &mut Dups,
    ) -> bool {
        let gen = self.find(gen);
        let that = self.find(that);
        if gen == that {
            return false;
        }

        // Cycle: this generic position already has an instance; the
        // instance and `that` must agree
        if let Some(&prior) = vars.get(&gen) {
            let p = self.find(prior);
            return self.unify_inner(types, p, that, dups);
        }

        // Occurs-check: captured variables hard-unify instead of cloning
        if self.nongen_in(gen, &root.nongen) {
            vars.insert(gen, that);
            return self.unify_inner(types, gen, that, dups);
        }

        // A generic leaf imparts no structure yet; watch it so later
        // expansion replays this whole fresh-unify
        if self.is_leaf(gen) {
            self.add_delay_fresh_on(gen, root.clone());
            vars.insert(gen, that);
            return false;
        }

        // A monomorphic leaf takes a deep copy of the generic side
        if self.is_leaf(that) {
            let f = self.fresh_rec(Some(root), gen, vars);
            vars.insert(gen, f);
            return self.union(that, f);
        }

        // Nilable on either side: push the flag and continue underneath
        let gen_nil = matches!(self.kind(gen), TvKind::Nil { .. });
        let that_nil = matches!(self.kind(that), TvKind::Nil { .. });
        if gen_nil && !that_nil {
            let child = self.arg(gen, 0).expect("nil wraps one child");
            self.add_may_nil(that);
            return self.fresh_inner(types, root, child, that, vars, dups);
        }
        if that_nil && !gen_nil {
            let child = self.arg(that, 0).expect("nil wraps one child");
            return self.fresh_inner(types, root, gen, child, vars, dups);
        }

        if self.kind(gen).tag() != self.kind(that).tag() {
            return self.unify_err(types, "type mismatch", gen, that, dups);
        }

        let mut progress = false;
        if self.may_nil(gen) && !self.may_nil(that) {
            self.add_may_nil(that);
            progress = true;
        }
        // Early set, to stop cycles
        vars.insert(gen, that);

        progress | self.fresh_impl(types, root, gen, that, vars, dups)
    }

    // Field-by-field fresh walk; `gen` is never modified.
    fn fresh_impl(
        &mut self,
        types: &mut TypeStore,
        root: &DelayFresh,
        gen: TvId,
        that: TvId,
        vars: &mut Vars,
        dups: &mut Dups,
    ) -> bool {
        match (self.kind(gen).clone(), self.kind(that).clone()) {
            (TvKind::Base(tg), TvKind::Base(tt)) => {
                let m = types.meet(tg, tt);
                if m != tt {
                    self.set_kind(that, TvKind::Base(m));
                    self.wake(that);
                    return true;
                }
                false
            }
            (TvKind::Ptr { obj: og }, TvKind::Ptr { obj: ot }) => {
                self.fresh_inner(types, root, og, ot, vars, dups)
            }
            (TvKind::Nil { child: cg }, TvKind::Nil { child: ct }) => {
                self.fresh_inner(types, root, cg, ct, vars, dups)
            }
            (TvKind::Clz { clz: cg, rhs: rg }, TvKind::Clz { clz: ct, rhs: rt }) => {
                let mut p = self.fresh_inner(types, root, cg, ct, vars, dups);
                p |= self.fresh_inner(types, root, rg, rt, vars, dups);
                p
            }
            (TvKind::Lambda { args: ag, ret: rg }, TvKind::Lambda { args: at, ret: rt }) => {
                if ag.len() != at.len() {
                    return self.unify_err(types, "mismatched argument lengths", gen, that, dups);
                }
                let mut p = false;
                for (&x, &y) in ag.iter().zip(at.iter()) {
                    p |= self.fresh_inner(types, root, x, y, vars, dups);
                }
                p | self.fresh_inner(types, root, rg, rt, vars, dups)
            }
            (
                TvKind::Struct { labels: lg, args: ag, .. },
                TvKind::Struct { labels: lt, args: at, open: opt },
            ) => {
                let mut p = false;
                for (i, l) in lg.iter().enumerate() {
                    match lt.iter().position(|m| m == l) {
                        Some(j) => p |= self.fresh_inner(types, root, ag[i], at[j], vars, dups),
                        None if opt => {
                            // Instance grows the missing generic field
                            let f = self.fresh_rec(Some(root), ag[i], vars);
                            let that = self.find(that);
                            if let TvKind::Struct { mut labels, mut args, open } =
                                self.kind(that).clone()
                            {
                                labels.push(l.clone());
                                args.push(f);
                                self.set_kind(that, TvKind::Struct { labels, args, open });
                            }
                            self.wake(that);
                            p = true;
                        }
                        None => {}
                    }
                }
                p
            }
            (TvKind::Err { .. }, _) | (_, TvKind::Err { .. }) => false,
            _ => false,
        }
    }

    /// A fresh deep copy of `gen`, sharing the non-generic parts.
    pub fn fresh(&mut self, gen: TvId, nongen: &Rc<Vec<TvId>>) -> TvId {
        let gen = self.find(gen);
        let mut vars = Vars::default();
        let nongen = nongen.clone();
        self.fresh_copy(gen, &nongen, &mut vars)
    }

    // Copy without delay registration; used for standalone fresh().
    fn fresh_copy(&mut self, gen: TvId, nongen: &Rc<Vec<TvId>>, vars: &mut Vars) -> TvId {
        let gen = self.find(gen);
        if let Some(&r) = vars.get(&gen) {
            return self.find(r);
        }
        if self.nongen_in(gen, nongen) {
            vars.insert(gen, gen);
            return gen;
        }
        let copy = self.copy_shallow(gen);
        vars.insert(gen, copy);
        let n = self.nargs(copy);
        for i in 0..n {
            if let Some(child) = self.arg(gen, i) {
                let fc = self.fresh_copy(child, nongen, vars);
                self.replace_child(copy, i, fc);
            }
        }
        copy
    }

    fn fresh_rec(&mut self, root: Option<&DelayFresh>, gen: TvId, vars: &mut Vars) -> TvId {
        let gen = self.find(gen);
        if let Some(&r) = vars.get(&gen) {
            return self.find(r);
        }
        // Stopping at non-generic members preserves cyclic structure
        // instead of unrolling it
        if let Some(root) = root {
            if self.nongen_in(gen, &root.nongen) {
                vars.insert(gen, gen);
                return gen;
            }
        }
        let copy = self.copy_shallow(gen);
        if let Some(root) = root {
            self.add_delay_fresh_on(gen, root.clone());
        }
        vars.insert(gen, copy);
        let n = self.nargs(copy);
        for i in 0..n {
            if let Some(child) = self.arg(gen, i) {
                let fc = self.fresh_rec(root, child, vars);
                self.replace_child(copy, i, fc);
            }
        }
        copy
    }

    fn copy_shallow(&mut self, gen: TvId) -> TvId {
        let kind = self.kind(gen).clone();
        let copy = match kind {
            TvKind::Leaf => self.new_leaf(),
            other => self.push_kind(other),
        };
        if self.may_nil(gen) {
            self.add_may_nil(copy);
        }
        if self.use_nil(gen) {
            self.add_use_nil(copy);
        }
        let w = self.widen_of(gen);
        self.widen_bump(copy, w);
        copy
    }

    // -----------------------------------------------------------------
    // Occurs check

    fn nongen_in(&mut self, gen: TvId, nongen: &Rc<Vec<TvId>>) -> bool {
        for &ng in nongen.iter() {
            let ng = self.find(ng);
            let mut seen = FxHashSet::default();
            if self.occurs_in(gen, ng, &mut seen) {
                return true;
            }
        }
        false
    }

    fn occurs_in(&mut self, needle: TvId, hay: TvId, seen: &mut FxHashSet<TvId>) -> bool {
        let hay = self.find(hay);
        if hay == needle {
            return true;
        }
        if !seen.insert(hay) {
            return false;
        }
        let n = self.nargs(hay);
        for i in 0..n {
            if let Some(c) = self.arg(hay, i) {
                if self.occurs_in(needle, c, seen) {
                    return true;
                }
            }
        }
        false
    }

    // -----------------------------------------------------------------
    // Delayed queues, drained by the driver between rounds

    /// Replay every delayed fresh-unification once. Progress means the
    /// driver owes another round.
    pub fn do_delay_fresh(&mut self, types: &mut TypeStore) -> bool {
        let mut progress = false;
        while let Some(df) = self.delay_fresh.pop() {
            let lhs = self.find(df.lhs);
            let rhs = self.find(df.rhs);
            if self.fresh_unify(types, df.site, lhs, rhs, &df.nongen) {
                progress = true;
                if let Some(site) = df.site {
                    self.pending_deps.push(site);
                }
            }
        }
        progress
    }

    /// Re-check every struct with unresolved field labels.
    pub fn do_delay_resolve(&mut self, types: &mut TypeStore) -> bool {
        let mut progress = false;
        while let Some(s) = self.delay_resolve.pop() {
            let s = self.find(s);
            progress |= self.trial_resolve_all(types, s);
        }
        progress
    }

    /// Resolve inferred field labels (spelled `_name`) against the
    /// labeled fields of the same struct: a placeholder whose variable
    /// trial-unifies with exactly one labeled field takes that label.
    pub fn trial_resolve_all(&mut self, types: &mut TypeStore, strct: TvId) -> bool {
        let strct = self.find(strct);
        let (labels, args, open) = match self.kind(strct) {
            TvKind::Struct { labels, args, open } => (labels.clone(), args.clone(), *open),
            _ => return false,
        };
        let mut progress = false;
        for (i, l) in labels.iter().enumerate() {
            if !l.starts_with('_') {
                continue;
            }
            let mut hits: Vec<usize> = Vec::new();
            for (j, m) in labels.iter().enumerate() {
                if i == j || m.starts_with('_') {
                    continue;
                }
                if self.trial_unify_ok(args[i], args[j]) {
                    hits.push(j);
                }
            }
            match hits.len() {
                1 => {
                    let j = hits[0];
                    self.unify(types, args[i], args[j]);
                    let mut labels = labels.clone();
                    let mut nargs: TvVec = args.clone();
                    labels.remove(i);
                    nargs.remove(i);
                    let strct = self.find(strct);
                    self.set_kind(strct, TvKind::Struct { labels, args: nargs, open });
                    self.wake(strct);
                    progress = true;
                    break; // indices shifted; the queue re-adds us
                }
                0 if !open => {
                    let strct = self.find(strct);
                    self.unify_err_solo(types, "no such field", strct);
                    progress = true;
                    break;
                }
                _ => {
                    // Still ambiguous: stay delayed
                    let strct = self.find(strct);
                    let me = strct;
                    self.add_delay_resolve_on(args[i], me);
                }
            }
        }
        progress
    }

    fn unify_err_solo(&mut self, types: &mut TypeStore, msg: &str, v: TvId) {
        let err = self.new_err(msg);
        self.unify(types, v, err);
    }

    fn wake(&mut self, id: TvId) {
        let id = self.find(id);
        let deps = self.entries[id.index() as usize].deps.clone();
        self.pending_deps.extend(deps);
        let dfs = self.entries[id.index() as usize].delay_fresh.clone();
        for df in dfs {
            if !self.delay_fresh.iter().any(|d| d.same(&df)) {
                self.delay_fresh.push(df);
            }
        }
        let drs = self.entries[id.index() as usize].delay_resolve.clone();
        for dr in drs {
            if !self.delay_resolve.contains(&dr) {
                self.delay_resolve.push(dr);
            }
        }
    }

    fn widen_bump(&mut self, id: TvId, level: u8) {
        let id = self.find(id);
        if self.entries[id.index() as usize].widen < level {
            self.entries[id.index() as usize].widen = level;
        }
    }

    fn push_kind(&mut self, kind: TvKind) -> TvId {
        // A structural copy starts as its own leader
        let id = self.new_leaf();
        self.set_kind(id, kind);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeStore;

    fn stores() -> (TvStore, TypeStore) {
        (TvStore::new(), TypeStore::new())
    }

    fn id_lambda(tvs: &mut TvStore) -> (TvId, TvId) {
        let x = tvs.new_leaf();
        let lam = tvs.new_lambda(TvVec::from_slice(&[x]), x);
        (lam, x)
    }

    #[test]
    fn test_fresh_copies_structure() {
        let (mut tvs, _ts) = stores();
        let (lam, x) = id_lambda(&mut tvs);
        let nongen = Rc::new(Vec::new());
        let f = tvs.fresh(lam, &nongen);
        assert_ne!(tvs.find(f), tvs.find(lam));
        // Shared arg/ret leaf stays shared inside the copy
        let fa = tvs.arg(f, 0).unwrap();
        let fr = tvs.arg(f, 1).unwrap();
        assert_eq!(fa, fr);
        assert_ne!(fa, tvs.find(x));
    }

    #[test]
    fn test_fresh_shares_nongen() {
        let (mut tvs, _ts) = stores();
        let (lam, x) = id_lambda(&mut tvs);
        let nongen = Rc::new(vec![x]);
        let f = tvs.fresh(lam, &nongen);
        // The captured leaf is shared, not cloned
        let fa = tvs.arg(f, 0).unwrap();
        assert_eq!(fa, tvs.find(x));
    }

    #[test]
    fn test_fresh_unify_polymorphic_identity() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        let (lam, x) = id_lambda(&mut tvs);
        let nongen = Rc::new(Vec::new());

        // Use the identity at int
        let int_arg = tvs.new_base(t.int64);
        let r1 = tvs.new_leaf();
        let site1 = tvs.new_lambda(TvVec::from_slice(&[int_arg]), r1);
        assert!(tvs.fresh_unify(&mut ts, None, lam, site1, &nongen));
        let r1k = tvs.find(r1);
        assert!(matches!(tvs.kind(r1k), TvKind::Base(_)));
        assert_eq!(tvs.find(r1), tvs.find(int_arg));

        // Use it again at a pointer; the generic side is untouched
        let obj = tvs.new_leaf();
        let ptr_arg = tvs.new_ptr(obj);
        let r2 = tvs.new_leaf();
        let site2 = tvs.new_lambda(TvVec::from_slice(&[ptr_arg]), r2);
        assert!(tvs.fresh_unify(&mut ts, None, lam, site2, &nongen));
        assert_eq!(tvs.find(r2), tvs.find(ptr_arg));

        // The generic identity is still Leaf -> Leaf
        let g = tvs.find(lam);
        assert!(matches!(tvs.kind(g), TvKind::Lambda { .. }));
        let ga = tvs.arg(g, 0).unwrap();
        assert!(tvs.is_leaf(ga));
        // And the two instantiations stayed independent
        assert_ne!(tvs.find(r1), tvs.find(r2));
    }

    #[test]
    fn test_fresh_unify_soundness() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        // gen: { A -> A }; mono: { int64 -> B }
        let (lam, _x) = id_lambda(&mut tvs);
        let nongen = Rc::new(Vec::new());
        let arg = tvs.new_base(t.int64);
        let ret = tvs.new_leaf();
        let mono = tvs.new_lambda(TvVec::from_slice(&[arg]), ret);
        tvs.fresh_unify(&mut ts, None, lam, mono, &nongen);
        // Walking the fresh instance and mono in parallel finds identical
        // structure: both are { int64 -> int64 } now
        let m = tvs.find(mono);
        let ma = tvs.arg(m, 0).unwrap();
        let mr = tvs.arg(m, 1).unwrap();
        assert_eq!(ma, mr);
        assert!(matches!(tvs.kind(ma), TvKind::Base(_)));
    }

    #[test]
    fn test_delay_fresh_replays() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        let nongen = Rc::new(Vec::new());
        // gen is a bare leaf: fresh-unify imparts nothing yet
        let gen = tvs.new_leaf();
        let site = tvs.new_leaf();
        assert!(!tvs.fresh_unify(&mut ts, None, gen, site, &nongen));
        let site_root = tvs.find(site);
        assert!(tvs.is_leaf(site_root));
        // Later the generic leaf gains structure
        let base = tvs.new_base(t.int64);
        tvs.unify(&mut ts, gen, base);
        // The union migrated the watch onto the global queue
        assert!(!tvs.delay_fresh.is_empty());
        tvs.do_delay_fresh(&mut ts);
        // The delayed replay pushed the structure through to the site
        let s = tvs.find(site);
        assert!(matches!(tvs.kind(s), TvKind::Base(_)));
    }

    #[test]
    fn test_field_label_resolution() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        let xi = tvs.new_base(t.int64);
        let yl = tvs.new_leaf();
        let ys = tvs.new_ptr(yl);
        let unk = tvs.new_base(t.int8);
        let s = tvs.new_struct(vec![("x", xi), ("y", ys), ("_0", unk)], false);
        assert!(tvs.trial_resolve_all(&mut ts, s));
        let s_root = tvs.find(s);
        match tvs.kind(s_root) {
            TvKind::Struct { labels, .. } => {
                assert_eq!(labels.len(), 2);
                assert!(!labels.iter().any(|l| l.starts_with('_')));
            }
            _ => panic!("expected a struct"),
        }
        // The placeholder unified with the int field
        assert_eq!(tvs.find(unk), tvs.find(xi));
    }
}
