// src/tvar/unify.rs
//
// Structural unification. Never throws and never returns Result: a bad
// unification embeds an Err variant and reports progress, and the memo
// table turns cyclic re-entry into "no change".

use rustc_hash::FxHashMap;

use crate::types::TypeStore;

use super::{TvId, TvKind, TvStore, TvVec};

type Dups = FxHashMap<(u32, u32), TvId>;

impl TvStore {
    /// Unify two variables; true if anything changed.
    pub fn unify(&mut self, types: &mut TypeStore, a: TvId, b: TvId) -> bool {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return false;
        }
        let mut dups = Dups::default();
        self.unify_inner(types, a, b, &mut dups)
    }

    pub(super) fn unify_inner(
        &mut self,
        types: &mut TypeStore,
        a: TvId,
        b: TvId,
        dups: &mut Dups,
    ) -> bool {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return false;
        }

        // A leaf absorbs anything
        if self.is_leaf(a) && !self.is_leaf(b) {
            return self.union(a, b);
        }
        if !self.is_leaf(a) && self.is_leaf(b) {
            return self.union(b, a);
        }
        if self.is_leaf(a) && self.is_leaf(b) {
            // Keep the lower id as leader, matching find() shortcuts
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            return self.union(hi, lo);
        }

        // Nil against non-nil strips or propagates the nil flag
        let a_nil = matches!(self.kind(a), TvKind::Nil { .. });
        let b_nil = matches!(self.kind(b), TvKind::Nil { .. });
        if a_nil != b_nil {
            let (nil, other) = if a_nil { (a, b) } else { (b, a) };
            return self.unify_nil(types, nil, other, dups);
        }

        // Distinct shapes make an error that swallows both
        if self.kind(a).tag() != self.kind(b).tag() {
            return self.unify_err(types, "type mismatch", a, b, dups);
        }

        // Close cycles
        let key = (a.index(), b.index());
        if dups.get(&key) == Some(&b) {
            return false;
        }
        dups.insert(key, b);

        self.unify_impl(types, a, b, dups)
    }

    // Subclass-specific structural merge, then the union.
    fn unify_impl(&mut self, types: &mut TypeStore, a: TvId, b: TvId, dups: &mut Dups) -> bool {
        match (self.kind(a).clone(), self.kind(b).clone()) {
            (TvKind::Base(ta), TvKind::Base(tb)) => {
                let m = types.meet(ta, tb);
                self.set_kind(b, TvKind::Base(m));
                self.union_ordered(a, b);
                true
            }
            (TvKind::Ptr { obj: oa }, TvKind::Ptr { obj: ob }) => {
                self.unify_inner(types, oa, ob, dups);
                self.union_ordered(a, b);
                true
            }
            (TvKind::Nil { child: ca }, TvKind::Nil { child: cb }) => {
                self.unify_inner(types, ca, cb, dups);
                self.union_ordered(a, b);
                true
            }
            (TvKind::Clz { clz: ca, rhs: ra }, TvKind::Clz { clz: cb, rhs: rb }) => {
                self.unify_inner(types, ca, cb, dups);
                let ra = self.find(ra);
                let rb = self.find(rb);
                self.unify_inner(types, ra, rb, dups);
                self.union_ordered(a, b);
                true
            }
            (
                TvKind::Lambda { args: aa, ret: ra },
                TvKind::Lambda { args: ab, ret: rb },
            ) => {
                // Lambdas walk by arity and the return slot
                if aa.len() != ab.len() {
                    return self.unify_err(types, "mismatched argument lengths", a, b, dups);
                }
                for (&x, &y) in aa.iter().zip(ab.iter()) {
                    self.unify_inner(types, x, y, dups);
                }
                self.unify_inner(types, ra, rb, dups);
                self.union_ordered(a, b);
                true
            }
            (
                TvKind::Struct { labels: la, args: aa, open: opa },
                TvKind::Struct { labels: lb, args: ab, open: opb },
            ) => {
                // Walk by label: common fields unify; fields on one side
                // survive while either side is still open
                let mut labels: Vec<Box<str>> = Vec::new();
                let mut args: TvVec = TvVec::new();
                for (i, l) in la.iter().enumerate() {
                    match lb.iter().position(|m| m == l) {
                        Some(j) => {
                            self.unify_inner(types, aa[i], ab[j], dups);
                            labels.push(l.clone());
                            args.push(self.find(ab[j]));
                        }
                        None => {
                            if opb {
                                labels.push(l.clone());
                                args.push(self.find(aa[i]));
                            }
                        }
                    }
                }
                for (j, m) in lb.iter().enumerate() {
                    if !la.iter().any(|l| l == m) && opa {
                        labels.push(m.clone());
                        args.push(self.find(ab[j]));
                    }
                }
                // Field walks can roll either side up through a cycle
                let b = self.find(b);
                self.set_kind(b, TvKind::Struct { labels, args, open: opa && opb });
                self.union_ordered(a, b);
                true
            }
            (TvKind::Err { msgs: ma, kids: ka }, TvKind::Err { msgs: mb, kids: kb }) => {
                let mut msgs = mb;
                for m in ma {
                    if !msgs.contains(&m) {
                        msgs.push(m);
                    }
                }
                let mut kids = kb;
                kids.extend(ka);
                self.set_kind(b, TvKind::Err { msgs, kids });
                self.union_ordered(a, b);
                true
            }
            _ => unreachable!("tags matched before unify_impl"),
        }
    }

    // Union keeping the lower id as leader; the payload merged onto `b`
    // migrates if `a` wins.
    fn union_ordered(&mut self, a: TvId, b: TvId) {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return;
        }
        if a < b {
            let kind = self.kind(b).clone();
            self.set_kind(a, kind);
            self.union(b, a);
        } else {
            self.union(a, b);
        }
    }

    // Nil wrapper against a plain variable: the child carries on with the
    // may-nil flag pushed through.
    fn unify_nil(
        &mut self,
        types: &mut TypeStore,
        nil: TvId,
        other: TvId,
        dups: &mut Dups,
    ) -> bool {
        let child = self.arg(nil, 0).expect("nil wraps one child");
        self.add_may_nil(other);
        self.unify_inner(types, child, other, dups);
        let other = self.find(other);
        let nil = self.find(nil);
        if nil != other {
            self.union(nil, other);
        }
        true
    }

    // Make (or extend) an error swallowing both sides.
    pub(super) fn unify_err(
        &mut self,
        types: &mut TypeStore,
        msg: &str,
        a: TvId,
        b: TvId,
        dups: &mut Dups,
    ) -> bool {
        let _ = (types, dups);
        if self.is_err(a) && !self.is_err(b) {
            return self.absorb_err(a, b);
        }
        if self.is_err(b) {
            return self.absorb_err(b, a);
        }
        let err = self.new_err(msg);
        self.absorb_err(err, a);
        let err = self.find(err);
        self.absorb_err(err, b);
        true
    }

    fn absorb_err(&mut self, err: TvId, v: TvId) -> bool {
        let err = self.find(err);
        let v = self.find(v);
        if err == v {
            return false;
        }
        if let TvKind::Err { msgs, mut kids } = self.kind(err).clone() {
            if !kids.contains(&v) {
                kids.push(v);
            }
            self.set_kind(err, TvKind::Err { msgs, kids });
        }
        // The error becomes the leader for both
        self.union(v, err)
    }

    // -----------------------------------------------------------------
    // Trial unification

    /// Would unify succeed without creating any error? Side-effect free.
    pub fn trial_unify_ok(&mut self, a: TvId, b: TvId) -> bool {
        let mut seen = FxHashMap::default();
        self.trial_inner(a, b, &mut seen)
    }

    fn trial_inner(&mut self, a: TvId, b: TvId, seen: &mut Dups) -> bool {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return true;
        }
        let key = (a.index(), b.index());
        if seen.contains_key(&key) {
            return true; // visited; assume it resolves
        }
        seen.insert(key, b);
        if self.is_leaf(a) || self.is_leaf(b) {
            return true;
        }
        let a_nil = matches!(self.kind(a), TvKind::Nil { .. });
        let b_nil = matches!(self.kind(b), TvKind::Nil { .. });
        if a_nil != b_nil {
            let (nil, other) = if a_nil { (a, b) } else { (b, a) };
            let child = self.arg(nil, 0).expect("nil wraps one child");
            return self.trial_inner(child, other, seen);
        }
        if self.kind(a).tag() != self.kind(b).tag() {
            return false;
        }
        match (self.kind(a).clone(), self.kind(b).clone()) {
            (TvKind::Base(_), TvKind::Base(_)) => true,
            (TvKind::Lambda { args: aa, ret: ra }, TvKind::Lambda { args: ab, ret: rb }) => {
                aa.len() == ab.len()
                    && aa
                        .iter()
                        .zip(ab.iter())
                        .all(|(&x, &y)| self.trial_inner(x, y, seen))
                    && self.trial_inner(ra, rb, seen)
            }
            (TvKind::Ptr { obj: oa }, TvKind::Ptr { obj: ob }) => self.trial_inner(oa, ob, seen),
            (
                TvKind::Struct { labels: la, args: aa, open: opa },
                TvKind::Struct { labels: lb, args: ab, open: opb },
            ) => {
                for (i, l) in la.iter().enumerate() {
                    match lb.iter().position(|m| m == l) {
                        Some(j) => {
                            if !self.trial_inner(aa[i], ab[j], seen) {
                                return false;
                            }
                        }
                        None => {
                            if !opb {
                                return false;
                            }
                        }
                    }
                }
                for m in lb.iter() {
                    if !la.iter().any(|l| l == m) && !opa {
                        return false;
                    }
                }
                true
            }
            (TvKind::Clz { clz: ca, rhs: ra }, TvKind::Clz { clz: cb, rhs: rb }) => {
                self.trial_inner(ca, cb, seen) && self.trial_inner(ra, rb, seen)
            }
            (TvKind::Nil { child: ca }, TvKind::Nil { child: cb }) => {
                self.trial_inner(ca, cb, seen)
            }
            (TvKind::Err { .. }, _) | (_, TvKind::Err { .. }) => false,
            _ => false,
        }
    }

    /// True when the two can unify exactly, with no leaves left to expand
    /// differently later.
    pub fn exact_unify_ok(&mut self, a: TvId, b: TvId) -> bool {
        let mut seen = FxHashMap::default();
        self.exact_inner(a, b, &mut seen)
    }

    fn exact_inner(&mut self, a: TvId, b: TvId, seen: &mut Dups) -> bool {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return true;
        }
        let key = (a.index(), b.index());
        if seen.contains_key(&key) {
            return true;
        }
        seen.insert(key, b);
        if self.is_leaf(a) || self.is_leaf(b) {
            return false; // leaves can expand differently
        }
        if self.kind(a).tag() != self.kind(b).tag() {
            return false;
        }
        if self.may_nil(a) != self.may_nil(b) {
            return false;
        }
        match (self.kind(a).clone(), self.kind(b).clone()) {
            (TvKind::Base(ta), TvKind::Base(tb)) => ta == tb,
            _ => {
                let n = self.nargs(a);
                if n != self.nargs(b) {
                    return false;
                }
                for i in 0..n {
                    let (x, y) = match (self.arg(a, i), self.arg(b, i)) {
                        (Some(x), Some(y)) => (x, y),
                        _ => return false,
                    };
                    if !self.exact_inner(x, y, seen) {
                        return false;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeStore;

    fn stores() -> (TvStore, TypeStore) {
        (TvStore::new(), TypeStore::new())
    }

    #[test]
    fn test_leaf_absorbs() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        let leaf = tvs.new_leaf();
        let base = tvs.new_base(t.int64);
        assert!(tvs.unify(&mut ts, leaf, base));
        let l = tvs.find(leaf);
        assert_eq!(l, tvs.find(base));
        assert!(matches!(tvs.kind(l), TvKind::Base(_)));
    }

    #[test]
    fn test_unify_symmetry() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        // a.unify(b) and b.unify(a) leave the same structure behind
        let a1 = tvs.new_base(t.int64);
        let b1 = tvs.new_base(t.flt64);
        tvs.unify(&mut ts, a1, b1);
        let a1_root = tvs.find(a1);
        let r1 = match tvs.kind(a1_root) {
            TvKind::Base(ty) => *ty,
            _ => panic!(),
        };
        let a2 = tvs.new_base(t.int64);
        let b2 = tvs.new_base(t.flt64);
        tvs.unify(&mut ts, b2, a2);
        let a2_root = tvs.find(a2);
        let r2 = match tvs.kind(a2_root) {
            TvKind::Base(ty) => *ty,
            _ => panic!(),
        };
        assert_eq!(r1, r2);
        assert_eq!(tvs.find(a1), tvs.find(b1));
        assert_eq!(tvs.find(a2), tvs.find(b2));
    }

    #[test]
    fn test_mismatch_makes_err() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        let lam = {
            let leaf = tvs.new_leaf();
            let ret = tvs.new_leaf();
            tvs.new_lambda(crate::tvar::TvVec::from_slice(&[leaf]), ret)
        };
        let base = tvs.new_base(t.int64);
        // Base against Lambda is a shape mismatch; both get swallowed
        assert!(tvs.unify(&mut ts, lam, base));
        let l = tvs.find(lam);
        assert!(tvs.is_err(l));
        assert_eq!(l, tvs.find(base));
    }

    #[test]
    fn test_arity_mismatch() {
        let (mut tvs, mut ts) = stores();
        let l1 = {
            let a = tvs.new_leaf();
            let r = tvs.new_leaf();
            tvs.new_lambda(crate::tvar::TvVec::from_slice(&[a]), r)
        };
        let l2 = {
            let a = tvs.new_leaf();
            let b = tvs.new_leaf();
            let r = tvs.new_leaf();
            tvs.new_lambda(crate::tvar::TvVec::from_slice(&[a, b]), r)
        };
        tvs.unify(&mut ts, l1, l2);
        let l1_root = tvs.find(l1);
        assert!(tvs.is_err(l1_root));
    }

    #[test]
    fn test_struct_by_label() {
        let (mut tvs, mut ts) = stores();
        let t = ts.t();
        let x1 = tvs.new_base(t.int64);
        let y1 = tvs.new_leaf();
        let s1 = tvs.new_struct(vec![("x", x1), ("y", y1)], false);
        let x2 = tvs.new_leaf();
        let y2 = tvs.new_base(t.flt64);
        let s2 = tvs.new_struct(vec![("x", x2), ("y", y2)], false);
        tvs.unify(&mut ts, s1, s2);
        let l = tvs.find(s1);
        assert_eq!(l, tvs.find(s2));
        // x picked up the int base, y the float base
        let x2_root = tvs.find(x2);
        assert!(matches!(tvs.kind(x2_root), TvKind::Base(_)));
        let y1_root = tvs.find(y1);
        assert!(matches!(tvs.kind(y1_root), TvKind::Base(_)));
    }

    #[test]
    fn test_cyclic_unify_terminates() {
        let (mut tvs, mut ts) = stores();
        // mu-recursive: ptr -> struct { next: ptr }
        let mk = |tvs: &mut TvStore| {
            let p = tvs.new_leaf();
            let s = tvs.new_struct(vec![("next", p)], false);
            let ptr = tvs.new_ptr(s);
            // tie the knot
            tvs.unify_knot(p, ptr);
            ptr
        };
        let a = mk(&mut tvs);
        let b = mk(&mut tvs);
        assert!(tvs.unify(&mut ts, a, b) || tvs.find(a) == tvs.find(b));
        assert_eq!(tvs.find(a), tvs.find(b));
        let a_root = tvs.find(a);
        assert!(!tvs.is_err(a_root));
    }

    #[test]
    fn test_trial_is_side_effect_free() {
        let (mut tvs, ts) = stores();
        let t = ts.t();
        let base = tvs.new_base(t.int64);
        let lam = {
            let r = tvs.new_leaf();
            tvs.new_lambda(crate::tvar::TvVec::new(), r)
        };
        assert!(!tvs.trial_unify_ok(base, lam));
        // Nothing unified, nothing errored
        let base_root = tvs.find(base);
        assert!(!tvs.is_err(base_root));
        assert_ne!(tvs.find(base), tvs.find(lam));
    }

    #[test]
    fn test_exact_unify_rejects_leaves() {
        let (mut tvs, _ts) = stores();
        let a = tvs.new_leaf();
        let lam_a = tvs.new_lambda(crate::tvar::TvVec::from_slice(&[a]), a);
        let b = tvs.new_leaf();
        let lam_b = tvs.new_lambda(crate::tvar::TvVec::from_slice(&[b]), b);
        assert!(!tvs.exact_unify_ok(lam_a, lam_b));
    }
}
