// src/types/meet.rs
//
// Lattice meet over interned flow types. Join is dual-meet-dual.
//
// The meet always moves down the lattice: meet(a,b) is at or below both
// arguments. The driver's termination argument leans on that, so every
// rule here must be monotone; a handful of rules are deliberately
// conservative (cross-class scalar meets fall to SCALAR).

use super::{int_log, Fld, NilFlags, Simple, TypeId, TypeIdVec, TypeKind, TypeStore};

impl TypeStore {
    pub fn meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        if a == b {
            return a;
        }
        let t = self.t();
        if a == t.all || b == t.all {
            return t.all;
        }
        if a == t.any {
            return b;
        }
        if b == t.any {
            return a;
        }
        use TypeKind as K;
        let ka = self.kind(a).clone();
        let kb = self.kind(b).clone();
        match (&ka, &kb) {
            (K::Simple(sa), K::Simple(sb)) => self.simple_meet(*sa, *sb),
            (K::Simple(s), _) => self.simple_cross(*s, b),
            (_, K::Simple(s)) => self.simple_cross(*s, a),
            (K::Int { .. }, K::Int { .. }) => self.int_meet(a, b),
            (K::Flt { .. }, K::Flt { .. }) => self.flt_meet(a, b),
            (K::Int { .. }, K::Flt { .. }) => self.cross_flt(a, b),
            (K::Flt { .. }, K::Int { .. }) => self.cross_flt(b, a),
            (K::FunPtr { .. }, K::FunPtr { .. }) => self.funptr_meet(a, b),
            (K::MemPtr { .. }, K::MemPtr { .. }) => self.memptr_meet(a, b),
            (ka, kb) if ka.is_scalar_class() && kb.is_scalar_class() => self.cross_nil(a, b),
            (ka, kb) if ka.is_obj_class() && kb.is_obj_class() => self.obj_meet(a, b),
            (K::Tuple { .. }, K::Tuple { .. }) => self.tuple_meet(a, b),
            (K::Mem { .. }, K::Mem { .. }) => self.mem_meet(a, b),
            _ => t.all,
        }
    }

    pub fn join(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let da = self.dual(a);
        let db = self.dual(b);
        let m = self.meet(da, db);
        self.dual(m)
    }

    // Meet of two distinct simple types, neither ANY nor ALL.
    fn simple_meet(&mut self, sa: Simple, sb: Simple) -> TypeId {
        use Simple::*;
        let t = self.t();
        match (sa, sb) {
            (Ctrl, Xctrl) | (Xctrl, Ctrl) => t.ctrl,
            // Control against any value class is a hard bottom
            (Ctrl | Xctrl, _) | (_, Ctrl | Xctrl) => t.all,
            (Scalar, _) | (_, Scalar) => t.scalar,
            (Xscalar, o) | (o, Xscalar) => self.simple(o),
            (Nil, Xnil) | (Xnil, Nil) => t.nil,
            // Exhausted: every remaining pair was equal or listed
            _ => t.all,
        }
    }

    // A simple type against a non-simple one.
    fn simple_cross(&mut self, s: Simple, x: TypeId) -> TypeId {
        use Simple::*;
        let t = self.t();
        let scalar_class = self.kind(x).is_scalar_class();
        match s {
            Any | All | Ctrl | Xctrl => {
                if s == Ctrl || s == Xctrl {
                    t.all
                } else {
                    unreachable!("ANY and ALL are handled by the meet entry")
                }
            }
            Scalar => {
                if scalar_class {
                    t.scalar
                } else {
                    t.all
                }
            }
            Xscalar => {
                if scalar_class {
                    x
                } else {
                    t.all
                }
            }
            Nil | Xnil => {
                if scalar_class {
                    self.meet_nil(s, x)
                } else {
                    t.all
                }
            }
        }
    }

    // NIL or XNIL against an int, float or pointer.
    fn meet_nil(&mut self, s: Simple, x: TypeId) -> TypeId {
        let t = self.t();
        if s == Simple::Xnil && self.above_center(x) {
            return t.xnil;
        }
        match self.kind(x).clone() {
            TypeKind::Int { .. } => {
                let niln = NilFlags { any: false, nil: true, sub: false };
                let n = self.int_make(niln, 1, 0);
                self.int_meet(n, x)
            }
            TypeKind::Flt { .. } => {
                let niln = NilFlags { any: false, nil: true, sub: false };
                let n = self.flt_make(niln, 32, 0.0);
                self.flt_meet(n, x)
            }
            TypeKind::FunPtr { fidxs, nargs, dsp, ret } => {
                let nil = crate::bits::BitsFun::nil();
                let fidxs = fidxs.meet(&nil, &self.fidx_tree);
                self.funptr_make(fidxs, nargs, dsp, ret)
            }
            TypeKind::MemPtr { aliases, obj } => {
                let nil = crate::bits::BitsAlias::nil();
                let aliases = aliases.meet(&nil, &self.alias_tree);
                self.memptr_make(aliases, obj)
            }
            _ => t.all,
        }
    }

    // Meet of two ints. High non-constants narrow; a constant meeting a
    // compatible no-wider high keeps the constant; otherwise sizes max out.
    fn int_meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let (fa, za, ca) = self.int_parts(a);
        let (fb, zb, cb) = self.int_parts(b);
        let flags = fa.meet(fb);
        if flags.any {
            // Both high, neither a constant: narrow
            return self.int_make(flags, za.min(zb), 0);
        }
        let lz0 = if za == 0 { int_log(ca) } else { za };
        let lz1 = if zb == 0 { int_log(cb) } else { zb };
        if za == 0 && fb.any && (fb.nil || fb.sub) && lz0 <= lz1 {
            return a; // keep the constant
        }
        if zb == 0 && fa.any && (fa.nil || fa.sub) && lz1 <= lz0 {
            return b;
        }
        let z = if fa.any {
            lz1
        } else if fb.any {
            lz0
        } else {
            lz0.max(lz1)
        };
        self.int_make(flags, z, 0)
    }

    fn flt_meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let (fa, za, ca) = self.flt_parts(a);
        let (fb, zb, cb) = self.flt_parts(b);
        let flags = fa.meet(fb);
        if flags.any {
            return self.flt_make(flags, za.min(zb), 0.0);
        }
        let lz0 = if za == 0 { super::flt_log(ca) } else { za };
        let lz1 = if zb == 0 { super::flt_log(cb) } else { zb };
        if za == 0 && fb.any && (fb.nil || fb.sub) && lz0 <= lz1 {
            return a;
        }
        if zb == 0 && fa.any && (fa.nil || fa.sub) && lz1 <= lz0 {
            return b;
        }
        let z = if fa.any {
            lz1
        } else if fb.any {
            lz0
        } else {
            lz0.max(lz1)
        };
        self.flt_make(flags, z, 0.0)
    }

    // Int meets float. A high float injects into the next smaller high int;
    // a low or high int injects into the suitable float; a low 64-bit int
    // has no free conversion and the meet falls out of the numeric space.
    fn cross_flt(&mut self, int_id: TypeId, flt_id: TypeId) -> TypeId {
        let (fi, zi, ci) = self.int_parts(int_id);
        let (ff, zf, _cf) = self.flt_parts(flt_id);
        if ff.any {
            let small = self.int_make(ff, zf >> 1, 0);
            return self.int_meet(small, int_id);
        }
        let z = if zi == 0 { int_log(ci) } else { zi };
        if !fi.any && z == 64 {
            return self.cross_nil(int_id, flt_id);
        }
        let exact = zi == 0 && (ci as f64) as i64 == ci;
        let fl = if exact {
            self.flt_con(ci as f64)
        } else {
            let fz = if fi.any || z < 32 { 32 } else { 64 };
            self.flt_make(NilFlags { any: false, nil: fi.nil, sub: fi.sub }, fz, 0.0)
        };
        self.flt_meet(fl, flt_id)
    }

    // Meet of unrelated scalar classes falls to the scalar bottom. This is
    // coarser than a nil-precise scalar tier but keeps the lattice small.
    fn cross_nil(&mut self, _a: TypeId, _b: TypeId) -> TypeId {
        self.t().scalar
    }

    fn funptr_meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let (fidxa, na, dspa, reta) = match self.kind(a).clone() {
            TypeKind::FunPtr { fidxs, nargs, dsp, ret } => (fidxs, nargs, dsp, ret),
            _ => unreachable!(),
        };
        let (fidxb, nb, dspb, retb) = match self.kind(b).clone() {
            TypeKind::FunPtr { fidxs, nargs, dsp, ret } => (fidxs, nargs, dsp, ret),
            _ => unreachable!(),
        };
        let fidxs = fidxa.meet(&fidxb, &self.fidx_tree);
        // Unequal arity: a low short function "wins" (fewer args is lower),
        // a high short one loses to the long side.
        let (min_t, min_n, max_n) = if na < nb { (a, na, nb) } else { (b, nb, na) };
        let nargs = if self.above_center(min_t) { max_n } else { min_n };
        let dsp = self.meet(dspa, dspb);
        let ret = self.meet(reta, retb);
        self.funptr_make(fidxs, nargs, dsp, ret)
    }

    fn memptr_meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let (ala, obja) = match self.kind(a).clone() {
            TypeKind::MemPtr { aliases, obj } => (aliases, obj),
            _ => unreachable!(),
        };
        let (alb, objb) = match self.kind(b).clone() {
            TypeKind::MemPtr { aliases, obj } => (aliases, obj),
            _ => unreachable!(),
        };
        let aliases = ala.meet(&alb, &self.alias_tree);
        let obj = self.meet(obja, objb);
        self.memptr_make(aliases, obj)
    }

    // Meet within the object family (Obj/Str/Ary/Struct).
    fn obj_meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        use TypeKind as K;
        let t = self.t();
        let ka = self.kind(a).clone();
        let kb = self.kind(b).clone();
        match (&ka, &kb) {
            (K::Obj { any: true }, _) => b,
            (_, K::Obj { any: true }) => a,
            (K::Obj { any: false }, _) | (_, K::Obj { any: false }) => t.obj,
            (K::Str { any: aa, con: ca }, K::Str { any: ab, con: cb }) => {
                if *aa && ca.is_none() {
                    return b;
                }
                if *ab && cb.is_none() {
                    return a;
                }
                if ca == cb {
                    return a;
                }
                t.str_
            }
            (K::Ary { len: la, elem: ea }, K::Ary { len: lb, elem: eb }) => {
                let (la, ea, lb, eb) = (*la, *ea, *lb, *eb);
                let len = self.meet(la, lb);
                let elem = self.meet(ea, eb);
                self.ary_make(len, elem)
            }
            (K::Struct { any: aa, flds: fa }, K::Struct { any: ab, flds: fb }) => {
                if same_labels(fa, fb) {
                    let fa = fa.clone();
                    let fb = fb.clone();
                    let any = *aa && *ab;
                    let flds = fa
                        .iter()
                        .zip(fb.iter())
                        .map(|(x, y)| Fld {
                            name: x.name.clone(),
                            access: x.access.meet(y.access),
                            ty: self.meet(x.ty, y.ty),
                        })
                        .collect();
                    return self.struct_make(any, flds);
                }
                if self.above_center(a) {
                    return b;
                }
                if self.above_center(b) {
                    return a;
                }
                t.obj
            }
            _ => {
                // Mixed object classes
                if self.above_center(a) {
                    return b;
                }
                if self.above_center(b) {
                    return a;
                }
                t.obj
            }
        }
    }

    fn tuple_meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let ta = match self.kind(a) {
            TypeKind::Tuple { ts } => ts.clone(),
            _ => unreachable!(),
        };
        let tb = match self.kind(b) {
            TypeKind::Tuple { ts } => ts.clone(),
            _ => unreachable!(),
        };
        if ta.len() != tb.len() {
            return self.t().all;
        }
        let ts: TypeIdVec = ta.iter().zip(tb.iter()).map(|(&x, &y)| self.meet(x, y)).collect();
        self.tuple_make(ts)
    }

    // Per-alias meet of two sparse memories. The default slot rides along
    // like any other slot; canonicalization re-compresses the result.
    fn mem_meet(&mut self, a: TypeId, b: TypeId) -> TypeId {
        let (anya, la) = match self.kind(a) {
            TypeKind::Mem { any, objs } => (*any, objs.len()),
            _ => unreachable!(),
        };
        let (anyb, lb) = match self.kind(b) {
            TypeKind::Mem { any, objs } => (*any, objs.len()),
            _ => unreachable!(),
        };
        let len = la.max(lb);
        let mut objs: Vec<Option<TypeId>> = vec![None; len];
        for (i, slot) in objs.iter_mut().enumerate().skip(1) {
            let x = self.mem_at(a, i as u32);
            let y = self.mem_at(b, i as u32);
            *slot = Some(self.meet(x, y));
        }
        self.mem_make(anya && anyb, objs)
    }

    pub(super) fn int_parts(&self, id: TypeId) -> (NilFlags, u8, i64) {
        match self.kind(id) {
            TypeKind::Int { flags, z, con } => (*flags, *z, *con),
            _ => panic!("expected an int"),
        }
    }

    pub(super) fn flt_parts(&self, id: TypeId) -> (NilFlags, u8, f64) {
        match self.kind(id) {
            TypeKind::Flt { flags, z, con } => (*flags, *z, f64::from_bits(*con)),
            _ => panic!("expected a float"),
        }
    }
}

impl TypeKind {
    pub(super) fn is_scalar_class(&self) -> bool {
        matches!(
            self,
            TypeKind::Int { .. }
                | TypeKind::Flt { .. }
                | TypeKind::FunPtr { .. }
                | TypeKind::MemPtr { .. }
        )
    }

    pub(crate) fn is_obj_class(&self) -> bool {
        matches!(
            self,
            TypeKind::Obj { .. }
                | TypeKind::Str { .. }
                | TypeKind::Ary { .. }
                | TypeKind::Struct { .. }
        )
    }
}

fn same_labels(a: &[Fld], b: &[Fld]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.name == y.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{BitsAlias, BitsFun};

    fn store() -> TypeStore {
        TypeStore::new()
    }

    fn samples(ts: &mut TypeStore) -> Vec<TypeId> {
        let t = ts.t();
        let five = ts.int_con(5);
        let c123 = ts.int_con(123456789);
        let pi = ts.flt_con(3.141592653589793);
        let nint64_dual = ts.dual(t.nint64);
        let alias2 = {
            let a = ts.alias_tree.new_id();
            let t_obj = t.obj;
            ts.memptr_make(BitsAlias::make_const(a), t_obj)
        };
        vec![
            t.any, t.all, t.ctrl, t.xctrl, t.scalar, t.xscalar, t.nil, t.xnil,
            t.int64, t.nint64, t.int8, t.bool_, five, c123, nint64_dual,
            t.flt64, t.flt32, pi, t.generic_funptr, t.empty_funptr, alias2,
            t.allmem, t.anymem, t.xmem, t.if_all, t.if_true,
        ]
    }

    // The keep-the-constant rule makes triples of two same-size constants
    // and a forbidding high non-associative (the source system shares this
    // corner), so the associativity sweep runs over a set with one constant
    // per numeric class and no forbidding highs.
    fn assoc_samples(ts: &mut TypeStore) -> Vec<TypeId> {
        let t = ts.t();
        let five = ts.int_con(5);
        let alias2 = {
            let a = ts.alias_tree.new_id();
            let t_obj = t.obj;
            ts.memptr_make(BitsAlias::make_const(a), t_obj)
        };
        vec![
            t.any, t.all, t.ctrl, t.xctrl, t.scalar, t.xscalar, t.nil, t.xnil,
            t.int64, t.nint64, t.int8, t.bool_, five, t.flt64, t.flt32,
            t.generic_funptr, t.empty_funptr, alias2,
            t.allmem, t.anymem, t.xmem, t.if_all, t.if_true,
        ]
    }

    #[test]
    fn test_meet_idempotent() {
        let mut ts = store();
        for a in samples(&mut ts) {
            assert_eq!(ts.meet(a, a), a, "meet({a:?},{a:?})");
        }
    }

    #[test]
    fn test_meet_commutative() {
        let mut ts = store();
        let ss = samples(&mut ts);
        for &a in &ss {
            for &b in &ss {
                let ab = ts.meet(a, b);
                let ba = ts.meet(b, a);
                assert_eq!(ab, ba, "meet({a:?},{b:?})");
            }
        }
    }

    #[test]
    fn test_meet_associative() {
        let mut ts = store();
        let ss = assoc_samples(&mut ts);
        for &a in &ss {
            for &b in &ss {
                for &c in &ss {
                    let ab = ts.meet(a, b);
                    let ab_c = ts.meet(ab, c);
                    let bc = ts.meet(b, c);
                    let a_bc = ts.meet(a, bc);
                    assert_eq!(ab_c, a_bc, "assoc({a:?},{b:?},{c:?})");
                }
            }
        }
    }

    #[test]
    fn test_join_laws() {
        let mut ts = store();
        let t = ts.t();
        let ss = samples(&mut ts);
        for &a in &ss {
            assert_eq!(ts.join(a, a), a);
            assert_eq!(ts.join(a, t.all), a);
            assert_eq!(ts.join(a, t.any), t.any);
        }
        for &a in &ss {
            for &b in &ss {
                assert_eq!(ts.join(a, b), ts.join(b, a));
            }
        }
    }

    #[test]
    fn test_int_meet_rules() {
        let mut ts = store();
        let t = ts.t();
        let five = ts.int_con(5);
        // Constant meets a no-wider high: keeps the constant
        let xnint8 = ts.dual(t.nint8);
        assert_eq!(ts.meet(five, xnint8), five);
        // Constant meets low: widens to the max size
        assert_eq!(ts.meet(five, t.int64), t.int64);
        let seven = ts.int_con(7);
        let m = ts.meet(five, seven);
        assert_eq!(m, t.nint8);
        // Two highs narrow
        let xi64 = ts.dual(t.int64);
        let xi8 = ts.dual(t.int8);
        assert_eq!(ts.meet(xi64, xi8), xi8);
    }

    #[test]
    fn test_nil_meets() {
        let mut ts = store();
        let t = ts.t();
        // NIL folds into an int that admits nil
        assert_eq!(ts.meet(t.nil, t.int64), t.int64);
        let m = ts.meet(t.nil, t.nint64);
        assert_eq!(m, t.int64);
        // XNIL stays high against a high pointer
        let hi_ptr = ts.dual(t.generic_funptr);
        assert_eq!(ts.meet(t.xnil, hi_ptr), t.xnil);
    }

    #[test]
    fn test_funptr_meet_nargs() {
        let mut ts = store();
        let t = ts.t();
        let f1 = ts.funptr_make(BitsFun::make_const(2), 1, t.all, t.scalar);
        let f2 = ts.funptr_make(BitsFun::make_const(3), 2, t.all, t.scalar);
        let m = ts.meet(f1, f2);
        match ts.kind(m) {
            TypeKind::FunPtr { nargs, fidxs, .. } => {
                // Short low side wins the arity
                assert_eq!(*nargs, 1);
                assert!(fidxs.test(2) && fidxs.test(3));
            }
            _ => panic!("expected a funptr"),
        }
    }

    #[test]
    fn test_mem_meet_elementwise() {
        let mut ts = store();
        let t = ts.t();
        let a2 = ts.alias_tree.new_id();
        let sa = ts.mem_single(a2, t.obj);
        let m = ts.meet(sa, t.xmem);
        // The precise slot survives; the rest stays don't-care
        assert_eq!(ts.mem_at(m, a2), t.obj);
        assert_eq!(ts.mem_at(m, a2 + 1), t.xobj);
        // Meeting with all-of-memory swamps the slot
        let m2 = ts.meet(sa, t.allmem);
        assert_eq!(m2, t.allmem);
    }

    #[test]
    fn test_cross_flt() {
        let mut ts = store();
        let t = ts.t();
        // Small int constant injects into floats exactly
        let five = ts.int_con(5);
        let m = ts.meet(five, t.flt64);
        assert_eq!(m, t.flt64);
        // Low 64-bit int has no free conversion
        let m2 = ts.meet(t.int64, t.flt64);
        assert_eq!(m2, t.scalar);
    }
}
