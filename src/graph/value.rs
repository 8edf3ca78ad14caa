// src/graph/value.rs
//
// Per-node forward flow: value() is a pure function of the input values
// and must fall monotonically as the driver iterates.

use crate::types::{Fld, Access, Simple, TypeId, TypeIdVec, TypeKind, TypeStore};

use super::{Nodes, NodeId, Op, PrimOp, MEM_IDX, FPTR_IDX};

impl Nodes {
    pub fn value(&self, types: &mut TypeStore, n: NodeId, post_cg: bool) -> TypeId {
        let t = types.t();
        let op = self.node(n).op.clone();
        match op {
            Op::Con(ty) => ty,
            Op::Start => t.ctrl,
            // All things are still to-be-allocated at program entry
            Op::StartMem => t.anymem,
            Op::DefMem => {
                let mut objs: Vec<Option<TypeId>> = vec![None; self.node(n).defs.len().max(2)];
                for (i, slot) in objs.iter_mut().enumerate().skip(2) {
                    if let Some(d) = self.def(n, i) {
                        let v = self.node(d).val;
                        *slot = Some(if types.kind(v).is_obj_class() {
                            v
                        } else {
                            types.oob(v, t.obj)
                        });
                    }
                }
                objs[1] = Some(t.obj); // unknown aliases are worst-case
                types.mem_make(false, objs)
            }
            Op::Scope => t.all,
            Op::Struct { labels } => {
                let flds = labels
                    .iter()
                    .enumerate()
                    .map(|(i, l)| Fld {
                        name: l.clone(),
                        access: Access::Final,
                        ty: self.val(n, i, t.any),
                    })
                    .collect();
                types.struct_make(false, flds)
            }
            Op::New { alias } => {
                types.memptr_make(crate::bits::BitsAlias::make_const(alias), t.obj)
            }
            Op::Store => {
                let mem = self.val(n, 0, t.any);
                let ptr = self.val(n, 1, t.any);
                let obj = self.val(n, 2, t.any);
                if !matches!(types.kind(mem), TypeKind::Mem { .. }) {
                    return types.oob(mem, t.allmem);
                }
                if !matches!(types.kind(ptr), TypeKind::MemPtr { .. }) {
                    return types.oob(ptr, t.allmem);
                }
                let obj = if types.kind(obj).is_obj_class() { obj } else { types.oob(obj, t.obj) };
                types.mem_st_obj(mem, ptr, obj)
            }
            Op::If => {
                // Zero only: false branch. Zero excluded: true branch.
                // Both excluded: neither. Both possible: both.
                let ctrl = self.val(n, 0, t.any);
                if ctrl != t.ctrl && ctrl != t.all {
                    return t.if_any;
                }
                let pred = self.val(n, 1, t.any);
                self.if_value(types, pred)
            }
            Op::CProj(i) => match types.kind(self.val(n, 0, t.any)) {
                TypeKind::Tuple { ts } if (i as usize) < ts.len() => ts[i as usize],
                _ => types.oob(self.val(n, 0, t.any), t.ctrl),
            },
            Op::Proj(i) => match types.kind(self.val(n, 0, t.any)) {
                TypeKind::Tuple { ts } if (i as usize) < ts.len() => ts[i as usize],
                _ => types.oob(self.val(n, 0, t.any), t.all),
            },
            Op::MProj => match types.kind(self.val(n, 0, t.any)) {
                TypeKind::Tuple { ts } if ts.len() > MEM_IDX => ts[MEM_IDX],
                _ => types.oob(self.val(n, 0, t.any), t.allmem),
            },
            Op::CEProj => {
                // The call-graph edge is live exactly when the call is
                let tcall = self.val(n, 0, t.any);
                match types.kind(tcall) {
                    TypeKind::Tuple { ts } if !ts.is_empty() => {
                        if ts[0] == t.ctrl || ts[0] == t.all {
                            t.ctrl
                        } else {
                            t.xctrl
                        }
                    }
                    _ => types.oob(tcall, t.ctrl),
                }
            }
            Op::Phi => {
                let ctrl = self.val(n, 0, t.any);
                if ctrl == t.xctrl || ctrl == t.any {
                    return t.any;
                }
                let mut acc = t.any;
                for i in 1..self.node(n).defs.len() {
                    if self.def(n, i).is_some() {
                        let v = self.val(n, i, t.any);
                        acc = types.meet(acc, v);
                    }
                }
                acc
            }
            Op::Fun { .. } => {
                // Alive if any caller path is alive
                for i in 1..self.node(n).defs.len() {
                    if self.def(n, i).is_some() && self.val(n, i, t.any) == t.ctrl {
                        return t.ctrl;
                    }
                }
                t.xctrl
            }
            Op::Parm { .. } => {
                let fun = self.def(n, 0).expect("parm without a fun");
                if self.node(fun).val != t.ctrl {
                    return t.any;
                }
                let mut acc = t.any;
                for i in 1..self.node(n).defs.len() {
                    // Only meet actuals whose caller path is alive
                    if self.def(n, i).is_none() || self.def(fun, i).is_none() {
                        continue;
                    }
                    if self.val(fun, i, t.any) == t.xctrl {
                        continue;
                    }
                    let v = self.val(n, i, t.any);
                    acc = types.meet(acc, v);
                }
                acc
            }
            Op::Ret => {
                let ctrl = self.val(n, 0, t.any);
                let ctrl = if ctrl == t.ctrl || ctrl == t.all { t.ctrl } else { t.xctrl };
                let mem = self.val(n, 1, t.any);
                let mem = if matches!(types.kind(mem), TypeKind::Mem { .. }) {
                    mem
                } else {
                    types.oob(mem, t.allmem)
                };
                let rez = self.val(n, 2, t.any);
                types.tuple_make(TypeIdVec::from_slice(&[ctrl, mem, rez]))
            }
            Op::Call => {
                let ctrl = self.val(n, 0, t.any);
                let ctrl = if ctrl == t.ctrl || ctrl == t.all { t.ctrl } else { t.xctrl };
                let mut ts = TypeIdVec::new();
                ts.push(ctrl);
                ts.push(self.val(n, MEM_IDX, t.any));
                ts.push(self.val(n, FPTR_IDX, t.any));
                for i in super::ARG_IDX..self.node(n).defs.len() {
                    ts.push(self.val(n, i, t.any));
                }
                types.tuple_make(ts)
            }
            Op::CallEpi { .. } => self.callepi_value(types, n, post_cg),
            // Top function pointer until defined; errors surface at the
            // end of the fixpoint if it never is
            Op::ForwardRef { .. } => t.generic_funptr,
            Op::Prim(p) => self.prim_value(types, n, p),
        }
    }

    fn if_value(&self, types: &mut TypeStore, pred: TypeId) -> TypeId {
        let t = types.t();
        let (nil, sub) = match types.kind(pred) {
            TypeKind::Simple(Simple::Nil) => (true, false),
            TypeKind::Simple(Simple::Xnil) => (true, true),
            TypeKind::Simple(Simple::Scalar) => (false, false),
            TypeKind::Simple(Simple::Xscalar) => (true, true),
            TypeKind::Int { flags, z, .. } if *z != 0 => (flags.nil, flags.sub),
            TypeKind::Flt { flags, z, .. } if *z != 0 => (flags.nil, flags.sub),
            TypeKind::Int { z: 0, con, .. } => {
                // A known zero takes the false branch, any other constant
                // the true branch
                if *con == 0 {
                    (true, false)
                } else {
                    (false, true)
                }
            }
            TypeKind::Flt { z: 0, con, .. } => {
                if f64::from_bits(*con) == 0.0 {
                    (true, false)
                } else {
                    (false, true)
                }
            }
            TypeKind::FunPtr { fidxs, .. } => {
                if fidxs.above_center() {
                    (true, true)
                } else {
                    (fidxs.abit() == Some(crate::bits::NIL_BIT), !fidxs.must_nil())
                }
            }
            TypeKind::MemPtr { aliases, .. } => {
                if aliases.above_center() {
                    (true, true)
                } else {
                    (aliases.abit() == Some(crate::bits::NIL_BIT), !aliases.must_nil())
                }
            }
            _ => return types.oob(pred, t.if_all),
        };
        match (nil, sub) {
            (true, true) => t.if_any,
            (true, false) => t.if_false,
            (false, true) => t.if_true,
            (false, false) => t.if_all,
        }
    }

    fn prim_value(&self, types: &mut TypeStore, n: NodeId, p: PrimOp) -> TypeId {
        let t = types.t();
        let a = self.val(n, 0, t.any);
        let b = self.val(n, 1, t.any);
        if a == t.any || b == t.any {
            return t.any;
        }
        let lcon = |ts: &TypeStore, v: TypeId| match ts.kind(v) {
            TypeKind::Int { z: 0, con, .. } => Some(*con),
            TypeKind::Simple(Simple::Nil) => Some(0),
            _ => None,
        };
        let ca = lcon(types, a);
        let cb = lcon(types, b);
        if let (Some(x), Some(y)) = (ca, cb) {
            let r = match p {
                PrimOp::Add => x.wrapping_add(y),
                PrimOp::Sub => x.wrapping_sub(y),
                PrimOp::Mul => x.wrapping_mul(y),
                PrimOp::Eq => (x == y) as i64,
            };
            return types.int_con(r);
        }
        let int_in = |ts: &TypeStore, v: TypeId| {
            matches!(
                ts.kind(v),
                TypeKind::Int { .. } | TypeKind::Simple(Simple::Nil) | TypeKind::Simple(Simple::Xnil)
            )
        };
        if !int_in(types, a) || !int_in(types, b) {
            return t.all;
        }
        let out = if matches!(p, PrimOp::Eq) { t.bool_ } else { t.int64 };
        if types.above_center(a) && types.above_center(b) {
            types.dual(out)
        } else {
            out
        }
    }
}
