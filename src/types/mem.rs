// src/types/mem.rs
//
// Operations on the Mem flavor of flow types: per-alias reads, stores,
// skinny merges, liveness flattening and the escape closure.

use crate::bits::{BitsAlias, NIL_BIT};

use super::{Fld, TypeId, TypeKind, TypeStore};

impl TypeStore {
    /// The object stored at `alias`, falling back to the default slot.
    pub fn mem_at(&self, mem: TypeId, alias: u32) -> TypeId {
        match self.kind(mem) {
            TypeKind::Mem { objs, .. } => {
                let dflt = objs[1].expect("canonical mem has a default");
                objs.get(alias as usize).copied().flatten().unwrap_or(dflt)
            }
            _ => panic!("mem_at on a non-mem"),
        }
    }

    pub fn mem_any(&self, mem: TypeId) -> bool {
        match self.kind(mem) {
            TypeKind::Mem { any, .. } => *any,
            _ => panic!("mem_any on a non-mem"),
        }
    }

    pub fn mem_len(&self, mem: TypeId) -> usize {
        match self.kind(mem) {
            TypeKind::Mem { objs, .. } => objs.len(),
            _ => panic!("mem_len on a non-mem"),
        }
    }

    /// All objects loadable through `ptr`: join across a high alias set,
    /// meet across a low one. The nil alias is skipped; a load through a
    /// possibly-nil pointer is reported by the node layer, not here.
    pub fn mem_ld(&mut self, mem: TypeId, ptr: TypeId) -> TypeId {
        let t = self.t();
        let (aliases, any) = match self.kind(ptr) {
            TypeKind::MemPtr { aliases, .. } => (aliases.clone(), self.above_center(ptr)),
            _ => return self.oob(ptr, t.obj),
        };
        let mut obj = if any { t.obj } else { t.xobj };
        for alias in aliases.iter() {
            if alias == NIL_BIT {
                continue;
            }
            let at = self.mem_at(mem, alias);
            obj = if any { self.join(obj, at) } else { self.meet(obj, at) };
        }
        obj
    }

    /// Store `val` into field `fld` through `ptr`. A single-alias pointer
    /// whose alias was never split updates the slot precisely; an ambiguous
    /// pointer meets the update in.
    pub fn mem_st(&mut self, mem: TypeId, ptr: TypeId, fld: &str, val: TypeId) -> TypeId {
        let aliases = match self.kind(ptr) {
            TypeKind::MemPtr { aliases, .. } => aliases.clone(),
            _ => return self.t().allmem,
        };
        let precise = aliases.abit().map_or(false, |a| !self.alias_tree.is_parent(a));
        self.mem_update(mem, &aliases, precise, |ts, obj| ts.obj_st(obj, fld, val, precise))
    }

    /// Replace the whole object through `ptr`; the store-node flavor of `st`.
    pub fn mem_st_obj(&mut self, mem: TypeId, ptr: TypeId, obj: TypeId) -> TypeId {
        let aliases = match self.kind(ptr) {
            TypeKind::MemPtr { aliases, .. } => aliases.clone(),
            _ => return self.t().allmem,
        };
        let precise = aliases.abit().map_or(false, |a| !self.alias_tree.is_parent(a));
        self.mem_update(mem, &aliases, precise, |ts, old| {
            if precise { obj } else { ts.meet(old, obj) }
        })
    }

    fn mem_update(
        &mut self,
        mem: TypeId,
        aliases: &BitsAlias,
        _precise: bool,
        mut upd: impl FnMut(&mut Self, TypeId) -> TypeId,
    ) -> TypeId {
        let (any, len) = match self.kind(mem) {
            TypeKind::Mem { any, objs } => (*any, objs.len()),
            _ => panic!("mem_update on a non-mem"),
        };
        let max_alias = aliases.iter().max().unwrap_or(0) as usize;
        let mut objs: Vec<Option<TypeId>> = (0..len.max(max_alias + 1))
            .map(|i| if i == 0 { None } else { Some(self.mem_at(mem, i as u32)) })
            .collect();
        for alias in aliases.iter() {
            if alias == NIL_BIT {
                continue;
            }
            let old = self.mem_at(mem, alias);
            objs[alias as usize] = Some(upd(self, old));
        }
        self.mem_make(any, objs)
    }

    // Field-level object update backing `mem_st`.
    fn obj_st(&mut self, obj: TypeId, fld: &str, val: TypeId, precise: bool) -> TypeId {
        let t = self.t();
        match self.kind(obj).clone() {
            TypeKind::Struct { any, flds } => {
                let mut out: Vec<Fld> = Vec::with_capacity(flds.len());
                let mut found = false;
                for f in &flds {
                    if &*f.name == fld {
                        found = true;
                        let ty = if precise { val } else { self.meet(f.ty, val) };
                        out.push(Fld { name: f.name.clone(), access: f.access, ty });
                    } else {
                        out.push(f.clone());
                    }
                }
                if !found {
                    return t.obj; // unknown layout
                }
                self.struct_make(any, out)
            }
            _ => t.obj,
        }
    }

    /// Merge a skinny single-alias memory into this one; the given slot is
    /// precise.
    pub fn mem_merge(&mut self, mem: TypeId, skinny: TypeId) -> TypeId {
        let (alias, obj) = match self.kind(skinny) {
            TypeKind::Mem { objs, .. } => {
                let alias = objs.len() - 1;
                debug_assert!(alias >= 1);
                debug_assert!(objs.get(2..alias).map_or(true, |s| s.iter().all(|o| o.is_none())));
                (alias, objs[alias].expect("skinny mem carries its slot"))
            }
            _ => panic!("mem_merge of a non-mem"),
        };
        let (any, len) = match self.kind(mem) {
            TypeKind::Mem { any, objs } => (*any, objs.len()),
            _ => panic!("mem_merge on a non-mem"),
        };
        let mut objs: Vec<Option<TypeId>> = (0..len.max(alias + 1))
            .map(|i| {
                if i == 0 {
                    None
                } else if i < len {
                    match self.kind(mem) {
                        TypeKind::Mem { objs, .. } => objs[i],
                        _ => unreachable!(),
                    }
                } else {
                    None
                }
            })
            .collect();
        objs[alias] = Some(obj);
        self.mem_make(any, objs)
    }

    /// Liveness summary: every alias holding a real object becomes a plain
    /// "used" object, everything above center stays don't-care.
    pub fn flatten_live_fields(&mut self, mem: TypeId) -> TypeId {
        let t = self.t();
        let (any, len) = match self.kind(mem) {
            TypeKind::Mem { any, objs } => (*any, objs.len()),
            _ => panic!("flatten_live_fields on a non-mem"),
        };
        let mut objs: Vec<Option<TypeId>> = vec![None; len];
        for (i, slot) in objs.iter_mut().enumerate().skip(1) {
            let at = self.mem_at(mem, i as u32);
            *slot = Some(if self.above_center(at) { t.xobj } else { t.obj });
        }
        self.mem_make(any, objs)
    }

    /// Transitive closure of aliases reachable from `aliases` through the
    /// objects stored in `mem` (struct fields, array elements, displays).
    pub fn all_reaching_aliases(&mut self, mem: TypeId, aliases: &BitsAlias) -> BitsAlias {
        if *aliases == BitsAlias::full() || *aliases == BitsAlias::empty() {
            return aliases.clone();
        }
        let mut acc = aliases.clone();
        loop {
            let mut next = acc.clone();
            for alias in acc.iter() {
                if alias == NIL_BIT {
                    continue;
                }
                let obj = self.mem_at(mem, alias);
                next = self.obj_reaching(obj, next);
            }
            if next == acc {
                return acc;
            }
            acc = next;
        }
    }

    fn obj_reaching(&mut self, obj: TypeId, mut acc: BitsAlias) -> BitsAlias {
        match self.kind(obj).clone() {
            TypeKind::Struct { flds, .. } => {
                for f in &flds {
                    acc = self.scalar_reaching(f.ty, acc);
                }
                acc
            }
            TypeKind::Ary { elem, .. } => self.scalar_reaching(elem, acc),
            _ => acc,
        }
    }

    fn scalar_reaching(&mut self, ty: TypeId, acc: BitsAlias) -> BitsAlias {
        match self.kind(ty).clone() {
            TypeKind::MemPtr { aliases, .. } => acc.meet(&aliases, &self.alias_tree),
            TypeKind::FunPtr { dsp, .. } => self.scalar_reaching(dsp, acc),
            _ => acc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitsAlias;
    use crate::types::{Access, TypeStore};

    fn xy_struct(ts: &mut TypeStore) -> TypeId {
        let x = ts.int_con(5);
        let y = ts.int_con(9);
        ts.struct_make(
            false,
            vec![
                Fld { name: "x".into(), access: Access::Final, ty: x },
                Fld { name: "y".into(), access: Access::Final, ty: y },
            ],
        )
    }

    #[test]
    fn test_ld_single_alias() {
        let mut ts = TypeStore::new();
        let t = ts.t();
        let a = ts.alias_tree.new_id();
        let obj = xy_struct(&mut ts);
        let mem = ts.mem_single(a, obj);
        let ptr = ts.memptr_make(BitsAlias::make_const(a), t.obj);
        assert_eq!(ts.mem_ld(mem, ptr), obj);
    }

    #[test]
    fn test_st_field_precise() {
        let mut ts = TypeStore::new();
        let t = ts.t();
        let a = ts.alias_tree.new_id();
        let obj = xy_struct(&mut ts);
        let mem = ts.mem_single(a, obj);
        let ptr = ts.memptr_make(BitsAlias::make_const(a), t.obj);
        let seven = ts.int_con(7);
        let mem2 = ts.mem_st(mem, ptr, "x", seven);
        let got = ts.mem_at(mem2, a);
        match ts.kind(got) {
            crate::types::TypeKind::Struct { flds, .. } => {
                assert_eq!(flds[0].ty, seven);
                assert_eq!(&*flds[1].name, "y");
            }
            _ => panic!("expected a struct"),
        }
    }

    #[test]
    fn test_st_field_imprecise_meets() {
        let mut ts = TypeStore::new();
        let t = ts.t();
        let a = ts.alias_tree.new_id();
        let b = ts.alias_tree.new_id();
        let obj = xy_struct(&mut ts);
        let mem0 = ts.mem_single(a, obj);
        let skinny = ts.mem_single(b, obj);
        let mem = ts.mem_merge(mem0, skinny);
        let tree = ts.alias_tree.clone();
        let two = BitsAlias::make(&tree, &[a, b]);
        let ptr = ts.memptr_make(two, t.obj);
        let seven = ts.int_con(7);
        let mem2 = ts.mem_st(mem, ptr, "x", seven);
        let got = ts.mem_at(mem2, a);
        match ts.kind(got) {
            crate::types::TypeKind::Struct { flds, .. } => {
                // 5 meet 7 is a small non-nil int, not a constant
                assert_eq!(flds[0].ty, t.nint8);
            }
            _ => panic!("expected a struct"),
        }
    }

    #[test]
    fn test_merge_skinny() {
        let mut ts = TypeStore::new();
        let t = ts.t();
        let a = ts.alias_tree.new_id();
        let obj = xy_struct(&mut ts);
        let skinny = ts.mem_single(a, obj);
        let merged = ts.mem_merge(t.anymem, skinny);
        assert_eq!(ts.mem_at(merged, a), obj);
        assert!(ts.mem_any(merged));
    }

    #[test]
    fn test_flatten_live_fields() {
        let mut ts = TypeStore::new();
        let t = ts.t();
        let a = ts.alias_tree.new_id();
        let obj = xy_struct(&mut ts);
        let mem = ts.mem_single(a, obj);
        let flat = ts.flatten_live_fields(mem);
        assert_eq!(ts.mem_at(flat, a), t.obj);
        assert_eq!(ts.mem_at(flat, a + 1), t.xobj);
    }

    #[test]
    fn test_all_reaching_aliases() {
        let mut ts = TypeStore::new();
        let t = ts.t();
        let a = ts.alias_tree.new_id();
        let b = ts.alias_tree.new_id();
        // Object at alias `a` points at alias `b`
        let inner = ts.memptr_make(BitsAlias::make_const(b), t.obj);
        let obj_a = ts.struct_make(
            false,
            vec![Fld { name: "p".into(), access: Access::Final, ty: inner }],
        );
        let m0 = ts.mem_single(a, obj_a);
        let obj = xy_struct(&mut ts);
        let skinny = ts.mem_single(b, obj);
        let mem = ts.mem_merge(m0, skinny);
        let esc = ts.all_reaching_aliases(mem, &BitsAlias::make_const(a));
        assert!(esc.test(a));
        assert!(esc.test(b));
    }
}
