// src/types/cyclic.rs
//
// Two-phase interning for cyclic struct/pointer families.
//
// A cyclic family (structs whose fields point back at themselves through
// MemPtrs) cannot be content-keyed in the intern map: its content mentions
// its own provisional ids. Instead the family is installed into reserved
// slots, compared against previously installed families with cycle_equals
// (equality up to graph isomorphism), and only registered once the cycle
// has closed, at which point its hash is installed. A duplicate family
// returns its slots to the free list and answers with the existing ids.

use rustc_hash::FxHashMap;

use super::{TypeId, TypeKind, TypeStore};

impl TypeStore {
    /// Reserve a provisional slot for a member of a cyclic family. The
    /// entry is unusable until `install_cycle` fills it.
    pub fn reserve(&mut self) -> TypeId {
        let id = self.push_entry(TypeKind::Simple(super::Simple::All));
        self.entries[id.index() as usize].hash = 0;
        id
    }

    /// Fill previously reserved slots with mutually-referring kinds and
    /// close the cycle. Returns the canonical ids for each member: the
    /// reserved ids if the family is new, or an isomorphic existing
    /// family's ids if one was already interned.
    pub fn install_cycle(&mut self, ids: &[TypeId], kinds: Vec<TypeKind>) -> Vec<TypeId> {
        assert_eq!(ids.len(), kinds.len());
        for (&id, kind) in ids.iter().zip(kinds.into_iter()) {
            let e = &mut self.entries[id.index() as usize];
            e.kind = kind;
            e.hash = 0;
        }
        // Check each registered family for an isomorphic match.
        for hi in 0..self.cyclic_heads.len() {
            let head = self.cyclic_heads[hi];
            let mut map = FxHashMap::default();
            if self.cycle_equals_map(ids[0], head, &mut map) {
                // Duplicate: free our slots and translate through the map.
                let out: Vec<TypeId> =
                    ids.iter().map(|id| *map.get(id).unwrap_or(id)).collect();
                for &id in ids {
                    self.entries[id.index() as usize].kind =
                        TypeKind::Simple(super::Simple::All);
                    self.free.push(id.index());
                }
                return out;
            }
        }
        // New family: build the dual family in the same two-phase way,
        // link duals, install hashes, register both heads.
        let duals: Vec<TypeId> = ids.iter().map(|_| self.reserve()).collect();
        for (&id, &did) in ids.iter().zip(duals.iter()) {
            self.entries[id.index() as usize].dual = did;
            self.entries[did.index() as usize].dual = id;
        }
        for (&id, &did) in ids.iter().zip(duals.iter()) {
            let dkind = {
                let kind = self.entries[id.index() as usize].kind.clone();
                self.dual_kind(&kind)
            };
            self.entries[did.index() as usize].kind = dkind;
        }
        for &id in ids.iter().chain(duals.iter()) {
            let h = Self::content_hash(&self.entries[id.index() as usize].kind);
            self.entries[id.index() as usize].hash = h | 1; // never the provisional 0
        }
        self.cyclic_heads.push(ids[0]);
        self.cyclic_heads.push(duals[0]);
        ids.to_vec()
    }

    /// Equality up to graph isomorphism, with a visited-pair memo to close
    /// cycles.
    pub fn cycle_equals(&self, a: TypeId, b: TypeId) -> bool {
        let mut map = FxHashMap::default();
        self.cycle_equals_map(a, b, &mut map)
    }

    fn cycle_equals_map(
        &self,
        a: TypeId,
        b: TypeId,
        map: &mut FxHashMap<TypeId, TypeId>,
    ) -> bool {
        if a == b {
            return true;
        }
        if let Some(&prev) = map.get(&a) {
            return prev == b;
        }
        map.insert(a, b);
        use TypeKind as K;
        match (self.kind(a), self.kind(b)) {
            (K::MemPtr { aliases: ba, obj: oa }, K::MemPtr { aliases: bb, obj: ob }) => {
                ba == bb && self.cycle_equals_map(*oa, *ob, map)
            }
            (
                K::FunPtr { fidxs: fa, nargs: na, dsp: da, ret: ra },
                K::FunPtr { fidxs: fb, nargs: nb, dsp: db, ret: rb },
            ) => {
                fa == fb
                    && na == nb
                    && self.cycle_equals_map(*da, *db, map)
                    && self.cycle_equals_map(*ra, *rb, map)
            }
            (K::Struct { any: aa, flds: fa }, K::Struct { any: ab, flds: fb }) => {
                aa == ab
                    && fa.len() == fb.len()
                    && fa.iter().zip(fb.iter()).all(|(x, y)| {
                        x.name == y.name
                            && x.access == y.access
                            && self.cycle_equals_map(x.ty, y.ty, map)
                    })
            }
            (K::Ary { len: la, elem: ea }, K::Ary { len: lb, elem: eb }) => {
                self.cycle_equals_map(*la, *lb, map) && self.cycle_equals_map(*ea, *eb, map)
            }
            (K::Tuple { ts: ta }, K::Tuple { ts: tb }) => {
                ta.len() == tb.len()
                    && ta.iter().zip(tb.iter()).all(|(&x, &y)| self.cycle_equals_map(x, y, map))
            }
            (ka, kb) => ka == kb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitsAlias;
    use crate::types::{Access, Fld};

    // Build a list type: struct { val: int64, next: *self } at `alias`.
    fn list_cycle(ts: &mut TypeStore, alias: u32) -> (TypeId, TypeId) {
        let t = ts.t();
        let s = ts.reserve();
        let p = ts.reserve();
        let got = ts.install_cycle(
            &[s, p],
            vec![
                TypeKind::Struct {
                    any: false,
                    flds: vec![
                        Fld { name: "val".into(), access: Access::Final, ty: t.int64 },
                        Fld { name: "next".into(), access: Access::Final, ty: p },
                    ],
                },
                TypeKind::MemPtr { aliases: BitsAlias::make_const(alias), obj: s },
            ],
        );
        (got[0], got[1])
    }

    #[test]
    fn test_cycle_intern_dedup() {
        let mut ts = TypeStore::new();
        let a = ts.alias_tree.new_id();
        let (s1, p1) = list_cycle(&mut ts, a);
        let (s2, p2) = list_cycle(&mut ts, a);
        // The second construction found the first family
        assert_eq!(s1, s2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_cycle_equals_isomorphic() {
        let mut ts = TypeStore::new();
        let a = ts.alias_tree.new_id();
        let b = ts.alias_tree.new_id();
        let (s1, _) = list_cycle(&mut ts, a);
        let (s2, _) = list_cycle(&mut ts, b);
        // Different alias, different family
        assert_ne!(s1, s2);
        assert!(!ts.cycle_equals(s1, s2));
        assert!(ts.cycle_equals(s1, s1));
    }

    #[test]
    fn test_cycle_dual_involution() {
        let mut ts = TypeStore::new();
        let a = ts.alias_tree.new_id();
        let (s, p) = list_cycle(&mut ts, a);
        assert_eq!(ts.dual(ts.dual(s)), s);
        assert_eq!(ts.dual(ts.dual(p)), p);
        // The dual family mirrors the structure
        let ds = ts.dual(s);
        match ts.kind(ds) {
            TypeKind::Struct { any, flds } => {
                assert!(*any);
                assert_eq!(flds[1].ty, ts.dual(p));
            }
            _ => panic!("expected a struct"),
        }
    }
}
