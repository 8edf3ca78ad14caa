// src/types/display.rs
//
// Cyclic-safe printing for flow types. Revisiting an in-progress type
// prints '$' to break the cycle, the same convention the node printer
// uses for recursive graphs.

use std::fmt;

use rustc_hash::FxHashSet;

use super::{Simple, TypeId, TypeKind, TypeStore};

/// Borrowing wrapper that prints one type.
pub struct TyDisplay<'a> {
    ts: &'a TypeStore,
    id: TypeId,
}

impl TypeStore {
    pub fn display(&self, id: TypeId) -> TyDisplay<'_> {
        TyDisplay { ts: self, id }
    }

    pub fn str_of(&self, id: TypeId) -> String {
        self.display(id).to_string()
    }
}

impl fmt::Display for TyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut visit = FxHashSet::default();
        fmt_ty(self.ts, self.id, f, &mut visit)
    }
}

fn fmt_ty(
    ts: &TypeStore,
    id: TypeId,
    f: &mut fmt::Formatter<'_>,
    visit: &mut FxHashSet<TypeId>,
) -> fmt::Result {
    if !visit.insert(id) {
        return write!(f, "$");
    }
    let r = fmt_ty_inner(ts, id, f, visit);
    visit.remove(&id);
    r
}

fn fmt_ty_inner(
    ts: &TypeStore,
    id: TypeId,
    f: &mut fmt::Formatter<'_>,
    visit: &mut FxHashSet<TypeId>,
) -> fmt::Result {
    match ts.kind(id) {
        TypeKind::Simple(s) => {
            let name = match s {
                Simple::Any => "any",
                Simple::All => "all",
                Simple::Ctrl => "Ctrl",
                Simple::Xctrl => "~Ctrl",
                Simple::Scalar => "scalar",
                Simple::Xscalar => "~scalar",
                Simple::Nil => "nil",
                Simple::Xnil => "~nil",
            };
            write!(f, "{}", name)
        }
        TypeKind::Int { flags, z, con } => {
            if *z == 0 {
                return write!(f, "{}", con);
            }
            if flags.any {
                write!(f, "~")?;
            }
            if flags.sub && !flags.nil {
                write!(f, "n")?;
            }
            write!(f, "int{}", z)
        }
        TypeKind::Flt { flags, z, con } => {
            if *z == 0 {
                return write!(f, "{}", f64::from_bits(*con));
            }
            if flags.any {
                write!(f, "~")?;
            }
            if flags.sub && !flags.nil {
                write!(f, "n")?;
            }
            write!(f, "flt{}", z)
        }
        TypeKind::FunPtr { fidxs, dsp, ret, .. } => {
            write!(f, "{}{{", fidxs)?;
            fmt_ty(ts, *dsp, f, visit)?;
            write!(f, " -> ")?;
            fmt_ty(ts, *ret, f, visit)?;
            write!(f, " }}")
        }
        TypeKind::MemPtr { aliases, obj } => {
            write!(f, "*{}", aliases)?;
            fmt_ty(ts, *obj, f, visit)
        }
        TypeKind::Obj { any } => write!(f, "{}obj", if *any { "~" } else { "" }),
        TypeKind::Str { any, con } => match con {
            Some(s) => write!(f, "{:?}", s),
            None => write!(f, "{}str", if *any { "~" } else { "" }),
        },
        TypeKind::Ary { len, elem } => {
            write!(f, "[")?;
            fmt_ty(ts, *len, f, visit)?;
            write!(f, "]")?;
            fmt_ty(ts, *elem, f, visit)
        }
        TypeKind::Struct { any, flds } => {
            if *any {
                write!(f, "~")?;
            }
            write!(f, "@{{")?;
            for fld in flds {
                write!(f, "{}=", fld.name)?;
                fmt_ty(ts, fld.ty, f, visit)?;
                write!(f, "; ")?;
            }
            write!(f, "}}")
        }
        TypeKind::Tuple { ts: elems } => {
            write!(f, "(")?;
            for (i, &e) in elems.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                fmt_ty(ts, e, f, visit)?;
            }
            write!(f, ")")
        }
        TypeKind::Mem { any, objs } => {
            if *any {
                write!(f, "~")?;
            }
            write!(f, "[")?;
            for (i, o) in objs.iter().enumerate() {
                if let Some(o) = o {
                    write!(f, "{}#:", i)?;
                    fmt_ty(ts, *o, f, visit)?;
                    write!(f, ",")?;
                }
            }
            write!(f, "]")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitsAlias;
    use crate::types::{Access, Fld};

    #[test]
    fn test_simple_printing() {
        let mut ts = TypeStore::new();
        let t = ts.t();
        assert_eq!(ts.str_of(t.any), "any");
        assert_eq!(ts.str_of(t.int64), "int64");
        let five = ts.int_con(5);
        assert_eq!(ts.str_of(five), "5");
        let xi8 = ts.dual(t.int8);
        assert_eq!(ts.str_of(xi8), "~int8");
    }

    #[test]
    fn test_cyclic_printing_terminates() {
        let mut ts = TypeStore::new();
        let a = ts.alias_tree.new_id();
        let s = ts.reserve();
        let p = ts.reserve();
        let got = ts.install_cycle(
            &[s, p],
            vec![
                TypeKind::Struct {
                    any: false,
                    flds: vec![Fld { name: "next".into(), access: Access::Final, ty: p }],
                },
                TypeKind::MemPtr { aliases: BitsAlias::make_const(a), obj: s },
            ],
        );
        let txt = ts.str_of(got[0]);
        assert!(txt.contains('$'), "cycle broken in {txt}");
    }
}
