// src/tvar/mod.rs
//
// Hindley-Milner type variables over a union-find arena.
//
// Type variables unify Tarjan-style and carry structure: lambdas,
// pointers, structural records with inferable labels, nilable wrappers,
// and an error variant that swallows both sides of a bad unification.
// Leaders own all state; followers hold only the leader link, rolled up
// with path compression on every find(). Delayed fresh-unifications and
// field resolutions register on the variables they watch and drain into
// store-wide queues the driver consumes between rounds.

mod fresh;
mod unify;

use std::rc::Rc;

use smallvec::SmallVec;

use crate::graph::NodeId;
use crate::types::{TypeId, TypeStore};

/// Handle to a type variable.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TvId(u32);

impl TvId {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

pub type TvVec = SmallVec<[TvId; 4]>;

/// Subclass tag plus structure. Followers keep a stale kind nobody reads.
#[derive(Clone, Debug)]
pub enum TvKind {
    /// Unconstrained; unifies with anything.
    Leaf,
    /// A concrete flow type, possibly sharper than any syntactic type.
    Base(TypeId),
    /// Pointer to a record.
    Ptr { obj: TvId },
    /// Function: argument row plus return; arity is significant.
    Lambda { args: TvVec, ret: TvId },
    /// Structural record; open structs may still grow labels.
    Struct { labels: Vec<Box<str>>, args: TvVec, open: bool },
    /// Clazz wrapper pairing a class record with an instance.
    Clz { clz: TvId, rhs: TvId },
    /// Nilable wrapper around a single child.
    Nil { child: TvId },
    /// A failed unification, keeping both sides for diagnostics.
    Err { msgs: Vec<String>, kids: TvVec },
}

impl TvKind {
    pub fn tag(&self) -> &'static str {
        match self {
            TvKind::Leaf => "Leaf",
            TvKind::Base(_) => "Base",
            TvKind::Ptr { .. } => "Ptr",
            TvKind::Lambda { .. } => "Lambda",
            TvKind::Struct { .. } => "Struct",
            TvKind::Clz { .. } => "Clz",
            TvKind::Nil { .. } => "Nil",
            TvKind::Err { .. } => "Err",
        }
    }
}

/// One pending fresh-unification: when `lhs` (a generic leaf) later gains
/// structure, `rhs` must be re-fresh-unified against it.
#[derive(Clone, Debug)]
pub struct DelayFresh {
    pub lhs: TvId,
    pub rhs: TvId,
    pub nongen: Rc<Vec<TvId>>,
    pub site: Option<NodeId>,
}

impl DelayFresh {
    fn same(&self, o: &DelayFresh) -> bool {
        self.lhs == o.lhs && self.rhs == o.rhs && self.site == o.site
    }
}

struct TvEntry {
    uf: Option<TvId>,
    kind: TvKind,
    may_nil: bool,
    use_nil: bool,
    widen: u8,
    delay_fresh: Vec<DelayFresh>,
    delay_resolve: Vec<TvId>,
    deps: Vec<NodeId>,
}

/// The type-variable arena plus the store-wide delayed work queues.
pub struct TvStore {
    entries: Vec<TvEntry>,
    /// Fresh-unifications to replay between driver rounds.
    pub delay_fresh: Vec<DelayFresh>,
    /// Structs with pending field resolutions.
    pub delay_resolve: Vec<TvId>,
    pending_deps: Vec<NodeId>,
    /// Variables flagged both may-nil and use-nil.
    nil_errors: Vec<TvId>,
}

impl TvStore {
    pub fn new() -> Self {
        TvStore {
            entries: Vec::new(),
            delay_fresh: Vec::new(),
            delay_resolve: Vec::new(),
            pending_deps: Vec::new(),
            nil_errors: Vec::new(),
        }
    }

    fn push(&mut self, kind: TvKind) -> TvId {
        let id = TvId(self.entries.len() as u32);
        self.entries.push(TvEntry {
            uf: None,
            kind,
            may_nil: false,
            use_nil: false,
            widen: 0,
            delay_fresh: Vec::new(),
            delay_resolve: Vec::new(),
            deps: Vec::new(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn new_leaf(&mut self) -> TvId {
        self.push(TvKind::Leaf)
    }

    pub fn new_base(&mut self, ty: TypeId) -> TvId {
        self.push(TvKind::Base(ty))
    }

    pub fn new_ptr(&mut self, obj: TvId) -> TvId {
        self.push(TvKind::Ptr { obj })
    }

    pub fn new_lambda(&mut self, args: TvVec, ret: TvId) -> TvId {
        self.push(TvKind::Lambda { args, ret })
    }

    pub fn new_struct(&mut self, flds: Vec<(&str, TvId)>, open: bool) -> TvId {
        let labels = flds.iter().map(|(l, _)| (*l).into()).collect();
        let args = flds.iter().map(|(_, tv)| *tv).collect();
        self.push(TvKind::Struct { labels, args, open })
    }

    pub fn new_nil(&mut self, child: TvId) -> TvId {
        self.push(TvKind::Nil { child })
    }

    pub fn new_clz(&mut self, clz: TvId, rhs: TvId) -> TvId {
        self.push(TvKind::Clz { clz, rhs })
    }

    pub fn new_err(&mut self, msg: &str) -> TvId {
        self.push(TvKind::Err { msgs: vec![msg.to_string()], kids: TvVec::new() })
    }

    /// Tie a placeholder leaf to an existing variable; used to close
    /// recursive structures during construction.
    pub fn unify_knot(&mut self, leaf: TvId, to: TvId) {
        debug_assert!(self.is_leaf(self.debug_find(leaf)));
        self.union(leaf, to);
    }

    // -----------------------------------------------------------------
    // Union-find

    pub fn unified(&self, id: TvId) -> bool {
        self.entries[id.0 as usize].uf.is_some()
    }

    /// Leader lookup without rollup; safe for printing.
    pub fn debug_find(&self, id: TvId) -> TvId {
        let mut cur = id;
        while let Some(next) = self.entries[cur.0 as usize].uf {
            cur = next;
        }
        cur
    }

    /// Leader lookup with full path compression.
    pub fn find(&mut self, id: TvId) -> TvId {
        let leader = self.debug_find(id);
        let mut cur = id;
        while cur != leader {
            let next = self.entries[cur.0 as usize].uf.expect("non-leader has a link");
            self.entries[cur.0 as usize].uf = Some(leader);
            cur = next;
        }
        leader
    }

    /// The leader's kind. `id` must be a leader.
    pub fn kind(&self, id: TvId) -> &TvKind {
        debug_assert!(!self.unified(id), "kind of a follower");
        &self.entries[id.0 as usize].kind
    }

    pub fn is_leaf(&self, id: TvId) -> bool {
        matches!(self.kind(id), TvKind::Leaf)
    }

    pub fn is_err(&self, id: TvId) -> bool {
        matches!(self.kind(id), TvKind::Err { .. })
    }

    fn set_kind(&mut self, id: TvId, kind: TvKind) {
        debug_assert!(!self.unified(id));
        self.entries[id.0 as usize].kind = kind;
    }

    /// Child at structural position `i`, rolled up.
    pub fn arg(&mut self, id: TvId, i: usize) -> Option<TvId> {
        let child = match self.kind(id) {
            TvKind::Ptr { obj } => (i == 0).then_some(*obj),
            TvKind::Lambda { args, ret } => {
                if i < args.len() {
                    Some(args[i])
                } else if i == args.len() {
                    Some(*ret)
                } else {
                    None
                }
            }
            TvKind::Struct { args, .. } => args.get(i).copied(),
            TvKind::Clz { clz, rhs } => match i {
                0 => Some(*clz),
                1 => Some(*rhs),
                _ => None,
            },
            TvKind::Nil { child } => (i == 0).then_some(*child),
            TvKind::Err { kids, .. } => kids.get(i).copied(),
            TvKind::Leaf | TvKind::Base(_) => None,
        }?;
        let rolled = self.find(child);
        if rolled != child {
            self.replace_child(id, i, rolled);
        }
        Some(rolled)
    }

    fn replace_child(&mut self, id: TvId, i: usize, with: TvId) {
        let kind = &mut self.entries[id.0 as usize].kind;
        match kind {
            TvKind::Ptr { obj } if i == 0 => *obj = with,
            TvKind::Lambda { args, ret } => {
                if i < args.len() {
                    args[i] = with;
                } else {
                    *ret = with;
                }
            }
            TvKind::Struct { args, .. } => args[i] = with,
            TvKind::Clz { clz, rhs } => {
                if i == 0 {
                    *clz = with;
                } else {
                    *rhs = with;
                }
            }
            TvKind::Nil { child } if i == 0 => *child = with,
            TvKind::Err { kids, .. } => kids[i] = with,
            _ => {}
        }
    }

    pub fn nargs(&self, id: TvId) -> usize {
        match self.kind(id) {
            TvKind::Ptr { .. } | TvKind::Nil { .. } => 1,
            TvKind::Lambda { args, .. } => args.len() + 1,
            TvKind::Struct { args, .. } => args.len(),
            TvKind::Clz { .. } => 2,
            TvKind::Err { kids, .. } => kids.len(),
            TvKind::Leaf | TvKind::Base(_) => 0,
        }
    }

    /// Union `this` into `that`: `that` survives as leader. Nil flags and
    /// widening merge monotonically; delayed lists migrate onto the
    /// survivor and the store queues; watchers land on the pending list.
    pub fn union(&mut self, this: TvId, that: TvId) -> bool {
        let this = self.find(this);
        let that = self.find(that);
        if this == that {
            return false;
        }
        debug_assert!(!self.unified(this) && !self.unified(that));
        if self.entries[this.0 as usize].may_nil {
            self.add_may_nil(that);
        }
        if self.entries[this.0 as usize].use_nil {
            self.add_use_nil(that);
        }
        let w = self.entries[this.0 as usize].widen;
        self.widen_raise_raw(that, w);

        // Delayed work follows the survivor and the global queues
        let dfs = std::mem::take(&mut self.entries[this.0 as usize].delay_fresh);
        for df in dfs {
            self.add_delay_fresh_on(that, df);
        }
        let drs = std::mem::take(&mut self.entries[this.0 as usize].delay_resolve);
        for dr in drs {
            self.add_delay_resolve_on(that, dr);
        }
        let moved: Vec<DelayFresh> = self.entries[that.0 as usize].delay_fresh.to_vec();
        for df in moved {
            if !self.delay_fresh.iter().any(|d| d.same(&df)) {
                self.delay_fresh.push(df);
            }
        }
        let movedr: Vec<TvId> = self.entries[that.0 as usize].delay_resolve.to_vec();
        for dr in movedr {
            if !self.delay_resolve.contains(&dr) {
                self.delay_resolve.push(dr);
            }
        }

        // Watching nodes: leaves keep accumulating, structure wakes them
        let this_deps = std::mem::take(&mut self.entries[this.0 as usize].deps);
        if matches!(self.entries[that.0 as usize].kind, TvKind::Leaf) {
            for d in this_deps {
                if !self.entries[that.0 as usize].deps.contains(&d) {
                    self.entries[that.0 as usize].deps.push(d);
                }
            }
        } else {
            self.pending_deps.extend(this_deps);
            let that_deps = std::mem::take(&mut self.entries[that.0 as usize].deps);
            self.pending_deps.extend(that_deps);
        }

        self.entries[this.0 as usize].uf = Some(that);
        true
    }

    // -----------------------------------------------------------------
    // Nil flags

    /// This variable might be nil. Returns progress; both flags at once
    /// is a nil violation.
    pub fn add_may_nil(&mut self, id: TvId) -> bool {
        let id = self.find(id);
        if self.entries[id.0 as usize].may_nil {
            return false;
        }
        self.entries[id.0 as usize].may_nil = true;
        if self.entries[id.0 as usize].use_nil {
            self.nil_errors.push(id);
        }
        self.wake_deps(id);
        true
    }

    /// This variable is dereferenced and must not be nil.
    pub fn add_use_nil(&mut self, id: TvId) -> bool {
        let id = self.find(id);
        if self.entries[id.0 as usize].use_nil {
            return false;
        }
        self.entries[id.0 as usize].use_nil = true;
        if self.entries[id.0 as usize].may_nil {
            self.nil_errors.push(id);
        }
        self.wake_deps(id);
        true
    }

    pub fn may_nil(&self, id: TvId) -> bool {
        self.entries[id.0 as usize].may_nil
    }

    pub fn use_nil(&self, id: TvId) -> bool {
        self.entries[id.0 as usize].use_nil
    }

    pub fn nil_violations(&self) -> &[TvId] {
        &self.nil_errors
    }

    // -----------------------------------------------------------------
    // Widening

    pub fn widen_of(&self, id: TvId) -> u8 {
        self.entries[id.0 as usize].widen
    }

    /// Raise the widen level; 2 means the variable escapes through the
    /// program root and bases must go to their widest type.
    pub fn widen_raise(&mut self, types: &mut TypeStore, id: TvId, level: u8) -> bool {
        let id = self.find(id);
        if !self.widen_raise_raw(id, level) {
            return false;
        }
        if level == 2 {
            if let TvKind::Base(ty) = *self.kind(id) {
                let wide = types.widen(ty);
                self.set_kind(id, TvKind::Base(wide));
            }
        }
        let n = self.nargs(id);
        for i in 0..n {
            if let Some(c) = self.arg(id, i) {
                self.widen_raise(types, c, level);
            }
        }
        true
    }

    fn widen_raise_raw(&mut self, id: TvId, level: u8) -> bool {
        let e = &mut self.entries[id.0 as usize];
        if e.widen >= level {
            return false;
        }
        e.widen = level;
        true
    }

    // -----------------------------------------------------------------
    // Node dependencies and delayed lists

    /// Re-run this node when the variable changes.
    pub fn deps_add(&mut self, id: TvId, n: NodeId) {
        let id = self.find(id);
        let deps = &mut self.entries[id.0 as usize].deps;
        if !deps.contains(&n) {
            deps.push(n);
        }
    }

    fn wake_deps(&mut self, id: TvId) {
        let deps = self.entries[id.0 as usize].deps.clone();
        self.pending_deps.extend(deps);
    }

    /// Nodes whose variables changed since the last drain.
    pub fn take_pending_deps(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.pending_deps)
    }

    pub(crate) fn add_delay_fresh_on(&mut self, id: TvId, df: DelayFresh) {
        let id = self.find(id);
        let list = &mut self.entries[id.0 as usize].delay_fresh;
        if !list.iter().any(|d| d.same(&df)) {
            list.push(df);
        }
    }

    pub(crate) fn add_delay_resolve_on(&mut self, id: TvId, tvs: TvId) {
        let id = self.find(id);
        let list = &mut self.entries[id.0 as usize].delay_resolve;
        if !list.contains(&tvs) {
            list.push(tvs);
        }
    }

    // -----------------------------------------------------------------
    // Printing

    /// Render a variable without side effects: no rollups, `$` breaks
    /// cycles, leaves print as Vnnn.
    pub fn str_of(&self, types: &TypeStore, id: TvId) -> String {
        let mut s = String::new();
        let mut visit = Vec::new();
        self.str_rec(types, id, &mut s, &mut visit);
        s
    }

    fn str_rec(&self, types: &TypeStore, id: TvId, s: &mut String, visit: &mut Vec<TvId>) {
        use std::fmt::Write;
        let id = self.debug_find(id);
        if visit.contains(&id) {
            s.push('$');
            return;
        }
        visit.push(id);
        if self.entries[id.0 as usize].may_nil {
            s.push('?');
        }
        match &self.entries[id.0 as usize].kind {
            TvKind::Leaf => {
                let _ = write!(s, "V{}", id.0);
            }
            TvKind::Base(ty) => s.push_str(&types.str_of(*ty)),
            TvKind::Ptr { obj } => {
                s.push('*');
                self.str_rec(types, *obj, s, visit);
            }
            TvKind::Lambda { args, ret } => {
                s.push_str("{ ");
                for a in args {
                    self.str_rec(types, *a, s, visit);
                    s.push(' ');
                }
                s.push_str("-> ");
                self.str_rec(types, *ret, s, visit);
                s.push_str(" }");
            }
            TvKind::Struct { labels, args, open } => {
                s.push_str("@{");
                for (l, a) in labels.iter().zip(args.iter()) {
                    let _ = write!(s, " {}=", l);
                    self.str_rec(types, *a, s, visit);
                    s.push(';');
                }
                if *open {
                    s.push_str(" ...");
                }
                s.push_str(" }");
            }
            TvKind::Clz { clz, rhs } => {
                self.str_rec(types, *clz, s, visit);
                s.push(':');
                self.str_rec(types, *rhs, s, visit);
            }
            TvKind::Nil { child } => {
                s.push('0');
                s.push('&');
                self.str_rec(types, *child, s, visit);
            }
            TvKind::Err { msgs, .. } => {
                let _ = write!(s, "[Err {}]", msgs.join("; "));
            }
        }
        visit.pop();
    }

    // -----------------------------------------------------------------
    // Error reporting

    /// Messages of every Err leader, for end-of-fixpoint aggregation.
    pub fn err_msgs(&self) -> Vec<String> {
        let mut out = Vec::new();
        for i in 0..self.entries.len() {
            let e = &self.entries[i];
            if e.uf.is_none() {
                if let TvKind::Err { msgs, .. } = &e.kind {
                    out.extend(msgs.iter().cloned());
                }
            }
        }
        out
    }
}

impl Default for TvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_idempotent() {
        let mut tvs = TvStore::new();
        let a = tvs.new_leaf();
        let b = tvs.new_leaf();
        let c = tvs.new_leaf();
        tvs.union(a, b);
        tvs.union(b, c);
        let f = tvs.find(a);
        assert_eq!(tvs.find(f), f);
        assert_eq!(tvs.find(a), tvs.find(b));
        assert_eq!(tvs.find(b), tvs.find(c));
    }

    #[test]
    fn test_path_compression() {
        let mut tvs = TvStore::new();
        let a = tvs.new_leaf();
        let b = tvs.new_leaf();
        let c = tvs.new_leaf();
        tvs.union(a, b);
        tvs.union(b, c);
        let leader = tvs.find(a);
        // After rollup, a points straight at the leader
        assert_eq!(tvs.entries[a.0 as usize].uf, Some(leader));
    }

    #[test]
    fn test_union_moves_flags() {
        let mut tvs = TvStore::new();
        let a = tvs.new_leaf();
        let b = tvs.new_leaf();
        tvs.add_may_nil(a);
        tvs.union(a, b);
        let l = tvs.find(b);
        assert!(tvs.may_nil(l));
    }

    #[test]
    fn test_nil_violation() {
        let mut tvs = TvStore::new();
        let a = tvs.new_leaf();
        tvs.add_may_nil(a);
        tvs.add_use_nil(a);
        assert_eq!(tvs.nil_violations().len(), 1);
    }

    #[test]
    fn test_union_keeps_max_widen() {
        let mut tvs = TvStore::new();
        let mut types = TypeStore::new();
        let a = tvs.new_leaf();
        let b = tvs.new_leaf();
        tvs.widen_raise(&mut types, a, 2);
        tvs.union(a, b);
        let b_root = tvs.find(b);
        assert_eq!(tvs.widen_of(b_root), 2);
    }

    #[test]
    fn test_base_widens_at_level_2() {
        let mut tvs = TvStore::new();
        let mut types = TypeStore::new();
        let five = types.int_con(5);
        let b = tvs.new_base(five);
        tvs.widen_raise(&mut types, b, 2);
        match tvs.kind(b) {
            TvKind::Base(ty) => assert_eq!(*ty, types.t().int64),
            _ => panic!("expected a base"),
        }
    }
}
