// tests/fixpoint.rs
//
// End-to-end driver scenarios: small graphs through the full fixpoint,
// checking flow values, liveness, inlining, freezing across fidx splits
// and polymorphic inference.

use std::rc::Rc;

use stoat::graph::{GraphBuilder, NodeId, Op, PrimOp};
use stoat::opt::Driver;
use stoat::tvar::{TvKind, TvVec};
use stoat::types::TypeKind;
use stoat::Universe;

fn run(u: &mut Universe) -> stoat::opt::FixpointStats {
    let mut d = Driver::new();
    d.run(u)
}

// S1: return the constant 5; liveness stays minimal.
#[test]
fn test_constant_return() {
    let mut u = Universe::new();
    let mut b = GraphBuilder::new(&mut u);
    let allmem = b.types.t().allmem;
    let five = b.types.int_con(5);
    let mem = b.new_con(allmem);
    let rez = b.new_con(five);
    let scope = b.new_scope(mem, rez);

    run(&mut u);

    let t = u.types.t();
    assert_eq!(u.nodes.node(scope).live, t.anymem);
    assert_eq!(u.nodes.node(rez).live, t.all);
    assert_eq!(u.nodes.node(rez).val, five);
}

// S2: allocate a struct, store it, return the pointer; the pointer
// escapes and the memory it reaches is live.
#[test]
fn test_new_store() {
    let mut u = Universe::new();
    let mut b = GraphBuilder::new(&mut u);
    let anymem = b.types.t().anymem;
    let five = b.types.int_con(5);
    let nine = b.types.int_con(9);
    let mem0 = b.new_con(anymem);
    let fdx = b.new_con(five);
    let fdy = b.new_con(nine);
    let obj = b.new_struct(vec![("x", fdx), ("y", fdy)]);
    let ptr = b.new_new();
    let mem = b.new_store(mem0, ptr, obj);
    let scope = b.new_scope(mem, ptr);

    run(&mut u);

    let t = u.types.t();
    let mem_val = u.nodes.node(mem).val;
    let expected_live = u.types.flatten_live_fields(mem_val);
    assert_eq!(u.nodes.node(scope).live, expected_live);
    assert_eq!(u.nodes.node(ptr).live, t.all);
    assert_eq!(u.nodes.node(fdx).live, t.all);
    // The stored object is visible through the pointer
    let got = u.types.mem_ld(mem_val, u.nodes.node(ptr).val);
    assert_eq!(got, u.nodes.node(obj).val);
}

// S3: a call to a single-use identity function collapses: the CallEpi
// becomes a copy, and the callee vanishes from the graph.
#[test]
fn test_trivial_inline() {
    let mut u = Universe::new();
    let mut b = GraphBuilder::new(&mut u);
    let start = b.new_start();
    let smem = b.new_start_mem(start);
    let fun = b.new_fun(1);
    let _pmem = b.new_parm(fun, 1);
    let parg = b.new_parm(fun, 3);
    let ret = b.new_ret(fun, _pmem, parg, fun);
    let fptr = b.new_funptr(fun);
    let seven = b.types.int_con(7);
    let arg = b.new_con(seven);
    let call = b.new_call(start, smem, fptr, &[arg]);
    let cepi = b.new_callepi(call, None);
    let cmem = b.new_proj(cepi, 1);
    let rez = b.new_proj(cepi, 2);
    let scope = b.new_scope(cmem, rez);

    run(&mut u);

    // The scope result is the call argument; control and memory come
    // straight from the call site
    assert_eq!(u.nodes.def(scope, 0), Some(smem));
    assert_eq!(u.nodes.def(scope, 1), Some(arg));
    // The callee is gone
    assert!(u.nodes.node(fun).dead);
    assert!(u.nodes.node(ret).dead);
    assert!(u.nodes.node(cepi).dead);
    let _ = (call, rez);
}

// S4: a branch on a nil-excluded predicate folds to the true side.
#[test]
fn test_if_nil_excluded() {
    let mut u = Universe::new();
    let mut b = GraphBuilder::new(&mut u);
    let t0 = b.types.t();
    let start = b.new_start();
    let pred = b.new_con(t0.nint64);
    let iff = b.new_if(start, pred);
    let fals = b.new_cproj(iff, 0);
    b.nodes.keep(fals);
    let tru = b.new_cproj(iff, 1);
    let memc = b.new_con(t0.allmem);
    let scope = b.new_scope(memc, tru);

    run(&mut u);

    let t = u.types.t();
    assert_eq!(u.nodes.node(iff).val, t.if_true);
    // The live branch is a copy of the If's control input
    assert_eq!(u.nodes.is_copy(&u.types, iff, 1), Some(start));
    assert_eq!(u.nodes.is_copy(&u.types, iff, 0), None);
    // The projection folded through to the control
    assert_eq!(u.nodes.def(scope, 1), Some(start));
    assert!(u.nodes.node(tru).dead);
    // The dead branch computes dead control
    assert_eq!(u.nodes.node(fals).val, t.xctrl);
}

// S5: after a fidx split, the CallEpi freezes until both halves are
// wired, then resumes its descent.
#[test]
fn test_fidx_split_freeze() {
    let mut u = Universe::new();

    // Callee A: x + 1 + 1 (two ops, so no trivial inline)
    let (fun_a, _ret_a, fidx_a, call, cepi, fptr_slot) = {
        let mut b = GraphBuilder::new(&mut u);
        let start = b.new_start();
        let smem = b.new_start_mem(start);
        let fun = b.new_fun(1);
        let pmem = b.new_parm(fun, 1);
        let parg = b.new_parm(fun, 3);
        let one = b.types.int_con(1);
        let c1 = b.new_con(one);
        let add1 = b.new_prim(PrimOp::Add, parg, c1);
        let add2 = b.new_prim(PrimOp::Add, add1, c1);
        let ret = b.new_ret(fun, pmem, add2, fun);
        let fptr = b.new_funptr(fun);
        let i64t = b.types.t().int64;
        let arg = b.new_con(i64t);
        let call = b.new_call(start, smem, fptr, &[arg]);
        let cepi = b.new_callepi(call, None);
        let cmem = b.new_proj(cepi, 1);
        let rezp = b.new_proj(cepi, 2);
        let _scope = b.new_scope(cmem, rezp);
        let fidx = match b.nodes.node(fun).op {
            Op::Fun { fidx, .. } => fidx,
            _ => unreachable!(),
        };
        (fun, ret, fidx, call, cepi, fptr)
    };

    run(&mut u);
    let v1 = u.nodes.node(cepi).val;
    let rez1 = match u.types.kind(v1) {
        TypeKind::Tuple { ts } => ts[2],
        _ => panic!("expected a call tuple"),
    };
    assert_eq!(rez1, u.types.t().int64);

    // Split A's fidx twice: the old id becomes a pure parent of two
    // halves, and the call now types with the parent set
    let kid_b = u.nodes.split_fidx(&mut u.types, fun_a);
    let kid_c = u.nodes.split_fidx(&mut u.types, fun_a);
    let (fun_c, ret_c) = {
        let mut b = GraphBuilder::new(&mut u);
        let fun = b.new_fun_with_fidx(kid_c, 1);
        let pmem = b.new_parm(fun, 1);
        let _parg = b.new_parm(fun, 3);
        let half = b.types.flt_con(2.5);
        let c = b.new_con(half);
        let ret = b.new_ret(fun, pmem, c, fun);
        (fun, ret)
    };
    u.nodes.keep(ret_c); // not wired yet; hold it through the freeze run
    // Re-home callee A onto the first half
    u.nodes.set_fidx(fun_a, kid_b);
    // The call's function pointer now names the split parent, which
    // covers both halves
    let parent_ptr = {
        let t = u.types.t();
        u.types.funptr_make(stoat::bits::BitsFun::make_const(fidx_a), 1, t.any, t.scalar)
    };
    let mut b = GraphBuilder::new(&mut u);
    let newf = b.new_con(parent_ptr);
    b.nodes.set_def(call, stoat::graph::FPTR_IDX, Some(newf));
    let _ = fptr_slot;

    // Only one half is wired: the value freezes in place
    run(&mut u);
    assert_eq!(u.nodes.node(cepi).val, v1);

    // Wire the second half by hand (the clone machinery would), and the
    // value resumes its monotone descent
    {
        let mut work = stoat::opt::Work::new();
        u.nodes.wire(&mut u.types, &mut work, call, fun_c, ret_c, cepi);
        u.nodes.unkeep(ret_c);
    }
    let stats = run(&mut u);
    assert_eq!(stats.non_monotone, 0);
    let v2 = u.nodes.node(cepi).val;
    assert_ne!(v2, v1);
    let rez2 = match u.types.kind(v2) {
        TypeKind::Tuple { ts } => ts[2],
        _ => panic!("expected a call tuple"),
    };
    // int-returning half meets float-returning half: down to scalar
    assert_eq!(rez2, u.types.t().scalar);
}

// S6: the polymorphic identity keeps its generic shape while each use
// site gets its own instantiation.
#[test]
fn test_polymorphic_identity() {
    let mut u = Universe::new();
    let t = u.types.t();
    let x = u.tvs.new_leaf();
    let id_tv = u.tvs.new_lambda(TvVec::from_slice(&[x]), x);
    let nongen = Rc::new(Vec::new());

    let int_arg = u.tvs.new_base(t.int64);
    let r1 = u.tvs.new_leaf();
    let site1 = u.tvs.new_lambda(TvVec::from_slice(&[int_arg]), r1);
    u.tvs.fresh_unify(&mut u.types, None, id_tv, site1, &nongen);

    let obj = u.tvs.new_leaf();
    let ptr_arg = u.tvs.new_ptr(obj);
    let r2 = u.tvs.new_leaf();
    let site2 = u.tvs.new_lambda(TvVec::from_slice(&[ptr_arg]), r2);
    u.tvs.fresh_unify(&mut u.types, None, id_tv, site2, &nongen);

    // Each site's result equals its argument
    assert_eq!(u.tvs.find(r1), u.tvs.find(int_arg));
    assert_eq!(u.tvs.find(r2), u.tvs.find(ptr_arg));
    // The generic identity is still Leaf -> Leaf
    let g = u.tvs.find(id_tv);
    let ga = u.tvs.arg(g, 0).unwrap();
    let gr = u.tvs.arg(g, 1).unwrap();
    assert_eq!(ga, gr);
    assert!(matches!(u.tvs.kind(ga), TvKind::Leaf));
}

// Values only fall and liveness only rises across the whole run.
#[test]
fn test_monotonic() {
    let mut u = Universe::new();
    let mut b = GraphBuilder::new(&mut u);
    let anymem = b.types.t().anymem;
    let five = b.types.int_con(5);
    let nine = b.types.int_con(9);
    let mem0 = b.new_con(anymem);
    let fdx = b.new_con(five);
    let fdy = b.new_con(nine);
    let obj = b.new_struct(vec![("x", fdx), ("y", fdy)]);
    let ptr = b.new_new();
    let mem = b.new_store(mem0, ptr, obj);
    let _scope = b.new_scope(mem, ptr);

    let stats = run(&mut u);
    assert_eq!(stats.non_monotone, 0);
}

// The fixpoint drains within a small multiple of the graph size.
#[test]
fn test_termination_bound() {
    let mut u = Universe::new();
    let mut b = GraphBuilder::new(&mut u);
    let start = b.new_start();
    let smem = b.new_start_mem(start);
    let fun = b.new_fun(1);
    let pmem = b.new_parm(fun, 1);
    let parg = b.new_parm(fun, 3);
    let ret = b.new_ret(fun, pmem, parg, fun);
    let fptr = b.new_funptr(fun);
    let seven = b.types.int_con(7);
    let arg = b.new_con(seven);
    let call = b.new_call(start, smem, fptr, &[arg]);
    let cepi = b.new_callepi(call, None);
    let cmem = b.new_proj(cepi, 1);
    let rez = b.new_proj(cepi, 2);
    let _scope = b.new_scope(cmem, rez);
    let _ = (ret,);

    let n = u.nodes.len();
    let stats = run(&mut u);
    // nodes x a generous stand-in for lattice height
    assert!(stats.flow_steps <= n * 64, "flow took {} steps for {} nodes", stats.flow_steps, n);
}

// Wiring then unwiring restores the def/use edges exactly.
#[test]
fn test_wire_unwire_round_trip() {
    let mut u = Universe::new();
    let (call, fun, ret, cepi) = {
        let mut b = GraphBuilder::new(&mut u);
        let start = b.new_start();
        let smem = b.new_start_mem(start);
        let fun = b.new_fun(1);
        let pmem = b.new_parm(fun, 1);
        let parg = b.new_parm(fun, 3);
        let ret = b.new_ret(fun, pmem, parg, fun);
        let fptr = b.new_funptr(fun);
        let seven = b.types.int_con(7);
        let arg = b.new_con(seven);
        let call = b.new_call(start, smem, fptr, &[arg]);
        let cepi = b.new_callepi(call, None);
        (call, fun, ret, cepi)
    };

    let snapshot = |u: &Universe| -> Vec<(Vec<Option<NodeId>>, Vec<NodeId>)> {
        (0..u.nodes.len() as u32)
            .map(stoat::graph::NodeId)
            .map(|id| {
                let n = u.nodes.node(id);
                let mut uses: Vec<NodeId> = n.uses.to_vec();
                uses.sort_by_key(|x| x.0);
                (n.defs.to_vec(), uses)
            })
            .collect()
    };
    let before = snapshot(&u);

    let mut work = stoat::opt::Work::new();
    u.nodes.wire(&mut u.types, &mut work, call, fun, ret, cepi);
    assert_eq!(u.nodes.nwired(cepi), 1);
    u.nodes.unwire(&mut u.types, &mut work, cepi, ret);
    assert_eq!(u.nodes.nwired(cepi), 0);

    let after = snapshot(&u);
    for (i, (b, a)) in before.iter().zip(after.iter()).enumerate() {
        assert_eq!(b, a, "node {} edges changed across wire/unwire", i);
    }
}
