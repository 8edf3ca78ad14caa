// src/commands/inspect.rs
//
// Build one of the demo graphs, run the fixpoint, and dump what the
// analysis concluded: per-node flow values, liveness on request, the
// inferred type variables, and any diagnostics.

use std::process::ExitCode;

use crate::cli::Demo;
use crate::errors::collect_errors;
use crate::graph::{GraphBuilder, NodeId};
use crate::opt::Driver;
use crate::Universe;

pub fn inspect_demo(demo: Demo, show_live: bool) -> ExitCode {
    let mut u = Universe::new();
    let named = build_demo(&mut u, demo);

    let mut driver = Driver::new();
    let stats = driver.run(&mut u);
    println!(
        "fixpoint: {} rounds, {} flow steps, {} unify steps",
        stats.rounds, stats.flow_steps, stats.unify_steps
    );

    for (name, n) in &named {
        if u.nodes.node(*n).dead {
            println!("{:>8}  (folded away)", name);
            continue;
        }
        let val = u.nodes.node(*n).val;
        print!("{:>8}  {:<10} val={}", name, u.nodes.xstr(*n), u.types.str_of(val));
        if show_live {
            print!("  live={}", u.types.str_of(u.nodes.node(*n).live));
        }
        if let Some(tv) = u.nodes.node(*n).tv {
            print!("  tv={}", u.tvs.str_of(&u.types, tv));
        }
        println!();
    }

    let errs = collect_errors(&u);
    for e in errs.iter() {
        eprintln!("error: {}", e);
    }
    if errs.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn build_demo(u: &mut Universe, demo: Demo) -> Vec<(&'static str, NodeId)> {
    let mut b = GraphBuilder::new(u);
    match demo {
        Demo::Constant => {
            let allmem = b.types.t().allmem;
            let five = b.types.int_con(5);
            let mem = b.new_con(allmem);
            let rez = b.new_con(five);
            let scope = b.new_scope(mem, rez);
            vec![("mem", mem), ("rez", rez), ("scope", scope)]
        }
        Demo::NewStore => {
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
            vec![("mem0", mem0), ("obj", obj), ("ptr", ptr), ("mem", mem), ("scope", scope)]
        }
        Demo::Inline => {
            let start = b.new_start();
            let smem = b.new_start_mem(start);
            // id(x) { return x }
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
            let scope = b.new_scope(cmem, rez);
            vec![("fun", fun), ("ret", ret), ("call", call), ("cepi", cepi), ("rez", rez), ("scope", scope)]
        }
        Demo::IfNil => {
            let t = b.types.t();
            let start = b.new_start();
            let pred = b.new_con(t.nint64);
            let iff = b.new_if(start, pred);
            let fals = b.new_cproj(iff, 0);
            b.nodes.keep(fals); // dead side; pinned so the dump can show it
            let tru = b.new_cproj(iff, 1);
            let memc = b.new_con(t.allmem);
            let scope = b.new_scope(memc, tru);
            vec![("pred", pred), ("if", iff), ("false", fals), ("true", tru), ("scope", scope)]
        }
        Demo::PolyId => {
            let t = b.types.t();
            // let id = \x.x in (id 3, id "ptr-ish")
            let x = b.tvs.new_leaf();
            let id_tv = b.tvs.new_lambda(crate::tvar::TvVec::from_slice(&[x]), x);
            let nongen = std::rc::Rc::new(Vec::new());
            let int_arg = b.tvs.new_base(t.int64);
            let r1 = b.tvs.new_leaf();
            let site1 = b.tvs.new_lambda(crate::tvar::TvVec::from_slice(&[int_arg]), r1);
            b.tvs.fresh_unify(b.types, None, id_tv, site1, &nongen);
            let obj = b.tvs.new_leaf();
            let ptr_arg = b.tvs.new_ptr(obj);
            let r2 = b.tvs.new_leaf();
            let site2 = b.tvs.new_lambda(crate::tvar::TvVec::from_slice(&[ptr_arg]), r2);
            b.tvs.fresh_unify(b.types, None, id_tv, site2, &nongen);
            // Hang the variables off pinned constants so the dump shows
            // them after the dead-code sweep
            let c1 = b.new_con(t.any);
            b.nodes.node_mut(c1).tv = Some(id_tv);
            b.nodes.keep(c1);
            let c2 = b.new_con(t.any);
            b.nodes.node_mut(c2).tv = Some(r1);
            b.nodes.keep(c2);
            let c3 = b.new_con(t.any);
            b.nodes.node_mut(c3).tv = Some(r2);
            b.nodes.keep(c3);
            vec![("id", c1), ("at-int", c2), ("at-ptr", c3)]
        }
    }
}
