use super::*;
use crate::ir::{Kernel, ReduceOp};
use crate::kernelize::{kernelize, KernelizeOptions};
use crate::shape::{shape_of, SInt, Variable};

fn schedule(g: &mut Graph, sink: NodeId) -> Schedule {
    let k = kernelize(g, sink, &KernelizeOptions::default()).unwrap();
    create_schedule(g, k).unwrap()
}

fn buf_id(g: &Graph, b: NodeId) -> u64 {
    g.buffer_arg(b).unwrap().0
}

/// Every item runs after the items that write its inputs.
fn assert_topological(s: &Schedule) {
    let items: Vec<&ScheduleItem> = s.items.iter().collect();
    for (i, item) in items.iter().enumerate() {
        for input in &item.bufs[1..] {
            for (j, other) in items.iter().enumerate() {
                if other.bufs[0].aliases(input) && j != i {
                    assert!(j < i, "item {} reads what item {} writes", i, j);
                }
            }
        }
    }
}

#[test]
fn test_single_kernel_buffers() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let b = g.buffer("HOST", DType::F32, 16);
    let c = g.binary(Op::Add, a, b).unwrap();
    let d = g.binary(Op::Mul, c, b).unwrap();
    let r = g.reshape(d, &shape_of(&[4, 4])).unwrap();
    let sum = g.reduce(r, ReduceOp::Add, &[1]).unwrap();
    let sink = g.sink(vec![sum]);
    let s = schedule(&mut g, sink);

    assert_eq!(s.len(), 1);
    let item = &s.items[0];
    assert_eq!(item.bufs.len(), 3);
    assert_eq!(item.bufs[0].size, 4);
    assert_eq!(item.bufs[1].id, buf_id(&g, a));
    assert_eq!(item.bufs[2].id, buf_id(&g, b));
    assert_eq!(item.name(&g), "k_4_4");
    assert!(s.var_vals.is_empty());
}

#[test]
fn test_producer_runs_first() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let c = g.unary(Op::Exp2, a).unwrap();
    let e = g.unary(Op::Neg, c).unwrap();
    let n = g.unary(Op::Sqrt, c).unwrap();
    let out = g.binary(Op::Add, e, n).unwrap();
    let sink = g.sink(vec![out]);
    let s = schedule(&mut g, sink);

    assert_eq!(s.len(), 2);
    assert_eq!(s.items[0].bufs[1].id, buf_id(&g, a));
    assert!(s.items[1].bufs[1].aliases(&s.items[0].bufs[0]));
    assert_topological(&s);
}

#[test]
fn test_copy_chain_order() {
    let mut g = Graph::new();
    let a = g.buffer("HOST:0", DType::F32, 8);
    let x = g.unary(Op::Exp2, a).unwrap();
    let y = g.copy_to(x, "HOST:1");
    let z = g.unary(Op::Neg, y).unwrap();
    let sink = g.sink(vec![z]);
    let s = schedule(&mut g, sink);

    let names: Vec<String> = s.items.iter().map(|i| i.name(&g)).collect();
    assert_eq!(names, vec!["k_8", "copy", "k_8"]);
    assert_eq!(s.items[1].bufs[0].device, "HOST:1");
    assert_eq!(s.items[1].bufs[1].device, "HOST:0");
    assert_topological(&s);
}

#[test]
fn test_independent_outputs_keep_discovery_order() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 4);
    let x = g.unary(Op::Exp2, a).unwrap();
    let y = g.unary(Op::Log2, a).unwrap();
    let sink = g.sink(vec![x, y]);
    let s = schedule(&mut g, sink);
    assert_eq!(s.len(), 2);
    assert_eq!(s.items[0].bufs[1].id, buf_id(&g, a));
    assert_ne!(s.items[0].bufs[0].id, s.items[1].bufs[0].id);
}

#[test]
fn test_buffer_view_input() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let w = g.shrink(a, &[(SInt::Const(4), SInt::Const(12))]).unwrap();
    let c = g.contiguous(w);
    let e = g.unary(Op::Exp2, c).unwrap();
    let sink = g.sink(vec![e]);
    let s = schedule(&mut g, sink);

    assert_eq!(s.len(), 1);
    let input = &s.items[0].bufs[1];
    assert_eq!(input.id, buf_id(&g, a));
    assert_eq!((input.size, input.offset, input.base_size), (8, 4, 16));
}

#[test]
fn test_bindings_collected() {
    let mut g = Graph::new();
    let n = Variable::new("n", 1, 16);
    let a = g.buffer("HOST", DType::F32, 16);
    let w = g.shrink(a, &[(SInt::Const(0), n.bind(5))]).unwrap();
    let e = g.unary(Op::Exp2, w).unwrap();
    let sink = g.sink(vec![e]);
    let s = schedule(&mut g, sink);

    assert_eq!(s.var_vals.get(&n), Some(&5));
    assert_eq!(s.items[0].fixedvars.get(&n), Some(&5));
    // Bind sources are not buffers.
    assert_eq!(s.items[0].bufs.len(), 2);
}

#[test]
fn test_invalid_kernel_input() {
    let mut g = Graph::new();
    let out = g.buffer("HOST", DType::F32, 4);
    let var = g.define_var(&Variable::new("i", 0, 3));
    let dev = g.device_node("HOST");
    let ast = g.new_node(Op::Sink, DType::Void, vec![], Arg::None);
    let kernel = g.new_node(
        Op::Kernel,
        DType::Void,
        vec![out, var],
        Arg::Kernel(Box::new(Kernel {
            ast,
            metadata: vec![],
        })),
    );
    let store = g.store(out, kernel);
    let sink = g.sink(vec![store, dev]);
    assert_eq!(
        create_schedule(&g, sink).unwrap_err(),
        GraphError::InvalidKernelInput(Op::DefineVar)
    );
}

#[test]
fn test_linearize_breadth_first() {
    let mut deps: DiGraph<&str, ()> = DiGraph::new();
    let a = deps.add_node("a");
    let b = deps.add_node("b");
    let c = deps.add_node("c");
    let d = deps.add_node("d");
    deps.add_edge(a, c, ());
    deps.add_edge(a, b, ());
    deps.add_edge(b, d, ());
    deps.add_edge(c, d, ());
    assert_eq!(linearize(&deps).unwrap(), vec![a, c, b, d]);
}

#[test]
fn test_linearize_reports_cycles() {
    let mut deps: DiGraph<&str, ()> = DiGraph::new();
    let a = deps.add_node("a");
    let b = deps.add_node("b");
    let c = deps.add_node("c");
    deps.add_edge(a, b, ());
    deps.add_edge(b, a, ());
    deps.add_edge(c, a, ());
    assert_eq!(
        linearize(&deps).unwrap_err(),
        GraphError::ScheduleCycle { remaining: 2 }
    );
}
