use std::collections::HashSet;

use super::*;
use crate::ir::{Arg, DType, Metadata, Op, ReduceOp};
use crate::rewrite::{Order, DEFAULT_MAX_STEPS};
use crate::shape::{shape_of, SInt, VarVals, Variable};

fn s(dims: &[i64]) -> Vec<SInt> {
    shape_of(dims)
}

fn run(g: &mut Graph, sink: NodeId) -> NodeId {
    kernelize(g, sink, &KernelizeOptions::default()).unwrap()
}

fn normalized(g: &mut Graph, sink: NodeId) -> NodeId {
    merge_views::<()>()
        .then("early rules", early_rules())
        .rewrite(g, sink, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .unwrap()
        .root
}

fn kernels(g: &Graph, root: NodeId) -> Vec<NodeId> {
    g.toposort(root)
        .into_iter()
        .filter(|&n| g.op(n) == Op::Kernel)
        .collect()
}

fn count(g: &Graph, root: NodeId, op: Op) -> usize {
    g.toposort(root).into_iter().filter(|&n| g.op(n) == op).count()
}

fn ast(g: &Graph, kernel: NodeId) -> NodeId {
    g.node(kernel).kernel().unwrap().ast
}

/// The AST only touches placeholders, never a concrete buffer or device.
fn assert_closed(g: &Graph, kernel: NodeId) {
    for n in g.toposort(ast(g, kernel)) {
        let op = g.op(n);
        assert!(
            !matches!(op, Op::Buffer | Op::BufferView | Op::Device | Op::Kernel | Op::Bind),
            "{} leaked into kernel AST",
            op
        );
        if let Some(st) = g.node(n).st() {
            assert!(!st.has_bound_vars(), "bound view {} in kernel AST", st);
        }
        if op == Op::Const {
            assert!(g.src(n).is_empty());
        }
        if op == Op::Store {
            assert_eq!(g.op(g.base(g.src(n)[0])), Op::DefineGlobal);
        }
    }
}

/// `(a + b) * b`, reshaped to 4x4 and summed over the last axis.
fn scenario_a(g: &mut Graph) -> (NodeId, NodeId, NodeId) {
    let a = g.buffer("HOST", DType::F32, 16);
    let b = g.buffer("HOST", DType::F32, 16);
    let c = g.binary(Op::Add, a, b).unwrap();
    let d = g.binary(Op::Mul, c, b).unwrap();
    let r = g.reshape(d, &s(&[4, 4])).unwrap();
    let sum = g.reduce(r, ReduceOp::Add, &[1]).unwrap();
    (a, b, g.sink(vec![sum]))
}

// ─── Normalizer ────────────────────────────────────────────────────

#[test]
fn test_movement_chain_becomes_one_view() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 24);
    let r = g.reshape(a, &s(&[2, 3, 4])).unwrap();
    let p = g.permute(r, &[2, 0, 1]).unwrap();
    let f = g.flip(p, &[0]).unwrap();
    let e = g.unary(Op::Exp2, f).unwrap();
    let root = normalized(&mut g, e);

    assert_eq!(g.op(root), Op::Exp2);
    let v = g.src(root)[0];
    assert_eq!(g.op(v), Op::View);
    assert_eq!(g.src(v), &[a]);
    assert_eq!(g.shape(v), Some(s(&[4, 2, 3]).as_slice()));
}

#[test]
fn test_noop_view_is_dropped() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 24);
    let r1 = g.reshape(a, &s(&[2, 12])).unwrap();
    let r2 = g.reshape(r1, &s(&[24])).unwrap();
    assert_eq!(normalized(&mut g, r2), a);
}

#[test]
fn test_early_rules() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 8);
    let d = g.detach(a);
    let c = g.copy_to(d, "HOST");
    let e = g.unary(Op::Neg, c).unwrap();
    let root = normalized(&mut g, e);
    let expected = g.unary(Op::Neg, a).unwrap();
    assert_eq!(root, expected);
}

#[test]
fn test_view_left_is_idempotent() {
    let mut g = Graph::new();
    let (_, _, sink) = scenario_a(&mut g);
    let once = view_left::<()>()
        .rewrite(&mut g, sink, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .unwrap();
    assert!(once.steps > 0);
    let twice = view_left::<()>()
        .rewrite(&mut g, once.root, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .unwrap();
    assert_eq!(twice.root, once.root);
    assert_eq!(twice.steps, 0);
}

#[test]
fn test_view_pushed_through_elementwise() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 6);
    let b = g.buffer("HOST", DType::F32, 6);
    let c = g.binary(Op::Add, a, b).unwrap();
    let r = g.reshape(c, &s(&[2, 3])).unwrap();
    let p = g.permute(r, &[1, 0]).unwrap();
    let root = view_left::<()>()
        .rewrite(&mut g, p, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .unwrap()
        .root;

    assert_eq!(g.op(root), Op::Add);
    for &v in g.src(root) {
        assert_eq!(g.op(v), Op::View);
        assert_eq!(g.shape(v), Some(s(&[3, 2]).as_slice()));
    }
    assert_eq!(g.src(g.src(root)[0]), &[a]);
    assert_eq!(g.src(g.src(root)[1]), &[b]);
}

#[test]
fn test_reduce_swizzle() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 24);
    let r = g.reshape(a, &s(&[2, 3, 4])).unwrap();
    let sum = g.reduce(r, ReduceOp::Add, &[2]).unwrap();
    let p = g.permute(sum, &[1, 0, 2]).unwrap();
    let root = view_left::<()>()
        .rewrite(&mut g, p, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .unwrap()
        .root;

    // A contiguous reshape over the moved reduction.
    assert_eq!(g.op(root), Op::View);
    assert!(g.node(root).st().unwrap().contiguous());
    assert_eq!(g.shape(root), Some(s(&[3, 2, 1]).as_slice()));
    let red = g.src(root)[0];
    assert_eq!(g.op(red), Op::ReduceAxis);
    assert_eq!(g.node(red).reduce_arg(), Some((ReduceOp::Add, &[3usize][..])));
    let inner = g.src(red)[0];
    assert_eq!(g.op(inner), Op::View);
    assert_eq!(g.src(inner), &[a]);
    assert_eq!(g.shape(inner), Some(s(&[3, 2, 1, 4]).as_slice()));
}

#[test]
fn test_contiguous_view_over_reduce_stays() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let r = g.reshape(a, &s(&[4, 4])).unwrap();
    let sum = g.reduce(r, ReduceOp::Max, &[1]).unwrap();
    let flat = g.reshape(sum, &s(&[4])).unwrap();
    let root = view_left::<()>()
        .rewrite(&mut g, flat, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .unwrap()
        .root;
    assert_eq!(g.op(root), Op::View);
    let red = g.src(root)[0];
    assert_eq!(g.node(red).reduce_arg(), Some((ReduceOp::Max, &[1usize][..])));
}

#[test]
fn test_swizzle_rejects_leading_reduce_axes() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 24);
    let r = g.reshape(a, &s(&[2, 3, 4])).unwrap();
    let red = g.new_node(
        Op::ReduceAxis,
        DType::F32,
        vec![r],
        Arg::Reduce {
            op: ReduceOp::Add,
            axes: vec![0],
        },
    );
    let p = g.permute(red, &[0, 2, 1]).unwrap();
    let err = view_left::<()>()
        .rewrite(&mut g, p, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .unwrap_err();
    assert_eq!(
        err,
        GraphError::ReduceAxisOrder {
            axes: vec![0],
            ndim: 3
        }
    );
}

// ─── Realization ───────────────────────────────────────────────────

fn fanout_graph(g: &mut Graph) -> (NodeId, NodeId) {
    let a = g.buffer("HOST", DType::F32, 16);
    let b = g.buffer("HOST", DType::F32, 16);
    let c = g.binary(Op::Add, a, b).unwrap();
    let e = g.unary(Op::Exp2, c).unwrap();
    let n = g.unary(Op::Neg, c).unwrap();
    let out = g.binary(Op::Mul, e, n).unwrap();
    (c, g.sink(vec![out]))
}

#[test]
fn test_fanout_is_realized() {
    let mut g = Graph::new();
    let (c, sink) = fanout_graph(&mut g);
    let root = normalized(&mut g, sink);
    let out = g.src(root)[0];

    let realizes = select_realizes(&g, root, &RealizePolicy::default());
    let expected: HashSet<NodeId> = [c, out].into_iter().collect();
    assert_eq!(realizes, expected);

    let off = RealizePolicy {
        fanout: 0,
        ..RealizePolicy::default()
    };
    let realizes = select_realizes(&g, root, &off);
    assert_eq!(realizes, [out].into_iter().collect::<HashSet<_>>());
}

#[test]
fn test_constants_are_not_realized() {
    let mut g = Graph::new();
    let one = g.constant("HOST", DType::F32, 1.0, &s(&[4]));
    let two = g.constant("HOST", DType::F32, 2.0, &s(&[4]));
    let c = g.binary(Op::Add, one, two).unwrap();
    let x = g.binary(Op::Mul, c, c).unwrap();
    let y = g.binary(Op::Max, x, c).unwrap();
    let sink = g.sink(vec![y]);
    let root = normalized(&mut g, sink);
    let realizes = select_realizes(&g, root, &RealizePolicy::default());
    assert!(!realizes.contains(&c));

    let out = run(&mut g, sink);
    assert!(kernels(&g, out).is_empty());
}

#[test]
fn test_expanded_reduce_is_realized() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let r = g.reshape(a, &s(&[4, 4])).unwrap();
    let sum = g.reduce(r, ReduceOp::Add, &[1]).unwrap();
    let wide = g.expand(sum, &s(&[4, 4])).unwrap();
    let out = g.binary(Op::Add, wide, r).unwrap();
    let sink = g.sink(vec![out]);
    let root = normalized(&mut g, sink);
    let red = g
        .toposort(root)
        .into_iter()
        .find(|&n| g.op(n) == Op::ReduceAxis)
        .unwrap();

    let realizes = select_realizes(&g, root, &RealizePolicy::default());
    assert!(realizes.contains(&red));
    let off = RealizePolicy {
        expanded_reduce: false,
        ..RealizePolicy::default()
    };
    assert!(!select_realizes(&g, root, &off).contains(&red));

    let k = run(&mut g, sink);
    assert_eq!(kernels(&g, k).len(), 2);
}

#[test]
fn test_fuse_keeps_one_kernel() {
    let mut g = Graph::new();
    let (_, sink) = fanout_graph(&mut g);
    let out = g.src(sink)[0];
    let k = run(&mut g, sink);
    assert_eq!(kernels(&g, k).len(), 2);

    let fused = g.fuse(out);
    let sink = g.sink(vec![fused]);
    let k = run(&mut g, sink);
    assert_eq!(kernels(&g, k).len(), 1);
    assert_eq!(count(&g, k, Op::Fuse), 0);
}

// ─── Materialization ───────────────────────────────────────────────

#[test]
fn test_subrange_becomes_buffer_view() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let w = g
        .shrink(a, &[(SInt::Const(4), SInt::Const(12))])
        .unwrap();
    let c = g.contiguous(w);
    let sink = g.sink(vec![c]);
    let out = run(&mut g, sink);

    let bv = g.src(out)[0];
    assert_eq!(g.op(bv), Op::BufferView);
    assert_eq!(g.arg(bv), &Arg::BufferView { size: 8, offset: 4 });
    assert_eq!(g.src(bv), &[a]);
    assert_eq!(count(&g, out, Op::Buffer), 1);
    assert!(kernels(&g, out).is_empty());
}

#[test]
fn test_whole_buffer_is_a_reshape() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let r = g.reshape(a, &s(&[4, 4])).unwrap();
    let c = g.contiguous(r);
    let sink = g.sink(vec![c]);
    let out = run(&mut g, sink);

    let v = g.src(out)[0];
    assert_eq!(g.op(v), Op::View);
    assert_eq!(g.src(v), &[a]);
    assert!(kernels(&g, out).is_empty());
}

#[test]
fn test_strided_window_gets_a_buffer() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let r = g.reshape(a, &s(&[4, 4])).unwrap();
    let t = g.permute(r, &[1, 0]).unwrap();
    let c = g.contiguous(t);
    let sink = g.sink(vec![c]);
    let out = run(&mut g, sink);

    assert_eq!(count(&g, out, Op::Buffer), 2);
    assert_eq!(kernels(&g, out).len(), 1);
}

// ─── Partition ─────────────────────────────────────────────────────

#[test]
fn test_scenario_a_single_kernel() {
    let mut g = Graph::new();
    let (a, b, sink) = scenario_a(&mut g);
    let out = run(&mut g, sink);

    let ks = kernels(&g, out);
    assert_eq!(ks.len(), 1);
    let srcs = g.src(ks[0]);
    assert_eq!(srcs.len(), 3);
    assert_eq!(g.op(srcs[0]), Op::Buffer);
    assert_eq!(g.buffer_arg(srcs[0]).map(|(_, size)| size), Some(4));
    assert_eq!(&srcs[1..], &[a, b]);
    assert_closed(&g, ks[0]);

    let root = ast(&g, ks[0]);
    assert_eq!(g.op(root), Op::Sink);
    assert_eq!(
        g.arg(root),
        &Arg::Info(crate::ir::KernelInfo {
            name: "k_4_4".to_string()
        })
    );
    assert_eq!(count(&g, root, Op::DefineGlobal), 3);
}

#[test]
fn test_scenario_b_two_kernels() {
    let mut g = Graph::new();
    let (_, sink) = fanout_graph(&mut g);
    let out = run(&mut g, sink);

    let ks = kernels(&g, out);
    assert_eq!(ks.len(), 2);
    for &k in &ks {
        assert_closed(&g, k);
    }
    // The consumer reads the intermediate through its store.
    let (first, second) = (ks[0], ks[1]);
    let feeds = g.src(second).iter().any(|&s| {
        g.op(s) == Op::Store && g.src(s)[1] == first
    });
    assert!(feeds);
}

#[test]
fn test_kernel_name_from_shapes() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let e = g.unary(Op::Exp2, a).unwrap();
    let sink = g.sink(vec![e]);
    let out = run(&mut g, sink);
    let k = kernels(&g, out)[0];
    assert_eq!(kernel_name(&g, ast(&g, k)), "k_16");
}

#[test]
fn test_identical_kernels_share_an_ast() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let b = g.buffer("HOST", DType::F32, 16);
    let ea = g.unary(Op::Exp2, a).unwrap();
    let eb = g.unary(Op::Exp2, b).unwrap();
    let sink = g.sink(vec![ea, eb]);
    let out = run(&mut g, sink);

    let ks = kernels(&g, out);
    assert_eq!(ks.len(), 2);
    assert_ne!(g.src(ks[0]), g.src(ks[1]));
    assert_eq!(ast(&g, ks[0]), ast(&g, ks[1]));
}

#[test]
fn test_cross_device_copy_kernel() {
    let mut g = Graph::new();
    let a = g.buffer("HOST:0", DType::F32, 16);
    let x = g.unary(Op::Exp2, a).unwrap();
    let y = g.copy_to(x, "HOST:1");
    let z = g.unary(Op::Neg, y).unwrap();
    let sink = g.sink(vec![z]);
    let out = run(&mut g, sink);

    let ks = kernels(&g, out);
    assert_eq!(ks.len(), 3);
    let copies: Vec<NodeId> = ks
        .iter()
        .copied()
        .filter(|&k| g.op(ast(&g, k)) == Op::Copy)
        .collect();
    assert_eq!(copies.len(), 1);
    let srcs = g.src(copies[0]);
    assert_eq!(srcs.len(), 2);
    assert_eq!(g.device(srcs[0]), Some("HOST:1"));
    assert_eq!(g.device(srcs[1]), Some("HOST:0"));
    assert!(g.src(ast(&g, copies[0])).is_empty());
}

#[test]
fn test_bound_variables_leave_the_ast() {
    let mut g = Graph::new();
    let n = Variable::new("n", 1, 16);
    let a = g.buffer("HOST", DType::F32, 16);
    let w = g.shrink(a, &[(SInt::Const(0), n.bind(8))]).unwrap();
    let e = g.unary(Op::Exp2, w).unwrap();
    let sink = g.sink(vec![e]);
    let out = run(&mut g, sink);

    let ks = kernels(&g, out);
    assert_eq!(ks.len(), 1);
    assert_closed(&g, ks[0]);
    let srcs = g.src(ks[0]);
    assert_eq!(srcs.len(), 3);
    let bind = srcs[2];
    assert_eq!(g.op(bind), Op::Bind);
    assert_eq!(g.node(g.src(bind)[0]).arg, Arg::Var(n.clone()));
    // The output buffer is sized for the largest binding.
    assert_eq!(g.buffer_arg(srcs[0]).map(|(_, size)| size), Some(16));
}

#[test]
fn test_merge_bindings_conflict() {
    let n = Variable::new("n", 1, 16);
    let m = Variable::new("m", 1, 16);
    let mut first = VarVals::new();
    first.insert(n.clone(), 4);
    let mut second = VarVals::new();
    second.insert(n.clone(), 4);
    second.insert(m.clone(), 2);
    let merged = merge_bindings([&first, &second]).unwrap();
    assert_eq!(merged.len(), 2);

    second.insert(n.clone(), 5);
    assert_eq!(
        merge_bindings([&first, &second]).unwrap_err(),
        GraphError::ConflictingBinding {
            var: "n".to_string(),
            first: 4,
            second: 5
        }
    );
}

#[test]
fn test_kernel_collects_metadata() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let e = g.unary(Op::Exp2, a).unwrap();
    g.label(e, "exp2", "model.rs:3");
    let sink = g.sink(vec![e]);
    let out = kernelize_map(&mut g, sink, &KernelizeOptions::default()).unwrap();

    let stored = g.base(out.get(e));
    assert_eq!(g.op(stored), Op::Store);
    let kernel = g.src(stored)[1];
    assert_eq!(
        g.node(kernel).kernel().unwrap().metadata,
        vec![Metadata::new("exp2", "model.rs:3")]
    );
}

#[test]
fn test_step_budget_is_reported() {
    let mut g = Graph::new();
    let (_, _, sink) = scenario_a(&mut g);
    let opts = KernelizeOptions {
        max_steps: 1,
        ..KernelizeOptions::default()
    };
    assert!(matches!(
        kernelize(&mut g, sink, &opts),
        Err(GraphError::NoFixpoint { steps: 1, .. })
    ));
}
