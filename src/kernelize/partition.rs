//! Cutting the graph into kernels.
//!
//! Every `Store(target, value)` becomes `Store(target, Kernel(srcs))`. The
//! kernel's AST refers to its inputs only through `DefineGlobal(i)`
//! placeholders, so two kernels that compute the same thing on different
//! buffers share one AST (and one compiled program).

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::ir::{Arg, DType, Graph, Kernel, KernelInfo, Metadata, NodeId, Op};
use crate::rewrite::{Order, RuleSet};
use crate::shape::{SInt, ShapeTracker, VarVals};

use super::normalize::merge_views;

type RuleResult = Result<Option<NodeId>, GraphError>;

/// Context for the partition pass.
pub struct PartitionCtx {
    pub max_steps: usize,
}

struct FixupCtx {
    replace: HashMap<NodeId, NodeId>,
}

fn substitute(_: &mut Graph, ctx: &mut FixupCtx, id: NodeId) -> RuleResult {
    Ok(ctx.replace.get(&id).copied())
}

fn view_before_load<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::View || g.src(id).len() != 1 {
        return Ok(None);
    }
    let load = g.src(id)[0];
    if g.op(load) != Op::Load {
        return Ok(None);
    }
    let Some(st) = g.node(id).st().cloned() else {
        return Ok(None);
    };
    let x = g.src(load)[0];
    let viewed = g.view(x, st);
    Ok(Some(g.replace_src(load, vec![viewed])))
}

fn store_without_load<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Store {
        return Ok(None);
    }
    let (target, value) = (g.src(id)[0], g.src(id)[1]);
    if g.op(target) != Op::Load {
        return Ok(None);
    }
    let buf = g.src(target)[0];
    Ok(Some(g.replace_src(id, vec![buf, value])))
}

/// Views in front of loads, stores straight into their placeholder.
pub fn kernel_fixup<C>() -> RuleSet<C> {
    RuleSet::new(
        "kernel fixup",
        vec![view_before_load::<C>, store_without_load::<C>],
    )
}

/// Merge binding maps, failing on a variable bound to two values.
pub fn merge_bindings<'a>(
    maps: impl IntoIterator<Item = &'a VarVals>,
) -> Result<VarVals, GraphError> {
    let mut out = VarVals::new();
    for map in maps {
        for (var, &val) in map {
            match out.get(var) {
                Some(&prev) if prev != val => {
                    return Err(GraphError::ConflictingBinding {
                        var: var.name.clone(),
                        first: prev,
                        second: val,
                    })
                }
                _ => {
                    out.insert(var.clone(), val);
                }
            }
        }
    }
    Ok(out)
}

/// Descriptive kernel name from the smallest and largest shapes in `ast`.
pub fn kernel_name(g: &Graph, ast: NodeId) -> String {
    let mut shapes: Vec<Vec<SInt>> = g
        .toposort(ast)
        .into_iter()
        .filter_map(|n| g.shape(n).map(<[SInt]>::to_vec))
        .collect();
    shapes.sort();
    shapes.dedup();
    let (Some(first), Some(last)) = (shapes.first(), shapes.last()) else {
        return "k_".to_string();
    };
    let mut dims: Vec<String> = first
        .iter()
        .filter(|s| !s.is(1))
        .map(ToString::to_string)
        .collect();
    let skip = dims.len();
    dims.extend(
        last.iter()
            .skip(skip)
            .filter(|s| !s.is(1))
            .map(ToString::to_string),
    );
    format!("k_{}", dims.join("_"))
}

fn buffer_size(g: &Graph, id: NodeId) -> Result<usize, GraphError> {
    match (g.op(id), g.arg(id)) {
        (Op::BufferView, Arg::BufferView { size, .. }) => Ok(*size),
        _ => g
            .buffer_arg(id)
            .map(|(_, size)| size)
            .ok_or_else(|| GraphError::InvalidKernelInput(g.op(id))),
    }
}

fn create_kernel(g: &mut Graph, ctx: &mut PartitionCtx, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Store {
        return Ok(None);
    }
    let (target, value) = (g.src(id)[0], g.src(id)[1]);
    if g.op(value) == Op::Kernel {
        return Ok(None);
    }

    let mut srcs = vec![target];
    let body = g.toposort_gated(value, |y| match g.op(y) {
        Op::Store | Op::Buffer | Op::BufferView => {
            srcs.push(y);
            false
        }
        _ => true,
    });
    let mut seen = HashSet::new();
    srcs.retain(|s| seen.insert(*s));

    let mut replace: HashMap<NodeId, NodeId> = HashMap::new();
    let mut unbound: Vec<VarVals> = Vec::new();
    let mut metadata: Vec<Metadata> = Vec::new();
    for &y in &body {
        if let Some(m) = g.metadata(y) {
            if !metadata.contains(m) {
                metadata.push(m.clone());
            }
        }
        match g.op(y) {
            Op::View => {
                let Some(st) = g.node(y).st() else { continue };
                if !st.has_bound_vars() {
                    continue;
                }
                let (st, vals) = st.unbind();
                unbound.push(vals);
                let new = g.with_arg(y, Arg::St(st));
                replace.insert(y, new);
            }
            Op::Const if !g.src(y).is_empty() => {
                let new = g.replace_src(y, vec![]);
                replace.insert(y, new);
            }
            _ => {}
        }
    }

    for (i, &y) in srcs.iter().enumerate() {
        let dtype = g.dtype(y);
        let dg = g.new_node(Op::DefineGlobal, dtype, vec![], Arg::Global(i));
        let st = if i == 0 {
            let shape = g
                .shape(value)
                .map(<[SInt]>::to_vec)
                .ok_or_else(|| GraphError::malformed(Op::Store, "stored value has no shape"))?;
            let (st, vals) = ShapeTracker::from_shape(shape).unbind();
            unbound.push(vals);
            st
        } else {
            ShapeTracker::from_shape(vec![SInt::from(buffer_size(g, y)?)])
        };
        let view = g.view(dg, st);
        let load = g.new_node(Op::Load, dtype, vec![view], Arg::None);
        replace.insert(y, load);
    }

    let bindings = merge_bindings(unbound.iter())?;
    for (var, &val) in &bindings {
        srcs.push(g.bind(var, val)?);
    }

    let ast = if srcs.len() == 2 && g.device(srcs[0]) != g.device(srcs[1]) {
        let dtype = g.dtype(value);
        g.new_node(Op::Copy, dtype, vec![], Arg::None)
    } else {
        let rules = RuleSet::new("substitute", vec![substitute])
            .then("fixup kernel", merge_views())
            .then("fixup kernel", kernel_fixup());
        let mut fixup = FixupCtx { replace };
        let stored = rules
            .rewrite(g, id, &mut fixup, Order::NodeFirst, ctx.max_steps)?
            .root;
        let name = kernel_name(g, stored);
        g.new_node(
            Op::Sink,
            DType::Void,
            vec![stored],
            Arg::Info(KernelInfo { name }),
        )
    };

    tracing::debug!(
        ast = %g.op(ast),
        inputs = srcs.len(),
        "kernel created"
    );
    let kernel = g.new_node(
        Op::Kernel,
        DType::Void,
        srcs,
        Arg::Kernel(Box::new(Kernel { ast, metadata })),
    );
    Ok(Some(g.replace_src(id, vec![target, kernel])))
}

/// Turn every `Store` of a computed value into a store of a kernel.
pub fn create_kernels() -> RuleSet<PartitionCtx> {
    RuleSet::new("create kernels", vec![create_kernel])
}
