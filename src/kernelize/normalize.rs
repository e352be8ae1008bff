//! View normalization rules.
//!
//! `merge_views` is the core shared by almost every pass: it turns
//! movement ops into views and keeps view chains collapsed. `view_left`
//! additionally pushes views toward the leaves so that each kernel reads
//! its inputs through a single view per load.

use crate::error::GraphError;
use crate::ir::{Arg, Graph, NodeId, Op};
use crate::rewrite::RuleSet;
use crate::shape::{prod, strides_for_shape, SInt, ShapeTracker, View};

type RuleResult = Result<Option<NodeId>, GraphError>;

/// Apply the movement `op` with argument `arg` to `st`.
pub(crate) fn movement_st(st: &ShapeTracker, op: Op, arg: &Arg) -> Result<ShapeTracker, GraphError> {
    let moved = match (op, arg) {
        (Op::Reshape, Arg::Shape(s)) => st.reshape(s),
        (Op::Expand, Arg::Shape(s)) => st.expand(s),
        (Op::Permute, Arg::Axes(a)) => st.permute(a),
        (Op::Flip, Arg::Axes(a)) => st.flip(a),
        (Op::Pad, Arg::Pairs(p)) => st.pad(p),
        (Op::Shrink, Arg::Pairs(p)) => st.shrink(p),
        _ => return Err(GraphError::malformed(op, "unexpected movement argument")),
    };
    moved.map_err(|e| GraphError::movement(op, e))
}

fn view_st(g: &Graph, id: NodeId) -> Option<&ShapeTracker> {
    if g.op(id) != Op::View || g.src(id).len() != 1 {
        return None;
    }
    g.node(id).st()
}

/// `x` reshaped to `shape` as a view.
pub(crate) fn reshape_view(g: &mut Graph, x: NodeId, shape: &[SInt]) -> Result<NodeId, GraphError> {
    let from = g
        .shape(x)
        .map(<[SInt]>::to_vec)
        .ok_or_else(|| GraphError::malformed(g.op(x), "reshape of an unshaped node"))?;
    let st = ShapeTracker::from_shape(from)
        .reshape(shape)
        .map_err(|e| GraphError::movement(Op::Reshape, e))?;
    Ok(g.view(x, st))
}

// ─── merge_views ───────────────────────────────────────────────────

fn merge_adjacent_views<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(outer) = view_st(g, id) else {
        return Ok(None);
    };
    let inner_id = g.src(id)[0];
    let Some(inner) = view_st(g, inner_id) else {
        return Ok(None);
    };
    let st = inner.compose(outer);
    let base = g.src(inner_id)[0];
    let tag = g.tag(inner_id);
    let merged = g.view(base, st);
    Ok(Some(g.with_tag(merged, tag)))
}

fn movement_to_view<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let op = g.op(id);
    if !op.is_movement() {
        return Ok(None);
    }
    let src = g.src(id)[0];
    let (base, st) = match view_st(g, src) {
        Some(st) => (g.src(src)[0], st.clone()),
        None => (
            src,
            g.st(src)
                .ok_or_else(|| GraphError::malformed(op, "movement of an unshaped node"))?,
        ),
    };
    let st = movement_st(&st, op, g.arg(id))?;
    Ok(Some(g.view(base, st)))
}

fn view_after_copy<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Copy {
        return Ok(None);
    }
    let (v, dev) = (g.src(id)[0], g.src(id)[1]);
    let Some(st) = view_st(g, v).cloned() else {
        return Ok(None);
    };
    let x = g.src(v)[0];
    let Some(x_size) = g.size(x) else {
        return Ok(None);
    };
    // A shrinking view stays in front of the copy so less data moves.
    if x_size.le(&st.size()) != Some(true) {
        return Ok(None);
    }
    let copy = g.replace_src(id, vec![x, dev]);
    Ok(Some(g.view(copy, st)))
}

fn drop_noop_view<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(st) = view_st(g, id) else {
        return Ok(None);
    };
    let x = g.src(id)[0];
    if st.contiguous() && g.shape(x) == Some(st.shape()) {
        return Ok(Some(x));
    }
    Ok(None)
}

/// Merge adjacent views, turn movement ops into views, move views after
/// copies, and drop contiguous views that do not change the shape.
pub fn merge_views<C>() -> RuleSet<C> {
    RuleSet::new(
        "merge views",
        vec![
            merge_adjacent_views::<C>,
            movement_to_view::<C>,
            view_after_copy::<C>,
            drop_noop_view::<C>,
        ],
    )
}

// ─── early_rules ───────────────────────────────────────────────────

fn drop_unbuffered_store<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Store {
        return Ok(None);
    }
    let (target, value) = (g.src(id)[0], g.src(id)[1]);
    if matches!(g.op(target), Op::Buffer | Op::Store) {
        return Ok(None);
    }
    Ok(Some(value))
}

fn drop_detach<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Detach {
        return Ok(None);
    }
    Ok(Some(g.src(id)[0]))
}

fn zero_size_is_zero<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) == Op::Sink || !g.size(id).is_some_and(|s| s.is(0)) {
        return Ok(None);
    }
    let base = g.base(id);
    let already_zero = g.op(base) == Op::Const
        && g.node(base).const_value().is_some_and(|v| v.is_zero());
    if already_zero {
        return Ok(None);
    }
    Ok(Some(g.const_like(id, 0.0)))
}

fn drop_same_device_copy<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Copy {
        return Ok(None);
    }
    let (x, dev) = (g.src(id)[0], g.src(id)[1]);
    match (g.device(x), g.device(dev)) {
        (Some(a), Some(b)) if a == b => Ok(Some(x)),
        _ => Ok(None),
    }
}

/// Front-end cleanups run together with `merge_views` before realization.
pub fn early_rules<C>() -> RuleSet<C> {
    RuleSet::new(
        "early rules",
        vec![
            drop_unbuffered_store::<C>,
            drop_detach::<C>,
            zero_size_is_zero::<C>,
            drop_same_device_copy::<C>,
        ],
    )
}

// ─── view_left ─────────────────────────────────────────────────────

fn push_view_through_elementwise<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(st) = view_st(g, id).cloned() else {
        return Ok(None);
    };
    let e = g.src(id)[0];
    if !g.op(e).is_elementwise() || g.tag(e).is_some() {
        return Ok(None);
    }
    let srcs = g.src(e).to_vec();
    if srcs.iter().any(|&s| g.shape(s).is_none()) {
        return Ok(None);
    }
    let viewed: Vec<NodeId> = srcs.into_iter().map(|s| g.view(s, st.clone())).collect();
    Ok(Some(g.replace_src(e, viewed)))
}

/// Move a non-contiguous view from above a reduction to below it.
///
/// `View(ReduceAxis(src))` becomes a contiguous reshape over
/// `ReduceAxis(View(src))`: every component view gets the reduced extents
/// appended as trailing, row-major axes.
fn swizzle_reduce<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(st) = view_st(g, id).cloned() else {
        return Ok(None);
    };
    let r = g.src(id)[0];
    if g.op(r) != Op::ReduceAxis || g.tag(r).is_some() || st.contiguous() {
        return Ok(None);
    }
    let Some(r_size) = g.size(r) else {
        return Ok(None);
    };
    if st.size().le(&r_size) != Some(true) {
        return Ok(None);
    }
    let (op, axes) = match g.node(r).reduce_arg() {
        Some((op, axes)) => (op, axes.to_vec()),
        None => return Err(GraphError::malformed(Op::ReduceAxis, "missing reduce argument")),
    };
    let src = g.src(r)[0];
    let src_shape = g
        .shape(src)
        .map(<[SInt]>::to_vec)
        .ok_or_else(|| GraphError::malformed(Op::ReduceAxis, "reduction of an unshaped node"))?;

    let ndim = src_shape.len();
    let trailing = axes.len() <= ndim && axes.iter().copied().eq(ndim - axes.len()..ndim);
    if !trailing {
        return Err(GraphError::ReduceAxisOrder { axes, ndim });
    }

    let rshape = src_shape[ndim - axes.len()..].to_vec();
    let prshape = prod(&rshape);
    let rstrides = strides_for_shape(&rshape);
    let views = st
        .views
        .iter()
        .map(|v| {
            let shape = v.shape.iter().chain(rshape.iter()).cloned().collect();
            let strides = v
                .strides
                .iter()
                .map(|s| s.clone() * prshape.clone())
                .chain(rstrides.iter().cloned())
                .collect();
            let mask = v.mask.as_ref().map(|m| {
                m.iter()
                    .cloned()
                    .chain(rshape.iter().map(|s| (SInt::Const(0), s.clone())))
                    .collect()
            });
            View::create(shape, Some(strides), v.offset.clone() * prshape.clone(), mask)
        })
        .collect();

    let vshape = st.shape().to_vec();
    let swizzled = g.view(src, ShapeTracker { views });
    let dtype = g.dtype(r);
    let new_axes: Vec<usize> = (vshape.len()..vshape.len() + axes.len()).collect();
    let reduced = g.new_node(
        Op::ReduceAxis,
        dtype,
        vec![swizzled],
        Arg::Reduce { op, axes: new_axes },
    );
    g.inherit_metadata(r, reduced);
    reshape_view(g, reduced, &vshape).map(Some)
}

fn drop_contiguous<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Contiguous {
        return Ok(None);
    }
    Ok(Some(g.src(id)[0]))
}

fn squeeze_store<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Store {
        return Ok(None);
    }
    let (buf, val) = (g.src(id)[0], g.src(id)[1]);
    let Some(shape) = g.shape(val).map(<[SInt]>::to_vec) else {
        return Ok(None);
    };
    let squeezed: Vec<SInt> = shape.iter().filter(|s| !s.is(1)).cloned().collect();
    if squeezed.len() == shape.len() {
        return Ok(None);
    }
    let val = reshape_view(g, val, &squeezed)?;
    Ok(Some(g.replace_src(id, vec![buf, val])))
}

/// `merge_views` plus pushing views toward the leaves.
pub fn view_left<C>() -> RuleSet<C> {
    merge_views::<C>().then(
        "view left",
        RuleSet::new(
            "view left",
            vec![
                push_view_through_elementwise::<C>,
                swizzle_reduce::<C>,
                drop_contiguous::<C>,
                squeeze_store::<C>,
            ],
        ),
    )
}
