//! Barriers become buffers.

use crate::error::GraphError;
use crate::ir::{Arg, Graph, NodeId, Op};
use crate::rewrite::RuleSet;
use crate::shape::{prod, SInt, View};

use super::normalize::{merge_views, reshape_view};
use super::realize::is_constexpr;

type RuleResult = Result<Option<NodeId>, GraphError>;

fn barrier_src(g: &Graph, id: NodeId) -> Option<NodeId> {
    if g.op(id) != Op::GBarrier {
        return None;
    }
    g.src(id).first().copied()
}

fn strip_contiguous<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(x) = barrier_src(g, id) else {
        return Ok(None);
    };
    if g.op(x) != Op::Contiguous {
        return Ok(None);
    }
    let inner = g.src(x)[0];
    Ok(Some(g.replace_src(id, vec![inner])))
}

fn already_realized<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(x) = barrier_src(g, id) else {
        return Ok(None);
    };
    if matches!(g.op(x), Op::Buffer | Op::GBarrier) {
        return Ok(Some(x));
    }
    Ok(None)
}

fn fold_constexpr<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(x) = barrier_src(g, id) else {
        return Ok(None);
    };
    if is_constexpr(g, x) {
        return Ok(Some(x));
    }
    Ok(None)
}

/// `GBarrier(View(b))` reading one contiguous window of `b`.
fn to_buffer_view<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(v) = barrier_src(g, id) else {
        return Ok(None);
    };
    if g.op(v) != Op::View {
        return Ok(None);
    }
    let b = g.src(v)[0];
    let (views, shape) = match g.node(v).st() {
        Some(st) => (st.views.clone(), st.shape().to_vec()),
        None => return Ok(None),
    };
    let [view] = views.as_slice() else {
        return Ok(None);
    };
    if view.mask.is_some() {
        return Ok(None);
    }
    let row_major = View::create(shape.clone(), Some(view.strides.clone()), SInt::Const(0), None);
    if !row_major.contiguous {
        return Ok(None);
    }
    let (Some(size), Some(offset)) = (prod(&shape).as_const(), view.offset.as_const()) else {
        return Ok(None);
    };
    if offset < 0 {
        return Ok(None);
    }
    let (size, offset) = (size as usize, offset as usize);

    let base_size = match (g.op(b), g.arg(b)) {
        (Op::Buffer, Arg::Buffer { size, .. }) => *size,
        (Op::GBarrier, _) => match g.size(b).and_then(|s| s.as_const()) {
            Some(s) => s as usize,
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    if offset + size > base_size {
        return Ok(None);
    }

    let whole = size == base_size && offset == 0;
    let data = if whole {
        b
    } else if g.op(b) == Op::Buffer {
        let dtype = g.dtype(b);
        g.new_node(Op::BufferView, dtype, vec![b], Arg::BufferView { size, offset })
    } else {
        return Ok(None);
    };
    reshape_view(g, data, &shape).map(Some)
}

fn new_buffer<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    let Some(x) = barrier_src(g, id) else {
        return Ok(None);
    };
    let shape = g
        .shape(x)
        .map(<[SInt]>::to_vec)
        .ok_or_else(|| GraphError::malformed(Op::GBarrier, "barrier over an unshaped node"))?;
    let device = g
        .device(x)
        .map(str::to_string)
        .ok_or_else(|| GraphError::malformed(Op::GBarrier, "barrier over a node with no device"))?;
    let size = prod(&shape).max_value();
    if size < 0 {
        return Err(GraphError::Symbolic(format!(
            "cannot size a buffer for shape {:?}",
            shape.iter().map(ToString::to_string).collect::<Vec<_>>()
        )));
    }
    let buf = g.buffer(&device, g.dtype(x), size as usize);
    let stored = g.store(buf, x);
    g.inherit_metadata(x, stored);
    reshape_view(g, stored, &shape).map(Some)
}

/// `merge_views` plus turning every `GBarrier` into a buffer: an existing
/// buffer, a folded constant, a buffer view, or a fresh store.
pub fn gbarrier_to_buffer<C>() -> RuleSet<C> {
    merge_views::<C>().then(
        "gbarrier to buffers",
        RuleSet::new(
            "gbarrier to buffers",
            vec![
                strip_contiguous::<C>,
                already_realized::<C>,
                fold_constexpr::<C>,
                to_buffer_view::<C>,
                new_buffer::<C>,
            ],
        ),
    )
}
