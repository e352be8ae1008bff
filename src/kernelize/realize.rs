//! Realization selection and barrier insertion.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::ir::{Arg, Graph, NodeId, Op};
use crate::rewrite::RuleSet;

use super::normalize::merge_views;

type RuleResult = Result<Option<NodeId>, GraphError>;

/// Which intermediate nodes become buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RealizePolicy {
    /// A computing node with at least this many distinct consumers is
    /// materialized instead of recomputed. `0` disables the rule.
    pub fanout: usize,
    /// Materialize reductions that are read through an expanding view.
    pub expanded_reduce: bool,
}

impl Default for RealizePolicy {
    fn default() -> Self {
        Self {
            fanout: 2,
            expanded_reduce: true,
        }
    }
}

/// True when every node under `x` is a constant, a view, arithmetic, or a
/// reduction, so `x` can be evaluated without reading any buffer.
pub fn is_constexpr(g: &Graph, x: NodeId) -> bool {
    g.toposort(x).into_iter().all(|n| g.op(n).is_constexpr())
}

fn is_computing(op: Op) -> bool {
    op.is_elementwise() || op == Op::ReduceAxis
}

/// Nodes that already own their data and never need a barrier.
fn is_realized_leaf(op: Op) -> bool {
    matches!(
        op,
        Op::Buffer | Op::BufferView | Op::Const | Op::Device | Op::DefineVar | Op::Bind | Op::Store
    )
}

fn want(g: &Graph, x: NodeId, realizes: &mut HashSet<NodeId>) {
    if !is_realized_leaf(g.op(x)) {
        realizes.insert(x);
    }
}

fn through_views(g: &Graph, mut id: NodeId) -> NodeId {
    while g.op(id) == Op::View && g.src(id).len() == 1 {
        id = g.src(id)[0];
    }
    id
}

/// Pick the nodes under `sink` that must be materialized.
pub fn select_realizes(g: &Graph, sink: NodeId, policy: &RealizePolicy) -> HashSet<NodeId> {
    let order = g.toposort(sink);
    let mut realizes: HashSet<NodeId> = HashSet::new();

    // Users of each node, with views looked through on both ends.
    let mut consumers: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
    for &u in &order {
        if g.op(u) == Op::View {
            continue;
        }
        for &s in g.src(u) {
            consumers.entry(through_views(g, s)).or_default().insert(u);
        }
    }

    if g.op(sink) == Op::Sink {
        for &s in g.src(sink) {
            let b = g.base(s);
            want(g, b, &mut realizes);
        }
    }

    for &x in &order {
        match g.op(x) {
            Op::Contiguous => want(g, x, &mut realizes),
            Op::Copy => {
                want(g, x, &mut realizes);
                let src = g.src(x)[0];
                if g.op(src) == Op::View && !is_constexpr(g, src) {
                    // The view narrows the data; materialize exactly what
                    // gets copied.
                    want(g, src, &mut realizes);
                } else {
                    let b = g.base(src);
                    want(g, b, &mut realizes);
                }
            }
            Op::View if policy.expanded_reduce => {
                let inner = through_views(g, x);
                if g.op(inner) != Op::ReduceAxis {
                    continue;
                }
                let grows = match (g.size(x), g.size(inner)) {
                    (Some(outer), Some(r)) => outer.le(&r) != Some(true),
                    _ => false,
                };
                if grows {
                    want(g, inner, &mut realizes);
                }
            }
            op if is_computing(op) && policy.fanout > 0 => {
                let n = consumers.get(&x).map_or(0, HashSet::len);
                if n >= policy.fanout && !is_constexpr(g, x) {
                    want(g, x, &mut realizes);
                }
            }
            _ => {}
        }
    }
    tracing::debug!(count = realizes.len(), "selected realizes");
    realizes
}

// ─── Barriers ──────────────────────────────────────────────────────

fn insert_barrier(g: &mut Graph, ctx: &mut HashSet<NodeId>, id: NodeId) -> RuleResult {
    if !ctx.contains(&id) || g.tag(id).is_some() {
        return Ok(None);
    }
    let tagged = g.with_tag(id, Some(1));
    let dtype = g.dtype(id);
    Ok(Some(g.new_node(Op::GBarrier, dtype, vec![tagged], Arg::None)))
}

/// `merge_views` plus wrapping every selected node in a `GBarrier`.
/// Run node-first so the selection, made on the original ids, still
/// matches.
pub fn add_gbarrier() -> RuleSet<HashSet<NodeId>> {
    merge_views().then("add gbarriers", RuleSet::new("add gbarriers", vec![insert_barrier]))
}

fn clear_tag<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.tag(id).is_none() {
        return Ok(None);
    }
    Ok(Some(g.with_tag(id, None)))
}

pub fn remove_tags<C>() -> RuleSet<C> {
    RuleSet::new("remove tags", vec![clear_tag::<C>])
}

fn fuse_drops_barrier<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Fuse {
        return Ok(None);
    }
    let x = g.src(id)[0];
    if g.op(x) != Op::GBarrier {
        return Ok(None);
    }
    let inner = g.src(x)[0];
    Ok(Some(g.fuse(inner)))
}

fn push_fuse<C>(g: &mut Graph, _: &mut C, id: NodeId) -> RuleResult {
    if g.op(id) != Op::Fuse {
        return Ok(None);
    }
    let x = g.src(id)[0];
    let srcs: Vec<NodeId> = g.src(x).to_vec();
    let fused: Vec<NodeId> = srcs.into_iter().map(|s| g.fuse(s)).collect();
    Ok(Some(g.replace_src(x, fused)))
}

/// A `Fuse` hint removes every barrier below it.
pub fn do_fuse<C>() -> RuleSet<C> {
    RuleSet::new("do fuse", vec![fuse_drops_barrier::<C>, push_fuse::<C>])
}
