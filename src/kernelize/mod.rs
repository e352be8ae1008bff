//! From a tensor graph to a graph of kernels.
//!
//! The passes run in a fixed order over the same arena:
//!
//! 1. `merge_views` + `early_rules` canonicalize movement ops and drop
//!    front-end leftovers (detach, same-device copies, zero-size data).
//! 2. `select_realizes` picks the nodes to materialize and `add_gbarrier`
//!    wraps them in `GBarrier`; `remove_tags` clears the marks it left.
//! 3. `do_fuse` removes barriers below `Fuse` hints.
//! 4. `gbarrier_to_buffer` turns barriers into buffers, buffer views, or
//!    folded constants.
//! 5. `view_left` pushes views to the loads.
//! 6. `create_kernels` cuts every store into a kernel.
//!
//! The result is a `Sink` whose sources are `Store(buffer, Kernel)` chains
//! (or plain buffers and constants for outputs that needed no compute).

mod materialize;
mod normalize;
mod partition;
mod realize;

use std::collections::HashMap;

use crate::error::GraphError;
use crate::ir::{Graph, NodeId};
use crate::rewrite::{Order, RuleSet, DEFAULT_MAX_STEPS};

pub use materialize::gbarrier_to_buffer;
pub use normalize::{early_rules, merge_views, view_left};
pub use partition::{create_kernels, kernel_fixup, kernel_name, merge_bindings, PartitionCtx};
pub use realize::{add_gbarrier, do_fuse, is_constexpr, remove_tags, select_realizes, RealizePolicy};

/// Tunables of the kernelize pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelizeOptions {
    pub policy: RealizePolicy,
    /// Step budget of each rewrite pass.
    pub max_steps: usize,
}

impl Default for KernelizeOptions {
    fn default() -> Self {
        Self {
            policy: RealizePolicy::default(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

/// The kernelized sink plus where every node of the input ended up.
#[derive(Clone, Debug)]
pub struct Kernelized {
    pub sink: NodeId,
    pub map: HashMap<NodeId, NodeId>,
}

impl Kernelized {
    /// The kernelized counterpart of an input node.
    pub fn get(&self, id: NodeId) -> NodeId {
        self.map.get(&id).copied().unwrap_or(id)
    }
}

fn pass<C>(
    g: &mut Graph,
    rules: RuleSet<C>,
    root: NodeId,
    ctx: &mut C,
    order: Order,
    max_steps: usize,
    map: &mut HashMap<NodeId, NodeId>,
) -> Result<NodeId, GraphError> {
    let out = rules.rewrite(g, root, ctx, order, max_steps)?;
    out.follow(map);
    Ok(out.root)
}

/// Run the whole pipeline, keeping the old → new node map.
pub fn kernelize_map(
    g: &mut Graph,
    sink: NodeId,
    opts: &KernelizeOptions,
) -> Result<Kernelized, GraphError> {
    let steps = opts.max_steps;

    let early = merge_views::<()>()
        .then("early rules", early_rules())
        .rewrite(g, sink, &mut (), Order::SourcesFirst, steps)?;
    let mut map = early.map;
    let mut root = early.root;

    let mut realizes = select_realizes(g, root, &opts.policy);
    root = pass(g, add_gbarrier(), root, &mut realizes, Order::NodeFirst, steps, &mut map)?;
    root = pass(g, remove_tags(), root, &mut (), Order::SourcesFirst, steps, &mut map)?;
    root = pass(g, do_fuse(), root, &mut (), Order::SourcesFirst, steps, &mut map)?;
    root = pass(g, gbarrier_to_buffer(), root, &mut (), Order::SourcesFirst, steps, &mut map)?;
    root = pass(g, view_left(), root, &mut (), Order::SourcesFirst, steps, &mut map)?;

    let mut ctx = PartitionCtx { max_steps: steps };
    root = pass(g, create_kernels(), root, &mut ctx, Order::SourcesFirst, steps, &mut map)?;

    tracing::debug!(nodes = g.len(), "kernelized");
    Ok(Kernelized { sink: root, map })
}

/// Run the whole pipeline and return the kernelized sink.
pub fn kernelize(g: &mut Graph, sink: NodeId, opts: &KernelizeOptions) -> Result<NodeId, GraphError> {
    kernelize_map(g, sink, opts).map(|k| k.sink)
}

#[cfg(test)]
mod tests;
