//! Kernel dependency graph and execution order.
//!
//! A kernel depends on another when one of its inputs is a `Store` whose
//! value is that kernel. The order is Kahn's algorithm run breadth-first:
//! start from every kernel with no dependencies (in discovery order) and
//! emit a dependent as soon as its last dependency has been emitted.

use std::collections::{HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::GraphError;
use crate::ir::{Arg, DType, Graph, Metadata, NodeId, Op};
use crate::kernelize::merge_bindings;
use crate::shape::VarVals;

/// A concrete buffer a schedule item reads or writes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    /// Id of the underlying `Buffer` node's allocation.
    pub id: u64,
    pub device: String,
    pub dtype: DType,
    /// Elements visible through this descriptor.
    pub size: usize,
    /// Element offset into the underlying allocation.
    pub offset: usize,
    /// Elements in the underlying allocation.
    pub base_size: usize,
}

impl BufferDesc {
    /// Resolve a `Buffer`, `BufferView` or `Store` to the buffer it names.
    pub fn from_node(g: &Graph, id: NodeId) -> Result<BufferDesc, GraphError> {
        match (g.op(id), g.arg(id)) {
            (Op::Buffer, Arg::Buffer { id: buf, size }) => Ok(BufferDesc {
                id: *buf,
                device: g
                    .device(id)
                    .map(str::to_string)
                    .ok_or_else(|| GraphError::malformed(Op::Buffer, "buffer without a device"))?,
                dtype: g.dtype(id),
                size: *size,
                offset: 0,
                base_size: *size,
            }),
            (Op::BufferView, Arg::BufferView { size, offset }) => {
                let base = BufferDesc::from_node(g, g.src(id)[0])?;
                Ok(BufferDesc {
                    size: *size,
                    offset: base.offset + offset,
                    dtype: g.dtype(id),
                    ..base
                })
            }
            (Op::Store, _) => BufferDesc::from_node(g, g.src(id)[0]),
            (op, _) => Err(GraphError::InvalidKernelInput(op)),
        }
    }

    /// True when both descriptors name the same allocation.
    pub fn aliases(&self, other: &BufferDesc) -> bool {
        self.id == other.id
    }
}

/// One kernel bound to its buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleItem {
    /// `Sink` or bare `Copy` AST root.
    pub ast: NodeId,
    /// Output first, then inputs, in placeholder order.
    pub bufs: Vec<BufferDesc>,
    pub metadata: Vec<Metadata>,
    /// Variables this kernel's views were bound to.
    pub fixedvars: VarVals,
}

impl ScheduleItem {
    /// Display name: the kernel name, or `copy` for transfers.
    pub fn name(&self, g: &Graph) -> String {
        match g.arg(self.ast) {
            Arg::Info(info) => info.name.clone(),
            _ => g.op(self.ast).name().to_string(),
        }
    }

    /// Comma-separated provenance labels.
    pub fn provenance(&self) -> String {
        if self.metadata.is_empty() {
            return "no metadata".to_string();
        }
        self.metadata
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schedule {
    pub items: VecDeque<ScheduleItem>,
    /// Every binding found on a kernel input.
    pub var_vals: VarVals,
}

impl Schedule {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// `(variable, value)` of a `Bind(DefineVar, Const)` node.
fn unbind(g: &Graph, id: NodeId) -> Result<VarVals, GraphError> {
    let src = g.src(id);
    let var = match src.first().map(|&v| g.arg(v)) {
        Some(Arg::Var(var)) => var.clone(),
        _ => return Err(GraphError::malformed(Op::Bind, "first source is not a variable")),
    };
    let value = src
        .get(1)
        .and_then(|&c| g.node(c).const_value())
        .ok_or_else(|| GraphError::malformed(Op::Bind, "second source is not a constant"))?;
    let mut vals = VarVals::new();
    vals.insert(var, value.as_f64() as i64);
    Ok(vals)
}

/// Breadth-first Kahn order of `deps`, roots in insertion order.
fn linearize<N>(deps: &DiGraph<N, ()>) -> Result<Vec<NodeIndex>, GraphError> {
    let mut in_degree: Vec<usize> = deps
        .node_indices()
        .map(|n| deps.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut queue: VecDeque<NodeIndex> = deps
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(deps.node_count());
    while let Some(n) = queue.pop_front() {
        order.push(n);
        // petgraph yields the newest edge first
        let children: Vec<NodeIndex> = deps.neighbors_directed(n, Direction::Outgoing).collect();
        for child in children.into_iter().rev() {
            in_degree[child.index()] -= 1;
            if in_degree[child.index()] == 0 {
                queue.push_back(child);
            }
        }
    }
    if order.len() != deps.node_count() {
        return Err(GraphError::ScheduleCycle {
            remaining: deps.node_count() - order.len(),
        });
    }
    Ok(order)
}

/// Order every kernel reachable from `sink`.
pub fn create_schedule(g: &Graph, sink: NodeId) -> Result<Schedule, GraphError> {
    let mut deps: DiGraph<NodeId, ()> = DiGraph::new();
    let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
    let mut fixed: HashMap<NodeId, VarVals> = HashMap::new();

    for u in g.toposort(sink) {
        if g.op(u) != Op::Store || g.op(g.src(u)[1]) != Op::Kernel {
            continue;
        }
        let k = g.src(u)[1];
        if index.contains_key(&k) {
            continue;
        }
        let kid = deps.add_node(k);
        index.insert(k, kid);

        let mut binds = Vec::new();
        for &s in g.src(k) {
            match g.op(s) {
                Op::Store => {
                    let parent = g.src(s)[1];
                    if g.op(parent) != Op::Kernel {
                        return Err(GraphError::malformed(
                            Op::Store,
                            "kernel input stores an unkernelized value",
                        ));
                    }
                    // toposort puts the parent's store before this one
                    let pid = *index.get(&parent).ok_or_else(|| {
                        GraphError::malformed(Op::Kernel, "input kernel not reachable")
                    })?;
                    deps.add_edge(pid, kid, ());
                }
                Op::Buffer | Op::BufferView => {}
                Op::Bind => binds.push(unbind(g, s)?),
                op => return Err(GraphError::InvalidKernelInput(op)),
            }
        }
        fixed.insert(k, merge_bindings(binds.iter())?);
    }

    let mut schedule = Schedule::default();
    let mut all_vars: Vec<VarVals> = Vec::new();
    for kid in linearize(&deps)? {
        let k = deps[kid];
        let node = g.node(k);
        let kernel = node
            .kernel()
            .ok_or_else(|| GraphError::malformed(Op::Kernel, "missing kernel argument"))?;
        let bufs = node
            .src
            .iter()
            .filter(|&&s| g.op(s) != Op::Bind)
            .map(|&s| BufferDesc::from_node(g, s))
            .collect::<Result<Vec<_>, _>>()?;
        let fixedvars = fixed.remove(&k).unwrap_or_default();
        all_vars.push(fixedvars.clone());
        schedule.items.push_back(ScheduleItem {
            ast: kernel.ast,
            bufs,
            metadata: kernel.metadata.clone(),
            fixedvars,
        });
    }
    schedule.var_vals = merge_bindings(all_vars.iter())?;
    tracing::debug!(
        kernels = schedule.items.len(),
        vars = schedule.var_vals.len(),
        "scheduled"
    );
    Ok(schedule)
}

#[cfg(test)]
mod tests;
