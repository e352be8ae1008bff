use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use super::{Arg, DType, Metadata, Node, NodeId, Op};
use crate::shape::{prod, SInt, ShapeTracker};

/// Hash-consing arena of IR nodes.
///
/// Shape and device are derived once per node when it is interned.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    shapes: Vec<Option<Vec<SInt>>>,
    devices: Vec<Option<String>>,
    interned: HashMap<Node, NodeId>,
    metadata: HashMap<NodeId, Metadata>,
    next_buffer: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Intern `node`, returning the existing id for an identical node.
    pub fn intern(&mut self, node: Node) -> NodeId {
        if let Some(&id) = self.interned.get(&node) {
            return id;
        }
        let shape = self.infer_shape(&node);
        let device = self.infer_device(&node);
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node.clone());
        self.shapes.push(shape);
        self.devices.push(device);
        self.interned.insert(node, id);
        id
    }

    pub fn new_node(&mut self, op: Op, dtype: DType, src: Vec<NodeId>, arg: Arg) -> NodeId {
        self.intern(Node::new(op, dtype, src, arg))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn op(&self, id: NodeId) -> Op {
        self.nodes[id.index()].op
    }

    pub fn dtype(&self, id: NodeId) -> DType {
        self.nodes[id.index()].dtype
    }

    pub fn src(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].src
    }

    pub fn arg(&self, id: NodeId) -> &Arg {
        &self.nodes[id.index()].arg
    }

    pub fn tag(&self, id: NodeId) -> Option<u32> {
        self.nodes[id.index()].tag
    }

    pub fn shape(&self, id: NodeId) -> Option<&[SInt]> {
        self.shapes[id.index()].as_deref()
    }

    pub fn device(&self, id: NodeId) -> Option<&str> {
        self.devices[id.index()].as_deref()
    }

    /// Element count of a shaped node.
    pub fn size(&self, id: NodeId) -> Option<SInt> {
        self.shape(id).map(prod)
    }

    /// Layout of a shaped node: the view's own tracker, or the contiguous
    /// tracker of its shape.
    pub fn st(&self, id: NodeId) -> Option<ShapeTracker> {
        match &self.nodes[id.index()].arg {
            Arg::St(st) if self.op(id) == Op::View => Some(st.clone()),
            _ => self.shape(id).map(|s| ShapeTracker::from_shape(s.to_vec())),
        }
    }

    /// Follow views and movement ops down to the node that owns the data.
    pub fn base(&self, mut id: NodeId) -> NodeId {
        loop {
            let op = self.op(id);
            if (op == Op::View || op.is_movement()) && !self.src(id).is_empty() {
                id = self.src(id)[0];
            } else {
                return id;
            }
        }
    }

    /// Id and size of the buffer a `Buffer`, `BufferView`, or `Store`
    /// ultimately writes.
    pub fn buffer_arg(&self, id: NodeId) -> Option<(u64, usize)> {
        match (&self.nodes[id.index()].op, &self.nodes[id.index()].arg) {
            (Op::Buffer, Arg::Buffer { id, size }) => Some((*id, *size)),
            (Op::BufferView, _) | (Op::Store, _) => self.buffer_arg(*self.src(id).first()?),
            _ => None,
        }
    }

    pub fn alloc_buffer_id(&mut self) -> u64 {
        let id = self.next_buffer;
        self.next_buffer += 1;
        id
    }

    // ─── Rebuilding ────────────────────────────────────────────────

    pub fn replace_src(&mut self, id: NodeId, src: Vec<NodeId>) -> NodeId {
        if self.src(id) == src.as_slice() {
            return id;
        }
        let mut node = self.node(id).clone();
        node.src = src;
        let new = self.intern(node);
        self.inherit_metadata(id, new);
        new
    }

    pub fn with_tag(&mut self, id: NodeId, tag: Option<u32>) -> NodeId {
        if self.tag(id) == tag {
            return id;
        }
        let mut node = self.node(id).clone();
        node.tag = tag;
        let new = self.intern(node);
        self.inherit_metadata(id, new);
        new
    }

    pub fn with_arg(&mut self, id: NodeId, arg: Arg) -> NodeId {
        let mut node = self.node(id).clone();
        node.arg = arg;
        self.intern(node)
    }

    /// `View(x, st)`.
    pub fn view(&mut self, x: NodeId, st: ShapeTracker) -> NodeId {
        let dtype = self.dtype(x);
        self.new_node(Op::View, dtype, vec![x], Arg::St(st))
    }

    /// Rebuild `root` with every key of `map` replaced by its value. The
    /// replacements themselves are not traversed.
    pub fn substitute(&mut self, root: NodeId, map: &HashMap<NodeId, NodeId>) -> NodeId {
        let order = self.toposort_gated(root, |id| !map.contains_key(&id));
        let mut done: HashMap<NodeId, NodeId> = HashMap::new();
        for id in order {
            let src: Vec<NodeId> = self
                .src(id)
                .iter()
                .map(|s| *map.get(s).or_else(|| done.get(s)).unwrap_or(s))
                .collect();
            let new = self.replace_src(id, src);
            done.insert(id, new);
        }
        map.get(&root)
            .or_else(|| done.get(&root))
            .copied()
            .unwrap_or(root)
    }

    // ─── Metadata ──────────────────────────────────────────────────

    pub fn set_metadata(&mut self, id: NodeId, metadata: Metadata) {
        self.metadata.insert(id, metadata);
    }

    pub fn metadata(&self, id: NodeId) -> Option<&Metadata> {
        self.metadata.get(&id)
    }

    /// Copy `from`'s provenance to `to` unless `to` already has its own.
    pub fn inherit_metadata(&mut self, from: NodeId, to: NodeId) {
        if from == to || self.metadata.contains_key(&to) {
            return;
        }
        if let Some(m) = self.metadata.get(&from).cloned() {
            self.metadata.insert(to, m);
        }
    }

    // ─── Traversal ─────────────────────────────────────────────────

    /// Sources-before-users order of every node reachable from `root`.
    pub fn toposort(&self, root: NodeId) -> Vec<NodeId> {
        self.toposort_gated(root, |_| true)
    }

    /// Like `toposort`, but only descends into nodes for which `gate`
    /// returns true. The gate sees nodes in discovery order, sources left
    /// to right, and may see a rejected node more than once.
    pub fn toposort_gated(&self, root: NodeId, mut gate: impl FnMut(NodeId) -> bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut done: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((id, visited)) = stack.pop() {
            if done.contains(&id) {
                continue;
            }
            if visited {
                done.insert(id);
                out.push(id);
            } else if gate(id) {
                stack.push((id, true));
                for &s in self.src(id).iter().rev() {
                    stack.push((s, false));
                }
            }
        }
        out
    }

    /// Distinct users of every node reachable from `root`.
    pub fn consumers(&self, root: NodeId) -> HashMap<NodeId, Vec<NodeId>> {
        let mut out: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in self.toposort(root) {
            for &s in self.src(id) {
                let users = out.entry(s).or_default();
                if !users.contains(&id) {
                    users.push(id);
                }
            }
        }
        out
    }

    /// One line per node, sources first.
    pub fn render(&self, root: NodeId) -> String {
        let mut out = String::new();
        for id in self.toposort(root) {
            let node = self.node(id);
            let _ = write!(out, "{} = {} {}", id, node.op, node.dtype);
            for s in &node.src {
                let _ = write!(out, " {}", s);
            }
            let arg = render_arg(&node.arg);
            if !arg.is_empty() {
                let _ = write!(out, " [{}]", arg);
            }
            if let Some(tag) = node.tag {
                let _ = write!(out, " tag={}", tag);
            }
            out.push('\n');
        }
        out
    }

    // ─── Derived facts ─────────────────────────────────────────────

    fn infer_shape(&self, node: &Node) -> Option<Vec<SInt>> {
        let src_shape = |i: usize| -> Option<&Vec<SInt>> {
            node.src
                .get(i)
                .and_then(|s| self.shapes[s.index()].as_ref())
        };
        match (node.op, &node.arg) {
            (Op::Buffer, Arg::Buffer { size, .. }) => Some(vec![SInt::from(*size)]),
            (Op::BufferView, Arg::BufferView { size, .. }) => Some(vec![SInt::from(*size)]),
            (Op::View, Arg::St(st)) => Some(st.shape().to_vec()),
            (Op::Reshape | Op::Expand, Arg::Shape(shape)) => Some(shape.clone()),
            (Op::Permute, Arg::Axes(axes)) => {
                let s = src_shape(0)?;
                axes.iter().map(|&a| s.get(a).cloned()).collect()
            }
            (Op::Pad, Arg::Pairs(pairs)) => Some(
                src_shape(0)?
                    .iter()
                    .zip(pairs.iter())
                    .map(|(s, (b, e))| s.clone() + b.clone() + e.clone())
                    .collect(),
            ),
            (Op::Shrink, Arg::Pairs(pairs)) => Some(
                pairs
                    .iter()
                    .map(|(b, e)| e.clone() - b.clone())
                    .collect(),
            ),
            (Op::Flip, _) => src_shape(0).cloned(),
            (Op::ReduceAxis, Arg::Reduce { axes, .. }) => Some(
                src_shape(0)?
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        if axes.contains(&i) {
                            SInt::Const(1)
                        } else {
                            s.clone()
                        }
                    })
                    .collect(),
            ),
            (Op::Store | Op::Load, _) => src_shape(0).cloned(),
            (
                Op::Const
                | Op::Device
                | Op::DefineGlobal
                | Op::DefineVar
                | Op::Bind
                | Op::Sink
                | Op::Kernel,
                _,
            ) => None,
            _ => node
                .src
                .iter()
                .find_map(|s| self.shapes[s.index()].clone()),
        }
    }

    fn infer_device(&self, node: &Node) -> Option<String> {
        match (node.op, &node.arg) {
            (Op::Device, Arg::Device(name)) => Some(name.clone()),
            (Op::Copy, _) => node
                .src
                .get(1)
                .and_then(|d| self.devices[d.index()].clone()),
            _ => node
                .src
                .iter()
                .find_map(|s| self.devices[s.index()].clone()),
        }
    }
}

fn render_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_arg(arg: &Arg) -> String {
    match arg {
        Arg::None => String::new(),
        Arg::Device(d) => d.clone(),
        Arg::Buffer { id, size } => format!("id={} size={}", id, size),
        Arg::BufferView { size, offset } => format!("size={} offset={}", size, offset),
        Arg::Const(v) => v.to_string(),
        Arg::Var(v) => format!("{}:{}..{}", v.name, v.min, v.max),
        Arg::Global(i) => format!("{}", i),
        Arg::St(st) => st.to_string(),
        Arg::Shape(s) => format!("({})", render_list(s)),
        Arg::Axes(a) => format!("({})", render_list(a)),
        Arg::Pairs(p) => p
            .iter()
            .map(|(b, e)| format!("{}:{}", b, e))
            .collect::<Vec<_>>()
            .join(", "),
        Arg::Reduce { op, axes } => format!("{:?} ({})", op, render_list(axes)),
        Arg::Info(info) => info.name.clone(),
        Arg::Kernel(k) => format!("ast={} metadata={}", k.ast, k.metadata.len()),
    }
}
