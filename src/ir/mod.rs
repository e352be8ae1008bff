//! The tensor graph IR.
//!
//! A graph is a hash-consed DAG of immutable `Node`s stored in a `Graph`
//! arena and addressed by `NodeId`. Interning makes structural equality
//! the same as id equality, so every pass can use `NodeId` as a map key.
//!
//! The same IR carries the front-end tensor graph, the normalized graph,
//! the kernelized graph (`Store(buffer, Kernel)` chains) and the
//! placeholder-only kernel ASTs.

mod builder;
mod dtype;
mod graph;
mod hash;

pub use dtype::{ConstValue, DType};
pub use graph::Graph;
pub use hash::ContentHash;

use std::fmt;

use crate::shape::{SInt, ShapeTracker, Variable};

// ─── Ops ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Sink,
    Device,
    Buffer,
    BufferView,
    Const,
    DefineVar,
    Bind,
    DefineGlobal,
    View,
    Reshape,
    Permute,
    Expand,
    Pad,
    Shrink,
    Flip,
    Neg,
    Exp2,
    Log2,
    Sqrt,
    Recip,
    Add,
    Mul,
    Max,
    CmpLt,
    Where,
    Cast,
    Bitcast,
    ReduceAxis,
    Contiguous,
    Detach,
    Copy,
    GBarrier,
    Fuse,
    Store,
    Load,
    Kernel,
}

impl Op {
    pub fn is_movement(self) -> bool {
        matches!(
            self,
            Op::Reshape | Op::Permute | Op::Expand | Op::Pad | Op::Shrink | Op::Flip
        )
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Op::Neg | Op::Exp2 | Op::Log2 | Op::Sqrt | Op::Recip)
    }

    pub fn is_binary(self) -> bool {
        matches!(self, Op::Add | Op::Mul | Op::Max | Op::CmpLt)
    }

    /// Arithmetic and comparison ops.
    pub fn is_alu(self) -> bool {
        self.is_unary() || self.is_binary() || self == Op::Where
    }

    /// Ops a view can be pushed through source by source.
    pub fn is_elementwise(self) -> bool {
        self.is_alu() || matches!(self, Op::Cast | Op::Bitcast)
    }

    /// Ops whose subgraph is a pure constant expression when every node in
    /// it is one of these.
    pub fn is_constexpr(self) -> bool {
        self.is_elementwise() || matches!(self, Op::Const | Op::View | Op::Device | Op::ReduceAxis)
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Sink => "sink",
            Op::Device => "device",
            Op::Buffer => "buffer",
            Op::BufferView => "buffer_view",
            Op::Const => "const",
            Op::DefineVar => "define_var",
            Op::Bind => "bind",
            Op::DefineGlobal => "define_global",
            Op::View => "view",
            Op::Reshape => "reshape",
            Op::Permute => "permute",
            Op::Expand => "expand",
            Op::Pad => "pad",
            Op::Shrink => "shrink",
            Op::Flip => "flip",
            Op::Neg => "neg",
            Op::Exp2 => "exp2",
            Op::Log2 => "log2",
            Op::Sqrt => "sqrt",
            Op::Recip => "recip",
            Op::Add => "add",
            Op::Mul => "mul",
            Op::Max => "max",
            Op::CmpLt => "cmplt",
            Op::Where => "where",
            Op::Cast => "cast",
            Op::Bitcast => "bitcast",
            Op::ReduceAxis => "reduce_axis",
            Op::Contiguous => "contiguous",
            Op::Detach => "detach",
            Op::Copy => "copy",
            Op::GBarrier => "gbarrier",
            Op::Fuse => "fuse",
            Op::Store => "store",
            Op::Load => "load",
            Op::Kernel => "kernel",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction combiner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReduceOp {
    Add,
    Max,
}

// ─── Node arguments ────────────────────────────────────────────────

/// Provenance label attached by the front-end.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct Metadata {
    pub name: String,
    pub caller: String,
}

impl Metadata {
    pub fn new(name: impl Into<String>, caller: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            caller: caller.into(),
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.caller.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.caller)
        }
    }
}

/// Display information carried on a kernel AST's `Sink`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelInfo {
    pub name: String,
}

/// A compute unit: a placeholder-only AST plus the provenance of every
/// node fused into it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Kernel {
    pub ast: NodeId,
    pub metadata: Vec<Metadata>,
}

/// Op-specific literal payload of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Arg {
    None,
    Device(String),
    Buffer { id: u64, size: usize },
    BufferView { size: usize, offset: usize },
    Const(ConstValue),
    Var(Variable),
    Global(usize),
    St(ShapeTracker),
    Shape(Vec<SInt>),
    Axes(Vec<usize>),
    Pairs(Vec<(SInt, SInt)>),
    Reduce { op: ReduceOp, axes: Vec<usize> },
    Info(KernelInfo),
    Kernel(Box<Kernel>),
}

// ─── Nodes ─────────────────────────────────────────────────────────

/// Index of a node in its `Graph`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub op: Op,
    pub dtype: DType,
    pub src: Vec<NodeId>,
    pub arg: Arg,
    pub tag: Option<u32>,
}

impl Node {
    pub fn new(op: Op, dtype: DType, src: Vec<NodeId>, arg: Arg) -> Self {
        Self {
            op,
            dtype,
            src,
            arg,
            tag: None,
        }
    }

    pub fn st(&self) -> Option<&ShapeTracker> {
        match &self.arg {
            Arg::St(st) => Some(st),
            _ => None,
        }
    }

    pub fn reduce_arg(&self) -> Option<(ReduceOp, &[usize])> {
        match &self.arg {
            Arg::Reduce { op, axes } => Some((*op, axes)),
            _ => None,
        }
    }

    pub fn kernel(&self) -> Option<&Kernel> {
        match &self.arg {
            Arg::Kernel(k) => Some(k),
            _ => None,
        }
    }

    pub fn const_value(&self) -> Option<ConstValue> {
        match self.arg {
            Arg::Const(v) => Some(v),
            _ => None,
        }
    }
}
