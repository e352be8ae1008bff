//! Error types, one enum per layer.

use thiserror::Error;

use crate::ir::{DType, Op};
use crate::shape::ShapeError;

/// Structural violations in the graph or its transformations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("reduce axes {axes:?} are not the trailing axes of a {ndim}-d input")]
    ReduceAxisOrder { axes: Vec<usize>, ndim: usize },
    #[error("variable '{var}' bound to both {first} and {second}")]
    ConflictingBinding { var: String, first: i64, second: i64 },
    #[error("kernel input must be a store, buffer, buffer view or bind, not {0}")]
    InvalidKernelInput(Op),
    #[error("{remaining} kernels form a dependency cycle")]
    ScheduleCycle { remaining: usize },
    #[error("rewrite pass '{pass}' did not reach a fixpoint in {steps} steps")]
    NoFixpoint { pass: &'static str, steps: usize },
    #[error("{op}: shape {expected} does not match {got}")]
    ShapeMismatch {
        op: Op,
        expected: String,
        got: String,
    },
    #[error("{op}: dtype {expected} does not match {got}")]
    TypeMismatch { op: Op, expected: DType, got: DType },
    #[error("invalid {op}: {reason}")]
    InvalidMovement { op: Op, reason: String },
    #[error("{0}")]
    Symbolic(String),
    #[error("malformed {op} node: {reason}")]
    Malformed { op: Op, reason: String },
}

impl GraphError {
    pub(crate) fn movement(op: Op, e: ShapeError) -> Self {
        match e {
            ShapeError::Symbolic(s) | ShapeError::Unbound(s) => GraphError::Symbolic(s),
            other => GraphError::InvalidMovement {
                op,
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn malformed(op: Op, reason: impl Into<String>) -> Self {
        GraphError::Malformed {
            op,
            reason: reason.into(),
        }
    }
}

/// Size, dtype and device of a runtime buffer, for error reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferAttrs {
    pub device: String,
    pub size: usize,
    pub dtype: DType,
}

impl std::fmt::Display for BufferAttrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {} on {}", self.size, self.dtype, self.device)
    }
}

/// Violated execution preconditions.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("buffer copy mismatch: dest {dest}, src {src}")]
    CopyMismatch { dest: BufferAttrs, src: BufferAttrs },
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("variable '{0}' has no value")]
    UnboundVariable(String),
    #[error("device error: {0}")]
    Device(String),
}

/// Failures turning a schedule item into something runnable.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LowerError {
    #[error("render failed: {0}")]
    Render(String),
    #[error("compile failed: {0}")]
    Compile(String),
    #[error("program load failed: {0}")]
    Load(String),
    #[error("cannot lower {0}")]
    UnsupportedAst(String),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("program cache unavailable: {0}")]
    Cache(String),
}

/// Errors from the execution engine.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("lowering kernel '{kernel}' failed ({provenance}): {source}")]
    Lower {
        kernel: String,
        provenance: String,
        source: LowerError,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Any error the library returns.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
