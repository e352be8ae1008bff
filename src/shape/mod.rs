//! Symbolic shapes and strided views.
//!
//! Every shaped node in the graph carries its layout as a `ShapeTracker`:
//! a stack of `View`s whose dimensions are `SInt`s, so a shape may depend
//! on runtime variables (`Variable`) that are bound only at execution.

mod sint;
mod tracker;
mod view;

pub use sint::{all_const, prod, SInt, Unbound, VarVals, Variable};
pub use tracker::ShapeTracker;
pub use view::{const_shape, eval_shape, strides_for_shape, unravel, View};

use thiserror::Error;

/// An invalid movement or an unresolvable symbolic quantity.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{op} expects {expected} axes, got {got}")]
    Rank {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("axis {axis} out of range for {ndim} dimensions")]
    Axis { axis: usize, ndim: usize },
    #[error("{0}")]
    Invalid(String),
    #[error("symbolic value not supported here: {0}")]
    Symbolic(String),
    #[error("{0}")]
    Unbound(String),
}

impl From<Unbound> for ShapeError {
    fn from(e: Unbound) -> Self {
        ShapeError::Unbound(e.to_string())
    }
}

/// Shorthand for a constant shape.
pub fn shape_of(dims: &[i64]) -> Vec<SInt> {
    dims.iter().map(|&d| SInt::Const(d)).collect()
}
