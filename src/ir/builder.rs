//! Shape-checked graph construction.
//!
//! This is the surface a tensor front-end uses to describe lazy
//! computations. Every method validates shapes and dtypes up front so the
//! passes downstream can rely on a well-formed graph.

use super::{Arg, ConstValue, DType, Graph, Metadata, NodeId, Op, ReduceOp};
use crate::error::GraphError;
use crate::shape::{SInt, ShapeTracker, Variable};

fn fmt_shape(shape: Option<&[SInt]>) -> String {
    match shape {
        Some(s) => format!(
            "({})",
            s.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ),
        None => "unshaped".to_string(),
    }
}

impl Graph {
    fn shaped(&self, op: Op, x: NodeId) -> Result<Vec<SInt>, GraphError> {
        self.shape(x)
            .map(<[SInt]>::to_vec)
            .ok_or_else(|| GraphError::malformed(op, format!("source {} has no shape", x)))
    }

    pub fn device_node(&mut self, name: &str) -> NodeId {
        self.new_node(Op::Device, DType::Void, vec![], Arg::Device(name.to_string()))
    }

    /// A fresh, unique buffer of `size` elements.
    pub fn buffer(&mut self, device: &str, dtype: DType, size: usize) -> NodeId {
        let dev = self.device_node(device);
        let id = self.alloc_buffer_id();
        self.new_node(Op::Buffer, dtype, vec![dev], Arg::Buffer { id, size })
    }

    /// A constant broadcast to `shape`.
    pub fn constant(&mut self, device: &str, dtype: DType, value: f64, shape: &[SInt]) -> NodeId {
        let dev = self.device_node(device);
        let c = self.new_node(
            Op::Const,
            dtype,
            vec![dev],
            Arg::Const(ConstValue::of(dtype, value)),
        );
        self.broadcast_const(c, shape)
    }

    fn broadcast_const(&mut self, c: NodeId, shape: &[SInt]) -> NodeId {
        let ones = ShapeTracker::from_shape(vec![SInt::Const(1); shape.len()]);
        // expanding ones to any shape of the same rank cannot fail
        let st = ones.expand(shape).unwrap_or(ones);
        self.view(c, st)
    }

    /// A constant with `x`'s dtype, device and shape.
    pub fn const_like(&mut self, x: NodeId, value: f64) -> NodeId {
        let dtype = self.dtype(x);
        let src = match self.device(x).map(str::to_string) {
            Some(d) => vec![self.device_node(&d)],
            None => vec![],
        };
        let c = self.new_node(Op::Const, dtype, src, Arg::Const(ConstValue::of(dtype, value)));
        match self.shape(x).map(<[SInt]>::to_vec) {
            Some(shape) => self.broadcast_const(c, &shape),
            None => c,
        }
    }

    // ─── Elementwise ───────────────────────────────────────────────

    fn check_same_shape(&self, op: Op, srcs: &[NodeId]) -> Result<(), GraphError> {
        let first = self.shape(srcs[0]);
        for &s in &srcs[1..] {
            if self.shape(s) != first {
                return Err(GraphError::ShapeMismatch {
                    op,
                    expected: fmt_shape(first),
                    got: fmt_shape(self.shape(s)),
                });
            }
        }
        Ok(())
    }

    pub fn unary(&mut self, op: Op, x: NodeId) -> Result<NodeId, GraphError> {
        if !op.is_unary() {
            return Err(GraphError::malformed(op, "not a unary op"));
        }
        self.shaped(op, x)?;
        let dtype = self.dtype(x);
        Ok(self.new_node(op, dtype, vec![x], Arg::None))
    }

    pub fn binary(&mut self, op: Op, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        if !op.is_binary() {
            return Err(GraphError::malformed(op, "not a binary op"));
        }
        self.check_same_shape(op, &[a, b])?;
        let (da, db) = (self.dtype(a), self.dtype(b));
        if da != db {
            return Err(GraphError::TypeMismatch {
                op,
                expected: da,
                got: db,
            });
        }
        let dtype = if op == Op::CmpLt { DType::Bool } else { da };
        Ok(self.new_node(op, dtype, vec![a, b], Arg::None))
    }

    pub fn where_(&mut self, cond: NodeId, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        self.check_same_shape(Op::Where, &[cond, a, b])?;
        if self.dtype(cond) != DType::Bool {
            return Err(GraphError::TypeMismatch {
                op: Op::Where,
                expected: DType::Bool,
                got: self.dtype(cond),
            });
        }
        let (da, db) = (self.dtype(a), self.dtype(b));
        if da != db {
            return Err(GraphError::TypeMismatch {
                op: Op::Where,
                expected: da,
                got: db,
            });
        }
        Ok(self.new_node(Op::Where, da, vec![cond, a, b], Arg::None))
    }

    pub fn cast(&mut self, x: NodeId, dtype: DType) -> NodeId {
        if self.dtype(x) == dtype {
            return x;
        }
        self.new_node(Op::Cast, dtype, vec![x], Arg::None)
    }

    pub fn bitcast(&mut self, x: NodeId, dtype: DType) -> Result<NodeId, GraphError> {
        let from = self.dtype(x);
        if from.itemsize() != dtype.itemsize() {
            return Err(GraphError::TypeMismatch {
                op: Op::Bitcast,
                expected: from,
                got: dtype,
            });
        }
        Ok(self.new_node(Op::Bitcast, dtype, vec![x], Arg::None))
    }

    // ─── Movement ──────────────────────────────────────────────────

    fn movement(&mut self, op: Op, x: NodeId, arg: Arg) -> NodeId {
        let dtype = self.dtype(x);
        self.new_node(op, dtype, vec![x], arg)
    }

    pub fn reshape(&mut self, x: NodeId, shape: &[SInt]) -> Result<NodeId, GraphError> {
        let old = self.shaped(Op::Reshape, x)?;
        if old == shape {
            return Ok(x);
        }
        ShapeTracker::from_shape(old)
            .reshape(shape)
            .map_err(|e| GraphError::movement(Op::Reshape, e))?;
        Ok(self.movement(Op::Reshape, x, Arg::Shape(shape.to_vec())))
    }

    pub fn permute(&mut self, x: NodeId, axes: &[usize]) -> Result<NodeId, GraphError> {
        let old = self.shaped(Op::Permute, x)?;
        ShapeTracker::from_shape(old)
            .permute(axes)
            .map_err(|e| GraphError::movement(Op::Permute, e))?;
        if axes.iter().enumerate().all(|(i, &a)| i == a) {
            return Ok(x);
        }
        Ok(self.movement(Op::Permute, x, Arg::Axes(axes.to_vec())))
    }

    pub fn expand(&mut self, x: NodeId, shape: &[SInt]) -> Result<NodeId, GraphError> {
        let old = self.shaped(Op::Expand, x)?;
        if old == shape {
            return Ok(x);
        }
        ShapeTracker::from_shape(old)
            .expand(shape)
            .map_err(|e| GraphError::movement(Op::Expand, e))?;
        Ok(self.movement(Op::Expand, x, Arg::Shape(shape.to_vec())))
    }

    pub fn pad(&mut self, x: NodeId, pads: &[(SInt, SInt)]) -> Result<NodeId, GraphError> {
        let old = self.shaped(Op::Pad, x)?;
        ShapeTracker::from_shape(old)
            .pad(pads)
            .map_err(|e| GraphError::movement(Op::Pad, e))?;
        if pads.iter().all(|(b, e)| b.is(0) && e.is(0)) {
            return Ok(x);
        }
        Ok(self.movement(Op::Pad, x, Arg::Pairs(pads.to_vec())))
    }

    pub fn shrink(&mut self, x: NodeId, window: &[(SInt, SInt)]) -> Result<NodeId, GraphError> {
        let old = self.shaped(Op::Shrink, x)?;
        ShapeTracker::from_shape(old.clone())
            .shrink(window)
            .map_err(|e| GraphError::movement(Op::Shrink, e))?;
        if window
            .iter()
            .zip(old.iter())
            .all(|((b, e), s)| b.is(0) && e == s)
        {
            return Ok(x);
        }
        Ok(self.movement(Op::Shrink, x, Arg::Pairs(window.to_vec())))
    }

    pub fn flip(&mut self, x: NodeId, axes: &[usize]) -> Result<NodeId, GraphError> {
        let old = self.shaped(Op::Flip, x)?;
        ShapeTracker::from_shape(old)
            .flip(axes)
            .map_err(|e| GraphError::movement(Op::Flip, e))?;
        if axes.is_empty() {
            return Ok(x);
        }
        Ok(self.movement(Op::Flip, x, Arg::Axes(axes.to_vec())))
    }

    // ─── Reductions and markers ────────────────────────────────────

    /// Reduce over `axes`, keeping them as size-1 dimensions.
    ///
    /// The reduction node itself always reduces trailing axes: kept axes
    /// that sit after the first reduced one are permuted in front, and
    /// the result is reshaped back to the keepdim shape.
    pub fn reduce(&mut self, x: NodeId, op: ReduceOp, axes: &[usize]) -> Result<NodeId, GraphError> {
        let shape = self.shaped(Op::ReduceAxis, x)?;
        if let Some(&bad) = axes.iter().find(|&&a| a >= shape.len()) {
            return Err(GraphError::InvalidMovement {
                op: Op::ReduceAxis,
                reason: format!("axis {} out of range for {} dimensions", bad, shape.len()),
            });
        }
        let mut axes: Vec<usize> = axes.iter().copied().filter(|&a| !shape[a].is(1)).collect();
        axes.sort_unstable();
        axes.dedup();
        let Some(&first) = axes.first() else {
            return Ok(x);
        };

        let move_early: Vec<usize> = (first..shape.len()).filter(|i| !axes.contains(i)).collect();
        let (src, new_axes) = if move_early.is_empty() {
            (x, axes.clone())
        } else {
            let order: Vec<usize> = (0..first)
                .chain(move_early.iter().copied())
                .chain(axes.iter().copied())
                .collect();
            let permuted = self.permute(x, &order)?;
            let start = first + move_early.len();
            (permuted, (start..start + axes.len()).collect())
        };

        let dtype = self.dtype(x);
        let r = self.new_node(
            Op::ReduceAxis,
            dtype,
            vec![src],
            Arg::Reduce {
                op,
                axes: new_axes,
            },
        );
        let keepdim: Vec<SInt> = shape
            .iter()
            .enumerate()
            .map(|(i, s)| if axes.contains(&i) { SInt::Const(1) } else { s.clone() })
            .collect();
        self.reshape(r, &keepdim)
    }

    fn marker(&mut self, op: Op, x: NodeId) -> NodeId {
        let dtype = self.dtype(x);
        self.new_node(op, dtype, vec![x], Arg::None)
    }

    /// Force `x` to be materialized.
    pub fn contiguous(&mut self, x: NodeId) -> NodeId {
        self.marker(Op::Contiguous, x)
    }

    pub fn detach(&mut self, x: NodeId) -> NodeId {
        self.marker(Op::Detach, x)
    }

    /// Keep `x` and everything it reads in one kernel.
    pub fn fuse(&mut self, x: NodeId) -> NodeId {
        self.marker(Op::Fuse, x)
    }

    pub fn copy_to(&mut self, x: NodeId, device: &str) -> NodeId {
        let dev = self.device_node(device);
        let dtype = self.dtype(x);
        self.new_node(Op::Copy, dtype, vec![x, dev], Arg::None)
    }

    pub fn store(&mut self, target: NodeId, value: NodeId) -> NodeId {
        let dtype = self.dtype(value);
        self.new_node(Op::Store, dtype, vec![target, value], Arg::None)
    }

    // ─── Variables ─────────────────────────────────────────────────

    pub fn define_var(&mut self, var: &Variable) -> NodeId {
        self.new_node(Op::DefineVar, DType::Index, vec![], Arg::Var(var.clone()))
    }

    /// `Bind(DefineVar, Const)`.
    pub fn bind(&mut self, var: &Variable, value: i64) -> Result<NodeId, GraphError> {
        if value < var.min || value > var.max {
            return Err(GraphError::Symbolic(format!(
                "{} = {} is outside [{}, {}]",
                var.name, value, var.min, var.max
            )));
        }
        let dv = self.define_var(var);
        let c = self.new_node(
            Op::Const,
            DType::Index,
            vec![],
            Arg::Const(ConstValue::Int(value)),
        );
        Ok(self.new_node(Op::Bind, DType::Index, vec![dv, c], Arg::None))
    }

    pub fn sink(&mut self, srcs: Vec<NodeId>) -> NodeId {
        self.new_node(Op::Sink, DType::Void, srcs, Arg::None)
    }

    /// Attach a provenance label to `x`.
    pub fn label(&mut self, x: NodeId, name: &str, caller: &str) -> NodeId {
        self.set_metadata(x, Metadata::new(name, caller));
        x
    }
}
