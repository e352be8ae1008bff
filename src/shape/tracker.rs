use std::fmt;

use super::sint::{SInt, VarVals, Variable};
use super::view::{unravel, View};
use super::ShapeError;

/// A stack of views, innermost first. The last view's shape is the shape
/// the tracker presents; each view's flat output indexes the shape of the
/// view below it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeTracker {
    pub views: Vec<View>,
}

impl ShapeTracker {
    pub fn from_shape(shape: Vec<SInt>) -> Self {
        Self {
            views: vec![View::from_shape(shape)],
        }
    }

    pub fn from_view(view: View) -> Self {
        Self { views: vec![view] }
    }

    fn last(&self) -> &View {
        // views is never empty
        &self.views[self.views.len() - 1]
    }

    pub fn shape(&self) -> &[SInt] {
        &self.last().shape
    }

    pub fn size(&self) -> SInt {
        self.last().size()
    }

    pub fn ndim(&self) -> usize {
        self.last().ndim()
    }

    /// A single view with row-major strides, no offset and no mask.
    pub fn contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].contiguous
    }

    /// Append `other`'s views and merge neighbours where possible.
    pub fn compose(&self, other: &ShapeTracker) -> ShapeTracker {
        let mut out = self.clone();
        for v in &other.views {
            out.views.push(v.clone());
            out.simplify();
        }
        out
    }

    fn simplify(&mut self) {
        while self.views.len() >= 2 {
            let n = self.views.len();
            match self.views[n - 2].merge(&self.views[n - 1]) {
                Some(merged) => {
                    self.views.truncate(n - 2);
                    self.views.push(merged);
                }
                None => break,
            }
        }
    }

    fn with_last(&self, view: View) -> ShapeTracker {
        let mut views = self.views.clone();
        let n = views.len();
        views[n - 1] = view;
        let mut st = ShapeTracker { views };
        st.simplify();
        st
    }

    pub fn permute(&self, axes: &[usize]) -> Result<ShapeTracker, ShapeError> {
        Ok(self.with_last(self.last().permute(axes)?))
    }

    pub fn expand(&self, shape: &[SInt]) -> Result<ShapeTracker, ShapeError> {
        Ok(self.with_last(self.last().expand(shape)?))
    }

    pub fn flip(&self, axes: &[usize]) -> Result<ShapeTracker, ShapeError> {
        Ok(self.with_last(self.last().flip(axes)?))
    }

    pub fn pad(&self, arg: &[(SInt, SInt)]) -> Result<ShapeTracker, ShapeError> {
        Ok(self.with_last(self.last().pad(arg)?))
    }

    pub fn shrink(&self, arg: &[(SInt, SInt)]) -> Result<ShapeTracker, ShapeError> {
        Ok(self.with_last(self.last().shrink(arg)?))
    }

    pub fn reshape(&self, shape: &[SInt]) -> Result<ShapeTracker, ShapeError> {
        let (old, new) = (self.size(), super::sint::prod(shape));
        if old != new && old.is_const() && new.is_const() {
            return Err(ShapeError::Invalid(format!(
                "cannot reshape {} elements into {:?}",
                old,
                shape.iter().map(ToString::to_string).collect::<Vec<_>>()
            )));
        }
        if let Some(v) = self.last().reshape(shape) {
            return Ok(self.with_last(v));
        }
        let mut views = self.views.clone();
        views.push(View::from_shape(shape.to_vec()));
        Ok(ShapeTracker { views })
    }

    /// Shape with each reduced axis set to 1.
    pub fn reduce(&self, axes: &[usize]) -> Vec<SInt> {
        self.shape()
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if axes.contains(&i) {
                    SInt::Const(1)
                } else {
                    s.clone()
                }
            })
            .collect()
    }

    pub fn vars(&self) -> Vec<Variable> {
        let mut out = Vec::new();
        for v in &self.views {
            v.vars(&mut out);
        }
        out
    }

    pub fn has_bound_vars(&self) -> bool {
        let (_, vals) = self.unbind();
        !vals.is_empty()
    }

    /// Replace bound variables by free ones, returning the bindings.
    pub fn unbind(&self) -> (ShapeTracker, VarVals) {
        let mut vals = VarVals::new();
        let views = self.views.iter().map(|v| v.unbind_into(&mut vals)).collect();
        (ShapeTracker { views }, vals)
    }

    /// Flat offset read for the multi-index `idx`, or `None` if any view
    /// masks it out.
    pub fn index(&self, idx: &[i64], vals: &VarVals) -> Result<Option<i64>, ShapeError> {
        let mut idx = idx.to_vec();
        for i in (0..self.views.len()).rev() {
            let flat = match self.views[i].index(&idx, vals)? {
                Some(f) => f,
                None => return Ok(None),
            };
            if i == 0 {
                return Ok(Some(flat));
            }
            let below = super::view::eval_shape(&self.views[i - 1].shape, vals)?;
            idx = unravel(&below, flat);
        }
        Ok(None)
    }

    /// Largest flat index reachable, plus one, when every view is constant.
    pub fn real_size(&self) -> Option<i64> {
        self.views[0].extent()
    }
}

impl fmt::Display for ShapeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShapeTracker(views=(")?;
        for (i, v) in self.views.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "))")
    }
}
