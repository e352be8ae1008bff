use std::fmt;

use super::sint::{all_const, prod, SInt, VarVals};
use super::ShapeError;

/// Row-major strides for `shape`, with 0 on size-1 axes.
pub fn strides_for_shape(shape: &[SInt]) -> Vec<SInt> {
    let mut strides = vec![SInt::Const(0); shape.len()];
    let mut acc = SInt::Const(1);
    for i in (0..shape.len()).rev() {
        strides[i] = if shape[i].is(1) {
            SInt::Const(0)
        } else {
            acc.clone()
        };
        acc = acc * shape[i].clone();
    }
    strides
}

/// A strided window onto a flat index space.
///
/// `mask`, when present, gives the valid `[begin, end)` range per axis;
/// indices outside it read as zero.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct View {
    pub shape: Vec<SInt>,
    pub strides: Vec<SInt>,
    pub offset: SInt,
    pub mask: Option<Vec<(SInt, SInt)>>,
    pub contiguous: bool,
}

impl View {
    /// Build a view in canonical form.
    pub fn create(
        shape: Vec<SInt>,
        strides: Option<Vec<SInt>>,
        offset: SInt,
        mask: Option<Vec<(SInt, SInt)>>,
    ) -> View {
        let mut strides = match strides {
            Some(s) => s
                .into_iter()
                .zip(shape.iter())
                .map(|(st, sh)| if sh.is(1) { SInt::Const(0) } else { st })
                .collect(),
            None => strides_for_shape(&shape),
        };
        let mut offset = offset;
        let mut mask = mask;

        if let Some(m) = &mask {
            let empty = m.iter().any(|(b, e)| e.le(b) == Some(true));
            if empty {
                strides = vec![SInt::Const(0); shape.len()];
                offset = SInt::Const(0);
                mask = Some(vec![(SInt::Const(0), SInt::Const(0)); shape.len()]);
            } else {
                let full = m
                    .iter()
                    .zip(shape.iter())
                    .all(|((b, e), s)| b.is(0) && e == s);
                if full {
                    mask = None;
                } else {
                    // Masked-to-one axes contribute a fixed offset.
                    for (i, (b, e)) in m.iter().enumerate() {
                        if let (Some(b), Some(e)) = (b.as_const(), e.as_const()) {
                            if e - b == 1 && !strides[i].is(0) {
                                offset = offset + strides[i].clone() * b;
                                strides[i] = SInt::Const(0);
                            }
                        }
                    }
                }
            }
        }

        let contiguous =
            offset.is(0) && mask.is_none() && strides == strides_for_shape(&shape);
        View {
            shape,
            strides,
            offset,
            mask,
            contiguous,
        }
    }

    /// The contiguous view of a shape.
    pub fn from_shape(shape: Vec<SInt>) -> View {
        View::create(shape, None, SInt::Const(0), None)
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> SInt {
        prod(&self.shape)
    }

    /// Largest flat index this view can touch, plus one. Zero for a view
    /// whose mask is empty.
    pub fn extent(&self) -> Option<i64> {
        let mut hi = self.offset.as_const()?;
        for (i, (s, st)) in self.shape.iter().zip(self.strides.iter()).enumerate() {
            let (b, e) = match &self.mask {
                Some(m) => (m[i].0.as_const()?, m[i].1.as_const()?),
                None => (0, s.as_const()?),
            };
            if e <= b {
                return Some(0);
            }
            let st = st.as_const()?;
            hi += (st * b).max(st * (e - 1));
        }
        Some(hi + 1)
    }

    pub fn has_vars(&self) -> bool {
        let mut vars = Vec::new();
        self.vars(&mut vars);
        !vars.is_empty()
    }

    pub fn vars(&self, out: &mut Vec<super::Variable>) {
        for s in self.shape.iter().chain(self.strides.iter()) {
            s.vars(out);
        }
        self.offset.vars(out);
        if let Some(m) = &self.mask {
            for (b, e) in m {
                b.vars(out);
                e.vars(out);
            }
        }
    }

    /// Replace bound variables by free ones, collecting the bindings.
    pub fn unbind_into(&self, vals: &mut VarVals) -> View {
        let map = |v: &SInt, vals: &mut VarVals| v.unbind_into(vals);
        View {
            shape: self.shape.iter().map(|s| map(s, vals)).collect(),
            strides: self.strides.iter().map(|s| map(s, vals)).collect(),
            offset: map(&self.offset, vals),
            mask: self.mask.as_ref().map(|m| {
                m.iter()
                    .map(|(b, e)| (map(b, vals), map(e, vals)))
                    .collect()
            }),
            contiguous: self.contiguous,
        }
    }

    // ─── Movement ──────────────────────────────────────────────────

    pub fn permute(&self, axes: &[usize]) -> Result<View, ShapeError> {
        check_permutation(axes, self.ndim())?;
        Ok(View::create(
            axes.iter().map(|&a| self.shape[a].clone()).collect(),
            Some(axes.iter().map(|&a| self.strides[a].clone()).collect()),
            self.offset.clone(),
            self.mask
                .as_ref()
                .map(|m| axes.iter().map(|&a| m[a].clone()).collect()),
        ))
    }

    pub fn expand(&self, new_shape: &[SInt]) -> Result<View, ShapeError> {
        if new_shape.len() != self.ndim() {
            return Err(ShapeError::Rank {
                op: "expand",
                expected: self.ndim(),
                got: new_shape.len(),
            });
        }
        for (old, new) in self.shape.iter().zip(new_shape.iter()) {
            if old != new && !old.is(1) {
                return Err(ShapeError::Invalid(format!(
                    "cannot expand axis of size {} to {}",
                    old, new
                )));
            }
        }
        if self.shape.iter().any(|s| s.is(0)) {
            return Ok(View::from_shape(new_shape.to_vec()));
        }
        let mask = self.mask.as_ref().map(|m| {
            m.iter()
                .zip(self.shape.iter().zip(new_shape.iter()))
                .map(|((b, e), (old, new))| {
                    if old == new {
                        (b.clone(), e.clone())
                    } else if b.is(0) && e.is(1) {
                        (SInt::Const(0), new.clone())
                    } else {
                        (SInt::Const(0), SInt::Const(0))
                    }
                })
                .collect()
        });
        Ok(View::create(
            new_shape.to_vec(),
            Some(self.strides.clone()),
            self.offset.clone(),
            mask,
        ))
    }

    pub fn flip(&self, axes: &[usize]) -> Result<View, ShapeError> {
        for &a in axes {
            if a >= self.ndim() {
                return Err(ShapeError::Axis {
                    axis: a,
                    ndim: self.ndim(),
                });
            }
        }
        let mut strides = self.strides.clone();
        let mut offset = self.offset.clone();
        let mut mask = self.mask.clone();
        for &a in axes {
            let s = self.shape[a].clone();
            offset = offset + (s.clone() - SInt::Const(1)) * strides[a].clone();
            strides[a] = -strides[a].clone();
            if let Some(m) = mask.as_mut() {
                let (b, e) = m[a].clone();
                m[a] = (s.clone() - e, s - b);
            }
        }
        Ok(View::create(self.shape.clone(), Some(strides), offset, mask))
    }

    /// Zero-pad each axis by `(before, after)`.
    pub fn pad(&self, arg: &[(SInt, SInt)]) -> Result<View, ShapeError> {
        if arg.len() != self.ndim() {
            return Err(ShapeError::Rank {
                op: "pad",
                expected: self.ndim(),
                got: arg.len(),
            });
        }
        if arg.iter().all(|(b, e)| b.is(0) && e.is(0)) {
            return Ok(self.clone());
        }
        if arg
            .iter()
            .any(|(b, e)| b.as_const().is_some_and(|b| b < 0) || e.as_const().is_some_and(|e| e < 0))
        {
            return Err(ShapeError::Invalid("negative padding".to_string()));
        }
        let resize: Vec<(SInt, SInt)> = arg
            .iter()
            .zip(self.shape.iter())
            .map(|((b, e), s)| (-b.clone(), s.clone() + e.clone()))
            .collect();
        let mask: Vec<(SInt, SInt)> = arg
            .iter()
            .zip(self.shape.iter())
            .map(|((b, _), s)| (b.clone(), s.clone() + b.clone()))
            .collect();
        self.resize(&resize, Some(mask))
    }

    /// Keep the `[begin, end)` window of each axis.
    pub fn shrink(&self, arg: &[(SInt, SInt)]) -> Result<View, ShapeError> {
        if arg.len() != self.ndim() {
            return Err(ShapeError::Rank {
                op: "shrink",
                expected: self.ndim(),
                got: arg.len(),
            });
        }
        for ((b, e), s) in arg.iter().zip(self.shape.iter()) {
            let in_range = b.as_const().map_or(true, |b| b >= 0)
                && b.le(e) != Some(false)
                && e.le(s) != Some(false);
            if !in_range {
                return Err(ShapeError::Invalid(format!(
                    "shrink window {}:{} out of range for axis of size {}",
                    b, e, s
                )));
            }
        }
        self.resize(arg, None)
    }

    fn resize(
        &self,
        arg: &[(SInt, SInt)],
        mask: Option<Vec<(SInt, SInt)>>,
    ) -> Result<View, ShapeError> {
        let offset = SInt::sum(
            self.strides
                .iter()
                .zip(arg.iter())
                .map(|(st, (b, _))| st.clone() * b.clone()),
        );
        let mask = match &self.mask {
            Some(old) => {
                let zero = SInt::Const(0);
                let mut moved = Vec::with_capacity(old.len());
                for ((mb, me), (ab, ae)) in old.iter().zip(arg.iter()) {
                    let width = ae.clone() - ab.clone();
                    let lo = symbolic(
                        (mb.clone() - ab.clone())
                            .smin(&width)
                            .and_then(|v| v.smax(&zero)),
                    )?;
                    let hi = symbolic(
                        (me.clone() - ab.clone())
                            .smin(&width)
                            .and_then(|v| v.smax(&zero)),
                    )?;
                    moved.push((lo, hi));
                }
                match mask {
                    Some(new) => {
                        let mut merged = Vec::with_capacity(moved.len());
                        for ((b1, e1), (b2, e2)) in moved.iter().zip(new.iter()) {
                            merged.push((symbolic(b1.smax(b2))?, symbolic(e1.smin(e2))?));
                        }
                        Some(merged)
                    }
                    None => Some(moved),
                }
            }
            None => mask,
        };
        Ok(View::create(
            arg.iter().map(|(b, e)| e.clone() - b.clone()).collect(),
            Some(self.strides.clone()),
            self.offset.clone() + offset,
            mask,
        ))
    }

    /// Reinterpret the view with a new shape of the same size without
    /// copying. `None` when no single view can express the result.
    pub fn reshape(&self, new_shape: &[SInt]) -> Option<View> {
        if self.shape.as_slice() == new_shape {
            return Some(self.clone());
        }
        if self.shape.iter().any(|s| s.is(0)) {
            return Some(View::from_shape(new_shape.to_vec()));
        }
        if self.contiguous {
            return Some(View::from_shape(new_shape.to_vec()));
        }
        if let Some(m) = &self.mask {
            if m.iter().all(|(b, e)| b.is(0) && e.is(0)) {
                let empty = vec![(SInt::Const(0), SInt::Const(0)); new_shape.len()];
                return Some(View::create(new_shape.to_vec(), None, SInt::Const(0), Some(empty)));
            }
        }

        // Non-unit axes of the old view with their stride and mask.
        let old: Vec<(SInt, SInt, Option<(SInt, SInt)>)> = (0..self.ndim())
            .filter(|&i| !self.shape[i].is(1))
            .map(|i| {
                (
                    self.shape[i].clone(),
                    self.strides[i].clone(),
                    self.mask.as_ref().map(|m| m[i].clone()),
                )
            })
            .collect();
        let new_idx: Vec<usize> = (0..new_shape.len())
            .filter(|&i| !new_shape[i].is(1))
            .collect();

        let mut strides = vec![SInt::Const(0); new_shape.len()];
        let mut mask: Option<Vec<(SInt, SInt)>> = self
            .mask
            .as_ref()
            .map(|_| new_shape.iter().map(|s| (SInt::Const(0), s.clone())).collect());

        let (mut oi, mut ni) = (0usize, 0usize);
        while oi < old.len() && ni < new_idx.len() {
            let (mut oj, mut nj) = (oi + 1, ni + 1);
            let mut op = old[oi].0.clone();
            let mut np = new_shape[new_idx[ni]].clone();
            while op != np {
                let (o, n) = (op.as_const()?, np.as_const()?);
                if n < o {
                    np = np * new_shape[*new_idx.get(nj)?].clone();
                    nj += 1;
                } else {
                    op = op * old.get(oj)?.0.clone();
                    oj += 1;
                }
            }
            for k in oi..oj - 1 {
                if old[k].1 != old[k + 1].1.clone() * old[k + 1].0.clone() {
                    return None;
                }
            }
            if let Some(mask) = mask.as_mut() {
                let group_full = old[oi..oj].iter().all(|(s, _, m)| match m {
                    Some((b, e)) => b.is(0) && e == s,
                    None => true,
                });
                if !group_full {
                    if oj - oi != 1 || nj - ni != 1 {
                        return None;
                    }
                    mask[new_idx[ni]] = old[oi].2.clone()?;
                }
            }
            strides[new_idx[nj - 1]] = old[oj - 1].1.clone();
            for k in (ni + 1..nj).rev() {
                strides[new_idx[k - 1]] =
                    strides[new_idx[k]].clone() * new_shape[new_idx[k]].clone();
            }
            oi = oj;
            ni = nj;
        }
        if oi != old.len() || ni != new_idx.len() {
            return None;
        }
        Some(View::create(
            new_shape.to_vec(),
            Some(strides),
            self.offset.clone(),
            mask,
        ))
    }

    /// Collapse `outer` (applied to this view's shape) onto `self`.
    /// `None` when the pair has no single-view equivalent.
    pub fn merge(&self, outer: &View) -> Option<View> {
        if self.contiguous {
            return Some(outer.clone());
        }
        if outer.contiguous {
            if outer.shape == self.shape {
                return Some(self.clone());
            }
            if outer.size() == self.size() {
                if let Some(v) = self.reshape(&outer.shape) {
                    return Some(v);
                }
            }
        }
        if self.mask.is_some() {
            return None;
        }
        let flat = self.reshape(&[self.size()])?;
        let step = flat.strides[0].clone();
        Some(View::create(
            outer.shape.clone(),
            Some(
                outer
                    .strides
                    .iter()
                    .map(|s| s.clone() * step.clone())
                    .collect(),
            ),
            flat.offset.clone() + outer.offset.clone() * step,
            outer.mask.clone(),
        ))
    }

    /// Flat index for `idx`, or `None` when masked out.
    pub fn index(&self, idx: &[i64], vals: &VarVals) -> Result<Option<i64>, ShapeError> {
        if let Some(m) = &self.mask {
            for (i, (b, e)) in m.iter().enumerate() {
                let (b, e) = (b.eval(vals)?, e.eval(vals)?);
                if idx[i] < b || idx[i] >= e {
                    return Ok(None);
                }
            }
        }
        let mut out = self.offset.eval(vals)?;
        for (i, st) in self.strides.iter().enumerate() {
            out += idx[i] * st.eval(vals)?;
        }
        Ok(Some(out))
    }
}

fn symbolic(v: Option<SInt>) -> Result<SInt, ShapeError> {
    v.ok_or_else(|| ShapeError::Symbolic("mask bounds must be constant".to_string()))
}

pub(crate) fn check_permutation(axes: &[usize], ndim: usize) -> Result<(), ShapeError> {
    let mut seen = vec![false; ndim];
    if axes.len() != ndim {
        return Err(ShapeError::Rank {
            op: "permute",
            expected: ndim,
            got: axes.len(),
        });
    }
    for &a in axes {
        if a >= ndim || seen[a] {
            return Err(ShapeError::Invalid(format!(
                "{:?} is not a permutation of {} axes",
                axes, ndim
            )));
        }
        seen[a] = true;
    }
    Ok(())
}

/// Row-major multi-index of `flat` within `shape`.
pub fn unravel(shape: &[i64], mut flat: i64) -> Vec<i64> {
    let mut idx = vec![0; shape.len()];
    for i in (0..shape.len()).rev() {
        if shape[i] > 0 {
            idx[i] = flat % shape[i];
            flat /= shape[i];
        }
    }
    idx
}

/// Evaluate a shape with concrete bindings.
pub fn eval_shape(shape: &[SInt], vals: &VarVals) -> Result<Vec<i64>, ShapeError> {
    shape
        .iter()
        .map(|s| s.eval(vals).map_err(ShapeError::from))
        .collect()
}

fn fmt_list(f: &mut fmt::Formatter<'_>, items: &[SInt]) -> fmt::Result {
    write!(f, "(")?;
    for (i, s) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", s)?;
    }
    if items.len() == 1 {
        write!(f, ",")?;
    }
    write!(f, ")")
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View(shape=")?;
        fmt_list(f, &self.shape)?;
        write!(f, ", strides=")?;
        fmt_list(f, &self.strides)?;
        write!(f, ", offset={}, mask=", self.offset)?;
        match &self.mask {
            None => write!(f, "None")?,
            Some(m) => {
                write!(f, "(")?;
                for (i, (b, e)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({}, {})", b, e)?;
                }
                write!(f, ")")?;
            }
        }
        write!(f, ")")
    }
}

/// All-constant helper used by callers that need a concrete shape.
pub fn const_shape(shape: &[SInt]) -> Option<Vec<i64>> {
    if !all_const(shape) {
        return None;
    }
    shape.iter().map(SInt::as_const).collect()
}
