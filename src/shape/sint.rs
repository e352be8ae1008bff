//! Symbolic integers for shapes, strides, and offsets.
//!
//! An `SInt` is either a plain constant or a small expression over
//! named `Variable`s. Expressions are kept in a canonical form (constants
//! folded, nested sums/products flattened, terms sorted) so structural
//! equality is a usable stand-in for semantic equality in the common cases
//! view algebra cares about.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// Variable → value bindings.
pub type VarVals = BTreeMap<Variable, i64>;

/// A named symbolic dimension with an inclusive value range.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable {
    pub name: String,
    pub min: i64,
    pub max: i64,
}

impl Variable {
    pub fn new(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    /// The variable as a free symbolic integer.
    pub fn sint(&self) -> SInt {
        SInt::Var(self.clone())
    }

    /// The variable bound to a concrete value.
    pub fn bind(&self, value: i64) -> SInt {
        SInt::Bound(self.clone(), value)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A symbolic integer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SInt {
    Const(i64),
    Var(Variable),
    Bound(Variable, i64),
    Sum(Vec<SInt>),
    Prod(Vec<SInt>),
}

/// Failure to evaluate a symbolic integer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unbound(pub Variable);

impl fmt::Display for Unbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "variable '{}' has no value", self.0.name)
    }
}

impl SInt {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            SInt::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, SInt::Const(_))
    }

    /// True when the value is known to equal `v`.
    pub fn is(&self, v: i64) -> bool {
        self.as_const() == Some(v)
    }

    /// Evaluate with the given bindings. Bound variables fall back to their
    /// own value when the map has none.
    pub fn eval(&self, vals: &VarVals) -> Result<i64, Unbound> {
        match self {
            SInt::Const(v) => Ok(*v),
            SInt::Var(var) => vals.get(var).copied().ok_or_else(|| Unbound(var.clone())),
            SInt::Bound(var, v) => Ok(vals.get(var).copied().unwrap_or(*v)),
            SInt::Sum(terms) => terms.iter().try_fold(0i64, |acc, t| Ok(acc + t.eval(vals)?)),
            SInt::Prod(terms) => terms.iter().try_fold(1i64, |acc, t| Ok(acc * t.eval(vals)?)),
        }
    }

    /// Upper bound, assuming every variable takes its maximum. Only
    /// meaningful for the non-negative expressions shapes are built from.
    pub fn max_value(&self) -> i64 {
        match self {
            SInt::Const(v) => *v,
            SInt::Var(var) | SInt::Bound(var, _) => var.max,
            SInt::Sum(terms) => terms.iter().map(SInt::max_value).sum(),
            SInt::Prod(terms) => terms.iter().map(SInt::max_value).product(),
        }
    }

    /// Replace bound variables by free ones, returning the bindings.
    pub fn unbind(&self) -> (SInt, VarVals) {
        let mut vals = VarVals::new();
        let out = self.unbind_into(&mut vals);
        (out, vals)
    }

    pub(crate) fn unbind_into(&self, vals: &mut VarVals) -> SInt {
        match self {
            SInt::Bound(var, v) => {
                vals.insert(var.clone(), *v);
                SInt::Var(var.clone())
            }
            SInt::Sum(terms) => SInt::sum(terms.iter().map(|t| t.unbind_into(vals))),
            SInt::Prod(terms) => SInt::prod(terms.iter().map(|t| t.unbind_into(vals))),
            other => other.clone(),
        }
    }

    /// Collect every variable mentioned, bound or not.
    pub fn vars(&self, out: &mut Vec<Variable>) {
        match self {
            SInt::Const(_) => {}
            SInt::Var(var) | SInt::Bound(var, _) => {
                if !out.contains(var) {
                    out.push(var.clone());
                }
            }
            SInt::Sum(terms) | SInt::Prod(terms) => terms.iter().for_each(|t| t.vars(out)),
        }
    }

    /// Canonical n-ary sum.
    pub fn sum(terms: impl IntoIterator<Item = SInt>) -> SInt {
        let mut konst = 0i64;
        let mut rest = Vec::new();
        for t in terms {
            match t {
                SInt::Const(v) => konst += v,
                SInt::Sum(inner) => {
                    for t in inner {
                        match t {
                            SInt::Const(v) => konst += v,
                            t => rest.push(t),
                        }
                    }
                }
                t => rest.push(t),
            }
        }
        if rest.is_empty() {
            return SInt::Const(konst);
        }
        if konst == 0 && rest.len() == 1 {
            return rest.pop().unwrap_or(SInt::Const(0));
        }
        rest.sort();
        if konst != 0 {
            rest.push(SInt::Const(konst));
        }
        SInt::Sum(rest)
    }

    /// Canonical n-ary product.
    pub fn prod(terms: impl IntoIterator<Item = SInt>) -> SInt {
        let mut konst = 1i64;
        let mut rest = Vec::new();
        for t in terms {
            match t {
                SInt::Const(v) => konst *= v,
                SInt::Prod(inner) => {
                    for t in inner {
                        match t {
                            SInt::Const(v) => konst *= v,
                            t => rest.push(t),
                        }
                    }
                }
                t => rest.push(t),
            }
        }
        if konst == 0 || rest.is_empty() {
            return SInt::Const(konst);
        }
        if konst == 1 && rest.len() == 1 {
            return rest.pop().unwrap_or(SInt::Const(1));
        }
        rest.sort();
        if konst != 1 {
            rest.push(SInt::Const(konst));
        }
        SInt::Prod(rest)
    }

    /// `Some(a <= b)` when both sides are constant.
    pub fn le(&self, other: &SInt) -> Option<bool> {
        if self == other {
            return Some(true);
        }
        Some(self.as_const()? <= other.as_const()?)
    }

    /// Maximum of two values, defined when constant or structurally equal.
    pub fn smax(&self, other: &SInt) -> Option<SInt> {
        if self == other {
            return Some(self.clone());
        }
        Some(SInt::Const(self.as_const()?.max(other.as_const()?)))
    }

    /// Minimum of two values, defined when constant or structurally equal.
    pub fn smin(&self, other: &SInt) -> Option<SInt> {
        if self == other {
            return Some(self.clone());
        }
        Some(SInt::Const(self.as_const()?.min(other.as_const()?)))
    }
}

/// Product of a shape.
pub fn prod(shape: &[SInt]) -> SInt {
    SInt::prod(shape.iter().cloned())
}

/// True if every element is a constant.
pub fn all_const(values: &[SInt]) -> bool {
    values.iter().all(SInt::is_const)
}

impl Default for SInt {
    fn default() -> Self {
        SInt::Const(0)
    }
}

impl From<i64> for SInt {
    fn from(v: i64) -> Self {
        SInt::Const(v)
    }
}

impl From<usize> for SInt {
    fn from(v: usize) -> Self {
        SInt::Const(v as i64)
    }
}

impl From<&Variable> for SInt {
    fn from(v: &Variable) -> Self {
        SInt::Var(v.clone())
    }
}

impl Add for SInt {
    type Output = SInt;
    fn add(self, rhs: SInt) -> SInt {
        SInt::sum([self, rhs])
    }
}

impl Add<i64> for SInt {
    type Output = SInt;
    fn add(self, rhs: i64) -> SInt {
        SInt::sum([self, SInt::Const(rhs)])
    }
}

impl Mul for SInt {
    type Output = SInt;
    fn mul(self, rhs: SInt) -> SInt {
        SInt::prod([self, rhs])
    }
}

impl Mul<i64> for SInt {
    type Output = SInt;
    fn mul(self, rhs: i64) -> SInt {
        SInt::prod([self, SInt::Const(rhs)])
    }
}

impl Neg for SInt {
    type Output = SInt;
    fn neg(self) -> SInt {
        self * -1
    }
}

impl Sub for SInt {
    type Output = SInt;
    fn sub(self, rhs: SInt) -> SInt {
        self + (-rhs)
    }
}

impl fmt::Display for SInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SInt::Const(v) => write!(f, "{}", v),
            SInt::Var(var) => write!(f, "{}", var.name),
            SInt::Bound(var, v) => write!(f, "{}={}", var.name, v),
            SInt::Sum(terms) => {
                write!(f, "(")?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "+")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            SInt::Prod(terms) => {
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "*")?;
                    }
                    write!(f, "{}", t)?;
                }
                Ok(())
            }
        }
    }
}
