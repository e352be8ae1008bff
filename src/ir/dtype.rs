use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// Element types carried by graph nodes.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[rkyv(derive(Debug))]
pub enum DType {
    Void,
    Bool,
    I32,
    I64,
    F32,
    F64,
    Index,
}

impl DType {
    pub fn itemsize(self) -> usize {
        match self {
            DType::Void => 0,
            DType::Bool => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 | DType::Index => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_int(self) -> bool {
        matches!(self, DType::I32 | DType::I64 | DType::Index)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Void => "void",
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Index => "index",
        }
    }

    pub fn from_name(name: &str) -> Option<DType> {
        Some(match name {
            "bool" => DType::Bool,
            "i32" | "int" => DType::I32,
            "i64" | "long" => DType::I64,
            "f32" | "float" => DType::F32,
            "f64" | "double" => DType::F64,
            _ => return None,
        })
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar constant. Floats compare by bit pattern so constants can be
/// interned.
#[derive(Clone, Copy, Debug)]
pub enum ConstValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl ConstValue {
    /// The value `v` in the representation used by `dtype`.
    pub fn of(dtype: DType, v: f64) -> ConstValue {
        if dtype.is_float() {
            ConstValue::Float(v)
        } else if dtype == DType::Bool {
            ConstValue::Bool(v != 0.0)
        } else {
            ConstValue::Int(v as i64)
        }
    }

    pub fn zero(dtype: DType) -> ConstValue {
        ConstValue::of(dtype, 0.0)
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ConstValue::Float(v) => v,
            ConstValue::Int(v) => v as f64,
            ConstValue::Bool(v) => v as i64 as f64,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            ConstValue::Float(v) => v == 0.0,
            ConstValue::Int(v) => v == 0,
            ConstValue::Bool(v) => !v,
        }
    }

    fn key(self) -> (u8, u64) {
        match self {
            ConstValue::Float(v) => (0, v.to_bits()),
            ConstValue::Int(v) => (1, v as u64),
            ConstValue::Bool(v) => (2, v as u64),
        }
    }
}

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ConstValue {}

impl std::hash::Hash for ConstValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Float(v) => write!(f, "{:?}", v),
            ConstValue::Int(v) => write!(f, "{}", v),
            ConstValue::Bool(v) => write!(f, "{}", v),
        }
    }
}
