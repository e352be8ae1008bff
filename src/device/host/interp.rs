//! Evaluating a `HostProgram`.
//!
//! Values are carried as `f64` and narrowed to each instruction's dtype
//! after every step, so integer results wrap and `f32` results round the
//! way the stored bytes would.

use crate::error::ExecError;
use crate::ir::DType;
use crate::shape::unravel;

use super::program::{Alu, HostOp, HostProgram, HostReduce, HostView, Sym};

fn device_err(msg: impl Into<String>) -> ExecError {
    ExecError::Device(msg.into())
}

// ─── Element codec ─────────────────────────────────────────────────

/// Narrow `v` to what `dtype` can hold.
pub fn normalize(dtype: DType, v: f64) -> f64 {
    match dtype {
        DType::Bool => (v != 0.0) as i64 as f64,
        DType::I32 => (v as i64) as i32 as f64,
        DType::I64 | DType::Index => (v as i64) as f64,
        DType::F32 => (v as f32) as f64,
        DType::F64 | DType::Void => v,
    }
}

pub fn read_elem(dtype: DType, bytes: &[u8], i: usize) -> Result<f64, ExecError> {
    let size = dtype.itemsize();
    let start = i * size;
    let b = bytes
        .get(start..start + size)
        .ok_or_else(|| device_err(format!("read of element {} out of bounds", i)))?;
    Ok(match dtype {
        DType::Bool => (b[0] != 0) as i64 as f64,
        DType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        DType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        DType::I64 | DType::Index => {
            i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
        }
        DType::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        DType::Void => return Err(device_err("read of a void element")),
    })
}

pub fn write_elem(dtype: DType, bytes: &mut [u8], i: usize, v: f64) -> Result<(), ExecError> {
    let size = dtype.itemsize();
    let start = i * size;
    let b = bytes
        .get_mut(start..start + size)
        .ok_or_else(|| device_err(format!("write of element {} out of bounds", i)))?;
    match dtype {
        DType::Bool => b[0] = (v != 0.0) as u8,
        DType::I32 => b.copy_from_slice(&(v as i64 as i32).to_le_bytes()),
        DType::F32 => b.copy_from_slice(&(v as f32).to_le_bytes()),
        DType::I64 | DType::Index => b.copy_from_slice(&(v as i64).to_le_bytes()),
        DType::F64 => b.copy_from_slice(&v.to_le_bytes()),
        DType::Void => return Err(device_err("write of a void element")),
    }
    Ok(())
}

/// Decode a whole buffer.
pub fn decode(dtype: DType, bytes: &[u8]) -> Result<Vec<f64>, ExecError> {
    let size = dtype.itemsize();
    if size == 0 {
        return Err(device_err("cannot decode void elements"));
    }
    (0..bytes.len() / size).map(|i| read_elem(dtype, bytes, i)).collect()
}

pub fn encode(dtype: DType, values: &[f64]) -> Result<Vec<u8>, ExecError> {
    let mut out = vec![0u8; values.len() * dtype.itemsize()];
    for (i, &v) in values.iter().enumerate() {
        write_elem(dtype, &mut out, i, v)?;
    }
    Ok(out)
}

fn bitcast(from: DType, to: DType, v: f64) -> Result<f64, ExecError> {
    let mut scratch = [0u8; 8];
    write_elem(from, &mut scratch, 0, v)?;
    read_elem(to, &scratch, 0)
}

fn alu(op: Alu, args: &[f64]) -> f64 {
    match op {
        Alu::Neg => -args[0],
        Alu::Exp2 => args[0].exp2(),
        Alu::Log2 => args[0].log2(),
        Alu::Sqrt => args[0].sqrt(),
        Alu::Recip => 1.0 / args[0],
        Alu::Add => args[0] + args[1],
        Alu::Mul => args[0] * args[1],
        Alu::Max => args[0].max(args[1]),
        Alu::CmpLt => (args[0] < args[1]) as i64 as f64,
        Alu::Where => {
            if args[0] != 0.0 {
                args[1]
            } else {
                args[2]
            }
        }
    }
}

// ─── Evaluation ────────────────────────────────────────────────────

/// A view with its symbolic parts evaluated.
struct Strided {
    shape: Vec<i64>,
    strides: Vec<i64>,
    offset: i64,
    mask: Option<Vec<(i64, i64)>>,
}

impl Strided {
    fn index(&self, idx: &[i64]) -> Option<i64> {
        if let Some(mask) = &self.mask {
            if idx.iter().zip(mask).any(|(&i, &(b, e))| i < b || i >= e) {
                return None;
            }
        }
        Some(self.offset + idx.iter().zip(&self.strides).map(|(i, s)| i * s).sum::<i64>())
    }
}

fn eval_all(syms: &[Sym], vals: &[i64]) -> Result<Vec<i64>, ExecError> {
    syms.iter().map(|s| s.eval(vals).map_err(device_err)).collect()
}

fn strided(views: &[HostView], vals: &[i64]) -> Result<Vec<Strided>, ExecError> {
    views
        .iter()
        .map(|v| {
            let mask = match &v.mask {
                Some(m) => Some(
                    m.iter()
                        .map(|r| {
                            Ok((
                                r.begin.eval(vals).map_err(device_err)?,
                                r.end.eval(vals).map_err(device_err)?,
                            ))
                        })
                        .collect::<Result<Vec<_>, ExecError>>()?,
                ),
                None => None,
            };
            Ok(Strided {
                shape: eval_all(&v.shape, vals)?,
                strides: eval_all(&v.strides, vals)?,
                offset: v.offset.eval(vals).map_err(device_err)?,
                mask,
            })
        })
        .collect()
}

/// Flat offset of `idx` through a view stack, innermost view first.
fn index(views: &[Strided], idx: &[i64]) -> Option<i64> {
    let mut idx = idx.to_vec();
    for i in (0..views.len()).rev() {
        let flat = views[i].index(&idx)?;
        if i == 0 {
            return Some(flat);
        }
        idx = unravel(&views[i - 1].shape, flat);
    }
    None
}

/// Per-instruction evaluated state.
enum Step {
    Load(u32, Vec<Strided>),
    Const(f64, Vec<Strided>),
    View(Vec<Strided>),
    Other,
}

/// A program bound to concrete variable values and input bytes.
pub struct Machine<'a> {
    prog: &'a HostProgram,
    inputs: &'a [Vec<u8>],
    shapes: Vec<Vec<i64>>,
    steps: Vec<Step>,
    store: Option<Vec<Strided>>,
}

impl<'a> Machine<'a> {
    pub fn new(prog: &'a HostProgram, vals: &[i64], inputs: &'a [Vec<u8>]) -> Result<Self, ExecError> {
        if vals.len() != prog.nvars as usize {
            return Err(device_err(format!(
                "{} expects {} variables, got {}",
                prog.name,
                prog.nvars,
                vals.len()
            )));
        }
        let mut shapes = Vec::with_capacity(prog.instrs.len());
        let mut steps = Vec::with_capacity(prog.instrs.len());
        for instr in &prog.instrs {
            shapes.push(eval_all(&instr.shape, vals)?);
            steps.push(match &instr.op {
                HostOp::Load { global, views } => Step::Load(*global, strided(views, vals)?),
                HostOp::Const { value, views } => Step::Const(*value, strided(views, vals)?),
                HostOp::View { views } => Step::View(strided(views, vals)?),
                _ => Step::Other,
            });
        }
        let store = match &prog.store {
            Some(st) => Some(strided(&st.views, vals)?),
            None => None,
        };
        Ok(Self {
            prog,
            inputs,
            shapes,
            steps,
            store,
        })
    }

    fn read(&self, global: u32, flat: i64) -> Result<f64, ExecError> {
        let dtype = self.prog.globals[global as usize];
        let bytes = self
            .inputs
            .get(global as usize)
            .ok_or_else(|| device_err(format!("no buffer bound to global {}", global)))?;
        if flat < 0 {
            return Err(device_err(format!("negative offset {}", flat)));
        }
        read_elem(dtype, bytes, flat as usize)
    }

    /// Value of instruction `at` at multi-index `idx`.
    pub fn eval(&self, at: u32, idx: &[i64]) -> Result<f64, ExecError> {
        let instr = &self.prog.instrs[at as usize];
        let v = match (&instr.op, &self.steps[at as usize]) {
            (_, Step::Load(global, views)) => match index(views, idx) {
                Some(flat) => self.read(*global, flat)?,
                None => 0.0,
            },
            (_, Step::Const(value, views)) => match index(views, idx) {
                Some(_) => *value,
                None => 0.0,
            },
            (_, Step::View(views)) => match index(views, idx) {
                Some(flat) => {
                    let src = instr.src[0];
                    let inner = unravel(&self.shapes[src as usize], flat);
                    self.eval(src, &inner)?
                }
                None => 0.0,
            },
            (HostOp::Alu(op), _) => {
                let args = instr
                    .src
                    .iter()
                    .map(|&s| self.eval(s, idx))
                    .collect::<Result<Vec<_>, _>>()?;
                alu(*op, &args)
            }
            (HostOp::Cast, _) => self.eval(instr.src[0], idx)?,
            (HostOp::Bitcast, _) => {
                let src = instr.src[0];
                let from = self.prog.instrs[src as usize].dtype;
                bitcast(from, instr.dtype, self.eval(src, idx)?)?
            }
            (HostOp::Reduce { op, axes }, _) => self.reduce(instr.src[0], *op, axes, idx)?,
            _ => return Err(device_err("malformed instruction")),
        };
        Ok(normalize(instr.dtype, v))
    }

    fn reduce(&self, src: u32, op: HostReduce, axes: &[u32], idx: &[i64]) -> Result<f64, ExecError> {
        let shape = &self.shapes[src as usize];
        let extents: Vec<i64> = axes.iter().map(|&a| shape[a as usize]).collect();
        let count: i64 = extents.iter().product();
        let mut acc = match op {
            HostReduce::Add => 0.0,
            HostReduce::Max => f64::NEG_INFINITY,
        };
        let mut inner = idx.to_vec();
        for flat in 0..count {
            for (&a, i) in axes.iter().zip(unravel(&extents, flat)) {
                inner[a as usize] = i;
            }
            let v = self.eval(src, &inner)?;
            acc = match op {
                HostReduce::Add => acc + v,
                HostReduce::Max => acc.max(v),
            };
        }
        Ok(acc)
    }

    /// Every element of the program's value, row-major.
    pub fn values(&self) -> Result<Vec<f64>, ExecError> {
        let shape = &self.shapes[self.prog.root as usize];
        let count: i64 = shape.iter().product();
        (0..count)
            .map(|flat| self.eval(self.prog.root, &unravel(shape, flat)))
            .collect()
    }

    /// Evaluate the value and write it through the store's view into `out`.
    pub fn store_into(&self, out: &mut [u8]) -> Result<(), ExecError> {
        let (Some(store), Some(views)) = (&self.prog.store, &self.store) else {
            return Err(device_err(format!("{} has no store", self.prog.name)));
        };
        let dtype = self.prog.globals[store.global as usize];
        let shape = &self.shapes[store.value as usize];
        let count: i64 = shape.iter().product();
        for flat in 0..count {
            let idx = unravel(shape, flat);
            if let Some(dest) = index(views, &idx) {
                let v = self.eval(store.value, &idx)?;
                write_elem(dtype, out, dest as usize, v)?;
            }
        }
        Ok(())
    }
}
