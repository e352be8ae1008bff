//! Static facts about a kernel AST: what it reads and writes, which
//! variables it takes, how big a launch is and what it costs.

use crate::error::{ExecError, LowerError};
use crate::ir::{Arg, Graph, NodeId, Op};
use crate::shape::{SInt, VarVals, Variable};

/// Symbolic cost of one launch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Estimates {
    /// Arithmetic operations.
    pub ops: SInt,
    /// Bytes loaded, counting every broadcast read.
    pub lds: SInt,
    /// Bytes of global memory touched.
    pub mem: SInt,
}

impl Estimates {
    /// `(ops, lds, mem)` under `vals`.
    pub fn eval(&self, vals: &VarVals) -> Result<(u64, u64, u64), ExecError> {
        let ev = |s: &SInt| {
            s.eval(vals)
                .map(|v| v.max(0) as u64)
                .map_err(|e| ExecError::UnboundVariable(e.0.name))
        };
        Ok((ev(&self.ops)?, ev(&self.lds)?, ev(&self.mem)?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramSpec {
    pub name: String,
    /// Placeholder indices the program reads or writes, ascending.
    pub globals: Vec<usize>,
    pub outs: Vec<usize>,
    pub ins: Vec<usize>,
    /// Free variables, sorted.
    pub vars: Vec<Variable>,
    pub global_size: [SInt; 3],
    pub estimates: Estimates,
}

/// `shape` folded into three launch dimensions: leading axes multiply into
/// the first, missing ones are 1.
pub fn fold_dims(shape: &[SInt]) -> [SInt; 3] {
    let mut dims: Vec<SInt> = shape.to_vec();
    while dims.len() > 3 {
        let first = dims.remove(0);
        dims[0] = first * dims[0].clone();
    }
    dims.resize(3, SInt::Const(1));
    [dims[0].clone(), dims[1].clone(), dims[2].clone()]
}

fn placeholder(g: &Graph, view: NodeId) -> Option<usize> {
    let dg = *g.src(view).first()?;
    match (g.op(view), g.op(dg), g.arg(dg)) {
        (Op::View, Op::DefineGlobal, Arg::Global(i)) => Some(*i),
        _ => None,
    }
}

/// Bytes a placeholder view touches.
fn touched(g: &Graph, view: NodeId) -> SInt {
    let itemsize = SInt::from(g.dtype(view).itemsize());
    let elems = match g.node(view).st() {
        Some(st) => st
            .real_size()
            .map(SInt::Const)
            .unwrap_or_else(|| st.size()),
        None => SInt::Const(0),
    };
    elems * itemsize
}

impl ProgramSpec {
    /// Analyze a kernel `Sink`.
    pub fn from_ast(g: &Graph, ast: NodeId) -> Result<ProgramSpec, LowerError> {
        let name = match g.arg(ast) {
            Arg::Info(info) => info.name.clone(),
            _ => return Err(LowerError::UnsupportedAst(format!("{} as a kernel root", g.op(ast)))),
        };
        let mut globals = Vec::new();
        let mut outs = Vec::new();
        let mut vars = Vec::new();
        let mut global_size = fold_dims(&[]);
        let (mut ops, mut lds, mut mem) = (Vec::new(), Vec::new(), Vec::new());

        for id in g.toposort(ast) {
            let node = g.node(id);
            match node.op {
                Op::DefineGlobal => {
                    if let Arg::Global(i) = node.arg {
                        globals.push(i);
                    }
                }
                Op::View => {
                    if let Some(st) = node.st() {
                        for v in st.vars() {
                            if !vars.contains(&v) {
                                vars.push(v);
                            }
                        }
                    }
                }
                Op::Load => {
                    let view = node.src[0];
                    let itemsize = SInt::from(node.dtype.itemsize());
                    lds.push(g.size(id).unwrap_or(SInt::Const(0)) * itemsize);
                    mem.push(touched(g, view));
                }
                Op::Store => {
                    let (target, value) = (node.src[0], node.src[1]);
                    if let Some(i) = placeholder(g, target) {
                        outs.push(i);
                    }
                    mem.push(touched(g, target));
                    if let Some(shape) = g.shape(value) {
                        global_size = fold_dims(shape);
                    }
                }
                Op::ReduceAxis => ops.push(g.size(node.src[0]).unwrap_or(SInt::Const(0))),
                op if op.is_alu() => ops.push(g.size(id).unwrap_or(SInt::Const(0))),
                _ => {}
            }
        }
        globals.sort_unstable();
        globals.dedup();
        vars.sort();
        let ins = globals.iter().copied().filter(|i| !outs.contains(i)).collect();

        Ok(ProgramSpec {
            name,
            globals,
            outs,
            ins,
            vars,
            global_size,
            estimates: Estimates {
                ops: SInt::sum(ops),
                lds: SInt::sum(lds),
                mem: SInt::sum(mem),
            },
        })
    }

    /// Concrete launch dimensions under `vals`.
    pub fn launch_dims(&self, vals: &VarVals) -> Result<[usize; 3], ExecError> {
        let mut out = [1usize; 3];
        for (slot, dim) in out.iter_mut().zip(&self.global_size) {
            *slot = dim
                .eval(vals)
                .map_err(|e| ExecError::UnboundVariable(e.0.name))?
                .max(0) as usize;
        }
        Ok(out)
    }
}
