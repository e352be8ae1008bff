//! The host device's program format.
//!
//! A `HostProgram` is the kernel AST flattened into instructions in
//! topological order. Symbolic integers become postfix term lists over the
//! program's variables, so the program can be archived with rkyv and
//! evaluated without the graph it came from.

use std::collections::HashMap;

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::LowerError;
use crate::ir::{Arg, DType, Graph, NodeId, Op, ReduceOp};
use crate::shape::{SInt, ShapeTracker, Variable};

/// One term of a postfix symbolic expression.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum SymTerm {
    Const(i64),
    /// Index into the program's variables.
    Var(u32),
    /// Sum of the top `n` values.
    Add(u32),
    /// Product of the top `n` values.
    Mul(u32),
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct Sym(pub Vec<SymTerm>);

impl Sym {
    pub fn eval(&self, vals: &[i64]) -> Result<i64, String> {
        let mut stack: Vec<i64> = Vec::with_capacity(self.0.len());
        for term in &self.0 {
            match term {
                SymTerm::Const(c) => stack.push(*c),
                SymTerm::Var(i) => stack.push(
                    *vals
                        .get(*i as usize)
                        .ok_or_else(|| format!("variable {} has no value", i))?,
                ),
                SymTerm::Add(n) | SymTerm::Mul(n) => {
                    let n = *n as usize;
                    if n > stack.len() {
                        return Err("malformed symbolic expression".to_string());
                    }
                    let args = stack.split_off(stack.len() - n);
                    stack.push(match term {
                        SymTerm::Add(_) => args.iter().sum(),
                        _ => args.iter().product(),
                    });
                }
            }
        }
        match stack.as_slice() {
            [v] => Ok(*v),
            _ => Err("malformed symbolic expression".to_string()),
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct HostRange {
    pub begin: Sym,
    pub end: Sym,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct HostView {
    pub shape: Vec<Sym>,
    pub strides: Vec<Sym>,
    pub offset: Sym,
    pub mask: Option<Vec<HostRange>>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum Alu {
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
}

impl Alu {
    pub fn from_op(op: Op) -> Option<Alu> {
        Some(match op {
            Op::Neg => Alu::Neg,
            Op::Exp2 => Alu::Exp2,
            Op::Log2 => Alu::Log2,
            Op::Sqrt => Alu::Sqrt,
            Op::Recip => Alu::Recip,
            Op::Add => Alu::Add,
            Op::Mul => Alu::Mul,
            Op::Max => Alu::Max,
            Op::CmpLt => Alu::CmpLt,
            Op::Where => Alu::Where,
            _ => return None,
        })
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum HostReduce {
    Add,
    Max,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[rkyv(derive(Debug))]
pub enum HostOp {
    /// Read a global through a view stack.
    Load { global: u32, views: Vec<HostView> },
    /// A scalar broadcast through a view stack.
    Const { value: f64, views: Vec<HostView> },
    /// Re-index the source.
    View { views: Vec<HostView> },
    Alu(Alu),
    Cast,
    Bitcast,
    Reduce { op: HostReduce, axes: Vec<u32> },
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Instr {
    pub op: HostOp,
    pub dtype: DType,
    pub src: Vec<u32>,
    pub shape: Vec<Sym>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[rkyv(derive(Debug))]
pub struct HostStore {
    pub global: u32,
    pub views: Vec<HostView>,
    pub value: u32,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[rkyv(derive(Debug))]
pub struct HostProgram {
    pub name: String,
    pub nvars: u32,
    /// Element type of each launch buffer.
    pub globals: Vec<DType>,
    pub instrs: Vec<Instr>,
    /// The value computed by the program.
    pub root: u32,
    pub store: Option<HostStore>,
}

// ─── Lowering ──────────────────────────────────────────────────────

struct Lowering<'a> {
    g: &'a Graph,
    globals: &'a [usize],
    vars: &'a [Variable],
    instrs: Vec<Instr>,
    slots: HashMap<NodeId, u32>,
    global_dtypes: Vec<DType>,
}

fn unsupported(what: impl Into<String>) -> LowerError {
    LowerError::UnsupportedAst(what.into())
}

impl<'a> Lowering<'a> {
    fn sym(&self, v: &SInt) -> Result<Sym, LowerError> {
        let mut out = Vec::new();
        self.sym_into(v, &mut out)?;
        Ok(Sym(out))
    }

    fn sym_into(&self, v: &SInt, out: &mut Vec<SymTerm>) -> Result<(), LowerError> {
        match v {
            SInt::Const(c) => out.push(SymTerm::Const(*c)),
            // bound variables only reach here outside kernels
            SInt::Bound(_, value) => out.push(SymTerm::Const(*value)),
            SInt::Var(var) => {
                let i = self
                    .vars
                    .iter()
                    .position(|x| x == var)
                    .ok_or_else(|| unsupported(format!("free variable '{}'", var.name)))?;
                out.push(SymTerm::Var(i as u32));
            }
            SInt::Sum(terms) | SInt::Prod(terms) => {
                for t in terms {
                    self.sym_into(t, out)?;
                }
                let n = terms.len() as u32;
                out.push(match v {
                    SInt::Sum(_) => SymTerm::Add(n),
                    _ => SymTerm::Mul(n),
                });
            }
        }
        Ok(())
    }

    fn syms(&self, values: &[SInt]) -> Result<Vec<Sym>, LowerError> {
        values.iter().map(|v| self.sym(v)).collect()
    }

    fn views(&self, st: &ShapeTracker) -> Result<Vec<HostView>, LowerError> {
        st.views
            .iter()
            .map(|v| {
                let mask = match &v.mask {
                    Some(m) => Some(
                        m.iter()
                            .map(|(b, e)| {
                                Ok(HostRange {
                                    begin: self.sym(b)?,
                                    end: self.sym(e)?,
                                })
                            })
                            .collect::<Result<Vec<_>, LowerError>>()?,
                    ),
                    None => None,
                };
                Ok(HostView {
                    shape: self.syms(&v.shape)?,
                    strides: self.syms(&v.strides)?,
                    offset: self.sym(&v.offset)?,
                    mask,
                })
            })
            .collect()
    }

    fn global(&mut self, dg: NodeId) -> Result<u32, LowerError> {
        let Arg::Global(i) = self.g.arg(dg) else {
            return Err(unsupported("placeholder without an index"));
        };
        let pos = self
            .globals
            .iter()
            .position(|g| g == i)
            .ok_or_else(|| unsupported(format!("placeholder {} is not a launch buffer", i)))?;
        self.global_dtypes[pos] = self.g.dtype(dg);
        Ok(pos as u32)
    }

    /// `View(DefineGlobal)` → `(global, views)`.
    fn placeholder_view(&mut self, view: NodeId) -> Result<(u32, Vec<HostView>), LowerError> {
        let g = self.g;
        let (Op::View, Some(st)) = (g.op(view), g.node(view).st()) else {
            return Err(unsupported(format!("{} as a placeholder view", g.op(view))));
        };
        let dg = g.src(view)[0];
        if g.op(dg) != Op::DefineGlobal {
            return Err(unsupported(format!("view of {} as a placeholder", g.op(dg))));
        }
        let views = self.views(st)?;
        Ok((self.global(dg)?, views))
    }

    fn slot(&self, id: NodeId) -> Result<u32, LowerError> {
        self.slots
            .get(&id)
            .copied()
            .ok_or_else(|| unsupported(format!("{} as an operand", self.g.op(id))))
    }

    fn emit(&mut self, id: NodeId) -> Result<(), LowerError> {
        let g = self.g;
        let node = g.node(id);
        let op = match node.op {
            Op::Device | Op::DefineGlobal | Op::Const => return Ok(()),
            // consumed by its load or store
            Op::View if g.op(node.src[0]) == Op::DefineGlobal => return Ok(()),
            Op::View => {
                let st = node.st().ok_or_else(|| unsupported("view without a tracker"))?;
                let views = self.views(st)?;
                let inner = node.src[0];
                if let Some(c) = g.node(inner).const_value() {
                    self.push(id, HostOp::Const { value: c.as_f64(), views }, vec![])?;
                    return Ok(());
                }
                HostOp::View { views }
            }
            Op::Load => {
                let (global, views) = self.placeholder_view(node.src[0])?;
                self.push(id, HostOp::Load { global, views }, vec![])?;
                return Ok(());
            }
            Op::Cast => HostOp::Cast,
            Op::Bitcast => HostOp::Bitcast,
            Op::ReduceAxis => {
                let (op, axes) = node
                    .reduce_arg()
                    .ok_or_else(|| unsupported("reduction without axes"))?;
                HostOp::Reduce {
                    op: match op {
                        ReduceOp::Add => HostReduce::Add,
                        ReduceOp::Max => HostReduce::Max,
                    },
                    axes: axes.iter().map(|&a| a as u32).collect(),
                }
            }
            op => match Alu::from_op(op) {
                Some(alu) => HostOp::Alu(alu),
                None => return Err(unsupported(op.name())),
            },
        };
        let src = node
            .src
            .iter()
            .map(|&s| self.slot(s))
            .collect::<Result<Vec<_>, _>>()?;
        self.push(id, op, src)
    }

    fn push(&mut self, id: NodeId, op: HostOp, src: Vec<u32>) -> Result<(), LowerError> {
        let g = self.g;
        let shape = g
            .shape(id)
            .ok_or_else(|| unsupported(format!("unshaped {}", g.op(id))))?;
        let shape = self.syms(shape)?;
        self.slots.insert(id, self.instrs.len() as u32);
        self.instrs.push(Instr {
            op,
            dtype: g.dtype(id),
            src,
            shape,
        });
        Ok(())
    }

    fn value(&mut self, root: NodeId) -> Result<u32, LowerError> {
        for id in self.g.toposort(root) {
            self.emit(id)?;
        }
        self.slot(root)
    }
}

/// Flatten a kernel AST (`Sink(Store(View(DefineGlobal), value))`) or a
/// bare value expression into a `HostProgram`.
pub fn lower(
    g: &Graph,
    name: &str,
    root: NodeId,
    globals: &[usize],
    vars: &[Variable],
) -> Result<HostProgram, LowerError> {
    let mut lw = Lowering {
        g,
        globals,
        vars,
        instrs: Vec::new(),
        slots: HashMap::new(),
        global_dtypes: vec![DType::Void; globals.len()],
    };

    let (root, store) = match g.op(root) {
        Op::Sink => {
            let [store] = g.src(root) else {
                return Err(unsupported("kernel with more than one store"));
            };
            if g.op(*store) != Op::Store {
                return Err(unsupported(format!("{} under a kernel sink", g.op(*store))));
            }
            let (target, value) = (g.src(*store)[0], g.src(*store)[1]);
            let (global, views) = lw.placeholder_view(target)?;
            let value = lw.value(value)?;
            (value, Some(HostStore { global, views, value }))
        }
        _ => (lw.value(root)?, None),
    };

    Ok(HostProgram {
        name: name.to_string(),
        nvars: vars.len() as u32,
        globals: lw.global_dtypes,
        instrs: lw.instrs,
        root,
        store,
    })
}
