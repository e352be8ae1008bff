use super::*;
use crate::device::{DeviceRegistry, RenderContext};
use crate::ir::{DType, Op, ReduceOp};
use crate::kernelize::{kernelize, KernelizeOptions};
use crate::schedule::{create_schedule, ScheduleItem};
use crate::shape::{shape_of, SInt, Variable};

fn f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn single_item(g: &mut Graph, out: NodeId) -> ScheduleItem {
    let sink = g.sink(vec![out]);
    let k = kernelize(g, sink, &KernelizeOptions::default()).unwrap();
    let mut s = create_schedule(g, k).unwrap();
    assert_eq!(s.len(), 1);
    s.items.pop_front().unwrap()
}

fn compile(g: &Graph, item: &ScheduleItem, globals: &[usize], vars: &[Variable]) -> Vec<u8> {
    let name = item.name(g);
    let src = HostRenderer
        .render(&KernelSource {
            name: &name,
            graph: g,
            ast: item.ast,
            globals,
            vars,
            context: RenderContext::default(),
        })
        .unwrap();
    HostCompiler.compile(&src).unwrap()
}

#[test]
fn test_sym_eval() {
    // (v0 + 2) * 3
    let s = Sym(vec![
        SymTerm::Var(0),
        SymTerm::Const(2),
        SymTerm::Add(2),
        SymTerm::Const(3),
        SymTerm::Mul(2),
    ]);
    assert_eq!(s.eval(&[4]), Ok(18));
    assert!(s.eval(&[]).is_err());
    assert!(Sym(vec![SymTerm::Add(2)]).eval(&[]).is_err());
}

#[test]
fn test_normalize_narrows() {
    assert_eq!(normalize(DType::I32, 2147483648.0), -2147483648.0);
    assert_eq!(normalize(DType::Bool, 0.5), 1.0);
    assert_eq!(normalize(DType::I64, -2.7), -2.0);
    assert_eq!(normalize(DType::F32, 0.1), 0.1f32 as f64);
}

#[test]
fn test_codec() {
    let bytes = encode(DType::I32, &[1.0, -2.0, 3.0]).unwrap();
    assert_eq!(bytes.len(), 12);
    assert_eq!(decode(DType::I32, &bytes).unwrap(), vec![1.0, -2.0, 3.0]);
    assert!(read_elem(DType::F64, &bytes, 2).is_err());
}

#[test]
fn test_reduce_kernel_runs() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 16);
    let b = g.buffer("HOST", DType::F32, 16);
    let c = g.binary(Op::Add, a, b).unwrap();
    let d = g.binary(Op::Mul, c, b).unwrap();
    let r = g.reshape(d, &shape_of(&[4, 4])).unwrap();
    let sum = g.reduce(r, ReduceOp::Add, &[1]).unwrap();
    let item = single_item(&mut g, sum);
    let lib = compile(&g, &item, &[0, 1, 2], &[]);

    let reg = DeviceRegistry::with_host();
    let dev = reg.get("HOST").unwrap();
    let prog = dev.runtime.load(&item.name(&g), &lib).unwrap();
    let out = dev.allocator.alloc(16).unwrap();
    let ab = dev.allocator.alloc(64).unwrap();
    let bb = dev.allocator.alloc(64).unwrap();
    let arange: Vec<f32> = (0..16).map(|i| i as f32).collect();
    dev.allocator.copyin(&ab, &f32s(&arange)).unwrap();
    dev.allocator.copyin(&bb, &f32s(&[2.0; 16])).unwrap();

    let args = LaunchArgs {
        global_size: [4, 1, 1],
        vals: vec![],
    };
    assert!(prog.launch(&[out, ab, bb], &args, true).unwrap().is_some());
    let mut bytes = vec![0u8; 16];
    dev.allocator.copyout(&mut bytes, &out).unwrap();
    assert_eq!(decode(DType::F32, &bytes).unwrap(), vec![28.0, 60.0, 92.0, 124.0]);
}

#[test]
fn test_padded_loads_read_zero() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::I32, 4);
    let p = g.pad(a, &[(SInt::Const(1), SInt::Const(2))]).unwrap();
    let one = g.const_like(p, 1.0);
    let out = g.binary(Op::Add, p, one).unwrap();
    let item = single_item(&mut g, out);
    let lib = compile(&g, &item, &[0, 1], &[]);

    let reg = DeviceRegistry::with_host();
    let dev = reg.get("HOST").unwrap();
    let prog = dev.runtime.load(&item.name(&g), &lib).unwrap();
    let ob = dev.allocator.alloc(28).unwrap();
    let ab = dev.allocator.alloc(16).unwrap();
    dev.allocator
        .copyin(&ab, &encode(DType::I32, &[5.0, 6.0, 7.0, 8.0]).unwrap())
        .unwrap();
    let args = LaunchArgs {
        global_size: [7, 1, 1],
        vals: vec![],
    };
    assert_eq!(prog.launch(&[ob, ab], &args, false).unwrap(), None);
    let mut bytes = vec![0u8; 28];
    dev.allocator.copyout(&mut bytes, &ob).unwrap();
    assert_eq!(
        decode(DType::I32, &bytes).unwrap(),
        vec![1.0, 6.0, 7.0, 8.0, 9.0, 1.0, 1.0]
    );
}

#[test]
fn test_symbolic_kernel_takes_variables() {
    let mut g = Graph::new();
    let n = Variable::new("n", 1, 8);
    let a = g.buffer("HOST", DType::F32, 8);
    let w = g.shrink(a, &[(SInt::Const(0), n.bind(3))]).unwrap();
    let out = g.unary(Op::Neg, w).unwrap();
    let item = single_item(&mut g, out);
    let lib = compile(&g, &item, &[0, 1], &[n.clone()]);
    let prog = unarchive(&lib).unwrap();
    assert_eq!(prog.nvars, 1);

    let reg = DeviceRegistry::with_host();
    let dev = reg.get("HOST").unwrap();
    let kernel = dev.runtime.load(&prog.name, &lib).unwrap();
    let ob = dev.allocator.alloc(32).unwrap();
    let ab = dev.allocator.alloc(32).unwrap();
    let input: Vec<f32> = (1..=8).map(|i| i as f32).collect();
    dev.allocator.copyin(&ab, &f32s(&input)).unwrap();
    let args = LaunchArgs {
        global_size: [3, 1, 1],
        vals: vec![3],
    };
    kernel.launch(&[ob, ab], &args, false).unwrap();
    let mut bytes = vec![0u8; 32];
    dev.allocator.copyout(&mut bytes, &ob).unwrap();
    assert_eq!(
        decode(DType::F32, &bytes).unwrap()[..4],
        [-1.0, -2.0, -3.0, 0.0]
    );
}

#[test]
fn test_missing_variable_is_an_error() {
    let mut g = Graph::new();
    let n = Variable::new("n", 1, 8);
    let a = g.buffer("HOST", DType::F32, 8);
    let w = g.shrink(a, &[(SInt::Const(0), n.bind(3))]).unwrap();
    let out = g.unary(Op::Neg, w).unwrap();
    let item = single_item(&mut g, out);
    let name = item.name(&g);
    let err = HostRenderer
        .render(&KernelSource {
            name: &name,
            graph: &g,
            ast: item.ast,
            globals: &[0, 1],
            vars: &[],
            context: RenderContext::default(),
        })
        .unwrap_err();
    assert!(matches!(err, LowerError::UnsupportedAst(_)));
}

#[test]
fn test_compiler_rejects_garbage() {
    assert!(matches!(
        HostCompiler.compile("zz"),
        Err(LowerError::Compile(_))
    ));
    assert!(matches!(
        HostCompiler.compile("00ff00"),
        Err(LowerError::Compile(_))
    ));
}

#[test]
fn test_load_checks_the_name() {
    let mut g = Graph::new();
    let a = g.buffer("HOST", DType::F32, 4);
    let out = g.unary(Op::Exp2, a).unwrap();
    let item = single_item(&mut g, out);
    let lib = compile(&g, &item, &[0, 1], &[]);
    let reg = DeviceRegistry::with_host();
    let dev = reg.get("HOST").unwrap();
    assert!(matches!(
        dev.runtime.load("other", &lib),
        Err(LowerError::Load(_))
    ));
}

#[test]
fn test_evaluate_constant_expression() {
    let mut g = Graph::new();
    let two = g.constant("HOST", DType::F32, 2.0, &shape_of(&[2, 3]));
    let three = g.const_like(two, 3.0);
    let m = g.binary(Op::Mul, two, three).unwrap();
    let s = g.reduce(m, ReduceOp::Add, &[1]).unwrap();
    assert_eq!(evaluate(&mut g, s).unwrap(), vec![18.0, 18.0]);
}

#[test]
fn test_bitcast_reinterprets_bytes() {
    let mut g = Graph::new();
    let one = g.constant("HOST", DType::F32, 1.0, &shape_of(&[1]));
    let bits = g.bitcast(one, DType::I32).unwrap();
    assert_eq!(evaluate(&mut g, bits).unwrap(), vec![1065353216.0]);
}
